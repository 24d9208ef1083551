//! Data page layout with a slot bitmap and fixed-size record slots.
//!
//! Page layout:
//! ```text
//! +---------------------------+
//! | Slot bitmap               |  entries_per_page / 8 bytes, MSB first
//! +---------------------------+
//! | Slot 0   (entry_size)     |
//! | Slot 1   (entry_size)     |
//! | ...                       |
//! | Slot k-1 (entry_size)     |
//! +---------------------------+
//! | Unused tail               |
//! +---------------------------+
//! ```
//!
//! Bit `i` lives in byte `i / 8` at position `7 - i % 8`. A set bit marks a
//! live record; clearing it leaves the slot bytes in place as a tombstone.

use super::constants::BITS_PER_BYTE;
use strata_common::page::{Page, PAGE_SIZE};

/// Slot geometry shared by every data page of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLayout {
    entry_size: usize,
    entries_per_page: usize,
    bitmap_size: usize,
}

impl PageLayout {
    /// Computes the largest slot count, rounded down to a multiple of 8, for
    /// which the bitmap and the slots fit in one page.
    pub fn for_entry_size(entry_size: usize) -> Self {
        let bits = PAGE_SIZE * BITS_PER_BYTE;
        let raw = bits / (BITS_PER_BYTE * entry_size + 1);
        let entries_per_page = raw - raw % BITS_PER_BYTE;
        Self {
            entry_size,
            entries_per_page,
            bitmap_size: entries_per_page / BITS_PER_BYTE,
        }
    }

    #[inline]
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    #[inline]
    pub fn entries_per_page(&self) -> usize {
        self.entries_per_page
    }

    /// Size of the slot bitmap at the start of each data page.
    #[inline]
    pub fn bitmap_size(&self) -> usize {
        self.bitmap_size
    }

    #[inline]
    fn slot_offset(&self, slot: usize) -> usize {
        self.bitmap_size + slot * self.entry_size
    }

    /// Returns true if `slot` holds a live record.
    #[inline]
    pub fn is_live(&self, page: &Page, slot: usize) -> bool {
        let byte = page.read_u8(slot / BITS_PER_BYTE);
        byte & bit_mask(slot) != 0
    }

    /// Sets or clears the bitmap bit for `slot`.
    pub fn set_live(&self, page: &mut Page, slot: usize, live: bool) {
        let offset = slot / BITS_PER_BYTE;
        let byte = page.read_u8(offset);
        let updated = if live {
            byte | bit_mask(slot)
        } else {
            byte & !bit_mask(slot)
        };
        page.write_u8(offset, updated);
    }

    /// Returns the lowest slot whose bit is clear.
    pub fn first_free_slot(&self, page: &Page) -> Option<usize> {
        let bitmap = page.read_bytes(0, self.bitmap_size);
        bitmap
            .iter()
            .position(|b| *b != u8::MAX)
            .map(|i| i * BITS_PER_BYTE + bitmap[i].leading_ones() as usize)
    }

    /// Returns the lowest live slot at or after `from`.
    pub fn next_live_slot(&self, page: &Page, from: usize) -> Option<usize> {
        (from..self.entries_per_page).find(|slot| self.is_live(page, *slot))
    }

    /// Counts live records in the page.
    pub fn live_count(&self, page: &Page) -> usize {
        page.read_bytes(0, self.bitmap_size)
            .iter()
            .map(|b| b.count_ones() as usize)
            .sum()
    }

    /// Returns true if every slot is live.
    pub fn is_full(&self, page: &Page) -> bool {
        self.live_count(page) == self.entries_per_page
    }

    /// Returns the encoded bytes stored in `slot`.
    #[inline]
    pub fn read_slot<'a>(&self, page: &'a Page, slot: usize) -> &'a [u8] {
        page.read_bytes(self.slot_offset(slot), self.entry_size)
    }

    /// Overwrites the bytes of `slot` with an encoded record.
    #[inline]
    pub fn write_slot(&self, page: &mut Page, slot: usize, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), self.entry_size);
        page.write_bytes(self.slot_offset(slot), bytes);
    }
}

#[inline]
fn bit_mask(slot: usize) -> u8 {
    1 << (BITS_PER_BYTE - 1 - slot % BITS_PER_BYTE)
}
