//! Heap table layout constants.

/// Page number of the schema header page in every table file.
pub const HEADER_PAGE_NUM: u32 = 0;

/// Page number of the first data page.
pub const FIRST_DATA_PAGE: u32 = 1;

/// Bits per bitmap byte; the slot count per page is a multiple of this.
pub const BITS_PER_BYTE: usize = 8;
