//! Record representation and record identifiers.

use strata_common::DataBox;

/// Physical location of a record: data page number and slot index.
///
/// Ordering is (page, slot), which is also the order of a full-table scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId {
    /// Data page holding the record (never the header page).
    pub page_num: u32,
    /// Slot index within the page.
    pub slot: u32,
}

impl RecordId {
    /// Creates a new record ID.
    pub fn new(page_num: u32, slot: u32) -> Self {
        Self { page_num, slot }
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.page_num, self.slot)
    }
}

/// An ordered sequence of column values.
///
/// A record is only meaningful together with a schema; `Schema::verify`
/// produces records that are guaranteed to conform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Record {
    values: Vec<DataBox>,
}

impl Record {
    /// Creates a record from its values.
    pub fn new(values: Vec<DataBox>) -> Self {
        Self { values }
    }

    /// Returns the column values.
    pub fn values(&self) -> &[DataBox] {
        &self.values
    }

    /// Returns the value at column `index`.
    pub fn value(&self, index: usize) -> Option<&DataBox> {
        self.values.get(index)
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the record has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Consumes the record, returning its values.
    pub fn into_values(self) -> Vec<DataBox> {
        self.values
    }

    /// Builds the joined record: this record's values followed by `other`'s.
    pub fn concat(&self, other: &Record) -> Record {
        let mut values = Vec::with_capacity(self.values.len() + other.values.len());
        values.extend_from_slice(&self.values);
        values.extend_from_slice(&other.values);
        Record { values }
    }
}

impl From<Vec<DataBox>> for Record {
    fn from(values: Vec<DataBox>) -> Self {
        Self::new(values)
    }
}

impl std::fmt::Display for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", value)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_ordering() {
        let a = RecordId::new(1, 5);
        let b = RecordId::new(1, 6);
        let c = RecordId::new(2, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.to_string(), "(1, 5)");
    }

    #[test]
    fn test_record_accessors() {
        let record = Record::new(vec![DataBox::Int(1), DataBox::Bool(true)]);
        assert_eq!(record.len(), 2);
        assert!(!record.is_empty());
        assert_eq!(record.value(0), Some(&DataBox::Int(1)));
        assert_eq!(record.value(2), None);
        assert_eq!(record.to_string(), "(1, true)");
    }

    #[test]
    fn test_record_concat_preserves_order() {
        let left = Record::new(vec![DataBox::Int(2), DataBox::string("b", 1)]);
        let right = Record::new(vec![DataBox::Int(2), DataBox::string("x", 1)]);
        let joined = left.concat(&right);
        assert_eq!(
            joined.into_values(),
            vec![
                DataBox::Int(2),
                DataBox::string("b", 1),
                DataBox::Int(2),
                DataBox::string("x", 1),
            ]
        );
    }
}
