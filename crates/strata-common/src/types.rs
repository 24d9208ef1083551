//! Column types and typed column values.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// Declared type of a column.
///
/// Every type has a fixed serialized width; strings carry their capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int,
    Float,
    /// Fixed-capacity string of `n` bytes.
    String(usize),
}

impl DataType {
    /// Ordinal written to table and index header pages.
    pub fn ordinal(&self) -> i32 {
        match self {
            DataType::Bool => 0,
            DataType::Int => 1,
            DataType::Float => 2,
            DataType::String(_) => 3,
        }
    }

    /// Rebuilds a type from its header ordinal. `len` is only read for strings.
    pub fn from_ordinal(ordinal: i32, len: usize) -> Option<Self> {
        match ordinal {
            0 => Some(DataType::Bool),
            1 => Some(DataType::Int),
            2 => Some(DataType::Float),
            3 => Some(DataType::String(len)),
            _ => None,
        }
    }

    /// Returns the serialized byte width of a value of this type.
    pub fn size(&self) -> usize {
        match self {
            DataType::Bool => 1,
            DataType::Int | DataType::Float => 4,
            DataType::String(len) => *len,
        }
    }

    /// Returns true if values of `self` and `other` can be compared for equality.
    ///
    /// Strings of different capacity are comparable by content.
    pub fn is_comparable_with(&self, other: &DataType) -> bool {
        self.ordinal() == other.ordinal()
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::Bool => write!(f, "BOOL"),
            DataType::Int => write!(f, "INT"),
            DataType::Float => write!(f, "FLOAT"),
            DataType::String(len) => write!(f, "STRING({})", len),
        }
    }
}

/// A typed, fixed-width column value.
///
/// Values are totally ordered: first by type, then by value. Floats use IEEE
/// total ordering so that equality and hashing agree. Strings compare by
/// content only; their capacity matters for schema checks, not comparisons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DataBox {
    Bool(bool),
    Int(i32),
    Float(f32),
    String { value: String, len: usize },
}

impl DataBox {
    /// Creates a string value with capacity `len`.
    ///
    /// Anything from the first NUL on is dropped, since NUL pads stored
    /// strings. Values still longer than `len` bytes are truncated at the
    /// nearest char boundary.
    pub fn string(value: impl Into<String>, len: usize) -> Self {
        let mut value = value.into();
        if let Some(nul) = value.find('\0') {
            value.truncate(nul);
        }
        if value.len() > len {
            let mut cut = len;
            while !value.is_char_boundary(cut) {
                cut -= 1;
            }
            value.truncate(cut);
        }
        DataBox::String { value, len }
    }

    /// Returns the declared type of this value.
    pub fn data_type(&self) -> DataType {
        match self {
            DataBox::Bool(_) => DataType::Bool,
            DataBox::Int(_) => DataType::Int,
            DataBox::Float(_) => DataType::Float,
            DataBox::String { len, .. } => DataType::String(*len),
        }
    }

    /// Whether the value survives a round trip through its declared width.
    ///
    /// Always true for values built with [`DataBox::string`]. A string built
    /// directly may be longer than `len` or contain NUL.
    pub fn is_storable(&self) -> bool {
        match self {
            DataBox::String { value, len } => value.len() <= *len && !value.contains('\0'),
            _ => true,
        }
    }

    /// Returns the serialized byte width of this value.
    pub fn size(&self) -> usize {
        self.data_type().size()
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DataBox::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            DataBox::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            DataBox::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataBox::String { value, .. } => Some(value),
            _ => None,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            DataBox::Bool(_) => 0,
            DataBox::Int(_) => 1,
            DataBox::Float(_) => 2,
            DataBox::String { .. } => 3,
        }
    }
}

impl PartialEq for DataBox {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DataBox {}

impl PartialOrd for DataBox {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DataBox {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (DataBox::Bool(a), DataBox::Bool(b)) => a.cmp(b),
            (DataBox::Int(a), DataBox::Int(b)) => a.cmp(b),
            (DataBox::Float(a), DataBox::Float(b)) => a.total_cmp(b),
            (DataBox::String { value: a, .. }, DataBox::String { value: b, .. }) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl Hash for DataBox {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_rank().hash(state);
        match self {
            DataBox::Bool(v) => v.hash(state),
            DataBox::Int(v) => v.hash(state),
            DataBox::Float(v) => v.to_bits().hash(state),
            DataBox::String { value, .. } => value.hash(state),
        }
    }
}

impl std::fmt::Display for DataBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataBox::Bool(v) => write!(f, "{}", v),
            DataBox::Int(v) => write!(f, "{}", v),
            DataBox::Float(v) => write!(f, "{}", v),
            DataBox::String { value, .. } => write!(f, "{}", value),
        }
    }
}
