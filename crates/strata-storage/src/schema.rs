//! Table schemas and the fixed-width record codec.
//!
//! Record layout: each column's fixed-width encoding concatenated in schema
//! order, so every record of a table is exactly `entry_size` bytes.
//!
//! ```text
//! BOOL      1 byte (0 or 1)
//! INT       4 bytes, i32 little-endian
//! FLOAT     4 bytes, f32 little-endian
//! STRING(n) n bytes, UTF-8 zero padded
//! ```
//!
//! Header page layout (page 0 of every table):
//!
//! ```text
//! [i32 field count]
//! [i32 name length] * field count
//! [name bytes] * field count
//! [i32 type ordinal (, i32 string length if STRING)] * field count
//! ```

use crate::record::Record;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use strata_common::page::{Page, PAGE_SIZE};
use strata_common::{DataBox, DataType, Result, StrataError};

/// Ordered column names and types of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    field_names: Vec<String>,
    field_types: Vec<DataType>,
    entry_size: usize,
}

impl Schema {
    /// Creates a schema from (name, type) pairs.
    pub fn new<N: Into<String>>(fields: impl IntoIterator<Item = (N, DataType)>) -> Self {
        let (field_names, field_types): (Vec<String>, Vec<DataType>) = fields
            .into_iter()
            .map(|(name, ty)| (name.into(), ty))
            .unzip();
        let entry_size = field_types.iter().map(DataType::size).sum();
        Self {
            field_names,
            field_types,
            entry_size,
        }
    }

    pub fn field_names(&self) -> &[String] {
        &self.field_names
    }

    pub fn field_types(&self) -> &[DataType] {
        &self.field_types
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.field_types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.field_types.is_empty()
    }

    /// Returns the encoded size of one record.
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// Resolves a column name to its position.
    ///
    /// An exact match wins. Otherwise the unqualified part of `name` (after
    /// the last '.') is compared against the unqualified part of each field,
    /// so `id` finds `users.id` and `u.id` finds `id`.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        if let Some(index) = self.field_names.iter().position(|f| f == name) {
            return Some(index);
        }
        let wanted = unqualified(name);
        self.field_names
            .iter()
            .position(|f| unqualified(f) == wanted)
    }

    /// Returns a schema with every field renamed to `prefix.field`.
    pub fn qualified(&self, prefix: &str) -> Schema {
        Schema::new(
            self.field_names
                .iter()
                .zip(&self.field_types)
                .map(|(name, ty)| (format!("{}.{}", prefix, unqualified(name)), *ty)),
        )
    }

    /// Returns this schema's fields followed by `other`'s.
    pub fn concat(&self, other: &Schema) -> Schema {
        Schema::new(
            self.field_names
                .iter()
                .chain(&other.field_names)
                .cloned()
                .zip(self.field_types.iter().chain(&other.field_types).copied()),
        )
    }

    /// Checks `values` against the schema and wraps them in a record.
    ///
    /// Fails if the column count differs, any value's type or byte width
    /// differs from the declared column type, or a string does not fit its
    /// width.
    pub fn verify(&self, values: Vec<DataBox>) -> Result<Record> {
        if values.len() != self.field_types.len() {
            return Err(StrataError::SchemaMismatch(format!(
                "expected {} values, got {}",
                self.field_types.len(),
                values.len()
            )));
        }
        for (i, (value, declared)) in values.iter().zip(&self.field_types).enumerate() {
            if value.data_type() != *declared {
                return Err(StrataError::SchemaMismatch(format!(
                    "column {} ({}) expects {}, got {}",
                    i,
                    self.field_names[i],
                    declared,
                    value.data_type()
                )));
            }
            if !value.is_storable() {
                return Err(unstorable(i, &self.field_names[i], value));
            }
        }
        Ok(Record::new(values))
    }

    /// Encodes a conforming record into exactly `entry_size` bytes.
    pub fn encode(&self, record: &Record) -> Result<Bytes> {
        if record.len() != self.field_types.len() {
            return Err(StrataError::SchemaMismatch(format!(
                "cannot encode {} values with a {} column schema",
                record.len(),
                self.field_types.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(self.entry_size);
        for (value, declared) in record.values().iter().zip(&self.field_types) {
            put_value(&mut buf, value, declared)?;
        }
        Ok(buf.freeze())
    }

    /// Decodes one record from the first `entry_size` bytes of `bytes`.
    pub fn decode(&self, bytes: &[u8]) -> Result<Record> {
        if bytes.len() < self.entry_size {
            return Err(StrataError::SchemaMismatch(format!(
                "record needs {} bytes, got {}",
                self.entry_size,
                bytes.len()
            )));
        }

        let mut buf = &bytes[..self.entry_size];
        let mut values = Vec::with_capacity(self.field_types.len());
        for declared in &self.field_types {
            values.push(get_value(&mut buf, declared)?);
        }
        Ok(Record::new(values))
    }

    /// Serializes the schema into a header page.
    pub fn write_header(&self, page: &mut Page) -> Result<()> {
        let mut buf = BytesMut::new();
        buf.put_i32_le(self.field_names.len() as i32);
        for name in &self.field_names {
            buf.put_i32_le(name.len() as i32);
        }
        for name in &self.field_names {
            buf.put_slice(name.as_bytes());
        }
        for ty in &self.field_types {
            buf.put_i32_le(ty.ordinal());
            if let DataType::String(len) = ty {
                buf.put_i32_le(*len as i32);
            }
        }

        if buf.len() > PAGE_SIZE {
            return Err(StrataError::SchemaMismatch(format!(
                "schema header needs {} bytes, page holds {}",
                buf.len(),
                PAGE_SIZE
            )));
        }
        page.write_bytes(0, &buf);
        Ok(())
    }

    /// Reads a schema back from a header page.
    pub fn read_header(page: &Page) -> Result<Schema> {
        let mut buf: &[u8] = page.as_bytes();

        let field_count = read_len(&mut buf, "field count")?;
        if field_count > PAGE_SIZE / 4 {
            return Err(corrupt_header("field count exceeds page capacity"));
        }
        let mut name_lens = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            name_lens.push(read_len(&mut buf, "name length")?);
        }

        let mut names = Vec::with_capacity(field_count);
        for len in name_lens {
            if buf.remaining() < len {
                return Err(corrupt_header("field name runs past the page"));
            }
            let name = std::str::from_utf8(&buf[..len])
                .map_err(|_| corrupt_header("field name is not UTF-8"))?
                .to_string();
            buf.advance(len);
            names.push(name);
        }

        let mut types = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            if buf.remaining() < 4 {
                return Err(corrupt_header("type list runs past the page"));
            }
            let ordinal = buf.get_i32_le();
            let len = if ordinal == DataType::String(0).ordinal() {
                read_len(&mut buf, "string length")?
            } else {
                0
            };
            let ty = DataType::from_ordinal(ordinal, len)
                .ok_or_else(|| corrupt_header(&format!("unknown type ordinal {}", ordinal)))?;
            types.push(ty);
        }

        Ok(Schema::new(names.into_iter().zip(types)))
    }
}

impl std::fmt::Display for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, (name, ty)) in self.field_names.iter().zip(&self.field_types).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", name, ty)?;
        }
        write!(f, ")")
    }
}

/// Appends the fixed-width encoding of `value` as a `declared` column.
pub(crate) fn put_value(buf: &mut BytesMut, value: &DataBox, declared: &DataType) -> Result<()> {
    match (value, declared) {
        (DataBox::Bool(v), DataType::Bool) => buf.put_u8(u8::from(*v)),
        (DataBox::Int(v), DataType::Int) => buf.put_i32_le(*v),
        (DataBox::Float(v), DataType::Float) => buf.put_f32_le(*v),
        (DataBox::String { value: text, .. }, DataType::String(len)) => {
            if text.len() > *len || text.contains('\0') {
                return Err(StrataError::SchemaMismatch(format!(
                    "string {:?} does not fit {}",
                    text, declared
                )));
            }
            buf.put_slice(text.as_bytes());
            buf.put_bytes(0, len - text.len());
        }
        _ => {
            return Err(StrataError::TypeMismatch {
                expected: declared.to_string(),
                actual: value.data_type().to_string(),
            })
        }
    }
    Ok(())
}

/// Reads one `declared` value from the front of `buf`, advancing it.
///
/// The caller guarantees `buf` holds at least `declared.size()` bytes.
pub(crate) fn get_value(buf: &mut &[u8], declared: &DataType) -> Result<DataBox> {
    let value = match declared {
        DataType::Bool => DataBox::Bool(buf.get_u8() != 0),
        DataType::Int => DataBox::Int(buf.get_i32_le()),
        DataType::Float => DataBox::Float(buf.get_f32_le()),
        DataType::String(len) => {
            let raw = &buf[..*len];
            let end = raw.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
            let text = std::str::from_utf8(&raw[..end]).map_err(|e| {
                StrataError::SchemaMismatch(format!("invalid UTF-8 in string column: {}", e))
            })?;
            let value = DataBox::string(text, *len);
            buf.advance(*len);
            value
        }
    };
    Ok(value)
}

fn unstorable(index: usize, name: &str, value: &DataBox) -> StrataError {
    StrataError::SchemaMismatch(format!(
        "column {} ({}) cannot store {:?} in {} bytes",
        index,
        name,
        value.as_str().unwrap_or_default(),
        value.size()
    ))
}

fn unqualified(name: &str) -> &str {
    name.rsplit_once('.').map_or(name, |(_, column)| column)
}

fn corrupt_header(detail: &str) -> StrataError {
    StrataError::SchemaMismatch(format!("corrupt header page: {}", detail))
}

fn read_len(buf: &mut &[u8], what: &str) -> Result<usize> {
    if buf.remaining() < 4 {
        return Err(corrupt_header(&format!("{} runs past the page", what)));
    }
    let value = buf.get_i32_le();
    usize::try_from(value).map_err(|_| corrupt_header(&format!("negative {}", what)))
}
