//! # Tuple Serialization
//!
//! The tree stores opaque records and touches them only through the schema:
//! compute the serialized length, write into a page, read back out, and pull
//! a single field by index. Everything else about a tuple is the caller's
//! business.
//!
//! ## Record Binary Layout
//!
//! Fields are concatenated in schema order with no header:
//!
//! | Type   | Encoding                                |
//! |--------|-----------------------------------------|
//! | Int    | 4 bytes, little-endian i32              |
//! | Long   | 8 bytes, little-endian i64              |
//! | Double | 8 bytes, little-endian f64 bit pattern  |
//! | Text   | u16 length prefix + UTF-8 bytes         |
//!
//! Fixed-width fields before the key field let [`Schema::read_field`] seek
//! to a field without materializing the whole tuple; variable-width fields
//! are skipped by their length prefix.

use eyre::{bail, ensure, eyre, Result};

/// Declared type of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int,
    Long,
    Double,
    Text,
}

/// One field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Long(i64),
    Double(f64),
    Text(String),
}

impl Value {
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Int(_) => FieldType::Int,
            Value::Long(_) => FieldType::Long,
            Value::Double(_) => FieldType::Double,
            Value::Text(_) => FieldType::Text,
        }
    }
}

/// An ordered list of field values matching some [`Schema`].
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
    values: Vec<Value>,
}

impl Tuple {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn field(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn set_field(&mut self, index: usize, value: Value) -> Result<()> {
        ensure!(
            index < self.values.len(),
            "field index {} out of range (tuple has {} fields)",
            index,
            self.values.len()
        );
        self.values[index] = value;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The field layout shared by every tuple in one tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<FieldType>,
}

impl Schema {
    pub fn new(fields: Vec<FieldType>) -> Self {
        Self { fields }
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn field_type(&self, index: usize) -> Option<FieldType> {
        self.fields.get(index).copied()
    }

    pub fn compatible(&self, tuple: &Tuple) -> bool {
        tuple.len() == self.fields.len()
            && self
                .fields
                .iter()
                .zip(0..tuple.len())
                .all(|(ty, i)| tuple.field(i).map(Value::field_type) == Some(*ty))
    }

    /// Serialized byte length of `tuple` under this schema.
    pub fn length(&self, tuple: &Tuple) -> Result<usize> {
        ensure!(
            self.compatible(tuple),
            "tuple does not match schema (schema has {} fields)",
            self.fields.len()
        );
        let mut len = 0;
        for i in 0..tuple.len() {
            len += match tuple.field(i) {
                Some(Value::Int(_)) => 4,
                Some(Value::Long(_)) => 8,
                Some(Value::Double(_)) => 8,
                Some(Value::Text(s)) => 2 + s.len(),
                None => unreachable!("compatible() checked the field count"),
            };
        }
        Ok(len)
    }

    /// Writes `tuple` into the front of `buf`, returning the bytes written.
    pub fn serialize(&self, buf: &mut [u8], tuple: &Tuple) -> Result<usize> {
        let total = self.length(tuple)?;
        ensure!(
            buf.len() >= total,
            "serialize buffer too small: {} < {}",
            buf.len(),
            total
        );
        let mut off = 0;
        for i in 0..tuple.len() {
            match tuple.field(i) {
                Some(Value::Int(v)) => {
                    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
                    off += 4;
                }
                Some(Value::Long(v)) => {
                    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
                    off += 8;
                }
                Some(Value::Double(v)) => {
                    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
                    off += 8;
                }
                Some(Value::Text(s)) => {
                    ensure!(
                        s.len() <= u16::MAX as usize,
                        "text field of {} bytes exceeds the u16 length prefix",
                        s.len()
                    );
                    buf[off..off + 2].copy_from_slice(&(s.len() as u16).to_le_bytes());
                    off += 2;
                    buf[off..off + s.len()].copy_from_slice(s.as_bytes());
                    off += s.len();
                }
                None => unreachable!("compatible() checked the field count"),
            }
        }
        Ok(off)
    }

    /// Reads one tuple from the front of `buf`.
    pub fn deserialize(&self, buf: &[u8]) -> Result<Tuple> {
        let mut values = Vec::with_capacity(self.fields.len());
        let mut off = 0;
        for (i, ty) in self.fields.iter().enumerate() {
            let (value, read) = Self::read_value(*ty, &buf[off..])
                .map_err(|e| eyre!("field {}: {}", i, e))?;
            values.push(value);
            off += read;
        }
        Ok(Tuple::new(values))
    }

    /// Decodes only the field at `index` from a serialized record, skipping
    /// the fields before it.
    pub fn read_field(&self, buf: &[u8], index: usize) -> Result<Value> {
        ensure!(
            index < self.fields.len(),
            "field index {} out of range (schema has {} fields)",
            index,
            self.fields.len()
        );
        let mut off = 0;
        for (i, ty) in self.fields.iter().enumerate() {
            let rest = &buf[off..];
            if i == index {
                let (value, _) = Self::read_value(*ty, rest)?;
                return Ok(value);
            }
            off += Self::skip_len(*ty, rest)?;
        }
        unreachable!("index checked against field count")
    }

    fn read_value(ty: FieldType, buf: &[u8]) -> Result<(Value, usize)> {
        match ty {
            FieldType::Int => {
                ensure!(buf.len() >= 4, "record truncated reading Int");
                let mut b = [0u8; 4];
                b.copy_from_slice(&buf[..4]);
                Ok((Value::Int(i32::from_le_bytes(b)), 4))
            }
            FieldType::Long => {
                ensure!(buf.len() >= 8, "record truncated reading Long");
                let mut b = [0u8; 8];
                b.copy_from_slice(&buf[..8]);
                Ok((Value::Long(i64::from_le_bytes(b)), 8))
            }
            FieldType::Double => {
                ensure!(buf.len() >= 8, "record truncated reading Double");
                let mut b = [0u8; 8];
                b.copy_from_slice(&buf[..8]);
                Ok((Value::Double(f64::from_le_bytes(b)), 8))
            }
            FieldType::Text => {
                ensure!(buf.len() >= 2, "record truncated reading Text length");
                let len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
                ensure!(
                    buf.len() >= 2 + len,
                    "record truncated reading Text of {} bytes",
                    len
                );
                let s = std::str::from_utf8(&buf[2..2 + len])
                    .map_err(|e| eyre!("invalid UTF-8 in Text field: {}", e))?;
                Ok((Value::Text(s.to_owned()), 2 + len))
            }
        }
    }

    fn skip_len(ty: FieldType, buf: &[u8]) -> Result<usize> {
        match ty {
            FieldType::Int => Ok(4),
            FieldType::Long | FieldType::Double => Ok(8),
            FieldType::Text => {
                if buf.len() < 2 {
                    bail!("record truncated skipping Text length");
                }
                Ok(2 + u16::from_le_bytes([buf[0], buf[1]]) as usize)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> Schema {
        Schema::new(vec![
            FieldType::Long,
            FieldType::Text,
            FieldType::Double,
        ])
    }

    fn sample_tuple() -> Tuple {
        Tuple::new(vec![
            Value::Long(42),
            Value::Text("hello".into()),
            Value::Double(2.5),
        ])
    }

    #[test]
    fn length_counts_text_prefix() {
        let schema = sample_schema();
        assert_eq!(schema.length(&sample_tuple()).unwrap(), 8 + 2 + 5 + 8);
    }

    #[test]
    fn serialize_then_deserialize_preserves_values() {
        let schema = sample_schema();
        let tuple = sample_tuple();

        let mut buf = vec![0u8; schema.length(&tuple).unwrap()];
        let written = schema.serialize(&mut buf, &tuple).unwrap();
        assert_eq!(written, buf.len());

        let parsed = schema.deserialize(&buf).unwrap();
        assert_eq!(parsed, tuple);
    }

    #[test]
    fn read_field_skips_variable_width_prefix() {
        let schema = Schema::new(vec![FieldType::Text, FieldType::Long]);
        let tuple = Tuple::new(vec![Value::Text("prefix".into()), Value::Long(-7)]);

        let mut buf = vec![0u8; schema.length(&tuple).unwrap()];
        schema.serialize(&mut buf, &tuple).unwrap();

        assert_eq!(schema.read_field(&buf, 1).unwrap(), Value::Long(-7));
    }

    #[test]
    fn incompatible_tuple_is_rejected() {
        let schema = sample_schema();
        let wrong = Tuple::new(vec![Value::Int(1)]);

        assert!(schema.length(&wrong).is_err());
        assert!(!schema.compatible(&wrong));
    }

    #[test]
    fn deserialize_rejects_truncated_record() {
        let schema = sample_schema();
        let tuple = sample_tuple();

        let mut buf = vec![0u8; schema.length(&tuple).unwrap()];
        schema.serialize(&mut buf, &tuple).unwrap();
        buf.truncate(buf.len() - 1);

        assert!(schema.deserialize(&buf).is_err());
    }

    #[test]
    fn set_field_replaces_value_in_place() {
        let mut tuple = sample_tuple();
        tuple.set_field(1, Value::Text("patched".into())).unwrap();
        assert_eq!(tuple.field(1), Some(&Value::Text("patched".into())));

        assert!(tuple.set_field(9, Value::Int(0)).is_err());
    }
}
