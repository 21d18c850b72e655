use serde::{Deserialize, Serialize};

/// Property value types for nodes and edges.
///
/// Documents are JSON-shaped and schemaless; `Map` preserves key order as
/// written. The engine never interprets contents except for numeric
/// coercion during weighted traversal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<PropertyValue>),
    Map(Vec<(String, PropertyValue)>),
}

impl PropertyValue {
    /// Encode to the canonical byte form used for WAL records, the main
    /// data file, and change detection.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            PropertyValue::Null => out.push(0),
            PropertyValue::Bool(b) => {
                out.push(1);
                out.push(u8::from(*b));
            }
            PropertyValue::Int(i) => {
                out.push(2);
                out.extend_from_slice(&i.to_le_bytes());
            }
            PropertyValue::Float(f) => {
                out.push(3);
                out.extend_from_slice(&f.to_le_bytes());
            }
            PropertyValue::String(s) => {
                out.push(4);
                push_str(out, s);
            }
            PropertyValue::List(items) => {
                out.push(5);
                out.extend_from_slice(&(items.len() as u32).to_le_bytes());
                for item in items {
                    item.encode_into(out);
                }
            }
            PropertyValue::Map(entries) => {
                out.push(6);
                out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
                for (key, value) in entries {
                    push_str(out, key);
                    value.encode_into(out);
                }
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PropertyDecodeError> {
        let mut cursor = Cursor { bytes, pos: 0 };
        let value = cursor.read_value()?;
        if cursor.pos != bytes.len() {
            return Err(PropertyDecodeError::TrailingBytes);
        }
        Ok(value)
    }

    /// Numeric view of this value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Int(i) => Some(*i as f64),
            PropertyValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Map lookup by key; `None` for non-map values.
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        match self {
            PropertyValue::Map(entries) => {
                entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
            }
            _ => None,
        }
    }
}

fn push_str(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

/// A stored property document: the opaque value plus its write counter.
///
/// `version` is the document's `__v`; it advances on every write, even a
/// byte-identical overwrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub version: u64,
    pub value: PropertyValue,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PropertyDecodeError {
    Truncated,
    TrailingBytes,
    InvalidUtf8,
    UnknownTag(u8),
}

impl std::fmt::Display for PropertyDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyDecodeError::Truncated => write!(f, "truncated property value"),
            PropertyDecodeError::TrailingBytes => write!(f, "trailing bytes after property value"),
            PropertyDecodeError::InvalidUtf8 => write!(f, "invalid UTF-8 in property value"),
            PropertyDecodeError::UnknownTag(tag) => {
                write!(f, "unknown property value tag: {tag}")
            }
        }
    }
}

impl std::error::Error for PropertyDecodeError {}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8], PropertyDecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(PropertyDecodeError::Truncated)?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, PropertyDecodeError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_str(&mut self) -> Result<String, PropertyDecodeError> {
        let len = self.read_u32()? as usize;
        String::from_utf8(self.take(len)?.to_vec()).map_err(|_| PropertyDecodeError::InvalidUtf8)
    }

    fn read_value(&mut self) -> Result<PropertyValue, PropertyDecodeError> {
        let tag = self.take(1)?[0];
        match tag {
            0 => Ok(PropertyValue::Null),
            1 => Ok(PropertyValue::Bool(self.take(1)?[0] != 0)),
            2 => Ok(PropertyValue::Int(i64::from_le_bytes(
                self.take(8)?.try_into().unwrap(),
            ))),
            3 => Ok(PropertyValue::Float(f64::from_le_bytes(
                self.take(8)?.try_into().unwrap(),
            ))),
            4 => Ok(PropertyValue::String(self.read_str()?)),
            5 => {
                let len = self.read_u32()? as usize;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(self.read_value()?);
                }
                Ok(PropertyValue::List(items))
            }
            6 => {
                let len = self.read_u32()? as usize;
                let mut entries = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    let key = self.read_str()?;
                    entries.push((key, self.read_value()?));
                }
                Ok(PropertyValue::Map(entries))
            }
            other => Err(PropertyDecodeError::UnknownTag(other)),
        }
    }
}
