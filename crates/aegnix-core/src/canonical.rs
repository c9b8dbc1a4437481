//! Canonical encoding of structured payloads and envelope fields.
//!
//! Two implementations given semantically identical values must produce
//! identical bytes, and any change to a value must change the bytes. The
//! encoding is a tagged, length-prefixed binary format:
//!
//! ```text
//! Null        0x00
//! Bool        0x01 (false) | 0x02 (true)
//! Integer     0x03 i64 (big-endian)
//! Float       0x04 f64 bits (big-endian), only for non-integral values
//! String      0x05 u32 length (big-endian) || UTF-8 bytes
//! Sequence    0x06 u32 count || items
//! Mapping     0x07 u32 count || (u32 key length || key || value)*, keys in
//!             ascending byte order
//! ```
//!
//! Numbers have exactly one representation: a float with an integral value
//! inside the `i64` range is encoded as an integer, `-0.0` is `0`, and
//! non-finite floats are rejected. The decoder accepts only canonical input,
//! so `encode(decode(b)) == b` for every accepted `b`.

use std::collections::BTreeMap;

use thiserror::Error;

/// Maximum nesting depth of sequences and mappings
pub const MAX_DEPTH: usize = 64;

const TAG_NULL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_STRING: u8 = 0x05;
const TAG_SEQUENCE: u8 = 0x06;
const TAG_MAPPING: u8 = 0x07;

/// 2^63 as f64, the exclusive upper bound of integral floats that fit in i64
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

/// Errors from canonical encoding and decoding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CanonicalError {
    /// NaN or infinity has no canonical representation
    #[error("non-finite number")]
    NonFiniteNumber,

    /// Integer outside the signed 64-bit range
    #[error("integer out of range: {0}")]
    IntegerOutOfRange(String),

    /// String bytes are not valid UTF-8
    #[error("invalid UTF-8 in string")]
    InvalidUtf8,

    /// Input ended before the value was complete
    #[error("truncated input: needed {needed} more bytes")]
    Truncated {
        /// Bytes missing at the point of failure
        needed: usize,
    },

    /// Bytes left over after a complete value
    #[error("{count} trailing bytes after value")]
    TrailingBytes {
        /// Number of unconsumed bytes
        count: usize,
    },

    /// Unknown type tag
    #[error("unknown tag {0:#04x}")]
    UnknownTag(u8),

    /// Mapping keys are not strictly ascending (unsorted or duplicated)
    #[error("mapping keys not in canonical order at {key:?}")]
    UnsortedKeys {
        /// First key out of order
        key: String,
    },

    /// Float encoding used for a value that must be an integer
    #[error("non-canonical number encoding")]
    NonCanonicalNumber,

    /// Nesting exceeds [`MAX_DEPTH`]
    #[error("nesting exceeds maximum depth {max}")]
    DepthExceeded {
        /// Maximum allowed depth
        max: usize,
    },

    /// Length does not fit the 32-bit length prefix
    #[error("length {len} exceeds 32-bit prefix")]
    LengthOverflow {
        /// Offending length
        len: usize,
    },
}

/// Structured payload value.
///
/// A closed variant type: mappings are always ordered by key, so the host
/// language's map iteration order never leaks into the encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent value
    Null,
    /// Boolean
    Bool(bool),
    /// Integer or float
    Number(Number),
    /// UTF-8 string
    String(String),
    /// Ordered list
    Sequence(Vec<Value>),
    /// String-keyed map, sorted by key
    Mapping(BTreeMap<String, Value>),
}

/// Numeric value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    /// Signed 64-bit integer
    Int(i64),
    /// Finite, non-integral double
    Float(f64),
}

impl Number {
    /// Canonical form of a float: integral values become [`Number::Int`].
    pub fn from_f64(value: f64) -> Result<Self, CanonicalError> {
        if !value.is_finite() {
            return Err(CanonicalError::NonFiniteNumber);
        }
        if value.fract() == 0.0 && (-I64_BOUND..I64_BOUND).contains(&value) {
            return Ok(Self::Int(value as i64));
        }
        Ok(Self::Float(value))
    }

    fn canonical(self) -> Result<Self, CanonicalError> {
        match self {
            Self::Int(_) => Ok(self),
            Self::Float(f) => Self::from_f64(f),
        }
    }
}

impl Value {
    /// Look up a key in a mapping. `None` for other variants.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Mapping(map) => map.get(key),
            _ => None,
        }
    }

    /// String contents, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Number(Number::Int(value))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Self::Sequence(value)
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Value {
    fn from_iter<T: IntoIterator<Item = (K, Value)>>(iter: T) -> Self {
        Self::Mapping(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = CanonicalError;

    fn try_from(json: serde_json::Value) -> Result<Self, Self::Error> {
        Ok(match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Number(Number::Int(i))
                } else if n.is_u64() {
                    return Err(CanonicalError::IntegerOutOfRange(n.to_string()));
                } else {
                    let f = n.as_f64().ok_or(CanonicalError::NonFiniteNumber)?;
                    Self::Number(Number::from_f64(f)?)
                }
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Sequence(items.into_iter().map(Self::try_from).collect::<Result<_, _>>()?)
            },
            serde_json::Value::Object(map) => Self::Mapping(
                map.into_iter()
                    .map(|(k, v)| Ok((k, Self::try_from(v)?)))
                    .collect::<Result<_, CanonicalError>>()?,
            ),
        })
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(Number::Int(i)) => Self::from(*i),
            Value::Number(Number::Float(f)) => {
                serde_json::Number::from_f64(*f).map_or(Self::Null, Self::Number)
            },
            Value::String(s) => Self::String(s.clone()),
            Value::Sequence(items) => Self::Array(items.iter().map(Self::from).collect()),
            Value::Mapping(map) => {
                Self::Object(map.iter().map(|(k, v)| (k.clone(), Self::from(v))).collect())
            },
        }
    }
}

/// Canonical bytes of a payload value.
pub fn encode(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    let mut writer = CanonicalWriter::new();
    writer.put_value(value)?;
    Ok(writer.finish())
}

/// Decode canonical bytes, rejecting any non-canonical input.
pub fn decode(bytes: &[u8]) -> Result<Value, CanonicalError> {
    let mut reader = Reader { bytes, pos: 0 };
    let value = reader.value(0)?;
    let remaining = bytes.len() - reader.pos;
    if remaining != 0 {
        return Err(CanonicalError::TrailingBytes { count: remaining });
    }
    Ok(value)
}

/// Append-only builder for canonical byte sequences.
///
/// Used for payload values and for the fixed-order envelope signing layout.
#[derive(Debug, Default)]
pub(crate) struct CanonicalWriter {
    buf: Vec<u8>,
}

impl CanonicalWriter {
    pub(crate) fn new() -> Self {
        Self { buf: Vec::with_capacity(128) }
    }

    pub(crate) fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub(crate) fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Fixed-width field: written without a length prefix.
    pub(crate) fn put_fixed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Variable-width field: u32 length prefix, then the bytes.
    pub(crate) fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), CanonicalError> {
        self.put_len(bytes.len())?;
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub(crate) fn put_str(&mut self, value: &str) -> Result<(), CanonicalError> {
        self.put_bytes(value.as_bytes())
    }

    /// Optional string: presence byte, then the string if present.
    pub(crate) fn put_opt_str(&mut self, value: Option<&str>) -> Result<(), CanonicalError> {
        match value {
            None => {
                self.put_u8(0);
                Ok(())
            },
            Some(s) => {
                self.put_u8(1);
                self.put_str(s)
            },
        }
    }

    /// String list: u32 count, then each string length-prefixed.
    pub(crate) fn put_str_list(&mut self, values: &[String]) -> Result<(), CanonicalError> {
        self.put_len(values.len())?;
        values.iter().try_for_each(|value| self.put_str(value))
    }

    pub(crate) fn put_value(&mut self, value: &Value) -> Result<(), CanonicalError> {
        self.put_value_at(value, 0)
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.buf
    }

    fn put_len(&mut self, len: usize) -> Result<(), CanonicalError> {
        let len32 = u32::try_from(len).map_err(|_| CanonicalError::LengthOverflow { len })?;
        self.buf.extend_from_slice(&len32.to_be_bytes());
        Ok(())
    }

    fn put_value_at(&mut self, value: &Value, depth: usize) -> Result<(), CanonicalError> {
        if depth > MAX_DEPTH {
            return Err(CanonicalError::DepthExceeded { max: MAX_DEPTH });
        }

        match value {
            Value::Null => self.put_u8(TAG_NULL),
            Value::Bool(false) => self.put_u8(TAG_FALSE),
            Value::Bool(true) => self.put_u8(TAG_TRUE),
            Value::Number(number) => match number.canonical()? {
                Number::Int(i) => {
                    self.put_u8(TAG_INT);
                    self.buf.extend_from_slice(&i.to_be_bytes());
                },
                Number::Float(f) => {
                    self.put_u8(TAG_FLOAT);
                    self.put_u64(f.to_bits());
                },
            },
            Value::String(s) => {
                self.put_u8(TAG_STRING);
                self.put_str(s)?;
            },
            Value::Sequence(items) => {
                self.put_u8(TAG_SEQUENCE);
                self.put_len(items.len())?;
                for item in items {
                    self.put_value_at(item, depth + 1)?;
                }
            },
            Value::Mapping(map) => {
                self.put_u8(TAG_MAPPING);
                self.put_len(map.len())?;
                // BTreeMap<String, _> iterates in ascending byte order
                for (key, item) in map {
                    self.put_str(key)?;
                    self.put_value_at(item, depth + 1)?;
                }
            },
        }
        Ok(())
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CanonicalError> {
        let available = self.bytes.len() - self.pos;
        if n > available {
            return Err(CanonicalError::Truncated { needed: n - available });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CanonicalError> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CanonicalError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn len(&mut self) -> Result<usize, CanonicalError> {
        Ok(u32::from_be_bytes(self.array()?) as usize)
    }

    fn string(&mut self) -> Result<String, CanonicalError> {
        let len = self.len()?;
        let raw = self.take(len)?;
        std::str::from_utf8(raw).map(str::to_string).map_err(|_| CanonicalError::InvalidUtf8)
    }

    fn value(&mut self, depth: usize) -> Result<Value, CanonicalError> {
        if depth > MAX_DEPTH {
            return Err(CanonicalError::DepthExceeded { max: MAX_DEPTH });
        }

        match self.u8()? {
            TAG_NULL => Ok(Value::Null),
            TAG_FALSE => Ok(Value::Bool(false)),
            TAG_TRUE => Ok(Value::Bool(true)),
            TAG_INT => Ok(Value::Number(Number::Int(i64::from_be_bytes(self.array()?)))),
            TAG_FLOAT => {
                let f = f64::from_bits(u64::from_be_bytes(self.array()?));
                match Number::from_f64(f)? {
                    Number::Float(_) => Ok(Value::Number(Number::Float(f))),
                    Number::Int(_) => Err(CanonicalError::NonCanonicalNumber),
                }
            },
            TAG_STRING => Ok(Value::String(self.string()?)),
            TAG_SEQUENCE => {
                let count = self.len()?;
                // Each item is at least one byte; never trust the count for allocation
                let mut items = Vec::with_capacity(count.min(self.bytes.len() - self.pos));
                for _ in 0..count {
                    items.push(self.value(depth + 1)?);
                }
                Ok(Value::Sequence(items))
            },
            TAG_MAPPING => {
                let count = self.len()?;
                let mut map = BTreeMap::new();
                let mut previous: Option<String> = None;
                for _ in 0..count {
                    let key = self.string()?;
                    if previous.as_deref().is_some_and(|prev| prev >= key.as_str()) {
                        return Err(CanonicalError::UnsortedKeys { key });
                    }
                    let item = self.value(depth + 1)?;
                    previous = Some(key.clone());
                    map.insert(key, item);
                }
                Ok(Value::Mapping(map))
            },
            tag => Err(CanonicalError::UnknownTag(tag)),
        }
    }
}
