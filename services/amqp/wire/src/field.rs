//! Field values, field tables and the argument codec.
//!
//! Field tables are AMQP's self-describing key/value maps: every value carries a
//! one-byte type tag. Method arguments are not tagged; their types come from the
//! method template (see [`crate::method`]) and consecutive bit arguments are packed
//! into a single octet.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use crate::error::WireError;

/// Maximum length of a short string in bytes
pub const SHORT_STR_MAX: usize = 255;

/// A tagged value stored in a field table or array
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// `t`: boolean, one octet
    Bool(bool),
    /// `b`: signed 8-bit
    I8(i8),
    /// `B`: unsigned 8-bit
    U8(u8),
    /// `U`: signed 16-bit
    I16(i16),
    /// `u`: unsigned 16-bit
    U16(u16),
    /// `I`: signed 32-bit
    I32(i32),
    /// `i`: unsigned 32-bit
    U32(u32),
    /// `L`: signed 64-bit
    I64(i64),
    /// `l`: unsigned 64-bit
    U64(u64),
    /// `f`: IEEE-754 single
    F32(f32),
    /// `d`: IEEE-754 double
    F64(f64),
    /// `D`: decimal, `value / 10^scale`
    Decimal {
        /// Number of decimal digits
        scale: u8,
        /// Unscaled value
        value: u32,
    },
    /// `s`: short string, at most 255 bytes
    ShortStr(String),
    /// `S`: long string, raw octets with a 32-bit length
    LongStr(Bytes),
    /// `x`: opaque byte blob with a 32-bit length
    Bytes(Bytes),
    /// `A`: array of tagged values
    Array(Vec<FieldValue>),
    /// `T`: seconds since the Unix epoch
    Timestamp(u64),
    /// `F`: nested field table
    Table(FieldTable),
    /// `V`: no value
    Void,
}

impl FieldValue {
    /// Wire tag for this value
    pub fn tag(&self) -> u8 {
        match self {
            FieldValue::Bool(_) => b't',
            FieldValue::I8(_) => b'b',
            FieldValue::U8(_) => b'B',
            FieldValue::I16(_) => b'U',
            FieldValue::U16(_) => b'u',
            FieldValue::I32(_) => b'I',
            FieldValue::U32(_) => b'i',
            FieldValue::I64(_) => b'L',
            FieldValue::U64(_) => b'l',
            FieldValue::F32(_) => b'f',
            FieldValue::F64(_) => b'd',
            FieldValue::Decimal { .. } => b'D',
            FieldValue::ShortStr(_) => b's',
            FieldValue::LongStr(_) => b'S',
            FieldValue::Bytes(_) => b'x',
            FieldValue::Array(_) => b'A',
            FieldValue::Timestamp(_) => b'T',
            FieldValue::Table(_) => b'F',
            FieldValue::Void => b'V',
        }
    }

    /// Encoded size including the tag octet
    pub fn encoded_len(&self) -> Result<usize, WireError> {
        let body = match self {
            FieldValue::Bool(_) | FieldValue::I8(_) | FieldValue::U8(_) => 1,
            FieldValue::I16(_) | FieldValue::U16(_) => 2,
            FieldValue::I32(_) | FieldValue::U32(_) | FieldValue::F32(_) => 4,
            FieldValue::I64(_)
            | FieldValue::U64(_)
            | FieldValue::F64(_)
            | FieldValue::Timestamp(_) => 8,
            FieldValue::Decimal { .. } => 5,
            FieldValue::ShortStr(s) => short_str_len(s)?,
            FieldValue::LongStr(b) | FieldValue::Bytes(b) => 4 + b.len(),
            FieldValue::Array(items) => {
                let mut len = 4;
                for item in items {
                    len += item.encoded_len()?;
                }
                len
            }
            FieldValue::Table(table) => 4 + table.encoded_body_len()?,
            FieldValue::Void => 0,
        };
        Ok(1 + body)
    }

    /// Boolean content, if this is a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Any integer variant widened to i128 for range-checked narrowing
    fn as_integer(&self) -> Option<i128> {
        match *self {
            FieldValue::I8(v) => Some(v.into()),
            FieldValue::U8(v) => Some(v.into()),
            FieldValue::I16(v) => Some(v.into()),
            FieldValue::U16(v) => Some(v.into()),
            FieldValue::I32(v) => Some(v.into()),
            FieldValue::U32(v) => Some(v.into()),
            FieldValue::I64(v) => Some(v.into()),
            FieldValue::U64(v) | FieldValue::Timestamp(v) => Some(v.into()),
            _ => None,
        }
    }

    /// Integer content narrowed to u8, if it fits
    pub fn as_u8(&self) -> Option<u8> {
        self.as_integer().and_then(|v| u8::try_from(v).ok())
    }

    /// Integer content narrowed to u16, if it fits
    pub fn as_u16(&self) -> Option<u16> {
        self.as_integer().and_then(|v| u16::try_from(v).ok())
    }

    /// Integer content narrowed to u32, if it fits
    pub fn as_u32(&self) -> Option<u32> {
        self.as_integer().and_then(|v| u32::try_from(v).ok())
    }

    /// Integer content narrowed to u64, if it fits
    pub fn as_u64(&self) -> Option<u64> {
        self.as_integer().and_then(|v| u64::try_from(v).ok())
    }

    /// String content of a short or UTF-8 long string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::ShortStr(s) => Some(s),
            FieldValue::LongStr(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Nested table content
    pub fn as_table(&self) -> Option<&FieldTable> {
        match self {
            FieldValue::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Smallest of `u`/`i`/`l` that holds `n`
    pub fn unsigned(n: u64) -> FieldValue {
        if let Ok(v) = u16::try_from(n) {
            FieldValue::U16(v)
        } else if let Ok(v) = u32::try_from(n) {
            FieldValue::U32(v)
        } else {
            FieldValue::U64(n)
        }
    }

    /// Infer a tagged value from an untyped JSON value.
    ///
    /// Strings become long strings, booleans `t`, objects nested tables and arrays
    /// `A` arrays. Non-negative integers take the smallest of `u`/`i`/`l` that fits,
    /// negative ones `I` or `L`, other numbers `d`.
    ///
    /// `null` has no tag and yields `None`; table and array conversions skip such
    /// entries silently rather than failing the whole value.
    pub fn from_json(value: &serde_json::Value) -> Option<FieldValue> {
        use serde_json::Value;

        match value {
            Value::Null => None,
            Value::Bool(b) => Some(FieldValue::Bool(*b)),
            Value::String(s) => Some(FieldValue::from(s.as_str())),
            Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    Some(FieldValue::unsigned(u))
                } else if let Some(i) = n.as_i64() {
                    Some(match i32::try_from(i) {
                        Ok(v) => FieldValue::I32(v),
                        Err(_) => FieldValue::I64(i),
                    })
                } else {
                    n.as_f64().map(FieldValue::F64)
                }
            }
            Value::Array(items) => Some(FieldValue::Array(
                items.iter().filter_map(FieldValue::from_json).collect(),
            )),
            Value::Object(map) => Some(FieldValue::Table(FieldTable::from_json(map))),
        }
    }
}

macro_rules! field_value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for FieldValue {
                fn from(value: $ty) -> Self {
                    FieldValue::$variant(value)
                }
            }
        )*
    };
}

field_value_from! {
    bool => Bool,
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    FieldTable => Table,
    Vec<FieldValue> => Array,
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::LongStr(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::LongStr(Bytes::from(value))
    }
}

impl From<DateTime<Utc>> for FieldValue {
    /// Timestamps carry whole seconds; instants before the epoch clamp to 0.
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(u64::try_from(value.timestamp()).unwrap_or(0))
    }
}

/// Name → value map encoded with a 32-bit byte-length prefix.
///
/// Entries are kept sorted by name, so they are written in name order rather
/// than insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldTable(BTreeMap<String, FieldValue>);

impl FieldTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing any previous value under the same name
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.0.insert(name.into(), value.into());
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Look up a value
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0.get(name)
    }

    /// Remove a value
    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        self.0.remove(name)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the table has no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate entries in encoding order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    /// Size of the encoded entries, excluding the 4-byte length prefix.
    ///
    /// This is the first pass of table encoding: the prefix must be known before any
    /// entry is written.
    pub fn encoded_body_len(&self) -> Result<usize, WireError> {
        let mut len = 0;
        for (name, value) in &self.0 {
            len += short_str_len(name)? + value.encoded_len()?;
        }
        Ok(len)
    }

    /// Build a table from an untyped JSON object, see [`FieldValue::from_json`]
    pub fn from_json(map: &serde_json::Map<String, serde_json::Value>) -> Self {
        map.iter()
            .filter_map(|(k, v)| FieldValue::from_json(v).map(|v| (k.clone(), v)))
            .collect()
    }
}

impl FromIterator<(String, FieldValue)> for FieldTable {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        FieldTable(iter.into_iter().collect())
    }
}

impl IntoIterator for FieldTable {
    type Item = (String, FieldValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, FieldValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Length prefix for long strings, arrays and tables
fn long_len(len: usize) -> Result<u32, WireError> {
    u32::try_from(len).map_err(|_| WireError::ValueTooLong(len))
}

fn short_str_len(s: &str) -> Result<usize, WireError> {
    if s.len() > SHORT_STR_MAX {
        return Err(WireError::ShortStringTooLong(s.len()));
    }
    Ok(1 + s.len())
}

/// AMQP domain types used by method argument templates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    /// Packed bit
    Bit,
    /// 8-bit unsigned
    Octet,
    /// 16-bit unsigned
    Short,
    /// 32-bit unsigned
    Long,
    /// 64-bit unsigned
    LongLong,
    /// Short string
    ShortStr,
    /// Long string
    LongStr,
    /// 64-bit timestamp
    Timestamp,
    /// Field table
    Table,
}

impl ArgType {
    /// Value written when a template argument is absent
    pub fn zero(self) -> FieldValue {
        match self {
            ArgType::Bit => FieldValue::Bool(false),
            ArgType::Octet => FieldValue::U8(0),
            ArgType::Short => FieldValue::U16(0),
            ArgType::Long => FieldValue::U32(0),
            ArgType::LongLong => FieldValue::U64(0),
            ArgType::ShortStr => FieldValue::ShortStr(String::new()),
            ArgType::LongStr => FieldValue::LongStr(Bytes::new()),
            ArgType::Timestamp => FieldValue::Timestamp(0),
            ArgType::Table => FieldValue::Table(FieldTable::new()),
        }
    }

    fn name(self) -> &'static str {
        match self {
            ArgType::Bit => "bit",
            ArgType::Octet => "octet",
            ArgType::Short => "short",
            ArgType::Long => "long",
            ArgType::LongLong => "longlong",
            ArgType::ShortStr => "shortstr",
            ArgType::LongStr => "longstr",
            ArgType::Timestamp => "timestamp",
            ArgType::Table => "table",
        }
    }
}

/// Writes values into a buffer, packing consecutive bits into shared octets
#[derive(Debug)]
pub struct FieldWriter<'a> {
    buf: &'a mut BytesMut,
    packing: bool,
    bit_pos: u8,
}

impl<'a> FieldWriter<'a> {
    /// Wrap a buffer
    pub fn new(buf: &'a mut BytesMut) -> Self {
        Self {
            buf,
            packing: false,
            bit_pos: 0,
        }
    }

    fn end_bits(&mut self) {
        self.packing = false;
        self.bit_pos = 0;
    }

    /// Write one packed bit. The first bit of a run opens a new octet at position 0.
    pub fn write_bit(&mut self, value: bool) {
        if !self.packing || self.bit_pos == 8 {
            self.buf.put_u8(0);
            self.packing = true;
            self.bit_pos = 0;
        }
        if value {
            let last = self.buf.len() - 1;
            self.buf[last] |= 1 << self.bit_pos;
        }
        self.bit_pos += 1;
    }

    /// Write an unsigned octet
    pub fn write_u8(&mut self, v: u8) {
        self.end_bits();
        self.buf.put_u8(v);
    }

    /// Write an unsigned 16-bit integer
    pub fn write_u16(&mut self, v: u16) {
        self.end_bits();
        self.buf.put_u16(v);
    }

    /// Write an unsigned 32-bit integer
    pub fn write_u32(&mut self, v: u32) {
        self.end_bits();
        self.buf.put_u32(v);
    }

    /// Write an unsigned 64-bit integer
    pub fn write_u64(&mut self, v: u64) {
        self.end_bits();
        self.buf.put_u64(v);
    }

    /// Write a short string; more than 255 bytes is an error
    pub fn write_short_str(&mut self, s: &str) -> Result<(), WireError> {
        short_str_len(s)?;
        self.end_bits();
        self.buf.put_u8(s.len() as u8);
        self.buf.put_slice(s.as_bytes());
        Ok(())
    }

    /// Write a long string
    pub fn write_long_str(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        let len = long_len(bytes.len())?;
        self.end_bits();
        self.buf.put_u32(len);
        self.buf.put_slice(bytes);
        Ok(())
    }

    /// Write a field table: size pass first, then the entries
    pub fn write_table(&mut self, table: &FieldTable) -> Result<(), WireError> {
        let len = table.encoded_body_len()?;
        let prefix = long_len(len)?;
        self.end_bits();
        self.buf.reserve(4 + len);
        self.buf.put_u32(prefix);
        for (name, value) in table.iter() {
            self.write_short_str(name)?;
            self.write_value(value)?;
        }
        Ok(())
    }

    /// Write a tagged value
    pub fn write_value(&mut self, value: &FieldValue) -> Result<(), WireError> {
        self.end_bits();
        self.buf.put_u8(value.tag());
        match value {
            FieldValue::Bool(b) => self.buf.put_u8(u8::from(*b)),
            FieldValue::I8(v) => self.buf.put_i8(*v),
            FieldValue::U8(v) => self.buf.put_u8(*v),
            FieldValue::I16(v) => self.buf.put_i16(*v),
            FieldValue::U16(v) => self.buf.put_u16(*v),
            FieldValue::I32(v) => self.buf.put_i32(*v),
            FieldValue::U32(v) => self.buf.put_u32(*v),
            FieldValue::I64(v) => self.buf.put_i64(*v),
            FieldValue::U64(v) | FieldValue::Timestamp(v) => self.buf.put_u64(*v),
            FieldValue::F32(v) => self.buf.put_f32(*v),
            FieldValue::F64(v) => self.buf.put_f64(*v),
            FieldValue::Decimal { scale, value } => {
                self.buf.put_u8(*scale);
                self.buf.put_u32(*value);
            }
            FieldValue::ShortStr(s) => self.write_short_str(s)?,
            FieldValue::LongStr(b) | FieldValue::Bytes(b) => self.write_long_str(b)?,
            FieldValue::Array(items) => {
                let mut len = 0;
                for item in items {
                    len += item.encoded_len()?;
                }
                self.buf.put_u32(long_len(len)?);
                for item in items {
                    self.write_value(item)?;
                }
            }
            FieldValue::Table(t) => self.write_table(t)?,
            FieldValue::Void => {}
        }
        Ok(())
    }

    /// Write an untagged argument whose type comes from a method template
    pub fn write_arg(
        &mut self,
        name: &'static str,
        ty: ArgType,
        value: &FieldValue,
    ) -> Result<(), WireError> {
        let mismatch = || WireError::ArgumentType {
            name,
            expected: ty.name(),
        };
        match ty {
            ArgType::Bit => self.write_bit(value.as_bool().ok_or_else(mismatch)?),
            ArgType::Octet => self.write_u8(value.as_u8().ok_or_else(mismatch)?),
            ArgType::Short => self.write_u16(value.as_u16().ok_or_else(mismatch)?),
            ArgType::Long => self.write_u32(value.as_u32().ok_or_else(mismatch)?),
            ArgType::LongLong | ArgType::Timestamp => {
                self.write_u64(value.as_u64().ok_or_else(mismatch)?)
            }
            ArgType::ShortStr => self.write_short_str(value.as_str().ok_or_else(mismatch)?)?,
            ArgType::LongStr => match value {
                FieldValue::LongStr(b) | FieldValue::Bytes(b) => self.write_long_str(b)?,
                FieldValue::ShortStr(s) => self.write_long_str(s.as_bytes())?,
                _ => return Err(mismatch()),
            },
            ArgType::Table => self.write_table(value.as_table().ok_or_else(mismatch)?)?,
        }
        Ok(())
    }
}

/// Reads values from a buffer, unpacking consecutive bits from shared octets
#[derive(Debug)]
pub struct FieldReader {
    buf: Bytes,
    bits: u8,
    bit_pos: u8,
}

impl FieldReader {
    /// Wrap a buffer
    pub fn new(buf: Bytes) -> Self {
        Self {
            buf,
            bits: 0,
            bit_pos: 8,
        }
    }

    /// Bytes not consumed yet
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Take the unconsumed bytes
    pub fn into_inner(self) -> Bytes {
        self.buf
    }

    fn need(&mut self, n: usize) -> Result<(), WireError> {
        self.bit_pos = 8;
        if self.buf.remaining() < n {
            return Err(WireError::truncated(n, self.buf.remaining()));
        }
        Ok(())
    }

    /// Read one packed bit
    pub fn read_bit(&mut self) -> Result<bool, WireError> {
        if self.bit_pos == 8 {
            if !self.buf.has_remaining() {
                return Err(WireError::truncated(1, 0));
            }
            self.bits = self.buf.get_u8();
            self.bit_pos = 0;
        }
        let bit = self.bits & (1 << self.bit_pos) != 0;
        self.bit_pos += 1;
        Ok(bit)
    }

    /// Read an unsigned octet
    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    /// Read an unsigned 16-bit integer
    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    /// Read an unsigned 32-bit integer
    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    /// Read an unsigned 64-bit integer
    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn read_bytes(&mut self, n: usize) -> Result<Bytes, WireError> {
        self.need(n)?;
        Ok(self.buf.split_to(n))
    }

    /// Read a short string
    pub fn read_short_str(&mut self) -> Result<String, WireError> {
        let len = self.read_u8()? as usize;
        let raw = self.read_bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    /// Read a long string as raw octets
    pub fn read_long_str(&mut self) -> Result<Bytes, WireError> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    /// Read a field table
    pub fn read_table(&mut self) -> Result<FieldTable, WireError> {
        let len = self.read_u32()? as usize;
        let mut inner = FieldReader::new(self.read_bytes(len)?);
        let mut table = FieldTable::new();
        while inner.remaining() > 0 {
            let name = inner.read_short_str()?;
            let value = inner.read_value()?;
            table.0.insert(name, value);
        }
        Ok(table)
    }

    /// Read a tagged value
    pub fn read_value(&mut self) -> Result<FieldValue, WireError> {
        let tag = self.read_u8()?;
        let value = match tag {
            b't' => FieldValue::Bool(self.read_u8()? != 0),
            b'b' => FieldValue::I8(self.read_u8()? as i8),
            b'B' => FieldValue::U8(self.read_u8()?),
            b'U' => FieldValue::I16(self.read_u16()? as i16),
            b'u' => FieldValue::U16(self.read_u16()?),
            b'I' => FieldValue::I32(self.read_u32()? as i32),
            b'i' => FieldValue::U32(self.read_u32()?),
            b'L' => FieldValue::I64(self.read_u64()? as i64),
            b'l' => FieldValue::U64(self.read_u64()?),
            b'f' => FieldValue::F32(f32::from_bits(self.read_u32()?)),
            b'd' => FieldValue::F64(f64::from_bits(self.read_u64()?)),
            b'D' => FieldValue::Decimal {
                scale: self.read_u8()?,
                value: self.read_u32()?,
            },
            b's' => FieldValue::ShortStr(self.read_short_str()?),
            b'S' => FieldValue::LongStr(self.read_long_str()?),
            b'x' => FieldValue::Bytes(self.read_long_str()?),
            b'A' => {
                let len = self.read_u32()? as usize;
                let mut inner = FieldReader::new(self.read_bytes(len)?);
                let mut items = Vec::new();
                while inner.remaining() > 0 {
                    items.push(inner.read_value()?);
                }
                FieldValue::Array(items)
            }
            b'T' => FieldValue::Timestamp(self.read_u64()?),
            b'F' => FieldValue::Table(self.read_table()?),
            b'V' => FieldValue::Void,
            other => return Err(WireError::UnknownFieldTag(other as char)),
        };
        Ok(value)
    }

    /// Read an untagged argument of a template type
    pub fn read_arg(&mut self, ty: ArgType) -> Result<FieldValue, WireError> {
        Ok(match ty {
            ArgType::Bit => FieldValue::Bool(self.read_bit()?),
            ArgType::Octet => FieldValue::U8(self.read_u8()?),
            ArgType::Short => FieldValue::U16(self.read_u16()?),
            ArgType::Long => FieldValue::U32(self.read_u32()?),
            ArgType::LongLong => FieldValue::U64(self.read_u64()?),
            ArgType::Timestamp => FieldValue::Timestamp(self.read_u64()?),
            ArgType::ShortStr => FieldValue::ShortStr(self.read_short_str()?),
            ArgType::LongStr => FieldValue::LongStr(self.read_long_str()?),
            ArgType::Table => FieldValue::Table(self.read_table()?),
        })
    }
}
