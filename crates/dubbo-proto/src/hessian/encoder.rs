//! Hessian 2.0 encoder.

use bytes::{BufMut, Bytes, BytesMut};

use super::constants::*;
use super::Value;

/// Streaming Hessian 2.0 encoder.
///
/// Class definitions and type names are written once and referenced by
/// index afterwards, so one encoder should be used per body.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
    classes: Vec<(String, Vec<String>)>,
    types: Vec<String>,
}

impl Encoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consumes the encoder and returns the encoded bytes.
    #[must_use]
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    /// Appends one value.
    pub fn encode(&mut self, value: &Value) {
        match value {
            Value::Null => self.buf.put_u8(BC_NULL),
            Value::Bool(true) => self.buf.put_u8(BC_TRUE),
            Value::Bool(false) => self.buf.put_u8(BC_FALSE),
            Value::Int(v) => self.write_int(*v),
            Value::Long(v) => self.write_long(*v),
            Value::Double(v) => self.write_double(*v),
            Value::String(s) => self.write_string(s),
            Value::Binary(b) => self.write_binary(b),
            Value::Date(ms) => self.write_date(*ms),
            Value::List { class, items } => self.write_list(class.as_deref(), items),
            Value::Map { class, entries } => self.write_map(class.as_deref(), entries),
            Value::Object { class, fields } => self.write_object(class, fields),
        }
    }

    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub fn write_int(&mut self, v: i32) {
        if (INT_DIRECT_MIN..=INT_DIRECT_MAX).contains(&v) {
            self.buf.put_u8((v + i32::from(BC_INT_ZERO)) as u8);
        } else if (INT_BYTE_MIN..=INT_BYTE_MAX).contains(&v) {
            self.buf.put_u8((i32::from(BC_INT_BYTE_ZERO) + (v >> 8)) as u8);
            self.buf.put_u8(v as u8);
        } else if (INT_SHORT_MIN..=INT_SHORT_MAX).contains(&v) {
            self.buf.put_u8((i32::from(BC_INT_SHORT_ZERO) + (v >> 16)) as u8);
            self.buf.put_u16(v as u16);
        } else {
            self.buf.put_u8(BC_INT);
            self.buf.put_i32(v);
        }
    }

    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub fn write_long(&mut self, v: i64) {
        if (LONG_DIRECT_MIN..=LONG_DIRECT_MAX).contains(&v) {
            self.buf.put_u8((v + i64::from(BC_LONG_ZERO)) as u8);
        } else if (LONG_BYTE_MIN..=LONG_BYTE_MAX).contains(&v) {
            self.buf.put_u8((i64::from(BC_LONG_BYTE_ZERO) + (v >> 8)) as u8);
            self.buf.put_u8(v as u8);
        } else if (LONG_SHORT_MIN..=LONG_SHORT_MAX).contains(&v) {
            self.buf.put_u8((i64::from(BC_LONG_SHORT_ZERO) + (v >> 16)) as u8);
            self.buf.put_u16(v as u16);
        } else if let Ok(small) = i32::try_from(v) {
            self.buf.put_u8(BC_LONG_INT);
            self.buf.put_i32(small);
        } else {
            self.buf.put_u8(BC_LONG);
            self.buf.put_i64(v);
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
    pub fn write_double(&mut self, v: f64) {
        let truncated = v as i64;
        if truncated as f64 == v {
            if truncated == 0 {
                self.buf.put_u8(BC_DOUBLE_ZERO);
                return;
            }
            if truncated == 1 {
                self.buf.put_u8(BC_DOUBLE_ONE);
                return;
            }
            if let Ok(b) = i8::try_from(truncated) {
                self.buf.put_u8(BC_DOUBLE_BYTE);
                self.buf.put_i8(b);
                return;
            }
            if let Ok(s) = i16::try_from(truncated) {
                self.buf.put_u8(BC_DOUBLE_SHORT);
                self.buf.put_i16(s);
                return;
            }
        }

        let mills = (v * 1000.0) as i32;
        if f64::from(mills) * 0.001 == v {
            self.buf.put_u8(BC_DOUBLE_MILL);
            self.buf.put_i32(mills);
            return;
        }

        self.buf.put_u8(BC_DOUBLE);
        self.buf.put_f64(v);
    }

    /// Writes a string with its length counted in UTF-16 units.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_string(&mut self, s: &str) {
        let units = s.encode_utf16().count();
        if units <= STRING_DIRECT_MAX {
            self.buf.put_u8(BC_STRING_DIRECT + units as u8);
            self.put_java_utf8(s);
            return;
        }
        if units <= STRING_SHORT_MAX {
            self.buf.put_u8(BC_STRING_SHORT + (units >> 8) as u8);
            self.buf.put_u8(units as u8);
            self.put_java_utf8(s);
            return;
        }

        // Chunks never split a surrogate pair.
        let mut chunk_start = 0;
        let mut chunk_units = 0;
        for (idx, ch) in s.char_indices() {
            let width = ch.len_utf16();
            if chunk_units + width > STRING_CHUNK_SIZE {
                self.buf.put_u8(BC_STRING_CHUNK);
                self.buf.put_u16(chunk_units as u16);
                self.put_java_utf8(&s[chunk_start..idx]);
                chunk_start = idx;
                chunk_units = 0;
            }
            chunk_units += width;
        }
        self.buf.put_u8(BC_STRING);
        self.buf.put_u16(chunk_units as u16);
        self.put_java_utf8(&s[chunk_start..]);
    }

    /// Java peers only read 1-3 byte sequences, so characters outside the
    /// BMP go out as two encoded surrogates.
    #[allow(clippy::cast_possible_truncation)]
    fn put_java_utf8(&mut self, s: &str) {
        let mut units = [0u16; 2];
        for ch in s.chars() {
            if ch.len_utf16() == 1 {
                let mut tmp = [0u8; 4];
                self.buf.put_slice(ch.encode_utf8(&mut tmp).as_bytes());
                continue;
            }
            for unit in ch.encode_utf16(&mut units).iter() {
                self.buf.put_u8(0xe0 | (unit >> 12) as u8);
                self.buf.put_u8(0x80 | ((unit >> 6) & 0x3f) as u8);
                self.buf.put_u8(0x80 | (unit & 0x3f) as u8);
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn write_binary(&mut self, b: &[u8]) {
        if b.len() <= BINARY_DIRECT_MAX {
            self.buf.put_u8(BC_BINARY_DIRECT + b.len() as u8);
            self.buf.put_slice(b);
            return;
        }
        if b.len() <= BINARY_SHORT_MAX {
            self.buf.put_u8(BC_BINARY_SHORT + (b.len() >> 8) as u8);
            self.buf.put_u8(b.len() as u8);
            self.buf.put_slice(b);
            return;
        }

        let mut rest = b;
        while rest.len() > BINARY_CHUNK_SIZE {
            let (chunk, tail) = rest.split_at(BINARY_CHUNK_SIZE);
            self.buf.put_u8(BC_BINARY_CHUNK);
            self.buf.put_u16(chunk.len() as u16);
            self.buf.put_slice(chunk);
            rest = tail;
        }
        self.buf.put_u8(BC_BINARY);
        self.buf.put_u16(rest.len() as u16);
        self.buf.put_slice(rest);
    }

    pub fn write_date(&mut self, ms: i64) {
        if ms % 60_000 == 0 {
            if let Ok(minutes) = i32::try_from(ms / 60_000) {
                self.buf.put_u8(BC_DATE_MINUTE);
                self.buf.put_i32(minutes);
                return;
            }
        }
        self.buf.put_u8(BC_DATE);
        self.buf.put_i64(ms);
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn write_list(&mut self, class: Option<&str>, items: &[Value]) {
        let len = items.len();
        match class {
            Some(class) if len <= LIST_DIRECT_MAX => {
                self.buf.put_u8(BC_LIST_DIRECT + len as u8);
                self.write_type(class);
            }
            Some(class) => {
                self.buf.put_u8(BC_LIST_FIXED);
                self.write_type(class);
                self.write_int(len as i32);
            }
            None if len <= LIST_DIRECT_MAX => {
                self.buf.put_u8(BC_LIST_DIRECT_UNTYPED + len as u8);
            }
            None => {
                self.buf.put_u8(BC_LIST_FIXED_UNTYPED);
                self.write_int(len as i32);
            }
        }
        for item in items {
            self.encode(item);
        }
    }

    fn write_map(&mut self, class: Option<&str>, entries: &[(Value, Value)]) {
        match class {
            Some(class) => {
                self.buf.put_u8(BC_MAP);
                self.write_type(class);
            }
            None => self.buf.put_u8(BC_MAP_UNTYPED),
        }
        for (k, v) in entries {
            self.encode(k);
            self.encode(v);
        }
        self.buf.put_u8(BC_END);
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn write_object(&mut self, class: &str, fields: &[(String, Value)]) {
        let idx = match self
            .classes
            .iter()
            .position(|(name, names)| name == class && names.iter().eq(fields.iter().map(|(f, _)| f)))
        {
            Some(idx) => idx,
            None => {
                self.buf.put_u8(BC_OBJECT_DEF);
                self.write_string(class);
                self.write_int(fields.len() as i32);
                for (name, _) in fields {
                    self.write_string(name);
                }
                self.classes.push((
                    class.to_owned(),
                    fields.iter().map(|(f, _)| f.clone()).collect(),
                ));
                self.classes.len() - 1
            }
        };

        if idx <= OBJECT_DIRECT_MAX {
            self.buf.put_u8(BC_OBJECT_DIRECT + idx as u8);
        } else {
            self.buf.put_u8(BC_OBJECT);
            self.write_int(idx as i32);
        }
        for (_, value) in fields {
            self.encode(value);
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn write_type(&mut self, class: &str) {
        if let Some(idx) = self.types.iter().position(|t| t == class) {
            self.write_int(idx as i32);
        } else {
            self.types.push(class.to_owned());
            self.write_string(class);
        }
    }
}
