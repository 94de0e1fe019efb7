//! Hessian 2.0 decoder.

use super::constants::*;
use super::{HessianError, Value};

#[derive(Debug, Clone)]
struct ClassDef {
    name: String,
    fields: Vec<String>,
}

/// Deepest container nesting accepted.
pub const MAX_DEPTH: usize = 128;

/// Values a decoder may materialise beyond what the input spells out:
/// copies made for back references and the copies they expand into.
pub const MAX_EXPANDED_NODES: usize = 1 << 22;

/// Hessian 2.0 decoder over a borrowed buffer.
///
/// Object references are resolved by cloning the earlier value. A reference
/// to a container that is still being decoded (a cycle) resolves to
/// [`Value::Null`].
///
/// Input from a peer is untrusted: nesting is capped at [`MAX_DEPTH`] and
/// reference expansion at [`MAX_EXPANDED_NODES`].
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    classes: Vec<ClassDef>,
    types: Vec<String>,
    /// Referable values with the number of nodes each one spans.
    refs: Vec<(Value, usize)>,
    depth: usize,
    nodes: usize,
    expanded: usize,
}

impl<'a> Decoder<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            classes: Vec::new(),
            types: Vec::new(),
            refs: Vec::new(),
            depth: 0,
            nodes: 0,
            expanded: 0,
        }
    }

    /// Bytes consumed so far.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Reads the next value.
    pub fn decode(&mut self) -> Result<Value, HessianError> {
        if self.depth >= MAX_DEPTH {
            return Err(HessianError::TooDeep(MAX_DEPTH));
        }
        let tag = self.read_u8()?;
        self.depth += 1;
        let value = self.decode_tagged(tag);
        self.depth -= 1;
        value
    }

    /// Reads the next value and requires it to be a string.
    pub fn decode_string(&mut self) -> Result<String, HessianError> {
        match self.decode()? {
            Value::String(s) => Ok(s),
            Value::Null => Ok(String::new()),
            other => Err(HessianError::TypeMismatch {
                expected: "string".to_owned(),
                found: other.kind(),
            }),
        }
    }

    /// Reads the next value and requires it to be an int.
    pub fn decode_int(&mut self) -> Result<i32, HessianError> {
        match self.decode()? {
            Value::Int(v) => Ok(v),
            other => Err(HessianError::TypeMismatch {
                expected: "int".to_owned(),
                found: other.kind(),
            }),
        }
    }

    #[allow(clippy::too_many_lines)]
    fn decode_tagged(&mut self, tag: u8) -> Result<Value, HessianError> {
        let value = match tag {
            BC_NULL => Value::Null,
            BC_TRUE => Value::Bool(true),
            BC_FALSE => Value::Bool(false),

            0x80..=0xbf => Value::Int(i32::from(tag) - i32::from(BC_INT_ZERO)),
            0xc0..=0xcf => {
                let high = i32::from(tag) - i32::from(BC_INT_BYTE_ZERO);
                Value::Int((high << 8) + i32::from(self.read_u8()?))
            }
            0xd0..=0xd7 => {
                let high = i32::from(tag) - i32::from(BC_INT_SHORT_ZERO);
                Value::Int((high << 16) + i32::from(self.read_u16()?))
            }
            BC_INT => Value::Int(self.read_i32()?),

            0xd8..=0xef => Value::Long(i64::from(tag) - i64::from(BC_LONG_ZERO)),
            0xf0..=0xff => {
                let high = i64::from(tag) - i64::from(BC_LONG_BYTE_ZERO);
                Value::Long((high << 8) + i64::from(self.read_u8()?))
            }
            0x38..=0x3f => {
                let high = i64::from(tag) - i64::from(BC_LONG_SHORT_ZERO);
                Value::Long((high << 16) + i64::from(self.read_u16()?))
            }
            BC_LONG_INT => Value::Long(i64::from(self.read_i32()?)),
            BC_LONG => Value::Long(self.read_i64()?),

            BC_DOUBLE_ZERO => Value::Double(0.0),
            BC_DOUBLE_ONE => Value::Double(1.0),
            BC_DOUBLE_BYTE => Value::Double(f64::from(i8::from_be_bytes([self.read_u8()?]))),
            BC_DOUBLE_SHORT => Value::Double(f64::from(i16::from_be_bytes(self.read_u16()?.to_be_bytes()))),
            BC_DOUBLE_MILL => Value::Double(f64::from(self.read_i32()?) * 0.001),
            BC_DOUBLE => Value::Double(f64::from_bits(self.read_u64()?)),

            BC_DATE => Value::Date(self.read_i64()?),
            BC_DATE_MINUTE => Value::Date(i64::from(self.read_i32()?) * 60_000),

            0x00..=0x1f | 0x30..=0x33 | BC_STRING | BC_STRING_CHUNK => {
                Value::String(self.read_string_body(tag)?)
            }
            0x20..=0x2f | 0x34..=0x37 | BC_BINARY | BC_BINARY_CHUNK => {
                Value::Binary(self.read_binary_body(tag)?)
            }

            BC_LIST_FIXED => {
                let class = self.read_type()?;
                let len = self.read_length()?;
                self.read_list(Some(class), Some(len))?
            }
            BC_LIST_VARIABLE => {
                let class = self.read_type()?;
                self.read_list(Some(class), None)?
            }
            BC_LIST_VARIABLE_UNTYPED => self.read_list(None, None)?,
            BC_LIST_FIXED_UNTYPED => {
                let len = self.read_length()?;
                self.read_list(None, Some(len))?
            }
            0x70..=0x77 => {
                let class = self.read_type()?;
                self.read_list(Some(class), Some(usize::from(tag - BC_LIST_DIRECT)))?
            }
            0x78..=0x7f => self.read_list(None, Some(usize::from(tag - BC_LIST_DIRECT_UNTYPED)))?,

            BC_MAP => {
                let class = self.read_type()?;
                self.read_map(Some(class))?
            }
            BC_MAP_UNTYPED => self.read_map(None)?,

            BC_OBJECT_DEF => {
                self.read_class_def()?;
                // A definition is always followed by a value.
                return self.decode();
            }
            BC_OBJECT => {
                let idx = self.read_length()?;
                self.read_object(idx)?
            }
            0x60..=0x6f => self.read_object(usize::from(tag - BC_OBJECT_DIRECT))?,

            BC_REF => {
                let idx = self.read_length()?;
                let weight = self
                    .refs
                    .get(idx)
                    .map(|(_, weight)| *weight)
                    .ok_or(HessianError::UnknownRef(idx))?;
                self.charge(weight)?;
                self.nodes += weight;
                return Ok(self.refs[idx].0.clone());
            }

            other => return Err(HessianError::UnexpectedTag(other)),
        };
        self.nodes += 1;
        Ok(value)
    }

    fn charge(&mut self, nodes: usize) -> Result<(), HessianError> {
        self.expanded = self.expanded.saturating_add(nodes);
        if self.expanded > MAX_EXPANDED_NODES {
            return Err(HessianError::TooLarge(MAX_EXPANDED_NODES));
        }
        Ok(())
    }

    /// Stores a finished container under its reserved reference slot.
    fn fill_ref(&mut self, slot: usize, value: &Value, start: usize) -> Result<(), HessianError> {
        let weight = self.nodes - start + 1;
        self.charge(weight)?;
        self.refs[slot] = (value.clone(), weight);
        Ok(())
    }

    fn read_list(
        &mut self,
        class: Option<String>,
        len: Option<usize>,
    ) -> Result<Value, HessianError> {
        let (slot, start) = (self.reserve_ref(), self.nodes);
        let mut items = Vec::with_capacity(len.unwrap_or(0).min(self.remaining()));
        match len {
            Some(len) => {
                for _ in 0..len {
                    items.push(self.decode()?);
                }
            }
            None => {
                while self.peek_u8()? != BC_END {
                    items.push(self.decode()?);
                }
                self.pos += 1;
            }
        }
        let value = Value::List { class, items };
        self.fill_ref(slot, &value, start)?;
        Ok(value)
    }

    fn read_map(&mut self, class: Option<String>) -> Result<Value, HessianError> {
        let (slot, start) = (self.reserve_ref(), self.nodes);
        let mut entries = Vec::new();
        while self.peek_u8()? != BC_END {
            let key = self.decode()?;
            let value = self.decode()?;
            entries.push((key, value));
        }
        self.pos += 1;
        let value = Value::Map { class, entries };
        self.fill_ref(slot, &value, start)?;
        Ok(value)
    }

    fn read_class_def(&mut self) -> Result<(), HessianError> {
        let name = self.decode_string()?;
        let count = self.read_length()?;
        let mut fields = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            fields.push(self.decode_string()?);
        }
        self.classes.push(ClassDef { name, fields });
        Ok(())
    }

    fn read_object(&mut self, idx: usize) -> Result<Value, HessianError> {
        let def = self
            .classes
            .get(idx)
            .cloned()
            .ok_or(HessianError::UnknownClassDef(idx))?;
        let (slot, start) = (self.reserve_ref(), self.nodes);
        let mut fields = Vec::with_capacity(def.fields.len());
        for name in def.fields {
            let value = self.decode()?;
            fields.push((name, value));
        }
        let value = Value::Object {
            class: def.name,
            fields,
        };
        self.fill_ref(slot, &value, start)?;
        Ok(value)
    }

    /// A type is either an inline string or an index into earlier types.
    fn read_type(&mut self) -> Result<String, HessianError> {
        let tag = self.peek_u8()?;
        if matches!(tag, 0x00..=0x1f | 0x30..=0x33 | BC_STRING | BC_STRING_CHUNK) {
            let name = self.decode_string()?;
            self.types.push(name.clone());
            return Ok(name);
        }
        let idx = self.read_length()?;
        self.types
            .get(idx)
            .cloned()
            .ok_or(HessianError::UnknownTypeRef(idx))
    }

    fn read_length(&mut self) -> Result<usize, HessianError> {
        let v = self.decode_int()?;
        usize::try_from(v).map_err(|_| HessianError::InvalidLength(i64::from(v)))
    }

    fn reserve_ref(&mut self) -> usize {
        self.refs.push((Value::Null, 1));
        self.refs.len() - 1
    }

    fn read_string_body(&mut self, tag: u8) -> Result<String, HessianError> {
        let mut units: Vec<u16> = Vec::new();
        let mut tag = tag;
        loop {
            let (len, last) = match tag {
                0x00..=0x1f => (usize::from(tag - BC_STRING_DIRECT), true),
                0x30..=0x33 => {
                    let high = usize::from(tag - BC_STRING_SHORT) << 8;
                    (high + usize::from(self.read_u8()?), true)
                }
                BC_STRING => (usize::from(self.read_u16()?), true),
                BC_STRING_CHUNK => (usize::from(self.read_u16()?), false),
                other => return Err(HessianError::UnexpectedTag(other)),
            };
            self.read_utf16_units(len, &mut units)?;
            if last {
                break;
            }
            tag = self.read_u8()?;
        }
        String::from_utf16(&units).map_err(|_| HessianError::InvalidString)
    }

    /// Reads `count` UTF-16 units of (possibly surrogate-encoded) UTF-8.
    fn read_utf16_units(&mut self, count: usize, out: &mut Vec<u16>) -> Result<(), HessianError> {
        let target = out.len() + count;
        while out.len() < target {
            let b = self.read_u8()?;
            if b < 0x80 {
                out.push(u16::from(b));
            } else if b & 0xe0 == 0xc0 {
                let b1 = self.read_continuation()?;
                out.push((u16::from(b & 0x1f) << 6) | b1);
            } else if b & 0xf0 == 0xe0 {
                let b1 = self.read_continuation()?;
                let b2 = self.read_continuation()?;
                out.push((u16::from(b & 0x0f) << 12) | (b1 << 6) | b2);
            } else if b & 0xf8 == 0xf0 {
                let b1 = u32::from(self.read_continuation()?);
                let b2 = u32::from(self.read_continuation()?);
                let b3 = u32::from(self.read_continuation()?);
                let cp = (u32::from(b & 0x07) << 18) | (b1 << 12) | (b2 << 6) | b3;
                let ch = char::from_u32(cp).ok_or(HessianError::InvalidString)?;
                let mut pair = [0u16; 2];
                out.extend_from_slice(ch.encode_utf16(&mut pair));
            } else {
                return Err(HessianError::InvalidString);
            }
        }
        Ok(())
    }

    fn read_continuation(&mut self) -> Result<u16, HessianError> {
        let b = self.read_u8()?;
        if b & 0xc0 != 0x80 {
            return Err(HessianError::InvalidString);
        }
        Ok(u16::from(b & 0x3f))
    }

    fn read_binary_body(&mut self, tag: u8) -> Result<Vec<u8>, HessianError> {
        let mut out = Vec::new();
        let mut tag = tag;
        loop {
            let (len, last) = match tag {
                0x20..=0x2f => (usize::from(tag - BC_BINARY_DIRECT), true),
                0x34..=0x37 => {
                    let high = usize::from(tag - BC_BINARY_SHORT) << 8;
                    (high + usize::from(self.read_u8()?), true)
                }
                BC_BINARY => (usize::from(self.read_u16()?), true),
                BC_BINARY_CHUNK => (usize::from(self.read_u16()?), false),
                other => return Err(HessianError::UnexpectedTag(other)),
            };
            out.extend_from_slice(self.take(len)?);
            if last {
                break;
            }
            tag = self.read_u8()?;
        }
        Ok(out)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], HessianError> {
        let end = self.pos.checked_add(len).ok_or(HessianError::UnexpectedEof)?;
        let slice = self.buf.get(self.pos..end).ok_or(HessianError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    fn peek_u8(&self) -> Result<u8, HessianError> {
        self.buf.get(self.pos).copied().ok_or(HessianError::UnexpectedEof)
    }

    fn read_u8(&mut self) -> Result<u8, HessianError> {
        let b = self.peek_u8()?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16, HessianError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_i32(&mut self) -> Result<i32, HessianError> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, HessianError> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(arr))
    }

    fn read_i64(&mut self) -> Result<i64, HessianError> {
        self.read_u64().map(|v| i64::from_be_bytes(v.to_be_bytes()))
    }
}
