//! ASN.1 tag encoding used by BACnet application PDUs

use bytes::{BufMut, BytesMut};

use crate::error::CodecError;
use crate::types::{Date, ObjectId, PropertyValue, Time};

/// Application tag numbers
pub mod app {
    pub const NULL: u8 = 0;
    pub const BOOLEAN: u8 = 1;
    pub const UNSIGNED: u8 = 2;
    pub const SIGNED: u8 = 3;
    pub const REAL: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const OCTET_STRING: u8 = 6;
    pub const CHARACTER_STRING: u8 = 7;
    pub const BIT_STRING: u8 = 8;
    pub const ENUMERATED: u8 = 9;
    pub const DATE: u8 = 10;
    pub const TIME: u8 = 11;
    pub const OBJECT_ID: u8 = 12;
}

const CHARSET_UTF8: u8 = 0;

// ─────────────────────────────────────────────────────────────────────────────
// Writer
// ─────────────────────────────────────────────────────────────────────────────

pub struct TagWriter<'a> {
    buf: &'a mut BytesMut,
}

impl<'a> TagWriter<'a> {
    pub fn new(buf: &'a mut BytesMut) -> Self {
        Self { buf }
    }

    fn header(&mut self, number: u8, context: bool, len: usize) {
        let class = if context { 0x08 } else { 0x00 };
        let lvt = if len <= 4 { len as u8 } else { 5 };
        if number <= 14 {
            self.buf.put_u8((number << 4) | class | lvt);
        } else {
            self.buf.put_u8(0xF0 | class | lvt);
            self.buf.put_u8(number);
        }
        if len > 4 {
            if len <= 253 {
                self.buf.put_u8(len as u8);
            } else if len <= u16::MAX as usize {
                self.buf.put_u8(254);
                self.buf.put_u16(len as u16);
            } else {
                self.buf.put_u8(255);
                self.buf.put_u32(len as u32);
            }
        }
    }

    fn tagged(&mut self, number: u8, context: bool, content: &[u8]) {
        self.header(number, context, content.len());
        self.buf.put_slice(content);
    }

    pub fn opening(&mut self, number: u8) {
        self.buf.put_u8((number << 4) | 0x0E);
    }

    pub fn closing(&mut self, number: u8) {
        self.buf.put_u8((number << 4) | 0x0F);
    }

    pub fn app_unsigned(&mut self, v: u64) {
        self.tagged(app::UNSIGNED, false, &unsigned_bytes(v));
    }

    pub fn app_enumerated(&mut self, v: u32) {
        self.tagged(app::ENUMERATED, false, &unsigned_bytes(v as u64));
    }

    pub fn app_object_id(&mut self, oid: ObjectId) {
        self.tagged(app::OBJECT_ID, false, &oid.to_u32().to_be_bytes());
    }

    pub fn ctx_unsigned(&mut self, number: u8, v: u64) {
        self.tagged(number, true, &unsigned_bytes(v));
    }

    pub fn ctx_enumerated(&mut self, number: u8, v: u32) {
        self.ctx_unsigned(number, v as u64);
    }

    pub fn ctx_object_id(&mut self, number: u8, oid: ObjectId) {
        self.tagged(number, true, &oid.to_u32().to_be_bytes());
    }

    pub fn ctx_bool(&mut self, number: u8, v: bool) {
        self.tagged(number, true, &[v as u8]);
    }

    pub fn ctx_string(&mut self, number: u8, s: &str) {
        let mut content = Vec::with_capacity(s.len() + 1);
        content.push(CHARSET_UTF8);
        content.extend_from_slice(s.as_bytes());
        self.tagged(number, true, &content);
    }

    /// Application-tagged value; arrays are written as a sequence
    pub fn app_value(&mut self, value: &PropertyValue) {
        match value {
            PropertyValue::Null => self.buf.put_u8(app::NULL << 4),
            PropertyValue::Boolean(b) => self.buf.put_u8((app::BOOLEAN << 4) | (*b as u8)),
            PropertyValue::Unsigned(v) => self.app_unsigned(*v),
            PropertyValue::Signed(v) => self.tagged(app::SIGNED, false, &signed_bytes(*v)),
            PropertyValue::Real(v) => self.tagged(app::REAL, false, &v.to_be_bytes()),
            PropertyValue::Double(v) => self.tagged(app::DOUBLE, false, &v.to_be_bytes()),
            PropertyValue::OctetString(v) => self.tagged(app::OCTET_STRING, false, v),
            PropertyValue::CharacterString(s) => {
                let mut content = Vec::with_capacity(s.len() + 1);
                content.push(CHARSET_UTF8);
                content.extend_from_slice(s.as_bytes());
                self.tagged(app::CHARACTER_STRING, false, &content);
            }
            PropertyValue::BitString(bits) => {
                let mut content = vec![0u8; 1 + bits.len().div_ceil(8)];
                content[0] = ((8 - bits.len() % 8) % 8) as u8;
                for (i, bit) in bits.iter().enumerate() {
                    if *bit {
                        content[1 + i / 8] |= 0x80 >> (i % 8);
                    }
                }
                self.tagged(app::BIT_STRING, false, &content);
            }
            PropertyValue::Enumerated(v) => self.app_enumerated(*v),
            PropertyValue::Date(d) => {
                self.tagged(app::DATE, false, &[d.year, d.month, d.day, d.weekday])
            }
            PropertyValue::Time(t) => {
                self.tagged(app::TIME, false, &[t.hour, t.minute, t.second, t.hundredths])
            }
            PropertyValue::ObjectId(oid) => self.app_object_id(*oid),
            PropertyValue::Array(values) => {
                for v in values {
                    self.app_value(v);
                }
            }
        }
    }
}

fn unsigned_bytes(v: u64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
    bytes[skip..].to_vec()
}

fn signed_bytes(v: i64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let mut start = 0;
    // Drop redundant sign-extension bytes
    while start < 7 {
        let (cur, next) = (bytes[start], bytes[start + 1]);
        if (cur == 0x00 && next & 0x80 == 0) || (cur == 0xFF && next & 0x80 != 0) {
            start += 1;
        } else {
            break;
        }
    }
    bytes[start..].to_vec()
}

// ─────────────────────────────────────────────────────────────────────────────
// Reader
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    /// Primitive with content length (or boolean value for application booleans)
    Primitive(usize),
    Opening,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub number: u8,
    pub context: bool,
    pub kind: TagKind,
    /// Octets taken by the tag header itself
    header_len: usize,
}

pub struct TagReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> TagReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn byte_at(&self, at: usize) -> Result<u8, CodecError> {
        self.buf.get(at).copied().ok_or(CodecError::Truncated(at))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(len).ok_or(CodecError::Truncated(self.pos))?;
        let slice = self.buf.get(self.pos..end).ok_or(CodecError::Truncated(self.pos))?;
        self.pos = end;
        Ok(slice)
    }

    pub fn peek(&self) -> Result<Option<Tag>, CodecError> {
        if self.is_empty() {
            return Ok(None);
        }
        let mut at = self.pos;
        let first = self.byte_at(at)?;
        at += 1;

        let context = first & 0x08 != 0;
        let mut number = first >> 4;
        if number == 0x0F {
            number = self.byte_at(at)?;
            at += 1;
        }

        let lvt = first & 0x07;
        let kind = match lvt {
            6 if context => TagKind::Opening,
            7 if context => TagKind::Closing,
            5 => {
                let ext = self.byte_at(at)?;
                at += 1;
                let len = match ext {
                    254 => {
                        let len = u16::from_be_bytes([self.byte_at(at)?, self.byte_at(at + 1)?]);
                        at += 2;
                        len as usize
                    }
                    255 => {
                        let len = u32::from_be_bytes([
                            self.byte_at(at)?,
                            self.byte_at(at + 1)?,
                            self.byte_at(at + 2)?,
                            self.byte_at(at + 3)?,
                        ]);
                        at += 4;
                        len as usize
                    }
                    short => short as usize,
                };
                TagKind::Primitive(len)
            }
            n => TagKind::Primitive(n as usize),
        };

        Ok(Some(Tag {
            number,
            context,
            kind,
            header_len: at - self.pos,
        }))
    }

    fn next_tag(&mut self) -> Result<Tag, CodecError> {
        let tag = self.peek()?.ok_or(CodecError::Truncated(self.pos))?;
        self.pos += tag.header_len;
        Ok(tag)
    }

    fn unexpected(&self, tag: &Tag) -> CodecError {
        CodecError::UnexpectedTag {
            tag: tag.number,
            offset: self.pos,
        }
    }

    /// Peek whether the next tag is context tag `number` (primitive)
    pub fn at_context(&self, number: u8) -> bool {
        matches!(
            self.peek(),
            Ok(Some(Tag { number: n, context: true, kind: TagKind::Primitive(_), .. })) if n == number
        )
    }

    pub fn at_opening(&self, number: u8) -> bool {
        matches!(
            self.peek(),
            Ok(Some(Tag { number: n, context: true, kind: TagKind::Opening, .. })) if n == number
        )
    }

    pub fn at_closing(&self, number: u8) -> bool {
        matches!(
            self.peek(),
            Ok(Some(Tag { number: n, context: true, kind: TagKind::Closing, .. })) if n == number
        )
    }

    pub fn expect_opening(&mut self, number: u8) -> Result<(), CodecError> {
        let tag = self.next_tag()?;
        if tag.context && tag.number == number && tag.kind == TagKind::Opening {
            Ok(())
        } else {
            Err(self.unexpected(&tag))
        }
    }

    pub fn expect_closing(&mut self, number: u8) -> Result<(), CodecError> {
        let tag = self.next_tag()?;
        if tag.context && tag.number == number && tag.kind == TagKind::Closing {
            Ok(())
        } else {
            Err(self.unexpected(&tag))
        }
    }

    /// Content of context tag `number`
    fn context_content(&mut self, number: u8) -> Result<&'a [u8], CodecError> {
        let tag = self.next_tag()?;
        match tag.kind {
            TagKind::Primitive(len) if tag.context && tag.number == number => self.take(len),
            _ => Err(self.unexpected(&tag)),
        }
    }

    pub fn ctx_unsigned(&mut self, number: u8) -> Result<u64, CodecError> {
        let content = self.context_content(number)?;
        decode_unsigned(content, self.pos)
    }

    pub fn ctx_u32(&mut self, number: u8) -> Result<u32, CodecError> {
        let v = self.ctx_unsigned(number)?;
        u32::try_from(v).map_err(|_| CodecError::InvalidValue(format!("{} exceeds u32", v)))
    }

    pub fn opt_ctx_u32(&mut self, number: u8) -> Result<Option<u32>, CodecError> {
        if self.at_context(number) {
            self.ctx_u32(number).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn ctx_object_id(&mut self, number: u8) -> Result<ObjectId, CodecError> {
        let content = self.context_content(number)?;
        object_id(content, self.pos)
    }

    pub fn ctx_bool(&mut self, number: u8) -> Result<bool, CodecError> {
        let content = self.context_content(number)?;
        Ok(content.first().copied().unwrap_or(0) != 0)
    }

    pub fn ctx_string(&mut self, number: u8) -> Result<String, CodecError> {
        let content = self.context_content(number)?;
        character_string(content)
    }

    /// Skip a constructed context value including its opening/closing tags
    pub fn skip_constructed(&mut self, number: u8) -> Result<(), CodecError> {
        self.expect_opening(number)?;
        let mut depth = 1usize;
        while depth > 0 {
            let tag = self.next_tag()?;
            match tag.kind {
                TagKind::Opening => depth += 1,
                TagKind::Closing => depth -= 1,
                TagKind::Primitive(len) => {
                    if !(tag.number == app::BOOLEAN && !tag.context) {
                        self.take(len)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Application-tagged values up to closing tag `number`.
    ///
    /// A single value is returned as-is, several as an array.
    pub fn values_until_closing(&mut self, number: u8) -> Result<PropertyValue, CodecError> {
        let mut values = Vec::new();
        while !self.at_closing(number) {
            values.push(self.app_value()?);
        }
        self.expect_closing(number)?;
        Ok(if values.len() == 1 {
            values.remove(0)
        } else {
            PropertyValue::Array(values)
        })
    }

    pub fn app_unsigned(&mut self) -> Result<u64, CodecError> {
        match self.app_value()? {
            PropertyValue::Unsigned(v) => Ok(v),
            other => Err(CodecError::InvalidValue(format!("expected unsigned, got {:?}", other))),
        }
    }

    pub fn app_enumerated(&mut self) -> Result<u32, CodecError> {
        match self.app_value()? {
            PropertyValue::Enumerated(v) => Ok(v),
            other => Err(CodecError::InvalidValue(format!(
                "expected enumerated, got {:?}",
                other
            ))),
        }
    }

    pub fn app_object_id(&mut self) -> Result<ObjectId, CodecError> {
        match self.app_value()? {
            PropertyValue::ObjectId(oid) => Ok(oid),
            other => Err(CodecError::InvalidValue(format!(
                "expected object identifier, got {:?}",
                other
            ))),
        }
    }

    pub fn app_value(&mut self) -> Result<PropertyValue, CodecError> {
        let tag = self.next_tag()?;
        let len = match tag.kind {
            TagKind::Primitive(len) if !tag.context => len,
            _ => return Err(self.unexpected(&tag)),
        };
        if tag.number == app::BOOLEAN {
            return Ok(PropertyValue::Boolean(len != 0));
        }

        let offset = self.pos;
        let content = self.take(len)?;
        let value = match tag.number {
            app::NULL => PropertyValue::Null,
            app::UNSIGNED => PropertyValue::Unsigned(decode_unsigned(content, offset)?),
            app::SIGNED => PropertyValue::Signed(decode_signed(content, offset)?),
            app::REAL => {
                let raw: [u8; 4] = content
                    .try_into()
                    .map_err(|_| CodecError::InvalidValue("real must be 4 octets".into()))?;
                PropertyValue::Real(f32::from_be_bytes(raw))
            }
            app::DOUBLE => {
                let raw: [u8; 8] = content
                    .try_into()
                    .map_err(|_| CodecError::InvalidValue("double must be 8 octets".into()))?;
                PropertyValue::Double(f64::from_be_bytes(raw))
            }
            app::OCTET_STRING => PropertyValue::OctetString(content.to_vec()),
            app::CHARACTER_STRING => PropertyValue::CharacterString(character_string(content)?),
            app::BIT_STRING => {
                let (unused, data) = content
                    .split_first()
                    .ok_or(CodecError::Truncated(offset))?;
                let total = (data.len() * 8).saturating_sub(*unused as usize);
                let bits = (0..total)
                    .map(|i| data[i / 8] & (0x80 >> (i % 8)) != 0)
                    .collect();
                PropertyValue::BitString(bits)
            }
            app::ENUMERATED => {
                let v = decode_unsigned(content, offset)?;
                PropertyValue::Enumerated(
                    u32::try_from(v).map_err(|_| CodecError::InvalidValue("enumerated overflow".into()))?,
                )
            }
            app::DATE => match content {
                [year, month, day, weekday] => PropertyValue::Date(Date {
                    year: *year,
                    month: *month,
                    day: *day,
                    weekday: *weekday,
                }),
                _ => return Err(CodecError::InvalidValue("date must be 4 octets".into())),
            },
            app::TIME => match content {
                [hour, minute, second, hundredths] => PropertyValue::Time(Time {
                    hour: *hour,
                    minute: *minute,
                    second: *second,
                    hundredths: *hundredths,
                }),
                _ => return Err(CodecError::InvalidValue("time must be 4 octets".into())),
            },
            app::OBJECT_ID => PropertyValue::ObjectId(object_id(content, offset)?),
            other => {
                return Err(CodecError::UnexpectedTag {
                    tag: other,
                    offset,
                });
            }
        };
        Ok(value)
    }
}

fn decode_unsigned(content: &[u8], offset: usize) -> Result<u64, CodecError> {
    if content.is_empty() || content.len() > 8 {
        return Err(CodecError::InvalidValue(format!(
            "unsigned of {} octets at {}",
            content.len(),
            offset
        )));
    }
    Ok(content.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
}

fn decode_signed(content: &[u8], offset: usize) -> Result<i64, CodecError> {
    if content.is_empty() || content.len() > 8 {
        return Err(CodecError::InvalidValue(format!(
            "signed of {} octets at {}",
            content.len(),
            offset
        )));
    }
    let fill = if content[0] & 0x80 != 0 { 0xFF } else { 0x00 };
    let mut raw = [fill; 8];
    raw[8 - content.len()..].copy_from_slice(content);
    Ok(i64::from_be_bytes(raw))
}

fn object_id(content: &[u8], offset: usize) -> Result<ObjectId, CodecError> {
    let raw: [u8; 4] = content
        .try_into()
        .map_err(|_| CodecError::InvalidValue(format!("object identifier at {}", offset)))?;
    Ok(ObjectId::from_u32(u32::from_be_bytes(raw)))
}

fn character_string(content: &[u8]) -> Result<String, CodecError> {
    match content.split_first() {
        None => Ok(String::new()),
        Some((&CHARSET_UTF8, text)) => String::from_utf8(text.to_vec())
            .map_err(|e| CodecError::InvalidValue(format!("invalid UTF-8: {}", e))),
        // ISO 8859-1 maps directly onto the first 256 code points
        Some((5, text)) => Ok(text.iter().map(|b| *b as char).collect()),
        Some((charset, _)) => Err(CodecError::InvalidValue(format!(
            "unsupported character set {}",
            charset
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectType;

    fn encode(value: &PropertyValue) -> Vec<u8> {
        let mut buf = BytesMut::new();
        TagWriter::new(&mut buf).app_value(value);
        buf.to_vec()
    }

    #[test]
    fn test_known_encodings() {
        assert_eq!(encode(&PropertyValue::Unsigned(72)), vec![0x21, 0x48]);
        assert_eq!(encode(&PropertyValue::Boolean(true)), vec![0x11]);
        assert_eq!(encode(&PropertyValue::Enumerated(1)), vec![0x91, 0x01]);
        assert_eq!(
            encode(&PropertyValue::Real(72.0)),
            vec![0x44, 0x42, 0x90, 0x00, 0x00]
        );
        assert_eq!(
            encode(&PropertyValue::ObjectId(ObjectId::new(ObjectType::AnalogInput, 1))),
            vec![0xC4, 0x00, 0x00, 0x00, 0x01]
        );
        assert_eq!(encode(&PropertyValue::Signed(-1)), vec![0x31, 0xFF]);
        assert_eq!(encode(&PropertyValue::Signed(128)), vec![0x32, 0x00, 0x80]);
    }

    #[test]
    fn test_extended_length_string() {
        let text = "a".repeat(300);
        let bytes = encode(&PropertyValue::CharacterString(text.clone()));
        assert_eq!(&bytes[..4], &[0x75, 254, 0x01, 0x2D]);

        let mut reader = TagReader::new(&bytes);
        assert_eq!(reader.app_value().unwrap(), PropertyValue::CharacterString(text));
        assert!(reader.is_empty());
    }

    #[test]
    fn test_bit_string_decode() {
        let bytes = encode(&PropertyValue::BitString(vec![true, false, false, true]));
        assert_eq!(bytes, vec![0x82, 0x04, 0x90]);
        let mut reader = TagReader::new(&bytes);
        assert_eq!(
            reader.app_value().unwrap(),
            PropertyValue::BitString(vec![true, false, false, true])
        );
    }

    #[test]
    fn test_truncated_value_is_error() {
        let mut reader = TagReader::new(&[0x44, 0x42, 0x90]);
        assert!(matches!(reader.app_value(), Err(CodecError::Truncated(_))));
    }

    #[test]
    fn test_skip_constructed() {
        let mut buf = BytesMut::new();
        let mut w = TagWriter::new(&mut buf);
        w.opening(3);
        w.opening(2);
        w.app_value(&PropertyValue::Boolean(false));
        w.closing(2);
        w.ctx_unsigned(1, 500);
        w.closing(3);
        w.ctx_unsigned(4, 9);

        let mut reader = TagReader::new(&buf);
        reader.skip_constructed(3).unwrap();
        assert_eq!(reader.ctx_u32(4).unwrap(), 9);
    }
}
