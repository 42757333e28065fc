//! AMF0 encoder and decoder
//!
//! Type markers:
//! ```text
//! 0x00 Number (IEEE 754 double)    0x08 ECMA Array
//! 0x01 Boolean                     0x09 Object End (0x000009)
//! 0x02 String (16-bit length)      0x0A Strict Array
//! 0x03 Object                      0x0B Date
//! 0x05 Null                        0x0C Long String (32-bit length)
//! 0x06 Undefined
//! ```
//!
//! The decoder defaults to lenient mode: some encoders omit the object end
//! marker at the end of a message, so an empty key at end-of-buffer is
//! treated as object end.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::value::AmfValue;
use crate::error::AmfError;

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_DATE: u8 = 0x0B;
const MARKER_LONG_STRING: u8 = 0x0C;

/// Maximum nesting depth for objects/arrays
const MAX_NESTING_DEPTH: usize = 64;

/// AMF0 decoder
pub struct Amf0Decoder {
    lenient: bool,
    depth: usize,
}

impl Amf0Decoder {
    pub fn new() -> Self {
        Self { lenient: true, depth: 0 }
    }

    /// Create decoder with explicit lenient mode setting
    pub fn with_lenient(lenient: bool) -> Self {
        Self { lenient, depth: 0 }
    }

    /// Decode a single AMF0 value from the buffer
    pub fn decode(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if buf.is_empty() {
            return Err(AmfError::UnexpectedEof);
        }

        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            self.depth -= 1;
            return Err(AmfError::NestingTooDeep);
        }

        let marker = buf.get_u8();
        let result = self.decode_value(marker, buf);
        self.depth -= 1;
        result
    }

    /// Decode values until the buffer is exhausted
    pub fn decode_all(&mut self, buf: &mut Bytes) -> Result<Vec<AmfValue>, AmfError> {
        let mut values = Vec::new();
        while buf.has_remaining() {
            values.push(self.decode(buf)?);
        }
        Ok(values)
    }

    fn decode_value(&mut self, marker: u8, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        match marker {
            MARKER_NUMBER => {
                if buf.remaining() < 8 {
                    return Err(AmfError::UnexpectedEof);
                }
                Ok(AmfValue::Number(buf.get_f64()))
            }
            MARKER_BOOLEAN => {
                if buf.is_empty() {
                    return Err(AmfError::UnexpectedEof);
                }
                Ok(AmfValue::Boolean(buf.get_u8() != 0))
            }
            MARKER_STRING => Ok(AmfValue::String(read_utf8(buf)?)),
            MARKER_LONG_STRING => Ok(AmfValue::String(read_utf8_long(buf)?)),
            MARKER_OBJECT => {
                let props = self.decode_properties(buf)?;
                Ok(AmfValue::Object(props))
            }
            MARKER_NULL => Ok(AmfValue::Null),
            MARKER_UNDEFINED => Ok(AmfValue::Undefined),
            MARKER_ECMA_ARRAY => {
                if buf.remaining() < 4 {
                    return Err(AmfError::UnexpectedEof);
                }
                // count is a hint only; the array still ends with 0x000009
                let _count = buf.get_u32();
                let props = self.decode_properties(buf)?;
                Ok(AmfValue::EcmaArray(props))
            }
            MARKER_STRICT_ARRAY => {
                if buf.remaining() < 4 {
                    return Err(AmfError::UnexpectedEof);
                }
                let count = buf.get_u32() as usize;
                let mut elements = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    elements.push(self.decode(buf)?);
                }
                Ok(AmfValue::Array(elements))
            }
            MARKER_DATE => {
                if buf.remaining() < 10 {
                    return Err(AmfError::UnexpectedEof);
                }
                let timestamp = buf.get_f64();
                let _timezone = buf.get_i16();
                Ok(AmfValue::Date(timestamp))
            }
            _ => {
                if self.lenient {
                    Ok(AmfValue::Undefined)
                } else {
                    Err(AmfError::UnknownMarker(marker))
                }
            }
        }
    }

    /// Decode key-value pairs up to the object end marker
    fn decode_properties(&mut self, buf: &mut Bytes) -> Result<HashMap<String, AmfValue>, AmfError> {
        let mut properties = HashMap::new();

        loop {
            let key = read_utf8(buf)?;

            if key.is_empty() {
                if buf.is_empty() {
                    if self.lenient {
                        break;
                    }
                    return Err(AmfError::UnexpectedEof);
                }
                let end_marker = buf.get_u8();
                if end_marker == MARKER_OBJECT_END || self.lenient {
                    break;
                }
                return Err(AmfError::InvalidObjectEnd);
            }

            let value = self.decode(buf)?;
            properties.insert(key, value);
        }

        Ok(properties)
    }
}

impl Default for Amf0Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Read UTF-8 string with 16-bit length prefix
fn read_utf8(buf: &mut Bytes) -> Result<String, AmfError> {
    if buf.remaining() < 2 {
        return Err(AmfError::UnexpectedEof);
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(AmfError::UnexpectedEof);
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

/// Read UTF-8 string with 32-bit length prefix
fn read_utf8_long(buf: &mut Bytes) -> Result<String, AmfError> {
    if buf.remaining() < 4 {
        return Err(AmfError::UnexpectedEof);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(AmfError::UnexpectedEof);
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

/// AMF0 encoder
pub struct Amf0Encoder {
    buf: BytesMut,
}

impl Amf0Encoder {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(256) }
    }

    /// Take the encoded bytes, resetting the encoder
    pub fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Encode a single AMF0 value
    pub fn encode(&mut self, value: &AmfValue) {
        match value {
            AmfValue::Null => {
                self.buf.put_u8(MARKER_NULL);
            }
            AmfValue::Undefined => {
                self.buf.put_u8(MARKER_UNDEFINED);
            }
            AmfValue::Boolean(b) => {
                self.buf.put_u8(MARKER_BOOLEAN);
                self.buf.put_u8(if *b { 1 } else { 0 });
            }
            AmfValue::Number(n) => {
                self.buf.put_u8(MARKER_NUMBER);
                self.buf.put_f64(*n);
            }
            AmfValue::String(s) => {
                if s.len() > 0xFFFF {
                    self.buf.put_u8(MARKER_LONG_STRING);
                    self.buf.put_u32(s.len() as u32);
                } else {
                    self.buf.put_u8(MARKER_STRING);
                    self.buf.put_u16(s.len() as u16);
                }
                self.buf.put_slice(s.as_bytes());
            }
            AmfValue::Object(props) => {
                self.buf.put_u8(MARKER_OBJECT);
                self.encode_properties(props);
            }
            AmfValue::EcmaArray(props) => {
                self.buf.put_u8(MARKER_ECMA_ARRAY);
                self.buf.put_u32(props.len() as u32);
                self.encode_properties(props);
            }
            AmfValue::Array(elements) => {
                self.buf.put_u8(MARKER_STRICT_ARRAY);
                self.buf.put_u32(elements.len() as u32);
                for elem in elements {
                    self.encode(elem);
                }
            }
            AmfValue::Date(timestamp) => {
                self.buf.put_u8(MARKER_DATE);
                self.buf.put_f64(*timestamp);
                self.buf.put_i16(0);
            }
        }
    }

    /// Encode multiple values
    pub fn encode_all(&mut self, values: &[AmfValue]) {
        for value in values {
            self.encode(value);
        }
    }

    fn encode_properties(&mut self, props: &HashMap<String, AmfValue>) {
        for (key, val) in props {
            self.write_utf8(key);
            self.encode(val);
        }
        self.buf.put_u16(0);
        self.buf.put_u8(MARKER_OBJECT_END);
    }

    /// Write UTF-8 string with 16-bit length prefix (no type marker)
    fn write_utf8(&mut self, s: &str) {
        let len = s.len().min(0xFFFF);
        self.buf.put_u16(len as u16);
        self.buf.put_slice(&s.as_bytes()[..len]);
    }
}

impl Default for Amf0Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a single value
pub fn encode(value: &AmfValue) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode(value);
    encoder.finish()
}

/// Encode multiple values
pub fn encode_all(values: &[AmfValue]) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode_all(values);
    encoder.finish()
}

/// Decode a single value
pub fn decode(data: &[u8]) -> Result<AmfValue, AmfError> {
    let mut decoder = Amf0Decoder::new();
    let mut buf = Bytes::copy_from_slice(data);
    decoder.decode(&mut buf)
}

/// Decode all values
pub fn decode_all(data: &[u8]) -> Result<Vec<AmfValue>, AmfError> {
    let mut decoder = Amf0Decoder::new();
    let mut buf = Bytes::copy_from_slice(data);
    decoder.decode_all(&mut buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_roundtrip() {
        let value = AmfValue::Number(42.5);
        let encoded = encode(&value);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_string_roundtrip() {
        let value = AmfValue::String("hello world".into());
        let encoded = encode(&value);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_boolean_and_null_roundtrip() {
        for value in [AmfValue::Boolean(true), AmfValue::Boolean(false), AmfValue::Null] {
            let encoded = encode(&value);
            assert_eq!(decode(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn test_object_roundtrip() {
        let mut props = HashMap::new();
        props.insert("name".to_string(), AmfValue::String("test".into()));
        props.insert("value".to_string(), AmfValue::Number(123.0));
        let value = AmfValue::Object(props);

        let encoded = encode(&value);
        let decoded = decode(&encoded).unwrap();

        if let (AmfValue::Object(orig), AmfValue::Object(dec)) = (&value, &decoded) {
            assert_eq!(orig.len(), dec.len());
            for (k, v) in orig {
                assert_eq!(dec.get(k), Some(v));
            }
        } else {
            panic!("Expected objects");
        }
    }

    #[test]
    fn test_connect_arguments_roundtrip() {
        // The key-value map of a connect command object must survive a
        // round trip exactly.
        let mut obj = HashMap::new();
        obj.insert("app".to_string(), AmfValue::String("live".into()));
        obj.insert("tcUrl".to_string(), AmfValue::String("rtmp://host:1935/live".into()));
        obj.insert("flashVer".to_string(), AmfValue::String("FMLE/3.0".into()));
        obj.insert("fpad".to_string(), AmfValue::Boolean(false));
        obj.insert("audioCodecs".to_string(), AmfValue::Number(3191.0));
        obj.insert("videoCodecs".to_string(), AmfValue::Number(252.0));
        obj.insert("objectEncoding".to_string(), AmfValue::Number(0.0));

        let values = vec![
            AmfValue::String("connect".into()),
            AmfValue::Number(1.0),
            AmfValue::Object(obj.clone()),
        ];

        let encoded = encode_all(&values);
        let decoded = decode_all(&encoded).unwrap();

        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].as_str(), Some("connect"));
        assert_eq!(decoded[1].as_number(), Some(1.0));
        let dec_obj = decoded[2].as_object().unwrap();
        assert_eq!(dec_obj.len(), obj.len());
        for (k, v) in &obj {
            assert_eq!(dec_obj.get(k), Some(v));
        }
    }

    #[test]
    fn test_ecma_array_roundtrip() {
        let mut props = HashMap::new();
        props.insert("duration".to_string(), AmfValue::Number(0.0));
        props.insert("encoder".to_string(), AmfValue::String("obs".into()));
        let value = AmfValue::EcmaArray(props.clone());

        let encoded = encode(&value);
        match decode(&encoded).unwrap() {
            AmfValue::EcmaArray(dec) => assert_eq!(dec, props),
            other => panic!("expected ecma array, got {:?}", other),
        }
    }

    #[test]
    fn test_array_roundtrip() {
        let value = AmfValue::Array(vec![
            AmfValue::Number(1.0),
            AmfValue::String("two".into()),
            AmfValue::Boolean(true),
        ]);
        let encoded = encode(&value);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_long_string() {
        let long_str = "x".repeat(70000);
        let value = AmfValue::String(long_str.clone());
        let encoded = encode(&value);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, AmfValue::String(long_str));
    }

    #[test]
    fn test_lenient_missing_object_end() {
        // Object body without the trailing 0x00 0x00 0x09, as OBS
        // occasionally emits at end of message.
        let mut enc = Amf0Encoder::new();
        enc.buf.put_u8(MARKER_OBJECT);
        enc.write_utf8("app");
        enc.encode(&AmfValue::String("live".into()));
        enc.buf.put_u16(0); // empty key, then buffer ends
        let data = enc.finish();

        let decoded = decode(&data).unwrap();
        assert_eq!(decoded.get_string("app"), Some("live"));
    }

    #[test]
    fn test_truncated_number_fails() {
        let data = [MARKER_NUMBER, 0x3F, 0xF0];
        assert!(matches!(decode(&data), Err(AmfError::UnexpectedEof)));
    }

    #[test]
    fn test_strict_mode_unknown_marker() {
        let mut decoder = Amf0Decoder::with_lenient(false);
        let mut buf = Bytes::from_static(&[0x42]);
        assert!(matches!(decoder.decode(&mut buf), Err(AmfError::UnknownMarker(0x42))));
    }
}
