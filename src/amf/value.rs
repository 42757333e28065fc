//! AMF value types

use std::collections::HashMap;

/// Decoded AMF value
///
/// Covers the AMF0 types RTMP commands actually use. Keys are always
/// strings in AMF.
#[derive(Debug, Clone, PartialEq)]
pub enum AmfValue {
    /// Null value (marker 0x05)
    Null,

    /// Undefined value (marker 0x06)
    Undefined,

    /// Boolean (marker 0x01)
    Boolean(bool),

    /// IEEE 754 double (marker 0x00)
    Number(f64),

    /// UTF-8 string (markers 0x02 and 0x0C)
    String(String),

    /// Dense array (marker 0x0A)
    Array(Vec<AmfValue>),

    /// Anonymous object (marker 0x03)
    Object(HashMap<String, AmfValue>),

    /// Associative array (marker 0x08); OBS sends onMetaData this way
    EcmaArray(HashMap<String, AmfValue>),

    /// Date as milliseconds since the Unix epoch (marker 0x0B)
    Date(f64),
}

impl AmfValue {
    /// Try to get this value as a string reference
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmfValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AmfValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Try to get this value as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AmfValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get this value as a key-value map
    pub fn as_object(&self) -> Option<&HashMap<String, AmfValue>> {
        match self {
            AmfValue::Object(m) => Some(m),
            AmfValue::EcmaArray(m) => Some(m),
            _ => None,
        }
    }

    /// Check if this value is null or undefined
    pub fn is_null_or_undefined(&self) -> bool {
        matches!(self, AmfValue::Null | AmfValue::Undefined)
    }

    /// Get a property from an object value
    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        self.as_object()?.get(key)
    }

    /// Get a string property from an object value
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    /// Get a number property from an object value
    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_number()
    }
}

impl Default for AmfValue {
    fn default() -> Self {
        AmfValue::Null
    }
}

impl From<bool> for AmfValue {
    fn from(v: bool) -> Self {
        AmfValue::Boolean(v)
    }
}

impl From<f64> for AmfValue {
    fn from(v: f64) -> Self {
        AmfValue::Number(v)
    }
}

impl From<u32> for AmfValue {
    fn from(v: u32) -> Self {
        AmfValue::Number(v as f64)
    }
}

impl From<String> for AmfValue {
    fn from(v: String) -> Self {
        AmfValue::String(v)
    }
}

impl From<&str> for AmfValue {
    fn from(v: &str) -> Self {
        AmfValue::String(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_accessors() {
        let s = AmfValue::String("test".into());
        assert_eq!(s.as_str(), Some("test"));
        assert_eq!(s.as_number(), None);

        let n = AmfValue::Number(42.0);
        assert_eq!(n.as_number(), Some(42.0));
        assert_eq!(n.as_str(), None);

        let mut obj = HashMap::new();
        obj.insert("key".to_string(), AmfValue::String("value".into()));
        let o = AmfValue::Object(obj);
        assert_eq!(o.get_string("key"), Some("value"));
        assert_eq!(o.get_number("key"), None);
    }

    #[test]
    fn test_ecma_array_is_object() {
        let mut map = HashMap::new();
        map.insert("width".to_string(), AmfValue::Number(1920.0));
        let arr = AmfValue::EcmaArray(map);
        assert_eq!(arr.get_number("width"), Some(1920.0));
    }

    #[test]
    fn test_from_conversions() {
        let v: AmfValue = "test".into();
        assert!(matches!(v, AmfValue::String(_)));

        let v: AmfValue = 42.0.into();
        assert!(matches!(v, AmfValue::Number(_)));

        let v: AmfValue = true.into();
        assert!(matches!(v, AmfValue::Boolean(true)));
    }
}
