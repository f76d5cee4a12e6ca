use crate::{
    types::DecodeError,
    wire::{decode_double, decode_int_be, encode_double, encode_int_be},
};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use std::{collections::BTreeMap, fmt};

/// Typed-value wire versions. Version 0 is fully supported; version 3 is
/// detected and rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Amf0,
    Amf3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
enum Marker {
    Number = 0x00,
    Boolean = 0x01,
    String = 0x02,
    Object = 0x03,
    Null = 0x05,
    Undefined = 0x06,
    EcmaArray = 0x08,
    ObjectEnd = 0x09,
    StrictArray = 0x0a,
    Date = 0x0b,
    LongString = 0x0c,
    XmlDocument = 0x0f,
    TypedObject = 0x10,
    SwitchToAmf3 = 0x11,
}

/// A self-describing typed value as used inside command messages.
///
/// Object and ECMA array bodies keep their keys ordered so a decoded value
/// re-encodes deterministically.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(BTreeMap<String, Value>),
    Null,
    Undefined,
    EcmaArray(BTreeMap<String, Value>),
    StrictArray(Vec<Value>),
    Date { ms: f64, timezone: i16 },
    XmlDocument(String),
}

impl Value {
    pub fn new_object() -> Self {
        Value::Object(BTreeMap::new())
    }

    /// Inserts into an Object or ECMA array; any other variant becomes an
    /// Object first.
    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        match self {
            Value::Object(map) | Value::EcmaArray(map) => {
                map.insert(key.to_owned(), value.into());
            }
            _ => {
                let mut map = BTreeMap::new();
                map.insert(key.to_owned(), value.into());
                *self = Value::Object(map);
            }
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) | Value::XmlDocument(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) | Value::EcmaArray(map) => Some(map),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|map| map.get(key))
    }

    pub fn is_map(&self) -> bool {
        matches!(self, Value::Object(_) | Value::EcmaArray(_))
    }

    /// Decodes one typed value, returning it and the number of bytes
    /// consumed. A failure never consumes anything: the caller's offset is
    /// unchanged and the whole packet is failed.
    pub fn decode(version: Version, buffer: &[u8], offset: usize) -> Result<(Value, usize), DecodeError> {
        if version == Version::Amf3 {
            return Err(DecodeError::Unsupported("AMF3"));
        }

        let marker_byte = *buffer.get(offset).ok_or(DecodeError::ShortRead)?;
        let marker = Marker::from_u8(marker_byte).ok_or(DecodeError::UnknownMarker(marker_byte))?;
        let body = offset + 1;

        let (value, read) = match marker {
            Marker::Number => {
                let value = decode_double(buffer, body)?;
                (Value::Number(value), 8)
            }
            Marker::Boolean => {
                let byte = *buffer.get(body).ok_or(DecodeError::ShortRead)?;
                (Value::Boolean(byte > 0), 1)
            }
            Marker::String => {
                let (string, read) = read_string(buffer, body)?;
                (Value::String(string), read)
            }
            Marker::Object => {
                let (map, read) = read_object_body(buffer, body)?;
                (Value::Object(map), read)
            }
            Marker::Null => (Value::Null, 0),
            Marker::Undefined => (Value::Undefined, 0),
            Marker::EcmaArray => {
                // The declared count is informational; some peers send zero
                // for non-empty arrays. The ObjectEnd marker terminates.
                let mut read = 4;
                decode_int_be(buffer, body, 4)?;
                let (map, body_read) = read_object_body(buffer, body + read)?;
                read += body_read;
                (Value::EcmaArray(map), read)
            }
            Marker::StrictArray => {
                let count = decode_int_be(buffer, body, 4)? as usize;
                let mut read = 4;
                let mut values = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    let (value, value_read) = Value::decode(version, buffer, body + read)?;
                    read += value_read;
                    values.push(value);
                }
                (Value::StrictArray(values), read)
            }
            Marker::Date => {
                let ms = decode_double(buffer, body)?;
                let timezone = decode_int_be(buffer, body + 8, 2)? as u16 as i16;
                (Value::Date { ms, timezone }, 10)
            }
            Marker::LongString => {
                let (string, read) = read_long_string(buffer, body)?;
                (Value::String(string), read)
            }
            Marker::XmlDocument => {
                let (string, read) = read_long_string(buffer, body)?;
                (Value::XmlDocument(string), read)
            }
            Marker::TypedObject => return Err(DecodeError::Unsupported("typed object")),
            Marker::SwitchToAmf3 => return Err(DecodeError::Unsupported("AMF3")),
            Marker::ObjectEnd => return Err(DecodeError::Malformed("stray object end marker")),
        };

        Ok((value, 1 + read))
    }

    /// Appends the marker and body to `buffer`, returning bytes written.
    pub fn encode(&self, buffer: &mut Vec<u8>) -> usize {
        let start = buffer.len();
        match self {
            Value::Number(value) => {
                buffer.push(Marker::Number as u8);
                encode_double(buffer, *value);
            }
            Value::Boolean(value) => {
                buffer.push(Marker::Boolean as u8);
                buffer.push(u8::from(*value));
            }
            Value::String(value) => {
                // The encoder selects the narrower length form.
                if value.len() <= usize::from(u16::MAX) {
                    buffer.push(Marker::String as u8);
                    write_string(buffer, value);
                } else {
                    buffer.push(Marker::LongString as u8);
                    write_long_string(buffer, value);
                }
            }
            Value::Object(map) => {
                buffer.push(Marker::Object as u8);
                write_object_body(buffer, map);
            }
            Value::Null => buffer.push(Marker::Null as u8),
            Value::Undefined => buffer.push(Marker::Undefined as u8),
            Value::EcmaArray(map) => {
                buffer.push(Marker::EcmaArray as u8);
                encode_int_be(buffer, 4, map.len() as u64);
                write_object_body(buffer, map);
            }
            Value::StrictArray(values) => {
                buffer.push(Marker::StrictArray as u8);
                encode_int_be(buffer, 4, values.len() as u64);
                for value in values {
                    value.encode(buffer);
                }
            }
            Value::Date { ms, timezone } => {
                buffer.push(Marker::Date as u8);
                encode_double(buffer, *ms);
                encode_int_be(buffer, 2, *timezone as u16 as u64);
            }
            Value::XmlDocument(value) => {
                buffer.push(Marker::XmlDocument as u8);
                write_long_string(buffer, value);
            }
        }
        buffer.len() - start
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Number(f64::from(value))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(value) => write!(f, "{}", value),
            Value::Boolean(value) => write!(f, "{}", value),
            Value::String(value) | Value::XmlDocument(value) => f.write_str(value),
            Value::Object(map) | Value::EcmaArray(map) => {
                f.write_str("{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{} = {}", key, value)?;
                }
                f.write_str("}")
            }
            Value::Null => f.write_str("null"),
            Value::Undefined => f.write_str("undefined"),
            Value::StrictArray(values) => {
                f.write_str("[")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", value)?;
                }
                f.write_str("]")
            }
            Value::Date { ms, timezone } => write!(f, "{} +{}", ms, timezone),
        }
    }
}

fn read_string(buffer: &[u8], offset: usize) -> Result<(String, usize), DecodeError> {
    let length = decode_int_be(buffer, offset, 2)? as usize;
    let bytes = buffer
        .get(offset + 2..offset + 2 + length)
        .ok_or(DecodeError::ShortRead)?;
    Ok((String::from_utf8_lossy(bytes).into_owned(), 2 + length))
}

fn read_long_string(buffer: &[u8], offset: usize) -> Result<(String, usize), DecodeError> {
    let length = decode_int_be(buffer, offset, 4)? as usize;
    let bytes = buffer
        .get(offset + 4..offset + 4 + length)
        .ok_or(DecodeError::ShortRead)?;
    Ok((String::from_utf8_lossy(bytes).into_owned(), 4 + length))
}

/// Reads `key, marker+value` pairs until the empty key + ObjectEnd
/// terminator.
fn read_object_body(
    buffer: &[u8],
    offset: usize,
) -> Result<(BTreeMap<String, Value>, usize), DecodeError> {
    let mut map = BTreeMap::new();
    let mut read = 0;
    loop {
        let (key, key_read) = read_string(buffer, offset + read)?;
        read += key_read;

        let marker = *buffer.get(offset + read).ok_or(DecodeError::ShortRead)?;
        if marker == Marker::ObjectEnd as u8 {
            read += 1;
            if !key.is_empty() {
                return Err(DecodeError::Malformed("object end after non-empty key"));
            }
            return Ok((map, read));
        }

        let (value, value_read) = Value::decode(Version::Amf0, buffer, offset + read)?;
        read += value_read;
        map.insert(key, value);
    }
}

fn write_string(buffer: &mut Vec<u8>, value: &str) {
    encode_int_be(buffer, 2, value.len() as u64);
    buffer.extend_from_slice(value.as_bytes());
}

fn write_long_string(buffer: &mut Vec<u8>, value: &str) {
    encode_int_be(buffer, 4, value.len() as u64);
    buffer.extend_from_slice(value.as_bytes());
}

fn write_object_body(buffer: &mut Vec<u8>, map: &BTreeMap<String, Value>) {
    for (key, value) in map {
        write_string(buffer, key);
        value.encode(buffer);
    }
    write_string(buffer, "");
    buffer.push(Marker::ObjectEnd as u8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn round_trip(value: &Value) {
        let mut buffer = Vec::new();
        let written = value.encode(&mut buffer);
        assert_eq!(written, buffer.len());
        let (decoded, read) = Value::decode(Version::Amf0, &buffer, 0).unwrap();
        assert_eq!(read, buffer.len());
        assert_eq!(&decoded, value);
    }

    #[test]
    fn scalar_round_trips() {
        round_trip(&Value::Number(0.0));
        round_trip(&Value::Number(-12.75));
        round_trip(&Value::Boolean(true));
        round_trip(&Value::Boolean(false));
        round_trip(&Value::String(String::new()));
        round_trip(&Value::String("stream name".into()));
        round_trip(&Value::Null);
        round_trip(&Value::Undefined);
        round_trip(&Value::Date {
            ms: 1234567890.0,
            timezone: -120,
        });
        round_trip(&Value::XmlDocument("<x/>".into()));
    }

    #[test]
    fn container_round_trips() {
        round_trip(&Value::Object(btreemap! {
            "app".to_owned() => Value::String("live".into()),
            "capabilities".to_owned() => Value::Number(31.0),
            "nested".to_owned() => Value::Object(btreemap! {
                "deep".to_owned() => Value::Boolean(true),
            }),
        }));
        round_trip(&Value::EcmaArray(btreemap! {
            "width".to_owned() => Value::Number(1920.0),
            "height".to_owned() => Value::Number(1080.0),
        }));
        round_trip(&Value::StrictArray(vec![
            Value::Number(1.0),
            Value::String("two".into()),
            Value::Null,
        ]));
        round_trip(&Value::StrictArray(Vec::new()));
    }

    #[test]
    fn long_string_selected_above_u16_max() {
        let long = "x".repeat(usize::from(u16::MAX) + 1);
        let mut buffer = Vec::new();
        Value::String(long.clone()).encode(&mut buffer);
        assert_eq!(buffer[0], 0x0c);
        let (decoded, _) = Value::decode(Version::Amf0, &buffer, 0).unwrap();
        assert_eq!(decoded, Value::String(long));
    }

    #[test]
    fn ecma_array_accepts_any_declared_count() {
        // One real entry but a declared count of zero.
        let mut buffer = vec![0x08, 0, 0, 0, 0];
        write_string(&mut buffer, "key");
        Value::Number(1.0).encode(&mut buffer);
        write_string(&mut buffer, "");
        buffer.push(0x09);

        let (decoded, read) = Value::decode(Version::Amf0, &buffer, 0).unwrap();
        assert_eq!(read, buffer.len());
        assert_eq!(
            decoded,
            Value::EcmaArray(btreemap! { "key".to_owned() => Value::Number(1.0) })
        );
    }

    #[test]
    fn strict_array_enforces_count() {
        let mut buffer = vec![0x0a, 0, 0, 0, 2];
        Value::Number(1.0).encode(&mut buffer);
        assert_eq!(
            Value::decode(Version::Amf0, &buffer, 0),
            Err(DecodeError::ShortRead)
        );
    }

    #[test]
    fn unsupported_markers_are_hard_failures() {
        assert_eq!(
            Value::decode(Version::Amf0, &[0x10], 0),
            Err(DecodeError::Unsupported("typed object"))
        );
        assert_eq!(
            Value::decode(Version::Amf0, &[0x11], 0),
            Err(DecodeError::Unsupported("AMF3"))
        );
        assert_eq!(
            Value::decode(Version::Amf3, &[0x00], 0),
            Err(DecodeError::Unsupported("AMF3"))
        );
    }

    #[test]
    fn unknown_marker_reported() {
        assert_eq!(
            Value::decode(Version::Amf0, &[0xfe], 0),
            Err(DecodeError::UnknownMarker(0xfe))
        );
    }

    #[test]
    fn truncated_object_is_a_short_read() {
        let mut buffer = Vec::new();
        Value::Object(btreemap! { "a".to_owned() => Value::Number(1.0) }).encode(&mut buffer);
        for len in 1..buffer.len() {
            assert_eq!(
                Value::decode(Version::Amf0, &buffer[..len], 0),
                Err(DecodeError::ShortRead),
                "prefix of {} bytes",
                len
            );
        }
    }
}
