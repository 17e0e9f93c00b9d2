//! AMF0 typed values as used by RTMP command and data messages.

use bytes::Bytes;
use shared::error::{Error, Result};

use crate::reader::{BytesReader, BytesWriter};

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

/// A decoded AMF0 value.
///
/// Objects and ECMA arrays keep their properties in wire order; RTMP
/// command handling looks keys up linearly, which is fine at the sizes
/// connect/publish metadata actually has.
#[derive(Debug, Clone, PartialEq)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Vec<(String, Amf0Value)>),
    Null,
    Undefined,
    EcmaArray(Vec<(String, Amf0Value)>),
    StrictArray(Vec<Amf0Value>),
    Date { unix_ms: f64, timezone: i16 },
}

impl Amf0Value {
    pub fn as_number(&self) -> Result<f64> {
        match self {
            Amf0Value::Number(n) => Ok(*n),
            _ => Err(Error::AmfUnexpectedType("number")),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Amf0Value::String(s) => Ok(s),
            _ => Err(Error::AmfUnexpectedType("string")),
        }
    }

    /// Property lookup on objects and ECMA arrays.
    pub fn get(&self, key: &str) -> Option<&Amf0Value> {
        match self {
            Amf0Value::Object(props) | Amf0Value::EcmaArray(props) => {
                props.iter().find(|(k, _)| k == key).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    pub fn object(props: Vec<(&str, Amf0Value)>) -> Self {
        Amf0Value::Object(props.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }
}

/// Reads one AMF0 value off the reader.
pub fn read_value(r: &mut BytesReader<'_>) -> Result<Amf0Value> {
    let marker = r.read_u8().map_err(|_| Error::AmfTruncated)?;
    read_value_body(r, marker)
}

fn read_value_body(r: &mut BytesReader<'_>, marker: u8) -> Result<Amf0Value> {
    match marker {
        MARKER_NUMBER => Ok(Amf0Value::Number(
            r.read_f64().map_err(|_| Error::AmfTruncated)?,
        )),
        MARKER_BOOLEAN => Ok(Amf0Value::Boolean(
            r.read_u8().map_err(|_| Error::AmfTruncated)? != 0,
        )),
        MARKER_STRING => Ok(Amf0Value::String(read_utf8(r)?)),
        MARKER_OBJECT => Ok(Amf0Value::Object(read_properties(r)?)),
        MARKER_NULL => Ok(Amf0Value::Null),
        MARKER_UNDEFINED => Ok(Amf0Value::Undefined),
        MARKER_ECMA_ARRAY => {
            // The declared count is advisory; properties still end with the
            // object end marker.
            r.skip(4).map_err(|_| Error::AmfTruncated)?;
            Ok(Amf0Value::EcmaArray(read_properties(r)?))
        }
        MARKER_STRICT_ARRAY => {
            let count = r.read_u32().map_err(|_| Error::AmfTruncated)?;
            let mut items = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                items.push(read_value(r)?);
            }
            Ok(Amf0Value::StrictArray(items))
        }
        MARKER_DATE => {
            let unix_ms = r.read_f64().map_err(|_| Error::AmfTruncated)?;
            let timezone = r.read_u16().map_err(|_| Error::AmfTruncated)? as i16;
            Ok(Amf0Value::Date { unix_ms, timezone })
        }
        other => Err(Error::UnknownAmfMarker(other)),
    }
}

fn read_utf8(r: &mut BytesReader<'_>) -> Result<String> {
    let len = r.read_u16().map_err(|_| Error::AmfTruncated)? as usize;
    r.read_string(len).map_err(|_| Error::AmfTruncated)
}

fn read_properties(r: &mut BytesReader<'_>) -> Result<Vec<(String, Amf0Value)>> {
    let mut props = Vec::new();
    loop {
        let key = read_utf8(r)?;
        let marker = r.read_u8().map_err(|_| Error::AmfMissingObjectEnd)?;
        if marker == MARKER_OBJECT_END {
            if !key.is_empty() {
                return Err(Error::AmfMissingObjectEnd);
            }
            return Ok(props);
        }
        props.push((key, read_value_body(r, marker)?));
    }
}

/// Writes one AMF0 value.
pub fn write_value(w: &mut BytesWriter, value: &Amf0Value) {
    match value {
        Amf0Value::Number(n) => {
            w.write_u8(MARKER_NUMBER);
            w.write_f64(*n);
        }
        Amf0Value::Boolean(b) => {
            w.write_u8(MARKER_BOOLEAN);
            w.write_u8(*b as u8);
        }
        Amf0Value::String(s) => {
            w.write_u8(MARKER_STRING);
            write_utf8(w, s);
        }
        Amf0Value::Object(props) => {
            w.write_u8(MARKER_OBJECT);
            write_properties(w, props);
        }
        Amf0Value::Null => w.write_u8(MARKER_NULL),
        Amf0Value::Undefined => w.write_u8(MARKER_UNDEFINED),
        Amf0Value::EcmaArray(props) => {
            w.write_u8(MARKER_ECMA_ARRAY);
            w.write_u32(props.len() as u32);
            write_properties(w, props);
        }
        Amf0Value::StrictArray(items) => {
            w.write_u8(MARKER_STRICT_ARRAY);
            w.write_u32(items.len() as u32);
            for item in items {
                write_value(w, item);
            }
        }
        Amf0Value::Date { unix_ms, timezone } => {
            w.write_u8(MARKER_DATE);
            w.write_f64(*unix_ms);
            w.write_u16(*timezone as u16);
        }
    }
}

fn write_utf8(w: &mut BytesWriter, s: &str) {
    w.write_u16(s.len() as u16);
    w.write_bytes(s.as_bytes());
}

fn write_properties(w: &mut BytesWriter, props: &[(String, Amf0Value)]) {
    for (key, value) in props {
        write_utf8(w, key);
        write_value(w, value);
    }
    w.write_u16(0);
    w.write_u8(MARKER_OBJECT_END);
}

/// Reads values until the buffer is exhausted, as RTMP command payloads
/// are a plain concatenation.
pub fn read_all(payload: &[u8]) -> Result<Vec<Amf0Value>> {
    let mut r = BytesReader::new(payload);
    let mut values = Vec::new();
    while !r.is_empty() {
        values.push(read_value(&mut r)?);
    }
    Ok(values)
}

/// Encodes a value sequence into one payload.
pub fn write_all(values: &[Amf0Value]) -> Bytes {
    let mut w = BytesWriter::new();
    for v in values {
        write_value(&mut w, v);
    }
    w.finish()
}
