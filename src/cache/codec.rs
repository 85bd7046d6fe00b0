//! Value codec for cache payloads.
//!
//! Values are stored as JSON text whenever they can be represented that
//! way, and as `bincode` otherwise (e.g. maps keyed by tuples, or values
//! holding NaN or infinite floats, which JSON would write as `null`). The tag
//! travels with the payload, so decoding never guesses which form it is
//! looking at.
//!
//! On the wire (Redis) a payload is a single string: `j:<json>` or
//! `b:<base64 bincode>`.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use serde::ser::{self, Serialize, Serializer};

use crate::{MuninnError, Result};

const TEXT_TAG: &str = "j:";
const BINARY_TAG: &str = "b:";

/// An encoded cache payload, tagged with the form it was written in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    Text(String),
    Binary(Vec<u8>),
}

impl Encoded {
    /// Encode a value, preferring JSON text and falling back to binary.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let json = if has_non_finite(value) {
            Err("non-finite float".to_string())
        } else {
            serde_json::to_string(value).map_err(|e| e.to_string())
        };
        match json {
            Ok(text) => Ok(Encoded::Text(text)),
            Err(json_err) => bincode::serde::encode_to_vec(value, bincode::config::standard())
                .map(Encoded::Binary)
                .map_err(|bin_err| {
                    MuninnError::Serialization(format!("json: {json_err}; binary: {bin_err}"))
                }),
        }
    }

    /// Decode into `T` using whichever form the payload carries.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Encoded::Text(text) => Ok(serde_json::from_str(text)?),
            Encoded::Binary(bytes) => {
                let (value, _) =
                    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                        .map_err(|e| MuninnError::Serialization(e.to_string()))?;
                Ok(value)
            }
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Encoded::Text(_))
    }

    /// Payload size in bytes, before any wire encoding.
    pub fn len(&self) -> usize {
        match self {
            Encoded::Text(text) => text.len(),
            Encoded::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Single-string wire form used for Redis values.
    pub fn to_wire(&self) -> String {
        match self {
            Encoded::Text(text) => format!("{TEXT_TAG}{text}"),
            Encoded::Binary(bytes) => format!("{BINARY_TAG}{}", STANDARD.encode(bytes)),
        }
    }

    /// Parse the wire form written by [`Encoded::to_wire`].
    pub fn from_wire(raw: &str) -> Result<Self> {
        if let Some(text) = raw.strip_prefix(TEXT_TAG) {
            Ok(Encoded::Text(text.to_string()))
        } else if let Some(b64) = raw.strip_prefix(BINARY_TAG) {
            STANDARD
                .decode(b64)
                .map(Encoded::Binary)
                .map_err(|e| MuninnError::Serialization(format!("invalid binary payload: {e}")))
        } else {
            Err(MuninnError::Serialization(
                "payload has no codec tag".to_string(),
            ))
        }
    }
}

// ============================================================================
// Non-finite float scan
// ============================================================================

fn has_non_finite<T: Serialize + ?Sized>(value: &T) -> bool {
    matches!(value.serialize(FloatScan), Err(ScanError::NonFinite))
}

/// Walks a value and stops at the first NaN or infinite float.
#[derive(Clone, Copy)]
struct FloatScan;

#[derive(Debug)]
enum ScanError {
    NonFinite,
    Custom(String),
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::NonFinite => f.write_str("non-finite float"),
            ScanError::Custom(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for ScanError {}

impl ser::Error for ScanError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        ScanError::Custom(msg.to_string())
    }
}

type Scan = std::result::Result<(), ScanError>;

fn finite(ok: bool) -> Scan {
    if ok { Ok(()) } else { Err(ScanError::NonFinite) }
}

impl Serializer for FloatScan {
    type Ok = ();
    type Error = ScanError;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_f32(self, v: f32) -> Scan {
        finite(v.is_finite())
    }
    fn serialize_f64(self, v: f64) -> Scan {
        finite(v.is_finite())
    }

    fn serialize_bool(self, _: bool) -> Scan {
        Ok(())
    }
    fn serialize_i8(self, _: i8) -> Scan {
        Ok(())
    }
    fn serialize_i16(self, _: i16) -> Scan {
        Ok(())
    }
    fn serialize_i32(self, _: i32) -> Scan {
        Ok(())
    }
    fn serialize_i64(self, _: i64) -> Scan {
        Ok(())
    }
    fn serialize_i128(self, _: i128) -> Scan {
        Ok(())
    }
    fn serialize_u8(self, _: u8) -> Scan {
        Ok(())
    }
    fn serialize_u16(self, _: u16) -> Scan {
        Ok(())
    }
    fn serialize_u32(self, _: u32) -> Scan {
        Ok(())
    }
    fn serialize_u64(self, _: u64) -> Scan {
        Ok(())
    }
    fn serialize_u128(self, _: u128) -> Scan {
        Ok(())
    }
    fn serialize_char(self, _: char) -> Scan {
        Ok(())
    }
    fn serialize_str(self, _: &str) -> Scan {
        Ok(())
    }
    fn serialize_bytes(self, _: &[u8]) -> Scan {
        Ok(())
    }
    fn serialize_none(self) -> Scan {
        Ok(())
    }
    fn serialize_unit(self) -> Scan {
        Ok(())
    }
    fn serialize_unit_struct(self, _: &'static str) -> Scan {
        Ok(())
    }
    fn serialize_unit_variant(self, _: &'static str, _: u32, _: &'static str) -> Scan {
        Ok(())
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Scan {
        value.serialize(self)
    }
    fn serialize_newtype_struct<T: ?Sized + Serialize>(self, _: &'static str, value: &T) -> Scan {
        value.serialize(self)
    }
    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        value: &T,
    ) -> Scan {
        value.serialize(self)
    }

    fn serialize_seq(self, _: Option<usize>) -> std::result::Result<Self, ScanError> {
        Ok(self)
    }
    fn serialize_tuple(self, _: usize) -> std::result::Result<Self, ScanError> {
        Ok(self)
    }
    fn serialize_tuple_struct(
        self,
        _: &'static str,
        _: usize,
    ) -> std::result::Result<Self, ScanError> {
        Ok(self)
    }
    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> std::result::Result<Self, ScanError> {
        Ok(self)
    }
    fn serialize_map(self, _: Option<usize>) -> std::result::Result<Self, ScanError> {
        Ok(self)
    }
    fn serialize_struct(self, _: &'static str, _: usize) -> std::result::Result<Self, ScanError> {
        Ok(self)
    }
    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> std::result::Result<Self, ScanError> {
        Ok(self)
    }
}

impl ser::SerializeSeq for FloatScan {
    type Ok = ();
    type Error = ScanError;
    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Scan {
        value.serialize(*self)
    }
    fn end(self) -> Scan {
        Ok(())
    }
}

impl ser::SerializeTuple for FloatScan {
    type Ok = ();
    type Error = ScanError;
    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Scan {
        value.serialize(*self)
    }
    fn end(self) -> Scan {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for FloatScan {
    type Ok = ();
    type Error = ScanError;
    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Scan {
        value.serialize(*self)
    }
    fn end(self) -> Scan {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for FloatScan {
    type Ok = ();
    type Error = ScanError;
    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Scan {
        value.serialize(*self)
    }
    fn end(self) -> Scan {
        Ok(())
    }
}

impl ser::SerializeMap for FloatScan {
    type Ok = ();
    type Error = ScanError;
    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Scan {
        key.serialize(*self)
    }
    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Scan {
        value.serialize(*self)
    }
    fn end(self) -> Scan {
        Ok(())
    }
}

impl ser::SerializeStruct for FloatScan {
    type Ok = ();
    type Error = ScanError;
    fn serialize_field<T: ?Sized + Serialize>(&mut self, _: &'static str, value: &T) -> Scan {
        value.serialize(*self)
    }
    fn end(self) -> Scan {
        Ok(())
    }
}

impl ser::SerializeStructVariant for FloatScan {
    type Ok = ();
    type Error = ScanError;
    fn serialize_field<T: ?Sized + Serialize>(&mut self, _: &'static str, value: &T) -> Scan {
        value.serialize(*self)
    }
    fn end(self) -> Scan {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        count: u64,
        label: String,
    }

    #[test]
    fn json_values_use_text() {
        let row = Row {
            count: 42,
            label: "oil".into(),
        };
        let encoded = Encoded::encode(&row).unwrap();
        assert!(encoded.is_text());
        assert_eq!(encoded.decode::<Row>().unwrap(), row);
    }

    #[test]
    fn tuple_keyed_map_falls_back_to_binary() {
        let mut map = HashMap::new();
        map.insert((1u32, 2u32), "edge".to_string());
        let encoded = Encoded::encode(&map).unwrap();
        assert!(!encoded.is_text());

        let decoded: HashMap<(u32, u32), String> = encoded.decode().unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn wire_form_carries_tag() {
        let text = Encoded::encode(&vec![1, 2, 3]).unwrap();
        assert_eq!(text.to_wire(), "j:[1,2,3]");
        assert_eq!(Encoded::from_wire("j:[1,2,3]").unwrap(), text);

        let mut map = HashMap::new();
        map.insert((7u8, 8u8), 9u8);
        let binary = Encoded::encode(&map).unwrap();
        let wire = binary.to_wire();
        assert!(wire.starts_with("b:"));
        assert_eq!(Encoded::from_wire(&wire).unwrap(), binary);
    }

    #[test]
    fn non_finite_floats_use_binary() {
        let scores = vec![1.5f64, f64::NAN, f64::INFINITY, f64::NEG_INFINITY];
        let encoded = Encoded::encode(&scores).unwrap();
        assert!(!encoded.is_text());

        let decoded: Vec<f64> = Encoded::from_wire(&encoded.to_wire())
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(decoded[0], 1.5);
        assert!(decoded[1].is_nan());
        assert_eq!(decoded[2], f64::INFINITY);
        assert_eq!(decoded[3], f64::NEG_INFINITY);

        // Finite floats and real nulls still take the text form.
        let finite = Encoded::encode(&(Some(0.25f32), None::<f64>)).unwrap();
        assert_eq!(finite.to_wire(), "j:[0.25,null]");
    }

    #[test]
    fn untagged_wire_payload_is_rejected() {
        assert!(Encoded::from_wire("{\"count\":1}").is_err());
        assert!(Encoded::from_wire("b:not base64!").is_err());
    }

    #[test]
    fn decode_into_wrong_type_fails() {
        let encoded = Encoded::encode("just text").unwrap();
        assert!(encoded.decode::<Row>().is_err());
    }
}
