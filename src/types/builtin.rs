use std::{borrow::Cow, collections::BTreeMap};

use bytes::Bytes;
use serde_json::Value;

use super::{Property, TypeCodec, TypeDef, TypeSchema, ValueKind};
use crate::error::TypeError;

// ========================================================== Bytes ===|

/// Raw byte payload. The metadata carries nothing but `typename`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesType;

impl TypeSchema for BytesType {
    fn name(&self) -> &'static str {
        "bytes"
    }

    fn description(&self) -> &'static str {
        "Raw bytes passed through without transformation."
    }
}

impl TypeCodec for BytesType {
    type Object = Bytes;

    fn encode_type(&self, _: &Bytes) -> Result<TypeDef, TypeError> {
        Ok(TypeDef::new())
    }

    fn encode_data(&self, obj: &Bytes, _: &TypeDef) -> Result<Bytes, TypeError> {
        Ok(obj.clone())
    }

    fn decode_data(&self, data: &[u8], _: &TypeDef) -> Result<Bytes, TypeError> {
        Ok(Bytes::copy_from_slice(data))
    }
}

// ========================================================== Json ===|

/// Arbitrary JSON document, serialized as UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonType;

impl TypeSchema for JsonType {
    fn name(&self) -> &'static str {
        "json"
    }

    fn description(&self) -> &'static str {
        "JSON document."
    }
}

impl TypeCodec for JsonType {
    type Object = Value;

    fn encode_type(&self, _: &Value) -> Result<TypeDef, TypeError> {
        Ok(TypeDef::new())
    }

    fn encode_data(&self, obj: &Value, _: &TypeDef) -> Result<Bytes, TypeError> {
        Ok(serde_json::to_vec(obj)?.into())
    }

    fn decode_data(&self, data: &[u8], _: &TypeDef) -> Result<Value, TypeError> {
        serde_json::from_slice(data)
            .map_err(|e| TypeError::MalformedData(Cow::Owned(e.to_string())))
    }
}

// ========================================================== Scalar ===|

/// A single numeric value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Int(i64),
    Uint(u64),
    Float(f64),
}

/// Numeric scalar described by `subtype` and `precision` (bits).
///
/// Encoded instances use the narrowest width that holds the value. A definition's precision is an
/// upper bound, so an instance encoded with 8 bits is compatible with a 32 bit definition.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalarType;

const SUBTYPE: &str = "subtype";
const PRECISION: &str = "precision";

impl TypeSchema for ScalarType {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn description(&self) -> &'static str {
        "Numeric scalar of fixed precision."
    }

    fn properties(&self) -> BTreeMap<String, Property> {
        BTreeMap::from([
            (
                SUBTYPE.to_string(),
                Property::new(ValueKind::String, "Numeric family of the scalar.")
                    .with_choices(["int", "uint", "float"].map(Value::from)),
            ),
            (
                PRECISION.to_string(),
                Property::new(ValueKind::Integer, "Width of the scalar in bits.")
                    .with_choices([8u64, 16, 32, 64].map(Value::from)),
            ),
        ])
    }

    fn definition_properties(&self) -> &'static [&'static str] {
        &[SUBTYPE]
    }

    fn metadata_properties(&self) -> &'static [&'static str] {
        &[SUBTYPE, PRECISION]
    }

    fn check_meta_compat(&self, key: &str, v1: Option<&Value>, v2: &Value) -> bool {
        if key != PRECISION {
            return v1 == Some(v2);
        }

        match (v1.and_then(Value::as_u64), v2.as_u64()) {
            (Some(encoded), Some(declared)) => encoded <= declared,
            _ => false,
        }
    }
}

impl TypeCodec for ScalarType {
    type Object = Scalar;

    fn encode_type(&self, obj: &Scalar) -> Result<TypeDef, TypeError> {
        let (subtype, precision) = match *obj {
            Scalar::Int(v) => ("int", int_width(v)),
            Scalar::Uint(v) => ("uint", uint_width(v)),
            Scalar::Float(v) if v.is_nan() || (v as f32) as f64 == v => ("float", 32),
            Scalar::Float(_) => ("float", 64),
        };

        let mut out = TypeDef::new();
        out.insert(SUBTYPE.into(), subtype.into());
        out.insert(PRECISION.into(), precision.into());
        Ok(out)
    }

    fn encode_data(&self, obj: &Scalar, metadata: &TypeDef) -> Result<Bytes, TypeError> {
        let width = byte_width(metadata)?;
        let full = match *obj {
            Scalar::Int(v) => v.to_le_bytes(),
            Scalar::Uint(v) => v.to_le_bytes(),
            Scalar::Float(v) if width == 4 => {
                let mut buf = [0u8; 8];
                buf[..4].copy_from_slice(&(v as f32).to_le_bytes());
                buf
            }
            Scalar::Float(v) => v.to_le_bytes(),
        };

        Ok(Bytes::copy_from_slice(&full[..width]))
    }

    fn decode_data(&self, data: &[u8], metadata: &TypeDef) -> Result<Scalar, TypeError> {
        let width = byte_width(metadata)?;
        if data.len() != width {
            return Err(TypeError::MalformedData(Cow::Owned(format!(
                "expected {width} bytes of scalar data, got {}",
                data.len()
            ))));
        }

        let subtype = metadata.get(SUBTYPE).and_then(Value::as_str).unwrap_or_default();
        let out = match subtype {
            "int" => {
                // Sign-extend from the encoded width.
                let fill = if data[width - 1] & 0x80 != 0 { 0xff } else { 0 };
                let mut buf = [fill; 8];
                buf[..width].copy_from_slice(data);
                Scalar::Int(i64::from_le_bytes(buf))
            }
            "uint" => {
                let mut buf = [0u8; 8];
                buf[..width].copy_from_slice(data);
                Scalar::Uint(u64::from_le_bytes(buf))
            }
            "float" if width == 4 => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(data);
                Scalar::Float(f32::from_le_bytes(buf) as f64)
            }
            "float" if width == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(data);
                Scalar::Float(f64::from_le_bytes(buf))
            }
            other => {
                return Err(TypeError::MalformedData(Cow::Owned(format!(
                    "unsupported scalar layout {other}/{width}"
                ))))
            }
        };

        Ok(out)
    }
}

fn byte_width(metadata: &TypeDef) -> Result<usize, TypeError> {
    match metadata.get(PRECISION).and_then(Value::as_u64) {
        Some(bits @ (8 | 16 | 32 | 64)) => Ok(bits as usize / 8),
        _ => Err(TypeError::MalformedData("scalar precision is missing or invalid".into())),
    }
}

fn int_width(v: i64) -> u64 {
    if i8::try_from(v).is_ok() {
        8
    } else if i16::try_from(v).is_ok() {
        16
    } else if i32::try_from(v).is_ok() {
        32
    } else {
        64
    }
}

fn uint_width(v: u64) -> u64 {
    if u8::try_from(v).is_ok() {
        8
    } else if u16::try_from(v).is_ok() {
        16
    } else if u32::try_from(v).is_ok() {
        32
    } else {
        64
    }
}
