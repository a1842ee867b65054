//! Typed resource values and their stored byte representation.
//!
//! The object store keeps every resource-instance value as an opaque byte
//! buffer whose interpretation is fixed by the owning resource definition's
//! type. This module is the single place that knows the buffer layout:
//!
//! - `String`: UTF-8 bytes plus a trailing NUL that is not counted in the
//!   reported length,
//! - `Integer`/`Time`: host-endian two's complement, 1, 2, 4 or 8 bytes,
//! - `Float`: host-endian `f32` (4 bytes) or `f64` (8 bytes); the stored
//!   width is preserved so codecs can re-emit the same precision,
//! - `Boolean`: a single `0`/`1` byte,
//! - `ObjectLink`: two host-endian `u16`s, object id then instance id,
//! - `Opaque`: the raw bytes.

use std::fmt::{self, Display};
use std::str::FromStr;

use thiserror::Error;

use crate::types::{InstanceId, ObjectId};

/// The closed set of resource value types.
///
/// Multi-instance is a property of the resource definition (its maximum
/// instance count), not of the type; `None` is the type of executable
/// resources, which carry no stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    None,
    String,
    Opaque,
    Integer,
    Float,
    Boolean,
    Time,
    ObjectLink,
}

impl ResourceKind {
    /// Types the `gt`/`lt`/`stp` notification thresholds apply to.
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            ResourceKind::Integer | ResourceKind::Float | ResourceKind::Time
        )
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::None => "None",
            ResourceKind::String => "String",
            ResourceKind::Opaque => "Opaque",
            ResourceKind::Integer => "Integer",
            ResourceKind::Float => "Float",
            ResourceKind::Boolean => "Boolean",
            ResourceKind::Time => "DateTime",
            ResourceKind::ObjectLink => "ObjectLink",
        }
        .fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no resource type is named {0:?}")]
pub struct UnknownResourceKind(pub String);

impl FromStr for ResourceKind {
    type Err = UnknownResourceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "None" => ResourceKind::None,
            "String" => ResourceKind::String,
            "Opaque" => ResourceKind::Opaque,
            "Integer" => ResourceKind::Integer,
            "Float" => ResourceKind::Float,
            "Boolean" => ResourceKind::Boolean,
            "DateTime" | "Time" => ResourceKind::Time,
            "ObjectLink" => ResourceKind::ObjectLink,
            other => return Err(UnknownResourceKind(other.to_owned())),
        })
    }
}

/// A decoded resource value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Opaque(Vec<u8>),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Time(i64),
    ObjectLink(ObjectId, InstanceId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("a {kind} value cannot be {len} bytes long")]
    BadLength { kind: ResourceKind, len: usize },
    #[error("stored string is not valid UTF-8")]
    BadUtf8,
    #[error("boolean byte must be 0 or 1, found {0}")]
    BadBoolean(u8),
    #[error("executable resources carry no value")]
    ValuelessKind,
}

impl Value {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Value::String(_) => ResourceKind::String,
            Value::Opaque(_) => ResourceKind::Opaque,
            Value::Integer(_) => ResourceKind::Integer,
            Value::Float(_) => ResourceKind::Float,
            Value::Boolean(_) => ResourceKind::Boolean,
            Value::Time(_) => ResourceKind::Time,
            Value::ObjectLink(..) => ResourceKind::ObjectLink,
        }
    }

    /// Encode into the store representation (canonical widths).
    pub fn to_store_bytes(&self) -> Vec<u8> {
        match self {
            Value::String(s) => {
                let mut buf = s.clone().into_bytes();
                buf.push(0);
                buf
            }
            Value::Opaque(bytes) => bytes.clone(),
            Value::Integer(v) | Value::Time(v) => v.to_ne_bytes().to_vec(),
            Value::Float(v) => v.to_ne_bytes().to_vec(),
            Value::Boolean(v) => vec![u8::from(*v)],
            Value::ObjectLink(object, instance) => {
                let mut buf = object.to_ne_bytes().to_vec();
                buf.extend_from_slice(&instance.to_ne_bytes());
                buf
            }
        }
    }

    /// Decode from the store representation, honouring the stored width.
    pub fn from_store_bytes(kind: ResourceKind, bytes: &[u8]) -> Result<Self, ValueError> {
        let bad_length = || ValueError::BadLength {
            kind,
            len: bytes.len(),
        };

        Ok(match kind {
            ResourceKind::None => return Err(ValueError::ValuelessKind),
            ResourceKind::String => {
                let text = bytes.strip_suffix(&[0]).unwrap_or(bytes);
                Value::String(
                    std::str::from_utf8(text)
                        .map_err(|_| ValueError::BadUtf8)?
                        .to_owned(),
                )
            }
            ResourceKind::Opaque => Value::Opaque(bytes.to_vec()),
            ResourceKind::Integer => Value::Integer(int_from_store(bytes).ok_or_else(bad_length)?),
            ResourceKind::Time => Value::Time(int_from_store(bytes).ok_or_else(bad_length)?),
            ResourceKind::Float => match bytes.len() {
                4 => Value::Float(f32::from_ne_bytes(bytes.try_into().unwrap()) as f64),
                8 => Value::Float(f64::from_ne_bytes(bytes.try_into().unwrap())),
                _ => return Err(bad_length()),
            },
            ResourceKind::Boolean => match bytes {
                [0] => Value::Boolean(false),
                [1] => Value::Boolean(true),
                [other] => return Err(ValueError::BadBoolean(*other)),
                _ => return Err(bad_length()),
            },
            ResourceKind::ObjectLink => {
                if bytes.len() != 4 {
                    return Err(bad_length());
                }
                let object = u16::from_ne_bytes(bytes[0..2].try_into().unwrap());
                let instance = u16::from_ne_bytes(bytes[2..4].try_into().unwrap());
                Value::ObjectLink(object, instance)
            }
        })
    }
}

fn int_from_store(bytes: &[u8]) -> Option<i64> {
    Some(match bytes.len() {
        1 => i8::from_ne_bytes(bytes.try_into().unwrap()) as i64,
        2 => i16::from_ne_bytes(bytes.try_into().unwrap()) as i64,
        4 => i32::from_ne_bytes(bytes.try_into().unwrap()) as i64,
        8 => i64::from_ne_bytes(bytes.try_into().unwrap()),
        _ => return None,
    })
}

/// The type-specific zero used when a resource has no configured default:
/// empty string, `0`, `0.0`, `false`, empty opaque, ObjectLink `(0, 0)`.
pub fn sensible_default(kind: ResourceKind) -> Vec<u8> {
    match kind {
        ResourceKind::None => vec![],
        ResourceKind::String => Value::String(String::new()).to_store_bytes(),
        ResourceKind::Opaque => vec![],
        ResourceKind::Integer => Value::Integer(0).to_store_bytes(),
        ResourceKind::Float => Value::Float(0.0).to_store_bytes(),
        ResourceKind::Boolean => Value::Boolean(false).to_store_bytes(),
        ResourceKind::Time => Value::Time(0).to_store_bytes(),
        ResourceKind::ObjectLink => Value::ObjectLink(0, 0).to_store_bytes(),
    }
}

/// Read a stored value as a float for threshold comparisons.
///
/// Returns `None` for non-numeric kinds or malformed buffers.
pub fn numeric_value(kind: ResourceKind, bytes: &[u8]) -> Option<f64> {
    match Value::from_store_bytes(kind, bytes).ok()? {
        Value::Integer(v) | Value::Time(v) => Some(v as f64),
        Value::Float(v) => Some(v),
        _ => None,
    }
}

/// The stored width of a float buffer, used by codecs to decide between
/// `f32` and `f64` on the wire.
pub fn float_store_width(bytes: &[u8]) -> usize {
    if bytes.len() == 4 {
        4
    } else {
        8
    }
}

/// Store a float preserving the width it arrived with.
pub fn float_to_store_bytes(value: f64, width: usize) -> Vec<u8> {
    if width == 4 {
        (value as f32).to_ne_bytes().to_vec()
    } else {
        value.to_ne_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_store_appends_nul() {
        let bytes = Value::String("abc".to_owned()).to_store_bytes();
        assert_eq!(bytes, b"abc\0");
        assert_eq!(
            Value::from_store_bytes(ResourceKind::String, &bytes).unwrap(),
            Value::String("abc".to_owned())
        );
    }

    #[test]
    fn empty_string_is_one_nul_byte() {
        assert_eq!(sensible_default(ResourceKind::String), vec![0]);
    }

    #[test]
    fn integers_round_trip_at_every_width() {
        for (value, bytes) in [
            (-1i64, (-1i8).to_ne_bytes().to_vec()),
            (300, 300i16.to_ne_bytes().to_vec()),
            (70_000, 70_000i32.to_ne_bytes().to_vec()),
            (1 << 40, (1i64 << 40).to_ne_bytes().to_vec()),
        ] {
            assert_eq!(
                Value::from_store_bytes(ResourceKind::Integer, &bytes).unwrap(),
                Value::Integer(value)
            );
        }
    }

    #[test]
    fn floats_keep_their_width() {
        let narrow = float_to_store_bytes(1.5, 4);
        assert_eq!(narrow.len(), 4);
        assert_eq!(
            Value::from_store_bytes(ResourceKind::Float, &narrow).unwrap(),
            Value::Float(1.5)
        );

        let wide = Value::Float(1.5).to_store_bytes();
        assert_eq!(wide.len(), 8);
        assert_eq!(float_store_width(&wide), 8);
    }

    #[test]
    fn object_link_packs_two_ids() {
        let bytes = Value::ObjectLink(7, 2).to_store_bytes();
        assert_eq!(bytes.len(), 4);
        assert_eq!(
            Value::from_store_bytes(ResourceKind::ObjectLink, &bytes).unwrap(),
            Value::ObjectLink(7, 2)
        );
    }

    #[test]
    fn boolean_rejects_junk() {
        assert_eq!(
            Value::from_store_bytes(ResourceKind::Boolean, &[2]),
            Err(ValueError::BadBoolean(2))
        );
    }

    #[test]
    fn numeric_values_for_thresholds() {
        let int = Value::Integer(10).to_store_bytes();
        assert_eq!(numeric_value(ResourceKind::Integer, &int), Some(10.0));

        let text = Value::String("x".to_owned()).to_store_bytes();
        assert_eq!(numeric_value(ResourceKind::String, &text), None);
    }
}
