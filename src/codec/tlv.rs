//! The OMA LwM2M TLV binary format (`application/vnd.oma.lwm2m+tlv`).
//!
//! Every entry is a type byte, an identifier, an optional length field and
//! the value:
//!
//! ```txt
//!       7  6   5   4  3   2  1  0
//!     +------+---+------+---------+
//!     | kind |idw| lenw | length  |  type byte
//!     +------+---+------+---------+
//!     kind: 00 Object Instance  01 Resource Instance
//!           10 Multiple Resource 11 Resource with value
//!     idw:  0 = 8-bit identifier, 1 = 16-bit
//!     lenw: 00 = length in the low three bits, else an 8/16/24-bit
//!           length field follows the identifier
//! ```
//!
//! Values are network byte order; integers are carried at the narrowest of
//! 1, 2, 4 or 8 bytes that preserves the value, floats at the width they are
//! stored with.

use bytes::BufMut;

use crate::definition::DefinitionRegistry;
use crate::tree::{NodeKind, TreeNode};
use crate::types::{Path, PathDepth};
use crate::value::{self, ResourceKind, Value};

use super::{DecodeError, EncodeError};

const KIND_OBJECT_INSTANCE: u8 = 0b00;
const KIND_RESOURCE_INSTANCE: u8 = 0b01;
const KIND_MULTIPLE_RESOURCE: u8 = 0b10;
const KIND_RESOURCE_VALUE: u8 = 0b11;

/// Convert a stored value into its network-order wire bytes.
fn wire_from_store(kind: ResourceKind, bytes: &[u8]) -> Result<Vec<u8>, EncodeError> {
    let value = Value::from_store_bytes(kind, bytes)
        .map_err(|_| EncodeError::CannotRepresent(Path::root(), super::ContentType::OmaTlv))?;

    Ok(match value {
        Value::String(text) => text.into_bytes(),
        Value::Opaque(raw) => raw,
        Value::Integer(v) | Value::Time(v) => narrow_integer(v),
        Value::Float(v) => {
            if value::float_store_width(bytes) == 4 {
                (v as f32).to_be_bytes().to_vec()
            } else {
                v.to_be_bytes().to_vec()
            }
        }
        Value::Boolean(v) => vec![u8::from(v)],
        Value::ObjectLink(object, instance) => {
            let mut buf = object.to_be_bytes().to_vec();
            buf.extend_from_slice(&instance.to_be_bytes());
            buf
        }
    })
}

/// The narrowest two's-complement big-endian form of `v`.
fn narrow_integer(v: i64) -> Vec<u8> {
    if let Ok(v) = i8::try_from(v) {
        v.to_be_bytes().to_vec()
    } else if let Ok(v) = i16::try_from(v) {
        v.to_be_bytes().to_vec()
    } else if let Ok(v) = i32::try_from(v) {
        v.to_be_bytes().to_vec()
    } else {
        v.to_be_bytes().to_vec()
    }
}

/// Convert wire bytes back into the store representation.
fn store_from_wire(kind: ResourceKind, wire: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let bad_length = || {
        DecodeError::Malformed(format!("a {kind} value cannot be {} bytes", wire.len()))
    };

    Ok(match kind {
        ResourceKind::None => return Err(bad_length()),
        ResourceKind::String => {
            let text = std::str::from_utf8(wire)
                .map_err(|_| DecodeError::Malformed("string value is not UTF-8".into()))?;
            Value::String(text.to_owned()).to_store_bytes()
        }
        ResourceKind::Opaque => wire.to_vec(),
        ResourceKind::Integer => Value::Integer(widen_integer(wire).ok_or_else(bad_length)?)
            .to_store_bytes(),
        ResourceKind::Time => {
            Value::Time(widen_integer(wire).ok_or_else(bad_length)?).to_store_bytes()
        }
        ResourceKind::Float => match wire.len() {
            4 => value::float_to_store_bytes(
                f32::from_be_bytes(wire.try_into().unwrap()) as f64,
                4,
            ),
            8 => value::float_to_store_bytes(f64::from_be_bytes(wire.try_into().unwrap()), 8),
            _ => return Err(bad_length()),
        },
        ResourceKind::Boolean => match wire {
            [0] => Value::Boolean(false).to_store_bytes(),
            [1] => Value::Boolean(true).to_store_bytes(),
            _ => return Err(bad_length()),
        },
        ResourceKind::ObjectLink => {
            if wire.len() != 4 {
                return Err(bad_length());
            }
            let object = u16::from_be_bytes(wire[0..2].try_into().unwrap());
            let instance = u16::from_be_bytes(wire[2..4].try_into().unwrap());
            Value::ObjectLink(object, instance).to_store_bytes()
        }
    })
}

fn widen_integer(wire: &[u8]) -> Option<i64> {
    Some(match wire.len() {
        1 => i8::from_be_bytes(wire.try_into().unwrap()) as i64,
        2 => i16::from_be_bytes(wire.try_into().unwrap()) as i64,
        4 => i32::from_be_bytes(wire.try_into().unwrap()) as i64,
        8 => i64::from_be_bytes(wire.try_into().unwrap()),
        _ => return None,
    })
}

fn put_entry(buf: &mut Vec<u8>, kind: u8, id: u16, value: &[u8]) {
    let wide_id = id > u8::MAX as u16;
    let len = value.len();

    let mut type_byte = kind << 6;
    if wide_id {
        type_byte |= 1 << 5;
    }
    match len {
        0..=7 => type_byte |= len as u8,
        8..=0xFF => type_byte |= 0b01 << 3,
        0x100..=0xFFFF => type_byte |= 0b10 << 3,
        _ => type_byte |= 0b11 << 3,
    }
    buf.put_u8(type_byte);

    if wide_id {
        buf.put_u16(id);
    } else {
        buf.put_u8(id as u8);
    }

    match len {
        0..=7 => {}
        8..=0xFF => buf.put_u8(len as u8),
        0x100..=0xFFFF => buf.put_u16(len as u16),
        _ => {
            buf.put_u8((len >> 16) as u8);
            buf.put_u16(len as u16);
        }
    }
    buf.extend_from_slice(value);
}

fn encode_resource(
    registry: &DefinitionRegistry,
    object: u16,
    resource: &TreeNode,
) -> Result<Vec<u8>, EncodeError> {
    let resource_id = resource.id().expect("resource nodes always carry an id");
    let definition = registry
        .lookup_resource(object, resource_id)
        .ok_or(EncodeError::UndefinedResource(Path::resource(
            object, 0, resource_id,
        )))?;

    let mut buf = vec![];
    if definition.is_single_instance() {
        let instance = resource
            .first_child()
            .ok_or(EncodeError::CannotRepresent(
                Path::resource(object, 0, resource_id),
                super::ContentType::OmaTlv,
            ))?;
        let wire = wire_from_store(definition.kind, instance.value().unwrap_or_default())?;
        put_entry(&mut buf, KIND_RESOURCE_VALUE, resource_id, &wire);
    } else {
        let mut inner = vec![];
        for instance in resource.children() {
            let id = instance.id().expect("resource instances always carry an id");
            let wire = wire_from_store(definition.kind, instance.value().unwrap_or_default())?;
            put_entry(&mut inner, KIND_RESOURCE_INSTANCE, id, &wire);
        }
        put_entry(&mut buf, KIND_MULTIPLE_RESOURCE, resource_id, &inner);
    }
    Ok(buf)
}

fn encode_instance_body(
    registry: &DefinitionRegistry,
    object: u16,
    instance: &TreeNode,
) -> Result<Vec<u8>, EncodeError> {
    let mut buf = vec![];
    for resource in instance.children() {
        buf.extend(encode_resource(registry, object, resource)?);
    }
    Ok(buf)
}

pub fn encode(
    registry: &DefinitionRegistry,
    node: &TreeNode,
    target: &Path,
) -> Result<Vec<u8>, EncodeError> {
    let object = target
        .object
        .or(node.id())
        .ok_or(EncodeError::CannotRepresent(*target, super::ContentType::OmaTlv))?;

    match node.kind() {
        NodeKind::Object => {
            let mut buf = vec![];
            for instance in node.children() {
                let id = instance.id().ok_or(EncodeError::CannotRepresent(
                    *target,
                    super::ContentType::OmaTlv,
                ))?;
                let body = encode_instance_body(registry, object, instance)?;
                put_entry(&mut buf, KIND_OBJECT_INSTANCE, id, &body);
            }
            Ok(buf)
        }
        NodeKind::ObjectInstance => encode_instance_body(registry, object, node),
        NodeKind::Resource => encode_resource(registry, object, node),
        NodeKind::ResourceInstance => Err(EncodeError::CannotRepresent(
            *target,
            super::ContentType::OmaTlv,
        )),
    }
}

struct Entry<'a> {
    kind: u8,
    id: u16,
    value: &'a [u8],
}

/// Pull one TLV entry off the front of `input`.
fn take_entry<'a>(input: &mut &'a [u8]) -> Result<Entry<'a>, DecodeError> {
    let buf = *input;
    if buf.is_empty() {
        return Err(DecodeError::Truncated);
    }
    let type_byte = buf[0];
    let kind = type_byte >> 6;
    let wide_id = type_byte & (1 << 5) != 0;
    let len_width = (type_byte >> 3) & 0b11;

    let mut at = 1;
    let id = if wide_id {
        if buf.len() < at + 2 {
            return Err(DecodeError::Truncated);
        }
        let id = u16::from_be_bytes(buf[at..at + 2].try_into().unwrap());
        at += 2;
        id
    } else {
        let id = *buf.get(at).ok_or(DecodeError::Truncated)? as u16;
        at += 1;
        id
    };

    let len = match len_width {
        0b00 => (type_byte & 0b111) as usize,
        width => {
            let bytes = width as usize; // 1, 2 or 3 length bytes
            if buf.len() < at + bytes {
                return Err(DecodeError::Truncated);
            }
            let mut len = 0usize;
            for &b in &buf[at..at + bytes] {
                len = (len << 8) | b as usize;
            }
            at += bytes;
            len
        }
    };

    if buf.len() < at + len {
        return Err(DecodeError::Truncated);
    }
    let value = &buf[at..at + len];
    *input = &buf[at + len..];
    Ok(Entry { kind, id, value })
}

fn decode_resource_entry(
    registry: &DefinitionRegistry,
    target: &Path,
    entry: &Entry<'_>,
) -> Result<TreeNode, DecodeError> {
    let object = target
        .object
        .ok_or_else(|| DecodeError::Malformed("write payload without an object target".into()))?;
    let definition = registry
        .lookup_resource(object, entry.id)
        .ok_or(DecodeError::UndefinedResource(Path::resource(
            object,
            target.instance.unwrap_or(0),
            entry.id,
        )))?;

    let mut resource = TreeNode::resource(entry.id);
    match entry.kind {
        KIND_RESOURCE_VALUE => {
            resource.add_child(TreeNode::resource_instance(
                0,
                store_from_wire(definition.kind, entry.value)?,
            ));
        }
        KIND_MULTIPLE_RESOURCE => {
            let mut inner = entry.value;
            while !inner.is_empty() {
                let instance = take_entry(&mut inner)?;
                if instance.kind != KIND_RESOURCE_INSTANCE {
                    return Err(DecodeError::Malformed(
                        "multiple-resource entries may only contain resource instances".into(),
                    ));
                }
                resource.add_child(TreeNode::resource_instance(
                    instance.id,
                    store_from_wire(definition.kind, instance.value)?,
                ));
            }
        }
        _ => {
            return Err(DecodeError::Malformed(
                "expected a resource entry".into(),
            ))
        }
    }
    Ok(resource)
}

fn decode_instance_body(
    registry: &DefinitionRegistry,
    target: &Path,
    mut body: &[u8],
    instance_id: Option<u16>,
) -> Result<TreeNode, DecodeError> {
    let mut instance = TreeNode::object_instance(instance_id);
    while !body.is_empty() {
        let entry = take_entry(&mut body)?;
        instance.add_child(decode_resource_entry(registry, target, &entry)?);
    }
    Ok(instance)
}

/// Decode a TLV payload aimed at `target`.
///
/// At object depth the result is either an `Object` node holding instance
/// children (the payload carried instance entries) or an `ObjectInstance`
/// node with no id (the payload carried bare resources for a create).
pub fn decode(
    registry: &DefinitionRegistry,
    target: &Path,
    payload: &[u8],
) -> Result<TreeNode, DecodeError> {
    let mut input = payload;

    match target.depth() {
        PathDepth::Root => Err(DecodeError::Malformed(
            "a write payload cannot target the root".into(),
        )),
        PathDepth::Object => {
            let object = target.object.unwrap();
            if payload.first().map(|byte| byte >> 6) == Some(KIND_OBJECT_INSTANCE) {
                let mut node = TreeNode::object(object);
                while !input.is_empty() {
                    let entry = take_entry(&mut input)?;
                    if entry.kind != KIND_OBJECT_INSTANCE {
                        return Err(DecodeError::Malformed(
                            "object payloads may only contain instance entries".into(),
                        ));
                    }
                    node.add_child(decode_instance_body(
                        registry,
                        target,
                        entry.value,
                        Some(entry.id),
                    )?);
                }
                Ok(node)
            } else {
                decode_instance_body(registry, target, input, None)
            }
        }
        PathDepth::ObjectInstance => {
            decode_instance_body(registry, target, input, target.instance)
        }
        PathDepth::Resource | PathDepth::ResourceInstance => {
            let entry = take_entry(&mut input)?;
            if !input.is_empty() {
                return Err(DecodeError::Malformed(
                    "trailing bytes after resource entry".into(),
                ));
            }
            decode_resource_entry(registry, target, &entry)
        }
    }
}
