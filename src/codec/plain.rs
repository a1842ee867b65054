//! `text/plain` and `application/octet-stream` value encodings.
//!
//! Plain text carries exactly one resource-instance value: decimal for the
//! numeric types, Base64 for opaque, `"True"`/`"False"` for booleans and
//! `object:instance` for object links. Octet-stream carries the raw bytes of
//! a single opaque resource instance and nothing else.

use base64::prelude::{Engine as _, BASE64_STANDARD};
use nom::character::complete::{char, u16 as u16_text};
use nom::combinator::all_consuming;
use nom::sequence::separated_pair;

use crate::definition::DefinitionRegistry;
use crate::tree::{NodeKind, TreeNode};
use crate::types::{Path, ResourceId};
use crate::value::{self, ResourceKind, Value};

use super::{DecodeError, EncodeError};

/// Render one stored value as plain text.
pub fn format_value(kind: ResourceKind, bytes: &[u8]) -> Result<String, DecodeError> {
    Ok(match Value::from_store_bytes(kind, bytes)? {
        Value::String(text) => text,
        Value::Opaque(raw) => BASE64_STANDARD.encode(raw),
        Value::Integer(v) | Value::Time(v) => v.to_string(),
        Value::Float(v) => {
            // Emit at the precision the stored width can actually carry.
            if value::float_store_width(bytes) == 4 {
                (v as f32).to_string()
            } else {
                v.to_string()
            }
        }
        Value::Boolean(v) => if v { "True" } else { "False" }.to_string(),
        Value::ObjectLink(object, instance) => format!("{object}:{instance}"),
    })
}

/// Parse plain text into the store representation for `kind`.
pub fn parse_text(kind: ResourceKind, text: &str) -> Result<Vec<u8>, DecodeError> {
    let bad = || DecodeError::Malformed(format!("cannot parse {text:?} as {kind}"));

    Ok(match kind {
        ResourceKind::None => return Err(bad()),
        ResourceKind::String => Value::String(text.to_owned()).to_store_bytes(),
        ResourceKind::Opaque => {
            Value::Opaque(BASE64_STANDARD.decode(text.trim()).map_err(|_| bad())?)
                .to_store_bytes()
        }
        ResourceKind::Integer => {
            Value::Integer(text.trim().parse().map_err(|_| bad())?).to_store_bytes()
        }
        ResourceKind::Time => Value::Time(text.trim().parse().map_err(|_| bad())?).to_store_bytes(),
        ResourceKind::Float => {
            Value::Float(text.trim().parse().map_err(|_| bad())?).to_store_bytes()
        }
        ResourceKind::Boolean => match text.trim() {
            "True" => Value::Boolean(true).to_store_bytes(),
            "False" => Value::Boolean(false).to_store_bytes(),
            _ => return Err(bad()),
        },
        ResourceKind::ObjectLink => {
            let (_, (object, instance)) =
                all_consuming(separated_pair(u16_text, char(':'), u16_text))(text.trim())
                    .map_err(|_: nom::Err<nom::error::Error<&str>>| bad())?;
            Value::ObjectLink(object, instance).to_store_bytes()
        }
    })
}

fn lookup_kind(
    registry: &DefinitionRegistry,
    target: &Path,
    resource: ResourceId,
) -> Result<ResourceKind, EncodeError> {
    let object = target.object.ok_or(EncodeError::UndefinedResource(*target))?;
    registry
        .lookup_resource(object, resource)
        .map(|definition| definition.kind)
        .ok_or(EncodeError::UndefinedResource(Path::resource(
            object,
            target.instance.unwrap_or(0),
            resource,
        )))
}

/// The single resource-instance `node` addresses for `target`.
fn single_instance<'tree>(
    node: &'tree TreeNode,
    target: &Path,
) -> Result<(ResourceId, &'tree TreeNode), EncodeError> {
    let mut current = node;
    loop {
        match current.kind() {
            NodeKind::Resource => break,
            NodeKind::ResourceInstance => {
                return Err(EncodeError::CannotRepresent(
                    *target,
                    super::ContentType::PlainText,
                ))
            }
            _ => {
                current = current
                    .first_child()
                    .ok_or(EncodeError::CannotRepresent(*target, super::ContentType::PlainText))?;
            }
        }
    }

    let resource_id = current.id().expect("resource nodes always carry an id");
    let instance = match target.resource_instance {
        Some(index) => current.find_child(index),
        None => current.first_child(),
    }
    .ok_or(EncodeError::CannotRepresent(
        *target,
        super::ContentType::PlainText,
    ))?;
    Ok((resource_id, instance))
}

pub fn encode(
    registry: &DefinitionRegistry,
    node: &TreeNode,
    target: &Path,
) -> Result<Vec<u8>, EncodeError> {
    let (resource_id, instance) = single_instance(node, target)?;
    let kind = lookup_kind(registry, target, resource_id)?;
    let bytes = instance.value().unwrap_or_default();

    format_value(kind, bytes)
        .map(String::into_bytes)
        .map_err(|_| EncodeError::CannotRepresent(*target, super::ContentType::PlainText))
}

pub fn encode_opaque(
    registry: &DefinitionRegistry,
    node: &TreeNode,
    target: &Path,
) -> Result<Vec<u8>, EncodeError> {
    let (resource_id, instance) = single_instance(node, target)?;
    let kind = lookup_kind(registry, target, resource_id)?;
    if kind != ResourceKind::Opaque {
        return Err(EncodeError::CannotRepresent(
            *target,
            super::ContentType::OctetStream,
        ));
    }
    Ok(instance.value().unwrap_or_default().to_vec())
}

fn decode_target(
    registry: &DefinitionRegistry,
    target: &Path,
) -> Result<(ResourceId, u16, ResourceKind), DecodeError> {
    let (Some(object), Some(resource)) = (target.object, target.resource) else {
        return Err(DecodeError::Malformed(format!(
            "a single-value write must target a resource, not {target}"
        )));
    };
    let kind = registry
        .lookup_resource(object, resource)
        .map(|definition| definition.kind)
        .ok_or(DecodeError::UndefinedResource(*target))?;
    Ok((resource, target.resource_instance.unwrap_or(0), kind))
}

pub fn decode(
    registry: &DefinitionRegistry,
    target: &Path,
    payload: &[u8],
) -> Result<TreeNode, DecodeError> {
    let (resource, index, kind) = decode_target(registry, target)?;
    let text = std::str::from_utf8(payload)
        .map_err(|_| DecodeError::Malformed("plain-text payload is not UTF-8".to_owned()))?;

    let mut node = TreeNode::resource(resource);
    node.add_child(TreeNode::resource_instance(index, parse_text(kind, text)?));
    Ok(node)
}

pub fn decode_opaque(
    registry: &DefinitionRegistry,
    target: &Path,
    payload: &[u8],
) -> Result<TreeNode, DecodeError> {
    let (resource, index, kind) = decode_target(registry, target)?;
    if kind != ResourceKind::Opaque {
        return Err(DecodeError::UnsupportedFormat(super::ContentType::OctetStream));
    }

    let mut node = TreeNode::resource(resource);
    node.add_child(TreeNode::resource_instance(index, payload.to_vec()));
    Ok(node)
}
