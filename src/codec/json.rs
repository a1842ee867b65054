//! The OMA LwM2M JSON format (`application/vnd.oma.lwm2m+json`).
//!
//! A payload is a flat list of entries addressed relative to a base name:
//!
//! ```json
//!     {"bn":"/","e":[
//!         {"n":"3/0/0","sv":"Imagination"},
//!         {"n":"3/0/9","v":55},
//!         {"n":"3/0/8","bv":true}
//!     ]}
//! ```
//!
//! `v` carries the numeric types, `sv` strings (and Base64 for opaque), `bv`
//! booleans and `ov` object links. This format is only offered to peers that
//! advertised `ct=11543` for `</>` in their registration.

use base64::prelude::{Engine as _, BASE64_STANDARD};
use serde::{Deserialize, Serialize};

use crate::definition::DefinitionRegistry;
use crate::tree::{NodeKind, TreeNode};
use crate::types::{Path, PathDepth};
use crate::value::{ResourceKind, Value};

use super::{DecodeError, EncodeError};

#[derive(Debug, Serialize, Deserialize)]
struct Payload {
    #[serde(rename = "bn", skip_serializing_if = "Option::is_none")]
    base_name: Option<String>,
    e: Vec<Entry>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Entry {
    #[serde(skip_serializing_if = "Option::is_none")]
    n: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    v: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bv: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ov: Option<String>,
}

fn entry_for(
    kind: ResourceKind,
    name: String,
    bytes: &[u8],
) -> Result<Entry, EncodeError> {
    let value = Value::from_store_bytes(kind, bytes)
        .map_err(|_| EncodeError::CannotRepresent(Path::root(), super::ContentType::OmaJson))?;

    let mut entry = Entry {
        n: Some(name),
        ..Entry::default()
    };
    match value {
        Value::String(text) => entry.sv = Some(text),
        Value::Opaque(raw) => entry.sv = Some(BASE64_STANDARD.encode(raw)),
        Value::Integer(v) | Value::Time(v) => entry.v = Some(v as f64),
        Value::Float(v) => entry.v = Some(v),
        Value::Boolean(v) => entry.bv = Some(v),
        Value::ObjectLink(object, instance) => entry.ov = Some(format!("{object}:{instance}")),
    }
    Ok(entry)
}

fn push_resource_entries(
    registry: &DefinitionRegistry,
    entries: &mut Vec<Entry>,
    object: u16,
    instance: u16,
    resource: &TreeNode,
) -> Result<(), EncodeError> {
    let resource_id = resource.id().expect("resource nodes always carry an id");
    let definition = registry
        .lookup_resource(object, resource_id)
        .ok_or(EncodeError::UndefinedResource(Path::resource(
            object,
            instance,
            resource_id,
        )))?;

    for entry in resource.children() {
        let index = entry.id().expect("resource instances always carry an id");
        let name = if definition.is_single_instance() {
            format!("{object}/{instance}/{resource_id}")
        } else {
            format!("{object}/{instance}/{resource_id}/{index}")
        };
        entries.push(entry_for(
            definition.kind,
            name,
            entry.value().unwrap_or_default(),
        )?);
    }
    Ok(())
}

pub fn encode(
    registry: &DefinitionRegistry,
    node: &TreeNode,
    target: &Path,
) -> Result<Vec<u8>, EncodeError> {
    let object = target
        .object
        .or(node.id())
        .ok_or(EncodeError::CannotRepresent(*target, super::ContentType::OmaJson))?;

    let mut entries = vec![];
    match node.kind() {
        NodeKind::Object => {
            for instance in node.children() {
                let instance_id = instance.id().ok_or(EncodeError::CannotRepresent(
                    *target,
                    super::ContentType::OmaJson,
                ))?;
                for resource in instance.children() {
                    push_resource_entries(registry, &mut entries, object, instance_id, resource)?;
                }
            }
        }
        NodeKind::ObjectInstance => {
            let instance_id = node
                .id()
                .or(target.instance)
                .ok_or(EncodeError::CannotRepresent(*target, super::ContentType::OmaJson))?;
            for resource in node.children() {
                push_resource_entries(registry, &mut entries, object, instance_id, resource)?;
            }
        }
        NodeKind::Resource => {
            let instance_id = target.instance.unwrap_or(0);
            push_resource_entries(registry, &mut entries, object, instance_id, node)?;
        }
        NodeKind::ResourceInstance => {
            return Err(EncodeError::CannotRepresent(
                *target,
                super::ContentType::OmaJson,
            ))
        }
    }

    let payload = Payload {
        base_name: Some("/".to_owned()),
        e: entries,
    };
    serde_json::to_vec(&payload)
        .map_err(|_| EncodeError::CannotRepresent(*target, super::ContentType::OmaJson))
}

fn store_bytes_for(kind: ResourceKind, entry: &Entry) -> Result<Vec<u8>, DecodeError> {
    let mismatch = || DecodeError::Malformed(format!("entry value does not fit a {kind}"));

    Ok(match kind {
        ResourceKind::None => return Err(mismatch()),
        ResourceKind::String => {
            Value::String(entry.sv.clone().ok_or_else(mismatch)?).to_store_bytes()
        }
        ResourceKind::Opaque => Value::Opaque(
            BASE64_STANDARD
                .decode(entry.sv.as_deref().ok_or_else(mismatch)?)
                .map_err(|_| mismatch())?,
        )
        .to_store_bytes(),
        ResourceKind::Integer | ResourceKind::Time => {
            let v = entry.v.ok_or_else(mismatch)?;
            if v.fract() != 0.0 {
                return Err(mismatch());
            }
            match kind {
                ResourceKind::Integer => Value::Integer(v as i64).to_store_bytes(),
                _ => Value::Time(v as i64).to_store_bytes(),
            }
        }
        ResourceKind::Float => Value::Float(entry.v.ok_or_else(mismatch)?).to_store_bytes(),
        ResourceKind::Boolean => Value::Boolean(entry.bv.ok_or_else(mismatch)?).to_store_bytes(),
        ResourceKind::ObjectLink => {
            let text = entry.ov.as_deref().ok_or_else(mismatch)?;
            let (object, instance) = text.split_once(':').ok_or_else(mismatch)?;
            Value::ObjectLink(
                object.parse().map_err(|_| mismatch())?,
                instance.parse().map_err(|_| mismatch())?,
            )
            .to_store_bytes()
        }
    })
}

pub fn decode(
    registry: &DefinitionRegistry,
    target: &Path,
    payload: &[u8],
) -> Result<TreeNode, DecodeError> {
    let parsed: Payload = serde_json::from_slice(payload)
        .map_err(|err| DecodeError::Malformed(format!("invalid JSON payload: {err}")))?;
    let base = parsed.base_name.unwrap_or_else(|| "/".to_owned());

    let target_object = target
        .object
        .ok_or_else(|| DecodeError::Malformed("a write payload cannot target the root".into()))?;

    // (instance, resource, index, bytes) for every entry.
    let mut rows = vec![];
    for entry in &parsed.e {
        let joined = format!(
            "{}/{}",
            base.trim_end_matches('/'),
            entry.n.as_deref().unwrap_or_default().trim_matches('/')
        );
        let path: Path = joined
            .parse()
            .map_err(|_| DecodeError::Malformed(format!("bad entry name {joined:?}")))?;

        if path.object != Some(target_object) {
            return Err(DecodeError::Malformed(format!(
                "entry {joined:?} does not address object {target_object}"
            )));
        }
        let (Some(instance), Some(resource)) = (path.instance, path.resource) else {
            return Err(DecodeError::Malformed(format!(
                "entry {joined:?} does not name a resource"
            )));
        };
        let definition = registry
            .lookup_resource(target_object, resource)
            .ok_or(DecodeError::UndefinedResource(Path::resource(
                target_object,
                instance,
                resource,
            )))?;

        rows.push((
            instance,
            resource,
            path.resource_instance.unwrap_or(0),
            store_bytes_for(definition.kind, entry)?,
        ));
    }

    // Fold the flat rows back into a tree rooted at the target depth.
    let mut object_node = TreeNode::object(target_object);
    for (instance, resource, index, bytes) in rows {
        if let Some(expected) = target.instance {
            if instance != expected {
                return Err(DecodeError::Malformed(format!(
                    "entry addresses instance {instance}, target is {expected}"
                )));
            }
        }
        if let Some(expected) = target.resource {
            if resource != expected {
                return Err(DecodeError::Malformed(format!(
                    "entry addresses resource {resource}, target is {expected}"
                )));
            }
        }

        let mut instance_node = object_node
            .find_child(instance)
            .cloned()
            .unwrap_or_else(|| TreeNode::object_instance(Some(instance)));
        let mut resource_node = instance_node
            .find_child(resource)
            .cloned()
            .unwrap_or_else(|| TreeNode::resource(resource));
        resource_node.add_child(TreeNode::resource_instance(index, bytes));
        instance_node.add_child(resource_node);
        object_node.add_child(instance_node);
    }

    match target.depth() {
        PathDepth::Object => Ok(object_node),
        PathDepth::ObjectInstance => object_node
            .first_child()
            .cloned()
            .ok_or_else(|| DecodeError::Malformed("payload carries no entries".into())),
        PathDepth::Resource | PathDepth::ResourceInstance => object_node
            .first_child()
            .and_then(TreeNode::first_child)
            .cloned()
            .ok_or_else(|| DecodeError::Malformed("payload carries no entries".into())),
        PathDepth::Root => unreachable!("target object checked above"),
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{single_resource_tree, test_registry};
    use super::*;

    #[test]
    fn instance_encodes_to_flat_entries() {
        let registry = test_registry();
        let mut instance = TreeNode::object_instance(Some(0));
        instance.add_child(single_resource_tree(0, Value::String("Imagination".into())));
        instance.add_child(single_resource_tree(9, Value::Integer(55)));

        let payload = encode(&registry, &instance, &Path::instance(3, 0)).unwrap();
        let text = String::from_utf8(payload).unwrap();
        assert!(text.contains(r#""bn":"/""#), "{text}");
        assert!(text.contains(r#""n":"3/0/0""#), "{text}");
        assert!(text.contains(r#""sv":"Imagination""#), "{text}");
        assert!(text.contains(r#""n":"3/0/9""#), "{text}");
        assert!(text.contains(r#""v":55"#), "{text}");
    }

    #[test]
    fn decode_rebuilds_the_tree() {
        let registry = test_registry();
        let payload = br#"{"bn":"/","e":[{"n":"3/0/9","v":55},{"n":"3/0/0","sv":"x"}]}"#;
        let node = decode(&registry, &Path::instance(3, 0), payload).unwrap();

        assert_eq!(node.kind(), NodeKind::ObjectInstance);
        assert_eq!(node.id(), Some(0));
        let ids: Vec<_> = node.children().map(|child| child.id()).collect();
        assert_eq!(ids, [Some(0), Some(9)]);
    }

    #[test]
    fn round_trip_through_encode_and_decode() {
        let registry = test_registry();
        let mut instance = TreeNode::object_instance(Some(0));
        instance.add_child(single_resource_tree(7, Value::Float(2.5)));
        instance.add_child(single_resource_tree(8, Value::Boolean(true)));
        instance.add_child(single_resource_tree(10, Value::ObjectLink(4, 1)));

        let payload = encode(&registry, &instance, &Path::instance(3, 0)).unwrap();
        let decoded = decode(&registry, &Path::instance(3, 0), &payload).unwrap();
        assert_eq!(decoded, instance);
    }

    #[test]
    fn multi_instance_entries_carry_their_index() {
        let registry = test_registry();
        let mut resource = TreeNode::resource(6);
        resource.add_child(TreeNode::resource_instance(
            1,
            Value::Integer(5).to_store_bytes(),
        ));
        let payload = encode(&registry, &resource, &Path::resource(3, 0, 6)).unwrap();
        let text = String::from_utf8(payload.clone()).unwrap();
        assert!(text.contains(r#""n":"3/0/6/1""#), "{text}");

        let decoded = decode(&registry, &Path::resource(3, 0, 6), &payload).unwrap();
        assert_eq!(decoded, resource);
    }

    #[test]
    fn entries_outside_the_target_are_rejected() {
        let registry = test_registry();
        let payload = br#"{"bn":"/","e":[{"n":"3/1/9","v":55}]}"#;
        assert!(decode(&registry, &Path::instance(3, 0), payload).is_err());
    }

    #[test]
    fn fractional_values_do_not_fit_integers() {
        let registry = test_registry();
        let payload = br#"{"bn":"/","e":[{"n":"3/0/9","v":5.5}]}"#;
        assert!(decode(&registry, &Path::instance(3, 0), payload).is_err());
    }
}
