//! Wire formats for resource values.
//!
//! The codec is a pair of pure functions over the neutral tree:
//!
//! ```txt
//!     encode(accept, tree, target) -> (bytes, actual content type)
//!     decode(content, bytes, target) -> tree
//! ```
//!
//! | Format        | ct    | Notes                                         |
//! |---------------|-------|-----------------------------------------------|
//! | link-format   | 17    | Discover, registration payloads               |
//! | OMA TLV       | 11542 | preferred binary format                       |
//! | OMA JSON      | 11543 | only when the peer advertised `ct=` for `</>` |
//! | plain text    | 0     | the default when no Accept is given           |
//! | octet-stream  | 42    | opaque, single resource instance only         |
//!
//! Multi-value formats (TLV, JSON) are required whenever the target depth is
//! Object or ObjectInstance, or the resource is multi-instance; an absent
//! Accept then resolves to TLV instead of plain text.

pub mod json;
pub mod link;
pub mod plain;
pub mod tlv;

use std::fmt::{self, Display};

use thiserror::Error;

use crate::definition::DefinitionRegistry;
use crate::tree::{NodeKind, TreeNode};
use crate::types::{Path, PathDepth};
use crate::value::ValueError;

/// Encoders refuse to grow past this bound and report `PayloadTooLarge`.
pub const MAX_PAYLOAD: usize = 4096;

/// CoAP content formats the runtime emits and accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    PlainText,
    LinkFormat,
    OctetStream,
    OmaTlv,
    OmaJson,
}

impl ContentType {
    pub fn code(self) -> u16 {
        match self {
            ContentType::PlainText => 0,
            ContentType::LinkFormat => 17,
            ContentType::OctetStream => 42,
            ContentType::OmaTlv => 11542,
            ContentType::OmaJson => 11543,
        }
    }

    /// Formats able to carry several values in one payload.
    pub fn is_multi_value(self) -> bool {
        matches!(self, ContentType::OmaTlv | ContentType::OmaJson)
    }
}

impl Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentType::PlainText => "text/plain",
            ContentType::LinkFormat => "application/link-format",
            ContentType::OctetStream => "application/octet-stream",
            ContentType::OmaTlv => "application/vnd.oma.lwm2m+tlv",
            ContentType::OmaJson => "application/vnd.oma.lwm2m+json",
        }
        .fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("content format {0} is not recognized")]
pub struct UnknownContentType(pub u16);

impl TryFrom<u16> for ContentType {
    type Error = UnknownContentType;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => ContentType::PlainText,
            // 40 is the pre-standard link-format alias some stacks still send.
            17 | 40 => ContentType::LinkFormat,
            42 => ContentType::OctetStream,
            11542 => ContentType::OmaTlv,
            11543 => ContentType::OmaJson,
            other => return Err(UnknownContentType(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("{0} cannot carry a write payload")]
    UnsupportedFormat(ContentType),
    #[error("payload is truncated")]
    Truncated,
    #[error("resource {0} is not defined")]
    UndefinedResource(Path),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("cannot represent {0} as {1}")]
    CannotRepresent(Path, ContentType),
    #[error("payload would exceed {MAX_PAYLOAD} bytes")]
    PayloadTooLarge,
    #[error("resource {0} is not defined")]
    UndefinedResource(Path),
}

/// Whether serving `target` requires a multi-value format.
fn needs_multi_value(node: &TreeNode, target: &Path) -> bool {
    match target.depth() {
        PathDepth::Root | PathDepth::Object | PathDepth::ObjectInstance => true,
        PathDepth::Resource => {
            // A resource node holding anything but a single instance 0 cannot
            // be flattened to one value.
            let resource = deepest_resource(node);
            match resource {
                Some(resource) => {
                    resource.child_count() > 1
                        || resource
                            .first_child()
                            .is_some_and(|instance| instance.id() != Some(0))
                }
                None => false,
            }
        }
        PathDepth::ResourceInstance => false,
    }
}

fn deepest_resource(node: &TreeNode) -> Option<&TreeNode> {
    match node.kind() {
        NodeKind::Resource => Some(node),
        NodeKind::ResourceInstance => None,
        _ => node.first_child().and_then(deepest_resource),
    }
}

/// Encode `node` for a peer that asked for `accept` (`None` when the request
/// carried no Accept option). Returns the payload and the format actually
/// used.
pub fn encode(
    registry: &DefinitionRegistry,
    accept: Option<ContentType>,
    node: &TreeNode,
    target: &Path,
) -> Result<(Vec<u8>, ContentType), EncodeError> {
    let effective = match accept {
        Some(content_type) => content_type,
        None if needs_multi_value(node, target) => ContentType::OmaTlv,
        None => ContentType::PlainText,
    };

    let payload = match effective {
        ContentType::OmaTlv => tlv::encode(registry, node, target)?,
        ContentType::OmaJson => json::encode(registry, node, target)?,
        ContentType::PlainText => {
            if needs_multi_value(node, target) {
                return Err(EncodeError::CannotRepresent(*target, effective));
            }
            plain::encode(registry, node, target)?
        }
        ContentType::OctetStream => {
            if needs_multi_value(node, target) {
                return Err(EncodeError::CannotRepresent(*target, effective));
            }
            plain::encode_opaque(registry, node, target)?
        }
        ContentType::LinkFormat => {
            return Err(EncodeError::CannotRepresent(*target, effective));
        }
    };

    if payload.len() > MAX_PAYLOAD {
        return Err(EncodeError::PayloadTooLarge);
    }
    Ok((payload, effective))
}

/// Decode a write payload aimed at `target` into a tree rooted at the
/// target's depth.
pub fn decode(
    registry: &DefinitionRegistry,
    content_type: ContentType,
    target: &Path,
    payload: &[u8],
) -> Result<TreeNode, DecodeError> {
    match content_type {
        ContentType::OmaTlv => tlv::decode(registry, target, payload),
        ContentType::OmaJson => json::decode(registry, target, payload),
        ContentType::PlainText => plain::decode(registry, target, payload),
        ContentType::OctetStream => plain::decode_opaque(registry, target, payload),
        ContentType::LinkFormat => Err(DecodeError::UnsupportedFormat(content_type)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ObjectDefinition, ResourceDefinition};
    use crate::types::Operations;
    use crate::value::{ResourceKind, Value};

    pub(crate) fn test_registry() -> DefinitionRegistry {
        let mut registry = DefinitionRegistry::new();
        registry
            .register_object(ObjectDefinition::new(3, "Device").instances(1, 1))
            .unwrap();
        for (id, name, kind) in [
            (0, "Manufacturer", ResourceKind::String),
            (1, "ModelNumber", ResourceKind::String),
            (9, "BatteryLevel", ResourceKind::Integer),
            (13, "CurrentTime", ResourceKind::Time),
        ] {
            registry
                .register_resource(
                    ResourceDefinition::new(3, id, name, kind).instances(1, 1),
                )
                .unwrap();
        }
        registry
            .register_resource(
                ResourceDefinition::new(3, 6, "AvailablePowerSources", ResourceKind::Integer)
                    .instances(0, 8),
            )
            .unwrap();
        registry
            .register_resource(
                ResourceDefinition::new(3, 4, "Reboot", ResourceKind::None)
                    .operations(Operations::Execute),
            )
            .unwrap();
        registry
            .register_resource(ResourceDefinition::new(3, 5, "Blob", ResourceKind::Opaque))
            .unwrap();
        registry
            .register_resource(ResourceDefinition::new(
                3,
                7,
                "PowerFactor",
                ResourceKind::Float,
            ))
            .unwrap();
        registry
            .register_resource(ResourceDefinition::new(
                3,
                8,
                "Reachable",
                ResourceKind::Boolean,
            ))
            .unwrap();
        registry
            .register_resource(ResourceDefinition::new(
                3,
                10,
                "Peer",
                ResourceKind::ObjectLink,
            ))
            .unwrap();
        registry
    }

    pub(crate) fn single_resource_tree(resource: u16, value: Value) -> TreeNode {
        let mut node = TreeNode::resource(resource);
        node.add_child(TreeNode::resource_instance(0, value.to_store_bytes()));
        node
    }

    #[test]
    fn content_type_codes_round_trip() {
        for content_type in [
            ContentType::PlainText,
            ContentType::LinkFormat,
            ContentType::OctetStream,
            ContentType::OmaTlv,
            ContentType::OmaJson,
        ] {
            assert_eq!(ContentType::try_from(content_type.code()), Ok(content_type));
        }
        assert_eq!(ContentType::try_from(40), Ok(ContentType::LinkFormat));
        assert_eq!(ContentType::try_from(60), Err(UnknownContentType(60)));
    }

    #[test]
    fn absent_accept_resolves_to_plain_for_single_values() {
        let registry = test_registry();
        let tree = single_resource_tree(9, Value::Integer(55));
        let (payload, content_type) =
            encode(&registry, None, &tree, &Path::resource(3, 0, 9)).unwrap();
        assert_eq!(content_type, ContentType::PlainText);
        assert_eq!(payload, b"55");
    }

    #[test]
    fn absent_accept_resolves_to_tlv_for_instances() {
        let registry = test_registry();
        let mut instance = TreeNode::object_instance(Some(0));
        instance.add_child(single_resource_tree(9, Value::Integer(55)));

        let (_, content_type) =
            encode(&registry, None, &instance, &Path::instance(3, 0)).unwrap();
        assert_eq!(content_type, ContentType::OmaTlv);
    }

    #[test]
    fn plain_text_refuses_instance_depth() {
        let registry = test_registry();
        let mut instance = TreeNode::object_instance(Some(0));
        instance.add_child(single_resource_tree(9, Value::Integer(55)));

        let result = encode(
            &registry,
            Some(ContentType::PlainText),
            &instance,
            &Path::instance(3, 0),
        );
        assert_eq!(
            result,
            Err(EncodeError::CannotRepresent(
                Path::instance(3, 0),
                ContentType::PlainText
            ))
        );
    }
}
