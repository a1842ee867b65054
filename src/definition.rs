//! Object and resource definitions: the schemas the store enforces.
//!
//! Definitions are installed at startup (from the built-in OMA set or an
//! `--objDefs` file) and never destroyed during normal operation. A
//! definition may carry a custom handler implementing the operations the
//! runtime cannot service from the store alone; everything else falls
//! through to the built-in store-backed behaviour.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use thiserror::Error;

use crate::tree::{NodeKind, TreeNode};
use crate::types::{InstanceId, ObjectId, Operations, Path, ResourceId, ResourceInstanceId, ResultCode};
use crate::value::{self, ResourceKind};

/// Capability hooks for an object definition.
///
/// The runtime consults a hook when present; otherwise instances live purely
/// in the object store.
pub trait ObjectOps: Send + Sync + fmt::Debug {
    /// Called after an instance is created in the store.
    fn instance_created(&self, _object: ObjectId, _instance: InstanceId) {}

    /// Called before an instance is deleted; a non-success result aborts the
    /// delete with that code.
    fn instance_deleting(&self, _object: ObjectId, _instance: InstanceId) -> ResultCode {
        ResultCode::Success
    }
}

/// Capability hooks for a resource definition.
pub trait ResourceOps: Send + Sync + fmt::Debug {
    /// Serve a read from handler-owned state instead of the store.
    /// `None` means the store value is authoritative.
    fn read(&self, _path: &Path) -> Option<Result<Vec<u8>, ResultCode>> {
        None
    }

    /// Called before a value is committed to the store; a non-success result
    /// aborts the write with that code.
    fn write(&self, _path: &Path, _value: &[u8]) -> ResultCode {
        ResultCode::Success
    }

    /// Run an Execute operation with the request payload as argument.
    fn execute(&self, _path: &Path, _arguments: &[u8]) -> ResultCode {
        ResultCode::MethodNotAllowed
    }

    /// Called after an optional resource is created.
    fn created(&self, _path: &Path) {}
}

#[derive(Debug, Clone)]
pub struct ObjectDefinition {
    pub id: ObjectId,
    pub name: String,
    pub min_instances: u16,
    pub max_instances: u16,
    pub handler: Option<Arc<dyn ObjectOps>>,
}

impl ObjectDefinition {
    pub fn new(id: ObjectId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            min_instances: 0,
            max_instances: 1,
            handler: None,
        }
    }

    pub fn instances(mut self, min: u16, max: u16) -> Self {
        self.min_instances = min;
        self.max_instances = max;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn ObjectOps>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn is_single_instance(&self) -> bool {
        self.max_instances == 1
    }

    pub fn is_mandatory(&self) -> bool {
        self.min_instances >= 1
    }
}

#[derive(Debug, Clone)]
pub struct ResourceDefinition {
    pub object_id: ObjectId,
    pub resource_id: ResourceId,
    pub name: String,
    pub kind: ResourceKind,
    pub min_instances: u16,
    pub max_instances: u16,
    pub operations: Operations,
    /// Optional default-value subtree: a `Resource` node whose
    /// `ResourceInstance` children seed newly created resources.
    pub default_value: Option<TreeNode>,
    pub handler: Option<Arc<dyn ResourceOps>>,
}

impl ResourceDefinition {
    pub fn new(
        object_id: ObjectId,
        resource_id: ResourceId,
        name: impl Into<String>,
        kind: ResourceKind,
    ) -> Self {
        Self {
            object_id,
            resource_id,
            name: name.into(),
            kind,
            min_instances: 0,
            max_instances: 1,
            operations: Operations::ReadWrite,
            default_value: None,
            handler: None,
        }
    }

    pub fn instances(mut self, min: u16, max: u16) -> Self {
        self.min_instances = min;
        self.max_instances = max;
        self
    }

    pub fn operations(mut self, operations: Operations) -> Self {
        self.operations = operations;
        self
    }

    pub fn default_value(mut self, default: TreeNode) -> Self {
        self.default_value = Some(default);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn ResourceOps>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn is_single_instance(&self) -> bool {
        self.max_instances == 1
    }

    pub fn is_mandatory(&self) -> bool {
        self.min_instances >= 1
    }

    /// The stored default for one resource instance: the configured default
    /// when present, otherwise the type-specific zero.
    pub fn sensible_default(&self) -> Vec<u8> {
        self.default_value
            .as_ref()
            .and_then(TreeNode::first_child)
            .and_then(|instance| instance.value().map(<[u8]>::to_vec))
            .unwrap_or_else(|| value::sensible_default(self.kind))
    }

    /// The `(id, bytes)` pairs to populate when this resource is created:
    /// the whole default subtree when configured, otherwise `min_instances`
    /// (at least one for single-instance resources) copies of the sensible
    /// default at indices `0..`.
    pub fn default_instances(&self) -> Vec<(ResourceInstanceId, Vec<u8>)> {
        if let Some(default) = &self.default_value {
            return default
                .children()
                .filter_map(|instance| {
                    let id = instance.id()?;
                    Some((id, instance.value()?.to_vec()))
                })
                .collect();
        }

        let count = if self.is_single_instance() {
            1
        } else {
            self.min_instances
        };
        (0..count)
            .map(|id| (id, value::sensible_default(self.kind)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("{0} is already defined")]
    AlreadyDefined(Path),
    #[error("object {0} is not defined")]
    ObjectNotDefined(ObjectId),
    #[error("{path}: minimum instance count {min} exceeds maximum {max}")]
    InvalidCardinality { path: Path, min: u16, max: u16 },
    #[error("{0}: executable resources must have type None and vice versa")]
    ExecutableTypeMismatch(Path),
    #[error("{path}: default value must be a Resource node, found {found:?}")]
    BadDefaultValue { path: Path, found: NodeKind },
}

/// The registry of installed object and resource definitions.
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    objects: BTreeMap<ObjectId, ObjectDefinition>,
    resources: BTreeMap<(ObjectId, ResourceId), ResourceDefinition>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_object(&mut self, definition: ObjectDefinition) -> Result<(), DefinitionError> {
        let path = Path::object(definition.id);
        if self.objects.contains_key(&definition.id) {
            return Err(DefinitionError::AlreadyDefined(path));
        }
        if definition.min_instances > definition.max_instances {
            return Err(DefinitionError::InvalidCardinality {
                path,
                min: definition.min_instances,
                max: definition.max_instances,
            });
        }
        self.objects.insert(definition.id, definition);
        Ok(())
    }

    pub fn register_resource(
        &mut self,
        definition: ResourceDefinition,
    ) -> Result<(), DefinitionError> {
        let key = (definition.object_id, definition.resource_id);
        let path = Path::resource(definition.object_id, 0, definition.resource_id);

        if !self.objects.contains_key(&definition.object_id) {
            return Err(DefinitionError::ObjectNotDefined(definition.object_id));
        }
        if self.resources.contains_key(&key) {
            return Err(DefinitionError::AlreadyDefined(path));
        }
        if definition.min_instances > definition.max_instances {
            return Err(DefinitionError::InvalidCardinality {
                path,
                min: definition.min_instances,
                max: definition.max_instances,
            });
        }
        if definition.operations.is_executable() != (definition.kind == ResourceKind::None) {
            return Err(DefinitionError::ExecutableTypeMismatch(path));
        }
        if let Some(default) = &definition.default_value {
            if default.kind() != NodeKind::Resource {
                return Err(DefinitionError::BadDefaultValue {
                    path,
                    found: default.kind(),
                });
            }
        }

        self.resources.insert(key, definition);
        Ok(())
    }

    pub fn lookup_object(&self, object: ObjectId) -> Option<&ObjectDefinition> {
        self.objects.get(&object)
    }

    pub fn lookup_resource(
        &self,
        object: ObjectId,
        resource: ResourceId,
    ) -> Option<&ResourceDefinition> {
        self.resources.get(&(object, resource))
    }

    /// The first defined object id strictly after `previous` (`None` starts
    /// from the beginning).
    pub fn next_object(&self, previous: Option<ObjectId>) -> Option<ObjectId> {
        let lower = match previous {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        self.objects
            .range((lower, Bound::Unbounded))
            .map(|(id, _)| *id)
            .next()
    }

    /// The first resource id defined for `object` strictly after `previous`.
    pub fn next_resource(
        &self,
        object: ObjectId,
        previous: Option<ResourceId>,
    ) -> Option<ResourceId> {
        let lower = match previous {
            Some(id) => Bound::Excluded((object, id)),
            None => Bound::Included((object, 0)),
        };
        self.resources
            .range((lower, Bound::Included((object, ResourceId::MAX))))
            .map(|((_, resource), _)| *resource)
            .next()
    }

    pub fn is_resource_executable(&self, object: ObjectId, resource: ResourceId) -> bool {
        self.lookup_resource(object, resource)
            .is_some_and(|definition| definition.operations.is_executable())
    }

    pub fn is_resource_writable(&self, object: ObjectId, resource: ResourceId) -> bool {
        self.lookup_resource(object, resource)
            .is_some_and(|definition| definition.operations.is_writable())
    }

    pub fn objects(&self) -> impl Iterator<Item = &ObjectDefinition> {
        self.objects.values()
    }

    pub fn resources_of(&self, object: ObjectId) -> impl Iterator<Item = &ResourceDefinition> {
        self.resources
            .range((object, 0)..=(object, ResourceId::MAX))
            .map(|(_, definition)| definition)
    }
}
