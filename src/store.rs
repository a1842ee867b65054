//! The concrete instance store and its existence index.
//!
//! Two representations coexist and are kept consistent behind one type:
//!
//! 1. the **value store**, a flat `(object, instance, resource, index) ->
//!    bytes` mapping in key order, and
//! 2. the **object tree**, a sparse four-level index answering existence and
//!    ordered successor queries without scanning the values.
//!
//! The store is deliberately schema-blind: cardinality limits and type rules
//! are enforced by the engine against the definition registry before any of
//! these methods run. What the store does guarantee is structural coherence:
//! a value exists iff its tree path exists, writes require the owning
//! resource, and deletes take the whole subtree with them.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use thiserror::Error;

use crate::types::{InstanceId, ObjectId, Path, ResourceId, ResourceInstanceId};

type StoreKey = (ObjectId, InstanceId, ResourceId, ResourceInstanceId);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{0} does not exist")]
    NotFound(Path),
    #[error("cannot create another instance of object {0}")]
    CannotCreate(ObjectId),
    #[error("{0} already exists")]
    AlreadyExists(Path),
}

#[derive(Debug, Default)]
pub struct ObjectStore {
    values: BTreeMap<StoreKey, Vec<u8>>,
    tree: BTreeMap<ObjectId, BTreeMap<InstanceId, BTreeMap<ResourceId, BTreeSet<ResourceInstanceId>>>>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an object known to the tree. Called when its definition is
    /// registered; an object node with no instances answers `exists(/O)`
    /// affirmatively and anchors successor queries.
    pub fn add_object(&mut self, object: ObjectId) {
        self.tree.entry(object).or_default();
    }

    pub fn exists(&self, path: &Path) -> bool {
        let Some(object) = path.object else {
            return true; // the root always exists
        };
        let Some(instances) = self.tree.get(&object) else {
            return false;
        };
        let Some(instance) = path.instance else {
            return true;
        };
        let Some(resources) = instances.get(&instance) else {
            return false;
        };
        let Some(resource) = path.resource else {
            return true;
        };
        let Some(indices) = resources.get(&resource) else {
            return false;
        };
        match path.resource_instance {
            Some(index) => indices.contains(&index),
            None => true,
        }
    }

    /// Allocate an object instance. A caller-supplied id must be free; with
    /// no id the lowest free slot in `[0, max_instances)` is used. Fails with
    /// `CannotCreate` when the object already holds `max_instances`
    /// instances or the requested id is occupied.
    pub fn create_instance(
        &mut self,
        object: ObjectId,
        instance: Option<InstanceId>,
        max_instances: u16,
    ) -> Result<InstanceId, StoreError> {
        let instances = self
            .tree
            .get_mut(&object)
            .ok_or(StoreError::NotFound(Path::object(object)))?;

        if instances.len() >= usize::from(max_instances) {
            return Err(StoreError::CannotCreate(object));
        }

        let id = match instance {
            Some(id) => {
                if instances.contains_key(&id) {
                    return Err(StoreError::CannotCreate(object));
                }
                id
            }
            None => (0..max_instances)
                .find(|candidate| !instances.contains_key(candidate))
                .ok_or(StoreError::CannotCreate(object))?,
        };

        instances.insert(id, BTreeMap::new());
        Ok(id)
    }

    /// Allocate an (empty) resource under an existing instance.
    pub fn create_resource(
        &mut self,
        object: ObjectId,
        instance: InstanceId,
        resource: ResourceId,
    ) -> Result<(), StoreError> {
        let resources = self
            .tree
            .get_mut(&object)
            .and_then(|instances| instances.get_mut(&instance))
            .ok_or(StoreError::NotFound(Path::instance(object, instance)))?;

        if resources.contains_key(&resource) {
            return Err(StoreError::AlreadyExists(Path::resource(
                object, instance, resource,
            )));
        }
        resources.insert(resource, BTreeSet::new());
        Ok(())
    }

    /// Overwrite one resource-instance value. The owning resource must
    /// already exist; the resource-instance entry is added as needed.
    pub fn write(
        &mut self,
        object: ObjectId,
        instance: InstanceId,
        resource: ResourceId,
        index: ResourceInstanceId,
        bytes: Vec<u8>,
    ) -> Result<(), StoreError> {
        let indices = self
            .tree
            .get_mut(&object)
            .and_then(|instances| instances.get_mut(&instance))
            .and_then(|resources| resources.get_mut(&resource))
            .ok_or(StoreError::NotFound(Path::resource(
                object, instance, resource,
            )))?;

        indices.insert(index);
        self.values.insert((object, instance, resource, index), bytes);
        Ok(())
    }

    pub fn read(
        &self,
        object: ObjectId,
        instance: InstanceId,
        resource: ResourceId,
        index: ResourceInstanceId,
    ) -> Option<&[u8]> {
        self.values
            .get(&(object, instance, resource, index))
            .map(Vec::as_slice)
    }

    /// Remove the subtree at `path`. Deleting an object keeps its (defined)
    /// object node but drops every instance. Fails `NotFound` when the path
    /// does not exist.
    pub fn delete(&mut self, path: &Path) -> Result<(), StoreError> {
        if !self.exists(path) {
            return Err(StoreError::NotFound(*path));
        }

        let object = match path.object {
            Some(object) => object,
            None => {
                // Root delete clears instances of every object.
                let objects: Vec<_> = self.tree.keys().copied().collect();
                for object in objects {
                    self.tree.insert(object, BTreeMap::new());
                }
                self.values.clear();
                return Ok(());
            }
        };

        match (path.instance, path.resource, path.resource_instance) {
            (None, ..) => {
                self.tree.insert(object, BTreeMap::new());
                self.drop_values(&Path::object(object));
            }
            (Some(instance), None, _) => {
                if let Some(instances) = self.tree.get_mut(&object) {
                    instances.remove(&instance);
                }
                self.drop_values(&Path::instance(object, instance));
            }
            (Some(instance), Some(resource), None) => {
                if let Some(resources) = self
                    .tree
                    .get_mut(&object)
                    .and_then(|instances| instances.get_mut(&instance))
                {
                    resources.remove(&resource);
                }
                self.drop_values(&Path::resource(object, instance, resource));
            }
            (Some(instance), Some(resource), Some(index)) => {
                if let Some(indices) = self
                    .tree
                    .get_mut(&object)
                    .and_then(|instances| instances.get_mut(&instance))
                    .and_then(|resources| resources.get_mut(&resource))
                {
                    indices.remove(&index);
                }
                self.values.remove(&(object, instance, resource, index));
            }
        }
        Ok(())
    }

    fn drop_values(&mut self, prefix: &Path) {
        self.values
            .retain(|&(object, instance, resource, index), _| {
                !prefix.covers(&Path::resource_instance(object, instance, resource, index))
            });
    }

    pub fn instance_count(&self, object: ObjectId) -> usize {
        self.tree
            .get(&object)
            .map(BTreeMap::len)
            .unwrap_or_default()
    }

    pub fn resource_instance_count(
        &self,
        object: ObjectId,
        instance: InstanceId,
        resource: ResourceId,
    ) -> usize {
        self.tree
            .get(&object)
            .and_then(|instances| instances.get(&instance))
            .and_then(|resources| resources.get(&resource))
            .map(BTreeSet::len)
            .unwrap_or_default()
    }

    /// The first defined object id strictly after `previous`.
    pub fn next_object(&self, previous: Option<ObjectId>) -> Option<ObjectId> {
        let lower = match previous {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        self.tree.range((lower, Bound::Unbounded)).map(|(id, _)| *id).next()
    }

    pub fn next_instance(
        &self,
        object: ObjectId,
        previous: Option<InstanceId>,
    ) -> Option<InstanceId> {
        let lower = match previous {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        self.tree
            .get(&object)?
            .range((lower, Bound::Unbounded))
            .map(|(id, _)| *id)
            .next()
    }

    pub fn next_resource(
        &self,
        object: ObjectId,
        instance: InstanceId,
        previous: Option<ResourceId>,
    ) -> Option<ResourceId> {
        let lower = match previous {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        self.tree
            .get(&object)?
            .get(&instance)?
            .range((lower, Bound::Unbounded))
            .map(|(id, _)| *id)
            .next()
    }

    pub fn next_resource_instance(
        &self,
        object: ObjectId,
        instance: InstanceId,
        resource: ResourceId,
        previous: Option<ResourceInstanceId>,
    ) -> Option<ResourceInstanceId> {
        let lower = match previous {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        self.tree
            .get(&object)?
            .get(&instance)?
            .get(&resource)?
            .range((lower, Bound::Unbounded))
            .copied()
            .next()
    }

    /// Every stored value in key order.
    pub fn values(&self) -> impl Iterator<Item = (Path, &[u8])> {
        self.values
            .iter()
            .map(|(&(object, instance, resource, index), bytes)| {
                (
                    Path::resource_instance(object, instance, resource, index),
                    bytes.as_slice(),
                )
            })
    }

    /// Structural coherence between the value store and the tree: every
    /// value has a tree leaf and every tree leaf has a value.
    #[cfg(test)]
    fn is_coherent(&self) -> bool {
        let leaves: BTreeSet<StoreKey> = self
            .tree
            .iter()
            .flat_map(|(&object, instances)| {
                instances.iter().flat_map(move |(&instance, resources)| {
                    resources.iter().flat_map(move |(&resource, indices)| {
                        indices
                            .iter()
                            .map(move |&index| (object, instance, resource, index))
                    })
                })
            })
            .collect();
        let values: BTreeSet<StoreKey> = self.values.keys().copied().collect();
        leaves == values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_instance() -> ObjectStore {
        let mut store = ObjectStore::new();
        store.add_object(3);
        store.create_instance(3, Some(0), 4).unwrap();
        store.create_resource(3, 0, 9).unwrap();
        store
    }

    #[test]
    fn defined_objects_exist_without_instances() {
        let mut store = ObjectStore::new();
        store.add_object(3);
        assert!(store.exists(&Path::object(3)));
        assert!(!store.exists(&Path::instance(3, 0)));
        assert!(!store.exists(&Path::object(4)));
    }

    #[test]
    fn instance_allocation_picks_lowest_free_slot() {
        let mut store = ObjectStore::new();
        store.add_object(3);
        assert_eq!(store.create_instance(3, None, 3).unwrap(), 0);
        assert_eq!(store.create_instance(3, Some(2), 3).unwrap(), 2);
        assert_eq!(store.create_instance(3, None, 3).unwrap(), 1);
        assert_eq!(
            store.create_instance(3, None, 3),
            Err(StoreError::CannotCreate(3))
        );
    }

    #[test]
    fn occupied_slots_cannot_be_created_again() {
        let mut store = ObjectStore::new();
        store.add_object(3);
        store.create_instance(3, Some(1), 4).unwrap();
        assert_eq!(
            store.create_instance(3, Some(1), 4),
            Err(StoreError::CannotCreate(3))
        );
    }

    #[test]
    fn writes_require_the_owning_resource() {
        let mut store = store_with_instance();
        assert_eq!(
            store.write(3, 0, 14, 0, b"x".to_vec()),
            Err(StoreError::NotFound(Path::resource(3, 0, 14)))
        );
        store.write(3, 0, 9, 0, b"42".to_vec()).unwrap();
        assert_eq!(store.read(3, 0, 9, 0), Some(&b"42"[..]));
        assert!(store.is_coherent());
    }

    #[test]
    fn delete_takes_the_subtree() {
        let mut store = store_with_instance();
        store.write(3, 0, 9, 0, b"a".to_vec()).unwrap();
        store.write(3, 0, 9, 1, b"b".to_vec()).unwrap();
        store.create_resource(3, 0, 10).unwrap();
        store.write(3, 0, 10, 0, b"c".to_vec()).unwrap();

        store.delete(&Path::resource(3, 0, 9)).unwrap();
        assert!(!store.exists(&Path::resource(3, 0, 9)));
        assert!(store.exists(&Path::resource(3, 0, 10)));
        assert!(store.is_coherent());

        store.delete(&Path::instance(3, 0)).unwrap();
        assert!(!store.exists(&Path::instance(3, 0)));
        assert!(store.exists(&Path::object(3)));
        assert_eq!(store.values().count(), 0);
        assert!(store.is_coherent());
    }

    #[test]
    fn delete_of_missing_path_reports_not_found() {
        let mut store = store_with_instance();
        assert_eq!(
            store.delete(&Path::instance(3, 7)),
            Err(StoreError::NotFound(Path::instance(3, 7)))
        );
    }

    #[test]
    fn root_delete_clears_every_instance_but_keeps_objects() {
        let mut store = store_with_instance();
        store.add_object(4);
        store.create_instance(4, Some(0), 2).unwrap();
        store.write(3, 0, 9, 0, b"x".to_vec()).unwrap();

        store.delete(&Path::root()).unwrap();
        assert!(store.exists(&Path::object(3)));
        assert!(store.exists(&Path::object(4)));
        assert_eq!(store.instance_count(3), 0);
        assert_eq!(store.instance_count(4), 0);
        assert!(store.is_coherent());
    }

    #[test]
    fn successor_queries_are_strictly_ascending() {
        let mut store = ObjectStore::new();
        store.add_object(1);
        store.add_object(3);
        store.create_instance(3, Some(0), 8).unwrap();
        store.create_instance(3, Some(5), 8).unwrap();
        store.create_resource(3, 0, 9).unwrap();
        store.write(3, 0, 9, 1, b"a".to_vec()).unwrap();
        store.write(3, 0, 9, 4, b"b".to_vec()).unwrap();

        assert_eq!(store.next_object(None), Some(1));
        assert_eq!(store.next_object(Some(1)), Some(3));
        assert_eq!(store.next_object(Some(3)), None);

        assert_eq!(store.next_instance(3, None), Some(0));
        assert_eq!(store.next_instance(3, Some(0)), Some(5));
        assert_eq!(store.next_instance(3, Some(5)), None);

        assert_eq!(store.next_resource_instance(3, 0, 9, None), Some(1));
        assert_eq!(store.next_resource_instance(3, 0, 9, Some(1)), Some(4));
        assert_eq!(store.next_resource_instance(3, 0, 9, Some(4)), None);
    }
}
