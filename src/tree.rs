//! The neutral four-level tree exchanged between codecs and the store.
//!
//! ```txt
//!     Object
//!       +-- ObjectInstance
//!             +-- Resource
//!                   +-- ResourceInstance (carries the value bytes)
//! ```
//!
//! Codecs decode wire payloads into this shape and encode it back out; the
//! engine walks it to validate a request against the definitions and origin
//! policy before committing anything to the store. Nodes carry two request
//! flags: `create` (the node names an entity the request wants created) and
//! `replace` (the node's children replace, rather than update, what the
//! store holds).

use crate::types::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Object,
    ObjectInstance,
    Resource,
    ResourceInstance,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    kind: NodeKind,
    /// Absent only on an `ObjectInstance` whose id the store should allocate.
    id: Option<u16>,
    /// Value bytes, present on `ResourceInstance` nodes only.
    value: Option<Vec<u8>>,
    create: bool,
    replace: bool,
    children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn object(id: u16) -> Self {
        Self::new(NodeKind::Object, Some(id))
    }

    pub fn object_instance(id: Option<u16>) -> Self {
        Self::new(NodeKind::ObjectInstance, id)
    }

    pub fn resource(id: u16) -> Self {
        Self::new(NodeKind::Resource, Some(id))
    }

    pub fn resource_instance(id: u16, value: Vec<u8>) -> Self {
        let mut node = Self::new(NodeKind::ResourceInstance, Some(id));
        node.value = Some(value);
        node
    }

    fn new(kind: NodeKind, id: Option<u16>) -> Self {
        Self {
            kind,
            id,
            value: None,
            create: false,
            replace: false,
            children: vec![],
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn id(&self) -> Option<u16> {
        self.id
    }

    pub fn set_id(&mut self, id: Option<u16>) {
        self.id = id;
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn is_create(&self) -> bool {
        self.create
    }

    pub fn set_create(&mut self, create: bool) {
        self.create = create;
    }

    pub fn is_replace(&self) -> bool {
        self.replace
    }

    pub fn set_replace(&mut self, replace: bool) {
        self.replace = replace;
    }

    /// Insert a child, keeping children ordered by id. A child with the same
    /// id as an existing one replaces it.
    pub fn add_child(&mut self, child: TreeNode) {
        match self
            .children
            .binary_search_by(|existing| existing.id.cmp(&child.id))
        {
            Ok(at) => self.children[at] = child,
            Err(at) => self.children.insert(at, child),
        }
    }

    pub fn children(&self) -> impl Iterator<Item = &TreeNode> {
        self.children.iter()
    }

    pub fn children_mut(&mut self) -> impl Iterator<Item = &mut TreeNode> {
        self.children.iter_mut()
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn first_child(&self) -> Option<&TreeNode> {
        self.children.first()
    }

    pub fn first_child_mut(&mut self) -> Option<&mut TreeNode> {
        self.children.first_mut()
    }

    pub fn find_child(&self, id: u16) -> Option<&TreeNode> {
        self.children
            .binary_search_by(|existing| existing.id.cmp(&Some(id)))
            .ok()
            .map(|at| &self.children[at])
    }

    /// Wrap an instance-level node in an object node, as when a `POST /O`
    /// payload carries resources without naming an instance.
    pub fn wrap_in_object(self, object_id: u16) -> TreeNode {
        let mut object = TreeNode::object(object_id);
        object.add_child(self);
        object
    }
}

/// Drop every path that is covered by another path in the list.
///
/// A request naming both `/3/0` and `/3/0/1` only needs the former; the
/// deeper target is reached through its ancestor. Applied on every outbound
/// write-request build.
pub fn remove_covered_paths(paths: &mut Vec<Path>) {
    let snapshot = paths.clone();
    paths.retain(|path| {
        !snapshot
            .iter()
            .any(|other| other != path && other.covers(path))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_stay_sorted_and_deduplicated() {
        let mut resource = TreeNode::resource(5);
        resource.add_child(TreeNode::resource_instance(2, vec![2]));
        resource.add_child(TreeNode::resource_instance(0, vec![0]));
        resource.add_child(TreeNode::resource_instance(1, vec![1]));
        resource.add_child(TreeNode::resource_instance(1, vec![9]));

        let ids: Vec<_> = resource.children().map(|child| child.id()).collect();
        assert_eq!(ids, [Some(0), Some(1), Some(2)]);
        assert_eq!(resource.find_child(1).unwrap().value(), Some(&[9u8][..]));
    }

    #[test]
    fn wrap_in_object_nests_the_instance() {
        let mut instance = TreeNode::object_instance(None);
        instance.add_child(TreeNode::resource(1));

        let object = instance.wrap_in_object(9);
        assert_eq!(object.kind(), NodeKind::Object);
        assert_eq!(object.id(), Some(9));
        assert_eq!(object.first_child().unwrap().kind(), NodeKind::ObjectInstance);
    }

    #[test]
    fn covered_paths_are_removed() {
        let mut paths = vec![
            Path::instance(3, 0),
            Path::resource(3, 0, 1),
            Path::resource(4, 0, 1),
        ];
        remove_covered_paths(&mut paths);
        assert_eq!(paths, vec![Path::instance(3, 0), Path::resource(4, 0, 1)]);
    }

    #[test]
    fn identical_paths_survive_removal() {
        let mut paths = vec![Path::instance(3, 0), Path::instance(3, 0)];
        remove_covered_paths(&mut paths);
        assert_eq!(paths.len(), 2);
    }
}
