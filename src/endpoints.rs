//! The endpoint routing table.
//!
//! Every CoAP-visible path is a `(path, kind)` pair, added as definitions
//! are installed and entities are created, and removed as they are deleted.
//! GET requires an exact match; POST, PUT and DELETE walk ancestors so that
//! e.g. `POST /3/0` can create `/3/0/1` as long as `/3/0` (or `/3`) exists.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// An `/O`, `/O/I`, `/O/I/R` or `/O/I/R/i` device-management path.
    DeviceManagement,
    /// `/bs`: bootstrap request endpoint.
    Bootstrap,
    /// `/rd`: registration endpoint (server role).
    Registration,
    /// `/rd/<location>`: one registered client's endpoint (server role).
    RegistrationUpdate(u32),
}

#[derive(Debug, Default)]
pub struct EndpointList {
    endpoints: BTreeMap<String, EndpointKind>,
}

impl EndpointList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a path. Re-adding an existing path is a no-op.
    pub fn add(&mut self, path: impl Into<String>, kind: EndpointKind) {
        self.endpoints.entry(path.into()).or_insert(kind);
    }

    pub fn remove(&mut self, path: &str) -> bool {
        self.endpoints.remove(path).is_some()
    }

    /// Drop every endpoint under (and including) `prefix`.
    pub fn remove_subtree(&mut self, prefix: &str) {
        self.endpoints.retain(|path, _| {
            path != prefix && !path.starts_with(&format!("{prefix}/"))
        });
    }

    pub fn find_exact(&self, path: &str) -> Option<EndpointKind> {
        self.endpoints.get(path).copied()
    }

    /// The longest registered ancestor of `path`, the path itself included.
    pub fn find_ancestor(&self, path: &str) -> Option<(&str, EndpointKind)> {
        let mut candidate = path;
        loop {
            if let Some((key, kind)) = self.endpoints.get_key_value(candidate) {
                return Some((key.as_str(), *kind));
            }
            match candidate.rfind('/') {
                Some(0) | None => return None,
                Some(at) => candidate = &candidate[..at],
            }
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> EndpointList {
        let mut endpoints = EndpointList::new();
        endpoints.add("/bs", EndpointKind::Bootstrap);
        endpoints.add("/rd", EndpointKind::Registration);
        endpoints.add("/3", EndpointKind::DeviceManagement);
        endpoints.add("/3/0", EndpointKind::DeviceManagement);
        endpoints.add("/3/0/9", EndpointKind::DeviceManagement);
        endpoints
    }

    #[test]
    fn exact_match_is_exact() {
        let endpoints = table();
        assert_eq!(
            endpoints.find_exact("/3/0/9"),
            Some(EndpointKind::DeviceManagement)
        );
        assert_eq!(endpoints.find_exact("/3/0/1"), None);
    }

    #[test]
    fn ancestors_resolve_for_writes() {
        let endpoints = table();
        assert_eq!(
            endpoints.find_ancestor("/3/0/1"),
            Some(("/3/0", EndpointKind::DeviceManagement))
        );
        assert_eq!(
            endpoints.find_ancestor("/3/1/1"),
            Some(("/3", EndpointKind::DeviceManagement))
        );
        assert_eq!(endpoints.find_ancestor("/4/0"), None);
    }

    #[test]
    fn registration_locations_route_to_their_client() {
        let mut endpoints = table();
        endpoints.add("/rd/7", EndpointKind::RegistrationUpdate(7));
        assert_eq!(
            endpoints.find_ancestor("/rd/7"),
            Some(("/rd/7", EndpointKind::RegistrationUpdate(7)))
        );
        // An unknown location falls back to /rd, where the handler rejects it.
        assert_eq!(
            endpoints.find_ancestor("/rd/8"),
            Some(("/rd", EndpointKind::Registration))
        );
    }

    #[test]
    fn subtree_removal_takes_descendants_only() {
        let mut endpoints = table();
        endpoints.add("/30", EndpointKind::DeviceManagement);
        endpoints.remove_subtree("/3");
        assert_eq!(endpoints.find_exact("/3"), None);
        assert_eq!(endpoints.find_exact("/3/0"), None);
        assert_eq!(
            endpoints.find_exact("/30"),
            Some(EndpointKind::DeviceManagement)
        );
    }
}
