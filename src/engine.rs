//! The protocol engine: request dispatch, origin policy and the write
//! pipeline.
//!
//! Everything a peer can do arrives here as a decoded [`CoapRequest`] and
//! leaves as a [`CoapResponse`]. Writes are all-or-nothing: the request
//! payload is decoded into a neutral tree, the whole tree is validated
//! against the definitions and the origin policy, and only then is anything
//! committed to the store. The engine owns no sockets and no clock; daemons
//! feed it datagrams, responses and `tick(now_ms)`.

use std::net::SocketAddr;

use tracing::{debug, warn};

use crate::attributes::{self, AttributeStore, NotificationAttributes};
use crate::bootstrap::{self, ClientBootstrap, ProvisioningQueue};
use crate::coap::{
    self, CoapMethod, CoapRequest, CoapResponse, ObserveFlag, OutboundResponse, Transport,
};
use crate::codec::{self, link, ContentType, DecodeError, EncodeError};
use crate::definition::{DefinitionError, DefinitionRegistry, ObjectDefinition, ResourceDefinition};
use crate::endpoints::{EndpointKind, EndpointList};
use crate::objects;
use crate::observers::ObserverList;
use crate::registration::{BindingMode, Registrar, RegistrationTable};
use crate::store::{ObjectStore, StoreError};
use crate::tree::{NodeKind, TreeNode};
use crate::types::{
    InstanceId, ObjectId, Path, PathDepth, RequestOrigin, ResourceId, ResourceInstanceId,
    ResultCode, SECURITY_OBJECT, SERVER_OBJECT,
};
use crate::value::{self, ResourceKind};

/// Which half of the protocol this engine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Device: local object store, bootstrap client, registrar.
    Client,
    /// Management server: registration table, optionally the bootstrap
    /// provisioning role.
    Server { bootstrap: bool },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub role: Role,
    pub endpoint_name: String,
    /// Default response format when a request carries no Accept.
    pub default_content_type: Option<ContentType>,
    /// The bootstrap server the client machine should contact.
    pub bootstrap_server: Option<SocketAddr>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            role: Role::Client,
            endpoint_name: "lwm2m-client".to_owned(),
            default_content_type: None,
            bootstrap_server: None,
        }
    }
}

pub struct Engine {
    role: Role,
    definitions: DefinitionRegistry,
    store: ObjectStore,
    endpoints: EndpointList,
    attributes: AttributeStore,
    observers: ObserverList,
    registrations: RegistrationTable,
    registrar: Registrar,
    client_bootstrap: ClientBootstrap,
    provisioning: ProvisioningQueue,
    default_content_type: Option<ContentType>,
    /// The advertised object list changed; the next tick sends an Update.
    registration_dirty: bool,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let mut engine = Self {
            client_bootstrap: ClientBootstrap::new(
                config.endpoint_name.clone(),
                config.bootstrap_server,
            ),
            registrar: Registrar::new(config.endpoint_name.clone()),
            role: config.role,
            definitions: DefinitionRegistry::new(),
            store: ObjectStore::new(),
            endpoints: EndpointList::new(),
            attributes: AttributeStore::new(),
            observers: ObserverList::new(),
            registrations: RegistrationTable::new(),
            provisioning: ProvisioningQueue::new(),
            default_content_type: config.default_content_type,
            registration_dirty: false,
        };

        match engine.role {
            Role::Client => {
                engine.endpoints.add("/bs", EndpointKind::Bootstrap);
            }
            Role::Server { bootstrap } => {
                engine.endpoints.add("/rd", EndpointKind::Registration);
                if bootstrap {
                    engine.endpoints.add("/bs", EndpointKind::Bootstrap);
                }
            }
        }

        let mut standard = DefinitionRegistry::new();
        objects::register_standard_objects(&mut standard);
        // Route the standard set through define_object so endpoints and the
        // store index stay in step with the registry.
        for object in standard.objects() {
            let resources: Vec<_> = standard.resources_of(object.id).cloned().collect();
            engine
                .define_object(object.clone())
                .expect("standard objects define once");
            for resource in resources {
                engine
                    .define_resource(resource)
                    .expect("standard resources define once");
            }
        }
        engine
    }

    pub fn is_client(&self) -> bool {
        self.role == Role::Client
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn definitions(&self) -> &DefinitionRegistry {
        &self.definitions
    }

    pub fn registrations(&self) -> &RegistrationTable {
        &self.registrations
    }

    pub fn registrations_mut(&mut self) -> &mut RegistrationTable {
        &mut self.registrations
    }

    pub fn observers(&self) -> &ObserverList {
        &self.observers
    }

    pub fn bootstrap_state(&self) -> bootstrap::BootstrapState {
        self.client_bootstrap.state()
    }

    // ------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------

    pub fn define_object(&mut self, definition: ObjectDefinition) -> Result<(), DefinitionError> {
        let object = definition.id;
        self.definitions.register_object(definition)?;
        self.store.add_object(object);
        if self.is_client() {
            self.endpoints
                .add(format!("/{object}"), EndpointKind::DeviceManagement);
        }
        Ok(())
    }

    pub fn define_resource(
        &mut self,
        definition: ResourceDefinition,
    ) -> Result<(), DefinitionError> {
        self.definitions.register_resource(definition)
    }

    // ------------------------------------------------------------------
    // Store operations (Client-origin API, also used by the IPC layer)
    // ------------------------------------------------------------------

    /// Create an object instance, auto-creating every mandatory resource
    /// with its sensible default.
    pub fn create_object_instance(
        &mut self,
        object: ObjectId,
        instance: Option<InstanceId>,
    ) -> Result<InstanceId, ResultCode> {
        let definition = self
            .definitions
            .lookup_object(object)
            .ok_or(ResultCode::NotFound)?;
        let max_instances = definition.max_instances;
        let handler = definition.handler.clone();

        let instance = self
            .store
            .create_instance(object, instance, max_instances)
            .map_err(|err| match err {
                StoreError::CannotCreate(_) => ResultCode::MethodNotAllowed,
                _ => ResultCode::NotFound,
            })?;

        if let Some(handler) = handler {
            handler.instance_created(object, instance);
        }
        if self.is_client() {
            self.endpoints
                .add(format!("/{object}/{instance}"), EndpointKind::DeviceManagement);
        }

        let mandatory: Vec<ResourceDefinition> = self
            .definitions
            .resources_of(object)
            .filter(|definition| definition.is_mandatory())
            .cloned()
            .collect();
        for definition in mandatory {
            self.populate_resource(object, instance, &definition)
                .map_err(|_| ResultCode::InternalError)?;
        }

        self.registration_dirty = true;
        debug!(object, instance, "object instance created");
        Ok(instance)
    }

    /// Create (and default-fill) one resource under an existing instance.
    fn populate_resource(
        &mut self,
        object: ObjectId,
        instance: InstanceId,
        definition: &ResourceDefinition,
    ) -> Result<(), StoreError> {
        self.store
            .create_resource(object, instance, definition.resource_id)?;
        if self.is_client() {
            self.endpoints.add(
                format!("/{object}/{instance}/{}", definition.resource_id),
                EndpointKind::DeviceManagement,
            );
        }
        // Executable resources carry no stored value.
        if definition.kind == ResourceKind::None {
            return Ok(());
        }
        for (index, bytes) in definition.default_instances() {
            self.write_raw(object, instance, definition.resource_id, index, bytes)?;
        }
        Ok(())
    }

    /// Create an optional resource at `(object, instance, resource)`.
    pub fn create_optional_resource(
        &mut self,
        object: ObjectId,
        instance: InstanceId,
        resource: ResourceId,
    ) -> Result<(), ResultCode> {
        let definition = self
            .definitions
            .lookup_resource(object, resource)
            .ok_or(ResultCode::NotFound)?
            .clone();

        if self.store.exists(&Path::resource(object, instance, resource)) {
            warn!(object, instance, resource, "resource already exists");
            return Err(ResultCode::MethodNotAllowed);
        }
        if !self.store.exists(&Path::instance(object, instance)) {
            warn!(object, instance, "object instance does not exist");
            return Err(ResultCode::MethodNotAllowed);
        }

        self.populate_resource(object, instance, &definition)
            .map_err(|_| ResultCode::InternalError)?;
        if let Some(handler) = &definition.handler {
            handler.created(&Path::resource(object, instance, resource));
        }
        Ok(())
    }

    /// Write one resource-instance value (store-ready bytes).
    pub fn write_resource_instance(
        &mut self,
        object: ObjectId,
        instance: InstanceId,
        resource: ResourceId,
        index: ResourceInstanceId,
        bytes: Vec<u8>,
    ) -> Result<(), ResultCode> {
        let definition = self
            .definitions
            .lookup_resource(object, resource)
            .ok_or(ResultCode::NotFound)?;
        if definition.kind == ResourceKind::None {
            return Err(ResultCode::MethodNotAllowed);
        }
        if definition.is_single_instance() && index != 0 {
            return Err(ResultCode::MethodNotAllowed);
        }
        if !self.store.exists(&Path::instance(object, instance)) {
            return Err(ResultCode::NotFound);
        }

        if let Some(handler) = &definition.handler {
            let path = Path::resource_instance(object, instance, resource, index);
            let result = handler.write(&path, &bytes);
            if !result.is_success() {
                return Err(result);
            }
        }

        // The owning resource materializes on first write.
        if !self.store.exists(&Path::resource(object, instance, resource)) {
            self.store
                .create_resource(object, instance, resource)
                .map_err(|_| ResultCode::InternalError)?;
            if self.is_client() {
                self.endpoints.add(
                    format!("/{object}/{instance}/{resource}"),
                    EndpointKind::DeviceManagement,
                );
            }
        }

        self.write_raw(object, instance, resource, index, bytes)
            .map_err(|_| ResultCode::InternalError)
    }

    /// The store write plus everything that hangs off it: the endpoint for
    /// the new resource instance and observer change marking.
    fn write_raw(
        &mut self,
        object: ObjectId,
        instance: InstanceId,
        resource: ResourceId,
        index: ResourceInstanceId,
        bytes: Vec<u8>,
    ) -> Result<(), StoreError> {
        let kind = self
            .definitions
            .lookup_resource(object, resource)
            .map(|definition| definition.kind);
        let changed = self.store.read(object, instance, resource, index) != Some(&bytes[..]);

        self.store.write(object, instance, resource, index, bytes.clone())?;
        if self.is_client() {
            self.endpoints.add(
                format!("/{object}/{instance}/{resource}/{index}"),
                EndpointKind::DeviceManagement,
            );
        }

        if changed {
            let numeric = kind.and_then(|kind| value::numeric_value(kind, &bytes));
            let written = Path::resource_instance(object, instance, resource, index);
            let attributes = &self.attributes;
            let store = &self.store;
            self.observers
                .mark_changed(&written, &bytes, numeric, |obs| {
                    effective_attributes(attributes, store, obs.short_server_id, &obs.path)
                });
        }
        Ok(())
    }

    /// Delete the subtree at `path` under the origin policy. A replace-write
    /// models its delete phase with `replace = true`, which relaxes the
    /// rules the composite operation satisfies as a whole.
    pub fn delete(&mut self, origin: RequestOrigin, path: &Path, replace: bool) -> ResultCode {
        // Resource-level DELETE is for the client and bootstrap server only.
        if path.resource.is_some() && origin == RequestOrigin::Server && !replace {
            return ResultCode::MethodNotAllowed;
        }

        let Some(object) = path.object else {
            // Delete on '/': bootstrap only, everything except Security.
            if origin != RequestOrigin::BootstrapServer {
                return ResultCode::Unauthorized;
            }
            let mut object = self.store.next_object(None);
            while let Some(id) = object {
                if id != SECURITY_OBJECT {
                    // Best-effort: empty objects simply have nothing to delete.
                    self.delete(origin, &Path::object(id), replace);
                }
                object = self.store.next_object(Some(id));
            }
            return ResultCode::SuccessDeleted;
        };

        if path.instance.is_none() && origin == RequestOrigin::Server {
            // An object instance is required for CoAP delete requests.
            return ResultCode::MethodNotAllowed;
        }

        let Some(definition) = self.definitions.lookup_object(object) else {
            warn!(object, "no definition for object");
            return ResultCode::NotFound;
        };

        if !replace
            && path.instance.is_some()
            && path.resource.is_none()
            && definition.is_single_instance()
            && definition.is_mandatory()
            && self.store.instance_count(object) <= definition.min_instances as usize
        {
            // A mandatory single-instance object must keep its instance,
            // whoever asks. A replace-write recreates it immediately and an
            // object-level wipe is governed by the origin checks alone.
            return ResultCode::MethodNotAllowed;
        }
        if origin == RequestOrigin::Server
            && matches!(object, SECURITY_OBJECT | SERVER_OBJECT)
        {
            return ResultCode::Unauthorized;
        }
        if !self.store.exists(path) {
            return ResultCode::NotFound;
        }

        if let (Some(handler), Some(instance)) = (&definition.handler, path.instance) {
            if path.resource.is_none() {
                let result = handler.instance_deleting(object, instance);
                if !result.is_success() {
                    return result;
                }
            }
        }

        // The security object itself survives even a bootstrap wipe.
        if object == SECURITY_OBJECT && path.instance.is_none() {
            return ResultCode::SuccessDeleted;
        }

        if self.store.delete(path).is_err() {
            return ResultCode::NotFound;
        }
        if self.is_client() {
            self.endpoints.remove_subtree(&path.to_string());
            if path.instance.is_none() {
                // Object-level delete keeps the (still defined) object
                // endpoint itself.
                self.endpoints
                    .add(format!("/{object}"), EndpointKind::DeviceManagement);
            }
        }

        let cancelled = self.observers.cancel_covered(path);
        if cancelled > 0 {
            debug!(%path, cancelled, "observations cancelled by delete");
        }
        self.attributes.remove_subtree(path);
        if path.resource.is_none() {
            self.registration_dirty = true;
        }
        ResultCode::SuccessDeleted
    }

    /// Execute a resource with the request payload as its argument.
    pub fn execute(&mut self, path: &Path, arguments: &[u8]) -> ResultCode {
        let (Some(object), Some(instance), Some(resource)) =
            (path.object, path.instance, path.resource)
        else {
            return ResultCode::BadRequest;
        };
        let Some(definition) = self.definitions.lookup_resource(object, resource) else {
            return ResultCode::NotFound;
        };
        if !definition.operations.is_executable() {
            return ResultCode::MethodNotAllowed;
        }
        if !self.store.exists(&Path::instance(object, instance)) {
            return ResultCode::NotFound;
        }
        match &definition.handler {
            Some(handler) => handler.execute(path, arguments),
            None => {
                warn!(%path, "executable resource has no handler");
                ResultCode::MethodNotAllowed
            }
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Build the value tree at `path` for `origin`.
    pub fn read_tree(&self, origin: RequestOrigin, path: &Path) -> Result<TreeNode, ResultCode> {
        if path.object == Some(SECURITY_OBJECT) && origin == RequestOrigin::Server {
            return Err(ResultCode::Unauthorized);
        }
        if !self.store.exists(path) {
            return Err(ResultCode::NotFound);
        }

        match path.depth() {
            PathDepth::Root => Err(ResultCode::MethodNotAllowed),
            PathDepth::Object => {
                let object = path.object.unwrap();
                let mut node = TreeNode::object(object);
                let mut instance = self.store.next_instance(object, None);
                while let Some(id) = instance {
                    node.add_child(self.read_instance(origin, object, id)?);
                    instance = self.store.next_instance(object, Some(id));
                }
                Ok(node)
            }
            PathDepth::ObjectInstance => {
                self.read_instance(origin, path.object.unwrap(), path.instance.unwrap())
            }
            PathDepth::Resource | PathDepth::ResourceInstance => {
                let (object, instance, resource) = (
                    path.object.unwrap(),
                    path.instance.unwrap(),
                    path.resource.unwrap(),
                );
                let definition = self
                    .definitions
                    .lookup_resource(object, resource)
                    .ok_or(ResultCode::NotFound)?;
                if definition.operations.is_executable() {
                    return Err(ResultCode::MethodNotAllowed);
                }
                if origin == RequestOrigin::Server && !definition.operations.is_readable() {
                    return Err(ResultCode::MethodNotAllowed);
                }
                self.read_resource(object, instance, resource, path.resource_instance)
                    .ok_or(ResultCode::NotFound)
            }
        }
    }

    fn read_instance(
        &self,
        origin: RequestOrigin,
        object: ObjectId,
        instance: InstanceId,
    ) -> Result<TreeNode, ResultCode> {
        let mut node = TreeNode::object_instance(Some(instance));
        let mut resource = self.store.next_resource(object, instance, None);
        while let Some(id) = resource {
            if let Some(definition) = self.definitions.lookup_resource(object, id) {
                let server_blocked = origin == RequestOrigin::Server
                    && !definition.operations.is_readable();
                if !definition.operations.is_executable() && !server_blocked {
                    if let Some(resource_node) = self.read_resource(object, instance, id, None) {
                        node.add_child(resource_node);
                    }
                }
            }
            resource = self.store.next_resource(object, instance, Some(id));
        }
        Ok(node)
    }

    fn read_resource(
        &self,
        object: ObjectId,
        instance: InstanceId,
        resource: ResourceId,
        only_index: Option<ResourceInstanceId>,
    ) -> Option<TreeNode> {
        let handler = self
            .definitions
            .lookup_resource(object, resource)
            .and_then(|definition| definition.handler.clone());

        let mut node = TreeNode::resource(resource);
        let mut index = self
            .store
            .next_resource_instance(object, instance, resource, None);
        while let Some(i) = index {
            if only_index.is_none() || only_index == Some(i) {
                let path = Path::resource_instance(object, instance, resource, i);
                let bytes = match handler.as_ref().and_then(|handler| handler.read(&path)) {
                    Some(Ok(bytes)) => Some(bytes),
                    Some(Err(_)) => None,
                    None => self
                        .store
                        .read(object, instance, resource, i)
                        .map(<[u8]>::to_vec),
                };
                if let Some(bytes) = bytes {
                    node.add_child(TreeNode::resource_instance(i, bytes));
                }
            }
            index = self
                .store
                .next_resource_instance(object, instance, resource, Some(i));
        }

        (node.child_count() > 0).then_some(node)
    }

    /// The current resource-instance bytes (index 0) for snapshotting.
    fn resource_snapshot(&self, path: &Path) -> Option<(Vec<u8>, Option<f64>)> {
        let (object, instance, resource) = (path.object?, path.instance?, path.resource?);
        let index = path.resource_instance.unwrap_or(0);
        let bytes = self.store.read(object, instance, resource, index)?.to_vec();
        let numeric = self
            .definitions
            .lookup_resource(object, resource)
            .and_then(|definition| value::numeric_value(definition.kind, &bytes));
        Some((bytes, numeric))
    }

    // ------------------------------------------------------------------
    // Write permission walk and commit
    // ------------------------------------------------------------------

    fn resource_exists(
        &self,
        object: ObjectId,
        instance: Option<InstanceId>,
        resource: ResourceId,
    ) -> bool {
        instance.is_some_and(|instance| {
            self.store.exists(&Path::resource(object, instance, resource))
        })
    }

    fn check_resource_node(
        &self,
        origin: RequestOrigin,
        node: &TreeNode,
        object: ObjectId,
        instance: Option<InstanceId>,
        creating_instance: bool,
    ) -> ResultCode {
        let resource = node.id().expect("resource nodes always carry an id");

        // Only the bootstrap server and the local client may touch /0.
        if object == SECURITY_OBJECT
            && !matches!(
                origin,
                RequestOrigin::BootstrapServer | RequestOrigin::Client
            )
        {
            warn!(object, resource, "origin may not write to the security object");
            return ResultCode::Unauthorized;
        }

        let Some(definition) = self.definitions.lookup_resource(object, resource) else {
            warn!(object, resource, "resource not defined");
            return ResultCode::NotFound;
        };

        if node.is_create() && self.resource_exists(object, instance, resource) {
            return ResultCode::BadRequest;
        }

        // The bootstrap server bypasses the operations mask.
        if origin == RequestOrigin::Server
            && !definition.operations.is_writable()
            && !creating_instance
        {
            warn!(object, resource, "resource is not writable");
            return ResultCode::MethodNotAllowed;
        }

        let mut new_elements = 0;
        for child in node.children() {
            let index = child.id().unwrap_or(0);
            if definition.is_single_instance() && index != 0 {
                return ResultCode::MethodNotAllowed;
            }
            let present = instance.is_some_and(|instance| {
                self.store
                    .exists(&Path::resource_instance(object, instance, resource, index))
            });
            if !present {
                new_elements += 1;
            }
        }
        let existing = if node.is_replace() {
            0
        } else {
            match instance {
                Some(instance) => self.store.resource_instance_count(object, instance, resource),
                None => 0,
            }
        };
        if new_elements + existing > definition.max_instances as usize {
            return ResultCode::MethodNotAllowed;
        }
        ResultCode::Success
    }

    fn check_instance_node(
        &self,
        origin: RequestOrigin,
        node: &TreeNode,
        object: ObjectId,
        creating_instance: bool,
    ) -> ResultCode {
        let creating = creating_instance || node.is_create();
        let instance = node.id();

        let Some(definition) = self.definitions.lookup_object(object) else {
            return ResultCode::NotFound;
        };

        if creating {
            if let Some(id) = instance {
                if self.store.exists(&Path::instance(object, id)) {
                    return ResultCode::BadRequest;
                }
            }
        }
        if definition.is_single_instance() && instance.is_some_and(|id| id != 0) {
            return ResultCode::MethodNotAllowed;
        }
        if creating
            && self.store.instance_count(object) + 1 > definition.max_instances as usize
        {
            // Cardinality exceeded.
            return ResultCode::MethodNotAllowed;
        }

        for resource in node.children() {
            let result = self.check_resource_node(origin, resource, object, instance, creating);
            if result != ResultCode::Success {
                return result;
            }
        }
        ResultCode::Success
    }

    fn check_object_node(
        &self,
        origin: RequestOrigin,
        node: &TreeNode,
        creating_instance: bool,
    ) -> ResultCode {
        let object = node.id().expect("object nodes always carry an id");
        let creating = creating_instance || node.is_create();
        for instance in node.children() {
            let result = self.check_instance_node(origin, instance, object, creating);
            if result != ResultCode::Success {
                return result;
            }
        }
        ResultCode::Success
    }

    fn commit_resource_node(
        &mut self,
        node: &TreeNode,
        object: ObjectId,
        instance: InstanceId,
        create_optional: bool,
    ) -> ResultCode {
        let resource = node.id().expect("resource nodes always carry an id");

        if (create_optional || node.is_create())
            && self.definitions.lookup_resource(object, resource).is_some()
            && !self.store.exists(&Path::resource(object, instance, resource))
        {
            if let Err(code) = self.create_optional_resource(object, instance, resource) {
                return code;
            }
        }
        if node.is_replace() && self.store.exists(&Path::resource(object, instance, resource)) {
            self.delete(
                RequestOrigin::Client,
                &Path::resource(object, instance, resource),
                true,
            );
            if let Err(code) = self.create_optional_resource(object, instance, resource) {
                return code;
            }
        }

        for child in node.children() {
            let index = child.id().unwrap_or(0);
            let Some(bytes) = child.value() else {
                continue;
            };
            if let Err(code) =
                self.write_resource_instance(object, instance, resource, index, bytes.to_vec())
            {
                return code;
            }
        }
        ResultCode::SuccessChanged
    }

    fn commit_instance_node(
        &mut self,
        node: &TreeNode,
        object: ObjectId,
        create_instance: bool,
        create_optional: bool,
        replace: bool,
    ) -> (ResultCode, Option<InstanceId>) {
        let mut instance = node.id();
        let mut result = ResultCode::SuccessChanged;

        if replace {
            // Bootstrap-style upsert: write over what exists, create what
            // does not.
            let present =
                instance.is_some_and(|id| self.store.exists(&Path::instance(object, id)));
            if !present {
                match self.create_object_instance(object, instance) {
                    Ok(id) => instance = Some(id),
                    Err(_) => return (ResultCode::BadRequest, None),
                }
            }
        } else if create_instance || node.is_create() {
            match self.create_object_instance(object, instance) {
                Ok(id) => {
                    instance = Some(id);
                    result = ResultCode::SuccessCreated;
                }
                Err(code) => return (code, None),
            }
        }

        let Some(instance) = instance else {
            return (ResultCode::BadRequest, None);
        };
        for resource in node.children() {
            let write = self.commit_resource_node(resource, object, instance, create_optional);
            if !write.is_success() {
                return (write, Some(instance));
            }
        }
        (result, Some(instance))
    }

    fn commit_object_node(
        &mut self,
        node: &TreeNode,
        create_instance: bool,
        create_optional: bool,
        replace: bool,
    ) -> (ResultCode, Option<InstanceId>) {
        let object = node.id().expect("object nodes always carry an id");
        let mut last_instance = None;
        let mut result = ResultCode::SuccessChanged;
        for instance in node.children() {
            let (code, id) =
                self.commit_instance_node(instance, object, create_instance, create_optional, replace);
            if !code.is_success() {
                return (code, id);
            }
            result = code;
            last_instance = id;
        }
        (result, last_instance)
    }

    // ------------------------------------------------------------------
    // CoAP request dispatch
    // ------------------------------------------------------------------

    fn origin_for(&self, source: SocketAddr) -> RequestOrigin {
        if objects::server_is_bootstrap(&self.store, source) {
            RequestOrigin::BootstrapServer
        } else {
            RequestOrigin::Server
        }
    }

    /// Dispatch one decoded CoAP request.
    pub fn handle_request(&mut self, request: &CoapRequest, now_ms: u64) -> CoapResponse {
        let path_text = if request.path.is_empty() {
            "/".to_owned()
        } else if request.path.starts_with('/') {
            request.path.clone()
        } else {
            format!("/{}", request.path)
        };

        // DELETE on '/' bypasses the table: there is no root endpoint.
        if request.method == CoapMethod::Delete && path_text == "/" {
            let origin = self.origin_for(request.source);
            return CoapResponse::code(self.delete(origin, &Path::root(), false));
        }

        let kind = if request.method == CoapMethod::Get {
            self.endpoints.find_exact(&path_text)
        } else {
            self.endpoints
                .find_ancestor(&path_text)
                .map(|(_, kind)| kind)
        };
        let Some(kind) = kind else {
            return CoapResponse::code(ResultCode::NotFound);
        };

        match kind {
            EndpointKind::Registration => self.handle_registration(request, now_ms),
            EndpointKind::RegistrationUpdate(location) => {
                self.handle_registration_update(request, location, now_ms)
            }
            EndpointKind::Bootstrap => self.handle_bootstrap_endpoint(request, now_ms),
            EndpointKind::DeviceManagement => {
                let Ok(target) = path_text.parse::<Path>() else {
                    return CoapResponse::code(ResultCode::BadRequest);
                };
                self.handle_device_management(request, &target, now_ms)
            }
        }
    }

    fn handle_device_management(
        &mut self,
        request: &CoapRequest,
        target: &Path,
        now_ms: u64,
    ) -> CoapResponse {
        let origin = self.origin_for(request.source);
        match request.method {
            CoapMethod::Get => match request.observe {
                Some(ObserveFlag::Register) => self.handle_observe(request, target, now_ms),
                Some(ObserveFlag::Deregister) => self.handle_cancel_observe(request, target),
                None if request.accept == Some(ContentType::LinkFormat) => {
                    self.handle_discover(target)
                }
                None => self.handle_read(request, origin, target),
            },
            CoapMethod::Post => self.handle_post(request, origin, target),
            CoapMethod::Put => {
                if request.payload.is_empty() && !request.query.is_empty() {
                    self.handle_write_attributes(request, target)
                } else if origin == RequestOrigin::BootstrapServer {
                    self.handle_bootstrap_write(request, target)
                } else {
                    self.handle_replace_write(request, origin, target)
                }
            }
            CoapMethod::Delete => CoapResponse::code(self.delete(origin, target, false)),
        }
    }

    fn encode_response(
        &self,
        accept: Option<ContentType>,
        tree: &TreeNode,
        target: &Path,
    ) -> Result<(Vec<u8>, ContentType), ResultCode> {
        codec::encode(
            &self.definitions,
            accept.or(self.default_content_type),
            tree,
            target,
        )
        .map_err(|err| match err {
            EncodeError::PayloadTooLarge => ResultCode::PayloadTooLarge,
            EncodeError::UndefinedResource(_) => ResultCode::NotFound,
            EncodeError::CannotRepresent(..) => ResultCode::UnsupportedContentFormat,
        })
    }

    fn handle_read(
        &mut self,
        request: &CoapRequest,
        origin: RequestOrigin,
        target: &Path,
    ) -> CoapResponse {
        match self
            .read_tree(origin, target)
            .and_then(|tree| self.encode_response(request.accept, &tree, target))
        {
            Ok((payload, content_type)) => {
                CoapResponse::with_payload(ResultCode::SuccessContent, content_type, payload)
            }
            Err(code) => CoapResponse::code(code),
        }
    }

    fn handle_discover(&mut self, target: &Path) -> CoapResponse {
        if !self.store.exists(target) {
            return CoapResponse::code(ResultCode::NotFound);
        }
        let mut links = vec![link::LinkToken::new(target.to_string())];

        let Some(object) = target.object else {
            return CoapResponse::code(ResultCode::MethodNotAllowed);
        };
        let instances: Vec<InstanceId> = match target.instance {
            Some(instance) => vec![instance],
            None => {
                let mut ids = vec![];
                let mut instance = self.store.next_instance(object, None);
                while let Some(id) = instance {
                    ids.push(id);
                    instance = self.store.next_instance(object, Some(id));
                }
                ids
            }
        };
        for instance in instances {
            if target.instance.is_none() {
                links.push(link::LinkToken::new(format!("/{object}/{instance}")));
            }
            if target.resource.is_some() {
                continue; // the resource itself is the first token
            }
            let mut resource = self.store.next_resource(object, instance, None);
            while let Some(id) = resource {
                links.push(link::LinkToken::new(format!("/{object}/{instance}/{id}")));
                resource = self.store.next_resource(object, instance, Some(id));
            }
        }
        CoapResponse::with_payload(
            ResultCode::SuccessContent,
            ContentType::LinkFormat,
            link::write_links(&links).into_bytes(),
        )
    }

    fn handle_observe(
        &mut self,
        request: &CoapRequest,
        target: &Path,
        now_ms: u64,
    ) -> CoapResponse {
        // Observe and Discover do not combine.
        if request.accept == Some(ContentType::LinkFormat) {
            return CoapResponse::code(ResultCode::MethodNotAllowed);
        }
        let origin = self.origin_for(request.source);
        if !self.store.exists(target) {
            return CoapResponse::code(ResultCode::NotFound);
        }

        let tree = match self.read_tree(origin, target) {
            Ok(tree) => tree,
            Err(code) => return CoapResponse::code(code),
        };
        let (payload, content_type) = match self.encode_response(request.accept, &tree, target) {
            Ok(encoded) => encoded,
            Err(code) => return CoapResponse::code(code),
        };

        let short_server_id = objects::short_server_id_for(&self.store, request.source);
        let snapshot = self.resource_snapshot(target);
        self.observers.observe(
            request.source,
            request.token.clone(),
            *target,
            request.accept,
            short_server_id,
            now_ms,
            snapshot,
        );
        debug!(%target, source = %request.source, "observation registered");

        let mut response =
            CoapResponse::with_payload(ResultCode::SuccessContent, content_type, payload);
        response.observe = Some(0);
        response
    }

    fn handle_cancel_observe(&mut self, request: &CoapRequest, target: &Path) -> CoapResponse {
        // Cancellation is by path, mirroring the registration.
        self.observers.cancel_by_path(request.source, target);
        let origin = self.origin_for(request.source);
        self.handle_read(
            &CoapRequest {
                observe: None,
                ..request.clone()
            },
            origin,
            target,
        )
    }

    /// Cancel by token: the CoAP layer saw an RST for a notification.
    pub fn cancel_observation_by_token(&mut self, source: SocketAddr, token: &[u8]) -> bool {
        self.observers.cancel_by_token(source, token)
    }

    /// Register an observation on behalf of the local application (IPC
    /// Subscribe). Pacing attributes do not apply; deliveries are purely
    /// change-driven.
    pub fn observe_path(
        &mut self,
        address: SocketAddr,
        token: Vec<u8>,
        path: Path,
        now_ms: u64,
    ) -> Result<(), ResultCode> {
        if !self.store.exists(&path) {
            return Err(ResultCode::NotFound);
        }
        let snapshot = self.resource_snapshot(&path);
        self.observers
            .observe(address, token, path, None, 0, now_ms, snapshot);
        Ok(())
    }

    /// Drop the observation `address` holds on `path`.
    pub fn cancel_observe_path(&mut self, address: SocketAddr, path: &Path) -> bool {
        self.observers.cancel_by_path(address, path)
    }

    fn decode_payload(
        &self,
        request: &CoapRequest,
        target: &Path,
    ) -> Result<TreeNode, ResultCode> {
        let content_type = request.content_type.ok_or(ResultCode::UnsupportedContentFormat)?;
        codec::decode(&self.definitions, content_type, target, &request.payload).map_err(|err| {
            warn!(%target, %err, "payload decode failed");
            match err {
                DecodeError::UndefinedResource(_) => ResultCode::NotFound,
                DecodeError::UnsupportedFormat(_) => ResultCode::UnsupportedContentFormat,
                _ => ResultCode::BadRequest,
            }
        })
    }

    fn handle_post(
        &mut self,
        request: &CoapRequest,
        origin: RequestOrigin,
        target: &Path,
    ) -> CoapResponse {
        // Execute wins when the target resource is executable.
        if let (Some(object), Some(resource)) = (target.object, target.resource) {
            if self.definitions.is_resource_executable(object, resource) {
                return CoapResponse::code(self.execute(target, &request.payload));
            }
        }

        let node = match self.decode_payload(request, target) {
            Ok(node) => node,
            Err(code) => return CoapResponse::code(code),
        };

        if target.depth() == PathDepth::Object {
            // CREATE, with the instance id from the payload when present.
            let object_node = if node.kind() == NodeKind::ObjectInstance {
                node.wrap_in_object(target.object.unwrap())
            } else {
                node
            };
            let check = self.check_object_node(origin, &object_node, true);
            if check != ResultCode::Success {
                return CoapResponse::code(check);
            }
            let (code, instance) = self.commit_object_node(&object_node, true, true, false);
            if !code.is_success() {
                return CoapResponse::code(code);
            }
            let mut response = CoapResponse::code(ResultCode::SuccessCreated);
            if let Some(instance) = instance {
                response.location = Some(format!("/{}/{}", target.object.unwrap(), instance));
            }
            return response;
        }

        // Partial-update WRITE: named resource instances are added or
        // replaced, everything else is untouched.
        let object = target.object.unwrap();
        let check = match node.kind() {
            NodeKind::ObjectInstance => self.check_instance_node(origin, &node, object, false),
            NodeKind::Resource => {
                self.check_resource_node(origin, &node, object, target.instance, false)
            }
            _ => return CoapResponse::code(ResultCode::BadRequest),
        };
        if check != ResultCode::Success {
            return CoapResponse::code(check);
        }
        let result = match node.kind() {
            NodeKind::Resource => {
                let Some(instance) = target.instance else {
                    return CoapResponse::code(ResultCode::BadRequest);
                };
                self.commit_resource_node(&node, object, instance, true)
            }
            _ => self.commit_instance_node(&node, object, false, true, false).0,
        };
        CoapResponse::code(if result.is_success() {
            ResultCode::SuccessChanged
        } else {
            result
        })
    }

    fn handle_replace_write(
        &mut self,
        request: &CoapRequest,
        origin: RequestOrigin,
        target: &Path,
    ) -> CoapResponse {
        // Replace targets an instance or a resource, never a whole object.
        if target.object.is_none() || target.instance.is_none() {
            return CoapResponse::code(ResultCode::BadRequest);
        }
        let node = match self.decode_payload(request, target) {
            Ok(node) => node,
            Err(code) => return CoapResponse::code(code),
        };

        let object = target.object.unwrap();
        let check = match node.kind() {
            NodeKind::Object => return CoapResponse::code(ResultCode::MethodNotAllowed),
            NodeKind::ObjectInstance => self.check_instance_node(origin, &node, object, false),
            NodeKind::Resource => {
                self.check_resource_node(origin, &node, object, target.instance, false)
            }
            NodeKind::ResourceInstance => return CoapResponse::code(ResultCode::InternalError),
        };
        if check != ResultCode::Success {
            return CoapResponse::code(check);
        }

        if !self.store.exists(target) {
            return CoapResponse::code(ResultCode::NotFound);
        }
        // The replace is delete-then-create; authorization treats it as the
        // composite, so the delete runs relaxed.
        let deleted = self.delete(origin, target, true);
        if deleted != ResultCode::SuccessDeleted {
            return CoapResponse::code(ResultCode::NotFound);
        }

        let code = match node.kind() {
            NodeKind::ObjectInstance => {
                self.commit_instance_node(&node, object, false, true, true).0
            }
            _ => {
                let instance = target.instance.unwrap();
                // Recreate the resource slot, then fill it.
                match self.commit_resource_node(&node, object, instance, true) {
                    code if code.is_success() => ResultCode::SuccessChanged,
                    code => code,
                }
            }
        };
        CoapResponse::code(if code.is_success() {
            ResultCode::SuccessChanged
        } else {
            code
        })
    }

    fn handle_bootstrap_write(&mut self, request: &CoapRequest, target: &Path) -> CoapResponse {
        let node = match self.decode_payload(request, target) {
            Ok(node) => node,
            Err(code) => return CoapResponse::code(code),
        };
        let origin = RequestOrigin::BootstrapServer;

        let check = match node.kind() {
            NodeKind::Object => self.check_object_node(origin, &node, false),
            NodeKind::ObjectInstance => {
                let Some(object) = target.object else {
                    return CoapResponse::code(ResultCode::BadRequest);
                };
                self.check_instance_node(origin, &node, object, false)
            }
            NodeKind::Resource => {
                let Some(object) = target.object else {
                    return CoapResponse::code(ResultCode::BadRequest);
                };
                self.check_resource_node(origin, &node, object, target.instance, false)
            }
            NodeKind::ResourceInstance => return CoapResponse::code(ResultCode::InternalError),
        };
        if check != ResultCode::Success {
            return CoapResponse::code(check);
        }

        let code = match node.kind() {
            NodeKind::Object => self.commit_object_node(&node, false, true, true).0,
            NodeKind::ObjectInstance => {
                let mut node = node;
                if node.id().is_none() {
                    node.set_id(target.instance);
                }
                self.commit_instance_node(&node, target.object.unwrap(), false, true, true)
                    .0
            }
            _ => {
                let Some(instance) = target.instance else {
                    return CoapResponse::code(ResultCode::BadRequest);
                };
                if !self.store.exists(&Path::instance(target.object.unwrap(), instance)) {
                    if self
                        .create_object_instance(target.object.unwrap(), Some(instance))
                        .is_err()
                    {
                        return CoapResponse::code(ResultCode::BadRequest);
                    }
                }
                self.commit_resource_node(&node, target.object.unwrap(), instance, true)
            }
        };

        if code.is_success() {
            // A bootstrap write is a provisioning replace; observations on
            // the rewritten subtree no longer describe live state.
            self.observers.cancel_covered(target);
            CoapResponse::code(ResultCode::SuccessChanged)
        } else {
            CoapResponse::code(code)
        }
    }

    fn handle_write_attributes(&mut self, request: &CoapRequest, target: &Path) -> CoapResponse {
        if let (Some(object), Some(resource)) = (target.object, target.resource) {
            if self.definitions.is_resource_executable(object, resource) {
                return CoapResponse::code(ResultCode::MethodNotAllowed);
            }
        }
        if !self.store.exists(target) {
            return CoapResponse::code(ResultCode::NotFound);
        }

        let short_server_id = objects::short_server_id_for(&self.store, request.source);
        let (default_pmin, default_pmax) = objects::server_defaults(&self.store, short_server_id);
        let pairs = coap::parse_query(&request.query);
        let existing = self.attributes.get(short_server_id, target);

        match attributes::apply_query(&existing, &pairs, default_pmin, default_pmax) {
            Ok(update) => {
                if update.cancel {
                    self.observers.cancel_by_path(request.source, target);
                }
                self.attributes.set(short_server_id, *target, update.attributes);
                CoapResponse::code(ResultCode::SuccessChanged)
            }
            Err(code) => CoapResponse::code(code),
        }
    }

    // ------------------------------------------------------------------
    // Registration endpoints (server role)
    // ------------------------------------------------------------------

    fn handle_registration(&mut self, request: &CoapRequest, now_ms: u64) -> CoapResponse {
        if request.method != CoapMethod::Post {
            return CoapResponse::code(ResultCode::MethodNotAllowed);
        }

        let pairs = coap::parse_query(&request.query);
        let endpoint_name = pairs
            .iter()
            .find(|(key, _)| key == "ep")
            .map(|(_, value)| value.clone());
        let Some(endpoint_name) = endpoint_name.filter(|name| !name.is_empty()) else {
            return CoapResponse::code(ResultCode::BadRequest);
        };
        if request.content_type != Some(ContentType::LinkFormat) {
            return CoapResponse::code(ResultCode::BadRequest);
        }
        let lifetime = pairs
            .iter()
            .find(|(key, _)| key == "lt")
            .and_then(|(_, value)| value.parse().ok());
        let binding = parse_binding(&pairs);

        let list = match link::parse_object_list(&request.payload) {
            Ok(list) => list,
            Err(err) => {
                warn!(%err, "unparseable registration object list");
                return CoapResponse::code(ResultCode::BadRequest);
            }
        };

        match self.registrations.register(
            &endpoint_name,
            request.source,
            lifetime,
            binding,
            list.supports_json,
            list.entries,
            now_ms,
        ) {
            Ok(location) => {
                self.endpoints.add(
                    format!("/rd/{location}"),
                    EndpointKind::RegistrationUpdate(location),
                );
                let mut response = CoapResponse::code(ResultCode::SuccessCreated);
                response.location = Some(format!("rd/{location}"));
                response
            }
            Err(code) => CoapResponse::code(code),
        }
    }

    fn handle_registration_update(
        &mut self,
        request: &CoapRequest,
        location: u32,
        now_ms: u64,
    ) -> CoapResponse {
        match request.method {
            // Pre-1.0 peers update with PUT; both are accepted.
            CoapMethod::Put | CoapMethod::Post => {
                let pairs = coap::parse_query(&request.query);
                let lifetime = pairs
                    .iter()
                    .find(|(key, _)| key == "lt")
                    .and_then(|(_, value)| value.parse().ok());
                let binding = pairs
                    .iter()
                    .any(|(key, _)| key == "b")
                    .then(|| parse_binding(&pairs));
                let objects = if request.content_type == Some(ContentType::LinkFormat)
                    && !request.payload.is_empty()
                {
                    match link::parse_object_list(&request.payload) {
                        Ok(list) => Some((list.supports_json, list.entries)),
                        Err(_) => return CoapResponse::code(ResultCode::BadRequest),
                    }
                } else {
                    None
                };

                match self.registrations.update(
                    location,
                    lifetime,
                    binding,
                    request.source,
                    objects,
                    now_ms,
                ) {
                    Ok(()) => CoapResponse::code(ResultCode::SuccessChanged),
                    Err(code) => CoapResponse::code(code),
                }
            }
            CoapMethod::Delete => match self.registrations.deregister(location) {
                Some(client) => {
                    self.endpoints.remove(&format!("/rd/{location}"));
                    self.observers.remove_for_address(client.address);
                    CoapResponse::code(ResultCode::SuccessDeleted)
                }
                None => CoapResponse::code(ResultCode::NotFound),
            },
            CoapMethod::Get => CoapResponse::code(ResultCode::MethodNotAllowed),
        }
    }

    // ------------------------------------------------------------------
    // Bootstrap endpoint
    // ------------------------------------------------------------------

    fn handle_bootstrap_endpoint(&mut self, request: &CoapRequest, now_ms: u64) -> CoapResponse {
        match (&self.role, request.method) {
            (Role::Server { bootstrap: true }, CoapMethod::Post | CoapMethod::Put) => {
                match self.provisioning.enqueue(request.source) {
                    Ok(()) => CoapResponse::code(ResultCode::SuccessChanged),
                    Err(code) => CoapResponse::code(code),
                }
            }
            (Role::Client, CoapMethod::Post) => {
                if self.origin_for(request.source) != RequestOrigin::BootstrapServer {
                    return CoapResponse::code(ResultCode::Unauthorized);
                }
                self.client_bootstrap.on_bootstrap_complete(now_ms);
                CoapResponse::code(ResultCode::SuccessChanged)
            }
            _ => CoapResponse::code(ResultCode::MethodNotAllowed),
        }
    }

    // ------------------------------------------------------------------
    // Outbound responses, bootstrap config, ticking
    // ------------------------------------------------------------------

    /// Route a response to a request this engine originated.
    pub fn handle_response(
        &mut self,
        response: &OutboundResponse,
        transport: &mut dyn Transport,
        now_ms: u64,
    ) {
        match self.role {
            Role::Client => {
                self.client_bootstrap
                    .on_response(&response.token, response.code, now_ms);
                self.registrar.on_response(
                    response.source,
                    &response.token,
                    response.code,
                    response.location.as_deref(),
                    now_ms,
                );
            }
            Role::Server { bootstrap } => {
                if bootstrap {
                    self.provisioning.on_response(
                        response.source,
                        response.code,
                        &self.definitions,
                        &self.store,
                        transport,
                    );
                }
            }
        }
    }

    /// Apply a parsed bootstrap configuration (factory bootstrap or the
    /// provisioning store of the bootstrap-server role).
    pub fn apply_bootstrap_config(
        &mut self,
        info: &bootstrap::BootstrapInfo,
    ) -> Result<(), ResultCode> {
        for server in &info.servers {
            let security_instance = self.create_object_instance(SECURITY_OBJECT, None)?;
            let server_instance = if server.is_bootstrap {
                None
            } else {
                Some(self.create_object_instance(SERVER_OBJECT, None)?)
            };
            bootstrap::apply_server_info(&mut self.store, server, security_instance, server_instance)
                .map_err(|_| ResultCode::InternalError)?;
        }
        if self.is_client() {
            self.client_bootstrap.factory_applied();
        }
        Ok(())
    }

    /// The client's current registration payload.
    pub fn object_links(&self) -> String {
        let mut tokens = vec![link::root_advertisement()];
        for definition in self.definitions.objects() {
            if definition.id == SECURITY_OBJECT {
                continue;
            }
            let mut instance = self.store.next_instance(definition.id, None);
            if instance.is_none() {
                tokens.push(link::LinkToken::new(format!("/{}", definition.id)));
            }
            while let Some(id) = instance {
                tokens.push(link::LinkToken::new(format!("/{}/{id}", definition.id)));
                instance = self.store.next_instance(definition.id, Some(id));
            }
        }
        link::write_links(&tokens)
    }

    /// The configured management servers: `(address, short id, lifetime)`.
    fn configured_servers(&self) -> Vec<(SocketAddr, u16, i64)> {
        let mut servers = vec![];
        let mut instance = self.store.next_instance(SECURITY_OBJECT, None);
        while let Some(id) = instance {
            let bootstrap = self
                .store
                .read(SECURITY_OBJECT, id, objects::SECURITY_BOOTSTRAP_SERVER, 0)
                .map(|bytes| bytes == [1])
                .unwrap_or(false);
            if !bootstrap {
                let address = self
                    .store
                    .read(SECURITY_OBJECT, id, objects::SECURITY_SERVER_URI, 0)
                    .and_then(|bytes| {
                        value::Value::from_store_bytes(ResourceKind::String, bytes).ok()
                    })
                    .and_then(|uri| match uri {
                        value::Value::String(uri) => objects::parse_server_uri(&uri),
                        _ => None,
                    });
                if let Some(address) = address {
                    let short_server_id = objects::short_server_id_for(&self.store, address);
                    let lifetime = server_lifetime(&self.store, short_server_id);
                    servers.push((address, short_server_id, lifetime));
                }
            }
            instance = self.store.next_instance(SECURITY_OBJECT, Some(id));
        }
        servers
    }

    /// Advance every time-driven part of the runtime.
    pub fn tick(&mut self, now_ms: u64, transport: &mut dyn Transport) {
        self.deliver_notifications(now_ms, transport);

        // Registration ageing (server role); dependent observations go too.
        let expired = self.registrations.age(now_ms);
        for client in expired {
            self.endpoints.remove(&format!("/rd/{}", client.location));
            self.observers.remove_for_address(client.address);
        }

        match self.role {
            Role::Client => {
                let has_config = bootstrap::has_server_configuration(&self.store);
                self.client_bootstrap.tick(now_ms, has_config, transport);
                if self.client_bootstrap.ready_to_register() {
                    let servers = self.configured_servers();
                    self.registrar.sync_servers(&servers);
                    let links = self.object_links();
                    let dirty = std::mem::take(&mut self.registration_dirty);
                    self.registrar.tick(now_ms, &links, dirty, transport);
                }
            }
            Role::Server { bootstrap } => {
                if bootstrap {
                    self.provisioning
                        .tick(&self.definitions, &self.store, transport);
                }
            }
        }
    }

    fn deliver_notifications(&mut self, now_ms: u64, transport: &mut dyn Transport) {
        let attributes = &self.attributes;
        let store = &self.store;
        let due = self.observers.due(now_ms, |obs| {
            effective_attributes(attributes, store, obs.short_server_id, &obs.path)
        });

        for notification in due {
            let tree = match self.read_tree(RequestOrigin::Server, &notification.path) {
                Ok(tree) => tree,
                Err(_) => {
                    // The observed node vanished without a covering delete.
                    self.observers
                        .cancel_by_path(notification.address, &notification.path);
                    continue;
                }
            };
            let encoded = self.encode_response(notification.accept, &tree, &notification.path);
            let Ok((payload, content_type)) = encoded else {
                warn!(path = %notification.path, "cannot encode notification");
                continue;
            };
            transport.send_notify(
                notification.address,
                &notification.path,
                &notification.token,
                notification.sequence,
                content_type,
                &payload,
            );
            let snapshot = self.resource_snapshot(&notification.path);
            let (bytes, numeric) = match snapshot {
                Some((bytes, numeric)) => (Some(bytes), numeric),
                None => (None, None),
            };
            self.observers
                .mark_sent(&notification, now_ms, bytes, numeric);
        }
    }
}

/// Effective notification attributes: the path overlay merged over the
/// origin server's object defaults.
fn effective_attributes(
    attributes: &AttributeStore,
    store: &ObjectStore,
    short_server_id: u16,
    path: &Path,
) -> NotificationAttributes {
    let (default_pmin, default_pmax) = objects::server_defaults(store, short_server_id);
    attributes
        .effective(short_server_id, path)
        .merged_over(NotificationAttributes {
            pmin: Some(default_pmin),
            pmax: Some(default_pmax),
            ..Default::default()
        })
}

/// The lifetime the server object configures for `short_server_id`.
fn server_lifetime(store: &ObjectStore, short_server_id: u16) -> i64 {
    let mut instance = store.next_instance(SERVER_OBJECT, None);
    while let Some(id) = instance {
        let matches = store
            .read(SERVER_OBJECT, id, objects::SERVER_SHORT_SERVER_ID, 0)
            .and_then(|bytes| value::Value::from_store_bytes(ResourceKind::Integer, bytes).ok())
            .map(|v| v == value::Value::Integer(short_server_id as i64))
            .unwrap_or(false);
        if matches {
            return store
                .read(SERVER_OBJECT, id, objects::SERVER_LIFETIME, 0)
                .and_then(|bytes| value::Value::from_store_bytes(ResourceKind::Integer, bytes).ok())
                .and_then(|v| match v {
                    value::Value::Integer(v) => Some(v),
                    _ => None,
                })
                .unwrap_or(crate::registration::LIFETIME_DEFAULT);
        }
        instance = store.next_instance(SERVER_OBJECT, Some(id));
    }
    crate::registration::LIFETIME_DEFAULT
}

fn parse_binding(pairs: &[(String, String)]) -> BindingMode {
    pairs
        .iter()
        .find(|(key, _)| key == "b")
        .map(|(_, value)| {
            value.parse().unwrap_or_else(|_| {
                warn!(binding = %value, "unsupported binding mode, using U");
                BindingMode::Udp
            })
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::{BootstrapInfo, BootstrapServerInfo, BootstrapState};
    use crate::coap::RecordingTransport;
    use crate::codec::tlv;
    use crate::registration::RegistrationEvent;
    use crate::types::{Operations, DEVICE_OBJECT};
    use crate::value::Value;

    fn management() -> SocketAddr {
        "192.0.2.10:5683".parse().unwrap()
    }

    fn bootstrap_peer() -> SocketAddr {
        "192.0.2.11:15683".parse().unwrap()
    }

    /// A client engine provisioned with one management server (short id 1)
    /// and one bootstrap server, plus a device instance.
    fn provisioned_client() -> Engine {
        let mut engine = Engine::new(EngineConfig::default());
        engine
            .apply_bootstrap_config(&BootstrapInfo {
                servers: vec![
                    BootstrapServerInfo {
                        server_uri: "coap://192.0.2.10:5683".to_owned(),
                        short_server_id: 1,
                        lifetime: 60,
                        ..Default::default()
                    },
                    BootstrapServerInfo {
                        server_uri: "coap://192.0.2.11:15683".to_owned(),
                        is_bootstrap: true,
                        ..Default::default()
                    },
                ],
            })
            .unwrap();
        engine.create_object_instance(DEVICE_OBJECT, Some(0)).unwrap();
        engine
    }

    fn request(method: CoapMethod, path: &str, source: SocketAddr) -> CoapRequest {
        CoapRequest::new(source, method, path)
    }

    fn tlv_request(
        engine: &Engine,
        method: CoapMethod,
        path: &str,
        source: SocketAddr,
        node: &TreeNode,
    ) -> CoapRequest {
        let target: Path = path.parse().unwrap();
        let payload = tlv::encode(engine.definitions(), node, &target).unwrap();
        let mut request = request(method, path, source);
        request.content_type = Some(ContentType::OmaTlv);
        request.payload = payload;
        request
    }

    fn string_resource(resource: u16, text: &str) -> TreeNode {
        let mut node = TreeNode::resource(resource);
        node.add_child(TreeNode::resource_instance(
            0,
            Value::String(text.to_owned()).to_store_bytes(),
        ));
        node
    }

    #[test]
    fn s1_create_then_read_a_custom_object() {
        let mut engine = provisioned_client();
        engine
            .define_object(ObjectDefinition::new(10000, "Widget").instances(0, 1))
            .unwrap();
        engine
            .define_resource(
                ResourceDefinition::new(10000, 0, "Counter", ResourceKind::Integer)
                    .instances(1, 1),
            )
            .unwrap();

        engine.create_object_instance(10000, Some(0)).unwrap();
        // The mandatory resource was auto-created; creating it again as
        // optional is refused.
        assert_eq!(
            engine.create_optional_resource(10000, 0, 0),
            Err(ResultCode::MethodNotAllowed)
        );

        engine
            .write_resource_instance(10000, 0, 0, 0, Value::Integer(12345).to_store_bytes())
            .unwrap();

        let response =
            engine.handle_request(&request(CoapMethod::Get, "/10000/0/0", management()), 0);
        assert_eq!(response.code, ResultCode::SuccessContent);
        assert_eq!(response.payload, b"12345");
    }

    #[test]
    fn s1_mandatory_resources_have_defaults_immediately() {
        let mut engine = provisioned_client();
        engine
            .define_object(ObjectDefinition::new(10000, "Widget").instances(0, 2))
            .unwrap();
        engine
            .define_resource(
                ResourceDefinition::new(10000, 0, "Counter", ResourceKind::Integer)
                    .instances(1, 1),
            )
            .unwrap();
        engine
            .define_resource(
                ResourceDefinition::new(10000, 1, "Spare", ResourceKind::String).instances(0, 1),
            )
            .unwrap();

        let instance = engine.create_object_instance(10000, None).unwrap();
        assert_eq!(instance, 0);
        assert_eq!(
            engine.store().read(10000, 0, 0, 0),
            Some(&0i64.to_ne_bytes()[..])
        );
        // The optional resource is not auto-created.
        assert!(!engine.store().exists(&Path::resource(10000, 0, 1)));
    }

    #[test]
    fn s2_partial_update_preserves_siblings() {
        let mut engine = provisioned_client();
        for (resource, text) in [(14u16, "hello"), (15u16, "world")] {
            engine.create_optional_resource(3, 0, resource).unwrap();
            engine
                .write_resource_instance(
                    3,
                    0,
                    resource,
                    0,
                    Value::String(text.to_owned()).to_store_bytes(),
                )
                .unwrap();
        }

        let mut update = TreeNode::object_instance(Some(0));
        update.add_child(string_resource(14, "HELLO"));
        let request = tlv_request(&engine, CoapMethod::Post, "/3/0", management(), &update);

        let response = engine.handle_request(&request, 0);
        assert_eq!(response.code, ResultCode::SuccessChanged);
        assert_eq!(engine.store().read(3, 0, 14, 0), Some(&b"HELLO\0"[..]));
        assert_eq!(engine.store().read(3, 0, 15, 0), Some(&b"world\0"[..]));
    }

    #[test]
    fn s3_replace_write_clears_siblings_and_their_observations() {
        let mut engine = provisioned_client();
        for (resource, text) in [(14u16, "hello"), (15u16, "world")] {
            engine.create_optional_resource(3, 0, resource).unwrap();
            engine
                .write_resource_instance(
                    3,
                    0,
                    resource,
                    0,
                    Value::String(text.to_owned()).to_store_bytes(),
                )
                .unwrap();
        }

        let mut observe = request(CoapMethod::Get, "/3/0/15", management());
        observe.observe = Some(ObserveFlag::Register);
        observe.token = vec![0xAA];
        let observed = engine.handle_request(&observe, 0);
        assert_eq!(observed.code, ResultCode::SuccessContent);
        assert_eq!(observed.observe, Some(0));
        assert_eq!(engine.observers().len(), 1);

        let mut replacement = TreeNode::object_instance(Some(0));
        replacement.add_child(string_resource(14, "HELLO"));
        let request = tlv_request(&engine, CoapMethod::Put, "/3/0", management(), &replacement);

        let response = engine.handle_request(&request, 1_000);
        assert_eq!(response.code, ResultCode::SuccessChanged);
        assert_eq!(engine.store().read(3, 0, 14, 0), Some(&b"HELLO\0"[..]));
        assert!(!engine.store().exists(&Path::resource(3, 0, 15)));
        assert_eq!(engine.observers().len(), 0);

        let mut transport = RecordingTransport::new();
        engine.tick(2_000, &mut transport);
        assert!(transport.notifies.is_empty());
    }

    #[test]
    fn s4_observe_pacing_with_attributes() {
        let mut engine = provisioned_client();
        engine.create_optional_resource(3, 0, 9).unwrap();
        engine
            .write_resource_instance(3, 0, 9, 0, Value::Integer(10).to_store_bytes())
            .unwrap();

        let mut attributes = request(CoapMethod::Put, "/3/0/9", management());
        attributes.query = "pmin=2&pmax=10&stp=5".to_owned();
        assert_eq!(
            engine.handle_request(&attributes, 0).code,
            ResultCode::SuccessChanged
        );

        let mut observe = request(CoapMethod::Get, "/3/0/9", management());
        observe.observe = Some(ObserveFlag::Register);
        observe.token = vec![0xBB];
        let initial = engine.handle_request(&observe, 0);
        assert_eq!(initial.code, ResultCode::SuccessContent);
        assert_eq!(initial.payload, b"10");

        let mut transport = RecordingTransport::new();
        engine
            .write_resource_instance(3, 0, 9, 0, Value::Integer(11).to_store_bytes())
            .unwrap();
        engine.tick(1_000, &mut transport);
        assert!(transport.notifies.is_empty());

        engine
            .write_resource_instance(3, 0, 9, 0, Value::Integer(20).to_store_bytes())
            .unwrap();
        engine.tick(1_500, &mut transport);
        assert!(transport.notifies.is_empty(), "pmin defers the delivery");

        engine.tick(2_000, &mut transport);
        assert_eq!(transport.notifies.len(), 1);
        assert_eq!(transport.notifies[0].payload, b"20");
        assert_eq!(transport.notifies[0].sequence, 1);
        assert_eq!(transport.notifies[0].token, vec![0xBB]);

        for t in (3_000..10_000).step_by(1_000) {
            engine.tick(t, &mut transport);
            assert_eq!(transport.notifies.len(), 1, "nothing due at {t}");
        }
        engine.tick(10_000, &mut transport);
        assert_eq!(transport.notifies.len(), 2, "pmax fires at t+10s");
        assert_eq!(transport.notifies[1].payload, b"20");
        assert_eq!(transport.notifies[1].sequence, 2);
    }

    #[test]
    fn s5_registration_lifetime_expiry() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut engine = Engine::new(EngineConfig {
            role: Role::Server { bootstrap: false },
            ..Default::default()
        });
        let events = Rc::new(RefCell::new(vec![]));
        let sink = Rc::clone(&events);
        engine.registrations_mut().subscribe(
            1,
            Box::new(move |event, client| {
                sink.borrow_mut().push((event, client.endpoint_name.clone()));
            }),
        );

        let client_addr: SocketAddr = "192.0.2.60:40001".parse().unwrap();
        let mut register = request(CoapMethod::Post, "/rd", client_addr);
        register.query = "ep=client1&lt=5&b=U".to_owned();
        register.content_type = Some(ContentType::LinkFormat);
        register.payload = b"</3/0>".to_vec();

        let response = engine.handle_request(&register, 0);
        assert_eq!(response.code, ResultCode::SuccessCreated);
        assert_eq!(response.location.as_deref(), Some("rd/1"));

        let mut transport = RecordingTransport::new();
        engine.tick(5_000, &mut transport);
        assert_eq!(engine.registrations().clients().count(), 1);

        engine.tick(6_000, &mut transport);
        assert_eq!(engine.registrations().clients().count(), 0);
        assert_eq!(
            *events.borrow(),
            vec![
                (RegistrationEvent::Register, "client1".to_owned()),
                (RegistrationEvent::Deregister, "client1".to_owned()),
            ]
        );

        // The endpoint name is free again for the same address.
        let again = engine.handle_request(&register, 7_000);
        assert_eq!(again.code, ResultCode::SuccessCreated);
        assert_eq!(again.location.as_deref(), Some("rd/2"));
    }

    #[test]
    fn s6_bootstrap_origin_bypasses_security_rules() {
        let mut engine = provisioned_client();

        // The bootstrap server may observe the security object.
        let mut observe = request(CoapMethod::Get, "/0/1/0", bootstrap_peer());
        observe.observe = Some(ObserveFlag::Register);
        observe.token = vec![0xCC];
        assert_eq!(
            engine.handle_request(&observe, 0).code,
            ResultCode::SuccessContent
        );
        assert_eq!(engine.observers().len(), 1);

        let mut from_server = request(CoapMethod::Put, "/0/1/0", management());
        from_server.content_type = Some(ContentType::PlainText);
        from_server.payload = b"coap://192.0.2.99:5683".to_vec();
        assert_eq!(
            engine.handle_request(&from_server, 100).code,
            ResultCode::Unauthorized
        );

        let mut from_bootstrap = request(CoapMethod::Put, "/0/1/0", bootstrap_peer());
        from_bootstrap.content_type = Some(ContentType::PlainText);
        from_bootstrap.payload = b"coap://192.0.2.99:5683".to_vec();
        assert_eq!(
            engine.handle_request(&from_bootstrap, 200).code,
            ResultCode::SuccessChanged
        );
        assert_eq!(engine.observers().len(), 0, "the observation was cancelled");
    }

    #[test]
    fn post_to_object_creates_and_reports_location() {
        let mut engine = provisioned_client();
        engine
            .define_object(ObjectDefinition::new(10000, "Widget").instances(0, 2))
            .unwrap();
        engine
            .define_resource(
                ResourceDefinition::new(10000, 0, "Counter", ResourceKind::Integer)
                    .instances(1, 1),
            )
            .unwrap();

        let mut payload = TreeNode::resource(0);
        payload.add_child(TreeNode::resource_instance(
            0,
            Value::Integer(7).to_store_bytes(),
        ));
        let mut instance = TreeNode::object_instance(None);
        instance.add_child(payload);

        // Without an instance id the store allocates one.
        let target: Path = "/10000".parse().unwrap();
        let body = tlv::encode(engine.definitions(), &instance, &target).unwrap();
        let mut create = request(CoapMethod::Post, "/10000", management());
        create.content_type = Some(ContentType::OmaTlv);
        create.payload = body;

        let first = engine.handle_request(&create, 0);
        assert_eq!(first.code, ResultCode::SuccessCreated);
        assert_eq!(first.location.as_deref(), Some("/10000/0"));

        let second = engine.handle_request(&create, 0);
        assert_eq!(second.code, ResultCode::SuccessCreated);
        assert_eq!(second.location.as_deref(), Some("/10000/1"));

        // Cardinality exhausted.
        let third = engine.handle_request(&create, 0);
        assert_eq!(third.code, ResultCode::MethodNotAllowed);
    }

    #[test]
    fn delete_rules_follow_the_origin_matrix() {
        let mut engine = provisioned_client();
        engine.create_optional_resource(3, 0, 14).unwrap();

        // Resource-level DELETE is not for management servers.
        assert_eq!(
            engine
                .handle_request(&request(CoapMethod::Delete, "/3/0/14", management()), 0)
                .code,
            ResultCode::MethodNotAllowed
        );
        // The only instance of a mandatory single-instance object stays,
        // whichever origin asks.
        assert_eq!(
            engine
                .handle_request(&request(CoapMethod::Delete, "/3/0", management()), 0)
                .code,
            ResultCode::MethodNotAllowed
        );
        assert_eq!(
            engine
                .handle_request(&request(CoapMethod::Delete, "/3/0", bootstrap_peer()), 0)
                .code,
            ResultCode::MethodNotAllowed
        );
        assert_eq!(
            engine.delete(RequestOrigin::Client, &Path::instance(3, 0), false),
            ResultCode::MethodNotAllowed
        );
        assert!(engine.store().exists(&Path::instance(3, 0)));
        // The server object is off limits to management servers.
        assert_eq!(
            engine
                .handle_request(&request(CoapMethod::Delete, "/1/0", management()), 0)
                .code,
            ResultCode::Unauthorized
        );
        // Root delete requires the bootstrap origin...
        assert_eq!(
            engine
                .handle_request(&request(CoapMethod::Delete, "/", management()), 0)
                .code,
            ResultCode::Unauthorized
        );
        // ...which wipes everything except the security object.
        assert_eq!(
            engine
                .handle_request(&request(CoapMethod::Delete, "/", bootstrap_peer()), 0)
                .code,
            ResultCode::SuccessDeleted
        );
        assert!(!engine.store().exists(&Path::instance(3, 0)));
        assert!(engine.store().exists(&Path::instance(0, 0)));
        assert!(engine.store().exists(&Path::instance(0, 1)));
    }

    #[test]
    fn client_origin_may_delete_resources() {
        let mut engine = provisioned_client();
        engine.create_optional_resource(3, 0, 14).unwrap();
        assert_eq!(
            engine.delete(RequestOrigin::Client, &Path::resource(3, 0, 14), false),
            ResultCode::SuccessDeleted
        );
        assert!(!engine.store().exists(&Path::resource(3, 0, 14)));
    }

    #[test]
    fn discover_lists_structure_not_values() {
        let mut engine = provisioned_client();
        engine.create_optional_resource(3, 0, 9).unwrap();

        let mut discover = request(CoapMethod::Get, "/3", management());
        discover.accept = Some(ContentType::LinkFormat);
        let response = engine.handle_request(&discover, 0);
        assert_eq!(response.code, ResultCode::SuccessContent);
        assert_eq!(response.content_type, Some(ContentType::LinkFormat));

        let text = String::from_utf8(response.payload).unwrap();
        assert!(text.starts_with("</3>"), "{text}");
        assert!(text.contains("</3/0>"), "{text}");
        assert!(text.contains("</3/0/9>"), "{text}");
        assert!(!text.contains('='), "no values in a discover: {text}");
    }

    #[test]
    fn observe_and_discover_do_not_combine() {
        let mut engine = provisioned_client();
        engine.create_optional_resource(3, 0, 9).unwrap();

        let mut observe = request(CoapMethod::Get, "/3/0/9", management());
        observe.observe = Some(ObserveFlag::Register);
        observe.accept = Some(ContentType::LinkFormat);
        assert_eq!(
            engine.handle_request(&observe, 0).code,
            ResultCode::MethodNotAllowed
        );
    }

    #[test]
    fn cancel_observe_serves_a_final_read() {
        let mut engine = provisioned_client();
        engine.create_optional_resource(3, 0, 9).unwrap();
        engine
            .write_resource_instance(3, 0, 9, 0, Value::Integer(42).to_store_bytes())
            .unwrap();

        let mut observe = request(CoapMethod::Get, "/3/0/9", management());
        observe.observe = Some(ObserveFlag::Register);
        observe.token = vec![1];
        engine.handle_request(&observe, 0);
        assert_eq!(engine.observers().len(), 1);

        let mut cancel = request(CoapMethod::Get, "/3/0/9", management());
        cancel.observe = Some(ObserveFlag::Deregister);
        let response = engine.handle_request(&cancel, 1_000);
        assert_eq!(response.code, ResultCode::SuccessContent);
        assert_eq!(response.payload, b"42");
        assert_eq!(engine.observers().len(), 0);
    }

    #[test]
    fn write_attributes_validate_before_committing() {
        let mut engine = provisioned_client();
        engine.create_optional_resource(3, 0, 9).unwrap();

        let mut bad = request(CoapMethod::Put, "/3/0/9", management());
        bad.query = "pmin=20&pmax=5".to_owned();
        assert_eq!(engine.handle_request(&bad, 0).code, ResultCode::BadRequest);

        let mut unknown = request(CoapMethod::Put, "/3/0/9", management());
        unknown.query = "frequency=often".to_owned();
        assert_eq!(
            engine.handle_request(&unknown, 0).code,
            ResultCode::BadRequest
        );

        // Executable resources take no attributes.
        let mut on_exec = request(CoapMethod::Put, "/3/0/4", management());
        on_exec.query = "pmin=1".to_owned();
        assert_eq!(
            engine.handle_request(&on_exec, 0).code,
            ResultCode::MethodNotAllowed
        );
    }

    #[test]
    fn write_attributes_cancel_drops_the_observation() {
        let mut engine = provisioned_client();
        engine.create_optional_resource(3, 0, 9).unwrap();

        let mut observe = request(CoapMethod::Get, "/3/0/9", management());
        observe.observe = Some(ObserveFlag::Register);
        engine.handle_request(&observe, 0);
        assert_eq!(engine.observers().len(), 1);

        let mut cancel = request(CoapMethod::Put, "/3/0/9", management());
        cancel.query = "cancel".to_owned();
        assert_eq!(
            engine.handle_request(&cancel, 0).code,
            ResultCode::SuccessChanged
        );
        assert_eq!(engine.observers().len(), 0);
    }

    #[test]
    fn execute_runs_the_handler() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        #[derive(Debug, Default)]
        struct Counter(AtomicUsize);
        impl crate::definition::ResourceOps for Counter {
            fn execute(&self, _path: &Path, arguments: &[u8]) -> ResultCode {
                assert_eq!(arguments, b"3");
                self.0.fetch_add(1, Ordering::Relaxed);
                ResultCode::SuccessChanged
            }
        }

        let mut engine = provisioned_client();
        engine
            .define_object(ObjectDefinition::new(10000, "Widget").instances(0, 1))
            .unwrap();
        let counter = Arc::new(Counter::default());
        engine
            .define_resource(
                ResourceDefinition::new(10000, 1, "Trigger", ResourceKind::None)
                    .operations(Operations::Execute)
                    .instances(1, 1)
                    .handler(counter.clone()),
            )
            .unwrap();
        engine.create_object_instance(10000, Some(0)).unwrap();

        let mut execute = request(CoapMethod::Post, "/10000/0/1", management());
        execute.payload = b"3".to_vec();
        assert_eq!(
            engine.handle_request(&execute, 0).code,
            ResultCode::SuccessChanged
        );
        assert_eq!(counter.0.load(Ordering::Relaxed), 1);

        // A reboot with no handler cannot run.
        assert_eq!(
            engine
                .handle_request(&request(CoapMethod::Post, "/3/0/4", management()), 0)
                .code,
            ResultCode::MethodNotAllowed
        );
    }

    #[test]
    fn unknown_paths_are_not_found() {
        let mut engine = provisioned_client();
        assert_eq!(
            engine
                .handle_request(&request(CoapMethod::Get, "/77/0", management()), 0)
                .code,
            ResultCode::NotFound
        );
        assert_eq!(
            engine
                .handle_request(&request(CoapMethod::Post, "/77", management()), 0)
                .code,
            ResultCode::NotFound
        );
        // GET needs an exact match even under a known object.
        assert_eq!(
            engine
                .handle_request(&request(CoapMethod::Get, "/3/0/77", management()), 0)
                .code,
            ResultCode::NotFound
        );
    }

    #[test]
    fn server_cannot_read_the_security_object() {
        let mut engine = provisioned_client();
        assert_eq!(
            engine
                .handle_request(&request(CoapMethod::Get, "/0", management()), 0)
                .code,
            ResultCode::Unauthorized
        );
        // The bootstrap server can.
        assert_eq!(
            engine
                .handle_request(&request(CoapMethod::Get, "/0", bootstrap_peer()), 0)
                .code,
            ResultCode::SuccessContent
        );
    }

    #[test]
    fn server_writes_respect_the_operations_mask() {
        let mut engine = provisioned_client();
        // Manufacturer (3/0/0) is read-only.
        engine.create_optional_resource(3, 0, 0).unwrap();

        let payload = string_resource(0, "Acme");
        let write = tlv_request(&engine, CoapMethod::Put, "/3/0/0", management(), &payload);
        assert_eq!(
            engine.handle_request(&write, 0).code,
            ResultCode::MethodNotAllowed
        );
    }

    #[test]
    fn registration_update_and_deregister_round_trip() {
        let mut engine = Engine::new(EngineConfig {
            role: Role::Server { bootstrap: false },
            ..Default::default()
        });
        let client_addr: SocketAddr = "192.0.2.60:40001".parse().unwrap();

        let mut register = request(CoapMethod::Post, "/rd", client_addr);
        register.query = "ep=client1&lt=60&b=U".to_owned();
        register.content_type = Some(ContentType::LinkFormat);
        register.payload = b"</>;rt=\"oma.lwm2m\";ct=11543,</3/0>".to_vec();
        assert_eq!(
            engine.handle_request(&register, 0).code,
            ResultCode::SuccessCreated
        );
        assert!(engine.registrations().lookup_by_name("client1").unwrap().supports_json);

        let mut update = request(CoapMethod::Post, "/rd/1", client_addr);
        update.query = "lt=120".to_owned();
        assert_eq!(
            engine.handle_request(&update, 1_000).code,
            ResultCode::SuccessChanged
        );
        assert_eq!(
            engine.registrations().lookup_by_name("client1").unwrap().lifetime,
            120
        );

        let deregister = request(CoapMethod::Delete, "/rd/1", client_addr);
        assert_eq!(
            engine.handle_request(&deregister, 2_000).code,
            ResultCode::SuccessDeleted
        );
        assert_eq!(engine.registrations().clients().count(), 0);
    }

    #[test]
    fn bootstrap_role_enqueues_provisioning_sessions() {
        let mut engine = Engine::new(EngineConfig {
            role: Role::Server { bootstrap: true },
            ..Default::default()
        });
        engine
            .apply_bootstrap_config(&BootstrapInfo {
                servers: vec![BootstrapServerInfo {
                    server_uri: "coap://192.0.2.10:5683".to_owned(),
                    short_server_id: 1,
                    ..Default::default()
                }],
            })
            .unwrap();

        let client_addr: SocketAddr = "192.0.2.60:40001".parse().unwrap();
        let mut bs = request(CoapMethod::Post, "/bs", client_addr);
        bs.query = "ep=client1".to_owned();
        assert_eq!(
            engine.handle_request(&bs, 0).code,
            ResultCode::SuccessChanged
        );

        let mut transport = RecordingTransport::new();
        engine.tick(1_000, &mut transport);
        assert_eq!(transport.requests.len(), 1);
        assert_eq!(transport.requests[0].path, "/0");
        assert_eq!(transport.requests[0].destination, client_addr);
    }

    #[test]
    fn client_bootstraps_then_registers() {
        let bootstrap_uri = "coap://192.0.2.11:15683";
        let mut engine = Engine::new(EngineConfig {
            bootstrap_server: Some(bootstrap_peer()),
            endpoint_name: "imx7-client".to_owned(),
            ..Default::default()
        });
        // The factory file only names the bootstrap server itself.
        engine
            .apply_bootstrap_config(&BootstrapInfo {
                servers: vec![BootstrapServerInfo {
                    server_uri: bootstrap_uri.to_owned(),
                    is_bootstrap: true,
                    ..Default::default()
                }],
            })
            .unwrap();
        engine.create_object_instance(DEVICE_OBJECT, Some(0)).unwrap();

        let mut transport = RecordingTransport::new();
        // First tick: CheckExisting finds no usable server and falls back to
        // requesting a bootstrap; second tick sends it.
        engine.tick(0, &mut transport);
        assert_eq!(engine.bootstrap_state(), BootstrapState::NotBootstrapped);
        engine.tick(1_000, &mut transport);
        assert_eq!(transport.requests.len(), 1);
        assert_eq!(transport.requests[0].path, "/bs");
        assert_eq!(engine.bootstrap_state(), BootstrapState::WaitingForResponse);

        let token = transport.requests[0].token.clone();
        engine.handle_response(
            &OutboundResponse {
                source: bootstrap_peer(),
                token,
                code: ResultCode::SuccessChanged,
                content_type: None,
                payload: vec![],
                location: None,
            },
            &mut transport,
            100,
        );
        assert_eq!(engine.bootstrap_state(), BootstrapState::Bootstrapping);

        // The bootstrap server provisions a management server into /0 and /1.
        let mut security = TreeNode::object_instance(Some(1));
        security.add_child(string_resource(
            objects::SECURITY_SERVER_URI,
            "coap://192.0.2.10:5683",
        ));
        let mut flag = TreeNode::resource(objects::SECURITY_BOOTSTRAP_SERVER);
        flag.add_child(TreeNode::resource_instance(
            0,
            Value::Boolean(false).to_store_bytes(),
        ));
        security.add_child(flag);
        let mut short_id = TreeNode::resource(objects::SECURITY_SHORT_SERVER_ID);
        short_id.add_child(TreeNode::resource_instance(
            0,
            Value::Integer(1).to_store_bytes(),
        ));
        security.add_child(short_id);
        let security_object = security.wrap_in_object(SECURITY_OBJECT);

        let write = tlv_request(
            &engine,
            CoapMethod::Put,
            "/0",
            bootstrap_peer(),
            &security_object,
        );
        assert_eq!(
            engine.handle_request(&write, 200).code,
            ResultCode::SuccessChanged
        );

        // Bootstrap complete.
        let complete = request(CoapMethod::Post, "/bs", bootstrap_peer());
        assert_eq!(
            engine.handle_request(&complete, 300).code,
            ResultCode::SuccessChanged
        );

        engine.tick(1_300, &mut transport);
        assert_eq!(engine.bootstrap_state(), BootstrapState::Bootstrapped);

        engine.tick(2_300, &mut transport);
        let register = transport.requests.last().unwrap();
        assert_eq!(register.path, "/rd");
        assert_eq!(register.destination, management());
        assert!(register.query.contains("ep=imx7-client"));
        let links = String::from_utf8(register.payload.clone()).unwrap();
        assert!(links.contains("</3/0>"), "{links}");
        assert!(!links.contains("</0"), "security is never advertised: {links}");
    }
}
