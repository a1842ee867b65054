//! Bootstrap: initial provisioning of the security and server objects.
//!
//! Client side, a small state machine drives the holdoff/request/provision
//! sequence against the configured bootstrap server:
//!
//! ```txt
//!     NotBootstrapped -> Requested -> WaitingForResponse -> Bootstrapping
//!            |                                                   |
//!            |  factory config                                   v
//!            +----------------------> CheckExisting -> Bootstrapped
//!                                          |
//!                                          +-> Failed (no usable config)
//! ```
//!
//! Server side (bootstrap role), each client that POSTs `/bs` gets a
//! provisioning session that walks the locally configured security object
//! instances, then the server object instances, sending one TLV PUT per
//! instance and finishing with a POST `/bs` once nothing remains.

use std::net::SocketAddr;

use tracing::{debug, error, info, warn};

use crate::coap::{CoapMethod, OutboundRequest, Transport};
use crate::codec::{self, tlv, ContentType};
use crate::definition::DefinitionRegistry;
use crate::store::ObjectStore;
use crate::tree::TreeNode;
use crate::types::{InstanceId, ObjectId, ResultCode, SECURITY_OBJECT, SERVER_OBJECT};
use crate::value::{ResourceKind, Value};
use crate::{objects, registration::BindingMode};

/// Concurrent provisioning sessions the bootstrap role will hold.
pub const MAX_BOOTSTRAP_SESSIONS: usize = 100;

/// How long the client waits on an unanswered bootstrap request.
const RESPONSE_TIMEOUT_MS: u64 = 15_000;
/// Attempts before the client machine gives up.
const MAX_BOOTSTRAP_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    NotBootstrapped,
    Requested,
    WaitingForResponse,
    Bootstrapping,
    CheckExisting,
    Bootstrapped,
    Failed,
}

/// The client-side bootstrap machine.
#[derive(Debug)]
pub struct ClientBootstrap {
    state: BootstrapState,
    endpoint_name: String,
    bootstrap_server: Option<SocketAddr>,
    attempts: u32,
    state_since_ms: u64,
    request_token: Vec<u8>,
}

impl ClientBootstrap {
    pub fn new(endpoint_name: impl Into<String>, bootstrap_server: Option<SocketAddr>) -> Self {
        Self {
            state: BootstrapState::NotBootstrapped,
            endpoint_name: endpoint_name.into(),
            bootstrap_server,
            attempts: 0,
            state_since_ms: 0,
            request_token: vec![],
        }
    }

    pub fn state(&self) -> BootstrapState {
        self.state
    }

    /// Factory configuration was applied: skip the wire exchange and verify
    /// what we have.
    pub fn factory_applied(&mut self) {
        self.enter(BootstrapState::CheckExisting, self.state_since_ms);
    }

    fn enter(&mut self, state: BootstrapState, now_ms: u64) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "bootstrap state transition");
            self.state = state;
            self.state_since_ms = now_ms;
        }
    }

    /// Whether registration may proceed.
    pub fn ready_to_register(&self) -> bool {
        matches!(
            self.state,
            BootstrapState::Bootstrapped | BootstrapState::CheckExisting
        )
    }

    /// Advance the machine. `has_server_config` reports whether the store
    /// currently holds at least one non-bootstrap server configuration.
    pub fn tick(
        &mut self,
        now_ms: u64,
        has_server_config: bool,
        transport: &mut dyn Transport,
    ) {
        match self.state {
            BootstrapState::NotBootstrapped => {
                let Some(server) = self.bootstrap_server else {
                    // Nothing to ask; either factory data carries us or we fail.
                    self.enter(BootstrapState::CheckExisting, now_ms);
                    return;
                };
                if self.attempts >= MAX_BOOTSTRAP_ATTEMPTS {
                    error!("bootstrap attempts exhausted");
                    self.enter(BootstrapState::Failed, now_ms);
                    return;
                }
                self.attempts += 1;
                self.request_token = crate::coap::new_token();
                info!(%server, attempt = self.attempts, "requesting bootstrap");
                transport.send_request(OutboundRequest {
                    destination: server,
                    method: CoapMethod::Post,
                    path: "/bs".to_owned(),
                    query: format!("ep={}", self.endpoint_name),
                    token: self.request_token.clone(),
                    content_type: None,
                    payload: vec![],
                });
                self.enter(BootstrapState::Requested, now_ms);
                // The send already happened; all that remains is the wait.
                self.enter(BootstrapState::WaitingForResponse, now_ms);
            }
            BootstrapState::Requested | BootstrapState::WaitingForResponse => {
                if now_ms.saturating_sub(self.state_since_ms) > RESPONSE_TIMEOUT_MS {
                    warn!("bootstrap request timed out");
                    self.enter(BootstrapState::NotBootstrapped, now_ms);
                }
            }
            BootstrapState::Bootstrapping => {
                // Waiting for the server's bootstrap-complete POST.
            }
            BootstrapState::CheckExisting => {
                if has_server_config {
                    info!("bootstrap complete");
                    self.enter(BootstrapState::Bootstrapped, now_ms);
                } else if self.bootstrap_server.is_some() {
                    warn!("no server configuration after bootstrap, retrying");
                    self.enter(BootstrapState::NotBootstrapped, now_ms);
                } else {
                    error!("no server configuration and no bootstrap server");
                    self.enter(BootstrapState::Failed, now_ms);
                }
            }
            BootstrapState::Bootstrapped | BootstrapState::Failed => {}
        }
    }

    /// A response to our `/bs` request arrived.
    pub fn on_response(&mut self, token: &[u8], code: ResultCode, now_ms: u64) {
        if token != self.request_token.as_slice() {
            return;
        }
        if !matches!(self.state, BootstrapState::WaitingForResponse | BootstrapState::Requested) {
            return;
        }
        if code.is_success() {
            self.enter(BootstrapState::Bootstrapping, now_ms);
        } else {
            warn!(%code, "bootstrap request rejected");
            self.enter(BootstrapState::NotBootstrapped, now_ms);
        }
    }

    /// The bootstrap server signalled completion with a POST to `/bs`.
    pub fn on_bootstrap_complete(&mut self, now_ms: u64) {
        self.enter(BootstrapState::CheckExisting, now_ms);
    }
}

/// Per-client progress of the provisioning walk.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ProvisioningSession {
    address: SocketAddr,
    current_object: Option<ObjectId>,
    current_instance: Option<InstanceId>,
    token: Vec<u8>,
}

/// The bootstrap server role: provisioning sessions for connecting clients.
#[derive(Debug, Default)]
pub struct ProvisioningQueue {
    sessions: Vec<ProvisioningSession>,
}

impl ProvisioningQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Accept a client's bootstrap request. Fails `TooManyRequests` when the
    /// session table is full.
    pub fn enqueue(&mut self, address: SocketAddr) -> Result<(), ResultCode> {
        if self.sessions.iter().any(|session| session.address == address) {
            return Ok(()); // already provisioning this client
        }
        if self.sessions.len() >= MAX_BOOTSTRAP_SESSIONS {
            return Err(ResultCode::TooManyRequests);
        }
        info!(%address, "bootstrap session accepted");
        self.sessions.push(ProvisioningSession {
            address,
            current_object: Some(SECURITY_OBJECT),
            current_instance: None,
            token: vec![],
        });
        Ok(())
    }

    /// Kick off any sessions that have not sent their first write yet.
    pub fn tick(
        &mut self,
        registry: &DefinitionRegistry,
        store: &ObjectStore,
        transport: &mut dyn Transport,
    ) {
        let pending: Vec<SocketAddr> = self
            .sessions
            .iter()
            .filter(|session| session.token.is_empty())
            .map(|session| session.address)
            .collect();
        for address in pending {
            self.advance(address, registry, store, transport);
        }
    }

    /// A response from a provisioned client arrived; send the next write.
    pub fn on_response(
        &mut self,
        source: SocketAddr,
        code: ResultCode,
        registry: &DefinitionRegistry,
        store: &ObjectStore,
        transport: &mut dyn Transport,
    ) {
        let Some(session) = self
            .sessions
            .iter()
            .find(|session| session.address == source)
        else {
            return;
        };
        if !code.is_success() {
            warn!(%source, %code, "client rejected a provisioning write, dropping session");
            let address = session.address;
            self.sessions.retain(|session| session.address != address);
            return;
        }
        self.advance(source, registry, store, transport);
    }

    fn advance(
        &mut self,
        address: SocketAddr,
        registry: &DefinitionRegistry,
        store: &ObjectStore,
        transport: &mut dyn Transport,
    ) {
        let Some(at) = self
            .sessions
            .iter()
            .position(|session| session.address == address)
        else {
            return;
        };

        // Walk security instances, then server instances.
        let (mut current_object, mut current_instance) = (
            self.sessions[at].current_object,
            self.sessions[at].current_instance,
        );
        while let Some(object) = current_object {
            current_instance = store.next_instance(object, current_instance);
            if current_instance.is_some() {
                break;
            }
            current_object = match object {
                SECURITY_OBJECT => Some(SERVER_OBJECT),
                _ => None,
            };
        }
        self.sessions[at].current_object = current_object;
        self.sessions[at].current_instance = current_instance;

        match (current_object, current_instance) {
            (Some(object), Some(instance)) => {
                let payload = match serialize_instance(registry, store, object, instance) {
                    Ok(payload) => payload,
                    Err(err) => {
                        error!(object, instance, %err, "cannot serialize provisioning write");
                        self.sessions.remove(at);
                        return;
                    }
                };
                let token = crate::coap::new_token();
                self.sessions[at].token = token.clone();
                debug!(%address, object, instance, "provisioning write");
                transport.send_request(OutboundRequest {
                    destination: address,
                    method: CoapMethod::Put,
                    path: format!("/{object}"),
                    query: String::new(),
                    token,
                    content_type: Some(ContentType::OmaTlv),
                    payload,
                });
            }
            _ => {
                info!(%address, "provisioning complete");
                transport.send_request(OutboundRequest {
                    destination: address,
                    method: CoapMethod::Post,
                    path: "/bs".to_owned(),
                    query: String::new(),
                    token: crate::coap::new_token(),
                    content_type: None,
                    payload: vec![],
                });
                self.sessions.remove(at);
            }
        }
    }
}

/// Serialize one object instance, wrapped in its object, as TLV.
fn serialize_instance(
    registry: &DefinitionRegistry,
    store: &ObjectStore,
    object: ObjectId,
    instance: InstanceId,
) -> Result<Vec<u8>, codec::EncodeError> {
    let mut instance_node = TreeNode::object_instance(Some(instance));
    let mut resource = store.next_resource(object, instance, None);
    while let Some(resource_id) = resource {
        let mut resource_node = TreeNode::resource(resource_id);
        let mut index = store.next_resource_instance(object, instance, resource_id, None);
        while let Some(i) = index {
            if let Some(bytes) = store.read(object, instance, resource_id, i) {
                resource_node.add_child(TreeNode::resource_instance(i, bytes.to_vec()));
            }
            index = store.next_resource_instance(object, instance, resource_id, Some(i));
        }
        if resource_node.child_count() > 0 {
            instance_node.add_child(resource_node);
        }
        resource = store.next_resource(object, instance, Some(resource_id));
    }

    let object_node = instance_node.wrap_in_object(object);
    tlv::encode(registry, &object_node, &crate::types::Path::object(object))
}

/// One provisioned server block from the bootstrap configuration file.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapServerInfo {
    pub server_uri: String,
    pub is_bootstrap: bool,
    pub security_mode: i64,
    pub public_key_or_identity: Vec<u8>,
    pub secret_key: Vec<u8>,
    pub short_server_id: u16,
    pub holdoff: i64,
    pub lifetime: i64,
    pub default_minimum_period: i64,
    pub default_maximum_period: i64,
    pub binding: BindingMode,
}

impl Default for BootstrapServerInfo {
    fn default() -> Self {
        Self {
            server_uri: String::new(),
            is_bootstrap: false,
            security_mode: 0,
            public_key_or_identity: vec![],
            secret_key: vec![],
            short_server_id: 1,
            holdoff: 0,
            lifetime: crate::registration::LIFETIME_DEFAULT,
            default_minimum_period: 0,
            default_maximum_period: 0,
            binding: BindingMode::Udp,
        }
    }
}

/// The parsed bootstrap configuration: one or more server blocks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BootstrapInfo {
    pub servers: Vec<BootstrapServerInfo>,
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapConfigError {
    #[error("line {0}: expected `Key Value`")]
    MalformedLine(usize),
    #[error("line {line}: bad value for {key}")]
    BadValue { line: usize, key: String },
    #[error("configuration defines no servers")]
    Empty,
    #[error("a server block is missing its ServerURI")]
    MissingUri,
}

impl BootstrapInfo {
    /// Parse the plain-text key/value bootstrap configuration: `Key Value`
    /// lines, blank-line-separated server blocks, `#` comments. The whole
    /// file is validated before anything is applied.
    pub fn parse(text: &str) -> Result<Self, BootstrapConfigError> {
        let mut servers = vec![];
        let mut current: Option<BootstrapServerInfo> = None;

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                if let Some(server) = current.take() {
                    servers.push(server);
                }
                continue;
            }
            if line.starts_with('#') {
                continue;
            }

            let (key, value) = line
                .split_once(char::is_whitespace)
                .map(|(key, value)| (key.trim(), value.trim()))
                .ok_or(BootstrapConfigError::MalformedLine(index + 1))?;
            let server = current.get_or_insert_with(BootstrapServerInfo::default);
            let bad_value = || BootstrapConfigError::BadValue {
                line: index + 1,
                key: key.to_owned(),
            };

            match key {
                "ServerURI" => server.server_uri = value.to_owned(),
                "BootstrapServer" => {
                    server.is_bootstrap = match value {
                        "True" => true,
                        "False" => false,
                        _ => return Err(bad_value()),
                    }
                }
                "SecurityMode" => {
                    server.security_mode = value.parse().map_err(|_| bad_value())?
                }
                "PublicKeyOrIdentity" => {
                    server.public_key_or_identity = value.as_bytes().to_vec()
                }
                "SecretKey" => server.secret_key = value.as_bytes().to_vec(),
                "ShortServerID" => {
                    server.short_server_id = value.parse().map_err(|_| bad_value())?
                }
                "ClientHoldOffTime" => server.holdoff = value.parse().map_err(|_| bad_value())?,
                "Lifetime" => server.lifetime = value.parse().map_err(|_| bad_value())?,
                "DefaultMinPeriod" => {
                    server.default_minimum_period = value.parse().map_err(|_| bad_value())?
                }
                "DefaultMaxPeriod" => {
                    server.default_maximum_period = value.parse().map_err(|_| bad_value())?
                }
                "Binding" => {
                    server.binding = value.parse().map_err(|_| bad_value())?
                }
                _ => return Err(bad_value()),
            }
        }
        if let Some(server) = current.take() {
            servers.push(server);
        }

        if servers.is_empty() {
            return Err(BootstrapConfigError::Empty);
        }
        if servers.iter().any(|server| server.server_uri.is_empty()) {
            return Err(BootstrapConfigError::MissingUri);
        }
        Ok(Self { servers })
    }
}

/// Write one server block's resources into the store. The caller creates
/// the instances and owns atomicity (parse + validate before apply).
pub fn apply_server_info(
    store: &mut ObjectStore,
    info: &BootstrapServerInfo,
    security_instance: InstanceId,
    server_instance: Option<InstanceId>,
) -> Result<(), crate::store::StoreError> {
    let security: &[(u16, Vec<u8>)] = &[
        (
            objects::SECURITY_SERVER_URI,
            Value::String(info.server_uri.clone()).to_store_bytes(),
        ),
        (
            objects::SECURITY_BOOTSTRAP_SERVER,
            Value::Boolean(info.is_bootstrap).to_store_bytes(),
        ),
        (
            objects::SECURITY_MODE,
            Value::Integer(info.security_mode).to_store_bytes(),
        ),
        (
            objects::SECURITY_PUBLIC_KEY_OR_IDENTITY,
            Value::Opaque(info.public_key_or_identity.clone()).to_store_bytes(),
        ),
        (
            objects::SECURITY_SECRET_KEY,
            Value::Opaque(info.secret_key.clone()).to_store_bytes(),
        ),
        (
            objects::SECURITY_SHORT_SERVER_ID,
            Value::Integer(info.short_server_id as i64).to_store_bytes(),
        ),
        (
            objects::SECURITY_HOLD_OFF_TIME,
            Value::Integer(info.holdoff).to_store_bytes(),
        ),
    ];
    for (resource, bytes) in security {
        ensure_resource(store, SECURITY_OBJECT, security_instance, *resource)?;
        store.write(SECURITY_OBJECT, security_instance, *resource, 0, bytes.clone())?;
    }

    if let Some(server_instance) = server_instance {
        let server: &[(u16, Vec<u8>)] = &[
            (
                objects::SERVER_SHORT_SERVER_ID,
                Value::Integer(info.short_server_id as i64).to_store_bytes(),
            ),
            (
                objects::SERVER_LIFETIME,
                Value::Integer(info.lifetime).to_store_bytes(),
            ),
            (
                objects::SERVER_DEFAULT_MIN_PERIOD,
                Value::Integer(info.default_minimum_period).to_store_bytes(),
            ),
            (
                objects::SERVER_DEFAULT_MAX_PERIOD,
                Value::Integer(info.default_maximum_period).to_store_bytes(),
            ),
            (
                objects::SERVER_BINDING,
                Value::String(info.binding.to_string()).to_store_bytes(),
            ),
        ];
        for (resource, bytes) in server {
            ensure_resource(store, SERVER_OBJECT, server_instance, *resource)?;
            store.write(SERVER_OBJECT, server_instance, *resource, 0, bytes.clone())?;
        }
    }
    Ok(())
}

fn ensure_resource(
    store: &mut ObjectStore,
    object: ObjectId,
    instance: InstanceId,
    resource: u16,
) -> Result<(), crate::store::StoreError> {
    match store.create_resource(object, instance, resource) {
        Ok(()) | Err(crate::store::StoreError::AlreadyExists(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

/// The store holds at least one non-bootstrap server entry usable for
/// registration.
pub fn has_server_configuration(store: &ObjectStore) -> bool {
    let mut instance = store.next_instance(SECURITY_OBJECT, None);
    while let Some(id) = instance {
        let is_bootstrap = store
            .read(SECURITY_OBJECT, id, objects::SECURITY_BOOTSTRAP_SERVER, 0)
            .and_then(|bytes| Value::from_store_bytes(ResourceKind::Boolean, bytes).ok())
            .map(|value| value == Value::Boolean(true))
            .unwrap_or(false);
        if !is_bootstrap {
            return true;
        }
        instance = store.next_instance(SECURITY_OBJECT, Some(id));
    }
    false
}
