//! The server-side table of registered clients.
//!
//! A client appears with `POST /rd?ep=<name>&lt=<secs>&b=U` and a CoRE-link
//! object list, is addressed through its `/rd/<location>` endpoint for
//! Update and Deregister, and is aged out by a 1 Hz tick when its lifetime
//! passes without contact. Register, Update and Deregister are fanned out to
//! subscribers (typically IPC sessions) as they happen.

use std::fmt::{self, Display};
use std::net::SocketAddr;
use std::str::FromStr;

use tracing::{debug, info, warn};

use crate::codec::link::ObjectListEntry;
use crate::types::{InstanceId, ObjectId, ResultCode};

/// Fallback when a registration carries no (or a zero) `lt=`.
pub const LIFETIME_DEFAULT: i64 = 86_400;

/// Transport binding a client advertises. Only `U` is required here; the
/// queue-mode variants are carried for round-tripping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BindingMode {
    #[default]
    Udp,
    UdpQueued,
    Sms,
    SmsQueued,
    UdpSms,
    UdpQueuedSms,
}

impl Display for BindingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingMode::Udp => "U",
            BindingMode::UdpQueued => "UQ",
            BindingMode::Sms => "S",
            BindingMode::SmsQueued => "SQ",
            BindingMode::UdpSms => "US",
            BindingMode::UdpQueuedSms => "UQS",
        }
        .fmt(f)
    }
}

impl FromStr for BindingMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "U" => BindingMode::Udp,
            "UQ" => BindingMode::UdpQueued,
            "S" => BindingMode::Sms,
            "SQ" => BindingMode::SmsQueued,
            "US" => BindingMode::UdpSms,
            "UQS" => BindingMode::UdpQueuedSms,
            _ => return Err(()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RegisteredClient {
    pub endpoint_name: String,
    pub address: SocketAddr,
    pub lifetime: i64,
    pub binding: BindingMode,
    pub location: u32,
    pub last_update_ms: u64,
    pub supports_json: bool,
    pub objects: Vec<ObjectListEntry>,
}

impl RegisteredClient {
    pub fn supports_object(&self, object: ObjectId, instance: Option<InstanceId>) -> bool {
        self.objects.iter().any(|entry| {
            entry.object == object && (instance.is_none() || entry.instance == instance)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationEvent {
    Register,
    Update,
    Deregister,
}

pub type EventCallback = Box<dyn FnMut(RegistrationEvent, &RegisteredClient)>;

struct Subscriber {
    session_id: u32,
    callback: EventCallback,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct RegistrationTable {
    clients: Vec<RegisteredClient>,
    last_location: u32,
    subscribers: Vec<Subscriber>,
}

impl RegistrationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup_by_name(&self, endpoint_name: &str) -> Option<&RegisteredClient> {
        self.clients
            .iter()
            .find(|client| client.endpoint_name == endpoint_name)
    }

    pub fn lookup_by_location(&self, location: u32) -> Option<&RegisteredClient> {
        self.clients.iter().find(|client| client.location == location)
    }

    pub fn lookup_by_address(&self, address: SocketAddr) -> Option<&RegisteredClient> {
        self.clients.iter().find(|client| client.address == address)
    }

    pub fn clients(&self) -> impl Iterator<Item = &RegisteredClient> {
        self.clients.iter()
    }

    pub fn last_location(&self) -> u32 {
        self.last_location
    }

    /// Register `endpoint_name` from `address`.
    ///
    /// A name already registered from the *same* address is deregistered
    /// first (the client forgot our state, e.g. after a factory reset) and
    /// re-created fresh; from a different address the attempt is a duplicate
    /// and fails `Forbidden`.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &mut self,
        endpoint_name: &str,
        address: SocketAddr,
        lifetime: Option<i64>,
        binding: BindingMode,
        supports_json: bool,
        objects: Vec<ObjectListEntry>,
        now_ms: u64,
    ) -> Result<u32, ResultCode> {
        if let Some(existing) = self.lookup_by_name(endpoint_name) {
            if existing.address != address {
                warn!(endpoint_name, %address, "duplicate registration from a different address");
                return Err(ResultCode::Forbidden);
            }
            info!(endpoint_name, "client already registered, replacing");
            let location = existing.location;
            self.deregister(location);
        }

        self.last_location += 1;
        let location = self.last_location;
        let client = RegisteredClient {
            endpoint_name: endpoint_name.to_owned(),
            address,
            lifetime: match lifetime {
                Some(lifetime) if lifetime > 0 => lifetime,
                _ => LIFETIME_DEFAULT,
            },
            binding,
            location,
            last_update_ms: now_ms,
            supports_json,
            objects,
        };

        info!(endpoint_name, location, "client registered");
        self.dispatch(RegistrationEvent::Register, &client);
        self.clients.push(client);
        Ok(location)
    }

    /// Refresh the registration at `location`. Absent parameters keep their
    /// current values; an empty object list leaves the advertisement alone.
    pub fn update(
        &mut self,
        location: u32,
        lifetime: Option<i64>,
        binding: Option<BindingMode>,
        address: SocketAddr,
        objects: Option<(bool, Vec<ObjectListEntry>)>,
        now_ms: u64,
    ) -> Result<(), ResultCode> {
        let client = self
            .clients
            .iter_mut()
            .find(|client| client.location == location)
            .ok_or(ResultCode::NotFound)?;

        if let Some(lifetime) = lifetime {
            client.lifetime = if lifetime > 0 { lifetime } else { LIFETIME_DEFAULT };
        }
        if let Some(binding) = binding {
            client.binding = binding;
        }
        if let Some((supports_json, objects)) = objects {
            client.supports_json = supports_json;
            client.objects = objects;
        }
        client.address = address;
        client.last_update_ms = now_ms;

        debug!(endpoint_name = %client.endpoint_name, location, "registration updated");
        let snapshot = client.clone();
        self.dispatch(RegistrationEvent::Update, &snapshot);
        Ok(())
    }

    /// Remove the registration at `location`, dispatching `Deregister`.
    pub fn deregister(&mut self, location: u32) -> Option<RegisteredClient> {
        let at = self
            .clients
            .iter()
            .position(|client| client.location == location)?;
        let client = self.clients.remove(at);
        info!(endpoint_name = %client.endpoint_name, location, "client deregistered");
        self.dispatch(RegistrationEvent::Deregister, &client);
        Some(client)
    }

    /// Drop registrations whose lifetime elapsed without contact. Returns
    /// the removed clients so the caller can tear down dependent state.
    pub fn age(&mut self, now_ms: u64) -> Vec<RegisteredClient> {
        let expired: Vec<u32> = self
            .clients
            .iter()
            .filter(|client| {
                now_ms.saturating_sub(client.last_update_ms) > client.lifetime as u64 * 1000
            })
            .map(|client| client.location)
            .collect();

        expired
            .into_iter()
            .filter_map(|location| {
                warn!(location, "registration lifetime expired");
                self.deregister(location)
            })
            .collect()
    }

    pub fn subscribe(&mut self, session_id: u32, callback: EventCallback) {
        self.subscribers.push(Subscriber {
            session_id,
            callback,
        });
    }

    /// Release the subscriber records a closing IPC session owns.
    pub fn unsubscribe(&mut self, session_id: u32) {
        self.subscribers
            .retain(|subscriber| subscriber.session_id != session_id);
    }

    fn dispatch(&mut self, event: RegistrationEvent, client: &RegisteredClient) {
        for subscriber in &mut self.subscribers {
            debug!(session_id = subscriber.session_id, ?event, "dispatching registration event");
            (subscriber.callback)(event, client);
        }
    }
}

/// How long the client waits on an unanswered register/update.
const EXCHANGE_TIMEOUT_MS: u64 = 15_000;

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    NotRegistered,
    RegisterSent { token: Vec<u8> },
    Registered { location: String },
    UpdateSent { token: Vec<u8>, location: String },
}

/// One client-side registration with a management server.
#[derive(Debug)]
pub struct ServerSession {
    pub address: SocketAddr,
    pub short_server_id: u16,
    pub lifetime: i64,
    state: SessionState,
    last_contact_ms: u64,
}

impl ServerSession {
    pub fn is_registered(&self) -> bool {
        matches!(
            self.state,
            SessionState::Registered { .. } | SessionState::UpdateSent { .. }
        )
    }
}

/// Client-side registration driver: keeps one session per configured server
/// and re-registers or updates as lifetimes and object-list changes demand.
#[derive(Debug)]
pub struct Registrar {
    endpoint_name: String,
    sessions: Vec<ServerSession>,
}

impl Registrar {
    pub fn new(endpoint_name: impl Into<String>) -> Self {
        Self {
            endpoint_name: endpoint_name.into(),
            sessions: vec![],
        }
    }

    pub fn sessions(&self) -> impl Iterator<Item = &ServerSession> {
        self.sessions.iter()
    }

    /// Reconcile the session list with the configured servers
    /// (`(address, short server id, lifetime)` per server object entry).
    pub fn sync_servers(&mut self, servers: &[(SocketAddr, u16, i64)]) {
        self.sessions
            .retain(|session| servers.iter().any(|(addr, ..)| *addr == session.address));
        for &(address, short_server_id, lifetime) in servers {
            match self
                .sessions
                .iter_mut()
                .find(|session| session.address == address)
            {
                Some(session) => {
                    session.short_server_id = short_server_id;
                    session.lifetime = lifetime;
                }
                None => self.sessions.push(ServerSession {
                    address,
                    short_server_id,
                    lifetime,
                    state: SessionState::NotRegistered,
                    last_contact_ms: 0,
                }),
            }
        }
    }

    /// Drive every session. `object_links` is the current CoRE-link object
    /// list; `dirty` forces an Update on registered sessions (the advertised
    /// objects changed).
    pub fn tick(
        &mut self,
        now_ms: u64,
        object_links: &str,
        dirty: bool,
        transport: &mut dyn crate::coap::Transport,
    ) {
        use crate::coap::{CoapMethod, OutboundRequest};
        use crate::codec::ContentType;

        for session in &mut self.sessions {
            match &session.state {
                SessionState::NotRegistered => {
                    let token = crate::coap::new_token();
                    info!(address = %session.address, "registering");
                    transport.send_request(OutboundRequest {
                        destination: session.address,
                        method: CoapMethod::Post,
                        path: "/rd".to_owned(),
                        query: format!(
                            "ep={}&lt={}&b={}",
                            self.endpoint_name,
                            session.lifetime,
                            BindingMode::Udp
                        ),
                        token: token.clone(),
                        content_type: Some(ContentType::LinkFormat),
                        payload: object_links.as_bytes().to_vec(),
                    });
                    session.state = SessionState::RegisterSent { token };
                    session.last_contact_ms = now_ms;
                }
                SessionState::RegisterSent { .. } | SessionState::UpdateSent { .. } => {
                    if now_ms.saturating_sub(session.last_contact_ms) > EXCHANGE_TIMEOUT_MS {
                        warn!(address = %session.address, "registration exchange timed out");
                        session.state = SessionState::NotRegistered;
                    }
                }
                SessionState::Registered { location } => {
                    let refresh_due = now_ms.saturating_sub(session.last_contact_ms)
                        >= (session.lifetime.max(2) as u64 * 1000) / 2;
                    if dirty || refresh_due {
                        let token = crate::coap::new_token();
                        debug!(address = %session.address, location, dirty, "updating registration");
                        transport.send_request(OutboundRequest {
                            destination: session.address,
                            method: CoapMethod::Post,
                            path: location.clone(),
                            query: format!("lt={}", session.lifetime),
                            token: token.clone(),
                            content_type: dirty.then_some(ContentType::LinkFormat),
                            payload: if dirty {
                                object_links.as_bytes().to_vec()
                            } else {
                                vec![]
                            },
                        });
                        session.state = SessionState::UpdateSent {
                            token,
                            location: location.clone(),
                        };
                        session.last_contact_ms = now_ms;
                    }
                }
            }
        }
    }

    /// A response from a management server arrived.
    pub fn on_response(
        &mut self,
        source: SocketAddr,
        token: &[u8],
        code: ResultCode,
        location: Option<&str>,
        now_ms: u64,
    ) {
        let Some(session) = self
            .sessions
            .iter_mut()
            .find(|session| session.address == source)
        else {
            return;
        };

        match &session.state {
            SessionState::RegisterSent { token: sent } if sent == token => {
                if code == ResultCode::SuccessCreated {
                    let location = match location {
                        Some(location) if !location.is_empty() => {
                            format!("/{}", location.trim_start_matches('/'))
                        }
                        _ => {
                            warn!(address = %source, "register response carried no location");
                            session.state = SessionState::NotRegistered;
                            return;
                        }
                    };
                    info!(address = %source, location, "registered");
                    session.state = SessionState::Registered { location };
                    session.last_contact_ms = now_ms;
                } else {
                    warn!(address = %source, %code, "registration rejected");
                    session.state = SessionState::NotRegistered;
                }
            }
            SessionState::UpdateSent { token: sent, location } if sent == token => {
                if code.is_success() {
                    session.state = SessionState::Registered {
                        location: location.clone(),
                    };
                    session.last_contact_ms = now_ms;
                } else {
                    // The server forgot us; start over with a fresh Register.
                    warn!(address = %source, %code, "update rejected, re-registering");
                    session.state = SessionState::NotRegistered;
                }
            }
            _ => {}
        }
    }

    /// Deregister every registered session (client shutdown).
    pub fn deregister_all(&mut self, transport: &mut dyn crate::coap::Transport) {
        use crate::coap::{CoapMethod, OutboundRequest};

        for session in &mut self.sessions {
            if let SessionState::Registered { location } | SessionState::UpdateSent { location, .. } =
                &session.state
            {
                info!(address = %session.address, location, "deregistering");
                transport.send_request(OutboundRequest {
                    destination: session.address,
                    method: CoapMethod::Delete,
                    path: location.clone(),
                    query: String::new(),
                    token: crate::coap::new_token(),
                    content_type: None,
                    payload: vec![],
                });
            }
            session.state = SessionState::NotRegistered;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("192.0.2.1:{port}").parse().unwrap()
    }

    fn register_simple(table: &mut RegistrationTable, name: &str, port: u16, now: u64) -> u32 {
        table
            .register(name, addr(port), Some(60), BindingMode::Udp, false, vec![], now)
            .unwrap()
    }

    #[test]
    fn locations_increase_monotonically() {
        let mut table = RegistrationTable::new();
        let first = register_simple(&mut table, "a", 1000, 0);
        let second = register_simple(&mut table, "b", 1001, 0);
        assert!(second > first);

        table.deregister(first);
        let third = register_simple(&mut table, "c", 1002, 0);
        assert!(third > second);
    }

    #[test]
    fn same_address_reregistration_replaces() {
        let mut table = RegistrationTable::new();
        let first = register_simple(&mut table, "a", 1000, 0);
        let second = register_simple(&mut table, "a", 1000, 5_000);

        assert_ne!(first, second);
        assert!(table.lookup_by_location(first).is_none());
        assert_eq!(table.lookup_by_name("a").unwrap().location, second);
    }

    #[test]
    fn different_address_duplicate_is_forbidden() {
        let mut table = RegistrationTable::new();
        register_simple(&mut table, "a", 1000, 0);
        let result = table.register(
            "a",
            addr(2000),
            Some(60),
            BindingMode::Udp,
            false,
            vec![],
            0,
        );
        assert_eq!(result, Err(ResultCode::Forbidden));
    }

    #[test]
    fn zero_lifetime_falls_back_to_default() {
        let mut table = RegistrationTable::new();
        table
            .register("a", addr(1000), Some(0), BindingMode::Udp, false, vec![], 0)
            .unwrap();
        assert_eq!(table.lookup_by_name("a").unwrap().lifetime, LIFETIME_DEFAULT);
    }

    #[test]
    fn ageing_removes_expired_registrations() {
        let mut table = RegistrationTable::new();
        table
            .register("a", addr(1000), Some(5), BindingMode::Udp, false, vec![], 0)
            .unwrap();

        assert!(table.age(5_000).is_empty());
        let removed = table.age(5_001);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].endpoint_name, "a");
        assert!(table.lookup_by_name("a").is_none());
    }

    #[test]
    fn update_refreshes_the_contact_time() {
        let mut table = RegistrationTable::new();
        let location = register_simple(&mut table, "a", 1000, 0);

        table
            .update(location, None, None, addr(1000), None, 50_000)
            .unwrap();
        assert!(table.age(60_000).is_empty());
        assert_eq!(table.age(111_000).len(), 1);
    }

    #[test]
    fn events_fan_out_to_subscribers() {
        let mut table = RegistrationTable::new();
        let seen = Rc::new(RefCell::new(vec![]));

        let sink = Rc::clone(&seen);
        table.subscribe(
            7,
            Box::new(move |event, client| {
                sink.borrow_mut().push((event, client.endpoint_name.clone()));
            }),
        );

        let location = register_simple(&mut table, "a", 1000, 0);
        table
            .update(location, Some(120), None, addr(1000), None, 1_000)
            .unwrap();
        table.deregister(location);

        assert_eq!(
            *seen.borrow(),
            vec![
                (RegistrationEvent::Register, "a".to_owned()),
                (RegistrationEvent::Update, "a".to_owned()),
                (RegistrationEvent::Deregister, "a".to_owned()),
            ]
        );

        table.unsubscribe(7);
        register_simple(&mut table, "b", 1001, 0);
        assert_eq!(seen.borrow().len(), 3);
    }

    #[test]
    fn binding_modes_parse_and_render() {
        for text in ["U", "UQ", "S", "SQ", "US", "UQS"] {
            let mode: BindingMode = text.parse().unwrap();
            assert_eq!(mode.to_string(), text);
        }
        assert!("X".parse::<BindingMode>().is_err());
    }

    mod registrar {
        use std::net::SocketAddr;

        use crate::coap::{CoapMethod, RecordingTransport};
        use crate::registration::Registrar;
        use crate::types::ResultCode;

        fn server() -> SocketAddr {
            "192.0.2.10:5683".parse().unwrap()
        }

        fn registrar() -> Registrar {
            let mut registrar = Registrar::new("imx7-client");
            registrar.sync_servers(&[(server(), 1, 60)]);
            registrar
        }

        #[test]
        fn registers_then_refreshes_at_half_lifetime() {
            let mut registrar = registrar();
            let mut transport = RecordingTransport::new();

            registrar.tick(0, "</3/0>", false, &mut transport);
            assert_eq!(transport.requests.len(), 1);
            let register = &transport.requests[0];
            assert_eq!(register.method, CoapMethod::Post);
            assert_eq!(register.path, "/rd");
            assert!(register.query.contains("ep=imx7-client"));
            assert!(register.query.contains("lt=60"));
            assert_eq!(register.payload, b"</3/0>");

            registrar.on_response(
                server(),
                &register.token.clone(),
                ResultCode::SuccessCreated,
                Some("rd/3"),
                100,
            );
            assert!(registrar.sessions().next().unwrap().is_registered());

            // No update yet at 20 s...
            registrar.tick(20_100, "</3/0>", false, &mut transport);
            assert_eq!(transport.requests.len(), 1);
            // ...but one at the half-lifetime mark.
            registrar.tick(30_100, "</3/0>", false, &mut transport);
            assert_eq!(transport.requests.len(), 2);
            assert_eq!(transport.requests[1].path, "/rd/3");
            assert!(transport.requests[1].payload.is_empty());
        }

        #[test]
        fn dirty_object_list_forces_an_update_with_payload() {
            let mut registrar = registrar();
            let mut transport = RecordingTransport::new();

            registrar.tick(0, "</3/0>", false, &mut transport);
            let token = transport.requests[0].token.clone();
            registrar.on_response(server(), &token, ResultCode::SuccessCreated, Some("rd/3"), 0);

            registrar.tick(1_000, "</3/0>,</1000/0>", true, &mut transport);
            assert_eq!(transport.requests.len(), 2);
            assert_eq!(transport.requests[1].payload, b"</3/0>,</1000/0>");
        }

        #[test]
        fn rejected_update_falls_back_to_register() {
            let mut registrar = registrar();
            let mut transport = RecordingTransport::new();

            registrar.tick(0, "", false, &mut transport);
            let token = transport.requests[0].token.clone();
            registrar.on_response(server(), &token, ResultCode::SuccessCreated, Some("rd/3"), 0);

            registrar.tick(31_000, "", false, &mut transport);
            let update_token = transport.requests[1].token.clone();
            registrar.on_response(server(), &update_token, ResultCode::NotFound, None, 31_000);

            registrar.tick(32_000, "", false, &mut transport);
            assert_eq!(transport.requests[2].path, "/rd");
        }

        #[test]
        fn deregister_sends_delete_to_the_location() {
            let mut registrar = registrar();
            let mut transport = RecordingTransport::new();

            registrar.tick(0, "", false, &mut transport);
            let token = transport.requests[0].token.clone();
            registrar.on_response(server(), &token, ResultCode::SuccessCreated, Some("rd/3"), 0);

            registrar.deregister_all(&mut transport);
            let delete = transport.requests.last().unwrap();
            assert_eq!(delete.method, CoapMethod::Delete);
            assert_eq!(delete.path, "/rd/3");
        }
    }
}
