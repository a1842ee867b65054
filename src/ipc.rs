//! The IPC surface: XML-framed requests from a co-located API library.
//!
//! The daemon listens on a UDP socket; every datagram is one `<Request>`
//! document and produces one `<Response>`. XML lives only in [`xml`]; the
//! rest of the module works on the [`IpcRequest`]/[`IpcResponse`] data model
//! and runs the operations against the engine with `Client` origin (or, in
//! the server role, proxies them to a registered client over CoAP).

pub mod xml;

use std::net::SocketAddr;

use tracing::{debug, warn};

use crate::coap::{CoapMethod, OutboundRequest, OutboundResponse};
use crate::codec::{plain, ContentType};
use crate::definition::{ObjectDefinition, ResourceDefinition};
use crate::engine::Engine;
use crate::tree;
use crate::types::{Path, PathDepth, RequestOrigin, ResultCode};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IpcError {
    #[error("request is not well-formed XML: {0}")]
    Xml(String),
    #[error("request has no Type attribute")]
    MissingType,
    #[error("unknown request type {0:?}")]
    UnknownType(String),
    #[error("{0}")]
    Malformed(String),
}

/// One `(path, value)` row extracted from a request's `<Objects>` tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRow {
    pub path: Path,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IpcRequestKind {
    Connect,
    Disconnect,
    DefineObject {
        object: ObjectDefinitionSpec,
    },
    Get {
        targets: Vec<TargetRow>,
    },
    Set {
        targets: Vec<TargetRow>,
    },
    Create {
        targets: Vec<TargetRow>,
    },
    Delete {
        targets: Vec<TargetRow>,
    },
    Execute {
        target: Path,
        arguments: Vec<u8>,
    },
    Subscribe {
        targets: Vec<TargetRow>,
    },
    CancelSubscribe {
        targets: Vec<TargetRow>,
    },
    ListClients,
}

/// A definition block from a DefineObject request, kept plain so the XML
/// layer does not depend on handler types.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDefinitionSpec {
    pub id: u16,
    pub name: String,
    pub min_instances: u16,
    pub max_instances: u16,
    pub resources: Vec<ResourceDefinitionSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDefinitionSpec {
    pub id: u16,
    pub name: String,
    pub kind: crate::value::ResourceKind,
    pub operations: crate::types::Operations,
    pub min_instances: u16,
    pub max_instances: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IpcRequest {
    pub kind: IpcRequestKind,
    pub session: Option<u32>,
    /// Server role: the registered client this request is aimed at.
    pub client: Option<String>,
    pub request_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IpcResponse {
    pub request_type: String,
    pub session: Option<u32>,
    pub results: Vec<(Path, ResultCode)>,
    /// Values read back for a Get: `(path, text)` rows.
    pub values: Vec<(Path, String)>,
    pub clients: Vec<ClientRecord>,
}

impl IpcResponse {
    fn new(request_type: &str, session: Option<u32>) -> Self {
        Self {
            request_type: request_type.to_owned(),
            session,
            results: vec![],
            values: vec![],
            clients: vec![],
        }
    }

    fn with_result(mut self, path: Path, code: ResultCode) -> Self {
        self.results.push((path, code));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub endpoint_name: String,
    pub location: u32,
    pub objects: Vec<String>,
}

/// What handling a request produced: an immediate reply, or a CoAP exchange
/// whose completion will produce the reply.
#[derive(Debug)]
pub enum IpcOutcome {
    Reply(IpcResponse),
    Proxy {
        request: OutboundRequest,
        pending: PendingProxy,
    },
}

/// An in-flight proxied operation, correlated by CoAP token.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingProxy {
    pub token: Vec<u8>,
    pub reply_to: SocketAddr,
    pub session: Option<u32>,
    pub request_type: String,
    pub path: Path,
}

#[derive(Debug, Default)]
pub struct IpcServer {
    sessions: Vec<(u32, SocketAddr)>,
    next_session: u32,
}

impl IpcServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_address(&self, session: u32) -> Option<SocketAddr> {
        self.sessions
            .iter()
            .find(|(id, _)| *id == session)
            .map(|(_, address)| *address)
    }

    /// The session an address belongs to, for routing notifications.
    pub fn session_for(&self, address: SocketAddr) -> Option<u32> {
        self.sessions
            .iter()
            .find(|(_, existing)| *existing == address)
            .map(|(id, _)| *id)
    }

    fn session_valid(&self, session: Option<u32>) -> bool {
        session.is_some_and(|session| self.sessions.iter().any(|(id, _)| *id == session))
    }

    /// Handle one decoded request from `source`.
    pub fn handle(
        &mut self,
        engine: &mut Engine,
        source: SocketAddr,
        request: IpcRequest,
        now_ms: u64,
    ) -> IpcOutcome {
        let type_name = request.request_type.clone();

        if let IpcRequestKind::Connect = request.kind {
            self.next_session += 1;
            let session = self.next_session;
            self.sessions.push((session, source));
            debug!(session, %source, "IPC session opened");
            return IpcOutcome::Reply(
                IpcResponse::new(&type_name, Some(session))
                    .with_result(Path::root(), ResultCode::Success),
            );
        }

        if !self.session_valid(request.session) {
            warn!(session = ?request.session, "request on unknown IPC session");
            return IpcOutcome::Reply(
                IpcResponse::new(&type_name, request.session)
                    .with_result(Path::root(), ResultCode::Unauthorized),
            );
        }
        let session = request.session.unwrap();

        // Server role addressing a registered client: proxy over CoAP.
        if let Some(client_name) = &request.client {
            return self.proxy(engine, source, session, &type_name, client_name, &request.kind);
        }

        let mut response = IpcResponse::new(&type_name, Some(session));
        match request.kind {
            IpcRequestKind::Connect => unreachable!("handled above"),
            IpcRequestKind::Disconnect => {
                self.sessions.retain(|(id, _)| *id != session);
                engine.registrations_mut().unsubscribe(session);
                debug!(session, "IPC session closed");
                response.results.push((Path::root(), ResultCode::Success));
            }
            IpcRequestKind::DefineObject { object } => {
                let code = define_object(engine, object);
                response.results.push((Path::root(), code));
            }
            IpcRequestKind::Get { targets } => {
                for row in targets {
                    match engine.read_tree(RequestOrigin::Client, &row.path) {
                        Ok(node) => {
                            let code = flatten_values(engine, &row.path, &node, &mut response.values);
                            response.results.push((row.path, code));
                        }
                        Err(code) => response.results.push((row.path, code)),
                    }
                }
            }
            IpcRequestKind::Set { targets } => {
                let mut paths: Vec<Path> = targets.iter().map(|row| row.path).collect();
                tree::remove_covered_paths(&mut paths);
                for row in targets {
                    if !paths.contains(&row.path) {
                        continue;
                    }
                    let code = set_value(engine, &row);
                    response.results.push((row.path, code));
                }
            }
            IpcRequestKind::Create { targets } => {
                for row in targets {
                    let code = create_target(engine, &row.path);
                    response.results.push((row.path, code));
                }
            }
            IpcRequestKind::Delete { targets } => {
                for row in targets {
                    let code = engine.delete(RequestOrigin::Client, &row.path, false);
                    response.results.push((row.path, code));
                }
            }
            IpcRequestKind::Execute { target, arguments } => {
                let code = engine.execute(&target, &arguments);
                response.results.push((target, code));
            }
            IpcRequestKind::Subscribe { targets } => {
                for row in targets {
                    let code = match engine.observe_path(
                        source,
                        session.to_be_bytes().to_vec(),
                        row.path,
                        now_ms,
                    ) {
                        Ok(()) => ResultCode::Success,
                        Err(code) => code,
                    };
                    response.results.push((row.path, code));
                }
            }
            IpcRequestKind::CancelSubscribe { targets } => {
                for row in targets {
                    let code = if engine.cancel_observe_path(source, &row.path) {
                        ResultCode::Success
                    } else {
                        ResultCode::NotFound
                    };
                    response.results.push((row.path, code));
                }
            }
            IpcRequestKind::ListClients => {
                for client in engine.registrations().clients() {
                    response.clients.push(ClientRecord {
                        endpoint_name: client.endpoint_name.clone(),
                        location: client.location,
                        objects: client
                            .objects
                            .iter()
                            .map(|entry| match entry.instance {
                                Some(instance) => format!("/{}/{instance}", entry.object),
                                None => format!("/{}", entry.object),
                            })
                            .collect(),
                    });
                }
                response.results.push((Path::root(), ResultCode::Success));
            }
        }
        IpcOutcome::Reply(response)
    }

    /// Build the CoAP request for a server-role operation on a registered
    /// client.
    fn proxy(
        &mut self,
        engine: &mut Engine,
        reply_to: SocketAddr,
        session: u32,
        type_name: &str,
        client_name: &str,
        kind: &IpcRequestKind,
    ) -> IpcOutcome {
        let Some(client) = engine.registrations().lookup_by_name(client_name) else {
            return IpcOutcome::Reply(
                IpcResponse::new(type_name, Some(session))
                    .with_result(Path::root(), ResultCode::NotFound),
            );
        };
        let destination = client.address;

        // `(method, request path, result path, content type, payload)`;
        // CREATE posts to the object but reports against the full target.
        let (method, path, result_path, content_type, payload) = match kind {
            IpcRequestKind::Get { targets } if targets.len() == 1 => {
                let target = targets[0].path;
                (CoapMethod::Get, target, target, None, vec![])
            }
            IpcRequestKind::Set { targets } if targets.len() == 1 => {
                let target = targets[0].path;
                let Some(text) = targets[0].value.clone() else {
                    return IpcOutcome::Reply(
                        IpcResponse::new(type_name, Some(session))
                            .with_result(target, ResultCode::BadRequest),
                    );
                };
                (
                    CoapMethod::Put,
                    target,
                    target,
                    Some(ContentType::PlainText),
                    text.into_bytes(),
                )
            }
            IpcRequestKind::Delete { targets } if targets.len() == 1 => {
                let target = targets[0].path;
                (CoapMethod::Delete, target, target, None, vec![])
            }
            IpcRequestKind::Create { targets } if targets.len() == 1 => {
                let target = targets[0].path;
                let Some(object) = target.object else {
                    return IpcOutcome::Reply(
                        IpcResponse::new(type_name, Some(session))
                            .with_result(target, ResultCode::BadRequest),
                    );
                };
                // A named instance rides in the payload as an empty
                // instance entry.
                let payload = match target.instance {
                    Some(instance) => {
                        let node = crate::tree::TreeNode::object_instance(Some(instance))
                            .wrap_in_object(object);
                        match crate::codec::tlv::encode(
                            engine.definitions(),
                            &node,
                            &Path::object(object),
                        ) {
                            Ok(payload) => payload,
                            Err(_) => {
                                return IpcOutcome::Reply(
                                    IpcResponse::new(type_name, Some(session))
                                        .with_result(target, ResultCode::InternalError),
                                )
                            }
                        }
                    }
                    None => vec![],
                };
                (
                    CoapMethod::Post,
                    Path::object(object),
                    target,
                    Some(ContentType::OmaTlv),
                    payload,
                )
            }
            IpcRequestKind::Execute { target, arguments } => {
                (CoapMethod::Post, *target, *target, None, arguments.clone())
            }
            _ => {
                return IpcOutcome::Reply(
                    IpcResponse::new(type_name, Some(session))
                        .with_result(Path::root(), ResultCode::BadRequest),
                )
            }
        };

        let token = crate::coap::new_token();
        IpcOutcome::Proxy {
            request: OutboundRequest {
                destination,
                method,
                path: path.to_string(),
                query: String::new(),
                token: token.clone(),
                content_type,
                payload,
            },
            pending: PendingProxy {
                token,
                reply_to,
                session: Some(session),
                request_type: type_name.to_owned(),
                path: result_path,
            },
        }
    }
}

/// Turn a completed proxied exchange into its IPC reply.
pub fn complete_proxy(pending: &PendingProxy, response: &OutboundResponse) -> IpcResponse {
    let mut reply = IpcResponse::new(&pending.request_type, pending.session);
    reply.results.push((pending.path, response.code));
    if response.code == ResultCode::SuccessContent && !response.payload.is_empty() {
        if let Ok(text) = String::from_utf8(response.payload.clone()) {
            reply.values.push((pending.path, text));
        }
    }
    reply
}

fn define_object(engine: &mut Engine, spec: ObjectDefinitionSpec) -> ResultCode {
    let definition = ObjectDefinition::new(spec.id, spec.name)
        .instances(spec.min_instances, spec.max_instances);
    if engine.define_object(definition).is_err() {
        return ResultCode::BadRequest;
    }
    for resource in spec.resources {
        let definition = ResourceDefinition::new(spec.id, resource.id, resource.name, resource.kind)
            .instances(resource.min_instances, resource.max_instances)
            .operations(resource.operations);
        if engine.define_resource(definition).is_err() {
            return ResultCode::BadRequest;
        }
    }
    ResultCode::Success
}

/// Collect `(path, text)` rows from a read tree.
fn flatten_values(
    engine: &Engine,
    target: &Path,
    node: &crate::tree::TreeNode,
    values: &mut Vec<(Path, String)>,
) -> ResultCode {
    use crate::tree::NodeKind;

    match node.kind() {
        NodeKind::Object => {
            for instance in node.children() {
                let path = Path::instance(target.object.unwrap(), instance.id().unwrap_or(0));
                let code = flatten_values(engine, &path, instance, values);
                if code != ResultCode::Success {
                    return code;
                }
            }
        }
        NodeKind::ObjectInstance => {
            for resource in node.children() {
                let path = Path::resource(
                    target.object.unwrap(),
                    node.id().or(target.instance).unwrap_or(0),
                    resource.id().unwrap_or(0),
                );
                let code = flatten_values(engine, &path, resource, values);
                if code != ResultCode::Success {
                    return code;
                }
            }
        }
        NodeKind::Resource => {
            let resource_id = node.id().unwrap_or(0);
            let Some(definition) = engine
                .definitions()
                .lookup_resource(target.object.unwrap_or(0), resource_id)
            else {
                return ResultCode::NotFound;
            };
            for instance in node.children() {
                let path = Path::resource_instance(
                    target.object.unwrap_or(0),
                    target.instance.unwrap_or(0),
                    resource_id,
                    instance.id().unwrap_or(0),
                );
                match plain::format_value(definition.kind, instance.value().unwrap_or_default()) {
                    Ok(text) => values.push((path, text)),
                    Err(_) => return ResultCode::InternalError,
                }
            }
        }
        NodeKind::ResourceInstance => return ResultCode::InternalError,
    }
    ResultCode::Success
}

fn set_value(engine: &mut Engine, row: &TargetRow) -> ResultCode {
    let (Some(object), Some(instance), Some(resource)) =
        (row.path.object, row.path.instance, row.path.resource)
    else {
        return ResultCode::BadRequest;
    };
    let Some(text) = &row.value else {
        return ResultCode::BadRequest;
    };
    let Some(definition) = engine.definitions().lookup_resource(object, resource) else {
        return ResultCode::NotFound;
    };
    let Ok(bytes) = plain::parse_text(definition.kind, text) else {
        return ResultCode::BadRequest;
    };
    let index = row.path.resource_instance.unwrap_or(0);
    match engine.write_resource_instance(object, instance, resource, index, bytes) {
        Ok(()) => ResultCode::SuccessChanged,
        Err(code) => code,
    }
}

fn create_target(engine: &mut Engine, path: &Path) -> ResultCode {
    match path.depth() {
        PathDepth::Object => match engine.create_object_instance(path.object.unwrap(), None) {
            Ok(_) => ResultCode::SuccessCreated,
            Err(code) => code,
        },
        PathDepth::ObjectInstance => {
            match engine.create_object_instance(path.object.unwrap(), path.instance) {
                Ok(_) => ResultCode::SuccessCreated,
                Err(code) => code,
            }
        }
        PathDepth::Resource => {
            match engine.create_optional_resource(
                path.object.unwrap(),
                path.instance.unwrap(),
                path.resource.unwrap(),
            ) {
                Ok(()) => ResultCode::SuccessCreated,
                Err(code) => code,
            }
        }
        _ => ResultCode::BadRequest,
    }
}

/// Render a change notification for an IPC subscriber.
pub fn notification_xml(session: u32, path: &Path, value_text: &str) -> Vec<u8> {
    xml::write_notification(session, path, value_text)
}
