//! The seam between the engine and a CoAP stack.
//!
//! The RFC 7252 wire codec, retransmission and DTLS live outside this crate;
//! the engine only sees decoded requests and produces decoded responses.
//! Outbound traffic the engine originates (observation notifications,
//! bootstrap provisioning writes, registration messages) goes through the
//! [`Transport`] trait so daemons can back it with a real socket and tests
//! with a recording loopback.

pub mod wire;

use std::net::SocketAddr;

use rand::RngCore;

use crate::codec::ContentType;
use crate::types::ResultCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoapMethod {
    Get,
    Post,
    Put,
    Delete,
}

/// The CoAP Observe option on a GET: `0` registers, `1` cancels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveFlag {
    Register,
    Deregister,
}

/// A decoded inbound request.
#[derive(Debug, Clone)]
pub struct CoapRequest {
    pub source: SocketAddr,
    pub method: CoapMethod,
    /// Uri-Path joined with `/`, leading slash included; `""` for none.
    pub path: String,
    /// Uri-Query joined with `&`, without the leading `?`.
    pub query: String,
    pub token: Vec<u8>,
    pub observe: Option<ObserveFlag>,
    pub accept: Option<ContentType>,
    pub content_type: Option<ContentType>,
    pub payload: Vec<u8>,
}

impl CoapRequest {
    pub fn new(source: SocketAddr, method: CoapMethod, path: impl Into<String>) -> Self {
        Self {
            source,
            method,
            path: path.into(),
            query: String::new(),
            token: vec![],
            observe: None,
            accept: None,
            content_type: None,
            payload: vec![],
        }
    }
}

/// A decoded response, ready for the CoAP layer to frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapResponse {
    pub code: ResultCode,
    pub content_type: Option<ContentType>,
    pub payload: Vec<u8>,
    /// Location-Path for successful creates (`/rd/1`, `/3/0`).
    pub location: Option<String>,
    /// Observe sequence number on an observation-establishing response.
    pub observe: Option<u32>,
}

impl CoapResponse {
    pub fn code(code: ResultCode) -> Self {
        Self {
            code,
            content_type: None,
            payload: vec![],
            location: None,
            observe: None,
        }
    }

    pub fn with_payload(code: ResultCode, content_type: ContentType, payload: Vec<u8>) -> Self {
        Self {
            code,
            content_type: Some(content_type),
            payload,
            location: None,
            observe: None,
        }
    }
}

/// A request the engine asks the CoAP layer to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub destination: SocketAddr,
    pub method: CoapMethod,
    pub path: String,
    pub query: String,
    pub token: Vec<u8>,
    pub content_type: Option<ContentType>,
    pub payload: Vec<u8>,
}

/// A response to an [`OutboundRequest`], correlated by token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundResponse {
    pub source: SocketAddr,
    pub token: Vec<u8>,
    pub code: ResultCode,
    pub content_type: Option<ContentType>,
    pub payload: Vec<u8>,
    /// Location-Path from a create response (`rd/<location>`).
    pub location: Option<String>,
}

/// Outbound side of the CoAP abstraction.
pub trait Transport {
    /// Emit a NON-confirmable notification for an observation.
    #[allow(clippy::too_many_arguments)]
    fn send_notify(
        &mut self,
        to: SocketAddr,
        path: &crate::types::Path,
        token: &[u8],
        sequence: u32,
        content_type: ContentType,
        payload: &[u8],
    );

    /// Send a request originated by the runtime.
    fn send_request(&mut self, request: OutboundRequest);
}

/// A [`Transport`] that records everything it is given. Serves as the
/// loopback implementation, as the daemons' outbound queue, and as the
/// observation point in tests.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub notifies: Vec<RecordedNotify>,
    pub requests: Vec<OutboundRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedNotify {
    pub to: SocketAddr,
    pub path: crate::types::Path,
    pub token: Vec<u8>,
    pub sequence: u32,
    pub content_type: ContentType,
    pub payload: Vec<u8>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for RecordingTransport {
    fn send_notify(
        &mut self,
        to: SocketAddr,
        path: &crate::types::Path,
        token: &[u8],
        sequence: u32,
        content_type: ContentType,
        payload: &[u8],
    ) {
        self.notifies.push(RecordedNotify {
            to,
            path: *path,
            token: token.to_vec(),
            sequence,
            content_type,
            payload: payload.to_vec(),
        });
    }

    fn send_request(&mut self, request: OutboundRequest) {
        self.requests.push(request);
    }
}

/// A fresh 8-byte token for a runtime-originated request.
pub fn new_token() -> Vec<u8> {
    let mut token = vec![0u8; 8];
    rand::thread_rng().fill_bytes(&mut token);
    token
}

/// Split a Uri-Query into `(key, value)` pairs; a key without `=` maps to an
/// empty value. Empty segments are dropped.
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .trim_start_matches('?')
        .split(['&', '?'])
        .filter(|segment| !segment.is_empty())
        .map(|segment| match segment.split_once('=') {
            Some((key, value)) => (key.to_owned(), value.to_owned()),
            None => (segment.to_owned(), String::new()),
        })
        .collect()
}
