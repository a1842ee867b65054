//! The daemons' shared event loop.
//!
//! One current-thread task multiplexes the CoAP socket, the IPC socket and
//! a 1 Hz ticker; handlers run to completion between socket reads, so the
//! engine needs no locking. Outbound traffic the engine queues on its
//! [`RecordingTransport`] is flushed to the sockets after every turn of the
//! loop.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Context;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::coap::wire::{
    Message, MessageType, OPTION_ACCEPT, OPTION_CONTENT_FORMAT, OPTION_OBSERVE,
};
use crate::coap::{CoapRequest, ObserveFlag, OutboundResponse, RecordingTransport, Transport};
use crate::codec::ContentType;
use crate::engine::Engine;
use crate::ipc::{self, IpcOutcome, IpcServer, PendingProxy};
use crate::types::ResultCode;

/// The loop's poll ceiling; ticker deadlines never wait longer than this.
const TICK_INTERVAL: Duration = Duration::from_millis(1000);

/// How many `--objDefs` files a daemon accepts.
pub const MAX_CONFIG_FILES: usize = 16;

/// Install the tracing subscriber per the daemon flags.
pub fn init_tracing(verbose: bool, log_file: Option<&std::path::Path>) -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

/// Detach from the controlling terminal. Must run before the async runtime
/// exists.
#[cfg(unix)]
pub fn daemonize() -> anyhow::Result<()> {
    unsafe {
        match libc::fork() {
            -1 => anyhow::bail!("fork failed: {}", std::io::Error::last_os_error()),
            0 => {}
            _ => std::process::exit(0),
        }
        if libc::setsid() == -1 {
            anyhow::bail!("setsid failed: {}", std::io::Error::last_os_error());
        }
        match libc::fork() {
            -1 => anyhow::bail!("fork failed: {}", std::io::Error::last_os_error()),
            0 => {}
            _ => std::process::exit(0),
        }
    }
    std::env::set_current_dir("/")?;
    Ok(())
}

#[cfg(not(unix))]
pub fn daemonize() -> anyhow::Result<()> {
    anyhow::bail!("--daemonize is only supported on unix targets")
}

/// Socket parameters shared by both daemons.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub ip: std::net::IpAddr,
    pub address_family: u8,
    pub port: u16,
    pub ipc_port: u16,
    pub interface: Option<String>,
}

/// Bind the CoAP and IPC sockets, nonblocking, ready for the runtime.
pub fn bind_sockets(
    config: &SocketConfig,
) -> anyhow::Result<(std::net::UdpSocket, std::net::UdpSocket)> {
    match config.address_family {
        4 if config.ip.is_ipv4() => {}
        6 if config.ip.is_ipv6() => {}
        4 | 6 => anyhow::bail!(
            "--ip {} does not match --addressFamily {}",
            config.ip,
            config.address_family
        ),
        other => anyhow::bail!("--addressFamily must be 4 or 6, not {other}"),
    }

    let coap = std::net::UdpSocket::bind((config.ip, config.port))
        .with_context(|| format!("binding CoAP socket on {}:{}", config.ip, config.port))?;
    let ipc = std::net::UdpSocket::bind((config.ip, config.ipc_port))
        .with_context(|| format!("binding IPC socket on {}:{}", config.ip, config.ipc_port))?;
    if let Some(interface) = &config.interface {
        bind_to_device(&coap, interface)?;
        bind_to_device(&ipc, interface)?;
    }
    coap.set_nonblocking(true)?;
    ipc.set_nonblocking(true)?;
    Ok((coap, ipc))
}

#[cfg(target_os = "linux")]
fn bind_to_device(socket: &std::net::UdpSocket, interface: &str) -> anyhow::Result<()> {
    use std::os::fd::AsRawFd;

    let result = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            interface.as_ptr().cast(),
            interface.len() as libc::socklen_t,
        )
    };
    if result != 0 {
        anyhow::bail!(
            "cannot bind to interface {interface}: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn bind_to_device(_socket: &std::net::UdpSocket, interface: &str) -> anyhow::Result<()> {
    anyhow::bail!("--interface {interface} is only supported on linux")
}

pub struct Daemon {
    engine: Engine,
    ipc: IpcServer,
    transport: RecordingTransport,
    pending_proxies: Vec<PendingProxy>,
    next_message_id: u16,
    started: Instant,
}

impl Daemon {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            ipc: IpcServer::new(),
            transport: RecordingTransport::new(),
            pending_proxies: vec![],
            next_message_id: rand::random(),
            started: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn next_message_id(&mut self) -> u16 {
        self.next_message_id = self.next_message_id.wrapping_add(1);
        self.next_message_id
    }

    /// Run until the process is interrupted.
    pub async fn run(mut self, coap: UdpSocket, ipc_socket: UdpSocket) -> anyhow::Result<()> {
        let mut coap_buf = vec![0u8; 65_536];
        let mut ipc_buf = vec![0u8; 65_536];
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        info!("daemon loop running");

        loop {
            tokio::select! {
                received = coap.recv_from(&mut coap_buf) => {
                    let (length, source) = received.context("CoAP socket read")?;
                    self.on_coap_datagram(&coap_buf[..length], source, &coap, &ipc_socket).await;
                }
                received = ipc_socket.recv_from(&mut ipc_buf) => {
                    let (length, source) = received.context("IPC socket read")?;
                    self.on_ipc_datagram(&ipc_buf[..length], source, &ipc_socket).await;
                }
                _ = ticker.tick() => {
                    let now = self.now_ms();
                    self.engine.tick(now, &mut self.transport);
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted, shutting down");
                    self.flush(&coap, &ipc_socket).await;
                    return Ok(());
                }
            }
            self.flush(&coap, &ipc_socket).await;
        }
    }

    async fn on_coap_datagram(
        &mut self,
        datagram: &[u8],
        source: SocketAddr,
        coap: &UdpSocket,
        ipc: &UdpSocket,
    ) {
        let message = match Message::decode(datagram) {
            Ok(message) => message,
            Err(err) => {
                warn!(%source, %err, "dropping undecodable datagram");
                return;
            }
        };

        if message.message_type == Some(MessageType::Reset) {
            // The peer rejected a notification; drop its observation.
            self.engine.cancel_observation_by_token(source, &message.token);
            return;
        }

        if message.is_request() {
            let request = CoapRequest {
                source,
                method: message.method().expect("is_request implies a method"),
                path: message.uri_path(),
                query: message.uri_query(),
                token: message.token.clone(),
                observe: message.uint_option(OPTION_OBSERVE).map(|value| {
                    if value == 0 {
                        ObserveFlag::Register
                    } else {
                        ObserveFlag::Deregister
                    }
                }),
                accept: message
                    .uint_option(OPTION_ACCEPT)
                    .and_then(|value| ContentType::try_from(value as u16).ok()),
                content_type: message
                    .uint_option(OPTION_CONTENT_FORMAT)
                    .and_then(|value| ContentType::try_from(value as u16).ok()),
                payload: message.payload.clone(),
            };
            debug!(%source, method = ?request.method, path = %request.path, "CoAP request");

            let response = self.engine.handle_request(&request, self.now_ms());
            let mut reply =
                Message::response(response.code.coap_code(), message.message_id, message.token);
            if let Some(observe) = response.observe {
                reply.set_uint_option(OPTION_OBSERVE, observe);
            }
            if let Some(location) = &response.location {
                reply.set_location_path(location);
            }
            if let Some(content_type) = response.content_type {
                reply.set_uint_option(OPTION_CONTENT_FORMAT, content_type.code() as u32);
            }
            reply.payload = response.payload;
            if let Err(err) = coap.send_to(&reply.encode(), source).await {
                warn!(%err, "failed to send CoAP response");
            }
        } else if message.is_response() {
            let response = OutboundResponse {
                source,
                token: message.token.clone(),
                code: result_code_for(message.code),
                content_type: message
                    .uint_option(OPTION_CONTENT_FORMAT)
                    .and_then(|value| ContentType::try_from(value as u16).ok()),
                payload: message.payload.clone(),
                location: message.location_path(),
            };

            if let Some(at) = self
                .pending_proxies
                .iter()
                .position(|pending| pending.token == message.token)
            {
                let pending = self.pending_proxies.remove(at);
                let reply = ipc::complete_proxy(&pending, &response);
                let bytes = ipc::xml::write_response(&reply);
                if let Err(err) = ipc.send_to(&bytes, pending.reply_to).await {
                    warn!(%err, "failed to deliver proxied IPC reply");
                }
            } else {
                let now = self.now_ms();
                self.engine.handle_response(&response, &mut self.transport, now);
            }
        }
    }

    async fn on_ipc_datagram(&mut self, datagram: &[u8], source: SocketAddr, ipc: &UdpSocket) {
        let reply_bytes = match ipc::xml::parse_request(datagram) {
            Ok(request) => {
                debug!(%source, request_type = %request.request_type, "IPC request");
                let now = self.now_ms();
                match self.ipc.handle(&mut self.engine, source, request, now) {
                    IpcOutcome::Reply(reply) => ipc::xml::write_response(&reply),
                    IpcOutcome::Proxy { request, pending } => {
                        self.transport.send_request(request);
                        self.pending_proxies.push(pending);
                        return;
                    }
                }
            }
            Err(err) => {
                warn!(%source, %err, "bad IPC request");
                ipc::xml::write_response(&ipc::IpcResponse {
                    request_type: "Error".to_owned(),
                    session: None,
                    results: vec![(crate::types::Path::root(), ResultCode::BadRequest)],
                    values: vec![],
                    clients: vec![],
                })
            }
        };
        if let Err(err) = ipc.send_to(&reply_bytes, source).await {
            warn!(%err, "failed to send IPC reply");
        }
    }

    /// Push everything the engine queued out to the sockets.
    async fn flush(&mut self, coap: &UdpSocket, ipc: &UdpSocket) {
        for notify in std::mem::take(&mut self.transport.notifies) {
            match self.ipc.session_for(notify.to) {
                Some(session) => {
                    // An IPC subscriber: wrap the value in a notification
                    // document instead of a CoAP message.
                    let text = match std::str::from_utf8(&notify.payload) {
                        Ok(text) => text.to_owned(),
                        Err(_) => BASE64_STANDARD.encode(&notify.payload),
                    };
                    let bytes = ipc::notification_xml(session, &notify.path, &text);
                    if let Err(err) = ipc.send_to(&bytes, notify.to).await {
                        warn!(%err, "failed to send IPC notification");
                    }
                }
                None => {
                    let mut message = Message {
                        message_type: Some(MessageType::NonConfirmable),
                        code: ResultCode::SuccessContent.coap_code(),
                        message_id: self.next_message_id(),
                        token: notify.token.clone(),
                        ..Default::default()
                    };
                    message.set_uint_option(OPTION_OBSERVE, notify.sequence);
                    message.set_uint_option(
                        OPTION_CONTENT_FORMAT,
                        notify.content_type.code() as u32,
                    );
                    message.payload = notify.payload.clone();
                    if let Err(err) = coap.send_to(&message.encode(), notify.to).await {
                        warn!(%err, "failed to send notification");
                    }
                }
            }
        }

        for request in std::mem::take(&mut self.transport.requests) {
            let message_id = self.next_message_id();
            let mut message = Message::request(request.method, message_id, request.token.clone());
            message.set_uri_path(&request.path);
            message.set_uri_query(&request.query);
            if let Some(content_type) = request.content_type {
                message.set_uint_option(OPTION_CONTENT_FORMAT, content_type.code() as u32);
            }
            message.payload = request.payload.clone();
            if let Err(err) = coap.send_to(&message.encode(), request.destination).await {
                warn!(%err, "failed to send CoAP message");
            }
        }
    }
}

/// Map a CoAP response code back into the result taxonomy.
fn result_code_for(code: u8) -> ResultCode {
    match code {
        0x40 => ResultCode::Success,
        0x41 => ResultCode::SuccessCreated,
        0x42 => ResultCode::SuccessDeleted,
        0x44 => ResultCode::SuccessChanged,
        0x45 => ResultCode::SuccessContent,
        0x80 => ResultCode::BadRequest,
        0x81 => ResultCode::Unauthorized,
        0x83 => ResultCode::Forbidden,
        0x84 => ResultCode::NotFound,
        0x85 => ResultCode::MethodNotAllowed,
        0x8D => ResultCode::PayloadTooLarge,
        0x8F => ResultCode::UnsupportedContentFormat,
        0x9D => ResultCode::TooManyRequests,
        other if other >> 5 == 2 => ResultCode::Success,
        other if other >> 5 == 4 => ResultCode::BadRequest,
        _ => ResultCode::InternalError,
    }
}
