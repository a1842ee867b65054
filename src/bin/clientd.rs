//! The LWM2M client daemon: object store, device-management endpoint,
//! bootstrap machine, registrar and the IPC surface for the local API.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;

use lwm2m_core::bootstrap::BootstrapInfo;
use lwm2m_core::codec::ContentType;
use lwm2m_core::daemon::{self, Daemon, SocketConfig};
use lwm2m_core::engine::{Engine, EngineConfig, Role};
use lwm2m_core::objects;

const MAX_ENDPOINT_NAME_LENGTH: usize = 128;

#[derive(Debug, Parser)]
#[command(name = "lwm2m_clientd", version, about = "LWM2M client daemon")]
struct Args {
    /// Address to bind on.
    #[arg(long, default_value = "0.0.0.0")]
    ip: IpAddr,

    /// Network interface to bind to.
    #[arg(long)]
    interface: Option<String>,

    /// 4 or 6.
    #[arg(long = "addressFamily", default_value_t = 4)]
    address_family: u8,

    /// CoAP port.
    #[arg(long, default_value_t = 5683)]
    port: u16,

    /// IPC port.
    #[arg(long = "ipcPort", default_value_t = 12345)]
    ipc_port: u16,

    /// Default response content format (CoAP content-format number).
    #[arg(long = "contentType")]
    content_type: Option<u16>,

    /// Enable DTLS.
    #[arg(long)]
    secure: bool,

    /// Bootstrap/server configuration files, applied at startup.
    #[arg(long = "objDefs")]
    obj_defs: Vec<PathBuf>,

    /// Factory bootstrap configuration file.
    #[arg(long = "factoryBootstrap")]
    factory_bootstrap: Option<PathBuf>,

    /// Bootstrap server URI (e.g. coap://192.0.2.11:15683).
    #[arg(long)]
    bootstrap: Option<String>,

    /// Endpoint name advertised at registration.
    #[arg(long = "endPointName", default_value = "lwm2m-client")]
    endpoint_name: String,

    #[arg(long)]
    daemonize: bool,

    #[arg(long)]
    verbose: bool,

    #[arg(long = "logFile")]
    log_file: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    daemon::init_tracing(args.verbose, args.log_file.as_deref())?;

    if args.secure {
        bail!("DTLS is not compiled into this build; front the daemon with a DTLS terminator");
    }
    if args.endpoint_name.len() > MAX_ENDPOINT_NAME_LENGTH {
        bail!("--endPointName exceeds {MAX_ENDPOINT_NAME_LENGTH} bytes");
    }
    if args.obj_defs.len() > daemon::MAX_CONFIG_FILES {
        bail!("at most {} --objDefs files are accepted", daemon::MAX_CONFIG_FILES);
    }

    let bootstrap_server = match &args.bootstrap {
        Some(uri) => Some(
            objects::parse_server_uri(uri)
                .with_context(|| format!("--bootstrap {uri} is not a coap:// address"))?,
        ),
        None => None,
    };
    let default_content_type = match args.content_type {
        Some(code) => Some(
            ContentType::try_from(code)
                .map_err(|err| anyhow::anyhow!("--contentType: {err}"))?,
        ),
        None => None,
    };

    let mut engine = Engine::new(EngineConfig {
        role: Role::Client,
        endpoint_name: args.endpoint_name.clone(),
        default_content_type,
        bootstrap_server,
    });

    for path in args.obj_defs.iter().chain(args.factory_bootstrap.iter()) {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let info = BootstrapInfo::parse(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        engine
            .apply_bootstrap_config(&info)
            .map_err(|code| anyhow::anyhow!("applying {}: {code}", path.display()))?;
        info!(path = %path.display(), "bootstrap configuration applied");
    }

    if args.daemonize {
        daemon::daemonize()?;
    }

    let (coap, ipc) = daemon::bind_sockets(&SocketConfig {
        ip: args.ip,
        address_family: args.address_family,
        port: args.port,
        ipc_port: args.ipc_port,
        interface: args.interface.clone(),
    })?;
    info!(
        endpoint_name = %args.endpoint_name,
        coap_port = args.port,
        ipc_port = args.ipc_port,
        "client daemon starting"
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building the runtime")?;
    runtime.block_on(async move {
        let coap = tokio::net::UdpSocket::from_std(coap)?;
        let ipc = tokio::net::UdpSocket::from_std(ipc)?;
        Daemon::new(engine).run(coap, ipc).await
    })
}
