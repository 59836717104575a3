//! Keystone - controller and node entry points

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use keystone::directory::InMemoryDirectory;
use keystone::enrollment::{
    enrollment_router, BootstrapToken, EnrollmentService, EnrollmentServiceConfig,
    SignaturePolicy, TokenSlot,
};
use keystone::node::{
    load_server_tls, require_controller_url, EnrollmentClient, EnrollmentClientConfig,
    IdentitySource, StaticIdentity, SystemIdentity,
};
use keystone::pki::{CaPaths, RootCaCell};
use keystone::{controller, DEFAULT_CONTROLLER_PORT, DEFAULT_NODE_PORT};

/// Keystone - trust bootstrap for a fleet controller and its nodes
#[derive(Parser, Debug)]
#[command(name = "keystone", version, about, long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, env = "KEYSTONE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller
    ///
    /// Loads or creates the root CA and serves node enrollment over HTTPS.
    Controller(ControllerArgs),

    /// Run on a node
    ///
    /// Validates the node's TLS material and keeps the node enrolled with the
    /// controller through a periodic heartbeat.
    Node(NodeArgs),

    /// Print a freshly generated bootstrap token
    Token,
}

/// Controller mode arguments
#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Address for the enrollment HTTPS server
    #[arg(long, env = "KEYSTONE_LISTEN", default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_CONTROLLER_PORT)))]
    listen: SocketAddr,

    /// Directory holding the root CA (default: $HOME/.keystone/ca)
    #[arg(long, env = "KEYSTONE_CA_DIR")]
    ca_dir: Option<PathBuf>,

    /// Shared secret nodes present on first enrollment; unset disables token enrollment
    #[arg(long, env = "KEYSTONE_BOOTSTRAP_TOKEN", hide_env_values = true)]
    bootstrap_token: Option<String>,

    /// Only accept the fingerprint of the certificate last issued to a node
    #[arg(long, env = "KEYSTONE_PIN_SIGNATURES")]
    pin_signatures: bool,

    /// Address or name nodes use to reach the controller (default: listen IP, else primary IPv4)
    #[arg(long, env = "KEYSTONE_ADVERTISE_ADDRESS")]
    advertise_address: Option<String>,
}

/// Node mode arguments
#[derive(Parser, Debug)]
struct NodeArgs {
    /// Require mutual TLS material at startup
    #[arg(long, env = "KEYSTONE_ENABLE_TLS")]
    enable_tls: bool,

    /// CA certificate for verifying peers
    #[arg(long, env = "KEYSTONE_CA_FILE", default_value = "./certs/ca.crt")]
    ca_file: PathBuf,

    /// This node's certificate
    #[arg(long, env = "KEYSTONE_CERT_FILE", default_value = "./certs/client.crt")]
    cert_file: PathBuf,

    /// This node's private key
    #[arg(long, env = "KEYSTONE_KEY_FILE", default_value = "./certs/client.key")]
    key_file: PathBuf,

    /// Enroll with the controller and keep sending heartbeats
    #[arg(long, env = "KEYSTONE_ENABLE_REGISTER")]
    enable_register: bool,

    /// Controller base URL, e.g. https://controller:5920
    #[arg(long, env = "KEYSTONE_CONTROLLER_URL")]
    controller_url: Option<String>,

    /// Bootstrap token for first enrollment
    #[arg(long, env = "KEYSTONE_REGISTER_TOKEN", hide_env_values = true)]
    register_token: Option<String>,

    /// Address of this node's RPC service; its port is reported to the controller
    #[arg(long, env = "KEYSTONE_NODE_LISTEN", default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_NODE_PORT)))]
    listen: SocketAddr,

    /// Where the issued bundle is stored
    #[arg(long, env = "KEYSTONE_CERT_DIR", default_value = "./certs")]
    cert_dir: PathBuf,

    /// Seconds between heartbeat enrollments
    #[arg(long, env = "KEYSTONE_HEARTBEAT_INTERVAL_SECS", default_value_t = 30)]
    heartbeat_interval_secs: u64,

    /// Controller CA certificate to trust before a bundle exists
    #[arg(long, env = "KEYSTONE_CONTROLLER_CA_FILE")]
    controller_ca_file: Option<PathBuf>,

    /// Accept an unverified controller certificate when no CA is known
    #[arg(long, env = "KEYSTONE_INSECURE_FIRST_CONTACT")]
    insecure_first_contact: bool,

    /// IPv4 address to enroll under instead of the first interface address
    #[arg(long, env = "KEYSTONE_ADVERTISE_ADDRESS")]
    advertise_address: Option<Ipv4Addr>,

    /// Display name for this node (default: hostname)
    #[arg(long, env = "KEYSTONE_ALIAS")]
    alias: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider before any TLS config is built
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}. \
             Keystone cannot operate without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .map_err(|e| anyhow::anyhow!("Invalid log level {:?}: {}", cli.log_level, e))?;
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Controller(args) => run_controller(args).await,
        Commands::Node(args) => run_node(args).await,
        Commands::Token => {
            let token = BootstrapToken::generate()?;
            println!("{}", token.as_str());
            Ok(())
        }
    }
}

/// Run the controller: root CA plus the enrollment HTTPS server
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let paths = args.ca_dir.map(CaPaths::new).unwrap_or_default();
    let ca_cell = RootCaCell::new(paths);
    let ca = ca_cell
        .get()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load or create root CA: {}", e))?;

    let tokens = Arc::new(TokenSlot::new(args.bootstrap_token.as_deref()));
    if !tokens.is_enabled() {
        warn!("No bootstrap token configured, token enrollment is disabled");
    }

    let signature_policy = if args.pin_signatures {
        SignaturePolicy::PinnedFingerprint
    } else {
        SignaturePolicy::AcceptAny
    };
    let service = Arc::new(EnrollmentService::new(
        ca.clone(),
        Arc::new(InMemoryDirectory::new()),
        tokens,
        EnrollmentServiceConfig {
            signature_policy,
            ..Default::default()
        },
    ));

    // The controller serves enrollment with a leaf from its own CA
    let identity = controller::server_identity(
        ca.clone(),
        args.listen,
        args.advertise_address.as_deref(),
        &SystemIdentity,
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to issue controller server certificate: {}", e))?;

    let tls_config = RustlsConfig::from_pem(
        identity.cert_pem().as_bytes().to_vec(),
        identity.key_pem().as_bytes().to_vec(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("TLS config error: {}", e))?;

    let handle = axum_server::Handle::new();
    let shutdown = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            shutdown.graceful_shutdown(Some(Duration::from_secs(5)));
        }
    });

    info!(addr = %args.listen, policy = ?signature_policy, "Starting enrollment server");
    axum_server::bind_rustls(args.listen, tls_config)
        .handle(handle)
        .serve(enrollment_router(service).into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}

/// Run on a node: TLS validation plus the enrollment heartbeat
async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    if args.enable_tls {
        load_server_tls(&args.ca_file, &args.cert_file, &args.key_file)
            .map_err(|e| anyhow::anyhow!("TLS is enabled but its material is unusable: {}", e))?;
        info!(cert = %args.cert_file.display(), "Server mTLS configuration loaded");
    }

    if !args.enable_register {
        info!("Registration disabled, nothing to run");
        return Ok(());
    }

    let controller_url = require_controller_url(args.controller_url.as_deref())?;

    let identity: Arc<dyn IdentitySource> = match args.advertise_address {
        Some(address) => Arc::new(StaticIdentity {
            hostname: SystemIdentity.hostname()?,
            address,
        }),
        None => Arc::new(SystemIdentity),
    };

    let config = EnrollmentClientConfig {
        controller_url,
        register_token: args.register_token,
        bundle_dir: args.cert_dir,
        port: args.listen.port(),
        alias: args.alias,
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval_secs),
        controller_ca_file: args.controller_ca_file,
        insecure_first_contact: args.insecure_first_contact,
        ..Default::default()
    };
    let client = Arc::new(EnrollmentClient::new(config, identity)?);

    let cancel = CancellationToken::new();
    let heartbeat = client.spawn_heartbeat(cancel.clone());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    cancel.cancel();
    heartbeat.await?;

    Ok(())
}
