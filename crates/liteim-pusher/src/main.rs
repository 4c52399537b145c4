//! LiteIM Pusher - push RPC node with registry-based discovery

use anyhow::Context;
use clap::{Parser, Subcommand};
use liteim_pusher::identity::SystemInterfaces;
use liteim_pusher::observability::{self, TracingConfig};
use liteim_pusher::registry::{EtcdRegistry, InMemoryRegistry, Registry};
use liteim_pusher::{version, Pusher, PusherConfig, RegistryBackend};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How often the in-memory registry expires overdue leases
const MEMORY_REAPER_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "liteim-pusher")]
#[command(about = "LiteIM pusher node", version = version::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pusher node until SIGINT or SIGTERM
    Run(RunArgs),
    /// Print build information
    Version,
}

#[derive(clap::Args)]
struct RunArgs {
    /// JSON config file (default: conf/conf.json when present)
    #[arg(long, env = "LITEIM_CONFIG")]
    config: Option<PathBuf>,

    /// RPC listen port, also the advertised port
    #[arg(long)]
    rpc_port: Option<u16>,

    /// etcd endpoints (comma-separated)
    #[arg(long, value_delimiter = ',')]
    etcd_endpoints: Option<Vec<String>>,

    /// Registry backend: etcd or memory
    #[arg(long)]
    registry: Option<RegistryBackend>,

    /// Advertise this address instead of the first interface address
    #[arg(long)]
    advertise_ip: Option<Ipv4Addr>,
}

impl RunArgs {
    /// Command-line flags take precedence over file and environment
    fn apply(self, config: &mut PusherConfig) {
        if let Some(port) = self.rpc_port {
            config.rpc_port = port;
        }
        if let Some(endpoints) = self.etcd_endpoints {
            config.etcd_endpoints = endpoints;
        }
        if let Some(backend) = self.registry {
            config.registry_backend = backend;
        }
        if let Some(ip) = self.advertise_ip {
            config.advertise_ip = Some(ip);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("{}", version::build_info());
            Ok(())
        }
        Commands::Run(args) => {
            observability::init_tracing(TracingConfig::from_env())
                .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;
            let result = run(args).await;
            observability::shutdown_tracing();
            result
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    info!(version = %version::full_version(), "Starting liteim-pusher");

    let mut config = PusherConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;
    info!(
        rpc_port = config.rpc_port,
        role = %config.push_service_name,
        watching = %config.gateway_service_name,
        backend = ?config.registry_backend,
        "Configuration loaded"
    );

    let metrics_state = match observability::init_metrics() {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(error = %e, "Metrics recorder unavailable, /metrics disabled");
            None
        }
    };

    let registry = build_registry(&config).await?;
    let pusher = Pusher::build(&config, registry, &SystemInterfaces, metrics_state)?;
    let report = pusher.run().await.context("pusher failed to start")?;

    if report.is_clean() {
        info!("Pusher stopped cleanly");
    } else {
        for failure in report.failures() {
            warn!(
                component = failure.component,
                error = failure.error.as_deref().unwrap_or_default(),
                "Component did not exit cleanly"
            );
        }
    }
    Ok(())
}

async fn build_registry(config: &PusherConfig) -> anyhow::Result<Arc<dyn Registry>> {
    match config.registry_backend {
        RegistryBackend::Etcd => {
            let registry = EtcdRegistry::connect(config)
                .await
                .context("failed to connect to etcd")?;
            Ok(Arc::new(registry))
        }
        RegistryBackend::Memory => {
            warn!("Using in-memory registry, membership is local to this process");
            let registry = InMemoryRegistry::new();
            registry.spawn_reaper(MEMORY_REAPER_INTERVAL);
            Ok(Arc::new(registry))
        }
    }
}
