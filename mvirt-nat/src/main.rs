//! mvirt-nat: NAT agent for mvirt hosts.
//!
//! This daemon runs on each host that owns an external address and:
//! - Pulls the vnat bindings assigned to it from the control plane
//! - Allocates vservers (external ports) for new bindings
//! - Programs DNAT/SNAT rules through iptables or IPVS
//! - Plumbs gateway interfaces toward backend subnets
//! - Reports its state back to the control plane

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mvirt_nat::audit::NatAuditLogger;
use mvirt_nat::clients::{ControlPlane, GrpcControlPlane};
use mvirt_nat::config::{load_user_rules, AgentConfig};
use mvirt_nat::exec::{CommandExecutor, RootExecutor};
use mvirt_nat::gateway::{driver, GatewayManager, InterfaceDriverKind};
use mvirt_nat::rules::{self, RuleBackend};
use mvirt_nat::NatAgent;

/// mvirt NAT Agent
#[derive(Parser, Debug)]
#[command(name = "mvirt-nat", version, about)]
struct Args {
    /// Control plane endpoint (e.g., http://[::1]:50058)
    #[arg(long, default_value = "http://[::1]:50058")]
    api_endpoint: String,

    /// Host name used for scheduling (defaults to hostname)
    #[arg(long)]
    host: Option<String>,

    /// Gateway interface driver
    #[arg(long, value_enum)]
    interface_driver: Option<InterfaceDriverKind>,

    /// OVS integration bridge
    #[arg(long, default_value = "br-int")]
    integration_bridge: String,

    /// Rule backend
    #[arg(long, value_enum, default_value = "iptables")]
    rule_backend: RuleBackend,

    /// External address vservers are allocated on
    #[arg(long, default_value = "127.0.0.1")]
    local_external_ip: Ipv4Addr,

    /// Gateway address for bindings without a port
    #[arg(long, default_value = "127.0.0.1")]
    local_internal_ip: Ipv4Addr,

    /// External ports are allocated above this one
    #[arg(long, default_value = "10000")]
    external_port_start: u16,

    /// Gratuitous ARPs sent after plumbing a gateway (0 disables)
    #[arg(long, default_value = "3")]
    send_arp_count: i32,

    /// Create console bindings for compute hosts
    #[arg(long)]
    console_enabled: bool,

    /// Console port on compute hosts
    #[arg(long, default_value = "6080")]
    console_port: u16,

    /// JSON file with raw rules staged on every full rebuild
    #[arg(long)]
    user_rules: Option<PathBuf>,

    /// Reconciliation interval in seconds
    #[arg(long, default_value = "3")]
    resync_interval: u64,

    /// State report interval in seconds (0 disables)
    #[arg(long, default_value = "30")]
    report_interval: u64,

    /// Control plane call timeout in seconds
    #[arg(long, default_value = "10")]
    rpc_timeout: u64,

    /// Privileged command timeout in seconds
    #[arg(long, default_value = "30")]
    command_timeout: u64,

    /// Prefix for privileged commands (empty runs them directly)
    #[arg(long, default_value = "sudo")]
    root_helper: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mvirt_nat=info,tonic=warn,tower=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let Some(interface_driver) = args.interface_driver else {
        error!("An interface driver must be configured (--interface-driver ovs|linuxbridge)");
        std::process::exit(1);
    };

    let host = args.host.unwrap_or_else(|| {
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string())
    });

    let user_rules = match &args.user_rules {
        Some(path) => match load_user_rules(path, args.rule_backend) {
            Ok(rules) => rules,
            Err(e) => {
                error!(error = %e, "Invalid user rules");
                std::process::exit(1);
            }
        },
        None => Vec::new(),
    };

    info!("Starting mvirt-nat agent: {}", host);
    info!("Control plane endpoint: {}", args.api_endpoint);

    let mut config = AgentConfig::new(&host, interface_driver, args.rule_backend);
    config.local_external_ip = args.local_external_ip;
    config.local_internal_ip = args.local_internal_ip;
    config.external_port_start = args.external_port_start;
    config.console_enabled = args.console_enabled;
    config.console_port = args.console_port;
    config.user_rules = user_rules;
    config.resync_interval = Duration::from_secs(args.resync_interval.max(1));
    config.report_interval = Duration::from_secs(args.report_interval);

    let executor: Arc<dyn CommandExecutor> = Arc::new(RootExecutor::new(
        &args.root_helper,
        Duration::from_secs(args.command_timeout),
    ));
    let grpc = GrpcControlPlane::connect_lazy(
        &args.api_endpoint,
        &host,
        Duration::from_secs(args.rpc_timeout),
    )
    .context("Invalid control plane endpoint")?;
    let control_plane: Arc<dyn ControlPlane> = Arc::new(grpc.clone());
    let audit = Arc::new(NatAuditLogger::new(&host));

    let gateways = GatewayManager::new(
        Arc::clone(&control_plane),
        driver::build(interface_driver, Arc::clone(&executor), &args.integration_bridge),
        Arc::clone(&executor),
        Arc::clone(&audit),
        args.send_arp_count,
        args.rule_backend.uses_subnet_gateway(),
    );
    let rule_manager = rules::build(args.rule_backend, Arc::clone(&executor));

    let agent = Arc::new(NatAgent::new(
        config,
        control_plane,
        Arc::new(grpc),
        rule_manager,
        gateways,
        audit,
    ));

    // Set up signal handlers
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let agent_task = tokio::spawn(Arc::clone(&agent).run(shutdown_rx));

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = agent_task.await {
        error!(error = %e, "Agent task failed");
    }

    info!("mvirt-nat stopped");
    Ok(())
}
