//! Process entry point for the agentic session control plane.
//!
//! `serve` is the only long-running command: it binds the HTTP API surface,
//! discovers tenants, and keeps one [`Reconciler`] watch loop running per
//! tenant for the life of the process. `reconcile-once` and `config show`
//! exist for operational debugging and are expected to exit promptly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ListParams};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use agentic_session_operator::api::{self, AppState};
use agentic_session_operator::config::AppConfig;
use agentic_session_operator::crd::ProjectSettings;
use agentic_session_operator::kube_client::Substrate;
use agentic_session_operator::observability;
use agentic_session_operator::reconciler::Reconciler;

#[derive(Parser)]
#[command(name = "agentic-session-operator")]
#[command(version)]
#[command(about = "Control plane for long-running agentic AI sessions on Kubernetes")]
#[command(long_about = "\
agentic-session-operator schedules, executes, and streams results of
long-running agentic AI sessions on top of a Kubernetes cluster.

It provides:
  - A reconciler that turns AgenticSession records into worker Jobs
  - Per-session credential provisioning (subject, role binding, token)
  - A per-tenant shared workspace volume and content-staging service
  - A messaging hub that fans interactive messages in and out of the worker

The `serve` command runs all of the above as one process. `reconcile-once`
drives a single reconciliation pass over one tenant without watching, for
use from a shell or a cron-style Job when debugging a stuck session.")]
#[command(after_long_help = "\
ENVIRONMENT VARIABLES:
    RUST_LOG                         Log level filter (default: from config, then \"info\")
    AGENTIC_SESSION_OPERATOR_CONFIG  Path to the config TOML file (default: /etc/agentic-session-operator/config.toml)
    KUBECONFIG                       Local kubeconfig used outside a cluster

Use 'agentic-session-operator <command> --help' for command-specific information.")]
struct Cli {
    /// Path to the config TOML file. Missing file falls back to defaults.
    #[arg(long, global = true, env = "AGENTIC_SESSION_OPERATOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API surface and the per-tenant reconcilers.
    ///
    /// Binds `config.bind_addr`, then enters the tenant discovery loop:
    /// every tenant namespace that carries a `ProjectSettings` record gets
    /// its own long-lived `Reconciler::run` watch task. Namespaces that
    /// disappear have their reconciler task aborted on the next discovery
    /// pass; this is the only supervision the process does over its own
    /// tenant tasks, matching the "watch + supervisor lifetime" rule that
    /// detached tasks check their parent's existence rather than being
    /// force-killed from outside.
    #[command(after_help = "\
EXAMPLES:
    agentic-session-operator serve
    agentic-session-operator --config /etc/agentic-session-operator/config.toml serve")]
    Serve {
        /// Override `config.bind_addr`.
        #[arg(long)]
        bind_addr: Option<String>,

        /// Reconcile only these tenant namespaces, skipping discovery.
        /// May be repeated.
        #[arg(long = "tenant")]
        tenants: Vec<String>,

        /// How often to re-scan for tenant namespaces, in seconds.
        #[arg(long, default_value_t = 30)]
        discovery_interval_secs: u64,
    },

    /// Drive a single reconciliation pass over every session in one tenant,
    /// without watching, and exit.
    #[command(after_help = "\
EXAMPLES:
    agentic-session-operator reconcile-once --tenant my-project")]
    ReconcileOnce {
        /// Tenant namespace to reconcile.
        #[arg(long)]
        tenant: String,
    },

    /// Inspect resolved configuration.
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the resolved configuration as TOML.
    #[command(after_help = "\
EXAMPLES:
    agentic-session-operator config show")]
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("/etc/agentic-session-operator/config.toml"));
    let mut config = AppConfig::load_or_default(&config_path)?;

    match cli.command {
        Commands::Serve {
            bind_addr,
            tenants,
            discovery_interval_secs,
        } => {
            if let Some(bind_addr) = bind_addr {
                config.bind_addr = bind_addr;
            }
            let _guard = observability::init_tracing(&config)?;
            run_serve(config, tenants, Duration::from_secs(discovery_interval_secs)).await
        }
        Commands::ReconcileOnce { tenant } => {
            let _guard = observability::init_tracing(&config)?;
            run_reconcile_once(config, tenant).await
        }
        Commands::Config(ConfigCommands::Show) => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Bind the HTTP API and keep one reconciler watch task per tenant alive for
/// the process lifetime.
async fn run_serve(config: AppConfig, fixed_tenants: Vec<String>, discovery_interval: Duration) -> anyhow::Result<()> {
    let substrate = Substrate::from_env().await?;
    let addr: SocketAddr = config.bind_addr.parse()?;

    let state = AppState::new(substrate.clone(), config.clone());
    let router = api::create_router().with_state(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP API listening");

    let http_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            warn!(error = %e, "HTTP server exited");
        }
    });

    let tenants_task = tokio::spawn(tenant_supervisor_loop(
        substrate,
        config,
        fixed_tenants,
        discovery_interval,
    ));

    tokio::select! {
        res = http_task => res.map_err(Into::into),
        res = tenants_task => res.map_err(Into::into),
    }
}

/// Keep one [`Reconciler::run`] task alive per discovered tenant namespace,
/// rescanning every `discovery_interval`. If `fixed_tenants` is non-empty,
/// discovery is skipped entirely and those are the only tenants watched.
async fn tenant_supervisor_loop(
    substrate: Substrate,
    config: AppConfig,
    fixed_tenants: Vec<String>,
    discovery_interval: Duration,
) -> anyhow::Result<()> {
    let running: Mutex<HashMap<String, JoinHandle<()>>> = Mutex::new(HashMap::new());

    loop {
        let current_tenants = if fixed_tenants.is_empty() {
            match discover_tenants(&substrate).await {
                Ok(tenants) => tenants,
                Err(e) => {
                    warn!(error = %e, "tenant discovery failed, keeping existing reconcilers");
                    Vec::new()
                }
            }
        } else {
            fixed_tenants.clone()
        };

        {
            let mut running = running.lock().await;

            for tenant in &current_tenants {
                if running.contains_key(tenant) {
                    continue;
                }
                info!(%tenant, "starting reconciler for newly discovered tenant");
                let reconciler = Arc::new(Reconciler::new(substrate.clone(), config.clone(), tenant.clone()));
                let handle = tokio::spawn(async move {
                    reconciler.run().await;
                });
                running.insert(tenant.clone(), handle);
            }

            if fixed_tenants.is_empty() {
                let vanished: Vec<String> = running
                    .keys()
                    .filter(|t| !current_tenants.contains(t))
                    .cloned()
                    .collect();
                for tenant in vanished {
                    if let Some(handle) = running.remove(&tenant) {
                        info!(%tenant, "tenant namespace no longer present, stopping reconciler");
                        handle.abort();
                    }
                }
            }
        }

        tokio::time::sleep(discovery_interval).await;
    }
}

/// A tenant is any namespace carrying a `ProjectSettings` record. Namespaces
/// without one are not yet onboarded and are left alone.
async fn discover_tenants(substrate: &Substrate) -> anyhow::Result<Vec<String>> {
    let namespaces: Api<Namespace> = Api::all(substrate.backend().clone());
    let list = namespaces.list(&ListParams::default()).await?;

    let mut tenants = Vec::new();
    for ns in list.items {
        let Some(name) = ns.metadata.name else {
            continue;
        };
        let settings: Api<ProjectSettings> = substrate.backend_typed(&name);
        match settings.list(&ListParams::default().limit(1)).await {
            Ok(found) if !found.items.is_empty() => tenants.push(name),
            Ok(_) => {}
            Err(e) => warn!(tenant = %name, error = %e, "failed to check tenant for ProjectSettings"),
        }
    }
    Ok(tenants)
}

async fn run_reconcile_once(config: AppConfig, tenant: String) -> anyhow::Result<()> {
    let substrate = Substrate::from_env().await?;
    let reconciler = Reconciler::new(substrate, config, tenant);
    reconciler.reconcile_all().await
}
