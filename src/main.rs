//! roost daemon entry point
//!
//! Parses the flag set into a [`ControlPlaneConfig`], wires the node bus,
//! scheduler, proxy and agent together, and serves the health endpoint.

use anyhow::Context;
use clap::Parser;
use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use roost::agent::{
    AgentConfig, AgentService, ObjectFetcher, RemoteDeployer, WorkingDirDeployer,
};
use roost::agent::{DeployInstanceRequest, RuntimeLauncher};
use roost::bus::NodeBus;
use roost::config::ControlPlaneConfig;
use roost::domain_types::{AgentId, InstanceId, RuntimeId};
use roost::error::{ErrorCode, Status};
use roost::health::health_app;
use roost::memory_monitor::{MemoryControlConfig, MemoryMonitor, ProcStatusProbe};
use roost::proxy::{DataPlaneObserver, InvocationHandler, ProxyManager, TokenBucket};
use roost::scheduler::{ScheduleFramework, register_named_plugins};

/// Per-node scheduler and bus proxy for the function-execution platform.
#[derive(Debug, Parser)]
#[command(name = "roost", version, about)]
struct Args {
    /// Address the health endpoint listens on.
    #[arg(long, default_value = "127.0.0.1:31501")]
    listen_address: String,

    /// Base path for TLS material.
    #[arg(long)]
    certs_path: Option<PathBuf>,

    /// Total heartbeat detection window in milliseconds.
    #[arg(long, default_value_t = 60_000)]
    heartbeat_timeout_ms: u64,

    /// High memory watermark as a fraction of the limit.
    #[arg(long, default_value_t = 0.8)]
    high_memory_threshold: f64,

    /// Low memory watermark as a fraction of the limit.
    #[arg(long, default_value_t = 0.6)]
    low_memory_threshold: f64,

    /// Messages at or below this size always pass memory admission.
    #[arg(long, default_value_t = 20_000)]
    msg_size_threshold: u64,

    /// Fraction of system memory this process may use.
    #[arg(long, default_value_t = 0.9)]
    memory_limit_fraction: f64,

    /// Scheduler plugins, in registration order.
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "affinity-prefilter,default-prefilter,resource-selector-filter,default-scorer,label-affinity-scorer"
    )]
    schedule_plugins: Vec<String>,

    /// Maximum control-stream frame size in bytes.
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    max_frame_size: usize,

    /// Invoke token-bucket capacity.
    #[arg(long, default_value_t = 1000)]
    token_bucket_capacity: u32,

    /// Highest schedulable priority.
    #[arg(long, default_value_t = 10)]
    max_priority: u32,

    /// Directory caching deployed code packages.
    #[arg(long, default_value = "/var/cache/roost/packages")]
    deploy_dir: PathBuf,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn into_config(self) -> ControlPlaneConfig {
        ControlPlaneConfig {
            listen_address: self.listen_address,
            certs_path: self.certs_path,
            heartbeat_timeout_ms: self.heartbeat_timeout_ms,
            high_memory_threshold: self.high_memory_threshold,
            low_memory_threshold: self.low_memory_threshold,
            msg_size_threshold: self.msg_size_threshold,
            memory_limit_fraction: self.memory_limit_fraction,
            schedule_plugins: self.schedule_plugins,
            max_frame_size: self.max_frame_size,
            token_bucket_capacity: self.token_bucket_capacity,
            max_priority: self.max_priority,
            deploy_dir: self.deploy_dir,
            ..ControlPlaneConfig::default()
        }
    }
}

/// Placeholder observer until the metastore watch connects.
struct NoopObserver;

#[async_trait::async_trait]
impl DataPlaneObserver for NoopObserver {
    async fn subscribe_instance_event(
        &self,
        _watcher: &InstanceId,
        _target: &InstanceId,
        _low_reliability: bool,
    ) -> Result<(), ErrorCode> {
        Ok(())
    }
}

/// Launcher stub; the runtime-manager integration supplies the real one.
struct ProcessLauncher;

#[async_trait::async_trait]
impl RuntimeLauncher for ProcessLauncher {
    async fn start(&self, request: &DeployInstanceRequest) -> Result<RuntimeId, Status> {
        Ok(RuntimeId::new(format!("rt-{}", request.instance_id)))
    }

    async fn stop(&self, _instance_id: &InstanceId) -> Status {
        Status::ok()
    }
}

/// Fetcher stub; the object-cache client supplies the real one.
struct LocalFetcher;

#[async_trait::async_trait]
impl ObjectFetcher for LocalFetcher {
    async fn fetch(&self, _bucket: &str, _object_id: &str) -> Result<Vec<u8>, ErrorCode> {
        Err(ErrorCode::UserCodeLoad)
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn system_memory_limit(fraction: f64) -> u64 {
    let total = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|meminfo| {
            meminfo
                .lines()
                .find(|line| line.starts_with("MemTotal:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kib| kib.parse::<u64>().ok())
        })
        .map_or(8 * 1024 * 1024 * 1024, |kib| kib * 1024);
    (total as f64 * fraction) as u64
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log_json = args.log_json;
    init_tracing(log_json);

    let config = args.into_config();
    config.validate().context("invalid configuration")?;
    info!(listen = %config.listen_address, "starting roost control plane");

    let bus = NodeBus::new(config.listen_address.clone());

    let mut framework = ScheduleFramework::new(config.relaxed_feasible);
    register_named_plugins(&mut framework, &config.schedule_plugins)
        .map_err(|status| anyhow::anyhow!("schedule plugin configuration: {status}"))?;

    let probe = ProcStatusProbe::start(
        system_memory_limit(config.memory_limit_fraction),
        Duration::from_secs(1),
    );
    let memory = Arc::new(MemoryMonitor::new(
        MemoryControlConfig {
            high_memory_threshold: config.high_memory_threshold,
            low_memory_threshold: config.low_memory_threshold,
            msg_size_threshold: config.msg_size_threshold,
            enabled: true,
        },
        probe,
    ));

    let proxies = ProxyManager::new(
        Arc::clone(&bus),
        Arc::new(NoopObserver),
        false,
        Duration::from_secs(1),
    );
    let _invocations = InvocationHandler::new(
        Arc::clone(&proxies),
        Arc::clone(&memory),
        TokenBucket::new(config.token_bucket_capacity, f64::from(config.token_bucket_capacity)),
    );

    let agent = AgentService::new(
        AgentId::new(format!("agent-{}", config.listen_address)),
        AgentConfig::new(config.deploy_dir.clone()),
        vec![
            Arc::new(RemoteDeployer::new(Arc::new(LocalFetcher))),
            Arc::new(WorkingDirDeployer),
        ],
        Arc::new(ProcessLauncher),
    );

    let listener = tokio::net::TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("cannot bind {}", config.listen_address))?;
    let app = health_app(agent.register_completed());
    info!(listen = %config.listen_address, "health endpoint up");

    tokio::select! {
        served = axum::serve(listener, app).into_future() => {
            served.context("health endpoint failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            agent.graceful_shutdown().await;
        }
    }
    Ok(())
}
