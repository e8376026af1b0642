// src/main.rs — process bootstrap

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use kernel_agentd::aliases::AliasTable;
use kernel_agentd::artifact::NullArtifactSink;
use kernel_agentd::config::Cli;
use kernel_agentd::engine::BollardEngine;
use kernel_agentd::lifecycle::{KernelLifecycle, NoGpuHelper};
use kernel_agentd::monitor;
use kernel_agentd::periodic;
use kernel_agentd::rpc::RpcFacade;
use kernel_agentd::stats::StatsProbe;
use kernel_agentd::topology::CoreTopology;
use kernel_agentd::upstream::{dispatch, TcpUpstreamSink, UpstreamEvent};

const MANAGER_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct EngineStatsProbe {
    engine: Arc<BollardEngine>,
}

#[async_trait::async_trait]
impl StatsProbe for EngineStatsProbe {
    async fn sample(&self, _handle: &kernel_agentd::engine::ContainerHandle) -> Option<kernel_agentd::stats::StatsSample> {
        // A real sampler would read the engine's per-container stats API;
        // until one is wired this reports nothing rather than fabricating data.
        let _ = &self.engine;
        None
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(cli.tracing_filter()))
        .init();

    if let Err(e) = cli.validate() {
        error!(error = %e, "startup configuration invalid");
        std::process::exit(1);
    }

    let aliases = match &cli.kernel_aliases {
        Some(path) => match AliasTable::load_file(path) {
            Ok(table) => table,
            Err(e) => {
                error!(error = %e, "failed loading kernel-aliases file");
                std::process::exit(1);
            }
        },
        None => AliasTable::new(),
    };

    let topology = CoreTopology::discover();
    info!(total_cores = topology.total_cores(), "discovered core topology");

    let engine = match BollardEngine::connect() {
        Ok(e) => Arc::new(e),
        Err(e) => {
            error!(error = %e, "failed to connect to container engine");
            std::process::exit(1);
        }
    };

    let event_addr: SocketAddr = match cli.event_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "invalid event-addr");
            std::process::exit(1);
        }
    };
    let upstream = Arc::new(TcpUpstreamSink::new(event_addr));

    let inst_id = cli
        .agent_ip
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| format!("agent-{}", std::process::id()));

    if tokio::time::timeout(
        MANAGER_CONNECT_TIMEOUT,
        dispatch(upstream.as_ref(), UpstreamEvent::InstanceStarted { inst_id: inst_id.clone() }),
    )
    .await
    .is_err()
    {
        error!("manager unreachable at startup");
        std::process::exit(1);
    }

    let stats_probe = Arc::new(EngineStatsProbe { engine: engine.clone() });

    let lifecycle = Arc::new(KernelLifecycle::new(
        engine,
        Arc::new(NullArtifactSink),
        stats_probe,
        upstream,
        Arc::new(NoGpuHelper),
        &topology,
        aliases,
        cli.volume_root.clone(),
        cli.exec_timeout,
        inst_id,
    ));

    let idle_timeout = Duration::from_secs(cli.idle_timeout);

    // The manager-facing transport that would drive this façade is out of
    // scope; constructing it here documents the seam a transport attaches to.
    let _rpc = RpcFacade::new(lifecycle.clone());

    tokio::spawn(periodic::heartbeat_loop(lifecycle.clone()));
    tokio::spawn(periodic::stats_loop(lifecycle.clone(), idle_timeout));
    tokio::spawn(periodic::idle_reap_loop(lifecycle.clone(), idle_timeout));
    tokio::spawn(monitor::run(lifecycle.clone()));

    info!(port = cli.agent_port, "agent ready");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "failed installing signal handler"),
    }

    lifecycle.shutdown().await;
    std::process::exit(0);
}
