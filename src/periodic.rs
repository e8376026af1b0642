// src/periodic.rs — PeriodicTasks: heartbeat, stats, idle-reap (spec §4.6)

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::artifact::ArtifactSink;
use crate::engine::ContainerEngine;
use crate::lifecycle::{KernelLifecycle, NvidiaHelper};
use crate::stats::{KernelStatsEntry, StatsProbe};
use crate::upstream::{dispatch, UpstreamEvent};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
pub const STATS_INTERVAL: Duration = Duration::from_secs(5);
pub const IDLE_REAP_INTERVAL: Duration = Duration::from_secs(10);

/// Dispatches `instance_heartbeat` every `HEARTBEAT_INTERVAL`. Fire-and-forget:
/// a slow dispatch never delays the next tick (spec §4.6).
pub async fn heartbeat_loop<E, A, S, U, N>(lifecycle: Arc<KernelLifecycle<E, A, S, U, N>>)
where
    E: ContainerEngine + 'static,
    A: ArtifactSink + 'static,
    S: StatsProbe + 'static,
    U: crate::upstream::UpstreamSink + 'static,
    N: NvidiaHelper + 'static,
{
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        ticker.tick().await;
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            let ids = lifecycle.registry_ids().await;
            let running: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
            let summary = json!({ "kernel_count": ids.len() });
            dispatch(
                lifecycle.upstream_sink(),
                UpstreamEvent::InstanceHeartbeat {
                    inst_id: lifecycle.inst_id().to_string(),
                    summary,
                    running_kernel_ids: running,
                    interval: HEARTBEAT_INTERVAL.as_secs(),
                },
            )
            .await;
        });
    }
}

/// Samples every live container every `STATS_INTERVAL` and dispatches
/// `instance_stats`. Kernels that vanish mid-collection are dropped, not errored
/// (spec §4.6, §9 known-bug fix: no `None` sentinels in the per-kernel map).
pub async fn stats_loop<E, A, S, U, N>(lifecycle: Arc<KernelLifecycle<E, A, S, U, N>>, idle_timeout: Duration)
where
    E: ContainerEngine + 'static,
    A: ArtifactSink + 'static,
    S: StatsProbe + 'static,
    U: crate::upstream::UpstreamSink + 'static,
    N: NvidiaHelper + 'static,
{
    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    loop {
        ticker.tick().await;

        let snapshot = lifecycle
            .with_registry(|reg| {
                reg.iter()
                    .map(|(id, rec)| (*id, rec.container_id.clone(), rec.exec_timeout_s, rec.mem_limit_bytes, rec.num_queries, rec.last_used))
                    .collect::<Vec<_>>()
            })
            .await;

        let mut per_kernel = serde_json::Map::new();
        for (id, container_id, exec_timeout, mem_limit_bytes, num_queries, last_used) in snapshot {
            let handle = crate::engine::ContainerHandle { id: container_id };
            let Some(_sample) = lifecycle.stats_probe().sample(&handle).await else {
                continue; // vanished during collection; omit rather than sentinel
            };
            if !lifecycle.with_registry(|reg| reg.contains(&id)).await {
                continue;
            }
            let entry = KernelStatsEntry {
                exec_timeout,
                idle_timeout: idle_timeout.as_secs(),
                mem_limit_kib: (mem_limit_bytes / 1024).max(0) as u64,
                num_queries,
                idle_ms: last_used.elapsed().as_millis() as u64,
            };
            if let Ok(value) = serde_json::to_value(entry) {
                per_kernel.insert(id.to_string(), value);
            }
        }

        dispatch(
            lifecycle.upstream_sink(),
            UpstreamEvent::InstanceStats {
                inst_id: lifecycle.inst_id().to_string(),
                per_kernel: serde_json::Value::Object(per_kernel),
                interval: STATS_INTERVAL.as_secs(),
            },
        )
        .await;
    }
}

/// Every `IDLE_REAP_INTERVAL`, schedules Destroy(idle-timeout) for kernels idle
/// longer than `idle_timeout` (spec §4.6).
pub async fn idle_reap_loop<E, A, S, U, N>(lifecycle: Arc<KernelLifecycle<E, A, S, U, N>>, idle_timeout: Duration)
where
    E: ContainerEngine + 'static,
    A: ArtifactSink + 'static,
    S: StatsProbe + 'static,
    U: crate::upstream::UpstreamSink + 'static,
    N: NvidiaHelper + 'static,
{
    let mut ticker = tokio::time::interval(IDLE_REAP_INTERVAL);
    loop {
        ticker.tick().await;
        let idle = lifecycle.idle_kernels(idle_timeout).await;
        for id in idle {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move {
                lifecycle.destroy(id, "idle-timeout").await;
            });
        }
    }
}
