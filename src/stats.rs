// src/stats.rs — StatsProbe collaborator and per-kernel stats sample (spec §4.6)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::ContainerHandle;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSample {
    pub cpu_used_pct: f32,
    pub mem_used_bytes: u64,
    pub io_read_bytes: u64,
    pub io_write_bytes: u64,
}

/// Abstract sampler for per-container CPU/memory/I-O metrics.
#[async_trait]
pub trait StatsProbe: Send + Sync {
    async fn sample(&self, handle: &ContainerHandle) -> Option<StatsSample>;
}

/// Stats payload shape dispatched as `instance_stats` (spec §4.6, §6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelStatsEntry {
    pub exec_timeout: u64,
    pub idle_timeout: u64,
    pub mem_limit_kib: u64,
    pub num_queries: u64,
    pub idle_ms: u64,
}
