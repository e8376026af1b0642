// src/registry.rs — KernelRegistry: the single source of truth (spec §3, §4.2)

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::artifact::WorkdirSnapshot;
use crate::cpu_allocator::CoreSet;
use crate::id::KernelId;
use crate::stats::StatsSample;

/// A one-shot-ish signal that can be observed by waiters that arrive after it
/// fired (spec's `restarting`/`blocking_cleans` tables are "set once, awaited
/// by possibly-later tasks").
#[derive(Default)]
pub struct Signal {
    notify: Notify,
    fired: std::sync::atomic::AtomicBool,
}

impl Signal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fire(&self) {
        self.fired.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub async fn wait(&self) {
        if self.fired.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        self.notify.notified().await;
    }
}

/// Per-kernel record (spec §3).
pub struct KernelRecord {
    pub lang: String,
    pub image_version: i64,
    pub container_id: String,
    pub container_ip: IpAddr,
    pub repl_in_port: u16,
    pub repl_out_port: u16,
    pub stdin_port: u16,
    pub stdout_port: u16,
    pub numa_node: usize,
    pub core_set: CoreSet,
    pub mem_limit_bytes: i64,
    pub exec_timeout_s: u64,
    pub num_queries: u64,
    pub last_used: Instant,
    /// Present iff an execute session is live. Arc'd so a caller can clone it
    /// out and await on it without holding the registry lock for the duration
    /// of a call (spec §5's single-task-at-a-time discipline, adapted to Rust's
    /// aliasing rules).
    pub runner: Option<Arc<crate::relay::RelayHandle>>,
    /// Present iff a call is in flight.
    pub runner_task: Option<JoinHandle<()>>,
    /// Present between start-of-first-exec and finished/timeout.
    pub initial_files: Option<WorkdirSnapshot>,
    pub last_stat: Option<StatsSample>,
}

#[derive(Default)]
pub struct KernelRegistry {
    kernels: HashMap<KernelId, KernelRecord>,
    pub restarting: HashMap<KernelId, Arc<Signal>>,
    pub blocking_cleans: HashMap<KernelId, Arc<Signal>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: KernelId, record: KernelRecord) {
        self.kernels.insert(id, record);
    }

    pub fn get(&self, id: &KernelId) -> Option<&KernelRecord> {
        self.kernels.get(id)
    }

    pub fn get_mut(&mut self, id: &KernelId) -> Option<&mut KernelRecord> {
        self.kernels.get_mut(id)
    }

    /// Removes and returns the record; a missing key signals "already cleaned",
    /// not an error (spec §4.2).
    pub fn remove(&mut self, id: &KernelId) -> Option<KernelRecord> {
        self.kernels.remove(id)
    }

    pub fn contains(&self, id: &KernelId) -> bool {
        self.kernels.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = KernelId> + '_ {
        self.kernels.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&KernelId, &KernelRecord)> {
        self.kernels.iter()
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}
