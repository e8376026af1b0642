// src/lifecycle.rs — KernelLifecycle: Create, Destroy, Restart, Reset, Clean (spec §4.3)

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aliases::AliasTable;
use crate::artifact::{workdir_path, ArtifactSink, WorkdirSnapshot};
use crate::cpu_allocator::{CoreSet, CpuAllocator};
use crate::engine::{container_name, ContainerEngine, ContainerHandle, ContainerSpec};
use crate::error::{AgentError, AgentResult};
use crate::id::KernelId;
use crate::registry::{KernelRecord, KernelRegistry, Signal};
use crate::relay::{evaluate_match, ExecuteCodeResult, MatchSpec, RelayHandle, RunnerRequest, STATUS_EXEC_TIMEOUT, STATUS_FINISHED};
use crate::stats::StatsProbe;
use crate::topology::CoreTopology;
use crate::upstream::{dispatch, UpstreamEvent, UpstreamSink};

const RESTART_WAIT: Duration = Duration::from_secs(10);

/// Per-language auxiliary volume: a named engine volume mounted at a fixed
/// container path in addition to the per-kernel workdir (spec §4.3 step 6, §6.2).
#[derive(Debug, Clone)]
pub struct AuxVolume {
    pub volume_name: String,
    pub container_path: String,
}

#[derive(Debug, Clone, Default)]
pub struct AuxVolumeTable {
    by_lang: HashMap<String, Vec<AuxVolume>>,
}

impl AuxVolumeTable {
    pub fn new() -> Self {
        let mut by_lang: HashMap<String, Vec<AuxVolume>> = HashMap::new();
        by_lang.insert(
            "python3".into(),
            vec![AuxVolume { volume_name: "pip-cache".into(), container_path: "/home/work/.cache/pip".into() }],
        );
        by_lang.insert(
            "nodejs".into(),
            vec![AuxVolume { volume_name: "npm-cache".into(), container_path: "/home/work/.npm".into() }],
        );
        Self { by_lang }
    }

    pub fn for_lang(&self, lang: &str) -> &[AuxVolume] {
        self.by_lang.get(lang).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

/// Abstract device-binding collaborator for GPU-enabled kernels (spec §4.3 step 7).
#[async_trait]
pub trait NvidiaHelper: Send + Sync {
    async fn device_requests(&self, numa_node: usize) -> Vec<String>;
}

pub struct NoGpuHelper;

#[async_trait]
impl NvidiaHelper for NoGpuHelper {
    async fn device_requests(&self, _numa_node: usize) -> Vec<String> {
        Vec::new()
    }
}

/// The two resources whose mutation must be serialized together: a CoreSet is
/// only ever attached to a KernelRecord while both are held under one lock.
struct LifecycleState {
    registry: KernelRegistry,
    allocator: CpuAllocator,
}

pub struct KernelLifecycle<E, A, S, U, N> {
    engine: Arc<E>,
    artifact_sink: Arc<A>,
    stats_probe: Arc<S>,
    upstream: Arc<U>,
    nvidia: Arc<N>,
    aliases: AliasTable,
    aux_volumes: AuxVolumeTable,
    state: tokio::sync::Mutex<LifecycleState>,
    kernel_locks: tokio::sync::Mutex<HashMap<KernelId, Arc<tokio::sync::Mutex<()>>>>,
    volume_root: PathBuf,
    exec_timeout_cap: u64,
    inst_id: String,
}

impl<E, A, S, U, N> KernelLifecycle<E, A, S, U, N>
where
    E: ContainerEngine + 'static,
    A: ArtifactSink + 'static,
    S: StatsProbe + 'static,
    U: UpstreamSink + 'static,
    N: NvidiaHelper + 'static,
{
    pub fn new(
        engine: Arc<E>,
        artifact_sink: Arc<A>,
        stats_probe: Arc<S>,
        upstream: Arc<U>,
        nvidia: Arc<N>,
        topology: &CoreTopology,
        aliases: AliasTable,
        volume_root: PathBuf,
        exec_timeout_cap: u64,
        inst_id: String,
    ) -> Self {
        Self {
            engine,
            artifact_sink,
            stats_probe,
            upstream,
            nvidia,
            aliases,
            aux_volumes: AuxVolumeTable::new(),
            state: tokio::sync::Mutex::new(LifecycleState {
                registry: KernelRegistry::new(),
                allocator: CpuAllocator::new(topology),
            }),
            kernel_locks: tokio::sync::Mutex::new(HashMap::new()),
            volume_root,
            exec_timeout_cap,
            inst_id,
        }
    }

    pub async fn registry_ids(&self) -> Vec<KernelId> {
        self.state.lock().await.registry.ids().collect()
    }

    async fn lock_for(&self, id: KernelId) -> tokio::sync::OwnedMutexGuard<()> {
        let mut locks = self.kernel_locks.lock().await;
        let entry = locks.entry(id).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())));
        let entry = entry.clone();
        drop(locks);
        entry.lock_owned().await
    }

    async fn dispatch_upstream(&self, event: UpstreamEvent) {
        dispatch(self.upstream.as_ref(), event).await;
    }

    /// Create(lang, kernel_id?) — spec §4.3.
    pub async fn create(&self, lang: &str, kernel_id: Option<KernelId>) -> AgentResult<(KernelId, u16, u16)> {
        let lang = self.aliases.resolve_checked(lang)?;
        let is_restart = kernel_id.is_some();
        let id = kernel_id.unwrap_or_else(KernelId::generate);
        let _guard = self.lock_for(id).await;

        if is_restart {
            self.dispatch_upstream(UpstreamEvent::KernelRestarting { kernel_id: id.to_string() }).await;
        } else {
            self.dispatch_upstream(UpstreamEvent::KernelCreating { kernel_id: id.to_string() }).await;
        }

        let image = format!("prefix/kernel-{lang}");
        let labels = self
            .engine
            .inspect_image(&image)
            .await
            .map_err(|e| AgentError::ImageInspectFailed { image: image.clone(), source: Box::new(e) })?;

        let (core_set, reused_from_restart) = if let Some(existing) = self.reserved_restart_core_set(id).await {
            let signal = {
                let state = self.state.lock().await;
                state.registry.restarting.get(&id).cloned()
            };
            if let Some(signal) = signal {
                if tokio::time::timeout(RESTART_WAIT, signal.wait()).await.is_err() {
                    self.orphan_restarting_kernel(id).await;
                    return Err(AgentError::RestartTimeout(id));
                }
            }
            (existing, true)
        } else {
            if let Err(e) = tokio::fs::create_dir_all(workdir_path(&self.volume_root, id)).await {
                return Err(AgentError::Io(e));
            }
            let num_cores = labels.maxcores.unwrap_or(1);
            let mut state = self.state.lock().await;
            (state.allocator.alloc(num_cores.max(1)), false)
        };

        let result = self.provision(&lang, id, &labels, &core_set, &image).await;
        match result {
            Ok(record) => {
                let mut state = self.state.lock().await;
                state.registry.insert(id, record);
                let (stdin, stdout) = {
                    let rec = state.registry.get(&id).expect("just inserted");
                    (rec.stdin_port, rec.stdout_port)
                };
                Ok((id, stdin, stdout))
            }
            Err(e) => {
                if !reused_from_restart {
                    let mut state = self.state.lock().await;
                    state.allocator.free(core_set);
                }
                Err(e)
            }
        }
    }

    async fn reserved_restart_core_set(&self, id: KernelId) -> Option<CoreSet> {
        let state = self.state.lock().await;
        if !state.registry.restarting.contains_key(&id) {
            return None;
        }
        state.registry.get(&id).map(|r| r.core_set.clone())
    }

    /// Treats a kernel that never signaled restart-completion within the
    /// deadline as orphaned: drops it from `restarting` and runs a full Clean
    /// so its cores, workdir, and record are not leaked (spec §7 RestartTimeout).
    async fn orphan_restarting_kernel(&self, id: KernelId) {
        {
            let mut state = self.state.lock().await;
            state.registry.restarting.remove(&id);
        }
        self.clean(id).await;
    }

    async fn provision(
        &self,
        lang: &str,
        id: KernelId,
        labels: &crate::engine::ImageLabels,
        core_set: &CoreSet,
        image: &str,
    ) -> AgentResult<KernelRecord> {
        let mut extra_mounts = Vec::new();
        let available_volumes = self.engine.list_volumes().await.unwrap_or_default();
        for aux in self.aux_volumes.for_lang(lang) {
            if available_volumes.iter().any(|v| v == &aux.volume_name) {
                extra_mounts.push((aux.volume_name.clone(), aux.container_path.clone()));
            } else {
                warn!(lang, volume = %aux.volume_name, "auxiliary volume not reported by engine, skipping");
            }
        }

        let device_requests = if labels.nvidia_enabled {
            self.nvidia.device_requests(core_set.numa_node).await
        } else {
            Vec::new()
        };

        let mem_limit_bytes = crate::engine::parse_mem_limit(labels.maxmem.as_deref(), 512 * 1024 * 1024);
        let exec_timeout_s = labels.timeout.unwrap_or(self.exec_timeout_cap).min(self.exec_timeout_cap);

        let mut env = std::collections::BTreeMap::new();
        for name in &labels.corecount_envs {
            env.insert(name.clone(), core_set.len().to_string());
        }

        let name = container_name(lang, id);
        let workdir = workdir_path(&self.volume_root, id);
        let spec = ContainerSpec {
            name: name.clone(),
            image: image.to_string(),
            tty: true,
            stop_signal: "SIGINT".to_string(),
            exposed_ports: vec![2000, 2001, 2002, 2003],
            bind_workdir: (workdir.to_string_lossy().into_owned(), "/home/work".to_string()),
            extra_mounts,
            mem_limit_bytes,
            cpuset_cpus: core_set.cpuset_cpus(),
            cpuset_mems: core_set.numa_node.to_string(),
            env,
            device_requests,
        };

        let handle = self.engine.create(spec).await.map_err(|e| AgentError::EngineCall(e.to_string()))?;
        self.engine.start(&handle).await.map_err(|e| AgentError::EngineCall(e.to_string()))?;

        let stdin_port = self.engine.port_of(&handle, 2000).await.map_err(|e| AgentError::EngineCall(e.to_string()))?;
        let stdout_port = self.engine.port_of(&handle, 2001).await.map_err(|e| AgentError::EngineCall(e.to_string()))?;
        let repl_in_port = self.engine.port_of(&handle, 2002).await.map_err(|e| AgentError::EngineCall(e.to_string()))?;
        let repl_out_port = self.engine.port_of(&handle, 2003).await.map_err(|e| AgentError::EngineCall(e.to_string()))?;
        let container_ip = self.engine.container_ip(&handle).await.map_err(|e| AgentError::EngineCall(e.to_string()))?;

        Ok(KernelRecord {
            lang: lang.to_string(),
            image_version: labels.version.unwrap_or(0),
            container_id: handle.id,
            container_ip,
            repl_in_port,
            repl_out_port,
            stdin_port,
            stdout_port,
            numa_node: core_set.numa_node,
            core_set: core_set.clone(),
            mem_limit_bytes,
            exec_timeout_s,
            num_queries: 0,
            last_used: Instant::now(),
            runner: None,
            runner_task: None,
            initial_files: None,
            last_stat: None,
        })
    }

    /// Destroy(kernel_id, reason) — spec §4.3.
    ///
    /// Deliberately does not take `lock_for(id)`: an in-flight `execute_code`
    /// holds that guard only across its own setup, not across its wait, so
    /// this has to be reachable while a long exec is outstanding in order to
    /// abort and await it instead of queuing up behind it.
    pub async fn destroy(&self, id: KernelId, reason: &str) {
        let (container_id, runner, runner_task) = {
            let mut state = self.state.lock().await;
            let Some(record) = state.registry.get_mut(&id) else {
                info!(%id, "destroy: kernel already gone");
                return;
            };
            (record.container_id.clone(), record.runner.take(), record.runner_task.take())
        };

        if let Some(task) = runner_task {
            task.abort();
            let _ = task.await;
        }
        if let Some(runner) = runner {
            runner.close();
        }

        let last_stat = {
            let handle = ContainerHandle { id: container_id.clone() };
            self.stats_probe.sample(&handle).await
        };
        {
            let mut state = self.state.lock().await;
            if let Some(record) = state.registry.get_mut(&id) {
                record.last_stat = last_stat;
            }
        }

        let handle = ContainerHandle { id: container_id };
        match self.engine.kill(&handle).await {
            Ok(()) => {}
            Err(e) if e.is_not_running() => {}
            Err(e) if e.is_not_found() => {
                // Fixed per the redesign note: only Clean removes records and
                // frees cores. There will be no `die` event for an already-gone
                // container, so run Clean synchronously instead of leaking it.
                self.clean(id).await;
                return;
            }
            Err(e) => warn!(%id, reason, error = %e, "kill failed; awaiting engine die event"),
        }
    }

    /// Restart(kernel_id) — spec §4.3.
    pub async fn restart(&self, id: KernelId) -> AgentResult<(u16, u16)> {
        {
            let mut state = self.state.lock().await;
            if !state.registry.contains(&id) {
                return Err(AgentError::UnknownKernel(id));
            }
            state.registry.restarting.insert(id, Signal::new());
        }

        let lang = {
            let state = self.state.lock().await;
            state.registry.get(&id).map(|r| r.lang.clone())
        };
        let Some(lang) = lang else {
            let mut state = self.state.lock().await;
            state.registry.restarting.remove(&id);
            return Err(AgentError::UnknownKernel(id));
        };

        self.destroy(id, "restarting").await;

        let result = self.create(&lang, Some(id)).await;
        {
            let mut state = self.state.lock().await;
            state.registry.restarting.remove(&id);
        }
        result.map(|(_, stdin, stdout)| (stdin, stdout))
    }

    /// Reset() — destroy every kernel concurrently with reason `agent-reset`.
    pub async fn reset(&self) {
        let ids = self.registry_ids().await;
        let tasks: Vec<_> = ids.into_iter().map(|id| self.destroy(id, "agent-reset")).collect();
        futures_util::future::join_all(tasks).await;
    }

    /// Shutdown path: Reset, then await every blocking-clean signal (spec §5).
    pub async fn shutdown(&self) {
        let ids = self.registry_ids().await;
        let mut signals = Vec::new();
        {
            let mut state = self.state.lock().await;
            for id in &ids {
                signals.push(state.registry.blocking_cleans.entry(*id).or_insert_with(Signal::new).clone());
            }
        }
        let destroys: Vec<_> = ids.iter().map(|id| self.destroy(*id, "agent-termination")).collect();
        futures_util::future::join_all(destroys).await;
        for signal in signals {
            signal.wait().await;
        }
    }

    /// Clean, driven by EventMonitor on a container `die` event or by the
    /// RestartTimeout orphan path (spec §4.3 Clean).
    pub async fn clean(&self, id: KernelId) {
        let container_id = {
            let state = self.state.lock().await;
            state.registry.get(&id).map(|r| r.container_id.clone())
        };

        if let Some(container_id) = container_id {
            let handle = ContainerHandle { id: container_id };
            match self.engine.delete(&handle).await {
                Ok(()) | Err(_) => {} // 400/404 tolerated; other errors already logged upstream
            }
        }

        let was_restarting = {
            let mut state = self.state.lock().await;
            if let Some(signal) = state.registry.restarting.get(&id) {
                signal.fire();
                true
            } else {
                false
            }
        };
        if was_restarting {
            return;
        }

        let (removed, blocking_signal) = {
            let mut state = self.state.lock().await;
            let removed = state.registry.remove(&id);
            if let Some(record) = &removed {
                state.allocator.free(record.core_set.clone());
            }
            let signal = state.registry.blocking_cleans.remove(&id);
            (removed, signal)
        };

        if let Some(record) = removed {
            let workdir = workdir_path(&self.volume_root, id);
            if let Err(e) = tokio::fs::remove_dir_all(&workdir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(%id, error = %e, "failed removing workdir during clean");
                }
            }
            let last_stat = record.last_stat.clone().map(|s| serde_json::to_value(s).unwrap_or_default()).unwrap_or_default();
            self.dispatch_upstream(UpstreamEvent::KernelTerminated {
                kernel_id: id.to_string(),
                reason: "destroyed".to_string(),
                last_stat,
            })
            .await;
        }

        if let Some(signal) = blocking_signal {
            signal.fire();
        }
    }

    /// execute_code(entry_id, kernel_id, code_id, code, match) — spec §4.4.
    pub async fn execute_code(
        &self,
        entry_id: &str,
        kernel_id: KernelId,
        code_id: &str,
        code: &str,
        match_spec: Option<MatchSpec>,
        cancel: CancellationToken,
    ) -> AgentResult<Option<ExecuteCodeResult>> {
        let (runner, exec_timeout_s, workdir) = {
            let _guard = self.lock_for(kernel_id).await;

            let (repl_ip, repl_in, repl_out, had_runner, workdir) = {
                let mut state = self.state.lock().await;
                let Some(record) = state.registry.get_mut(&kernel_id) else {
                    return Err(AgentError::UnknownKernel(kernel_id));
                };
                record.last_used = Instant::now();
                record.num_queries += 1;
                (
                    record.container_ip,
                    record.repl_in_port,
                    record.repl_out_port,
                    record.runner.is_some(),
                    workdir_path(&self.volume_root, kernel_id),
                )
            };

            let (runner, exec_timeout_s) = if !had_runner {
                let snapshot = WorkdirSnapshot::scan(&workdir).unwrap_or_default();
                let handle = Arc::new(RelayHandle::connect(repl_ip, repl_in, repl_out).await?);
                handle
                    .send(RunnerRequest::Start {
                        code_id: code_id.to_string(),
                        code: code.to_string(),
                        features: vec!["input", "continuation"],
                    })
                    .await?;
                let mut state = self.state.lock().await;
                let Some(record) = state.registry.get_mut(&kernel_id) else {
                    return Err(AgentError::UnknownKernel(kernel_id));
                };
                record.runner = Some(handle.clone());
                record.initial_files = Some(snapshot);
                (handle, record.exec_timeout_s)
            } else {
                let state = self.state.lock().await;
                let Some(record) = state.registry.get(&kernel_id) else {
                    return Err(AgentError::UnknownKernel(kernel_id));
                };
                let Some(runner) = record.runner.clone() else {
                    return Ok(None);
                };
                runner
                    .send(RunnerRequest::Continue { code_id: code_id.to_string(), code: code.to_string() })
                    .await?;
                (runner, record.exec_timeout_s)
            };

            (runner, exec_timeout_s, workdir)
        };
        // _guard dropped above: the wait below holds no per-kernel lock, so a
        // concurrent Destroy can abort and await it instead of queuing behind it.

        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        let wait_cancel = cancel.clone();
        let wait_runner = runner.clone();
        let wait_task = tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = wait_cancel.cancelled() => None,
                _ = tokio::time::sleep(Duration::from_secs(exec_timeout_s.max(1))) => {
                    Some(crate::relay::RunnerResult { status: STATUS_EXEC_TIMEOUT.to_string(), ..Default::default() })
                }
                result = wait_runner.recv_or_cancel(&wait_cancel) => result,
            };
            let _ = result_tx.send(result);
        });

        {
            let mut state = self.state.lock().await;
            if let Some(record) = state.registry.get_mut(&kernel_id) {
                record.runner_task = Some(wait_task);
            }
        }

        // If Destroy aborts wait_task concurrently, result_tx is dropped
        // without sending and this resolves to None, same as a local cancel.
        let result = result_rx.await.ok().flatten();

        {
            let mut state = self.state.lock().await;
            if let Some(record) = state.registry.get_mut(&kernel_id) {
                record.runner_task = None;
            }
        }

        let Some(result) = result else {
            // Cancellation, local or Destroy-driven: close the relay if it's
            // still ours and fabricate no result.
            let mut state = self.state.lock().await;
            if let Some(record) = state.registry.get_mut(&kernel_id) {
                if let Some(runner) = record.runner.take() {
                    runner.close();
                }
            }
            return Ok(None);
        };

        let terminal = result.status == STATUS_FINISHED || result.status == STATUS_EXEC_TIMEOUT;
        if terminal {
            let initial_files = {
                let mut state = self.state.lock().await;
                if let Some(record) = state.registry.get_mut(&kernel_id) {
                    if let Some(runner) = record.runner.take() {
                        runner.close();
                    }
                    record.initial_files.take()
                } else {
                    None
                }
            };

            if let Some(initial) = initial_files {
                let final_files = WorkdirSnapshot::scan(&workdir).unwrap_or_default();
                let suppress = result
                    .options
                    .get("skip_artifact_scan")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if !suppress {
                    let diff = WorkdirSnapshot::diff(&initial, &final_files);
                    if !diff.is_empty() {
                        self.artifact_sink.upload(entry_id, kernel_id, &workdir, &diff).await;
                    }
                }
            }
        }

        if result.status == STATUS_EXEC_TIMEOUT {
            let still_registered = self.state.lock().await.registry.contains(&kernel_id);
            if still_registered {
                self.destroy(kernel_id, "exec-timeout").await;
            }
        }

        let match_result = match match_spec {
            Some(spec) => Some(evaluate_match(&spec, &result)?),
            None => None,
        };

        Ok(Some(ExecuteCodeResult {
            stdout: result.stdout,
            stderr: result.stderr,
            status: result.status,
            media: result.media,
            html: result.html,
            options: result.options,
            files: result.files,
            match_result,
        }))
    }

    /// Idle-reap helper: kernels idle longer than `idle_timeout` (spec §4.6).
    pub async fn idle_kernels(&self, idle_timeout: Duration) -> Vec<KernelId> {
        let state = self.state.lock().await;
        let now = Instant::now();
        state
            .registry
            .iter()
            .filter(|(_, rec)| now.duration_since(rec.last_used) > idle_timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn upstream_sink(&self) -> &U {
        &self.upstream
    }

    pub fn stats_probe(&self) -> &S {
        &self.stats_probe
    }

    pub fn inst_id(&self) -> &str {
        &self.inst_id
    }

    pub async fn with_registry<R>(&self, f: impl FnOnce(&KernelRegistry) -> R) -> R {
        let state = self.state.lock().await;
        f(&state.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::NullArtifactSink;
    use crate::engine::{EngineError, EngineEvent, ImageLabels};
    use crate::stats::StatsSample;
    use crate::upstream::UpstreamSink;
    use futures_util::stream::BoxStream;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeEngine {
        next_port: AtomicU64,
    }

    #[async_trait]
    impl ContainerEngine for FakeEngine {
        async fn inspect_image(&self, _name: &str) -> Result<ImageLabels, EngineError> {
            Ok(ImageLabels { maxmem: Some("128m".into()), timeout: Some(10), maxcores: Some(1), corecount_envs: vec![], nvidia_enabled: false, version: Some(1) })
        }
        async fn create(&self, _spec: ContainerSpec) -> Result<ContainerHandle, EngineError> {
            Ok(ContainerHandle { id: "fake-container".into() })
        }
        async fn start(&self, _handle: &ContainerHandle) -> Result<(), EngineError> {
            Ok(())
        }
        async fn kill(&self, _handle: &ContainerHandle) -> Result<(), EngineError> {
            Ok(())
        }
        async fn delete(&self, _handle: &ContainerHandle) -> Result<(), EngineError> {
            Ok(())
        }
        async fn port_of(&self, _handle: &ContainerHandle, _container_port: u16) -> Result<u16, EngineError> {
            Ok(self.next_port.fetch_add(1, Ordering::SeqCst) as u16 + 10000)
        }
        async fn container_ip(&self, _handle: &ContainerHandle) -> Result<IpAddr, EngineError> {
            Ok(IpAddr::V4(Ipv4Addr::LOCALHOST))
        }
        async fn list_volumes(&self) -> Result<Vec<String>, EngineError> {
            Ok(vec![])
        }
        fn events(&self) -> BoxStream<'static, EngineEvent> {
            Box::pin(futures_util::stream::empty())
        }
    }

    struct FakeStats;
    #[async_trait]
    impl StatsProbe for FakeStats {
        async fn sample(&self, _handle: &ContainerHandle) -> Option<StatsSample> {
            Some(StatsSample::default())
        }
    }

    struct FakeUpstream {
        events: tokio::sync::Mutex<Vec<UpstreamEvent>>,
    }
    #[async_trait]
    impl UpstreamSink for FakeUpstream {
        async fn send(&self, event: UpstreamEvent) -> Result<(), AgentError> {
            self.events.lock().await.push(event);
            Ok(())
        }
    }

    fn make_lifecycle() -> (KernelLifecycle<FakeEngine, NullArtifactSink, FakeStats, FakeUpstream, NoGpuHelper>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let topo = CoreTopology::discover();
        let lc = KernelLifecycle::new(
            Arc::new(FakeEngine { next_port: AtomicU64::new(0) }),
            Arc::new(NullArtifactSink),
            Arc::new(FakeStats),
            Arc::new(FakeUpstream { events: tokio::sync::Mutex::new(vec![]) }),
            Arc::new(NoGpuHelper),
            &topo,
            AliasTable::new(),
            dir.path().to_path_buf(),
            180,
            "test-instance".into(),
        );
        (lc, dir)
    }

    #[tokio::test]
    async fn create_then_destroy_removes_record_only_after_clean() {
        let (lc, _dir) = make_lifecycle();
        let (id, stdin, stdout) = lc.create("python3", None).await.unwrap();
        assert!(stdin >= 10000);
        assert!(stdout >= 10000);
        assert!(lc.with_registry(|r| r.contains(&id)).await);

        // Destroy kills but (per spec) does not remove the record itself.
        lc.destroy(id, "user-requested").await;
        assert!(lc.with_registry(|r| r.contains(&id)).await);

        // Clean is what finally releases the record and CoreSet.
        lc.clean(id).await;
        assert!(!lc.with_registry(|r| r.contains(&id)).await);

        // Idempotence: a second Clean is a no-op, not a panic.
        lc.clean(id).await;
    }

    #[tokio::test]
    async fn restart_of_nonexistent_kernel_fails_cleanly() {
        let (lc, _dir) = make_lifecycle();
        let bogus = KernelId::generate();
        let err = lc.restart(bogus).await.unwrap_err();
        assert!(matches!(err, AgentError::UnknownKernel(_)));
        assert!(!lc.with_registry(|r| r.restarting.contains_key(&bogus)).await);
    }

    #[tokio::test]
    async fn unsupported_language_is_rejected_before_any_allocation() {
        let (lc, _dir) = make_lifecycle();
        let err = lc.create("cobol", None).await.unwrap_err();
        assert!(matches!(err, AgentError::UnsupportedLang(_)));
        assert_eq!(lc.registry_ids().await.len(), 0);
    }

    /// An engine whose repl ports are real loopback listeners, so
    /// `RelayHandle::connect` has something to talk to.
    struct RelayEngine {
        in_port: u16,
        out_port: u16,
        timeout_s: u64,
    }

    #[async_trait]
    impl ContainerEngine for RelayEngine {
        async fn inspect_image(&self, _name: &str) -> Result<ImageLabels, EngineError> {
            Ok(ImageLabels { maxmem: Some("128m".into()), timeout: Some(self.timeout_s), maxcores: Some(1), corecount_envs: vec![], nvidia_enabled: false, version: Some(1) })
        }
        async fn create(&self, _spec: ContainerSpec) -> Result<ContainerHandle, EngineError> {
            Ok(ContainerHandle { id: "fake-container".into() })
        }
        async fn start(&self, _handle: &ContainerHandle) -> Result<(), EngineError> {
            Ok(())
        }
        async fn kill(&self, _handle: &ContainerHandle) -> Result<(), EngineError> {
            Ok(())
        }
        async fn delete(&self, _handle: &ContainerHandle) -> Result<(), EngineError> {
            Ok(())
        }
        async fn port_of(&self, _handle: &ContainerHandle, container_port: u16) -> Result<u16, EngineError> {
            Ok(match container_port {
                2002 => self.in_port,
                2003 => self.out_port,
                _ => 0,
            })
        }
        async fn container_ip(&self, _handle: &ContainerHandle) -> Result<IpAddr, EngineError> {
            Ok(IpAddr::V4(Ipv4Addr::LOCALHOST))
        }
        async fn list_volumes(&self) -> Result<Vec<String>, EngineError> {
            Ok(vec![])
        }
        fn events(&self) -> BoxStream<'static, EngineEvent> {
            Box::pin(futures_util::stream::empty())
        }
    }

    #[tokio::test]
    async fn execute_code_cancellation_clears_runner_for_a_clean_retry() {
        let in_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let out_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let in_port = in_listener.local_addr().unwrap().port();
        let out_port = out_listener.local_addr().unwrap().port();

        // Accepts both relay connections and holds them open without ever
        // answering, so the call has nothing to race against but the cancel.
        tokio::spawn(async move {
            let (_a, _) = in_listener.accept().await.unwrap();
            let (_b, _) = out_listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let dir = tempfile::tempdir().unwrap();
        let topo = CoreTopology::discover();
        let lc = KernelLifecycle::new(
            Arc::new(RelayEngine { in_port, out_port, timeout_s: 10 }),
            Arc::new(NullArtifactSink),
            Arc::new(FakeStats),
            Arc::new(FakeUpstream { events: tokio::sync::Mutex::new(vec![]) }),
            Arc::new(NoGpuHelper),
            &topo,
            AliasTable::new(),
            dir.path().to_path_buf(),
            180,
            "test-instance".into(),
        );

        let (id, _, _) = lc.create("python3", None).await.unwrap();

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });

        let result = lc.execute_code("entry-1", id, "code-1", "print(1)", None, cancel).await.unwrap();
        assert!(result.is_none());

        let runner_present = lc.with_registry(|r| r.get(&id).unwrap().runner.is_some()).await;
        assert!(!runner_present, "cancellation must clear the runner handle");
    }

    /// Regression test for the self-deadlock that used to occur here: an
    /// exec-timeout result used to make execute_code call destroy() while
    /// still holding the per-kernel guard that destroy() also wanted.
    #[tokio::test]
    async fn exec_timeout_triggers_self_destroy_without_deadlocking() {
        let in_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let out_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let in_port = in_listener.local_addr().unwrap().port();
        let out_port = out_listener.local_addr().unwrap().port();

        // Accepts both relay connections and never answers, so the exec
        // timeout (not a reply) is what resolves the wait.
        tokio::spawn(async move {
            let (_a, _) = in_listener.accept().await.unwrap();
            let (_b, _) = out_listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let dir = tempfile::tempdir().unwrap();
        let topo = CoreTopology::discover();
        let lc = KernelLifecycle::new(
            Arc::new(RelayEngine { in_port, out_port, timeout_s: 1 }),
            Arc::new(NullArtifactSink),
            Arc::new(FakeStats),
            Arc::new(FakeUpstream { events: tokio::sync::Mutex::new(vec![]) }),
            Arc::new(NoGpuHelper),
            &topo,
            AliasTable::new(),
            dir.path().to_path_buf(),
            180,
            "test-instance".into(),
        );

        let (id, _, _) = lc.create("python3", None).await.unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            lc.execute_code("entry-1", id, "code-1", "print(1)", None, CancellationToken::new()),
        )
        .await
        .expect("execute_code must return once the exec timeout fires, not hang")
        .unwrap();

        assert_eq!(result.unwrap().status, STATUS_EXEC_TIMEOUT);

        let runner_present = lc.with_registry(|r| r.get(&id).unwrap().runner.is_some()).await;
        assert!(!runner_present, "self-destroy on exec-timeout must clear the runner handle");
    }
}
