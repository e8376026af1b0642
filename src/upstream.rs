// src/upstream.rs — upstream event dispatch (spec §5, §6.1)
//
// The manager-facing transport itself is out of scope (spec §1); this models
// only the operation the core needs: fire-and-forget dispatch of a tagged
// event with a bounded timeout, tolerating failure by logging and dropping.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::AgentError;

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum UpstreamEvent {
    #[serde(rename = "instance_started")]
    InstanceStarted { inst_id: String },
    #[serde(rename = "instance_terminated")]
    InstanceTerminated { inst_id: String, reason: String },
    #[serde(rename = "instance_heartbeat")]
    InstanceHeartbeat {
        inst_id: String,
        summary: Value,
        running_kernel_ids: Vec<String>,
        interval: u64,
    },
    #[serde(rename = "instance_stats")]
    InstanceStats {
        inst_id: String,
        per_kernel: Value,
        interval: u64,
    },
    #[serde(rename = "kernel_creating")]
    KernelCreating { kernel_id: String },
    #[serde(rename = "kernel_restarting")]
    KernelRestarting { kernel_id: String },
    #[serde(rename = "kernel_terminated")]
    KernelTerminated {
        kernel_id: String,
        reason: String,
        last_stat: Value,
    },
}

/// Shared upstream event channel (spec §5: "fire-and-forget with a bounded timeout").
#[async_trait]
pub trait UpstreamSink: Send + Sync {
    async fn send(&self, event: UpstreamEvent) -> Result<(), AgentError>;
}

/// Dispatches `event`, applying the 1 s timeout and logging-and-dropping on
/// failure rather than propagating (spec §5, §7 `UpstreamUnavailable`).
pub async fn dispatch(sink: &dyn UpstreamSink, event: UpstreamEvent) {
    match tokio::time::timeout(DISPATCH_TIMEOUT, sink.send(event)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "upstream dispatch failed"),
        Err(_) => warn!("upstream dispatch timed out after {:?}", DISPATCH_TIMEOUT),
    }
}

/// Upstream client modeling the manager-facing event endpoint as a plain TCP
/// connection; only used by the real `main.rs` wiring.
pub struct TcpUpstreamSink {
    addr: std::net::SocketAddr,
}

impl TcpUpstreamSink {
    pub fn new(addr: std::net::SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl UpstreamSink for TcpUpstreamSink {
    async fn send(&self, event: UpstreamEvent) -> Result<(), AgentError> {
        use tokio::io::AsyncWriteExt;

        let mut stream = tokio::net::TcpStream::connect(self.addr)
            .await
            .map_err(AgentError::Io)?;
        let payload = serde_json::to_vec(&event)
            .map_err(|e| AgentError::UpstreamUnavailable(e.to_string()))?;
        stream.write_all(&payload).await.map_err(AgentError::Io)?;
        stream.write_all(b"\n").await.map_err(AgentError::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl UpstreamSink for CountingSink {
        async fn send(&self, _event: UpstreamEvent) -> Result<(), AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(AgentError::UpstreamUnavailable("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn dispatch_does_not_panic_on_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = CountingSink { calls: calls.clone(), fail: true };
        dispatch(&sink, UpstreamEvent::KernelCreating { kernel_id: "x".into() }).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_succeeds_normally() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = CountingSink { calls: calls.clone(), fail: false };
        dispatch(&sink, UpstreamEvent::KernelCreating { kernel_id: "x".into() }).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
