// src/rpc.rs — RPC façade: maps manager-facing requests onto KernelLifecycle (spec §4.7, §6.1)

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::artifact::ArtifactSink;
use crate::engine::ContainerEngine;
use crate::error::AgentResult;
use crate::id::KernelId;
use crate::lifecycle::{KernelLifecycle, NvidiaHelper};
use crate::relay::{ExecuteCodeResult, MatchSpec};
use crate::stats::StatsProbe;
use crate::upstream::UpstreamSink;

#[derive(Debug, Deserialize)]
pub struct CreateKernelRequest {
    pub lang: String,
    #[serde(default)]
    pub opts: HashMap<String, Value>,
}

#[derive(Debug, Serialize)]
pub struct CreateKernelResponse {
    pub kernel_id: String,
    pub stdin_port: u16,
    pub stdout_port: u16,
}

#[derive(Debug, Serialize)]
pub struct RestartKernelResponse {
    pub stdin_port: u16,
    pub stdout_port: u16,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteCodeRequest {
    pub entry_id: String,
    pub kernel_id: String,
    pub code_id: String,
    pub code: String,
    #[serde(rename = "match")]
    pub match_spec: Option<MatchSpec>,
}

/// Thin mapping layer; the only logic of its own is lang alias resolution,
/// which it delegates straight to KernelLifecycle (spec §4.7).
pub struct RpcFacade<E, A, S, U, N> {
    lifecycle: Arc<KernelLifecycle<E, A, S, U, N>>,
}

impl<E, A, S, U, N> RpcFacade<E, A, S, U, N>
where
    E: ContainerEngine + 'static,
    A: ArtifactSink + 'static,
    S: StatsProbe + 'static,
    U: UpstreamSink + 'static,
    N: NvidiaHelper + 'static,
{
    pub fn new(lifecycle: Arc<KernelLifecycle<E, A, S, U, N>>) -> Self {
        Self { lifecycle }
    }

    pub async fn ping(&self, msg: String) -> String {
        msg
    }

    pub async fn create_kernel(&self, req: CreateKernelRequest) -> AgentResult<CreateKernelResponse> {
        let (id, stdin_port, stdout_port) = self.lifecycle.create(&req.lang, None).await?;
        Ok(CreateKernelResponse { kernel_id: id.to_string(), stdin_port, stdout_port })
    }

    pub async fn destroy_kernel(&self, kernel_id: &str) -> AgentResult<()> {
        let id = parse_kernel_id(kernel_id)?;
        self.lifecycle.destroy(id, "user-requested").await;
        Ok(())
    }

    pub async fn restart_kernel(&self, kernel_id: &str) -> AgentResult<RestartKernelResponse> {
        let id = parse_kernel_id(kernel_id)?;
        let (stdin_port, stdout_port) = self.lifecycle.restart(id).await?;
        Ok(RestartKernelResponse { stdin_port, stdout_port })
    }

    pub async fn execute_code(
        &self,
        req: ExecuteCodeRequest,
        cancel: CancellationToken,
    ) -> AgentResult<Option<ExecuteCodeResult>> {
        let id = parse_kernel_id(&req.kernel_id)?;
        self.lifecycle
            .execute_code(&req.entry_id, id, &req.code_id, &req.code, req.match_spec, cancel)
            .await
    }

    pub async fn reset(&self) {
        self.lifecycle.reset().await;
    }
}

fn parse_kernel_id(raw: &str) -> AgentResult<KernelId> {
    KernelId::parse(raw).ok_or_else(|| crate::error::AgentError::Config(format!("malformed kernel id: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kernel_id_rejects_garbage() {
        assert!(parse_kernel_id("not-hex").is_err());
    }

    #[test]
    fn parse_kernel_id_accepts_round_tripped_id() {
        let id = KernelId::generate();
        assert_eq!(parse_kernel_id(&id.to_string()).unwrap(), id);
    }
}
