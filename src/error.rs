// src/error.rs — agent-wide error kinds (spec §7)

use thiserror::Error;

use crate::id::KernelId;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unsupported language: {0}")]
    UnsupportedLang(String),

    #[error("image inspect failed for '{image}': {source}")]
    ImageInspectFailed {
        image: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("restart of {0} timed out waiting for previous container to die")]
    RestartTimeout(KernelId),

    #[error("transient engine error: {0}")]
    EngineTransient(String),

    #[error("upstream dispatch unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("invalid match specification: {0}")]
    InvalidMatch(String),

    #[error("kernel {0} not found")]
    UnknownKernel(KernelId),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("container engine call failed: {0}")]
    EngineCall(String),
}

pub type AgentResult<T> = Result<T, AgentError>;
