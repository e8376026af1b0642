// src/config.rs — CLI / configuration surface (spec §6.3)

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "kernel-agentd",
    version,
    about = "Compute-node agent: kernel lifecycle and resource allocation"
)]
pub struct Cli {
    /// Advertised address; auto-detected if omitted.
    #[arg(long = "agent-ip", env = "AGENT_IP")]
    pub agent_ip: Option<IpAddr>,

    /// RPC listen port.
    #[arg(long = "agent-port", env = "AGENT_PORT", default_value_t = 6001)]
    pub agent_port: u16,

    /// Upstream event endpoint.
    #[arg(long = "event-addr", env = "EVENT_ADDR", default_value = "127.0.0.1:5002")]
    pub event_addr: String,

    /// Per-execution cap, in seconds.
    #[arg(long = "exec-timeout", env = "EXEC_TIMEOUT", default_value_t = 180)]
    pub exec_timeout: u64,

    /// Idle reap threshold, in seconds.
    #[arg(long = "idle-timeout", env = "IDLE_TIMEOUT", default_value_t = 600)]
    pub idle_timeout: u64,

    /// Advisory capacity.
    #[arg(long = "max-kernels", env = "MAX_KERNELS", default_value_t = 1)]
    pub max_kernels: usize,

    /// Scratch root; must exist and be a directory.
    #[arg(long = "volume-root", env = "VOLUME_ROOT", default_value = "/var/lib/kernel-agentd/volumes")]
    pub volume_root: PathBuf,

    /// File mapping alias -> canonical language name.
    #[arg(long = "kernel-aliases", env = "KERNEL_ALIASES")]
    pub kernel_aliases: Option<PathBuf>,

    /// Verbose logging.
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

impl Cli {
    pub fn tracing_filter(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }

    pub fn validate(&self) -> Result<(), crate::error::AgentError> {
        if !self.volume_root.is_dir() {
            return Err(crate::error::AgentError::Config(format!(
                "volume-root '{}' does not exist or is not a directory",
                self.volume_root.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cli = Cli::parse_from(["kernel-agentd"]);
        assert_eq!(cli.agent_port, 6001);
        assert_eq!(cli.event_addr, "127.0.0.1:5002");
        assert_eq!(cli.exec_timeout, 180);
        assert_eq!(cli.idle_timeout, 600);
        assert_eq!(cli.max_kernels, 1);
        assert!(!cli.debug);
    }

    #[test]
    fn validate_rejects_missing_volume_root() {
        let mut cli = Cli::parse_from(["kernel-agentd"]);
        cli.volume_root = PathBuf::from("/nonexistent/definitely/not/here");
        assert!(cli.validate().is_err());
    }
}
