// src/relay.rs — ExecutionRelay: per-kernel REPL relay (spec §4.4)

use std::net::IpAddr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;

/// Request fed to the in-container runner over `repl_in_port`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op")]
pub enum RunnerRequest {
    #[serde(rename = "start")]
    Start {
        code_id: String,
        code: String,
        features: Vec<&'static str>,
    },
    #[serde(rename = "continue")]
    Continue { code_id: String, code: String },
}

/// Result read back from `repl_out_port`.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RunnerResult {
    pub stdout: String,
    pub stderr: String,
    pub status: String,
    pub media: Option<Value>,
    pub html: Option<String>,
    #[serde(default)]
    pub options: Value,
    #[serde(default)]
    pub files: Vec<String>,
    pub exception: Option<String>,
}

pub const STATUS_FINISHED: &str = "finished";
pub const STATUS_EXEC_TIMEOUT: &str = "exec-timeout";

/// A live relay connection to one kernel's in-container runner. Owns exactly
/// one inbound and one outbound stream (spec §4.4).
pub struct RelayHandle {
    requests: mpsc::Sender<RunnerRequest>,
    results: Mutex<mpsc::Receiver<RunnerResult>>,
    cancel: CancellationToken,
    io_task: tokio::task::JoinHandle<()>,
}

impl RelayHandle {
    /// Opens the relay's two TCP connections and spawns the task that shuttles
    /// requests/results between them and in-process channels.
    pub async fn connect(ip: IpAddr, in_port: u16, out_port: u16) -> Result<Self, AgentError> {
        let in_stream = TcpStream::connect((ip, in_port)).await.map_err(AgentError::Io)?;
        let out_stream = TcpStream::connect((ip, out_port)).await.map_err(AgentError::Io)?;

        let (req_tx, mut req_rx) = mpsc::channel::<RunnerRequest>(4);
        let (res_tx, res_rx) = mpsc::channel::<RunnerResult>(4);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let io_task = tokio::spawn(async move {
            let (out_read, mut in_write) = (out_stream, in_stream);
            let mut reader = BufReader::new(out_read).lines();

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    maybe_req = req_rx.recv() => {
                        let Some(req) = maybe_req else { break };
                        let Ok(mut line) = serde_json::to_vec(&req) else { continue };
                        line.push(b'\n');
                        if in_write.write_all(&line).await.is_err() {
                            break;
                        }
                    }
                    line = reader.next_line() => {
                        match line {
                            Ok(Some(text)) => {
                                if let Ok(result) = serde_json::from_str::<RunnerResult>(&text) {
                                    if res_tx.send(result).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            _ => break,
                        }
                    }
                }
            }
        });

        Ok(Self {
            requests: req_tx,
            results: Mutex::new(res_rx),
            cancel,
            io_task,
        })
    }

    pub async fn send(&self, req: RunnerRequest) -> Result<(), AgentError> {
        self.requests
            .send(req)
            .await
            .map_err(|_| AgentError::EngineTransient("relay closed".into()))
    }

    /// Awaits the next result, or `None` if cancelled first.
    pub async fn recv_or_cancel(&self, cancel: &CancellationToken) -> Option<RunnerResult> {
        let mut results = self.results.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => None,
            result = results.recv() => result,
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.io_task.abort();
    }
}

/// A `{op, target, value}` match specification evaluated against an exec result (spec §4.4).
#[derive(Debug, Clone, Deserialize)]
pub struct MatchSpec {
    pub op: String,
    pub target: String,
    pub value: String,
}

pub fn evaluate_match(spec: &MatchSpec, result: &RunnerResult) -> Result<bool, AgentError> {
    let haystack: String = match spec.target.as_str() {
        "stdout" => result.stdout.clone(),
        "stderr" => result.stderr.clone(),
        "exception" => match &result.exception {
            Some(e) => e.clone(),
            None => return Ok(false),
        },
        other => {
            return Err(AgentError::InvalidMatch(format!("unknown target '{other}'")))
        }
    };

    match spec.op.as_str() {
        "contains" => Ok(haystack.contains(&spec.value)),
        "equal" => Ok(haystack == spec.value),
        "regex" => {
            let re = Regex::new(&spec.value)
                .map_err(|e| AgentError::InvalidMatch(format!("bad regex: {e}")))?;
            Ok(re.is_match(&haystack))
        }
        other => Err(AgentError::InvalidMatch(format!("unknown op '{other}'"))),
    }
}

/// Result handed back to the RPC caller for `execute_code` (spec §4.4 step 7).
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteCodeResult {
    pub stdout: String,
    pub stderr: String,
    pub status: String,
    pub media: Option<Value>,
    pub html: Option<String>,
    pub options: Value,
    pub files: Vec<String>,
    pub match_result: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(stdout: &str, stderr: &str, exception: Option<&str>) -> RunnerResult {
        RunnerResult {
            stdout: stdout.into(),
            stderr: stderr.into(),
            status: STATUS_FINISHED.into(),
            exception: exception.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn contains_match_on_stdout() {
        let spec = MatchSpec { op: "contains".into(), target: "stdout".into(), value: "hello".into() };
        let result = result_with("hello world", "", None);
        assert!(evaluate_match(&spec, &result).unwrap());
    }

    #[test]
    fn regex_match_anchored() {
        let spec = MatchSpec { op: "regex".into(), target: "stdout".into(), value: "^hello".into() };
        let result = result_with("hello world", "", None);
        assert!(evaluate_match(&spec, &result).unwrap());
    }

    #[test]
    fn exception_target_with_no_exception_is_false() {
        let spec = MatchSpec { op: "equal".into(), target: "exception".into(), value: "NameError".into() };
        let result = result_with("", "", None);
        assert!(!evaluate_match(&spec, &result).unwrap());
    }

    #[test]
    fn unknown_op_is_invalid_match() {
        let spec = MatchSpec { op: "fuzzy".into(), target: "stdout".into(), value: "x".into() };
        let result = result_with("x", "", None);
        assert!(matches!(evaluate_match(&spec, &result), Err(AgentError::InvalidMatch(_))));
    }

    #[test]
    fn unknown_target_is_invalid_match() {
        let spec = MatchSpec { op: "contains".into(), target: "weird".into(), value: "x".into() };
        let result = result_with("x", "", None);
        assert!(matches!(evaluate_match(&spec, &result), Err(AgentError::InvalidMatch(_))));
    }
}
