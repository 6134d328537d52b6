//! Isolated execution contexts for plugins.
//!
//! The production runtime spawns the plugin entry as a child process with a
//! cleared environment and rlimit ceilings, talking length-prefixed frames
//! over piped stdio. The trait seam exists so tests can run an in-process
//! loopback instead of forking.

use crate::protocol::{self, Frame};
use async_trait::async_trait;
use autoweave_core::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Everything needed to start one isolate
#[derive(Debug, Clone)]
pub struct IsolateSpec {
    pub plugin_id: String,
    /// Absolute path to the plugin's executable artifact
    pub entry: PathBuf,
    /// Plugin directory; becomes the child's working directory
    pub working_dir: PathBuf,
    /// The only environment the child sees
    pub env: HashMap<String, String>,
    pub max_memory_bytes: Option<u64>,
    pub max_cpu_seconds: Option<u64>,
    pub max_open_files: Option<u64>,
}

/// How an isolate ended
#[derive(Debug, Clone, Copy)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub killed: bool,
}

/// Live connection to one isolate
pub struct IsolateHandle {
    /// Raw frame bodies host -> isolate
    pub outbound: mpsc::Sender<Vec<u8>>,
    /// Raw frame bodies isolate -> host
    pub inbound: mpsc::Receiver<Vec<u8>>,
    /// Resolves once the isolate has exited
    pub exited: oneshot::Receiver<ExitInfo>,
    /// Cancel to terminate the isolate without grace
    pub kill: CancellationToken,
}

/// Factory for isolated execution contexts
#[async_trait]
pub trait PluginRuntime: Send + Sync {
    async fn spawn(&self, spec: IsolateSpec) -> Result<IsolateHandle>;
}

/// Child-process runtime with piped stdio
pub struct ProcessRuntime {
    /// Buffered frames per direction before backpressure
    channel_depth: usize,
}

impl ProcessRuntime {
    pub fn new() -> Self {
        Self { channel_depth: 64 }
    }
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PluginRuntime for ProcessRuntime {
    async fn spawn(&self, spec: IsolateSpec) -> Result<IsolateHandle> {
        let mut command = Command::new(&spec.entry);
        command
            .current_dir(&spec.working_dir)
            .env_clear()
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        apply_rlimits(&mut command, &spec);

        let mut child = command.spawn().map_err(|e| {
            Error::plugin(&spec.plugin_id, format!("failed to spawn isolate: {e}"))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::plugin(&spec.plugin_id, "isolate stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::plugin(&spec.plugin_id, "isolate stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::plugin(&spec.plugin_id, "isolate stderr unavailable"))?;

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.channel_depth);
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(self.channel_depth);
        let (exit_tx, exit_rx) = oneshot::channel();
        let kill = CancellationToken::new();

        let plugin_id = spec.plugin_id.clone();
        tokio::spawn(async move {
            while let Some(body) = out_rx.recv().await {
                if let Err(e) = protocol::write_frame(&mut stdin, &body).await {
                    tracing::debug!(plugin_id = %plugin_id, error = %e, "Isolate stdin closed");
                    break;
                }
            }
        });

        let plugin_id = spec.plugin_id.clone();
        tokio::spawn(async move {
            let mut reader = stdout;
            loop {
                match protocol::read_frame(&mut reader).await {
                    Ok(Some(body)) => {
                        if in_tx.send(body).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(plugin_id = %plugin_id, error = %e, "Isolate stdout error");
                        break;
                    }
                }
            }
        });

        let plugin_id = spec.plugin_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(plugin_id = %plugin_id, "{line}");
            }
        });

        let plugin_id = spec.plugin_id.clone();
        let kill_child = kill.clone();
        tokio::spawn(async move {
            let exited = tokio::select! {
                _ = kill_child.cancelled() => None,
                status = child.wait() => Some(status),
            };
            let info = match exited {
                Some(status) => ExitInfo {
                    code: status.ok().and_then(|s| s.code()),
                    killed: false,
                },
                None => {
                    let _ = child.start_kill();
                    let status = child.wait().await;
                    ExitInfo {
                        code: status.ok().and_then(|s| s.code()),
                        killed: true,
                    }
                }
            };
            tracing::debug!(
                plugin_id = %plugin_id,
                code = ?info.code,
                killed = info.killed,
                "Isolate exited"
            );
            let _ = exit_tx.send(info);
        });

        Ok(IsolateHandle {
            outbound: out_tx,
            inbound: in_rx,
            exited: exit_rx,
            kill,
        })
    }
}

#[cfg(target_os = "linux")]
fn apply_rlimits(command: &mut Command, spec: &IsolateSpec) {
    let memory = spec.max_memory_bytes;
    let cpu = spec.max_cpu_seconds;
    let files = spec.max_open_files;

    unsafe {
        command.pre_exec(move || {
            if let Some(bytes) = memory {
                set_limit(libc::RLIMIT_AS, bytes)?;
            }
            if let Some(seconds) = cpu {
                set_limit(libc::RLIMIT_CPU, seconds)?;
            }
            if let Some(count) = files {
                set_limit(libc::RLIMIT_NOFILE, count)?;
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_rlimits(_command: &mut Command, _spec: &IsolateSpec) {}

#[cfg(target_os = "linux")]
fn set_limit(resource: libc::__rlimit_resource_t, value: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };
    // Safety: limit is a valid rlimit struct for the duration of the call.
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// In-process runtime for tests: a task that answers every request with an
/// ok reply echoing the request data, and swallows events.
pub struct LoopbackRuntime {
    channel_depth: usize,
}

impl LoopbackRuntime {
    pub fn new() -> Self {
        Self { channel_depth: 64 }
    }
}

impl Default for LoopbackRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PluginRuntime for LoopbackRuntime {
    async fn spawn(&self, spec: IsolateSpec) -> Result<IsolateHandle> {
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.channel_depth);
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(self.channel_depth);
        let (exit_tx, exit_rx) = oneshot::channel();
        let kill = CancellationToken::new();

        let kill_task = kill.clone();
        let plugin_id = spec.plugin_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = kill_task.cancelled() => {
                        let _ = exit_tx.send(ExitInfo { code: None, killed: true });
                        return;
                    }
                    body = out_rx.recv() => {
                        let Some(body) = body else {
                            let _ = exit_tx.send(ExitInfo { code: Some(0), killed: false });
                            return;
                        };
                        let Ok(frame) = Frame::decode(&body) else {
                            tracing::debug!(plugin_id = %plugin_id, "Loopback got undecodable frame");
                            continue;
                        };
                        if let Frame::Request { id, data, .. } = frame {
                            let reply = Frame::Reply { id, ok: true, data };
                            if in_tx.send(reply.encode()).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(IsolateHandle {
            outbound: out_tx,
            inbound: in_rx,
            exited: exit_rx,
            kill,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> IsolateSpec {
        IsolateSpec {
            plugin_id: "loopback".to_string(),
            entry: PathBuf::from("/dev/null"),
            working_dir: PathBuf::from("."),
            env: HashMap::new(),
            max_memory_bytes: None,
            max_cpu_seconds: None,
            max_open_files: None,
        }
    }

    #[tokio::test]
    async fn test_loopback_replies_to_requests() {
        let runtime = LoopbackRuntime::new();
        let mut handle = runtime.spawn(spec()).await.unwrap();

        let request = Frame::Request {
            id: 1,
            message_type: "initialize".to_string(),
            data: json!({"config": {}}),
        };
        handle.outbound.send(request.encode()).await.unwrap();

        let body = handle.inbound.recv().await.unwrap();
        match Frame::decode(&body).unwrap() {
            Frame::Reply { id, ok, .. } => {
                assert_eq!(id, 1);
                assert!(ok);
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_loopback_kill_reports_exit() {
        let runtime = LoopbackRuntime::new();
        let handle = runtime.spawn(spec()).await.unwrap();

        handle.kill.cancel();
        let info = handle.exited.await.unwrap();
        assert!(info.killed);
    }

    #[tokio::test]
    async fn test_loopback_eof_reports_clean_exit() {
        let runtime = LoopbackRuntime::new();
        let handle = runtime.spawn(spec()).await.unwrap();

        drop(handle.outbound);
        let info = handle.exited.await.unwrap();
        assert!(!info.killed);
        assert_eq!(info.code, Some(0));
    }
}
