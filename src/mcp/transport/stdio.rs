//! Process transport: a child process spoken to over stdin/stdout
//!
//! Requests are written to the child's stdin as newline-terminated JSON. A line
//! reader on stdout feeds decoded messages into the read stream. Stderr is
//! diagnostic output only: it is logged with the session identity and never
//! decoded. A monitor task owns the child; when the child exits on its own the
//! monitor pushes `ProcessExited` into the read stream.

use super::{channel_sink, MCPTransport, TransportInfo, TransportStreams};
use crate::mcp::codec::{decode_frame, encode_frame};
use crate::mcp::error::MCPOperationError;
use crate::mcp::types::MCPMessage;
use crate::utils::logging::truncate_string;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Longest stderr line that is logged verbatim
const MAX_STDERR_LOG_CHARS: usize = 2_000;

/// Configuration for process-based tool servers
#[derive(Debug, Clone)]
pub struct StdioConfig {
    /// Command to execute
    pub command: String,
    /// Command arguments
    pub args: Vec<String>,
    /// Working directory for the process
    pub working_dir: Option<PathBuf>,
    /// Environment variables to set
    pub env_vars: HashMap<String, String>,
    /// How long a stopping process gets to exit before it is killed
    pub shutdown_grace: Duration,
    /// Session identity used in log lines
    pub label: String,
}

impl Default for StdioConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            working_dir: None,
            env_vars: HashMap::new(),
            shutdown_grace: Duration::from_secs(2),
            label: "stdio".to_string(),
        }
    }
}

/// Stdio transport implementation
pub struct StdioTransport {
    config: StdioConfig,
    connected: Arc<AtomicBool>,
    started: bool,
    stop_sender: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl StdioTransport {
    pub fn new(config: StdioConfig) -> Self {
        Self {
            config,
            connected: Arc::new(AtomicBool::new(false)),
            started: false,
            stop_sender: None,
            monitor: None,
            writer: None,
        }
    }
}

#[async_trait]
impl MCPTransport for StdioTransport {
    async fn connect(&mut self) -> Result<TransportStreams, MCPOperationError> {
        if self.started {
            return Err(MCPOperationError::transport(
                "Stdio transport cannot be reconnected; create a new one",
            ));
        }
        if self.config.command.is_empty() {
            return Err(MCPOperationError::stdio("Command cannot be empty"));
        }

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.config.env_vars {
            cmd.env(key, value);
        }

        let label = self.config.label.clone();
        debug!(
            session = %label,
            command = %self.config.command,
            args = ?self.config.args,
            env_keys = ?self.config.env_vars.keys().collect::<Vec<_>>(),
            "Spawning tool server process"
        );

        self.started = true;
        let mut child = cmd.spawn().map_err(|e| {
            MCPOperationError::stdio(format!(
                "Failed to spawn process '{}': {}",
                self.config.command, e
            ))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| MCPOperationError::stdio("Failed to get stdin handle"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MCPOperationError::stdio("Failed to get stdout handle"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MCPOperationError::stdio("Failed to get stderr handle"))?;

        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<MCPMessage>();
        let (stop_tx, stop_rx) = oneshot::channel();

        // Stdout: one message per line, noise dropped
        let reader_tx = read_tx.clone();
        let reader_label = label.clone();
        let reader = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        if let Some(message) = decode_frame(&line) {
                            if reader_tx.send(Ok(message)).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        debug!(session = %reader_label, error = %e, "Error reading from stdout");
                        break;
                    }
                }
            }
        });

        // Stderr: diagnostics only
        let stderr_label = label.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end();
                        if !line.is_empty() {
                            info!(
                                session = %stderr_label,
                                "[stderr] {}",
                                truncate_string(line, MAX_STDERR_LOG_CHARS)
                            );
                        }
                    }
                }
            }
        });

        let writer_label = label.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = write_rx.recv().await {
                let line = match encode_frame(&message) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(session = %writer_label, error = %e, "Skipping unencodable message");
                        continue;
                    }
                };
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    debug!(session = %writer_label, error = %e, "Process stdin closed");
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        let connected = Arc::clone(&self.connected);
        let grace = self.config.shutdown_grace;
        let monitor = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let code = status.ok().and_then(|s| s.code());
                    connected.store(false, Ordering::SeqCst);
                    warn!(session = %label, exit_code = ?code, "Tool server process exited");
                    // Deliver whatever the process printed before dying
                    let _ = tokio::time::timeout(grace, reader).await;
                    let _ = read_tx.send(Err(MCPOperationError::process_exited(code)));
                }
                _ = stop_rx => {
                    terminate_gracefully(&mut child, grace, &label).await;
                    connected.store(false, Ordering::SeqCst);
                }
            }
        });

        self.stop_sender = Some(stop_tx);
        self.monitor = Some(monitor);
        self.writer = Some(writer);
        self.connected.store(true, Ordering::SeqCst);

        Ok(TransportStreams {
            read_stream: Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(read_rx)),
            write_stream: channel_sink(write_tx),
        })
    }

    async fn disconnect(&mut self) -> Result<(), MCPOperationError> {
        // Closing stdin is the first cooperative signal
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(stop) = self.stop_sender.take() {
            let _ = stop.send(());
        }
        if let Some(monitor) = self.monitor.take() {
            if let Err(e) = monitor.await {
                debug!(session = %self.config.label, error = %e, "Process monitor ended abnormally");
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn transport_info(&self) -> TransportInfo {
        let endpoint = if self.config.args.is_empty() {
            self.config.command.clone()
        } else {
            format!("{} {}", self.config.command, self.config.args.join(" "))
        };
        TransportInfo {
            transport_type: "stdio".to_string(),
            endpoint,
        }
    }
}

/// Ask the process to exit, then kill it once the grace period runs out
async fn terminate_gracefully(child: &mut Child, grace: Duration, label: &str) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: the pid belongs to our own child, which has not been reaped yet
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(session = %label, exit_code = ?status.code(), "Tool server process stopped");
        }
        _ => {
            warn!(session = %label, grace_ms = grace.as_millis() as u64, "Tool server did not exit in time, killing");
            if let Err(e) = child.kill().await {
                warn!(session = %label, error = %e, "Failed to kill tool server process");
            }
        }
    }
}
