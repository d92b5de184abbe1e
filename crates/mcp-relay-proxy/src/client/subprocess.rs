//! Subprocess client transport (§4.3): spawns `command args...`, frames
//! JSON-RPC as newline-delimited text on stdin/stdout, surfaces stderr as
//! diagnostic [`TransportEvent::Stderr`]. Structured as a `ClientTransport`
//! object the Session Manager can connect/send/close independently of any
//! particular client, rather than a one-shot wrap-and-run function.

use async_trait::async_trait;
use mcp_relay_core::protocol::{self, Envelope};
use mcp_relay_core::transport::TransportError;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;

use super::{EventSender, TransportEvent};

pub struct SubprocessTransport {
    command: String,
    args: Vec<String>,
    shell: Option<String>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
}

impl SubprocessTransport {
    pub fn new(command: String, args: Vec<String>, shell: Option<String>) -> Self {
        Self {
            command,
            args,
            shell,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
        }
    }

    fn build_command(&self) -> Command {
        match &self.shell {
            Some(shell) => {
                let mut full = self.command.clone();
                for arg in &self.args {
                    full.push(' ');
                    full.push_str(arg);
                }
                let mut cmd = Command::new(shell);
                cmd.arg("-c").arg(full);
                cmd
            }
            None => {
                let mut cmd = Command::new(&self.command);
                cmd.args(&self.args);
                cmd
            }
        }
    }
}

#[async_trait]
impl super::ClientTransport for SubprocessTransport {
    async fn connect(&self, events: EventSender) -> Result<(), TransportError> {
        let mut cmd = self.build_command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::ConnectFailed("no child stdin".into()))?;
        let child_stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::ConnectFailed("no child stdout".into()))?;
        let child_stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::ConnectFailed("no child stderr".into()))?;

        *self.stdin.lock().await = Some(child_stdin);
        *self.child.lock().await = Some(child);

        let stdout_events = events.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(child_stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match protocol::decode(line.as_bytes()) {
                            Ok(envelope) => {
                                let _ = stdout_events.send(TransportEvent::Message(envelope));
                            }
                            Err(e) => {
                                tracing::warn!("subprocess stdout: malformed frame: {}", e);
                            }
                        }
                    }
                    Ok(None) => {
                        tracing::info!("subprocess stdout closed");
                        let _ = stdout_events.send(TransportEvent::Closed);
                        break;
                    }
                    Err(e) => {
                        tracing::error!("subprocess stdout read error: {}", e);
                        let _ = stdout_events.send(TransportEvent::Error(TransportError::Io(e)));
                        break;
                    }
                }
            }
        });

        let stderr_events = events;
        tokio::spawn(async move {
            let mut lines = BufReader::new(child_stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = stderr_events.send(TransportEvent::Stderr(line));
            }
        });

        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let mut line = protocol::encode(envelope);
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn close(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
        }
        self.stdin.lock().await.take();
    }
}

/// Convenience constructor used by the Session Manager when wiring a
/// connection's client transport from `TransportConfig::Subprocess`.
pub fn from_config(command: String, args: Vec<String>, shell: Option<String>) -> Arc<SubprocessTransport> {
    Arc::new(SubprocessTransport::new(command, args, shell))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_relay_core::protocol::Id;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn round_trips_a_request_and_surfaces_stderr() {
        let mut script = NamedTempFile::new().unwrap();
        writeln!(script, "read -r _line").unwrap();
        writeln!(script, "echo diagnostic >&2").unwrap();
        writeln!(script, r#"echo '{{"jsonrpc":"2.0","id":1,"result":{{}}}}'"#).unwrap();
        let path = script.path().to_path_buf();

        let transport = SubprocessTransport::new("sh".to_string(), vec![path.to_string_lossy().into_owned()], None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.connect(tx).await.unwrap();

        let request = Envelope::request(serde_json::json!(1), "ping", None);
        transport.send(&request).await.unwrap();

        let mut saw_stderr = false;
        let mut saw_response = false;
        for _ in 0..4 {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(TransportEvent::Stderr(line))) => {
                    saw_stderr = true;
                    assert_eq!(line, "diagnostic");
                }
                Ok(Some(TransportEvent::Message(envelope))) => {
                    saw_response = true;
                    assert_eq!(envelope.id, Some(Id::from(serde_json::json!(1))));
                }
                Ok(Some(TransportEvent::Closed)) if saw_response => break,
                _ => {}
            }
            if saw_stderr && saw_response {
                break;
            }
        }
        assert!(saw_stderr, "expected a Stderr event");
        assert!(saw_response, "expected the decoded response");

        transport.close().await;
    }
}
