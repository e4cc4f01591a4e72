//! Server process connector - runs an ingestion service as a child process
//! and speaks the framed protocol over its stdin/stdout.
//!
//! The child is killed when the read side of the channel is dropped.

use crate::error::{IngestError, Result};
use crate::streaming::channel::{Duplex, DuplexConnector};
use crate::transport::framed::framed_duplex;
use async_trait::async_trait;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::{Child, ChildStdout, Command};

/// Spawns `program args...` for every channel
pub struct ServerCommand {
    program: String,
    args: Vec<String>,
}

impl ServerCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a command line on whitespace (no shell quoting)
    pub fn parse(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| IngestError::Config("Empty server command".into()))?;
        Ok(Self::new(program, parts.collect()))
    }
}

/// Child stdout that owns the child process
struct ChildReader {
    stdout: ChildStdout,
    _child: Child,
}

impl AsyncRead for ChildReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_read(cx, buf)
    }
}

#[async_trait]
impl DuplexConnector for ServerCommand {
    /// The endpoint, if any, is passed to the server as its last argument.
    async fn open(&self, endpoint: Option<&str>) -> Result<Duplex> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(endpoint) = endpoint {
            cmd.arg(endpoint);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            IngestError::Transport(format!("Failed to spawn {}: {}", self.program, e))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| IngestError::transport("Failed to open server stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| IngestError::transport("Failed to open server stdout"))?;
        tracing::debug!("Spawned server {} (pid {:?})", self.program, child.id());

        Ok(framed_duplex(
            ChildReader {
                stdout,
                _child: child,
            },
            stdin,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        let cmd = ServerCommand::parse("ingestd --stdio  --root /tmp").unwrap();
        assert_eq!(cmd.program, "ingestd");
        assert_eq!(cmd.args, vec!["--stdio", "--root", "/tmp"]);
        assert!(ServerCommand::parse("   ").is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_transport_error() {
        let cmd = ServerCommand::new("/nonexistent/ingest-server", vec![]);
        assert!(matches!(
            cmd.open(None).await,
            Err(IngestError::Transport(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_server_closing_ends_source() {
        // `true` exits immediately without replying
        let cmd = ServerCommand::new("true", vec![]);
        let mut duplex = cmd.open(None).await.unwrap();
        assert!(duplex.source.next().await.is_none());
    }
}
