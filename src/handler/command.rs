//! Handler that runs an external executable per attempt.
//!
//! The payload body is written to the child's stdin as JSON; identifying
//! details go in the environment. Exit status 0 is success, `EX_DATAERR`
//! (65) is a permanent failure, anything else is retryable.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use super::{Handler, HandlerContext, HandlerError, HandlerResult};

const EX_DATAERR: i32 = 65;
const STDERR_TAIL: usize = 512;

pub struct CommandHandler {
    command: PathBuf,
}

impl CommandHandler {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &Path {
        &self.command
    }

    /// Resolve relative command paths against the process CWD.
    fn resolve(&self) -> std::io::Result<PathBuf> {
        if self.command.is_relative() {
            Ok(std::env::current_dir()?.join(&self.command))
        } else {
            Ok(self.command.clone())
        }
    }
}

#[async_trait]
impl Handler for CommandHandler {
    async fn handle(&self, ctx: HandlerContext) -> HandlerResult {
        let command = self
            .resolve()
            .map_err(|e| HandlerError::retryable(format!("resolve command: {e}")))?;
        let input = serde_json::to_vec(&ctx.payload.data)
            .map_err(|e| HandlerError::permanent(format!("encode payload: {e}")))?;

        debug!(
            id = %ctx.work_id,
            handler = %ctx.handler_name,
            command = %command.display(),
            "running command"
        );

        // kill_on_drop: a cancelled attempt must not leave the child behind.
        let mut child = Command::new(&command)
            .env("TASKQ_WORK_ID", ctx.work_id.to_string())
            .env("TASKQ_HANDLER", &ctx.handler_name)
            .env("TASKQ_ATTEMPT", ctx.attempt.to_string())
            .env("TASKQ_PAYLOAD_VERSION", ctx.payload.version.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HandlerError::retryable(format!("spawn {}: {e}", command.display())))?;

        // Feed stdin, drain stderr and wait all at once: a child blocked on a
        // full pipe would otherwise never exit.
        let stdin = child.stdin.take();
        let stderr = child.stderr.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // The child may exit without reading its input.
                if let Err(e) = stdin.write_all(&input).await {
                    debug!("payload not fully written to stdin: {e}");
                }
            }
        };
        let drain = async move {
            match stderr {
                Some(stderr) => read_tail(stderr, STDERR_TAIL * 4).await,
                None => Ok(Vec::new()),
            }
        };

        let finished = tokio::select! {
            (status, err_bytes, ()) = async { tokio::join!(child.wait(), drain, feed) } => {
                Some((status, err_bytes))
            }
            _ = ctx.cancelled() => None,
        };
        let Some((status, err_bytes)) = finished else {
            if let Err(e) = child.kill().await {
                debug!("kill after cancellation: {e}");
            }
            return Err(HandlerError::retryable("cancelled"));
        };
        let status = status.map_err(|e| HandlerError::retryable(format!("wait: {e}")))?;

        if status.success() {
            return Ok(());
        }

        let err_text = match err_bytes {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                debug!("reading stderr failed: {e}");
                String::new()
            }
        };
        let tail: String = {
            let trimmed = err_text.trim();
            let skip = trimmed.chars().count().saturating_sub(STDERR_TAIL);
            trimmed.chars().skip(skip).collect()
        };

        let code = status.code().unwrap_or(-1);
        let message = if tail.is_empty() {
            format!("{} exited with status {code}", command.display())
        } else {
            format!("{} exited with status {code}: {tail}", command.display())
        };
        if code == EX_DATAERR {
            Err(HandlerError::permanent(message))
        } else {
            Err(HandlerError::retryable(message))
        }
    }
}

/// Read `reader` to the end, keeping only the last `keep` bytes.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, keep: usize) -> std::io::Result<Vec<u8>> {
    let mut tail = Vec::with_capacity(keep);
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(tail);
        }
        tail.extend_from_slice(&chunk[..n]);
        if tail.len() > keep {
            let excess = tail.len() - keep;
            tail.drain(..excess);
        }
    }
}
