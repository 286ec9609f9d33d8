//! The seam to the remote system: one handler invocation per operation.
//!
//! The queue never decides what an operation means. A handler receives the
//! record, performs the remote call, and reports success or failure. Timeout
//! policy belongs to the handler; the queue waits as long as it takes.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::model::Operation;

#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(&self, operation: &Operation) -> anyhow::Result<()>;
}

/// Adapts an async closure into an [`OperationHandler`].
///
/// The closure receives an owned clone of the operation.
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Operation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> OperationHandler for FnHandler<F>
where
    F: Fn(Operation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, operation: &Operation) -> anyhow::Result<()> {
        (self.f)(operation.clone()).await
    }
}

/// Runs an external executable per operation.
///
/// The operation is written as JSON to the child's stdin, and
/// `OFFQ_OPERATION_ID` / `OFFQ_OPERATION_TYPE` are set in its environment.
/// Exit status 0 is success.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    command: PathBuf,
    args: Vec<String>,
}

impl CommandHandler {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

#[async_trait]
impl OperationHandler for CommandHandler {
    async fn handle(&self, operation: &Operation) -> anyhow::Result<()> {
        let input = serde_json::to_vec(operation)?;

        debug!(
            command = %self.command.display(),
            id = %operation.id,
            operation_type = %operation.operation_type,
            "running handler command"
        );

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .env("OFFQ_OPERATION_ID", operation.id.to_string())
            .env("OFFQ_OPERATION_TYPE", &operation.operation_type)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| anyhow::anyhow!("spawn {}: {e}", self.command.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A child that exits without reading stdin closes the pipe; its
            // exit status is what counts.
            if let Err(e) = stdin.write_all(&input).await {
                debug!(id = %operation.id, error = %e, "handler command did not read stdin");
            }
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let code = output.status.code().unwrap_or(-1);
        if stderr.is_empty() {
            anyhow::bail!("handler exited with status {code}")
        } else {
            anyhow::bail!("handler exited with status {code}: {stderr}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewOperation;
    use chrono::Utc;
    use serde_json::json;

    fn op() -> Operation {
        Operation::from_new(NewOperation::new("sync").payload(json!({"x": 1})), 3, Utc::now())
    }

    #[tokio::test]
    async fn fn_handler_passes_operation_through() {
        let handler = handler_fn(|op: Operation| async move {
            anyhow::ensure!(op.payload["x"] == 1, "unexpected payload");
            Ok(())
        });
        handler.handle(&op()).await.unwrap();
    }

    #[tokio::test]
    async fn command_handler_success() {
        let handler = CommandHandler::new("sh").arg("-c").arg("cat > /dev/null");
        handler.handle(&op()).await.unwrap();
    }

    #[tokio::test]
    async fn command_handler_reports_exit_code_and_stderr() {
        let handler = CommandHandler::new("sh")
            .arg("-c")
            .arg("echo \"no route for $OFFQ_OPERATION_TYPE\" >&2; exit 3");
        let err = handler.handle(&op()).await.unwrap_err().to_string();
        assert!(err.contains("status 3"), "{err}");
        assert!(err.contains("no route for sync"), "{err}");
    }

    #[tokio::test]
    async fn command_handler_missing_binary_fails() {
        let handler = CommandHandler::new("/nonexistent/offq-handler");
        assert!(handler.handle(&op()).await.is_err());
    }
}
