//! The execution capability every layer implements.
//!
//! A kernel connection implements it directly; the middleware implements it
//! by wrapping another executor.

use std::future::Future;

use tokio::sync::mpsc;

use crate::message::KernelMessage;

/// Replies for one execute request, in delivery order. The stream ends when
/// the request is finished.
pub type ReplyStream = mpsc::UnboundedReceiver<KernelMessage>;

/// Sending half of a [`ReplyStream`].
pub type ReplySender = mpsc::UnboundedSender<KernelMessage>;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("No kernel running")]
    NotRunning,

    #[error("Kernel error: {0}")]
    Kernel(#[from] anyhow::Error),
}

pub trait Executor: Send + Sync {
    /// Send `code` for execution and stream back every reply for it.
    fn execute(
        &self,
        code: &str,
    ) -> impl Future<Output = Result<ReplyStream, ExecutorError>> + Send;

    /// Send kernel-side helper code. Backends that can tell it apart keep it
    /// out of the execution count and history, and never let it abort
    /// requests queued behind it.
    fn execute_helper(
        &self,
        code: &str,
    ) -> impl Future<Output = Result<ReplyStream, ExecutorError>> + Send {
        self.execute(code)
    }

    /// Restart the backend; resolves once the restart has been requested.
    fn restart(&self) -> impl Future<Output = Result<(), ExecutorError>> + Send;

    fn shutdown(&self) -> impl Future<Output = Result<(), ExecutorError>> + Send;
}

/// Drain `replies` and return the first reserved-key payload, if any.
///
/// All other messages, including stdout text, are skipped.
pub async fn first_reserved_payload(mut replies: ReplyStream) -> Option<serde_json::Value> {
    while let Some(message) = replies.recv().await {
        if let Some(payload) = message.reserved_payload() {
            return Some(payload.clone());
        }
    }
    None
}
