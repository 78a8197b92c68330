//! [`Executor`] backed by a running Jupyter kernel.
//!
//! One shell writer is shared by all requests. Reader tasks on iopub and
//! shell route every message to the reply stream of the request named in its
//! parent header. A stream closes once both the shell `execute_reply` and the
//! iopub `idle` status for its request have arrived.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use jupyter_protocol::{
    ConnectionInfo, JupyterMessage, JupyterMessageContent, KernelInfoRequest, ShutdownRequest,
};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::executor::{Executor, ExecutorError, ReplySender, ReplyStream};
use crate::language::KernelLanguage;
use crate::message::{KernelMessage, MessageChannel};

const KERNEL_INFO_TIMEOUT: Duration = Duration::from_secs(30);

struct PendingRequest {
    tx: ReplySender,
    got_reply: bool,
    got_idle: bool,
}

impl PendingRequest {
    fn new(tx: ReplySender) -> Self {
        Self {
            tx,
            got_reply: false,
            got_idle: false,
        }
    }
}

/// msg_id of each in-flight execute_request → its reply stream.
type PendingReplies = Arc<StdMutex<HashMap<String, PendingRequest>>>;

fn lock(pending: &PendingReplies) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// Deliver `message` to the request it answers.
fn route(pending: &PendingReplies, message: KernelMessage) {
    let Some(parent_id) = message.parent_msg_id().map(str::to_string) else {
        debug!("[kernel] Dropping unparented {}", message.msg_type());
        return;
    };

    let mut pending = lock(pending);
    let Some(request) = pending.get_mut(&parent_id) else {
        debug!(
            "[kernel] No request for {} (parent_msg_id={})",
            message.msg_type(),
            parent_id
        );
        return;
    };

    request.got_reply |= message.is_execute_reply();
    request.got_idle |= message.is_idle();
    let finished = request.got_reply && request.got_idle;
    if request.tx.send(message).is_err() {
        debug!("[kernel] Reply stream for {} was dropped", parent_id);
    }
    if finished {
        pending.remove(&parent_id);
    }
}

pub struct KernelConnection {
    connection_info: ConnectionInfo,
    session_id: String,
    language: KernelLanguage,
    shell_writer: Mutex<Option<runtimelib::DealerSendConnection>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    pending: PendingReplies,
}

impl KernelConnection {
    /// Connect using a kernel's connection file.
    pub async fn from_connection_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let connection_info: ConnectionInfo = serde_json::from_str(&content)?;
        info!("[kernel] Connecting via {}", path.display());
        Self::connect(connection_info).await
    }

    pub async fn connect(connection_info: ConnectionInfo) -> Result<Self> {
        let session_id = Uuid::new_v4().to_string();
        let pending = PendingReplies::default();

        let mut iopub =
            runtimelib::create_client_iopub_connection(&connection_info, "", &session_id).await?;

        let identity = runtimelib::peer_identity_for_session(&session_id)?;
        let mut shell = runtimelib::create_client_shell_connection_with_identity(
            &connection_info,
            &session_id,
            identity,
        )
        .await?;

        // Verify the kernel is alive and learn its language
        let request: JupyterMessage = KernelInfoRequest::default().into();
        shell.send(request).await?;

        let language = match tokio::time::timeout(KERNEL_INFO_TIMEOUT, shell.read()).await {
            Ok(Ok(msg)) => match msg.content {
                JupyterMessageContent::KernelInfoReply(reply) => {
                    KernelLanguage::from(reply.language_info.name.as_str())
                }
                _ => {
                    return Err(anyhow!(
                        "Expected kernel_info_reply, got {}",
                        msg.header.msg_type
                    ))
                }
            },
            Ok(Err(e)) => {
                error!("[kernel] Error reading kernel_info_reply: {}", e);
                return Err(anyhow!("Kernel did not respond: {}", e));
            }
            Err(_) => {
                error!("[kernel] Timeout waiting for kernel_info_reply");
                return Err(anyhow!("Kernel did not respond within 30s"));
            }
        };
        info!("[kernel] Kernel alive: language={}", language);

        let (shell_writer, mut shell_reader) = shell.split();

        let iopub_pending = pending.clone();
        let iopub_task = tokio::spawn(async move {
            loop {
                match iopub.read().await {
                    Ok(message) => route(
                        &iopub_pending,
                        KernelMessage::from_jupyter(message, MessageChannel::IOPub),
                    ),
                    Err(e) => {
                        error!("[kernel] iopub read error: {}", e);
                        break;
                    }
                }
            }
        });

        let shell_pending = pending.clone();
        let shell_reader_task = tokio::spawn(async move {
            loop {
                match shell_reader.read().await {
                    Ok(message) => route(
                        &shell_pending,
                        KernelMessage::from_jupyter(message, MessageChannel::Shell),
                    ),
                    Err(e) => {
                        error!("[kernel] shell read error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            connection_info,
            session_id,
            language,
            shell_writer: Mutex::new(Some(shell_writer)),
            tasks: StdMutex::new(vec![iopub_task, shell_reader_task]),
            pending,
        })
    }

    pub fn language(&self) -> &KernelLanguage {
        &self.language
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Close every open reply stream; the kernel will not answer them.
    fn abandon_pending(&self) {
        let dropped = lock(&self.pending).drain().count();
        if dropped > 0 {
            debug!("[kernel] Abandoned {} in-flight requests", dropped);
        }
    }

    async fn send_shutdown(&self, restart: bool) -> Result<()> {
        let mut control =
            runtimelib::create_client_control_connection(&self.connection_info, &self.session_id)
                .await?;
        let request: JupyterMessage = ShutdownRequest { restart }.into();
        control.send(request).await?;
        info!("[kernel] Sent shutdown_request (restart={})", restart);
        Ok(())
    }

    async fn send_request(&self, request: KernelMessage) -> Result<ReplyStream, ExecutorError> {
        let mut writer = self.shell_writer.lock().await;
        let shell = writer.as_mut().ok_or(ExecutorError::NotRunning)?;

        let msg_id = request.header.msg_id.clone();
        let message: JupyterMessage = request.try_into().map_err(anyhow::Error::from)?;

        // Register before sending so the readers can route the first reply
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.pending).insert(msg_id.clone(), PendingRequest::new(tx));

        if let Err(e) = shell.send(message).await {
            lock(&self.pending).remove(&msg_id);
            return Err(anyhow::Error::from(e).into());
        }
        debug!("[kernel] Sent execute_request: msg_id={}", msg_id);

        Ok(rx)
    }
}

impl Executor for KernelConnection {
    async fn execute(&self, code: &str) -> Result<ReplyStream, ExecutorError> {
        self.send_request(KernelMessage::execute_request(code, &self.session_id))
            .await
    }

    async fn execute_helper(&self, code: &str) -> Result<ReplyStream, ExecutorError> {
        self.send_request(KernelMessage::helper_request(code, &self.session_id))
            .await
    }

    async fn restart(&self) -> Result<(), ExecutorError> {
        if self.shell_writer.lock().await.is_none() {
            return Err(ExecutorError::NotRunning);
        }
        self.send_shutdown(true).await?;
        self.abandon_pending();
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ExecutorError> {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
        if self.shell_writer.lock().await.take().is_none() {
            return Ok(());
        }
        self.abandon_pending();
        if let Err(e) = self.send_shutdown(false).await {
            warn!("[kernel] Failed to send shutdown_request: {}", e);
        }
        Ok(())
    }
}
