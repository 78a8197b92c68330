//! Scripted in-process kernel for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::executor::{Executor, ExecutorError, ReplySender, ReplyStream};
use crate::message::{KernelMessage, MessageChannel, RESERVED_KEY};
use crate::resources::VARIABLE_EXPLORER_CALL;

pub(crate) struct FakeKernel {
    executed: Mutex<Vec<String>>,
    helper_executed: Mutex<Vec<String>>,
    /// When set, helper code gets `busy` and then nothing, ever.
    pub stall_helpers: AtomicBool,
    stalled: Mutex<Vec<ReplySender>>,
    pub probe_reply: Mutex<Value>,
    pub install_reply: Mutex<Value>,
    pub hook_reply: Mutex<Option<Value>>,
    pub restarts: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
            helper_executed: Mutex::new(Vec::new()),
            stall_helpers: AtomicBool::new(false),
            stalled: Mutex::new(Vec::new()),
            probe_reply: Mutex::new(json!("pass")),
            install_reply: Mutex::new(json!({"success": true})),
            hook_reply: Mutex::new(Some(json!({
                "variables": [
                    {"name": "x", "type": "int", "size": "", "value": 1},
                ]
            }))),
            restarts: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        }
    }
}

impl FakeKernel {
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn helper_executed(&self) -> Vec<String> {
        self.helper_executed.lock().unwrap().clone()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.executed().iter().filter(|c| c.contains(needle)).count()
    }

    fn payload_for(&self, code: &str) -> Option<Value> {
        if code.contains("HydrogenPythonHelper") {
            Some(self.install_reply.lock().unwrap().clone())
        } else if code.contains("'pass'") {
            Some(self.probe_reply.lock().unwrap().clone())
        } else if code.contains(VARIABLE_EXPLORER_CALL) {
            self.hook_reply.lock().unwrap().clone()
        } else {
            None
        }
    }
}

pub(crate) fn iopub(msg_type: &str, content: Value, parent: &KernelMessage) -> KernelMessage {
    KernelMessage::synthesize(msg_type, content, "fake")
        .with_parent(&parent.header)
        .with_channel(MessageChannel::IOPub)
}

impl FakeKernel {
    fn respond(&self, code: &str, request: KernelMessage) -> ReplyStream {
        self.executed.lock().unwrap().push(code.to_string());

        let (tx, rx) = mpsc::unbounded_channel();
        let mut replies = vec![
            iopub("status", json!({"execution_state": "busy"}), &request),
            iopub(
                "stream",
                json!({"name": "stdout", "text": format!("{{\"{}\": \"pass\"}}", RESERVED_KEY)}),
                &request,
            ),
        ];
        if let Some(payload) = self.payload_for(code) {
            replies.push(iopub(
                "display_data",
                json!({"data": {"application/json": {RESERVED_KEY: payload}}, "metadata": {}}),
                &request,
            ));
        }
        replies.push(
            KernelMessage::synthesize("execute_reply", json!({"status": "ok"}), "fake")
                .with_parent(&request.header)
                .with_channel(MessageChannel::Shell),
        );
        replies.push(iopub("status", json!({"execution_state": "idle"}), &request));

        for reply in replies {
            let _ = tx.send(reply);
        }
        rx
    }
}

impl Executor for FakeKernel {
    async fn execute(&self, code: &str) -> Result<ReplyStream, ExecutorError> {
        Ok(self.respond(code, KernelMessage::execute_request(code, "fake")))
    }

    async fn execute_helper(&self, code: &str) -> Result<ReplyStream, ExecutorError> {
        self.helper_executed.lock().unwrap().push(code.to_string());
        let request = KernelMessage::helper_request(code, "fake");

        if self.stall_helpers.load(Ordering::SeqCst) {
            self.executed.lock().unwrap().push(code.to_string());
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(iopub("status", json!({"execution_state": "busy"}), &request));
            self.stalled.lock().unwrap().push(tx);
            return Ok(rx);
        }
        Ok(self.respond(code, request))
    }

    async fn restart(&self) -> Result<(), ExecutorError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ExecutorError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
