//! Execution middleware for Python kernels.
//!
//! [`PythonMiddleware`] wraps another [`Executor`] and is itself one, so it
//! slots in wherever the host would call the kernel directly. On the way in
//! it expands the code to the full statement under the cursor; on the way
//! out it forwards every reply untouched and, once the kernel reports the
//! execution finished, starts a variable explorer refresh on its own task.
//! Forwarding never waits on that refresh.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::buffer::Workspace;
use crate::executor::{Executor, ExecutorError, ReplyStream};
use crate::expander::{expand, CodeBlock, ExpansionRules};
use crate::explorer::VariableExplorerBridge;
use crate::session::KernelSession;
use crate::settings::Settings;

pub struct PythonMiddleware<E> {
    inner: Arc<E>,
    workspace: Arc<dyn Workspace>,
    expand_code: bool,
    rules: ExpansionRules,
    session: Arc<KernelSession>,
    bridge: VariableExplorerBridge,
    refreshes: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<E: Executor + 'static> PythonMiddleware<E> {
    pub fn new(
        inner: Arc<E>,
        workspace: Arc<dyn Workspace>,
        settings: &Settings,
        session: Arc<KernelSession>,
        bridge: VariableExplorerBridge,
    ) -> Self {
        Self {
            inner,
            workspace,
            expand_code: settings.expand_code,
            rules: settings.rules(),
            session,
            bridge,
            refreshes: Arc::default(),
        }
    }

    pub fn session(&self) -> &Arc<KernelSession> {
        &self.session
    }

    /// Wait for every variable explorer refresh started so far.
    ///
    /// A refresh is registered before its `execute_reply` is forwarded, so
    /// once a reply stream has closed its refresh is covered.
    pub async fn wait_for_explorer(&self) {
        let refreshes = std::mem::take(&mut *lock(&self.refreshes));
        for refresh in refreshes {
            if let Err(e) = refresh.await {
                warn!("[middleware] Variable explorer refresh failed: {}", e);
            }
        }
    }

    /// Grow `code` to the statement it belongs to in the active editor and
    /// move the cursor for run-and-move executions.
    fn expand_in_active_editor(&self, code: &str) -> String {
        let Some(editor) = self.workspace.active_editor() else {
            debug!("[middleware] No active editor; sending code as-is");
            return code.to_string();
        };

        let cursor_row = editor.cursor_row();
        let block = match editor.selection() {
            Some(selection) => CodeBlock::selected(code, selection),
            None => CodeBlock::new(code, cursor_row),
        };
        let result = expand(&*editor, &block, cursor_row, &self.rules, editor.run_mode());
        debug!(
            "[middleware] Expanded rows {}..={} of session {}",
            result.start_row,
            result.end_row,
            self.session.id()
        );
        if let Some(row) = result.next_cursor_row {
            editor.set_cursor_row(row);
        }
        result.block.code
    }

    /// Drop the helper state the kernel no longer has and clear the explorer.
    fn forget_plugin(&self) {
        self.session.reset();
        self.bridge.clear();
    }
}

fn lock(refreshes: &Mutex<Vec<JoinHandle<()>>>) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
    refreshes.lock().unwrap_or_else(|e| e.into_inner())
}

/// Remove one leading and one trailing blank line. Kernels reject a leading
/// line whose indentation disagrees with the rest.
pub fn strip_blank_edges(code: &str) -> String {
    let mut lines: Vec<&str> = code.split('\n').collect();
    if lines.len() > 1 && lines.first().is_some_and(|l| l.trim().is_empty()) {
        lines.remove(0);
    }
    if lines.len() > 1 && lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

impl<E: Executor + 'static> Executor for PythonMiddleware<E> {
    async fn execute(&self, code: &str) -> Result<ReplyStream, ExecutorError> {
        let code = if self.expand_code {
            self.expand_in_active_editor(code)
        } else {
            code.to_string()
        };
        let code = strip_blank_edges(&code);

        let mut upstream = self.inner.execute(&code).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        let inner = self.inner.clone();
        let session = self.session.clone();
        let bridge = self.bridge.clone();
        let refreshes = self.refreshes.clone();
        tokio::spawn(async move {
            while let Some(message) = upstream.recv().await {
                let completed = message.is_execute_reply();
                if completed && session.variable_explorer_enabled() {
                    let (inner, session, bridge) = (inner.clone(), session.clone(), bridge.clone());
                    let refresh = tokio::spawn(async move {
                        bridge.request_update(&session, &*inner).await;
                    });
                    let mut pending = lock(&refreshes);
                    pending.retain(|r| !r.is_finished());
                    pending.push(refresh);
                }
                if tx.send(message).is_err() {
                    debug!("[middleware] Reply receiver dropped; still draining");
                }
            }
        });

        Ok(rx)
    }

    async fn execute_helper(&self, code: &str) -> Result<ReplyStream, ExecutorError> {
        self.inner.execute_helper(code).await
    }

    async fn restart(&self) -> Result<(), ExecutorError> {
        let result = self.inner.restart().await;
        self.forget_plugin();
        result
    }

    async fn shutdown(&self) -> Result<(), ExecutorError> {
        let result = self.inner.shutdown().await;
        self.forget_plugin();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{LineBuffer, RunMode, SelectionSpan, SingleEditor, Editor};
    use crate::events::{EventBus, PluginEvent};
    use crate::installer::KernelPluginInstaller;
    use crate::language::KernelLanguage;
    use crate::resources::{KernelResources, VARIABLE_EXPLORER_CALL};
    use crate::session::PluginState;
    use crate::testing::FakeKernel;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    struct Harness {
        kernel: Arc<FakeKernel>,
        middleware: PythonMiddleware<FakeKernel>,
        events: EventBus,
    }

    fn harness(editor: Option<Arc<dyn Editor>>, settings: Settings) -> Harness {
        let kernel = Arc::new(FakeKernel::default());
        let events = EventBus::new();
        let installer = KernelPluginInstaller::new(Arc::new(KernelResources::bundled().unwrap()));
        let bridge = VariableExplorerBridge::new(installer, events.clone());
        let session = Arc::new(KernelSession::new("k1", KernelLanguage::Python));
        let middleware = PythonMiddleware::new(
            kernel.clone(),
            Arc::new(SingleEditor(editor)),
            &settings,
            session,
            bridge,
        );
        Harness {
            kernel,
            middleware,
            events,
        }
    }

    async fn drain(mut replies: ReplyStream) -> Vec<String> {
        let mut types = Vec::new();
        while let Some(message) = replies.recv().await {
            types.push(message.msg_type().to_string());
        }
        types
    }

    const SOURCE: &str = "if x:\n    a = 1\nelse:\n    a = 2\n\nprint(a)";

    #[test]
    fn test_strip_blank_edges() {
        assert_eq!(strip_blank_edges("\nx = 1\n"), "x = 1");
        assert_eq!(strip_blank_edges("\n\nx = 1\n\n"), "\nx = 1\n");
        assert_eq!(strip_blank_edges("  \n    y = 2"), "    y = 2");
        assert_eq!(strip_blank_edges("x = 1"), "x = 1");
        assert_eq!(strip_blank_edges(""), "");
    }

    #[tokio::test]
    async fn test_execute_expands_and_moves_cursor() {
        let editor = Arc::new(LineBuffer::from_text(SOURCE).with_cursor(0, RunMode::Advance));
        let h = harness(Some(editor.clone()), Settings::default());

        let replies = h.middleware.execute("if x:\n    a = 1").await.unwrap();
        drain(replies).await;

        assert_eq!(h.kernel.executed(), vec!["if x:\n    a = 1\nelse:\n    a = 2"]);
        assert_eq!(editor.cursor_row(), 5);
    }

    #[tokio::test]
    async fn test_execute_without_move_keeps_cursor() {
        let editor = Arc::new(LineBuffer::from_text(SOURCE).with_cursor(2, RunMode::Stay));
        let h = harness(Some(editor.clone()), Settings::default());

        drain(h.middleware.execute("else:\n    a = 2").await.unwrap()).await;

        assert_eq!(h.kernel.executed(), vec!["else:\n    a = 2"]);
        assert_eq!(editor.cursor_row(), 2);
    }

    #[tokio::test]
    async fn test_selection_is_sent_verbatim() {
        let editor = Arc::new(LineBuffer::from_text(SOURCE).with_selection(SelectionSpan {
            start_row: 0,
            end_row: 1,
        }));
        let h = harness(Some(editor.clone()), Settings::default());

        drain(h.middleware.execute("if x:\n    a = 1").await.unwrap()).await;

        assert_eq!(h.kernel.executed(), vec!["if x:\n    a = 1"]);
        assert_eq!(editor.cursor_row(), 0);
    }

    #[tokio::test]
    async fn test_expansion_disabled_only_strips() {
        let editor = Arc::new(LineBuffer::from_text(SOURCE));
        let settings = Settings {
            expand_code: false,
            ..Settings::default()
        };
        let h = harness(Some(editor), settings);

        drain(h.middleware.execute("\nif x:\n    a = 1\n").await.unwrap()).await;

        assert_eq!(h.kernel.executed(), vec!["if x:\n    a = 1"]);
    }

    #[tokio::test]
    async fn test_no_active_editor_sends_code() {
        let h = harness(None, Settings::default());

        drain(h.middleware.execute("x = 1\n").await.unwrap()).await;

        assert_eq!(h.kernel.executed(), vec!["x = 1"]);
    }

    #[tokio::test]
    async fn test_every_reply_is_forwarded() {
        let h = harness(None, Settings::default());

        let types = drain(h.middleware.execute("x = 1").await.unwrap()).await;

        assert_eq!(types, vec!["status", "stream", "execute_reply", "status"]);
        // Explorer disabled: nothing beyond the user code reached the kernel.
        assert_eq!(h.kernel.executed().len(), 1);
    }

    #[tokio::test]
    async fn test_execute_reply_triggers_explorer_update() {
        let h = harness(None, Settings::default());
        let mut rx = h.events.subscribe();
        h.middleware.session().set_variable_explorer_enabled(true);

        drain(h.middleware.execute("x = 1").await.unwrap()).await;
        h.middleware.wait_for_explorer().await;

        // user code, probe, install, hook
        assert_eq!(h.kernel.executed().len(), 4);
        // Only the helper code goes out as helper requests.
        assert_eq!(h.kernel.helper_executed().len(), 3);
        assert!(!h.kernel.helper_executed().contains(&"x = 1".to_string()));
        assert_eq!(h.kernel.count_matching(VARIABLE_EXPLORER_CALL), 1);
        match rx.try_recv().unwrap() {
            PluginEvent::DidUpdateVars(vars) => assert_eq!(vars[0].name, "x"),
            other => panic!("unexpected event {:?}", other),
        }

        drain(h.middleware.execute("y = 2").await.unwrap()).await;
        h.middleware.wait_for_explorer().await;
        assert_eq!(h.kernel.count_matching(VARIABLE_EXPLORER_CALL), 2);
        assert_eq!(h.kernel.count_matching("HydrogenPythonHelper"), 1);
    }

    #[tokio::test]
    async fn test_unanswered_helper_does_not_hold_back_replies() {
        let h = harness(None, Settings::default());
        h.kernel.stall_helpers.store(true, Ordering::SeqCst);
        h.middleware.session().set_variable_explorer_enabled(true);

        let replies = h.middleware.execute("x = 1").await.unwrap();
        let types = tokio::time::timeout(Duration::from_secs(5), drain(replies))
            .await
            .expect("reply stream stayed open while the helper was unanswered");

        assert_eq!(types, vec!["status", "stream", "execute_reply", "status"]);

        // Later executions are not blocked either.
        let replies = h.middleware.execute("y = 2").await.unwrap();
        let types = tokio::time::timeout(Duration::from_secs(5), drain(replies))
            .await
            .expect("second reply stream stayed open");
        assert_eq!(types.last().map(String::as_str), Some("status"));
    }

    #[tokio::test]
    async fn test_restart_resets_plugin_and_clears_variables() {
        let h = harness(None, Settings::default());
        *h.kernel.probe_reply.lock().unwrap() = json!("nope");
        h.middleware.session().set_variable_explorer_enabled(true);
        drain(h.middleware.execute("x = 1").await.unwrap()).await;
        h.middleware.wait_for_explorer().await;
        assert_eq!(h.middleware.session().plugin_state(), PluginState::Failed);

        let mut rx = h.events.subscribe();
        h.middleware.restart().await.unwrap();

        assert_eq!(h.kernel.restarts.load(Ordering::SeqCst), 1);
        assert_eq!(h.middleware.session().plugin_state(), PluginState::Uninstalled);
        assert!(!h.middleware.session().plugin_install_failed());
        assert_eq!(rx.try_recv().unwrap(), PluginEvent::DidUpdateVars(vec![]));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_shutdown_resets_plugin_and_clears_variables() {
        let h = harness(None, Settings::default());
        h.middleware.session().set_variable_explorer_enabled(true);
        drain(h.middleware.execute("x = 1").await.unwrap()).await;
        h.middleware.wait_for_explorer().await;
        assert!(h.middleware.session().plugin_installed());

        let mut rx = h.events.subscribe();
        h.middleware.shutdown().await.unwrap();

        assert_eq!(h.kernel.shutdowns.load(Ordering::SeqCst), 1);
        assert!(!h.middleware.session().plugin_installed());
        assert_eq!(rx.try_recv().unwrap(), PluginEvent::DidUpdateVars(vec![]));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }
}
