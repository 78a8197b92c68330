//! Installs the kernel-side helper before any introspection runs.
//!
//! Per session: `Uninstalled → Installing → Installed`, or `Failed` when the
//! sanity check or the install does not answer as expected. `Failed` sticks
//! until the session is reset by a restart or shutdown. Requests arriving
//! while an install is in flight are folded into the single action that runs
//! once installation completes.

use std::future::Future;
use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::Value;

use crate::executor::{first_reserved_payload, Executor};
use crate::resources::{KernelResources, PROBE_SUCCESS};
use crate::session::{Admission, KernelSession};

#[derive(Debug, Clone)]
pub struct KernelPluginInstaller {
    resources: Arc<KernelResources>,
}

impl KernelPluginInstaller {
    pub fn new(resources: Arc<KernelResources>) -> Self {
        Self { resources }
    }

    /// Run `action` once the helper is available.
    ///
    /// When this call performs the install, `action` runs right after it
    /// succeeds. Returns `None` when the helper is unavailable or an install
    /// is already in flight.
    pub async fn run_with_plugin<E, F, Fut, T>(
        &self,
        session: &KernelSession,
        executor: &E,
        action: F,
    ) -> Option<T>
    where
        E: Executor,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self.ensure_installed(session, executor).await {
            Admission::Ready => Some(action().await),
            Admission::Deferred => {
                debug!(
                    "[installer] Install in flight for {}; request deferred",
                    session.id()
                );
                None
            }
            Admission::Refused | Admission::Install => None,
        }
    }

    /// Install the helper if this session has not tried yet.
    pub async fn ensure_installed<E: Executor>(
        &self,
        session: &KernelSession,
        executor: &E,
    ) -> Admission {
        match session.admit() {
            Admission::Install => {}
            other => return other,
        }

        info!("[installer] Installing kernel helper for session {}", session.id());
        let installed = self.install(executor).await;
        if session.finish_install(installed) {
            debug!("[installer] Deferred request folded into post-install run");
        }

        if session.plugin_installed() {
            info!("[installer] Kernel helper installed for session {}", session.id());
            Admission::Ready
        } else {
            Admission::Refused
        }
    }

    async fn install<E: Executor>(&self, executor: &E) -> bool {
        let probe = self.request(executor, self.resources.probe_code()).await;
        if probe.as_ref().and_then(Value::as_str) != Some(PROBE_SUCCESS) {
            warn!(
                "[installer] Sanity check failed (reply: {:?}); variable explorer disabled for this session",
                probe
            );
            return false;
        }

        let reply = self.request(executor, self.resources.install_code()).await;
        let success = reply
            .as_ref()
            .and_then(|r| r.get("success"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !success {
            warn!("[installer] Kernel helper install failed (reply: {:?})", reply);
        }
        success
    }

    async fn request<E: Executor>(&self, executor: &E, code: String) -> Option<Value> {
        match executor.execute_helper(&code).await {
            Ok(replies) => first_reserved_payload(replies).await,
            Err(e) => {
                warn!("[installer] Failed to send helper code: {}", e);
                None
            }
        }
    }
}
