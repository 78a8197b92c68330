//! Per-kernel bookkeeping and the registry that owns it.
//!
//! Each connected backend gets exactly one [`KernelSession`], keyed by its
//! session id. Registering the same id twice is an error rather than an
//! overwrite.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::info;
use serde::Serialize;

use crate::language::KernelLanguage;

/// Install status of the kernel-side helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    #[default]
    Uninstalled,
    Installing,
    Installed,
    /// Sticky until the next restart or shutdown.
    Failed,
}

/// What a caller asking for the helper is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The helper is installed; go ahead.
    Ready,
    /// The caller must run the install sequence.
    Install,
    /// An install is in flight; the request was folded into its retry.
    Deferred,
    /// Install failed earlier in this session.
    Refused,
}

#[derive(Debug, Default)]
struct SessionState {
    plugin: PluginState,
    retry_pending: bool,
    variable_explorer_enabled: bool,
}

#[derive(Debug)]
pub struct KernelSession {
    id: String,
    language: KernelLanguage,
    state: Mutex<SessionState>,
}

impl KernelSession {
    pub fn new(id: impl Into<String>, language: KernelLanguage) -> Self {
        Self {
            id: id.into(),
            language,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn language(&self) -> &KernelLanguage {
        &self.language
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn plugin_state(&self) -> PluginState {
        self.state().plugin
    }

    pub fn plugin_installed(&self) -> bool {
        self.plugin_state() == PluginState::Installed
    }

    pub fn plugin_install_failed(&self) -> bool {
        self.plugin_state() == PluginState::Failed
    }

    pub fn variable_explorer_enabled(&self) -> bool {
        self.state().variable_explorer_enabled
    }

    pub fn set_variable_explorer_enabled(&self, enabled: bool) {
        self.state().variable_explorer_enabled = enabled;
    }

    /// Decide how a helper request proceeds, moving `Uninstalled` to
    /// `Installing` for the caller that gets [`Admission::Install`].
    pub fn admit(&self) -> Admission {
        let mut state = self.state();
        match state.plugin {
            PluginState::Installed => Admission::Ready,
            PluginState::Failed => Admission::Refused,
            PluginState::Installing => {
                state.retry_pending = true;
                Admission::Deferred
            }
            PluginState::Uninstalled => {
                state.plugin = PluginState::Installing;
                Admission::Install
            }
        }
    }

    /// Record the install outcome. Returns whether a request was deferred
    /// while installing.
    pub fn finish_install(&self, installed: bool) -> bool {
        let mut state = self.state();
        // A reset while installing wins over a late outcome.
        if state.plugin != PluginState::Installing {
            return false;
        }
        state.plugin = if installed {
            PluginState::Installed
        } else {
            PluginState::Failed
        };
        std::mem::take(&mut state.retry_pending)
    }

    /// Forget the helper; called on every restart and shutdown.
    pub fn reset(&self) {
        let mut state = self.state();
        state.plugin = PluginState::Uninstalled;
        state.retry_pending = false;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Session {0} is already registered")]
    AlreadyRegistered(String),
}

/// Session id → session state, insert-once.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<KernelSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<KernelSession>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(
        &self,
        id: &str,
        language: KernelLanguage,
    ) -> Result<Arc<KernelSession>, RegistryError> {
        let mut sessions = self.sessions();
        if sessions.contains_key(id) {
            return Err(RegistryError::AlreadyRegistered(id.to_string()));
        }
        let session = Arc::new(KernelSession::new(id, language));
        sessions.insert(id.to_string(), session.clone());
        info!("[registry] Registered session {}", id);
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<KernelSession>> {
        self.sessions().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<KernelSession>> {
        self.sessions().remove(id)
    }

    pub fn all(&self) -> Vec<Arc<KernelSession>> {
        self.sessions().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }
}
