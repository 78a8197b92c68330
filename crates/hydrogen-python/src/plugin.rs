//! Entry point for hosts: owns the shared pieces and hands out one
//! middleware per Python kernel session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::broadcast;

use crate::buffer::Workspace;
use crate::events::{EventBus, PluginEvent};
use crate::executor::Executor;
use crate::explorer::VariableExplorerBridge;
use crate::installer::KernelPluginInstaller;
use crate::language::KernelLanguage;
use crate::middleware::PythonMiddleware;
use crate::resources::{KernelResources, ResourceError};
use crate::session::{KernelSession, RegistryError, SessionRegistry};
use crate::settings::Settings;

pub struct HydrogenPython {
    settings: Settings,
    resources: Arc<KernelResources>,
    workspace: Arc<dyn Workspace>,
    events: EventBus,
    sessions: SessionRegistry,
    explorer_shown: AtomicBool,
}

impl HydrogenPython {
    /// Load helper sources (from `settings.resources_dir` when set) and set up
    /// an empty session registry.
    pub fn new(settings: Settings, workspace: Arc<dyn Workspace>) -> Result<Self, ResourceError> {
        let resources = match &settings.resources_dir {
            Some(dir) => KernelResources::load(dir)?,
            None => KernelResources::bundled()?,
        };
        Ok(Self {
            explorer_shown: AtomicBool::new(settings.variable_explorer),
            settings,
            resources: Arc::new(resources),
            workspace,
            events: EventBus::new(),
            sessions: SessionRegistry::new(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.events.subscribe()
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Wrap `executor` for a newly connected kernel.
    ///
    /// Returns `Ok(None)` for non-Python kernels, which run unwrapped.
    pub fn attach<E: Executor + 'static>(
        &self,
        session_id: &str,
        language: KernelLanguage,
        executor: Arc<E>,
    ) -> Result<Option<PythonMiddleware<E>>, RegistryError> {
        if !language.is_python() {
            debug!("[plugin] Not attaching to {} kernel {}", language, session_id);
            return Ok(None);
        }

        let session = self.sessions.register(session_id, language)?;
        session.set_variable_explorer_enabled(self.explorer_shown.load(Ordering::SeqCst));

        let bridge = VariableExplorerBridge::new(
            KernelPluginInstaller::new(self.resources.clone()),
            self.events.clone(),
        );
        let middleware = PythonMiddleware::new(
            executor,
            self.workspace.clone(),
            &self.settings,
            session.clone(),
            bridge,
        );

        info!(
            "[plugin] Middleware installed for {} session {}",
            session.language(),
            session_id
        );
        self.events.emit(PluginEvent::DidInstallMiddleware);
        Ok(Some(middleware))
    }

    /// Turn the variable explorer on for every current and future session.
    pub fn show_variable_explorer(&self) {
        self.explorer_shown.store(true, Ordering::SeqCst);
        for session in self.sessions.all() {
            session.set_variable_explorer_enabled(true);
        }
        self.events.emit(PluginEvent::DidShowExplorer);
    }

    /// Forget a session whose backend connection went away.
    pub fn detach(&self, session_id: &str) -> Option<Arc<KernelSession>> {
        let session = self.sessions.remove(session_id);
        if session.is_some() {
            info!("[plugin] Detached session {}", session_id);
        }
        session
    }
}
