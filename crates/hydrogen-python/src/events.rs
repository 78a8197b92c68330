//! Publish/subscribe surface consumed by UI code.

use log::debug;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::explorer::VariableRecord;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum PluginEvent {
    /// Fresh variable list; empty after a restart or shutdown.
    DidUpdateVars(Vec<VariableRecord>),
    DidShowExplorer,
    DidInstallMiddleware,
}

impl PluginEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PluginEvent::DidUpdateVars(_) => "did-update-vars",
            PluginEvent::DidShowExplorer => "did-show-explorer",
            PluginEvent::DidInstallMiddleware => "did-install-middleware",
        }
    }
}

/// Cloneable event emitter. Events sent with no subscribers are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PluginEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: PluginEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            debug!("[events] No subscribers for {}", name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_serialize_kebab_case() {
        let json = serde_json::to_value(PluginEvent::DidUpdateVars(vec![])).unwrap();
        assert_eq!(json["event"], "did-update-vars");
        assert_eq!(json["payload"], serde_json::json!([]));

        let json = serde_json::to_value(PluginEvent::DidShowExplorer).unwrap();
        assert_eq!(json["event"], PluginEvent::DidShowExplorer.name());
    }

    #[tokio::test]
    async fn test_subscribers_receive_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(PluginEvent::DidInstallMiddleware);
        bus.emit(PluginEvent::DidShowExplorer);

        assert_eq!(rx.recv().await.unwrap(), PluginEvent::DidInstallMiddleware);
        assert_eq!(rx.recv().await.unwrap(), PluginEvent::DidShowExplorer);
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(PluginEvent::DidShowExplorer);
    }
}
