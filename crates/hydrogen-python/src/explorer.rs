//! Variable explorer: asks the kernel helper for the user namespace after an
//! execution and republishes it as `did-update-vars`.

use log::{debug, warn};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::events::{EventBus, PluginEvent};
use crate::executor::{first_reserved_payload, Executor};
use crate::installer::KernelPluginInstaller;
use crate::resources::VARIABLE_EXPLORER_CALL;
use crate::session::KernelSession;

/// One row of the variable explorer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableRecord {
    pub name: String,
    #[serde(rename = "type", default)]
    pub type_name: String,
    #[serde(default, deserialize_with = "deserialize_display")]
    pub size: String,
    #[serde(default, deserialize_with = "deserialize_display")]
    pub value: String,
}

/// The helper reports sizes and values as strings, numbers, or `''`.
fn deserialize_display<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct VariableExplorerBridge {
    installer: KernelPluginInstaller,
    events: EventBus,
}

impl VariableExplorerBridge {
    pub fn new(installer: KernelPluginInstaller, events: EventBus) -> Self {
        Self { installer, events }
    }

    /// Query the helper (installing it first if needed) and publish the
    /// result. Returns the records that were published, if any.
    pub async fn request_update<E: Executor>(
        &self,
        session: &KernelSession,
        executor: &E,
    ) -> Option<Vec<VariableRecord>> {
        self.installer
            .run_with_plugin(session, executor, move || self.query(executor))
            .await
            .flatten()
    }

    async fn query<E: Executor>(&self, executor: &E) -> Option<Vec<VariableRecord>> {
        let replies = match executor.execute_helper(VARIABLE_EXPLORER_CALL).await {
            Ok(replies) => replies,
            Err(e) => {
                warn!("[explorer] Failed to request variables: {}", e);
                return None;
            }
        };
        let payload = first_reserved_payload(replies).await?;
        self.handle_payload(&payload)
    }

    /// Act on one helper reply: log `error`, publish `variables`.
    pub fn handle_payload(&self, payload: &Value) -> Option<Vec<VariableRecord>> {
        if let Some(error) = payload.get("error") {
            let error = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
            warn!("[explorer] Kernel helper reported an error: {}", error);
        }

        let variables = payload.get("variables")?;
        match Vec::<VariableRecord>::deserialize(variables) {
            Ok(records) => {
                debug!("[explorer] {} variables", records.len());
                self.events.emit(PluginEvent::DidUpdateVars(records.clone()));
                Some(records)
            }
            Err(e) => {
                warn!("[explorer] Malformed variable list: {}", e);
                None
            }
        }
    }

    /// Publish an empty list so stale rows disappear.
    pub fn clear(&self) {
        self.events.emit(PluginEvent::DidUpdateVars(Vec::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::KernelLanguage;
    use crate::resources::KernelResources;
    use crate::testing::FakeKernel;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::broadcast::error::TryRecvError;

    fn bridge(events: &EventBus) -> VariableExplorerBridge {
        let installer = KernelPluginInstaller::new(Arc::new(KernelResources::bundled().unwrap()));
        VariableExplorerBridge::new(installer, events.clone())
    }

    #[test]
    fn test_variable_record_lenient_fields() {
        let records: Vec<VariableRecord> = serde_json::from_value(json!([
            {"name": "n", "type": "int", "size": "", "value": 42},
            {"name": "f", "type": "float", "size": "", "value": 1.5},
            {"name": "l", "type": "list", "size": 3, "value": ""},
            {"name": "a", "type": "float64", "size": "2x3", "value": "Bytes: 48"},
            {"name": "b", "type": "bool", "value": true},
        ]))
        .unwrap();

        assert_eq!(records[0].value, "42");
        assert_eq!(records[1].value, "1.5");
        assert_eq!(records[2].size, "3");
        assert_eq!(records[3].size, "2x3");
        assert_eq!(records[4].size, "");
        assert_eq!(records[4].value, "true");
        assert_eq!(records[0].type_name, "int");
    }

    #[test]
    fn test_variable_record_serializes_type_key() {
        let record = VariableRecord {
            name: "x".into(),
            type_name: "int".into(),
            size: "".into(),
            value: "1".into(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "int");
    }

    #[test]
    fn test_error_payload_emits_nothing() {
        let events = EventBus::new();
        let mut rx = events.subscribe();

        assert!(bridge(&events)
            .handle_payload(&json!({"error": "name 'x' is not defined"}))
            .is_none());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_payload_without_fields_is_ignored() {
        let events = EventBus::new();
        let mut rx = events.subscribe();

        assert!(bridge(&events).handle_payload(&json!({"other": 1})).is_none());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_variables_payload_emits_update() {
        let events = EventBus::new();
        let mut rx = events.subscribe();

        let records = bridge(&events)
            .handle_payload(&json!({"variables": [
                {"name": "a", "type": "str", "size": 5, "value": "hello"},
                {"name": "b", "type": "int", "size": "", "value": 2},
            ]}))
            .unwrap();

        assert_eq!(records.len(), 2);
        match rx.try_recv().unwrap() {
            PluginEvent::DidUpdateVars(vars) => {
                assert_eq!(vars, records);
                assert_eq!(vars[0].name, "a");
                assert_eq!(vars[1].name, "b");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_update_installs_then_queries() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let kernel = FakeKernel::default();
        let session = KernelSession::new("k1", KernelLanguage::Python);

        let records = bridge(&events).request_update(&session, &kernel).await.unwrap();

        assert_eq!(records[0].name, "x");
        assert!(session.plugin_installed());
        assert_eq!(kernel.executed().len(), 3);
        assert_eq!(kernel.helper_executed().len(), 3);
        assert!(matches!(rx.try_recv(), Ok(PluginEvent::DidUpdateVars(_))));
    }

    #[tokio::test]
    async fn test_request_update_after_failed_probe_is_silent() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let kernel = FakeKernel::default();
        *kernel.probe_reply.lock().unwrap() = json!("fail");
        let session = KernelSession::new("k1", KernelLanguage::Python);
        let bridge = bridge(&events);

        assert!(bridge.request_update(&session, &kernel).await.is_none());
        assert!(bridge.request_update(&session, &kernel).await.is_none());

        assert_eq!(kernel.executed().len(), 1);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_hook_without_reply_emits_nothing() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let kernel = FakeKernel::default();
        *kernel.hook_reply.lock().unwrap() = None;
        let session = KernelSession::new("k1", KernelLanguage::Python);

        assert!(bridge(&events).request_update(&session, &kernel).await.is_none());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_clear_emits_empty_list() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        bridge(&events).clear();
        assert_eq!(rx.try_recv().unwrap(), PluginEvent::DidUpdateVars(vec![]));
    }
}
