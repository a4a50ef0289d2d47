//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use folio::{Action, Document, DocumentModel, Engine, EngineError, ModelRegistry, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A list-and-map document model.
///
/// Actions:
/// - `APPEND {"value": v}` — push onto the `items` array (order-sensitive)
/// - `SET {"key": k, "value": v}` — set a key in the `fields` map
/// - `NOOP` — no state change (used with `skip` for undo metadata)
/// - `FAIL` — always errors
pub struct ListModel;

impl DocumentModel for ListModel {
    fn document_type(&self) -> &str {
        "test/list"
    }

    fn create(&self, initial_state: Option<Value>) -> Value {
        initial_state.unwrap_or_else(|| json!({"items": [], "fields": {}}))
    }

    fn reduce(&self, mut document: Document, action: &Action) -> Result<Document> {
        match action.action_type.as_str() {
            "APPEND" => {
                let value = action.input.get("value").cloned().unwrap_or(Value::Null);
                if let Some(items) = document
                    .state
                    .get_mut("items")
                    .and_then(|v| v.as_array_mut())
                {
                    items.push(value);
                }
                Ok(document)
            }
            "SET" => {
                let key = action
                    .input
                    .get("key")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| EngineError::reducer("SET", "missing key"))?
                    .to_string();
                let value = action.input.get("value").cloned().unwrap_or(Value::Null);
                if let Some(fields) = document
                    .state
                    .get_mut("fields")
                    .and_then(|v| v.as_object_mut())
                {
                    fields.insert(key, value);
                }
                Ok(document)
            }
            "NOOP" => Ok(document),
            "FAIL" => Err(EngineError::reducer("FAIL", "requested failure")),
            other => Err(EngineError::reducer(other, "unknown action")),
        }
    }
}

pub fn registry() -> Arc<ModelRegistry> {
    let registry = Arc::new(ModelRegistry::new());
    registry.register(Arc::new(ListModel)).unwrap();
    registry
}

pub fn engine() -> Arc<Engine> {
    Engine::in_memory(registry())
}

pub fn append(value: impl Into<Value>) -> Action {
    Action::new("APPEND", "global", json!({"value": value.into()}))
}

/// Run a job to completion and assert it succeeded.
pub fn complete(engine: &Engine, job: folio::JobId) -> folio::JobInfo {
    let info = engine
        .wait_for_job(job, Some(Duration::from_secs(10)), None)
        .unwrap();
    assert_eq!(
        info.status,
        folio::JobStatus::Completed,
        "job failed: {:?}",
        info.error
    );
    info
}

/// Poll until a condition holds, failing after a bounded wait.
pub fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}
