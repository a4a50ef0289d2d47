//! Document model contract and registry.
//!
//! The engine treats document models as opaque, synchronous, side-effect-free
//! reducers. It does not inspect or generate the action vocabulary itself,
//! with one exception: the document-scope actions below, which the executor
//! applies directly because they manipulate headers and relationships rather
//! than model state.

use crate::error::{EngineError, Result};
use crate::types::{Action, Document, DocumentHeader};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Creates a new document of the named model.
pub const CREATE_DOCUMENT: &str = "CREATE_DOCUMENT";
/// Adds parent→child edges; consumed by the relationship indexer.
pub const ADD_RELATIONSHIP: &str = "ADD_RELATIONSHIP";
/// Removes parent→child edges.
pub const REMOVE_RELATIONSHIP: &str = "REMOVE_RELATIONSHIP";

/// Scope that carries document lifecycle and relationship operations.
pub const DOCUMENT_SCOPE: &str = "document";

/// Actions applied by the executor itself instead of a model reducer.
pub fn is_document_scope_action(action_type: &str) -> bool {
    matches!(
        action_type,
        CREATE_DOCUMENT | ADD_RELATIONSHIP | REMOVE_RELATIONSHIP
    )
}

/// A registered document model: pure construction and folding logic for one
/// document type. Implementations must be deterministic and side-effect-free;
/// a returned error fails the job that submitted the action.
pub trait DocumentModel: Send + Sync {
    /// Type string this model handles.
    fn document_type(&self) -> &str;

    /// Build the initial state for a fresh document.
    fn create(&self, initial_state: Option<serde_json::Value>) -> serde_json::Value;

    /// Fold one action into the document, returning the updated document.
    fn reduce(&self, document: Document, action: &Action) -> Result<Document>;
}

/// Typed map from document-type string to its model, validated at
/// registration time and looked up by key at use time.
pub struct ModelRegistry {
    models: RwLock<HashMap<String, Arc<dyn DocumentModel>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
        }
    }

    /// Register a model. Duplicate registration is a typed error.
    pub fn register(&self, model: Arc<dyn DocumentModel>) -> Result<()> {
        let document_type = model.document_type().to_string();
        if document_type.is_empty() {
            return Err(EngineError::InvalidOperation(
                "document model type must not be empty".into(),
            ));
        }

        let mut models = self.models.write();
        if models.contains_key(&document_type) {
            return Err(EngineError::ModelExists(document_type));
        }
        models.insert(document_type, model);
        Ok(())
    }

    /// Look up a model. Unknown type is a typed error, not a crash.
    pub fn get(&self, document_type: &str) -> Result<Arc<dyn DocumentModel>> {
        self.models
            .read()
            .get(document_type)
            .cloned()
            .ok_or_else(|| EngineError::ModelNotRegistered(document_type.to_string()))
    }

    pub fn contains(&self, document_type: &str) -> bool {
        self.models.read().contains_key(document_type)
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.models.read().keys().cloned().collect();
        types.sort();
        types
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a fresh document from a `CREATE_DOCUMENT` action.
///
/// Input shape: `{ "model": <type>, "initialState": <value?> }`.
pub fn create_document_from_action(
    document_id: &str,
    action: &Action,
    registry: &ModelRegistry,
) -> Result<Document> {
    let model_type = action
        .input
        .get("model")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            EngineError::InvalidOperation(format!(
                "{CREATE_DOCUMENT} action missing 'model' in input"
            ))
        })?;

    let model = registry.get(model_type)?;
    let initial_state = action.input.get("initialState").cloned();
    let state = model.create(initial_state);

    Ok(Document {
        header: DocumentHeader {
            id: document_id.to_string(),
            document_type: model_type.to_string(),
            created_at: action.timestamp,
            last_modified: action.timestamp,
            revision: BTreeMap::new(),
        },
        state,
    })
}

/// Apply a document-scope action to an already-created document.
///
/// Relationship actions only touch indexes downstream; the header's
/// modification time is the only state change here. A repeated
/// `CREATE_DOCUMENT` is rejected rather than folded twice.
pub fn apply_document_action(mut document: Document, action: &Action) -> Result<Document> {
    match action.action_type.as_str() {
        CREATE_DOCUMENT => Err(EngineError::InvalidOperation(format!(
            "document {} already exists",
            document.header.id
        ))),
        ADD_RELATIONSHIP | REMOVE_RELATIONSHIP => {
            document.header.last_modified = action.timestamp;
            Ok(document)
        }
        other => Err(EngineError::InvalidOperation(format!(
            "unknown document-scope action: {other}"
        ))),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::KvModel;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_and_lookup() {
        let registry = ModelRegistry::new();
        registry.register(Arc::new(KvModel)).unwrap();

        assert!(registry.contains("test/kv"));
        assert!(registry.get("test/kv").is_ok());
        assert!(matches!(
            registry.get("unknown"),
            Err(EngineError::ModelNotRegistered(_))
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = ModelRegistry::new();
        registry.register(Arc::new(KvModel)).unwrap();
        assert!(matches!(
            registry.register(Arc::new(KvModel)),
            Err(EngineError::ModelExists(_))
        ));
    }

    #[test]
    fn test_create_document_from_action() {
        let registry = ModelRegistry::new();
        registry.register(Arc::new(KvModel)).unwrap();

        let action = Action::new(
            CREATE_DOCUMENT,
            DOCUMENT_SCOPE,
            json!({"model": "test/kv", "initialState": {"seeded": true}}),
        );
        let document = create_document_from_action("doc-1", &action, &registry).unwrap();

        assert_eq!(document.header.id, "doc-1");
        assert_eq!(document.header.document_type, "test/kv");
        assert_eq!(document.state, json!({"seeded": true}));
    }

    #[test]
    fn test_create_requires_model_input() {
        let registry = ModelRegistry::new();
        let action = Action::new(CREATE_DOCUMENT, DOCUMENT_SCOPE, json!({}));
        assert!(create_document_from_action("doc-1", &action, &registry).is_err());
    }
}
