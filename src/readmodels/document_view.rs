//! Latest-state document projection.
//!
//! Folds written operations into a queryable snapshot per document, kept
//! current asynchronously. Reads can be gated on a consistency token so a
//! writer observes its own write.

use super::ReadModel;
use crate::cancel::CancelToken;
use crate::consistency::{ConsistencyToken, ConsistencyTracker};
use crate::error::{EngineError, Result};
use crate::events::WrittenBatch;
use crate::model::{
    apply_document_action, create_document_from_action, ModelRegistry, CREATE_DOCUMENT,
    DOCUMENT_SCOPE,
};
use crate::types::{Document, OperationWithContext};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// One page of document ids, ascending.
#[derive(Clone, Debug)]
pub struct DocumentPage {
    pub ids: Vec<String>,
    pub next_cursor: Option<String>,
}

#[derive(Clone)]
struct ViewEntry {
    /// State per (scope, branch), folded from that stream's operations.
    scopes: BTreeMap<(String, String), Document>,
    document_type: String,
}

/// Read model exposing the current state of every document.
pub struct DocumentView {
    registry: Arc<ModelRegistry>,
    tracker: Arc<ConsistencyTracker>,
    documents: RwLock<HashMap<String, ViewEntry>>,
}

impl DocumentView {
    pub fn new(registry: Arc<ModelRegistry>, tracker: Arc<ConsistencyTracker>) -> Self {
        Self {
            registry,
            tracker,
            documents: RwLock::new(HashMap::new()),
        }
    }

    /// Latest projected state of one scope of a document.
    ///
    /// When a token is given, blocks until the tracker satisfies it (or
    /// times out / aborts) before answering.
    pub fn get(
        &self,
        document_id: &str,
        scope: &str,
        branch: &str,
        token: Option<&ConsistencyToken>,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<Document> {
        if let Some(token) = token {
            self.tracker.wait_for(token, timeout, cancel)?;
        }

        let documents = self.documents.read();
        documents
            .get(document_id)
            .and_then(|entry| entry.scopes.get(&(scope.to_string(), branch.to_string())))
            .cloned()
            .ok_or_else(|| EngineError::DocumentNotFound(document_id.to_string()))
    }

    pub fn exists(&self, document_id: &str) -> bool {
        self.documents.read().contains_key(document_id)
    }

    /// Ids of documents of one type, ascending, cursor-paginated.
    pub fn find_by_type(
        &self,
        document_type: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> DocumentPage {
        let documents = self.documents.read();
        let mut ids: Vec<String> = documents
            .iter()
            .filter(|(_, entry)| entry.document_type == document_type)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();

        let start = match cursor {
            Some(cursor) => ids.partition_point(|id| id.as_str() <= cursor),
            None => 0,
        };

        let end = if limit > 0 {
            (start + limit).min(ids.len())
        } else {
            ids.len()
        };
        let next_cursor = if end < ids.len() {
            ids.get(end - 1).cloned()
        } else {
            None
        };

        DocumentPage {
            ids: ids[start..end].to_vec(),
            next_cursor,
        }
    }

    fn fold_one(&self, item: &OperationWithContext) -> Result<()> {
        let context = &item.context;
        let operation = &item.operation;
        let key = (context.scope.clone(), context.branch.clone());

        let mut documents = self.documents.write();

        if operation.action.action_type == CREATE_DOCUMENT {
            let document = create_document_from_action(
                &context.document_id,
                &operation.action,
                &self.registry,
            )?;
            let entry = documents
                .entry(context.document_id.clone())
                .or_insert_with(|| ViewEntry {
                    scopes: BTreeMap::new(),
                    document_type: context.document_type.clone(),
                });
            entry.scopes.insert(key, document);
            return Ok(());
        }

        let entry = documents
            .get_mut(&context.document_id)
            .ok_or_else(|| EngineError::DocumentNotFound(context.document_id.clone()))?;

        // Scopes other than the creating one start from the created base.
        let base = entry
            .scopes
            .get(&key)
            .or_else(|| {
                entry
                    .scopes
                    .get(&(DOCUMENT_SCOPE.to_string(), context.branch.clone()))
            })
            .cloned()
            .ok_or_else(|| EngineError::DocumentNotFound(context.document_id.clone()))?;

        let mut document = if context.scope == DOCUMENT_SCOPE {
            apply_document_action(base, &operation.action)?
        } else {
            let model = self.registry.get(&entry.document_type)?;
            model.reduce(base, &operation.action)?
        };

        document
            .header
            .revision
            .insert(context.scope.clone(), operation.index);
        document.header.last_modified = operation.timestamp;
        entry.scopes.insert(key, document);
        Ok(())
    }
}

impl ReadModel for DocumentView {
    fn name(&self) -> &str {
        "document-view"
    }

    fn apply(&self, batch: &WrittenBatch) -> Result<()> {
        for item in &batch.operations {
            self.fold_one(item)?;
        }
        Ok(())
    }
}
