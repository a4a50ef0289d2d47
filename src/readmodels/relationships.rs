//! Parent/child relationship index.
//!
//! Fed by relationship operations in the document scope; answers the
//! outgoing/incoming/path/ancestor queries the API layer delegates here.

use super::ReadModel;
use crate::error::Result;
use crate::events::WrittenBatch;
use crate::model::{ADD_RELATIONSHIP, REMOVE_RELATIONSHIP};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

#[derive(Default)]
struct Graph {
    outgoing: HashMap<String, BTreeSet<String>>,
    incoming: HashMap<String, BTreeSet<String>>,
}

impl Graph {
    fn add_edge(&mut self, parent: &str, child: &str) {
        self.outgoing
            .entry(parent.to_string())
            .or_default()
            .insert(child.to_string());
        self.incoming
            .entry(child.to_string())
            .or_default()
            .insert(parent.to_string());
    }

    fn remove_edge(&mut self, parent: &str, child: &str) {
        if let Some(children) = self.outgoing.get_mut(parent) {
            children.remove(child);
            if children.is_empty() {
                self.outgoing.remove(parent);
            }
        }
        if let Some(parents) = self.incoming.get_mut(child) {
            parents.remove(parent);
            if parents.is_empty() {
                self.incoming.remove(child);
            }
        }
    }
}

/// Read model maintaining the relationship graph.
pub struct RelationshipIndexer {
    graph: RwLock<Graph>,
}

impl RelationshipIndexer {
    pub fn new() -> Self {
        Self {
            graph: RwLock::new(Graph::default()),
        }
    }

    /// Direct children of a document, sorted.
    pub fn get_outgoing(&self, document_id: &str) -> Vec<String> {
        self.graph
            .read()
            .outgoing
            .get(document_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Direct parents of a document, sorted.
    pub fn get_incoming(&self, document_id: &str) -> Vec<String> {
        self.graph
            .read()
            .incoming
            .get(document_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Shortest parent→child path between two documents, if one exists.
    pub fn find_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        if from == to {
            return Some(vec![from.to_string()]);
        }

        let graph = self.graph.read();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut parents: HashMap<&str, &str> = HashMap::new();
        let mut queue: VecDeque<&str> = VecDeque::new();

        visited.insert(from);
        queue.push_back(from);

        while let Some(current) = queue.pop_front() {
            let Some(children) = graph.outgoing.get(current) else {
                continue;
            };
            for child in children {
                if !visited.insert(child.as_str()) {
                    continue;
                }
                parents.insert(child.as_str(), current);
                if child == to {
                    let mut path = vec![to.to_string()];
                    let mut cursor = current;
                    loop {
                        path.push(cursor.to_string());
                        match parents.get(cursor) {
                            Some(previous) => cursor = previous,
                            None => break,
                        }
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(child.as_str());
            }
        }

        None
    }

    /// Every transitive parent of a document, sorted.
    pub fn find_ancestors(&self, document_id: &str) -> Vec<String> {
        let graph = self.graph.read();
        let mut ancestors: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(document_id);

        while let Some(current) = queue.pop_front() {
            let Some(parents) = graph.incoming.get(current) else {
                continue;
            };
            for parent in parents {
                if ancestors.insert(parent.clone()) {
                    queue.push_back(parent.as_str());
                }
            }
        }

        ancestors.into_iter().collect()
    }
}

impl Default for RelationshipIndexer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadModel for RelationshipIndexer {
    fn name(&self) -> &str {
        "relationship-indexer"
    }

    fn apply(&self, batch: &WrittenBatch) -> Result<()> {
        let mut graph = self.graph.write();
        for item in &batch.operations {
            let action = &item.operation.action;
            let edges = action
                .input
                .get("children")
                .and_then(|v| v.as_array())
                .into_iter()
                .flatten()
                .filter_map(|v| v.as_str());

            match action.action_type.as_str() {
                ADD_RELATIONSHIP => {
                    for child in edges {
                        graph.add_edge(&item.context.document_id, child);
                    }
                }
                REMOVE_RELATIONSHIP => {
                    for child in edges {
                        graph.remove_edge(&item.context.document_id, child);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}
