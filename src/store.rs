//! Collaborator traits for services this crate consumes but does not
//! implement: a partitioned document store and a context-hub search/index
//! service. Modeled as `async_trait` traits so the rest of the crate can be
//! tested against in-memory implementations instead of real Azure Cosmos DB
//! or HTTP endpoints.
//!
//! Grounded on the original implementation's Cosmos-backed containers
//! (`InstructionProcessor`'s `_instruction_container`, `PlanExecutorDriver`'s
//! plan registry) and its context-hub HTTP client, both of which this crate
//! only consumes through a narrow interface.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document {0} not found in container {1}")]
    NotFound(String, String),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// A document, partitioned by `pk` (a partition key, typically a user id).
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub pk: String,
    pub data: Value,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, container: &str, id: &str) -> Result<Document, StoreError>;
    async fn upsert(&self, container: &str, doc: Document) -> Result<(), StoreError>;
    async fn delete(&self, container: &str, id: &str) -> Result<(), StoreError>;
    /// `query` is a narrow substitute for Cosmos SQL: a predicate over a
    /// document's `pk`, not an arbitrary query language.
    async fn query_by_pk(&self, container: &str, pk: &str) -> Result<Vec<Document>, StoreError>;
}

/// In-memory `DocumentStore` used by tests.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    containers: RwLock<HashMap<String, HashMap<String, Document>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, container: &str, id: &str) -> Result<Document, StoreError> {
        self.containers
            .read()
            .unwrap()
            .get(container)
            .and_then(|docs| docs.get(id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string(), container.to_string()))
    }

    async fn upsert(&self, container: &str, doc: Document) -> Result<(), StoreError> {
        self.containers
            .write()
            .unwrap()
            .entry(container.to_string())
            .or_default()
            .insert(doc.id.clone(), doc);
        Ok(())
    }

    async fn delete(&self, container: &str, id: &str) -> Result<(), StoreError> {
        self.containers
            .write()
            .unwrap()
            .get_mut(container)
            .and_then(|docs| docs.remove(id))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string(), container.to_string()))
    }

    async fn query_by_pk(&self, container: &str, pk: &str) -> Result<Vec<Document>, StoreError> {
        Ok(self
            .containers
            .read()
            .unwrap()
            .get(container)
            .map(|docs| docs.values().filter(|d| d.pk == pk).cloned().collect())
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
pub struct ContextDoc {
    pub id: String,
    pub user_id: String,
    pub content: String,
}

/// The context-hub HTTP contract (`GET /search`, `POST /docs`, `PUT
/// /docs/{id}`, `GET /docs/{id}`, all keyed by `X-User-Id`), narrowed to the
/// operations this crate's drivers actually need.
#[async_trait]
pub trait ContextHub: Send + Sync {
    async fn search(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<ContextDoc>, StoreError>;
    async fn put_doc(&self, user_id: &str, doc: ContextDoc) -> Result<(), StoreError>;
    async fn get_doc(&self, user_id: &str, id: &str) -> Result<ContextDoc, StoreError>;
}

/// In-memory `ContextHub` used by tests.
#[derive(Default)]
pub struct InMemoryContextHub {
    docs: RwLock<HashMap<String, Vec<ContextDoc>>>,
}

impl InMemoryContextHub {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextHub for InMemoryContextHub {
    async fn search(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<ContextDoc>, StoreError> {
        let query = query.to_lowercase();
        Ok(self
            .docs
            .read()
            .unwrap()
            .get(user_id)
            .map(|docs| {
                docs.iter()
                    .filter(|d| d.content.to_lowercase().contains(&query))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn put_doc(&self, user_id: &str, doc: ContextDoc) -> Result<(), StoreError> {
        let mut docs = self.docs.write().unwrap();
        let user_docs = docs.entry(user_id.to_string()).or_default();
        if let Some(existing) = user_docs.iter_mut().find(|d| d.id == doc.id) {
            *existing = doc;
        } else {
            user_docs.push(doc);
        }
        Ok(())
    }

    async fn get_doc(&self, user_id: &str, id: &str) -> Result<ContextDoc, StoreError> {
        self.docs
            .read()
            .unwrap()
            .get(user_id)
            .and_then(|docs| docs.iter().find(|d| d.id == id).cloned())
            .ok_or_else(|| StoreError::NotFound(id.to_string(), "context".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn document_store_round_trips() {
        let store = InMemoryDocumentStore::new();
        store
            .upsert("instructions", Document { id: "i1".into(), pk: "u1".into(), data: Value::Null })
            .await
            .unwrap();
        let doc = store.get("instructions", "i1").await.unwrap();
        assert_eq!(doc.pk, "u1");
        assert_eq!(store.query_by_pk("instructions", "u1").await.unwrap().len(), 1);
        store.delete("instructions", "i1").await.unwrap();
        assert!(store.get("instructions", "i1").await.is_err());
    }

    #[tokio::test]
    async fn context_hub_search_matches_substring_case_insensitively() {
        let hub = InMemoryContextHub::new();
        hub.put_doc("u1", ContextDoc { id: "d1".into(), user_id: "u1".into(), content: "Invoice from Acme".into() })
            .await
            .unwrap();
        let results = hub.search("u1", "invoice", 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(hub.search("u1", "no match", 10).await.unwrap().is_empty());
    }
}
