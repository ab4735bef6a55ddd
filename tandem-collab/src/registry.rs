//! Canonical document replicas held by the server.
//!
//! One [`Document`] per id, each behind its own mutex: every apply and
//! every sync-response linearisation for a document runs inside that
//! critical section, so readers never see a half-applied op. Different
//! documents never contend.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use tandem_core::Document;

/// Shared handle to one canonical replica.
pub type SharedDocument = Arc<Mutex<Document>>;

/// Document id → canonical replica.
#[derive(Default)]
pub struct DocumentRegistry {
    documents: RwLock<HashMap<String, SharedDocument>>,
}

impl DocumentRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the replica for `doc_id`, creating an empty one if needed.
    ///
    /// Returns the handle and whether it was created by this call.
    pub async fn get_or_create(&self, doc_id: &str) -> (SharedDocument, bool) {
        // Fast path: read lock
        if let Some(doc) = self.documents.read().await.get(doc_id) {
            return (doc.clone(), false);
        }

        let mut documents = self.documents.write().await;
        if let Some(doc) = documents.get(doc_id) {
            return (doc.clone(), false);
        }
        let doc = Arc::new(Mutex::new(Document::new()));
        documents.insert(doc_id.to_string(), doc.clone());
        log::info!("Created canonical replica for document {doc_id}");
        (doc, true)
    }

    /// Replica for `doc_id`, without creating it.
    pub async fn get(&self, doc_id: &str) -> Option<SharedDocument> {
        self.documents.read().await.get(doc_id).cloned()
    }

    /// Existence check. Never creates.
    pub async fn exists(&self, doc_id: &str) -> bool {
        self.documents.read().await.contains_key(doc_id)
    }

    /// Forget a replica. Connections holding its handle keep it alive.
    pub async fn remove(&self, doc_id: &str) -> Option<SharedDocument> {
        self.documents.write().await.remove(doc_id)
    }

    /// Number of canonical replicas held.
    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    /// Whether no replica is held.
    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }

    /// Ids of every held replica, in no particular order.
    pub async fn document_ids(&self) -> Vec<String> {
        self.documents.read().await.keys().cloned().collect()
    }
}
