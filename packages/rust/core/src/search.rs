//! Similarity-search boundary used by the enrichment stage.

use std::sync::Arc;

use async_trait::async_trait;

use docdrift_shared::{Result, RetrievedPassage};
use docdrift_storage::Storage;

/// Returns the `top_k` documentation passages most related to `query`,
/// best first.
#[async_trait]
pub trait DocumentSearch: Send + Sync {
    async fn search_similar_documents(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedPassage>>;
}

/// Search backed by the FTS5 index over `reference_docs`.
pub struct StorageSearch {
    storage: Arc<Storage>,
}

impl StorageSearch {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl DocumentSearch for StorageSearch {
    async fn search_similar_documents(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedPassage>> {
        let limit = u32::try_from(top_k).unwrap_or(u32::MAX);
        self.storage.search_reference_docs(query, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docdrift_shared::ReferenceDoc;
    use uuid::Uuid;

    #[tokio::test]
    async fn storage_search_respects_top_k() {
        let tmp = std::env::temp_dir().join(format!("dd_core_{}.db", Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&tmp).await.unwrap());
        for i in 0..4 {
            storage
                .upsert_reference_doc(&ReferenceDoc {
                    path: format!("webhooks/{i}.md"),
                    title: Some(format!("Webhooks part {i}")),
                    content: "Webhook retries and signatures.".into(),
                })
                .await
                .unwrap();
        }

        let search = StorageSearch::new(storage);
        let hits = search.search_similar_documents("webhook signatures", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.path.starts_with("webhooks/")));
    }
}
