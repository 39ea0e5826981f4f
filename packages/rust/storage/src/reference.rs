//! Reference documentation corpus and its FTS5 index.

use chrono::Utc;
use docdrift_shared::{ReferenceDoc, Result, RetrievedPassage, sortable_timestamp};
use libsql::params;

use crate::{Storage, storage_err};

/// Longest query we hand to FTS5, in terms.
const MAX_QUERY_TERMS: usize = 24;

impl Storage {
    /// Insert or replace a reference document by path.
    pub async fn upsert_reference_doc(&self, doc: &ReferenceDoc) -> Result<()> {
        self.check_writable()?;
        let now = sortable_timestamp(&Utc::now());
        self.conn
            .execute(
                "INSERT INTO reference_docs (path, title, content, indexed_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(path) DO UPDATE SET
                   title = excluded.title,
                   content = excluded.content,
                   indexed_at = excluded.indexed_at",
                params![doc.path.as_str(), doc.title.as_deref(), doc.content.as_str(), now],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Number of indexed reference documents.
    pub async fn count_reference_docs(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM reference_docs", params![])
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(storage_err)? as u64),
            None => Ok(0),
        }
    }

    /// Full-text search over the reference corpus.
    ///
    /// Free text is reduced to quoted terms joined with `OR`, so arbitrary
    /// user or model text never trips the FTS5 query grammar. Scores are
    /// negated BM25 ranks: higher is better.
    pub async fn search_reference_docs(
        &self,
        query: &str,
        limit: u32,
    ) -> Result<Vec<RetrievedPassage>> {
        let Some(match_expr) = fts_match_expression(query) else {
            return Ok(Vec::new());
        };

        let mut rows = self
            .conn
            .query(
                "SELECT d.path, d.title, d.content, rank
                 FROM reference_docs_fts fts
                 JOIN reference_docs d ON d.rowid = fts.rowid
                 WHERE reference_docs_fts MATCH ?1
                 ORDER BY rank
                 LIMIT ?2",
                params![match_expr, limit],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let rank: f64 = row.get(3).unwrap_or(0.0);
            results.push(RetrievedPassage {
                path: row.get(0).map_err(storage_err)?,
                title: row.get::<String>(1).ok(),
                content: row.get(2).map_err(storage_err)?,
                score: -rank,
            });
        }
        Ok(results)
    }
}

/// Build an FTS5 `MATCH` expression from free text, or `None` if no usable
/// terms remain.
fn fts_match_expression(query: &str) -> Option<String> {
    let mut terms: Vec<String> = Vec::new();
    for raw in query.split(|c: char| !c.is_alphanumeric()) {
        if raw.chars().count() < 2 {
            continue;
        }
        let term = raw.to_lowercase();
        if !terms.contains(&term) {
            terms.push(term);
        }
        if terms.len() == MAX_QUERY_TERMS {
            break;
        }
    }
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_storage;

    #[test]
    fn match_expression_strips_syntax() {
        assert_eq!(
            fts_match_expression("How do I set NEAR(proxy)? -x \"quoted\"").as_deref(),
            Some("\"how\" OR \"do\" OR \"set\" OR \"near\" OR \"proxy\" OR \"quoted\"")
        );
        assert_eq!(fts_match_expression("? ! a"), None);
    }

    #[test]
    fn match_expression_dedupes_terms() {
        assert_eq!(
            fts_match_expression("Proxy proxy PROXY").as_deref(),
            Some("\"proxy\"")
        );
    }

    #[tokio::test]
    async fn search_ranks_matching_docs() {
        let storage = test_storage().await;
        for (path, title, content) in [
            ("guides/install.md", "Installation", "Install the CLI with cargo install."),
            ("guides/proxy.md", "Proxy settings", "Configure an HTTP proxy via HTTPS_PROXY."),
            ("reference/api.md", "API", "Endpoints and authentication tokens."),
        ] {
            storage
                .upsert_reference_doc(&ReferenceDoc {
                    path: path.into(),
                    title: Some(title.into()),
                    content: content.into(),
                })
                .await
                .unwrap();
        }
        assert_eq!(storage.count_reference_docs().await.unwrap(), 3);

        let results = storage
            .search_reference_docs("behind a corporate proxy", 5)
            .await
            .expect("search");
        assert!(!results.is_empty());
        assert_eq!(results[0].path, "guides/proxy.md");
        assert!(results[0].content.contains("HTTPS_PROXY"));

        assert!(storage.search_reference_docs("?!", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_replaces_indexed_content() {
        let storage = test_storage().await;
        let mut doc = ReferenceDoc {
            path: "faq.md".into(),
            title: None,
            content: "Legacy answer about tokens.".into(),
        };
        storage.upsert_reference_doc(&doc).await.unwrap();
        doc.content = "Current answer about webhooks.".into();
        storage.upsert_reference_doc(&doc).await.unwrap();

        assert_eq!(storage.count_reference_docs().await.unwrap(), 1);
        assert!(storage.search_reference_docs("tokens", 5).await.unwrap().is_empty());
        assert_eq!(storage.search_reference_docs("webhooks", 5).await.unwrap().len(), 1);
    }
}
