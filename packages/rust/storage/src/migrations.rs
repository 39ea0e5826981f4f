//! SQL migration definitions for the DocDrift database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: streams, messages, watermarks, classifications, contexts, proposals",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Connector registrations (written by ingestion)
CREATE TABLE IF NOT EXISTS streams (
    stream_id      TEXT PRIMARY KEY,
    connector_type TEXT NOT NULL,
    config_json    TEXT NOT NULL DEFAULT '{}',
    enabled        INTEGER NOT NULL DEFAULT 1
);

-- Normalized messages from every source
CREATE TABLE IF NOT EXISTS messages (
    id            TEXT PRIMARY KEY,
    stream_id     TEXT NOT NULL,
    source_id     TEXT NOT NULL,
    ts            TEXT NOT NULL,
    author        TEXT NOT NULL,
    content       TEXT NOT NULL,
    channel       TEXT,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    status        TEXT NOT NULL DEFAULT 'PENDING'
                  CHECK (status IN ('PENDING', 'COMPLETED', 'FAILED')),
    UNIQUE(stream_id, source_id)
);

CREATE INDEX IF NOT EXISTS idx_messages_stream_status_ts ON messages(stream_id, status, ts);

-- Per-stream processing checkpoint
CREATE TABLE IF NOT EXISTS watermarks (
    stream_id      TEXT PRIMARY KEY,
    watermark_time TEXT NOT NULL,
    last_batch_at  TEXT,
    updated_at     TEXT NOT NULL
);

-- Classification outcome for valuable messages
CREATE TABLE IF NOT EXISTS classifications (
    message_id      TEXT PRIMARY KEY,
    batch_id        TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    category        TEXT NOT NULL,
    reasoning       TEXT NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_classifications_batch ON classifications(batch_id);
CREATE INDEX IF NOT EXISTS idx_classifications_conversation ON classifications(conversation_id, batch_id);

-- Retrieved grounding per conversation
CREATE TABLE IF NOT EXISTS conversation_contexts (
    conversation_id TEXT NOT NULL,
    batch_id        TEXT NOT NULL,
    query           TEXT NOT NULL,
    passages_json   TEXT NOT NULL,
    token_count     INTEGER NOT NULL,
    created_at      TEXT NOT NULL,
    PRIMARY KEY (conversation_id, batch_id)
);

-- Documentation change proposals
CREATE TABLE IF NOT EXISTS proposals (
    id                 TEXT PRIMARY KEY,
    batch_id           TEXT NOT NULL,
    conversation_id    TEXT NOT NULL,
    kind               TEXT NOT NULL CHECK (kind IN ('insert', 'update', 'delete')),
    page               TEXT NOT NULL,
    section            TEXT,
    suggested_text     TEXT NOT NULL,
    reasoning          TEXT NOT NULL,
    source_ids_json    TEXT NOT NULL,
    review_state       TEXT NOT NULL DEFAULT 'pending',
    reviewer           TEXT,
    reviewed_at        TEXT,
    created_at         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_proposals_batch ON proposals(batch_id);
CREATE INDEX IF NOT EXISTS idx_proposals_state ON proposals(review_state, created_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Reference documentation corpus with FTS5 index",
            sql: r#"
CREATE TABLE IF NOT EXISTS reference_docs (
    path       TEXT PRIMARY KEY,
    title      TEXT,
    content    TEXT NOT NULL,
    indexed_at TEXT NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS reference_docs_fts USING fts5(
    title,
    content,
    content=reference_docs,
    content_rowid=rowid
);

-- Triggers to keep FTS in sync with reference_docs
CREATE TRIGGER IF NOT EXISTS reference_docs_fts_insert AFTER INSERT ON reference_docs BEGIN
    INSERT INTO reference_docs_fts(rowid, title, content)
    VALUES (new.rowid, new.title, new.content);
END;

CREATE TRIGGER IF NOT EXISTS reference_docs_fts_delete AFTER DELETE ON reference_docs BEGIN
    INSERT INTO reference_docs_fts(reference_docs_fts, rowid, title, content)
    VALUES ('delete', old.rowid, old.title, old.content);
END;

CREATE TRIGGER IF NOT EXISTS reference_docs_fts_update AFTER UPDATE ON reference_docs BEGIN
    INSERT INTO reference_docs_fts(reference_docs_fts, rowid, title, content)
    VALUES ('delete', old.rowid, old.title, old.content);
    INSERT INTO reference_docs_fts(rowid, title, content)
    VALUES (new.rowid, new.title, new.content);
END;

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_ascending_and_recorded() {
        let migrations = all_migrations();
        for (i, m) in migrations.iter().enumerate() {
            assert_eq!(m.version as usize, i + 1);
            assert!(
                m.sql
                    .contains(&format!("INSERT INTO schema_migrations (version) VALUES ({})", m.version)),
                "migration {} does not record itself",
                m.version
            );
        }
    }
}
