// SQLite-backed document store.
//
// One `documents` row per document id. Blocking rusqlite calls run on the
// tokio blocking pool behind a single connection mutex.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tandem_common::types::DocumentId;
use tracing::debug;

use super::{
    checksum, inactive_cutoff, DocumentStore, PersistedDocument, StoreError, StoreFuture,
    UpsertDocument, UpsertOutcome,
};

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE documents (
    document_id         TEXT PRIMARY KEY,
    workspace_id        TEXT NOT NULL,
    file_path           TEXT NOT NULL,
    state               BLOB NOT NULL,
    version             INTEGER NOT NULL,
    checksum            TEXT NOT NULL,
    last_modified_by    TEXT NULL,
    metadata            TEXT NOT NULL DEFAULT '{}',
    updated_at          TEXT NOT NULL
);

CREATE INDEX documents_workspace_idx
    ON documents (workspace_id);
"#;

const MIGRATION_V2_SQL: &str = r#"
CREATE INDEX documents_updated_at_idx
    ON documents (updated_at);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL), (2, MIGRATION_V2_SQL)];

#[derive(Debug, Clone)]
pub struct SqliteDocumentStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDocumentStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create document store directory `{}`", parent.display())
            })?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("failed to open document store at `{}`", path.display()))?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )
        .context("failed to configure sqlite pragmas for document store")?;

        ensure_migration_table(&conn)?;
        apply_pending_migrations(&mut conn)?;

        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn schema_version(&self) -> Result<i64> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("document store connection mutex poisoned"))?;
        current_schema_version(&conn)
    }

    async fn with_connection<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| {
                StoreError::Unavailable("document store connection mutex poisoned".into())
            })?;
            operation(&mut guard)
        })
        .await?
    }
}

impl DocumentStore for SqliteDocumentStore {
    fn load_record<'a>(
        &'a self,
        document_id: &'a DocumentId,
    ) -> StoreFuture<'a, Option<PersistedDocument>> {
        let document_id = document_id.clone();
        Box::pin(self.with_connection(move |conn| load_row(conn, &document_id)))
    }

    fn upsert_record<'a>(
        &'a self,
        document_id: &'a DocumentId,
        record: UpsertDocument,
    ) -> StoreFuture<'a, UpsertOutcome> {
        let document_id = document_id.clone();
        Box::pin(self.with_connection(move |conn| upsert_row(conn, &document_id, record)))
    }

    fn delete_if_inactive<'a>(
        &'a self,
        threshold: Duration,
        keep: &'a HashSet<DocumentId>,
    ) -> StoreFuture<'a, u64> {
        let cutoff = format_timestamp(inactive_cutoff(threshold));
        let keep: HashSet<String> = keep.iter().map(|id| id.as_str().to_owned()).collect();
        Box::pin(self.with_connection(move |conn| delete_inactive_rows(conn, &cutoff, &keep)))
    }
}

fn load_row(
    conn: &mut Connection,
    document_id: &DocumentId,
) -> Result<Option<PersistedDocument>, StoreError> {
    let row = conn
        .query_row(
            "SELECT workspace_id, file_path, state, version, checksum, \
                    last_modified_by, metadata, updated_at \
             FROM documents \
             WHERE document_id = ?1",
            params![document_id.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            },
        )
        .optional()?;

    let Some((
        workspace_id,
        file_path,
        state,
        version,
        checksum,
        last_modified_by,
        metadata,
        updated_at,
    )) = row
    else {
        return Ok(None);
    };

    let metadata = serde_json::from_str(&metadata).map_err(|error| StoreError::Malformed {
        document_id: document_id.clone(),
        reason: format!("metadata is not valid JSON: {error}"),
    })?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_at)
        .map_err(|error| StoreError::Malformed {
            document_id: document_id.clone(),
            reason: format!("updated_at `{updated_at}` is not RFC 3339: {error}"),
        })?
        .with_timezone(&Utc);

    Ok(Some(PersistedDocument {
        document_id: document_id.clone(),
        workspace_id,
        file_path,
        state,
        version,
        checksum,
        last_modified_by,
        metadata,
        updated_at,
    }))
}

fn upsert_row(
    conn: &mut Connection,
    document_id: &DocumentId,
    record: UpsertDocument,
) -> Result<UpsertOutcome, StoreError> {
    let tx = conn.transaction()?;
    let previous: Option<i64> = tx
        .query_row(
            "SELECT version FROM documents WHERE document_id = ?1",
            params![document_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    let version = previous.unwrap_or(0) + 1;
    let checksum = checksum(&record.state);
    let metadata = record.metadata.to_string();
    let updated_at = format_timestamp(Utc::now());

    tx.execute(
        "INSERT INTO documents \
         (document_id, workspace_id, file_path, state, version, checksum, \
          last_modified_by, metadata, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
         ON CONFLICT(document_id) DO UPDATE SET \
             workspace_id = excluded.workspace_id, \
             file_path = excluded.file_path, \
             state = excluded.state, \
             version = excluded.version, \
             checksum = excluded.checksum, \
             last_modified_by = excluded.last_modified_by, \
             metadata = excluded.metadata, \
             updated_at = excluded.updated_at",
        params![
            document_id.as_str(),
            record.workspace_id,
            record.file_path,
            record.state,
            version,
            checksum,
            record.last_modified_by,
            metadata,
            updated_at,
        ],
    )?;
    tx.commit()?;

    Ok(UpsertOutcome { version, checksum })
}

fn delete_inactive_rows(
    conn: &mut Connection,
    cutoff: &str,
    keep: &HashSet<String>,
) -> Result<u64, StoreError> {
    let tx = conn.transaction()?;
    let stale = {
        let mut stmt = tx.prepare("SELECT document_id FROM documents WHERE updated_at < ?1")?;
        let rows = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let mut deleted = 0;
    for document_id in stale.iter().filter(|id| !keep.contains(*id)) {
        deleted +=
            tx.execute("DELETE FROM documents WHERE document_id = ?1", params![document_id])?;
    }
    tx.commit()?;

    debug!(deleted, kept = keep.len(), cutoff, "swept inactive document records");
    Ok(deleted as u64)
}

// Fixed-width UTC timestamps compare correctly as text.
fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ensure_migration_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );
        ",
    )
    .context("failed to ensure schema_migrations table exists")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read current schema version")
}

fn apply_pending_migrations(conn: &mut Connection) -> Result<()> {
    let mut current_version = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current_version {
            continue;
        }

        let tx = conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(sql)
            .with_context(|| format!("failed to apply document store migration v{version}"))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            params![version],
        )
        .with_context(|| format!("failed to record migration v{version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        current_version = *version;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upsert(state: &[u8], user: &str) -> UpsertDocument {
        UpsertDocument {
            workspace_id: "ws1".into(),
            file_path: "main.py".into(),
            state: state.to_vec(),
            last_modified_by: Some(user.into()),
            metadata: json!({ "language": "python" }),
        }
    }

    #[test]
    fn open_applies_all_migrations_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("documents.db");

        let first = SqliteDocumentStore::open(&path).expect("store should open");
        assert_eq!(first.schema_version().unwrap(), 2);
        drop(first);

        let second = SqliteDocumentStore::open(&path).expect("store should reopen");
        assert_eq!(second.schema_version().unwrap(), 2);
    }

    #[tokio::test]
    async fn upsert_then_load_round_trips_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteDocumentStore::open(dir.path().join("documents.db")).unwrap();
        let id = DocumentId::from("ws1:main.py");

        let first = store.upsert_record(&id, upsert(b"v1", "alice")).await.unwrap();
        let second = store.upsert_record(&id, upsert(b"v2", "bob")).await.unwrap();
        assert_eq!((first.version, second.version), (1, 2));

        let loaded = store.load_record(&id).await.unwrap().expect("record should exist");
        assert_eq!(loaded.state, b"v2");
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.checksum, checksum(b"v2"));
        assert_eq!(loaded.checksum, second.checksum);
        assert_eq!(loaded.last_modified_by.as_deref(), Some("bob"));
        assert_eq!(loaded.metadata, json!({ "language": "python" }));
        assert_eq!(loaded.file_path, "main.py");
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("documents.db");
        let id = DocumentId::from("ws1:main.py");
        {
            let store = SqliteDocumentStore::open(&path).unwrap();
            store.upsert_record(&id, upsert(b"durable", "alice")).await.unwrap();
        }

        let reopened = SqliteDocumentStore::open(&path).unwrap();
        let loaded = reopened.load_record(&id).await.unwrap().expect("record should persist");
        assert_eq!(loaded.state, b"durable");
        assert!(reopened.load_record(&DocumentId::from("ws1:other.py")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_if_inactive_respects_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteDocumentStore::open(dir.path().join("documents.db")).unwrap();
        let id = DocumentId::from("ws1:main.py");
        store.upsert_record(&id, upsert(b"recent", "alice")).await.unwrap();

        let none = HashSet::new();
        assert_eq!(store.delete_if_inactive(Duration::from_secs(3600), &none).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.delete_if_inactive(Duration::ZERO, &none).await.unwrap(), 1);
        assert!(store.load_record(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_if_inactive_leaves_kept_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteDocumentStore::open(dir.path().join("documents.db")).unwrap();
        let open = DocumentId::from("ws1:open.py");
        let closed = DocumentId::from("ws1:closed.py");
        store.upsert_record(&open, upsert(b"open", "alice")).await.unwrap();
        store.upsert_record(&closed, upsert(b"closed", "alice")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let keep = HashSet::from([open.clone()]);
        assert_eq!(store.delete_if_inactive(Duration::ZERO, &keep).await.unwrap(), 1);
        assert!(store.load_record(&open).await.unwrap().is_some());
        assert!(store.load_record(&closed).await.unwrap().is_none());
    }
}
