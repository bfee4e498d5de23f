use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tracing::{debug, error};

use crate::index::{BackupEntry, EntryIdentity, Location, OpType, SubjectDetail, SubjectKind};
use crate::{Error, Result};

pub const CATALOG_FILE: &str = "catalog.sqlite";

/// SQLite-backed store of the scanned backup index. Populated wholesale by
/// the refresh flow; reads return stable snapshots of the table.
pub struct BackupCatalog {
    pool: SqlitePool,
}

impl BackupCatalog {
    pub async fn open(path: &Path) -> Result<Self> {
        debug!(
            event = "sqlite.open",
            db_path = %path.display(),
            create_if_missing = true,
            "sqlite.open"
        );
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .synchronous(SqliteSynchronous::Normal);
        Self::connect(options, path).await
    }

    /// Private in-memory catalog, used by tests. Lives as long as the
    /// single pooled connection.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .journal_mode(SqliteJournalMode::Memory);
        Self::connect(options, Path::new(":memory:")).await
    }

    async fn connect(options: SqliteConnectOptions, path: &Path) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| {
                error!(
                    event = "io.sqlite.connect_failed",
                    db_path = %path.display(),
                    error = %e,
                    "io.sqlite.connect_failed"
                );
                e
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .map_err(|e| {
                error!(
                    event = "io.sqlite.pragma_failed",
                    db_path = %path.display(),
                    error = %e,
                    "io.sqlite.pragma_failed"
                );
                e
            })?;

        sqlx::migrate!().run(&pool).await.map_err(|e| {
            error!(
                event = "io.sqlite.migrate_failed",
                db_path = %path.display(),
                error = %e,
                "io.sqlite.migrate_failed"
            );
            e
        })?;

        Ok(Self { pool })
    }

    pub async fn entries_for(&self, kind: SubjectKind) -> Result<Vec<BackupEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT subject_id, op_type, user_id, preserve_id, remote, backup_dir,
                   size_bytes, size_display, detail, created_at
            FROM entries
            WHERE kind = ?
            ORDER BY subject_id, user_id, preserve_id
            "#,
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Replaces one kind's population in a single transaction. A refresh
    /// scans that kind's full artifact tree, so partial updates never
    /// happen; the other kind's rows are left alone. Entries of a foreign
    /// kind are skipped.
    pub async fn replace_all(&self, kind: SubjectKind, entries: &[BackupEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM entries WHERE kind = ?")
            .bind(kind.as_str())
            .execute(&mut *tx)
            .await?;

        let mut rows = 0usize;
        for entry in entries.iter().filter(|e| e.kind() == kind) {
            let detail = serde_json::to_string(&entry.detail).map_err(|e| Error::InvalidConfig {
                message: format!("entry detail encode failed: {e}"),
            })?;
            sqlx::query(
                r#"
                INSERT INTO entries (kind, subject_id, op_type, user_id, preserve_id,
                                     remote, backup_dir, size_bytes, size_display,
                                     detail, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(entry.kind().as_str())
            .bind(&entry.subject_id)
            .bind(entry.op_type.as_str())
            .bind(entry.user_id.map(i64::from).unwrap_or(-1))
            .bind(entry.preserve_id)
            .bind(entry.location.as_token())
            .bind(&entry.backup_dir)
            .bind(entry.size_bytes as i64)
            .bind(&entry.size_display)
            .bind(detail)
            .bind(entry.created_at.map(|dt| dt.to_rfc3339()))
            .execute(&mut *tx)
            .await?;
            rows += 1;
        }

        tx.commit().await?;
        debug!(event = "catalog.replace", kind = kind.as_str(), rows, "catalog.replace");
        Ok(())
    }

    /// Removes the row matching the identity. Returns the number of rows
    /// deleted (0 when the entry was already gone).
    pub async fn remove(&self, identity: &EntryIdentity) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM entries
            WHERE subject_id = ? AND op_type = ? AND user_id = ?
              AND preserve_id = ? AND remote = ? AND backup_dir = ?
            "#,
        )
        .bind(&identity.subject_id)
        .bind(identity.op_type.as_str())
        .bind(identity.user_id.map(i64::from).unwrap_or(-1))
        .bind(identity.preserve_id)
        .bind(identity.location.as_token())
        .bind(&identity.backup_dir)
        .execute(&self.pool)
        .await?;

        let removed = result.rows_affected();
        debug!(event = "catalog.remove", identity = %identity, removed, "catalog.remove");
        Ok(removed)
    }

    /// Distinct remote account names referenced by any entry, sorted.
    pub async fn remotes_in_use(&self) -> Result<Vec<String>> {
        let rows =
            sqlx::query("SELECT DISTINCT remote FROM entries WHERE remote <> '' ORDER BY remote")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("remote")).collect())
    }

    pub async fn remote_use_count(&self, name: &str) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM entries WHERE remote = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n").max(0) as u64)
    }

    /// Sorted distinct user ids for the facet domain. Media rows carry no
    /// user id and never contribute.
    pub async fn user_ids(&self, kind: SubjectKind) -> Result<Vec<u32>> {
        let rows = sqlx::query(
            "SELECT DISTINCT user_id FROM entries WHERE kind = ? AND user_id >= 0 ORDER BY user_id",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| r.get::<i64, _>("user_id") as u32)
            .collect())
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<BackupEntry> {
    let op_raw: String = row.get("op_type");
    let op_type = OpType::parse(&op_raw).ok_or_else(|| Error::InvalidConfig {
        message: format!("catalog row has unknown op_type: {op_raw}"),
    })?;

    let user_id: i64 = row.get("user_id");
    let user_id = if user_id < 0 {
        None
    } else {
        Some(user_id as u32)
    };

    let detail_raw: String = row.get("detail");
    let detail: SubjectDetail =
        serde_json::from_str(&detail_raw).map_err(|e| Error::InvalidConfig {
            message: format!("catalog row has invalid detail: {e}"),
        })?;

    let created_at: Option<String> = row.get("created_at");
    let created_at = created_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let size_bytes: i64 = row.get("size_bytes");

    Ok(BackupEntry {
        subject_id: row.get("subject_id"),
        op_type,
        user_id,
        preserve_id: row.get("preserve_id"),
        location: Location::from_token(&row.get::<String, _>("remote")),
        backup_dir: row.get("backup_dir"),
        size_bytes: size_bytes.max(0) as u64,
        size_display: row.get("size_display"),
        detail,
        created_at,
    })
}
