//! SQLite-backed state store.

use crate::types::{
    ActivityEntry, ConflictEntry, ConflictResolution, FileKind, FileRecord, QueueEntry, QueueOp,
    ShareRecord, ShareStats, SyncStatus, from_millis, to_millis,
};
use crate::{Result, StoreError};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use tracing::debug;

/// Durable state store. One per data directory; thread-safe.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open or create the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory store; used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;

        let store = Self { conn: Mutex::new(conn) };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS shares (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                excludes TEXT NOT NULL DEFAULT '[]',
                size_limit INTEGER,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS files (
                share_id TEXT NOT NULL,
                path TEXT NOT NULL,
                kind TEXT NOT NULL,
                size INTEGER NOT NULL,
                mod_time INTEGER NOT NULL,
                local_hash TEXT NOT NULL DEFAULT '',
                remote_hash TEXT NOT NULL DEFAULT '',
                last_sync_at INTEGER,
                version INTEGER NOT NULL DEFAULT 0,
                sync_status TEXT NOT NULL,
                error_message TEXT,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (share_id, path)
            );

            CREATE TABLE IF NOT EXISTS cursors (
                share_id TEXT PRIMARY KEY,
                cursor TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_queue (
                share_id TEXT NOT NULL,
                path TEXT NOT NULL,
                operation TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                scheduled_at INTEGER NOT NULL,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (share_id, path, operation)
            );

            CREATE TABLE IF NOT EXISTS conflicts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                share_id TEXT NOT NULL,
                path TEXT NOT NULL,
                local_hash TEXT NOT NULL,
                remote_hash TEXT NOT NULL,
                local_mod_time INTEGER NOT NULL,
                remote_mod_time INTEGER NOT NULL,
                resolution TEXT,
                resolved_at INTEGER,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS activity (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                share_id TEXT NOT NULL,
                path TEXT NOT NULL,
                action TEXT NOT NULL,
                status TEXT NOT NULL,
                bytes INTEGER NOT NULL DEFAULT 0,
                message TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_files_share_status
                ON files(share_id, sync_status);
            CREATE INDEX IF NOT EXISTS idx_queue_drain
                ON sync_queue(priority DESC, created_at ASC);
            CREATE INDEX IF NOT EXISTS idx_conflicts_open
                ON conflicts(share_id, resolved_at);
            CREATE INDEX IF NOT EXISTS idx_activity_time
                ON activity(created_at DESC);",
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shares
    // ------------------------------------------------------------------

    /// Insert or refresh a share definition.
    pub fn upsert_share(&self, share: &ShareRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO shares (id, name, excludes, size_limit, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               excludes = excluded.excludes,
               size_limit = excluded.size_limit",
            params![
                share.id,
                share.name,
                serde_json::to_string(&share.excludes)?,
                share.size_limit.map(|v| v as i64),
                to_millis(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Fetch one share.
    pub fn get_share(&self, share_id: &str) -> Result<Option<ShareRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, name, excludes, size_limit FROM shares WHERE id = ?1",
                params![share_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((id, name, excludes, size_limit)) => Ok(Some(ShareRecord {
                id,
                name,
                excludes: serde_json::from_str(&excludes)?,
                size_limit: size_limit.map(|v| v as u64),
            })),
            None => Ok(None),
        }
    }

    /// List every known share.
    pub fn list_shares(&self) -> Result<Vec<ShareRecord>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, name, excludes, size_limit FROM shares ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<i64>>(3)?,
            ))
        })?;

        let mut shares = Vec::new();
        for row in rows {
            let (id, name, excludes, size_limit) = row?;
            shares.push(ShareRecord {
                id,
                name,
                excludes: serde_json::from_str(&excludes)?,
                size_limit: size_limit.map(|v| v as u64),
            });
        }
        Ok(shares)
    }

    // ------------------------------------------------------------------
    // File records
    // ------------------------------------------------------------------

    /// Insert or update a file record by `(share_id, path)`.
    pub fn upsert_file(&self, record: &FileRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO files (share_id, path, kind, size, mod_time, local_hash,
                                remote_hash, last_sync_at, version, sync_status,
                                error_message, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(share_id, path) DO UPDATE SET
               kind = excluded.kind,
               size = excluded.size,
               mod_time = excluded.mod_time,
               local_hash = excluded.local_hash,
               remote_hash = excluded.remote_hash,
               last_sync_at = excluded.last_sync_at,
               version = excluded.version,
               sync_status = excluded.sync_status,
               error_message = excluded.error_message,
               updated_at = excluded.updated_at",
            params![
                record.share_id,
                record.path,
                record.kind.as_str(),
                record.size as i64,
                to_millis(record.mod_time),
                record.local_hash,
                record.remote_hash,
                record.last_sync_at.map(to_millis),
                record.version,
                record.sync_status.as_str(),
                record.error_message,
                to_millis(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Fetch one file record.
    pub fn get_file(&self, share_id: &str, path: &str) -> Result<Option<FileRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{FILE_COLUMNS} WHERE share_id = ?1 AND path = ?2"),
            params![share_id, path],
            file_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Remove a file record.
    pub fn delete_file(&self, share_id: &str, path: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM files WHERE share_id = ?1 AND path = ?2",
            params![share_id, path],
        )?;
        Ok(())
    }

    /// List every record of a share, ordered by path.
    pub fn list_files(&self, share_id: &str) -> Result<Vec<FileRecord>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("{FILE_COLUMNS} WHERE share_id = ?1 ORDER BY path ASC"))?;
        let rows = stmt.query_map(params![share_id], file_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StoreError::from)
    }

    /// List not-yet-synced records of a share, up to `limit`.
    pub fn list_pending(&self, share_id: &str, limit: usize) -> Result<Vec<FileRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{FILE_COLUMNS} WHERE share_id = ?1
               AND sync_status IN ('pending_upload', 'pending_download')
             ORDER BY path ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![share_id, limit as i64], file_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StoreError::from)
    }

    /// Record a terminal error on a path.
    pub fn set_file_error(&self, share_id: &str, path: &str, message: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE files SET sync_status = 'error', error_message = ?3, updated_at = ?4
             WHERE share_id = ?1 AND path = ?2",
            params![share_id, path, message, to_millis(Utc::now())],
        )?;
        Ok(())
    }

    /// Aggregate per-status counters for a share.
    pub fn get_stats(&self, share_id: &str) -> Result<ShareStats> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT sync_status, COUNT(*), COALESCE(SUM(size), 0)
             FROM files WHERE share_id = ?1 AND kind = 'file'
             GROUP BY sync_status",
        )?;
        let rows = stmt.query_map(params![share_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut stats = ShareStats::default();
        for row in rows {
            let (status, count, bytes) = row?;
            let count = count as u64;
            let bytes = bytes as u64;
            stats.total_bytes += bytes;
            match SyncStatus::parse(&status) {
                Some(SyncStatus::Synced) => stats.synced = count,
                Some(SyncStatus::PendingUpload) => {
                    stats.pending_upload = count;
                    stats.pending_bytes += bytes;
                }
                Some(SyncStatus::PendingDownload) => {
                    stats.pending_download = count;
                    stats.pending_bytes += bytes;
                }
                Some(SyncStatus::Conflict) => stats.conflict = count,
                Some(SyncStatus::Error) => stats.error = count,
                None => return Err(StoreError::CorruptRow(format!("sync_status {status}"))),
            }
        }
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Cursors
    // ------------------------------------------------------------------

    /// Read the change-feed cursor for a share.
    pub fn get_cursor(&self, share_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT cursor FROM cursors WHERE share_id = ?1",
            params![share_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Advance the cursor for a share.
    pub fn set_cursor(&self, share_id: &str, cursor: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO cursors (share_id, cursor, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(share_id) DO UPDATE SET
               cursor = excluded.cursor,
               updated_at = excluded.updated_at",
            params![share_id, cursor, to_millis(Utc::now())],
        )?;
        Ok(())
    }

    /// Explicitly forget the cursor; the next pass replays from the start.
    pub fn reset_cursor(&self, share_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM cursors WHERE share_id = ?1", params![share_id])?;
        debug!(share_id, "cursor reset");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Operation queue
    // ------------------------------------------------------------------

    /// Enqueue an operation. If the `(share, path, op)` key already exists
    /// the priority upgrades to the max of old and new and the entry
    /// becomes immediately due; the retry count is preserved.
    pub fn enqueue(&self, share_id: &str, path: &str, op: QueueOp, priority: i64) -> Result<()> {
        let now = to_millis(Utc::now());
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_queue (share_id, path, operation, priority, retry_count,
                                     scheduled_at, last_error, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, NULL, ?5)
             ON CONFLICT(share_id, path, operation) DO UPDATE SET
               priority = MAX(priority, excluded.priority),
               scheduled_at = excluded.scheduled_at",
            params![share_id, path, op.as_str(), priority, now],
        )?;
        Ok(())
    }

    /// Pop up to `limit` due entries, highest priority first, FIFO within
    /// a priority. The rows are deleted in the same transaction, which is
    /// what enforces at-most-one-in-flight per key.
    pub fn dequeue(&self, limit: usize) -> Result<Vec<QueueEntry>> {
        let now = to_millis(Utc::now());
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let entries = {
            let mut stmt = tx.prepare(
                "SELECT share_id, path, operation, priority, retry_count,
                        scheduled_at, last_error, created_at
                 FROM sync_queue WHERE scheduled_at <= ?1
                 ORDER BY priority DESC, created_at ASC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![now, limit as i64], queue_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        for entry in &entries {
            tx.execute(
                "DELETE FROM sync_queue WHERE share_id = ?1 AND path = ?2 AND operation = ?3",
                params![entry.share_id, entry.path, entry.op.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(entries)
    }

    /// Put a failed entry back with a retry delay.
    pub fn requeue(
        &self,
        entry: &QueueEntry,
        last_error: &str,
        retry_count: i64,
        delay: Duration,
    ) -> Result<()> {
        let now = Utc::now();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_queue (share_id, path, operation, priority, retry_count,
                                     scheduled_at, last_error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(share_id, path, operation) DO UPDATE SET
               priority = MAX(priority, excluded.priority),
               retry_count = excluded.retry_count,
               scheduled_at = excluded.scheduled_at,
               last_error = excluded.last_error",
            params![
                entry.share_id,
                entry.path,
                entry.op.as_str(),
                entry.priority,
                retry_count,
                to_millis(now + delay),
                last_error,
                to_millis(entry.created_at),
            ],
        )?;
        Ok(())
    }

    /// Drop a queued operation that has been superseded (e.g. a local
    /// delete overruled by conflict handling).
    pub fn cancel(&self, share_id: &str, path: &str, op: QueueOp) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM sync_queue WHERE share_id = ?1 AND path = ?2 AND operation = ?3",
            params![share_id, path, op.as_str()],
        )?;
        Ok(removed > 0)
    }

    /// Number of queued entries, due or not.
    pub fn queue_len(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    /// Record a detected divergence. Returns the row id.
    pub fn add_conflict(&self, conflict: &ConflictEntry) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO conflicts (share_id, path, local_hash, remote_hash,
                                    local_mod_time, remote_mod_time, resolution,
                                    resolved_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                conflict.share_id,
                conflict.path,
                conflict.local_hash,
                conflict.remote_hash,
                to_millis(conflict.local_mod_time),
                to_millis(conflict.remote_mod_time),
                conflict.resolution.map(ConflictResolution::as_str),
                conflict.resolved_at.map(to_millis),
                to_millis(conflict.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// List conflicts for a share, newest first. `unresolved_only` filters
    /// out settled entries.
    pub fn list_conflicts(&self, share_id: &str, unresolved_only: bool) -> Result<Vec<ConflictEntry>> {
        let conn = self.conn.lock();
        let sql = if unresolved_only {
            "SELECT id, share_id, path, local_hash, remote_hash, local_mod_time,
                    remote_mod_time, resolution, resolved_at, created_at
             FROM conflicts WHERE share_id = ?1 AND resolved_at IS NULL
             ORDER BY created_at DESC"
        } else {
            "SELECT id, share_id, path, local_hash, remote_hash, local_mod_time,
                    remote_mod_time, resolution, resolved_at, created_at
             FROM conflicts WHERE share_id = ?1
             ORDER BY created_at DESC"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![share_id], conflict_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StoreError::from)
    }

    /// Mark a conflict resolved. Existing entries are never overwritten;
    /// only the resolution columns change.
    pub fn resolve_conflict(&self, id: i64, resolution: ConflictResolution) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE conflicts SET resolution = ?2, resolved_at = ?3
             WHERE id = ?1 AND resolved_at IS NULL",
            params![id, resolution.as_str(), to_millis(Utc::now())],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Activity log
    // ------------------------------------------------------------------

    /// Append an activity entry.
    pub fn log_activity(
        &self,
        share_id: &str,
        path: &str,
        action: &str,
        status: &str,
        bytes: u64,
        message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO activity (share_id, path, action, status, bytes, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![share_id, path, action, status, bytes as i64, message, to_millis(Utc::now())],
        )?;
        Ok(())
    }

    /// The most recent activity entries, newest first.
    pub fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, share_id, path, action, status, bytes, message, created_at
             FROM activity ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(ActivityEntry {
                id: row.get(0)?,
                share_id: row.get(1)?,
                path: row.get(2)?,
                action: row.get(3)?,
                status: row.get(4)?,
                bytes: row.get::<_, i64>(5)? as u64,
                message: row.get(6)?,
                created_at: from_millis(row.get(7)?),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StoreError::from)
    }

    /// Drop activity entries older than `older_than`. Returns the number
    /// of rows removed.
    pub fn prune_activity(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM activity WHERE created_at < ?1",
            params![to_millis(older_than)],
        )?;
        Ok(removed as u64)
    }
}

const FILE_COLUMNS: &str = "SELECT share_id, path, kind, size, mod_time, local_hash,
        remote_hash, last_sync_at, version, sync_status, error_message FROM files";

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    let kind_text: String = row.get(2)?;
    let status_text: String = row.get(9)?;
    Ok(FileRecord {
        share_id: row.get(0)?,
        path: row.get(1)?,
        kind: FileKind::parse(&kind_text).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                Type::Text,
                format!("unknown kind {kind_text}").into(),
            )
        })?,
        size: row.get::<_, i64>(3)? as u64,
        mod_time: from_millis(row.get(4)?),
        local_hash: row.get(5)?,
        remote_hash: row.get(6)?,
        last_sync_at: row.get::<_, Option<i64>>(7)?.map(from_millis),
        version: row.get(8)?,
        sync_status: SyncStatus::parse(&status_text).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                9,
                Type::Text,
                format!("unknown sync_status {status_text}").into(),
            )
        })?,
        error_message: row.get(10)?,
    })
}

fn queue_from_row(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    let op_text: String = row.get(2)?;
    Ok(QueueEntry {
        share_id: row.get(0)?,
        path: row.get(1)?,
        op: QueueOp::parse(&op_text).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                Type::Text,
                format!("unknown operation {op_text}").into(),
            )
        })?,
        priority: row.get(3)?,
        retry_count: row.get(4)?,
        scheduled_at: from_millis(row.get(5)?),
        last_error: row.get(6)?,
        created_at: from_millis(row.get(7)?),
    })
}

fn conflict_from_row(row: &Row<'_>) -> rusqlite::Result<ConflictEntry> {
    let resolution: Option<String> = row.get(7)?;
    let resolution = match resolution {
        Some(text) => Some(ConflictResolution::parse(&text).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                7,
                Type::Text,
                format!("unknown resolution {text}").into(),
            )
        })?),
        None => None,
    };
    Ok(ConflictEntry {
        id: row.get(0)?,
        share_id: row.get(1)?,
        path: row.get(2)?,
        local_hash: row.get(3)?,
        remote_hash: row.get(4)?,
        local_mod_time: from_millis(row.get(5)?),
        remote_mod_time: from_millis(row.get(6)?),
        resolution,
        resolved_at: row.get::<_, Option<i64>>(8)?.map(from_millis),
        created_at: from_millis(row.get(9)?),
    })
}
