use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::SqliteConnection;

use super::schema::Store;
use super::types::{FileEntry, StorageType};

/// Read buffer for checksumming (blobs can be multi-megabyte PDFs)
const CHECKSUM_BUF: usize = 64 * 1024;

impl Store {
    // ========================================================================
    // Blob Store Operations
    // ========================================================================

    /// Register a physical file already residing in the blob tree.
    ///
    /// Computes the SHA-256 checksum and size of the file at `local_path`
    /// and upserts the logical entry record. No file move or copy is
    /// implied; the physical file is expected to live at the destination
    /// derived from `storage_type`/`subdir`/name.
    ///
    /// A missing source file is a non-fatal failure: logged, `Ok(None)`.
    pub async fn put(
        &self,
        local_path: &Path,
        storage_type: StorageType,
        subdir: &str,
    ) -> Result<Option<FileEntry>> {
        let name = match local_path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => {
                tracing::warn!(path = %local_path.display(), "Blob path has no usable file name, skipping");
                return Ok(None);
            }
        };

        let (size, sha256) = match checksum_file(local_path) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(path = %local_path.display(), error = %e, "Blob file unreadable, skipping put");
                return Ok(None);
            }
        };

        let mod_time = std::fs::metadata(local_path)
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64);

        let entry = sqlx::query_as::<_, FileEntry>(
            r#"
            INSERT INTO file_entries (name, subdir, storage_type, mod_time, size, stored_size, sha256)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                subdir = excluded.subdir,
                storage_type = excluded.storage_type,
                mod_time = excluded.mod_time,
                size = excluded.size,
                stored_size = excluded.stored_size,
                sha256 = excluded.sha256
            RETURNING id, name, subdir, storage_type, mod_time, size, stored_size, sha256
        "#,
        )
        .bind(&name)
        .bind(subdir)
        .bind(storage_type.as_str())
        .bind(mod_time)
        .bind(size)
        .bind(size) // the physical file is already present, so fully stored
        .bind(&sha256)
        .fetch_one(&self.pool)
        .await?;

        self.uncache_path(&name);
        Ok(Some(entry))
    }

    /// Resolve a logical file name to its absolute path, if the entry is
    /// known. Results are LRU-cached; the cache is invalidated on delete.
    pub async fn file_for_name(&self, name: &str) -> Result<Option<PathBuf>> {
        if let Some(path) = self.resolve_cache.lock().unwrap().get(name).cloned() {
            return Ok(Some(path));
        }

        let row: Option<(String, String, String)> =
            sqlx::query_as("SELECT name, subdir, storage_type FROM file_entries WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(name, subdir, storage_type)| {
            let path = self.blob_path(&storage_type, &subdir, &name);
            self.resolve_cache
                .lock()
                .unwrap()
                .put(name, path.clone());
            path
        }))
    }

    /// Resolve a blob by content checksum, supporting dedup-by-content
    /// across unrelated names. Returns the path of any matching entry.
    pub async fn file_for_checksum(&self, sha256: &str) -> Result<Option<PathBuf>> {
        let row: Option<(String, String, String)> = sqlx::query_as(
            "SELECT name, subdir, storage_type FROM file_entries WHERE sha256 = ? LIMIT 1",
        )
        .bind(sha256)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(name, subdir, storage_type)| self.blob_path(&storage_type, &subdir, &name)))
    }

    /// Look up a file entry record by name.
    pub async fn file_entry(&self, name: &str) -> Result<Option<FileEntry>> {
        let entry = sqlx::query_as::<_, FileEntry>(
            "SELECT id, name, subdir, storage_type, mod_time, size, stored_size, sha256
             FROM file_entries WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    /// Record that `bytes` of a file have landed on disk (called by the
    /// background transfer process as archive members are extracted).
    pub async fn record_stored(&self, name: &str, bytes: i64) -> Result<()> {
        sqlx::query("UPDATE file_entries SET stored_size = MAX(0, ?) WHERE name = ?")
            .bind(bytes)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a file entry record. The physical file is removed only when no
    /// payload still references the entry; otherwise only this caller's view
    /// of it goes away and the shared record stays.
    pub async fn delete_entry(&self, file_entry_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut unlink = Vec::new();
        delete_entries_if_unowned(&mut *tx, self, &[file_entry_id], &mut unlink).await?;
        tx.commit().await?;
        self.unlink_blobs(&unlink);
        Ok(())
    }

    // ========================================================================
    // Internal Helpers
    // ========================================================================

    /// Physical path of a blob: `<data_dir>/<storage_type>/<subdir>/<name>`.
    pub(crate) fn blob_path(&self, storage_type: &str, subdir: &str, name: &str) -> PathBuf {
        let mut path = self.data_dir.join(storage_type);
        if !subdir.is_empty() {
            path.push(subdir);
        }
        path.push(name);
        path
    }

    pub(crate) fn uncache_path(&self, name: &str) {
        self.resolve_cache.lock().unwrap().pop(name);
    }

    /// Drop every cached name resolution. Merges may relocate shared
    /// entries to a new subdir, so the whole cache goes after a merge
    /// commits.
    pub(crate) fn clear_resolve_cache(&self) {
        self.resolve_cache.lock().unwrap().clear();
    }

    /// Unlink physical files after their records committed away. Removal
    /// failure is logged, never propagated: the record is already gone and
    /// the graph must stay consistent.
    pub(crate) fn unlink_blobs(&self, paths: &[PathBuf]) {
        for path in paths {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove blob file");
                }
            }
        }
    }
}

/// Delete the given file entries if no payload references them any more.
/// Appends the physical paths of deleted entries to `unlink`; the caller
/// unlinks them after the transaction commits.
pub(crate) async fn delete_entries_if_unowned(
    conn: &mut SqliteConnection,
    store: &Store,
    candidate_ids: &[i64],
    unlink: &mut Vec<PathBuf>,
) -> Result<()> {
    for &id in candidate_ids {
        let owners: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM payload_files WHERE file_entry_id = ?")
                .bind(id)
                .fetch_one(&mut *conn)
                .await?;
        if owners.0 > 0 {
            continue;
        }

        let row: Option<(String, String, String)> = sqlx::query_as(
            "DELETE FROM file_entries WHERE id = ? RETURNING name, subdir, storage_type",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some((name, subdir, storage_type)) = row {
            store.uncache_path(&name);
            unlink.push(store.blob_path(&storage_type, &subdir, &name));
        }
    }
    Ok(())
}

/// Upsert a file entry from snapshot metadata (no physical file involved).
///
/// Preserves `stored_size` when the declared checksum is unchanged, so an
/// unchanged file keeps its local blob; a changed checksum invalidates the
/// stored bytes and the file counts as not-yet-downloaded again.
///
/// Names are globally unique, so an entry shared by several payloads has
/// exactly one canonical location: the `subdir` written by the most recent
/// merge that mentioned the name. Callers committing a merge clear the
/// resolve cache so stale locations are never served.
pub(crate) async fn upsert_entry_meta(
    conn: &mut SqliteConnection,
    name: &str,
    subdir: &str,
    storage_type: StorageType,
    mod_time: Option<i64>,
    size: i64,
    sha256: Option<&str>,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO file_entries (name, subdir, storage_type, mod_time, size, stored_size, sha256)
        VALUES (?, ?, ?, ?, ?, 0, ?)
        ON CONFLICT(name) DO UPDATE SET
            subdir = excluded.subdir,
            storage_type = excluded.storage_type,
            mod_time = excluded.mod_time,
            size = excluded.size,
            stored_size = CASE
                WHEN file_entries.sha256 IS excluded.sha256 THEN file_entries.stored_size
                ELSE 0
            END,
            sha256 = excluded.sha256
        RETURNING id
    "#,
    )
    .bind(name)
    .bind(subdir)
    .bind(storage_type.as_str())
    .bind(mod_time)
    .bind(size.max(0))
    .bind(sha256)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.0)
}

fn checksum_file(path: &Path) -> std::io::Result<(i64, String)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHECKSUM_BUF];
    let mut size: i64 = 0;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as i64;
    }
    Ok((size, format!("{:x}", hasher.finalize())))
}
