use std::path::PathBuf;

use anyhow::Result;
use sqlx::SqliteConnection;

use super::blobs::{delete_entries_if_unowned, upsert_entry_meta};
use super::schema::Store;
use super::types::{FileEntry, Payload, StorageType};
use crate::snapshot::PayloadSnapshot;

impl Store {
    // ========================================================================
    // Download Bookkeeping
    // ========================================================================

    /// Stamp the download start time if it is not set yet.
    pub async fn begin_download(&self, payload_id: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE payloads SET dl_started = COALESCE(dl_started, ?) WHERE id = ?")
            .bind(now)
            .bind(payload_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Add transferred bytes to a payload's progress counter.
    ///
    /// Monotone and clamped: negative deltas are ignored and the counter
    /// never exceeds `bytes_total`. The whole update is one SQL statement,
    /// so a concurrent reader never observes a torn value.
    pub async fn record_progress(&self, payload_id: i64, bytes_delta: i64) -> Result<()> {
        sqlx::query(
            "UPDATE payloads SET bytes_loaded = MIN(bytes_total, bytes_loaded + MAX(0, ?)) WHERE id = ?",
        )
        .bind(bytes_delta)
        .bind(payload_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stamp the download stop time.
    pub async fn complete_download(&self, payload_id: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE payloads SET dl_stopped = ? WHERE id = ?")
            .bind(now)
            .bind(payload_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fetch a payload's current counters and timestamps.
    pub async fn payload(&self, payload_id: i64) -> Result<Option<Payload>> {
        let payload = sqlx::query_as::<_, Payload>(
            "SELECT id, local_dir, remote_base_url, zip_name, bytes_loaded, bytes_total,
                    dl_started, dl_stopped
             FROM payloads WHERE id = ?",
        )
        .bind(payload_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payload)
    }

    /// The payload's member files in download order.
    pub async fn payload_files(&self, payload_id: i64) -> Result<Vec<FileEntry>> {
        let files = sqlx::query_as::<_, FileEntry>(
            r#"
            SELECT f.id, f.name, f.subdir, f.storage_type, f.mod_time, f.size, f.stored_size, f.sha256
            FROM file_entries f
            JOIN payload_files pf ON pf.file_entry_id = f.id
            WHERE pf.payload_id = ?
            ORDER BY pf.pos
        "#,
        )
        .bind(payload_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(files)
    }

    /// Re-derive an issue's completeness flags from its payload files.
    ///
    /// `is_complete` may only become true once every member file is
    /// confirmed stored; setting it also sets `is_ovw_complete`
    /// (completeness implies overview-completeness). Returns the resulting
    /// completeness.
    pub async fn refresh_issue_completeness(&self, issue_id: i64) -> Result<bool> {
        let missing: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM issues i
            JOIN payload_files pf ON pf.payload_id = i.payload_id
            JOIN file_entries f ON f.id = pf.file_entry_id
            WHERE i.id = ? AND f.stored_size < f.size
        "#,
        )
        .bind(issue_id)
        .fetch_one(&self.pool)
        .await?;

        let members: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM issues i JOIN payload_files pf ON pf.payload_id = i.payload_id WHERE i.id = ?",
        )
        .bind(issue_id)
        .fetch_one(&self.pool)
        .await?;

        let complete = members.0 > 0 && missing.0 == 0;
        if complete {
            sqlx::query("UPDATE issues SET is_complete = 1, is_ovw_complete = 1 WHERE id = ?")
                .bind(issue_id)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query("UPDATE issues SET is_complete = 0 WHERE id = ?")
                .bind(issue_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(complete)
    }
}

/// Reconcile a payload with its snapshot inside an open transaction.
///
/// Member files are matched by name: new members are registered, existing
/// ones updated in place (keeping stored bytes when the checksum is
/// unchanged), and members gone from the snapshot are released — their
/// entries deleted once no other payload owns them. Membership rows are
/// renumbered 0..n-1 in snapshot order, and the `overview` flag is applied
/// from the snapshot's designation.
///
/// A changed member set (names or declared sizes) invalidates progress:
/// `bytes_loaded` resets to 0 and `bytes_total` is recomputed. An identical
/// set keeps the counters, which is what makes re-merging idempotent.
/// Returns `(payload_id, progress_was_reset)`.
pub(crate) async fn merge_payload(
    conn: &mut SqliteConnection,
    store: &Store,
    existing: Option<i64>,
    snap: &PayloadSnapshot,
    storage_type: StorageType,
    unlink: &mut Vec<PathBuf>,
) -> Result<(i64, bool)> {
    let payload_id = match existing {
        Some(id) => {
            sqlx::query(
                "UPDATE payloads SET local_dir = ?, remote_base_url = ?, zip_name = ? WHERE id = ?",
            )
            .bind(&snap.local_dir)
            .bind(&snap.remote_base_url)
            .bind(&snap.zip_name)
            .bind(id)
            .execute(&mut *conn)
            .await?;
            id
        }
        None => {
            let row: (i64,) = sqlx::query_as(
                "INSERT INTO payloads (local_dir, remote_base_url, zip_name) VALUES (?, ?, ?) RETURNING id",
            )
            .bind(&snap.local_dir)
            .bind(&snap.remote_base_url)
            .bind(&snap.zip_name)
            .fetch_one(&mut *conn)
            .await?;
            row.0
        }
    };

    // Previous member set, for change detection and release
    let before: Vec<(i64, String, i64)> = sqlx::query_as(
        r#"
        SELECT f.id, f.name, f.size
        FROM file_entries f
        JOIN payload_files pf ON pf.file_entry_id = f.id
        WHERE pf.payload_id = ?
        ORDER BY pf.pos
    "#,
    )
    .bind(payload_id)
    .fetch_all(&mut *conn)
    .await?;

    let same_set = before.len() == snap.files.len()
        && before
            .iter()
            .zip(snap.files.iter())
            .all(|((_, name, size), f)| *name == f.name && *size == f.size.max(0));

    // Upsert members and rebuild the ordered membership rows
    sqlx::query("DELETE FROM payload_files WHERE payload_id = ?")
        .bind(payload_id)
        .execute(&mut *conn)
        .await?;

    let mut bytes_total: i64 = 0;
    for (pos, file) in snap.files.iter().enumerate() {
        let entry_id = upsert_entry_meta(
            conn,
            &file.name,
            &snap.local_dir,
            storage_type,
            file.mod_time,
            file.size,
            file.sha256.as_deref(),
        )
        .await?;
        let overview = snap.overview_files.iter().any(|n| n == &file.name);
        sqlx::query(
            "INSERT INTO payload_files (payload_id, file_entry_id, pos, overview) VALUES (?, ?, ?, ?)",
        )
        .bind(payload_id)
        .bind(entry_id)
        .bind(pos as i64)
        .bind(overview)
        .execute(&mut *conn)
        .await?;
        bytes_total += file.size.max(0);
    }

    // Release entries that fell out of the member set
    let gone: Vec<i64> = {
        let kept: std::collections::HashSet<&str> =
            snap.files.iter().map(|f| f.name.as_str()).collect();
        before
            .iter()
            .filter(|(_, name, _)| !kept.contains(name.as_str()))
            .map(|(id, _, _)| *id)
            .collect()
    };
    delete_entries_if_unowned(conn, store, &gone, unlink).await?;

    if same_set {
        sqlx::query("UPDATE payloads SET bytes_total = ? WHERE id = ?")
            .bind(bytes_total)
            .bind(payload_id)
            .execute(&mut *conn)
            .await?;
    } else {
        // Changed file set invalidates prior progress
        sqlx::query(
            "UPDATE payloads SET bytes_loaded = 0, bytes_total = ?, dl_started = NULL, dl_stopped = NULL WHERE id = ?",
        )
        .bind(bytes_total)
        .bind(payload_id)
        .execute(&mut *conn)
        .await?;
    }

    Ok((payload_id, !same_set))
}

/// Derive `(is_complete, is_ovw_complete)` for a payload inside an open
/// transaction. A payload with no members is neither.
pub(crate) async fn payload_completeness(
    conn: &mut SqliteConnection,
    payload_id: i64,
) -> Result<(bool, bool)> {
    let (members, missing, ovw_members, ovw_missing): (i64, i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT COUNT(*),
               COALESCE(SUM(f.stored_size < f.size), 0),
               COALESCE(SUM(pf.overview), 0),
               COALESCE(SUM(pf.overview AND f.stored_size < f.size), 0)
        FROM payload_files pf
        JOIN file_entries f ON f.id = pf.file_entry_id
        WHERE pf.payload_id = ?
    "#,
    )
    .bind(payload_id)
    .fetch_one(&mut *conn)
    .await?;

    let complete = members > 0 && missing == 0;
    let ovw_complete = complete || (ovw_members > 0 && ovw_missing == 0);
    Ok((complete, ovw_complete))
}

#[cfg(test)]
mod tests {
    use crate::snapshot::{FileSnapshot, PayloadSnapshot};
    use crate::store::{StorageType, Store};

    async fn test_store() -> Store {
        let dir = std::env::temp_dir().join("kiosk_payload_test");
        std::fs::create_dir_all(&dir).unwrap();
        Store::open(":memory:", dir).await.unwrap()
    }

    fn file(name: &str, size: i64) -> FileSnapshot {
        FileSnapshot {
            name: name.to_string(),
            storage_type: StorageType::Issue,
            mod_time: Some(1704067200),
            size,
            sha256: Some(format!("sum-{name}")),
        }
    }

    fn payload(files: Vec<FileSnapshot>) -> PayloadSnapshot {
        PayloadSnapshot {
            local_dir: "2024-01-05".to_string(),
            remote_base_url: Some("https://feed.example.com/2024-01-05".to_string()),
            zip_name: Some("issue.zip".to_string()),
            files,
            overview_files: vec![],
        }
    }

    async fn merge(store: &Store, existing: Option<i64>, snap: &PayloadSnapshot) -> (i64, bool) {
        let mut tx = store.pool.begin().await.unwrap();
        let mut unlink = Vec::new();
        let out = super::merge_payload(
            &mut *tx,
            store,
            existing,
            snap,
            StorageType::Issue,
            &mut unlink,
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        store.unlink_blobs(&unlink);
        out
    }

    #[tokio::test]
    async fn test_progress_is_monotone_and_clamped() {
        let store = test_store().await;
        let (id, _) = merge(&store, None, &payload(vec![file("a.html", 70), file("b.pdf", 30)])).await;

        store.begin_download(id).await.unwrap();
        let p = store.payload(id).await.unwrap().unwrap();
        assert_eq!(p.bytes_total, 100);
        assert!(p.dl_started.is_some());
        assert!(!p.is_complete());

        store.record_progress(id, 60).await.unwrap();
        store.record_progress(id, -500).await.unwrap(); // ignored
        let p = store.payload(id).await.unwrap().unwrap();
        assert_eq!(p.bytes_loaded, 60);

        store.record_progress(id, 1000).await.unwrap(); // clamped
        let p = store.payload(id).await.unwrap().unwrap();
        assert_eq!(p.bytes_loaded, 100);
        assert!(p.is_complete());

        store.complete_download(id).await.unwrap();
        let p = store.payload(id).await.unwrap().unwrap();
        assert!(p.dl_stopped.is_some());
    }

    #[tokio::test]
    async fn test_begin_download_keeps_first_timestamp() {
        let store = test_store().await;
        let (id, _) = merge(&store, None, &payload(vec![file("a.html", 10)])).await;

        store.begin_download(id).await.unwrap();
        let first = store.payload(id).await.unwrap().unwrap().dl_started;
        store.begin_download(id).await.unwrap();
        let second = store.payload(id).await.unwrap().unwrap().dl_started;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_remerge_same_set_keeps_progress() {
        let store = test_store().await;
        let snap = payload(vec![file("a.html", 70), file("b.pdf", 30)]);
        let (id, reset) = merge(&store, None, &snap).await;
        assert!(reset, "initial merge counts as a fresh set");

        store.record_progress(id, 50).await.unwrap();
        let (id2, reset) = merge(&store, Some(id), &snap).await;
        assert_eq!(id, id2);
        assert!(!reset);
        let p = store.payload(id).await.unwrap().unwrap();
        assert_eq!(p.bytes_loaded, 50);
        assert_eq!(p.bytes_total, 100);
    }

    #[tokio::test]
    async fn test_remerge_changed_set_resets_progress() {
        let store = test_store().await;
        let (id, _) = merge(&store, None, &payload(vec![file("a.html", 70), file("b.pdf", 30)])).await;
        store.begin_download(id).await.unwrap();
        store.record_progress(id, 80).await.unwrap();

        let (_, reset) = merge(
            &store,
            Some(id),
            &payload(vec![file("a.html", 70), file("c.pdf", 50)]),
        )
        .await;
        assert!(reset);
        let p = store.payload(id).await.unwrap().unwrap();
        assert_eq!(p.bytes_loaded, 0);
        assert_eq!(p.bytes_total, 120);
        assert!(p.dl_started.is_none());

        // b.pdf lost its only owner and is gone from the graph
        assert!(store.file_entry("b.pdf").await.unwrap().is_none());
        assert!(store.file_entry("c.pdf").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_zero_size_member_does_not_block_completeness() {
        let store = test_store().await;
        let (payload_id, _) = merge(
            &store,
            None,
            &payload(vec![file("empty.css", 0), file("body.html", 10)]),
        )
        .await;

        sqlx::query("INSERT INTO feeders (title, base_url) VALUES ('t', 'https://f.example.com')")
            .execute(&store.pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO feeds (feeder_id, name) VALUES (1, 'daily')")
            .execute(&store.pool)
            .await
            .unwrap();
        let issue: (i64,) = sqlx::query_as(
            "INSERT INTO issues (feed_id, date, payload_id) VALUES (1, '2024-01-05', ?) RETURNING id",
        )
        .bind(payload_id)
        .fetch_one(&store.pool)
        .await
        .unwrap();

        // The empty file needs no download; only body.html is outstanding.
        assert!(!store.refresh_issue_completeness(issue.0).await.unwrap());
        store.record_stored("body.html", 10).await.unwrap();
        assert!(store.refresh_issue_completeness(issue.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_shared_entry_survives_one_owner() {
        let store = test_store().await;
        let shared = file("shared.css", 10);
        let (p1, _) = merge(&store, None, &payload(vec![shared.clone(), file("a.html", 5)])).await;
        let (_p2, _) = merge(&store, None, &payload(vec![shared.clone()])).await;

        // Drop the shared file from the first payload; second still owns it
        merge(&store, Some(p1), &payload(vec![file("a.html", 5)])).await;
        assert!(store.file_entry("shared.css").await.unwrap().is_some());
        assert!(store.file_entry("a.html").await.unwrap().is_some());
    }
}
