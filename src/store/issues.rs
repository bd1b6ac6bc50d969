//! Issue-subtree merge: one dated issue with its payload, moment, imprint,
//! sections and pages.

use std::path::PathBuf;

use anyhow::Result;
use sqlx::SqliteConnection;

use super::blobs::upsert_entry_meta;
use super::pages::merge_pages;
use super::payloads::{merge_payload, payload_completeness};
use super::schema::Store;
use super::sections::{
    delete_orphan_articles, delete_orphan_authors_and_images, merge_sections, upsert_article,
    upsert_image,
};
use super::types::{StorageType, StoreError};
use crate::snapshot::{IssueSnapshot, MomentSnapshot};

impl Store {
    /// Merge a single issue snapshot into a feed.
    ///
    /// Validates first; a structurally invalid snapshot is refused whole
    /// with `StoreError::Integrity` and nothing is written. On success the
    /// issue's entire subtree reflects the snapshot, and re-merging the
    /// same snapshot is a no-op (progress counters included). Returns the
    /// issue id.
    pub async fn merge_issue(&self, feed_id: i64, snap: &IssueSnapshot) -> Result<i64> {
        if let Err(reason) = snap.validate() {
            return Err(StoreError::Integrity(format!("issue {}: {reason}", snap.date)).into());
        }

        let mut tx = self.pool.begin().await?;
        let mut unlink = Vec::new();
        let issue_id = merge_issue_tx(&mut *tx, self, feed_id, snap, &mut unlink).await?;
        delete_orphan_articles(&mut *tx).await?;
        delete_orphan_authors_and_images(&mut *tx).await?;
        tx.commit().await?;
        self.unlink_blobs(&unlink);
        self.clear_resolve_cache();

        tracing::info!(feed_id, issue = %snap.date, issue_id, "Merged issue");
        Ok(issue_id)
    }
}

/// The issue merge body, run inside the caller's transaction. The orphan
/// sweeps are the caller's responsibility (a feeder merge runs them once
/// after all issues).
pub(crate) async fn merge_issue_tx(
    conn: &mut SqliteConnection,
    store: &Store,
    feed_id: i64,
    snap: &IssueSnapshot,
    unlink: &mut Vec<PathBuf>,
) -> Result<i64> {
    let date = snap.date.to_string();
    let existing: Option<(i64, Option<i64>, Option<i64>)> = sqlx::query_as(
        "SELECT id, payload_id, moment_id FROM issues WHERE feed_id = ? AND date = ?",
    )
    .bind(feed_id)
    .bind(&date)
    .fetch_optional(&mut *conn)
    .await?;

    let existing_payload = existing.as_ref().and_then(|(_, p, _)| *p);
    let (payload_id, _progress_reset) = merge_payload(
        conn,
        store,
        existing_payload,
        &snap.payload,
        StorageType::Issue,
        unlink,
    )
    .await?;
    let subdir = snap.payload.local_dir.as_str();

    // Completeness is re-derived from the merged member set, so a changed
    // payload demotes a previously complete issue automatically.
    let (is_complete, is_ovw_complete) = payload_completeness(conn, payload_id).await?;

    let imprint_article_id = match &snap.imprint {
        Some(imprint) => Some(upsert_article(conn, imprint, subdir).await?),
        None => None,
    };

    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO issues (feed_id, date, modified, weekend, base_url, status,
                            min_resource_version, zip_name, zip_pdf_name,
                            is_complete, is_ovw_complete, payload_id, imprint_article_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(feed_id, date) DO UPDATE SET
            modified = excluded.modified,
            weekend = excluded.weekend,
            base_url = excluded.base_url,
            status = excluded.status,
            min_resource_version = excluded.min_resource_version,
            zip_name = excluded.zip_name,
            zip_pdf_name = excluded.zip_pdf_name,
            is_complete = excluded.is_complete,
            is_ovw_complete = excluded.is_ovw_complete,
            payload_id = excluded.payload_id,
            imprint_article_id = excluded.imprint_article_id
        RETURNING id
    "#,
    )
    .bind(feed_id)
    .bind(&date)
    .bind(snap.modified)
    .bind(snap.weekend)
    .bind(&snap.base_url)
    .bind(&snap.status)
    .bind(snap.min_resource_version)
    .bind(&snap.zip_name)
    .bind(&snap.zip_pdf_name)
    .bind(is_complete)
    .bind(is_ovw_complete)
    .bind(payload_id)
    .bind(imprint_article_id)
    .fetch_one(&mut *conn)
    .await?;
    let issue_id = row.0;

    merge_sections(conn, issue_id, &snap.sections, subdir).await?;
    let first_page_id = merge_pages(conn, issue_id, &snap.pages, subdir).await?;

    let existing_moment = existing.as_ref().and_then(|(_, _, m)| *m);
    let moment_id = merge_moment(conn, existing_moment, &snap.moment, subdir, first_page_id).await?;
    sqlx::query("UPDATE issues SET moment_id = ? WHERE id = ?")
        .bind(moment_id)
        .bind(issue_id)
        .execute(&mut *conn)
        .await?;

    Ok(issue_id)
}

/// Rebuild an issue's moment (cover representation): plain images, credited
/// images and the animation file sequence, plus the title page reference.
async fn merge_moment(
    conn: &mut SqliteConnection,
    existing: Option<i64>,
    snap: &MomentSnapshot,
    subdir: &str,
    first_page_id: Option<i64>,
) -> Result<i64> {
    let raw_file_id = match &snap.raw {
        Some(raw) => Some(
            upsert_entry_meta(
                conn,
                &raw.name,
                subdir,
                raw.storage_type,
                raw.mod_time,
                raw.size,
                raw.sha256.as_deref(),
            )
            .await?,
        ),
        None => None,
    };

    let moment_id = match existing {
        Some(id) => {
            sqlx::query("UPDATE moments SET first_page_id = ?, raw_file_id = ? WHERE id = ?")
                .bind(first_page_id)
                .bind(raw_file_id)
                .bind(id)
                .execute(&mut *conn)
                .await?;
            id
        }
        None => {
            let row: (i64,) = sqlx::query_as(
                "INSERT INTO moments (first_page_id, raw_file_id) VALUES (?, ?) RETURNING id",
            )
            .bind(first_page_id)
            .bind(raw_file_id)
            .fetch_one(&mut *conn)
            .await?;
            row.0
        }
    };

    sqlx::query("DELETE FROM moment_images WHERE moment_id = ?")
        .bind(moment_id)
        .execute(&mut *conn)
        .await?;
    for (kind, images) in [("image", &snap.images), ("credit", &snap.credited)] {
        for (pos, img) in images.iter().enumerate() {
            let image_id = upsert_image(conn, img, subdir).await?;
            sqlx::query(
                "INSERT OR REPLACE INTO moment_images (moment_id, image_id, kind, pos) VALUES (?, ?, ?, ?)",
            )
            .bind(moment_id)
            .bind(image_id)
            .bind(kind)
            .bind(pos as i64)
            .execute(&mut *conn)
            .await?;
        }
    }

    sqlx::query("DELETE FROM moment_files WHERE moment_id = ?")
        .bind(moment_id)
        .execute(&mut *conn)
        .await?;
    for (pos, file) in snap.animation.iter().enumerate() {
        let entry_id = upsert_entry_meta(
            conn,
            &file.name,
            subdir,
            file.storage_type,
            file.mod_time,
            file.size,
            file.sha256.as_deref(),
        )
        .await?;
        sqlx::query(
            "INSERT OR REPLACE INTO moment_files (moment_id, file_entry_id, pos) VALUES (?, ?, ?)",
        )
        .bind(moment_id)
        .bind(entry_id)
        .bind(pos as i64)
        .execute(&mut *conn)
        .await?;
    }

    Ok(moment_id)
}
