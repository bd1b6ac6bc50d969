//! Eviction: shrinking issues back to their overview representation.
//!
//! An issue is "full" once it carries sections; reducing it deletes the
//! section/article subtree and drops every non-overview payload member,
//! leaving the moment, the page skeleton and the overview files. The issue
//! record itself always survives, so the feed's history stays browsable.

use anyhow::Result;

use super::blobs::delete_entries_if_unowned;
use super::schema::Store;
use super::sections::{delete_orphan_articles, delete_orphan_authors_and_images};

impl Store {
    /// Reduce an issue to its overview representation.
    ///
    /// Idempotent: reducing an already reduced (or never expanded) issue
    /// changes nothing. Returns `false` if the issue does not exist.
    pub async fn reduce_to_overview(&self, issue_id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let mut unlink = Vec::new();

        let issue: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT payload_id FROM issues WHERE id = ?")
                .bind(issue_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((payload_id,)) = issue else {
            return Ok(false);
        };

        // Drop the article layer: sections cascade their membership rows,
        // the imprint loses its anchor, and the orphan sweeps take the
        // articles, authors and images nothing references any more.
        sqlx::query("DELETE FROM sections WHERE issue_id = ?")
            .bind(issue_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE issues SET imprint_article_id = NULL WHERE id = ?")
            .bind(issue_id)
            .execute(&mut *tx)
            .await?;
        delete_orphan_articles(&mut *tx).await?;
        delete_orphan_authors_and_images(&mut *tx).await?;

        // Derived facsimiles are not payload members; release them
        // explicitly alongside the page PDFs they were rendered from.
        let facsimiles: Vec<(i64,)> = sqlx::query_as(
            "SELECT i.file_entry_id FROM pages p
             JOIN images i ON i.id = p.facsimile_image_id
             WHERE p.issue_id = ?",
        )
        .bind(issue_id)
        .fetch_all(&mut *tx)
        .await?;
        sqlx::query("UPDATE pages SET facsimile_image_id = NULL WHERE issue_id = ?")
            .bind(issue_id)
            .execute(&mut *tx)
            .await?;
        let facsimile_ids: Vec<i64> = facsimiles.into_iter().map(|(id,)| id).collect();
        delete_entries_if_unowned(&mut *tx, self, &facsimile_ids, &mut unlink).await?;

        if let Some(payload_id) = payload_id {
            let dropped: Vec<(i64,)> = sqlx::query_as(
                "SELECT file_entry_id FROM payload_files WHERE payload_id = ? AND overview = 0",
            )
            .bind(payload_id)
            .fetch_all(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM payload_files WHERE payload_id = ? AND overview = 0")
                .bind(payload_id)
                .execute(&mut *tx)
                .await?;
            let dropped_ids: Vec<i64> = dropped.into_iter().map(|(id,)| id).collect();
            delete_entries_if_unowned(&mut *tx, self, &dropped_ids, &mut unlink).await?;

            // Counters now describe the overview set only
            sqlx::query(
                r#"
                UPDATE payloads SET
                    bytes_total = (
                        SELECT COALESCE(SUM(f.size), 0)
                        FROM payload_files pf JOIN file_entries f ON f.id = pf.file_entry_id
                        WHERE pf.payload_id = payloads.id
                    ),
                    bytes_loaded = MIN(bytes_loaded, (
                        SELECT COALESCE(SUM(f.size), 0)
                        FROM payload_files pf JOIN file_entries f ON f.id = pf.file_entry_id
                        WHERE pf.payload_id = payloads.id
                    ))
                WHERE id = ?
            "#,
            )
            .bind(payload_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE issues SET is_complete = 0, is_ovw_complete = 1 WHERE id = ?")
            .bind(issue_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        self.unlink_blobs(&unlink);

        tracing::info!(issue_id, "Reduced issue to overview");
        Ok(true)
    }

    /// Reduce the oldest full issues of a feed until at most `keep` remain.
    ///
    /// "Oldest" means earliest download start; issues that were never
    /// downloaded sort first. Returns the number of issues reduced.
    pub async fn reduce_oldest(&self, feed_id: i64, keep: u32) -> Result<u64> {
        let full: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT i.id
            FROM issues i
            LEFT JOIN payloads p ON p.id = i.payload_id
            WHERE i.feed_id = ?
              AND EXISTS (SELECT 1 FROM sections s WHERE s.issue_id = i.id)
            ORDER BY (p.dl_started IS NOT NULL), p.dl_started ASC
        "#,
        )
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;

        let excess = full.len().saturating_sub(keep as usize);
        for (issue_id,) in full.into_iter().take(excess) {
            self.reduce_to_overview(issue_id).await?;
        }

        if excess > 0 {
            tracing::info!(feed_id, reduced = excess, keep, "Reduced oldest full issues");
        }
        Ok(excess as u64)
    }
}
