//! Top-level feeder merge: the entry point for a full feed-query result.

use anyhow::Result;
use sqlx::SqliteConnection;

use super::issues::merge_issue_tx;
use super::schema::Store;
use super::sections::{delete_orphan_articles, delete_orphan_authors_and_images};
use super::types::{Feed, Feeder, MergeOutcome, MergeSkip, StoreError};
use crate::snapshot::{FeedSnapshot, FeederSnapshot};

impl Store {
    /// Merge a feeder snapshot (feeds and their issue windows) into the
    /// persisted graph.
    ///
    /// The feeder and its feeds are matched by uniqueness key (base URL,
    /// feed name); feeds and issues absent from the snapshot are left
    /// untouched, since a query only ever carries a window of recent
    /// issues. Invalid issue subtrees are skipped and reported in the
    /// outcome; everything else merges in one transaction.
    pub async fn merge_feeder(&self, snap: &FeederSnapshot) -> Result<MergeOutcome> {
        if let Err(reason) = snap.validate() {
            return Err(StoreError::Integrity(format!("feeder: {reason}")).into());
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let mut unlink = Vec::new();
        let mut skipped = Vec::new();
        let mut merged_issues = 0;

        let feeder_id: i64 = sqlx::query_as::<_, (i64,)>(
            r#"
            INSERT INTO feeders (title, timezone, base_url, global_base_url, auth_token,
                                 resource_version, last_updated)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(base_url) DO UPDATE SET
                title = excluded.title,
                timezone = excluded.timezone,
                global_base_url = excluded.global_base_url,
                auth_token = COALESCE(excluded.auth_token, feeders.auth_token),
                resource_version = excluded.resource_version,
                last_updated = excluded.last_updated
            RETURNING id
        "#,
        )
        .bind(&snap.title)
        .bind(&snap.timezone)
        .bind(&snap.base_url)
        .bind(&snap.global_base_url)
        .bind(&snap.auth_token)
        .bind(snap.resource_version)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?
        .0;

        for feed in &snap.feeds {
            let feed_id = upsert_feed(&mut *tx, feeder_id, feed, now).await?;

            for issue in &feed.issues {
                if let Err(reason) = issue.validate() {
                    tracing::warn!(
                        feed = %feed.name,
                        issue = %issue.date,
                        %reason,
                        "Skipping invalid issue snapshot"
                    );
                    skipped.push(MergeSkip {
                        entity: "issue",
                        key: format!("{}/{}", feed.name, issue.date),
                        reason,
                    });
                    continue;
                }
                merge_issue_tx(&mut *tx, self, feed_id, issue, &mut unlink).await?;
                merged_issues += 1;
            }

            refresh_feed_aggregates(&mut *tx, feed_id, feed).await?;
        }

        delete_orphan_articles(&mut *tx).await?;
        delete_orphan_authors_and_images(&mut *tx).await?;
        tx.commit().await?;
        self.unlink_blobs(&unlink);
        self.clear_resolve_cache();

        tracing::info!(
            feeder_id,
            feeds = snap.feeds.len(),
            merged_issues,
            skipped = skipped.len(),
            "Merged feeder snapshot"
        );
        Ok(MergeOutcome {
            feeder_id,
            merged_issues,
            skipped,
        })
    }

    /// Fetch a feeder by its base URL.
    pub async fn feeder(&self, base_url: &str) -> Result<Option<Feeder>> {
        let feeder = sqlx::query_as::<_, Feeder>(
            "SELECT id, title, timezone, base_url, global_base_url, auth_token,
                    resource_version, last_updated
             FROM feeders WHERE base_url = ?",
        )
        .bind(base_url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(feeder)
    }

    /// Fetch a feed of a feeder by name.
    pub async fn feed(&self, feeder_id: i64, name: &str) -> Result<Option<Feed>> {
        let feed = sqlx::query_as::<_, Feed>(
            "SELECT id, feeder_id, name, cycle, kind, moment_ratio, issue_count,
                    first_issue_date, last_issue_date, last_read, last_updated
             FROM feeds WHERE feeder_id = ? AND name = ?",
        )
        .bind(feeder_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(feed)
    }

    /// All feeds of a feeder, by name.
    pub async fn feeds(&self, feeder_id: i64) -> Result<Vec<Feed>> {
        let feeds = sqlx::query_as::<_, Feed>(
            "SELECT id, feeder_id, name, cycle, kind, moment_ratio, issue_count,
                    first_issue_date, last_issue_date, last_read, last_updated
             FROM feeds WHERE feeder_id = ? ORDER BY name",
        )
        .bind(feeder_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    /// Stamp the time a feed was last opened by the reader.
    pub async fn set_feed_last_read(&self, feed_id: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE feeds SET last_read = ? WHERE id = ?")
            .bind(now)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

async fn upsert_feed(
    conn: &mut SqliteConnection,
    feeder_id: i64,
    snap: &FeedSnapshot,
    now: i64,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO feeds (feeder_id, name, cycle, kind, moment_ratio, last_updated)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(feeder_id, name) DO UPDATE SET
            cycle = excluded.cycle,
            kind = excluded.kind,
            moment_ratio = excluded.moment_ratio,
            last_updated = excluded.last_updated
        RETURNING id
    "#,
    )
    .bind(feeder_id)
    .bind(&snap.name)
    .bind(&snap.cycle)
    .bind(&snap.kind)
    .bind(snap.moment_ratio)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.0)
}

/// Update a feed's aggregate columns after its issues merged. The remote's
/// declared values win where present (it sees the whole history); otherwise
/// the aggregates derive from the locally cached issues.
async fn refresh_feed_aggregates(
    conn: &mut SqliteConnection,
    feed_id: i64,
    snap: &FeedSnapshot,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE feeds SET
            issue_count = COALESCE(?, (SELECT COUNT(*) FROM issues WHERE feed_id = ?)),
            first_issue_date = COALESCE(?, (SELECT MIN(date) FROM issues WHERE feed_id = ?)),
            last_issue_date = COALESCE(?, (SELECT MAX(date) FROM issues WHERE feed_id = ?))
        WHERE id = ?
    "#,
    )
    .bind(snap.issue_count)
    .bind(feed_id)
    .bind(snap.first_issue_date.map(|d| d.to_string()))
    .bind(feed_id)
    .bind(snap.last_issue_date.map(|d| d.to_string()))
    .bind(feed_id)
    .bind(feed_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
