//! Section and article reconciliation.
//!
//! Sections are keyed by their HTML file name within an issue; articles are
//! keyed globally by HTML file name since an article can appear in several
//! sections of the same issue (and is linked from page frames by that same
//! name). Scalar updates preserve user state: `bookmarked` and
//! `reading_position` are never touched by a merge.

use std::collections::HashSet;

use anyhow::Result;
use sqlx::SqliteConnection;

use super::blobs::upsert_entry_meta;
use crate::snapshot::{ArticleSnapshot, ImageSnapshot, SectionSnapshot};

/// Reconcile an issue's section list with the snapshot.
///
/// Sections present only locally are deleted (their article memberships
/// cascade); the orphaned articles themselves are swept afterwards by
/// [`delete_orphan_articles`] so an article surviving in another section
/// stays put.
pub(crate) async fn merge_sections(
    conn: &mut SqliteConnection,
    issue_id: i64,
    snaps: &[SectionSnapshot],
    subdir: &str,
) -> Result<()> {
    let existing: Vec<(i64, String)> =
        sqlx::query_as("SELECT id, name FROM sections WHERE issue_id = ?")
            .bind(issue_id)
            .fetch_all(&mut *conn)
            .await?;

    let keep: HashSet<&str> = snaps.iter().map(|s| s.name()).collect();
    for (id, name) in &existing {
        if !keep.contains(name.as_str()) {
            sqlx::query("DELETE FROM sections WHERE id = ?")
                .bind(id)
                .execute(&mut *conn)
                .await?;
        }
    }

    for (pos, snap) in snaps.iter().enumerate() {
        let html_file_id = upsert_entry_meta(
            conn,
            &snap.html.name,
            subdir,
            snap.html.storage_type,
            snap.html.mod_time,
            snap.html.size,
            snap.html.sha256.as_deref(),
        )
        .await?;
        let nav_button_image_id = match &snap.nav_button {
            Some(img) => Some(upsert_image(conn, img, subdir).await?),
            None => None,
        };

        let section_id: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO sections (issue_id, pos, name, extended_title, kind, html_file_id, nav_button_image_id)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(issue_id, name) DO UPDATE SET
                pos = excluded.pos,
                extended_title = excluded.extended_title,
                kind = excluded.kind,
                html_file_id = excluded.html_file_id,
                nav_button_image_id = excluded.nav_button_image_id
            RETURNING id
        "#,
        )
        .bind(issue_id)
        .bind(pos as i64)
        .bind(snap.name())
        .bind(&snap.extended_title)
        .bind(&snap.kind)
        .bind(html_file_id)
        .bind(nav_button_image_id)
        .fetch_one(&mut *conn)
        .await?;
        let section_id = section_id.0;

        // Section image set: rebuilt wholesale (unordered)
        sqlx::query("DELETE FROM section_images WHERE section_id = ?")
            .bind(section_id)
            .execute(&mut *conn)
            .await?;
        for img in &snap.images {
            let image_id = upsert_image(conn, img, subdir).await?;
            sqlx::query("INSERT OR IGNORE INTO section_images (section_id, image_id) VALUES (?, ?)")
                .bind(section_id)
                .bind(image_id)
                .execute(&mut *conn)
                .await?;
        }

        // Ordered article list: renumbered 0..n-1 in snapshot order
        sqlx::query("DELETE FROM section_articles WHERE section_id = ?")
            .bind(section_id)
            .execute(&mut *conn)
            .await?;
        for (apos, article) in snap.articles.iter().enumerate() {
            let article_id = upsert_article(conn, article, subdir).await?;
            sqlx::query(
                "INSERT OR REPLACE INTO section_articles (section_id, article_id, pos) VALUES (?, ?, ?)",
            )
            .bind(section_id)
            .bind(article_id)
            .bind(apos as i64)
            .execute(&mut *conn)
            .await?;
        }
    }

    Ok(())
}

/// Insert or update an article by its HTML file name, including its image
/// set and ordered author list. User state (bookmark, reading position)
/// survives the update.
pub(crate) async fn upsert_article(
    conn: &mut SqliteConnection,
    snap: &ArticleSnapshot,
    subdir: &str,
) -> Result<i64> {
    let html_file_id = upsert_entry_meta(
        conn,
        &snap.html.name,
        subdir,
        snap.html.storage_type,
        snap.html.mod_time,
        snap.html.size,
        snap.html.sha256.as_deref(),
    )
    .await?;
    let audio_file_id = match &snap.audio {
        Some(audio) => Some(
            upsert_entry_meta(
                conn,
                &audio.name,
                subdir,
                audio.storage_type,
                audio.mod_time,
                audio.size,
                audio.sha256.as_deref(),
            )
            .await?,
        ),
        None => None,
    };

    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO articles (html_name, title, teaser, online_link, html_file_id, audio_file_id)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(html_name) DO UPDATE SET
            title = excluded.title,
            teaser = excluded.teaser,
            online_link = excluded.online_link,
            html_file_id = excluded.html_file_id,
            audio_file_id = excluded.audio_file_id
        RETURNING id
    "#,
    )
    .bind(&snap.html.name)
    .bind(&snap.title)
    .bind(&snap.teaser)
    .bind(&snap.online_link)
    .bind(html_file_id)
    .bind(audio_file_id)
    .fetch_one(&mut *conn)
    .await?;
    let article_id = row.0;

    sqlx::query("DELETE FROM article_images WHERE article_id = ?")
        .bind(article_id)
        .execute(&mut *conn)
        .await?;
    for img in &snap.images {
        let image_id = upsert_image(conn, img, subdir).await?;
        sqlx::query("INSERT OR IGNORE INTO article_images (article_id, image_id) VALUES (?, ?)")
            .bind(article_id)
            .bind(image_id)
            .execute(&mut *conn)
            .await?;
    }

    sqlx::query("DELETE FROM article_authors WHERE article_id = ?")
        .bind(article_id)
        .execute(&mut *conn)
        .await?;
    for (pos, author) in snap.authors.iter().enumerate() {
        let Some(key) = author.key() else {
            tracing::warn!(
                article = %snap.html.name,
                "Author without name or photo in snapshot, skipping"
            );
            continue;
        };
        let photo_image_id = match &author.photo {
            Some(photo) => Some(upsert_image(conn, photo, subdir).await?),
            None => None,
        };
        let author_row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO authors (author_key, name, photo_image_id)
            VALUES (?, ?, ?)
            ON CONFLICT(author_key) DO UPDATE SET
                name = COALESCE(excluded.name, authors.name),
                photo_image_id = COALESCE(excluded.photo_image_id, authors.photo_image_id)
            RETURNING id
        "#,
        )
        .bind(&key)
        .bind(&author.name)
        .bind(photo_image_id)
        .fetch_one(&mut *conn)
        .await?;
        sqlx::query(
            "INSERT OR REPLACE INTO article_authors (article_id, author_id, pos) VALUES (?, ?, ?)",
        )
        .bind(article_id)
        .bind(author_row.0)
        .bind(pos as i64)
        .execute(&mut *conn)
        .await?;
    }

    Ok(article_id)
}

/// Insert or update an image row keyed by its underlying file.
pub(crate) async fn upsert_image(
    conn: &mut SqliteConnection,
    snap: &ImageSnapshot,
    subdir: &str,
) -> Result<i64> {
    let file_entry_id = upsert_entry_meta(
        conn,
        &snap.file.name,
        subdir,
        snap.file.storage_type,
        snap.file.mod_time,
        snap.file.size,
        snap.file.sha256.as_deref(),
    )
    .await?;

    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO images (file_entry_id, resolution, kind, alpha, sharable)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(file_entry_id) DO UPDATE SET
            resolution = excluded.resolution,
            kind = excluded.kind,
            alpha = excluded.alpha,
            sharable = excluded.sharable
        RETURNING id
    "#,
    )
    .bind(file_entry_id)
    .bind(&snap.resolution)
    .bind(&snap.kind)
    .bind(snap.alpha)
    .bind(snap.sharable)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.0)
}

/// Sweep articles no section references and no issue claims as imprint.
/// Runs at the end of an issue merge and of an eviction, so an article
/// shared between sections survives until its last reference goes.
pub(crate) async fn delete_orphan_articles(conn: &mut SqliteConnection) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM articles
        WHERE id NOT IN (SELECT article_id FROM section_articles)
          AND id NOT IN (SELECT imprint_article_id FROM issues WHERE imprint_article_id IS NOT NULL)
    "#,
    )
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Sweep authors with no remaining article references, then images nothing
/// references any more (articles, sections, moments, author photos, nav
/// buttons, facsimiles).
pub(crate) async fn delete_orphan_authors_and_images(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("DELETE FROM authors WHERE id NOT IN (SELECT author_id FROM article_authors)")
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        r#"
        DELETE FROM images
        WHERE id NOT IN (SELECT image_id FROM article_images)
          AND id NOT IN (SELECT image_id FROM section_images)
          AND id NOT IN (SELECT image_id FROM moment_images)
          AND id NOT IN (SELECT photo_image_id FROM authors WHERE photo_image_id IS NOT NULL)
          AND id NOT IN (SELECT nav_button_image_id FROM sections WHERE nav_button_image_id IS NOT NULL)
          AND id NOT IN (SELECT facsimile_image_id FROM pages WHERE facsimile_image_id IS NOT NULL)
    "#,
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}
