//! Page and frame reconciliation, plus lazy facsimile rendering.

use std::path::{Path, PathBuf};

use anyhow::Result;
use sqlx::SqliteConnection;

use super::blobs::upsert_entry_meta;
use super::schema::Store;
use crate::snapshot::{FrameSnapshot, PageSnapshot};

/// Frames carry no identity, so a persisted frame is considered "the same"
/// as a snapshot frame when all four coordinates agree within this
/// tolerance. Coordinates are page-relative fractions in [0, 1]; 1e-4 is
/// far below anything a reader could hit.
pub(crate) const FRAME_MATCH_TOLERANCE: f64 = 1e-4;

/// Renders a one-page PDF into a raster facsimile file.
///
/// The store owns when and where rendering happens (lazily, once per page);
/// the actual rasterizer lives with the caller, which keeps PDF tooling out
/// of the persistence layer.
pub trait FacsimileRenderer: Send + Sync {
    /// Render `pdf` to an image file at `out`. The parent directory exists.
    fn render(&self, pdf: &Path, out: &Path) -> Result<()>;
}

/// Reconcile an issue's page list with the snapshot. Returns the id of the
/// first page (by snapshot order), used as the moment's title page.
pub(crate) async fn merge_pages(
    conn: &mut SqliteConnection,
    issue_id: i64,
    snaps: &[PageSnapshot],
    subdir: &str,
) -> Result<Option<i64>> {
    let existing: Vec<(i64, String)> =
        sqlx::query_as("SELECT id, pdf_name FROM pages WHERE issue_id = ?")
            .bind(issue_id)
            .fetch_all(&mut *conn)
            .await?;

    let keep: std::collections::HashSet<&str> =
        snaps.iter().map(|p| p.pdf.name.as_str()).collect();
    for (id, pdf_name) in &existing {
        if !keep.contains(pdf_name.as_str()) {
            sqlx::query("DELETE FROM pages WHERE id = ?")
                .bind(id)
                .execute(&mut *conn)
                .await?;
        }
    }

    let mut first_page_id = None;
    for (pos, snap) in snaps.iter().enumerate() {
        let pdf_file_id = upsert_entry_meta(
            conn,
            &snap.pdf.name,
            subdir,
            snap.pdf.storage_type,
            snap.pdf.mod_time,
            snap.pdf.size,
            snap.pdf.sha256.as_deref(),
        )
        .await?;

        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO pages (issue_id, pos, title, pagina, kind, pdf_name, pdf_file_id)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(issue_id, pdf_name) DO UPDATE SET
                pos = excluded.pos,
                title = excluded.title,
                pagina = excluded.pagina,
                kind = excluded.kind,
                pdf_file_id = excluded.pdf_file_id
            RETURNING id
        "#,
        )
        .bind(issue_id)
        .bind(pos as i64)
        .bind(&snap.title)
        .bind(&snap.pagina)
        .bind(&snap.kind)
        .bind(&snap.pdf.name)
        .bind(pdf_file_id)
        .fetch_one(&mut *conn)
        .await?;
        let page_id = row.0;
        if first_page_id.is_none() {
            first_page_id = Some(page_id);
        }

        merge_frames(conn, page_id, &snap.frames).await?;
    }

    Ok(first_page_id)
}

/// Reconcile a page's frames by approximate coordinate match.
///
/// Each snapshot frame claims at most one persisted frame (the first
/// unclaimed one within tolerance); matched frames are updated in place,
/// the rest inserted, and persisted frames nothing claimed are deleted.
async fn merge_frames(
    conn: &mut SqliteConnection,
    page_id: i64,
    snaps: &[FrameSnapshot],
) -> Result<()> {
    let existing: Vec<(i64, f64, f64, f64, f64)> =
        sqlx::query_as("SELECT id, x1, y1, x2, y2 FROM frames WHERE page_id = ?")
            .bind(page_id)
            .fetch_all(&mut *conn)
            .await?;

    let mut claimed = vec![false; existing.len()];
    for (pos, snap) in snaps.iter().enumerate() {
        let matched = existing.iter().enumerate().find(|(i, (_, x1, y1, x2, y2))| {
            !claimed[*i]
                && (snap.x1 - x1).abs() <= FRAME_MATCH_TOLERANCE
                && (snap.y1 - y1).abs() <= FRAME_MATCH_TOLERANCE
                && (snap.x2 - x2).abs() <= FRAME_MATCH_TOLERANCE
                && (snap.y2 - y2).abs() <= FRAME_MATCH_TOLERANCE
        });

        match matched {
            Some((i, (id, ..))) => {
                claimed[i] = true;
                sqlx::query(
                    "UPDATE frames SET pos = ?, x1 = ?, y1 = ?, x2 = ?, y2 = ?, link = ? WHERE id = ?",
                )
                .bind(pos as i64)
                .bind(snap.x1)
                .bind(snap.y1)
                .bind(snap.x2)
                .bind(snap.y2)
                .bind(&snap.link)
                .bind(id)
                .execute(&mut *conn)
                .await?;
            }
            None => {
                sqlx::query(
                    "INSERT INTO frames (page_id, pos, x1, y1, x2, y2, link) VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(page_id)
                .bind(pos as i64)
                .bind(snap.x1)
                .bind(snap.y1)
                .bind(snap.x2)
                .bind(snap.y2)
                .bind(&snap.link)
                .execute(&mut *conn)
                .await?;
            }
        }
    }

    for (i, (id, ..)) in existing.iter().enumerate() {
        if !claimed[i] {
            sqlx::query("DELETE FROM frames WHERE id = ?")
                .bind(id)
                .execute(&mut *conn)
                .await?;
        }
    }

    Ok(())
}

impl Store {
    // ========================================================================
    // Lazy Facsimile
    // ========================================================================

    /// Return the path of a page's raster facsimile, rendering it on first
    /// use.
    ///
    /// Rendering is serialized on a store-wide lock with a re-check after
    /// acquisition, so concurrent readers of the same page render once.
    /// Returns `Ok(None)` when the page is unknown, its PDF is not stored
    /// yet, or rendering fails (logged; a later call retries).
    pub async fn facsimile_for_page(
        &self,
        page_id: i64,
        renderer: &dyn FacsimileRenderer,
    ) -> Result<Option<PathBuf>> {
        if let Some(path) = self.existing_facsimile(page_id).await? {
            return Ok(Some(path));
        }

        let _guard = self.facsimile_lock.lock().await;
        if let Some(path) = self.existing_facsimile(page_id).await? {
            return Ok(Some(path));
        }

        let pdf: Option<(String, String, String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT f.name, f.subdir, f.storage_type, f.size, f.stored_size
            FROM pages p
            JOIN file_entries f ON f.id = p.pdf_file_id
            WHERE p.id = ?
        "#,
        )
        .bind(page_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((pdf_name, subdir, storage_type, size, stored_size)) = pdf else {
            return Ok(None);
        };
        if size <= 0 || stored_size < size {
            tracing::debug!(page_id, pdf = %pdf_name, "PDF not fully stored, no facsimile yet");
            return Ok(None);
        }

        let pdf_path = self.blob_path(&storage_type, &subdir, &pdf_name);
        let stem = pdf_name.strip_suffix(".pdf").unwrap_or(&pdf_name);
        let out_name = format!("{stem}.facsimile.png");
        let out_path = self.blob_path(&storage_type, &subdir, &out_name);

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Err(e) = renderer.render(&pdf_path, &out_path) {
            tracing::warn!(page_id, pdf = %pdf_path.display(), error = %e, "Facsimile render failed");
            return Ok(None);
        }

        let st = storage_type
            .parse()
            .unwrap_or(super::types::StorageType::Issue);
        let Some(entry) = self.put(&out_path, st, &subdir).await? else {
            return Ok(None);
        };

        let image_id: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO images (file_entry_id, kind, alpha, sharable)
            VALUES (?, 'facsimile', 1.0, 0)
            ON CONFLICT(file_entry_id) DO UPDATE SET kind = 'facsimile'
            RETURNING id
        "#,
        )
        .bind(entry.id)
        .fetch_one(&self.pool)
        .await?;
        sqlx::query("UPDATE pages SET facsimile_image_id = ? WHERE id = ?")
            .bind(image_id.0)
            .bind(page_id)
            .execute(&self.pool)
            .await?;

        tracing::debug!(page_id, path = %out_path.display(), "Rendered page facsimile");
        Ok(Some(out_path))
    }

    async fn existing_facsimile(&self, page_id: i64) -> Result<Option<PathBuf>> {
        let row: Option<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT f.name, f.subdir, f.storage_type
            FROM pages p
            JOIN images i ON i.id = p.facsimile_image_id
            JOIN file_entries f ON f.id = i.file_entry_id
            WHERE p.id = ?
        "#,
        )
        .bind(page_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((name, subdir, storage_type)) => {
                let path = self.blob_path(&storage_type, &subdir, &name);
                if path.is_file() {
                    Ok(Some(path))
                } else {
                    // Stale record (blob tree wiped out of band): re-render
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }
}
