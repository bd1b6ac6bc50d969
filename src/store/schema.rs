use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use lru::LruCache;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};

use super::types::StoreError;

/// Number of name -> path resolutions kept in the in-process LRU cache.
const RESOLVE_CACHE_ENTRIES: usize = 256;

// ============================================================================
// Store
// ============================================================================

/// The shared persistence context: entity records in an embedded SQLite
/// database, physical blob files in a directory tree under `data_dir`.
///
/// Explicitly constructed and passed to all collaborators; tests create as
/// many isolated stores as they need (`:memory:` plus a temp dir).
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: SqlitePool,
    pub(crate) data_dir: PathBuf,
    /// LRU cache for blob name -> absolute path resolution
    pub(crate) resolve_cache: Arc<Mutex<LruCache<String, PathBuf>>>,
    /// Serializes lazy facsimile derivation so concurrent readers don't
    /// render the same page twice
    pub(crate) facsimile_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Store {
    /// Open the store and run migrations.
    ///
    /// `db_path` is the SQLite file (":memory:" for tests), `data_dir` the
    /// root directory of the physical blob tree.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InstanceLocked` if another process has the
    /// database locked (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `StoreError::Migration` if the schema migration fails.
    pub async fn open(db_path: &str, data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let url = format!("sqlite:{}?mode=rwc", db_path);

        // busy_timeout=5000: SQLite waits up to 5 seconds for locks to release
        // before returning SQLITE_BUSY. Handles transient contention between a
        // merge and a background progress writer automatically.
        // WAL keeps committed state intact across abrupt termination; readers
        // are never blocked by the single writer.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(StoreError::from_sqlx)?
            .pragma("busy_timeout", "5000")
            .pragma("journal_mode", "WAL");
        // SQLite is single-writer; 5 connections covers concurrent readers
        // (render lookups + progress polls) alongside one merge.
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(StoreError::from_sqlx)?;

        let store = Self {
            pool,
            data_dir: data_dir.into(),
            resolve_cache: Arc::new(Mutex::new(LruCache::new(
                NonZeroUsize::new(RESOLVE_CACHE_ENTRIES).expect("nonzero cache size"),
            ))),
            facsimile_lock: Arc::new(tokio::sync::Mutex::new(())),
        };
        store.migrate().await.map_err(|e| {
            let error_string = e.to_string().to_lowercase();
            if error_string.contains("database is locked")
                || error_string.contains("database table is locked")
                || error_string.contains("sqlite_busy")
                || error_string.contains("sqlite_locked")
            {
                StoreError::InstanceLocked
            } else {
                StoreError::Migration(e.to_string())
            }
        })?;
        Ok(store)
    }

    /// Explicit flush: checkpoint the WAL into the main database file.
    ///
    /// Called at well-defined points (after a merge; before suspension)
    /// rather than after every write. A failed flush is fatal to the caller
    /// since silently losing it risks the single-writer invariant.
    pub async fn save(&self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .map_err(StoreError::Flush)?;
        Ok(())
    }

    /// Release the store: drain the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All schema statements use `IF NOT EXISTS`, so re-running on an
    /// existing database is a no-op. If any step fails the transaction is
    /// rolled back, leaving the previous schema intact.
    async fn migrate(&self) -> Result<()> {
        // Enable foreign keys (per-connection setting, outside the transaction)
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeders (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                timezone TEXT,
                base_url TEXT UNIQUE NOT NULL,
                global_base_url TEXT,
                auth_token TEXT,
                resource_version INTEGER NOT NULL DEFAULT 0,
                last_updated INTEGER
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                feeder_id INTEGER NOT NULL REFERENCES feeders(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                cycle TEXT,
                kind TEXT,
                moment_ratio REAL,
                issue_count INTEGER NOT NULL DEFAULT 0,
                first_issue_date TEXT,
                last_issue_date TEXT,
                last_read INTEGER,
                last_updated INTEGER,
                UNIQUE(feeder_id, name)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS payloads (
                id INTEGER PRIMARY KEY,
                local_dir TEXT NOT NULL,
                remote_base_url TEXT,
                zip_name TEXT,
                bytes_loaded INTEGER NOT NULL DEFAULT 0,
                bytes_total INTEGER NOT NULL DEFAULT 0,
                dl_started INTEGER,
                dl_stopped INTEGER
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS file_entries (
                id INTEGER PRIMARY KEY,
                name TEXT UNIQUE NOT NULL,
                subdir TEXT NOT NULL DEFAULT '',
                storage_type TEXT NOT NULL DEFAULT 'issue',
                mod_time INTEGER,
                size INTEGER NOT NULL DEFAULT 0,
                stored_size INTEGER NOT NULL DEFAULT 0,
                sha256 TEXT
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Ordered payload membership; the refcount behind blob deletion.
        // `overview` marks files retained when an issue is reduced.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS payload_files (
                payload_id INTEGER NOT NULL REFERENCES payloads(id) ON DELETE CASCADE,
                file_entry_id INTEGER NOT NULL REFERENCES file_entries(id) ON DELETE CASCADE,
                pos INTEGER NOT NULL DEFAULT 0,
                overview INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (payload_id, file_entry_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS images (
                id INTEGER PRIMARY KEY,
                file_entry_id INTEGER UNIQUE NOT NULL REFERENCES file_entries(id) ON DELETE CASCADE,
                resolution TEXT,
                kind TEXT,
                alpha REAL NOT NULL DEFAULT 1.0,
                sharable INTEGER NOT NULL DEFAULT 1
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS moments (
                id INTEGER PRIMARY KEY,
                first_page_id INTEGER REFERENCES pages(id) ON DELETE SET NULL,
                raw_file_id INTEGER REFERENCES file_entries(id) ON DELETE SET NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS moment_images (
                moment_id INTEGER NOT NULL REFERENCES moments(id) ON DELETE CASCADE,
                image_id INTEGER NOT NULL REFERENCES images(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                pos INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (moment_id, image_id, kind)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Animation frame sequence of a moment (plain files, not images)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS moment_files (
                moment_id INTEGER NOT NULL REFERENCES moments(id) ON DELETE CASCADE,
                file_entry_id INTEGER NOT NULL REFERENCES file_entries(id) ON DELETE CASCADE,
                pos INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (moment_id, file_entry_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY,
                html_name TEXT UNIQUE NOT NULL,
                title TEXT,
                teaser TEXT,
                online_link TEXT,
                bookmarked INTEGER NOT NULL DEFAULT 0,
                reading_position REAL NOT NULL DEFAULT 0,
                html_file_id INTEGER REFERENCES file_entries(id) ON DELETE SET NULL,
                audio_file_id INTEGER REFERENCES file_entries(id) ON DELETE SET NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS issues (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                date TEXT NOT NULL,
                modified INTEGER,
                weekend INTEGER NOT NULL DEFAULT 0,
                base_url TEXT,
                status TEXT,
                min_resource_version INTEGER NOT NULL DEFAULT 0,
                zip_name TEXT,
                zip_pdf_name TEXT,
                is_complete INTEGER NOT NULL DEFAULT 0,
                is_ovw_complete INTEGER NOT NULL DEFAULT 0,
                last_article INTEGER,
                last_section INTEGER,
                last_page INTEGER,
                payload_id INTEGER REFERENCES payloads(id) ON DELETE SET NULL,
                moment_id INTEGER REFERENCES moments(id) ON DELETE SET NULL,
                imprint_article_id INTEGER REFERENCES articles(id) ON DELETE SET NULL,
                UNIQUE(feed_id, date)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sections (
                id INTEGER PRIMARY KEY,
                issue_id INTEGER NOT NULL REFERENCES issues(id) ON DELETE CASCADE,
                pos INTEGER NOT NULL DEFAULT 0,
                name TEXT NOT NULL,
                extended_title TEXT,
                kind TEXT,
                html_file_id INTEGER REFERENCES file_entries(id) ON DELETE SET NULL,
                nav_button_image_id INTEGER REFERENCES images(id) ON DELETE SET NULL,
                UNIQUE(issue_id, name)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS section_articles (
                section_id INTEGER NOT NULL REFERENCES sections(id) ON DELETE CASCADE,
                article_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                pos INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (section_id, article_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS section_images (
                section_id INTEGER NOT NULL REFERENCES sections(id) ON DELETE CASCADE,
                image_id INTEGER NOT NULL REFERENCES images(id) ON DELETE CASCADE,
                PRIMARY KEY (section_id, image_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS article_images (
                article_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                image_id INTEGER NOT NULL REFERENCES images(id) ON DELETE CASCADE,
                PRIMARY KEY (article_id, image_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS authors (
                id INTEGER PRIMARY KEY,
                author_key TEXT UNIQUE NOT NULL,
                name TEXT,
                photo_image_id INTEGER REFERENCES images(id) ON DELETE SET NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS article_authors (
                article_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                author_id INTEGER NOT NULL REFERENCES authors(id) ON DELETE CASCADE,
                pos INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (article_id, author_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pages (
                id INTEGER PRIMARY KEY,
                issue_id INTEGER NOT NULL REFERENCES issues(id) ON DELETE CASCADE,
                pos INTEGER NOT NULL DEFAULT 0,
                title TEXT,
                pagina TEXT,
                kind TEXT,
                pdf_name TEXT NOT NULL,
                pdf_file_id INTEGER REFERENCES file_entries(id) ON DELETE SET NULL,
                facsimile_image_id INTEGER REFERENCES images(id) ON DELETE SET NULL,
                UNIQUE(issue_id, pdf_name)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS frames (
                id INTEGER PRIMARY KEY,
                page_id INTEGER NOT NULL REFERENCES pages(id) ON DELETE CASCADE,
                pos INTEGER NOT NULL DEFAULT 0,
                x1 REAL NOT NULL,
                y1 REAL NOT NULL,
                x2 REAL NOT NULL,
                y2 REAL NOT NULL,
                link TEXT
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resources (
                id INTEGER PRIMARY KEY,
                version INTEGER UNIQUE NOT NULL,
                payload_id INTEGER REFERENCES payloads(id) ON DELETE SET NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Indexes for the hot query paths
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_issues_feed_date ON issues(feed_id, date DESC)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sections_issue ON sections(issue_id, pos)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_pages_issue ON pages(issue_id, pos)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_frames_page ON frames(page_id, pos)")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_payload_files_entry ON payload_files(file_entry_id)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_section_articles_article ON section_articles(article_id)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_file_entries_sha256 ON file_entries(sha256)")
            .execute(&mut *tx)
            .await?;
        // Partial index: bookmark listing only ever scans bookmarked rows
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_bookmarked ON articles(bookmarked) WHERE bookmarked = 1",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}
