use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Store-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another process has the cache database locked
    #[error("Another process appears to be using this cache. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Cache migration failed: {0}")]
    Migration(String),

    /// A snapshot is structurally invalid and its merge was refused
    #[error("Snapshot integrity violation: {0}")]
    Integrity(String),

    /// The explicit flush (checkpoint) failed; committed state is unaffected
    /// but the caller must know the flush did not happen
    #[error("Cache flush failed: {0}")]
    Flush(sqlx::Error),

    /// Generic database error
    #[error("Cache error: {0}")]
    Other(#[from] sqlx::Error),
}

impl StoreError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // Check for SQLite lock-related error messages
        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return StoreError::InstanceLocked;
        }

        StoreError::Other(err)
    }
}

// ============================================================================
// Storage Classes
// ============================================================================

/// Storage class of a blob file. Each class maps to its own directory tree
/// under the store's data dir.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Issue-scoped content (HTML, PDF, images of one issue)
    #[default]
    Issue,
    /// Versioned shared resource bundle files
    Resource,
    /// Feeder-global files (fonts, shared assets)
    Global,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Issue => "issue",
            StorageType::Resource => "resource",
            StorageType::Global => "global",
        }
    }
}

impl std::str::FromStr for StorageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "issue" => Ok(StorageType::Issue),
            "resource" => Ok(StorageType::Resource),
            "global" => Ok(StorageType::Global),
            other => Err(format!("unknown storage type '{other}'")),
        }
    }
}

// ============================================================================
// Merge Reporting
// ============================================================================

/// One skipped subtree during a merge: the entity kind, its uniqueness key
/// and why it was refused. Sibling subtrees still merge.
#[derive(Debug, Clone)]
pub struct MergeSkip {
    pub entity: &'static str,
    pub key: String,
    pub reason: String,
}

/// Result of a top-level feeder merge.
#[derive(Debug)]
pub struct MergeOutcome {
    pub feeder_id: i64,
    pub merged_issues: usize,
    pub skipped: Vec<MergeSkip>,
}

// ============================================================================
// Aggregate Statistics
// ============================================================================

/// Aggregate store statistics (counts and byte totals across the cache).
#[derive(Debug)]
pub struct StoreStats {
    pub feeds: i64,
    pub issues: i64,
    pub complete_issues: i64,
    pub file_entries: i64,
    pub bytes_declared: i64,
    pub bytes_stored: i64,
}

// ============================================================================
// Entities
// ============================================================================

/// The remote publication source configuration and its locally cached root.
///
/// Custom Debug impl masks `auth_token` to prevent credential leakage in
/// logs and error messages.
#[derive(Clone, sqlx::FromRow)]
pub struct Feeder {
    pub id: i64,
    pub title: String,
    pub timezone: Option<String>,
    pub base_url: String,
    pub global_base_url: Option<String>,
    pub auth_token: Option<String>,
    pub resource_version: i64,
    pub last_updated: Option<i64>,
}

impl std::fmt::Debug for Feeder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feeder")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("timezone", &self.timezone)
            .field("base_url", &self.base_url)
            .field("global_base_url", &self.global_base_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("resource_version", &self.resource_version)
            .field("last_updated", &self.last_updated)
            .finish()
    }
}

/// A named series of issues (one publication stream) under a feeder.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Feed {
    pub id: i64,
    pub feeder_id: i64,
    pub name: String,
    pub cycle: Option<String>,
    pub kind: Option<String>,
    pub moment_ratio: Option<f64>,
    pub issue_count: i64,
    /// ISO dates ("YYYY-MM-DD"); lexical order is chronological order
    pub first_issue_date: Option<String>,
    pub last_issue_date: Option<String>,
    pub last_read: Option<i64>,
    pub last_updated: Option<i64>,
}

/// One dated publication instance, the primary download/eviction unit.
/// `(feed_id, date)` is unique.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Issue {
    pub id: i64,
    pub feed_id: i64,
    /// ISO date ("YYYY-MM-DD")
    pub date: String,
    pub modified: Option<i64>,
    pub weekend: bool,
    pub base_url: Option<String>,
    pub status: Option<String>,
    pub min_resource_version: i64,
    pub zip_name: Option<String>,
    pub zip_pdf_name: Option<String>,
    pub is_complete: bool,
    pub is_ovw_complete: bool,
    pub last_article: Option<i64>,
    pub last_section: Option<i64>,
    pub last_page: Option<i64>,
    pub payload_id: Option<i64>,
    pub moment_id: Option<i64>,
    pub imprint_article_id: Option<i64>,
}

/// A named group of articles within an issue. `name` is the section's HTML
/// file name and is unique per issue.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Section {
    pub id: i64,
    pub issue_id: i64,
    pub pos: i64,
    pub name: String,
    pub extended_title: Option<String>,
    pub kind: Option<String>,
    pub html_file_id: Option<i64>,
    pub nav_button_image_id: Option<i64>,
}

/// An article, keyed by its HTML file name. May appear in multiple sections
/// and be linked from multiple page frames.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Article {
    pub id: i64,
    pub html_name: String,
    pub title: Option<String>,
    pub teaser: Option<String>,
    pub online_link: Option<String>,
    pub bookmarked: bool,
    pub reading_position: f64,
    pub html_file_id: Option<i64>,
    pub audio_file_id: Option<i64>,
}

/// A printed page of an issue, keyed by its PDF file name. The facsimile
/// image is derived lazily on first read.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Page {
    pub id: i64,
    pub issue_id: i64,
    pub pos: i64,
    pub title: Option<String>,
    pub pagina: Option<String>,
    pub kind: Option<String>,
    pub pdf_name: String,
    pub pdf_file_id: Option<i64>,
    pub facsimile_image_id: Option<i64>,
}

/// A clickable rectangle on a page, optionally linking to an article's HTML
/// file name. Identity is matched by approximate coordinate equality.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Frame {
    pub id: i64,
    pub page_id: i64,
    pub pos: i64,
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    pub link: Option<String>,
}

/// The cover-image representation of an issue.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Moment {
    pub id: i64,
    pub first_page_id: Option<i64>,
    /// Unprocessed cover blob shipped by the feed, if any
    pub raw_file_id: Option<i64>,
}

/// An article author, keyed by name with the photo file name as fallback.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Author {
    pub id: i64,
    pub author_key: String,
    pub name: Option<String>,
    pub photo_image_id: Option<i64>,
}

/// An image backed by a single file entry.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Image {
    pub id: i64,
    pub file_entry_id: i64,
    pub resolution: Option<String>,
    pub kind: Option<String>,
    pub alpha: f64,
    pub sharable: bool,
}

/// A logical handle to a physical, checksummed file. The same entry may be
/// referenced by several payloads; the record and the physical file are only
/// removed once the last payload reference is gone.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FileEntry {
    pub id: i64,
    pub name: String,
    pub subdir: String,
    pub storage_type: String,
    pub mod_time: Option<i64>,
    /// Size declared by the remote snapshot
    pub size: i64,
    /// Bytes actually present on disk (updated as downloads land)
    pub stored_size: i64,
    pub sha256: Option<String>,
}

impl FileEntry {
    /// Whether the full declared content is present locally. A declared
    /// size of zero is a legitimate empty file and counts as stored.
    pub fn is_stored(&self) -> bool {
        self.stored_size >= self.size
    }
}

/// The downloadable file-set backing an issue or resources bundle.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Payload {
    pub id: i64,
    pub local_dir: String,
    pub remote_base_url: Option<String>,
    pub zip_name: Option<String>,
    pub bytes_loaded: i64,
    pub bytes_total: i64,
    pub dl_started: Option<i64>,
    pub dl_stopped: Option<i64>,
}

impl Payload {
    /// Download completeness derives from the byte counters; a payload with
    /// an unknown total is never complete.
    pub fn is_complete(&self) -> bool {
        self.bytes_total > 0 && self.bytes_loaded >= self.bytes_total
    }
}

/// A versioned shared resource bundle, independent of any single issue.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Resources {
    pub id: i64,
    pub version: i64,
    pub payload_id: Option<i64>,
}
