//! Inbound snapshot graph: the shapes the remote-feed collaborator hands to
//! the merge engine after a feed query.
//!
//! Snapshots are plain data. They carry no store IDs — entities are matched
//! against the persisted graph by their uniqueness keys (feed name, issue
//! date, HTML/PDF file name, author name) during the merge.

use anyhow::Result;
use chrono::NaiveDate;
use serde::Deserialize;

use crate::store::StorageType;
use crate::util::validate_base_url;

// ============================================================================
// Graph Types
// ============================================================================

/// Root snapshot: the publication source and its feeds.
#[derive(Debug, Clone, Deserialize)]
pub struct FeederSnapshot {
    pub title: String,
    #[serde(default)]
    pub timezone: Option<String>,
    pub base_url: String,
    #[serde(default)]
    pub global_base_url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub resource_version: i64,
    #[serde(default)]
    pub feeds: Vec<FeedSnapshot>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedSnapshot {
    pub name: String,
    #[serde(default)]
    pub cycle: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub moment_ratio: Option<f64>,
    #[serde(default)]
    pub issue_count: Option<i64>,
    #[serde(default)]
    pub first_issue_date: Option<NaiveDate>,
    #[serde(default)]
    pub last_issue_date: Option<NaiveDate>,
    /// The issue window carried by this query; older local issues are kept
    #[serde(default)]
    pub issues: Vec<IssueSnapshot>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueSnapshot {
    pub date: NaiveDate,
    #[serde(default)]
    pub modified: Option<i64>,
    #[serde(default)]
    pub weekend: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub min_resource_version: i64,
    #[serde(default)]
    pub zip_name: Option<String>,
    #[serde(default)]
    pub zip_pdf_name: Option<String>,
    pub payload: PayloadSnapshot,
    #[serde(default)]
    pub moment: MomentSnapshot,
    #[serde(default)]
    pub imprint: Option<ArticleSnapshot>,
    #[serde(default)]
    pub sections: Vec<SectionSnapshot>,
    #[serde(default)]
    pub pages: Vec<PageSnapshot>,
}

/// A section, keyed by its HTML file name (`html.name`).
#[derive(Debug, Clone, Deserialize)]
pub struct SectionSnapshot {
    pub html: FileSnapshot,
    #[serde(default)]
    pub extended_title: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub nav_button: Option<ImageSnapshot>,
    #[serde(default)]
    pub images: Vec<ImageSnapshot>,
    #[serde(default)]
    pub articles: Vec<ArticleSnapshot>,
}

impl SectionSnapshot {
    /// Uniqueness key: the section's HTML file name.
    pub fn name(&self) -> &str {
        &self.html.name
    }
}

/// An article, keyed by its HTML file name (`html.name`).
#[derive(Debug, Clone, Deserialize)]
pub struct ArticleSnapshot {
    pub html: FileSnapshot,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub teaser: Option<String>,
    #[serde(default)]
    pub online_link: Option<String>,
    #[serde(default)]
    pub audio: Option<FileSnapshot>,
    #[serde(default)]
    pub images: Vec<ImageSnapshot>,
    #[serde(default)]
    pub authors: Vec<AuthorSnapshot>,
}

/// A page, keyed by its PDF file name (`pdf.name`).
#[derive(Debug, Clone, Deserialize)]
pub struct PageSnapshot {
    pub pdf: FileSnapshot,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub pagina: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub frames: Vec<FrameSnapshot>,
}

/// A clickable rectangle on a page. Frames carry no identity of their own;
/// they are regenerated from every snapshot and matched against persisted
/// frames by approximate coordinate equality.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameSnapshot {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    /// HTML file name of the linked article, if any
    #[serde(default)]
    pub link: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MomentSnapshot {
    /// Unprocessed cover blob, when the feed ships one
    #[serde(default)]
    pub raw: Option<FileSnapshot>,
    #[serde(default)]
    pub images: Vec<ImageSnapshot>,
    #[serde(default)]
    pub credited: Vec<ImageSnapshot>,
    #[serde(default)]
    pub animation: Vec<FileSnapshot>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorSnapshot {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub photo: Option<ImageSnapshot>,
}

impl AuthorSnapshot {
    /// Uniqueness key: the trimmed name, falling back to the photo's file
    /// name. `None` means the author is unidentifiable and is skipped.
    pub fn key(&self) -> Option<String> {
        if let Some(name) = self.name.as_deref() {
            let trimmed = name.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        self.photo
            .as_ref()
            .filter(|p| !p.file.name.is_empty())
            .map(|p| format!("photo:{}", p.file.name))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageSnapshot {
    pub file: FileSnapshot,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_true")]
    pub sharable: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileSnapshot {
    pub name: String,
    #[serde(default)]
    pub storage_type: StorageType,
    #[serde(default)]
    pub mod_time: Option<i64>,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayloadSnapshot {
    /// Destination subdirectory under the storage-class root
    pub local_dir: String,
    #[serde(default)]
    pub remote_base_url: Option<String>,
    #[serde(default)]
    pub zip_name: Option<String>,
    #[serde(default)]
    pub files: Vec<FileSnapshot>,
    /// Names of the member files retained when the issue is reduced to its
    /// overview representation
    #[serde(default)]
    pub overview_files: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourcesSnapshot {
    pub version: i64,
    pub payload: PayloadSnapshot,
}

fn default_alpha() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse a feeder snapshot from a feed-query response body.
pub fn feeder_from_json(bytes: &[u8]) -> Result<FeederSnapshot> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Parse a single-issue snapshot.
pub fn issue_from_json(bytes: &[u8]) -> Result<IssueSnapshot> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Parse a resources-bundle snapshot.
pub fn resources_from_json(bytes: &[u8]) -> Result<ResourcesSnapshot> {
    Ok(serde_json::from_slice(bytes)?)
}

// ============================================================================
// Structural Validation
// ============================================================================

impl FeederSnapshot {
    /// Feeder-level validation: base URLs must be sane and feed names
    /// usable. A bad feeder snapshot fails the whole merge (there is
    /// nothing to salvage below it).
    pub fn validate(&self) -> Result<(), String> {
        validate_base_url(&self.base_url).map_err(|e| format!("base_url: {e}"))?;
        if let Some(global) = self.global_base_url.as_deref() {
            validate_base_url(global).map_err(|e| format!("global_base_url: {e}"))?;
        }
        let mut seen = std::collections::HashSet::new();
        for feed in &self.feeds {
            if feed.name.trim().is_empty() {
                return Err("feed with empty name".to_string());
            }
            if !seen.insert(feed.name.as_str()) {
                return Err(format!("duplicate feed name '{}'", feed.name));
            }
        }
        Ok(())
    }
}

impl IssueSnapshot {
    /// Structural validation, run before any row is written so an invalid
    /// issue is skipped whole, never half-applied.
    pub fn validate(&self) -> Result<(), String> {
        if self.payload.local_dir.trim().is_empty() {
            return Err("payload with empty local_dir".to_string());
        }
        if let Some(url) = self.base_url.as_deref() {
            validate_base_url(url).map_err(|e| format!("base_url: {e}"))?;
        }

        let mut file_names = std::collections::HashSet::new();
        for file in &self.payload.files {
            if file.name.trim().is_empty() {
                return Err("payload file with empty name".to_string());
            }
            if !file_names.insert(file.name.as_str()) {
                return Err(format!("duplicate payload file '{}'", file.name));
            }
        }
        for name in &self.payload.overview_files {
            if !file_names.contains(name.as_str()) {
                return Err(format!("overview file '{name}' is not a payload member"));
            }
        }

        let mut section_names = std::collections::HashSet::new();
        for section in &self.sections {
            if section.name().trim().is_empty() {
                return Err("section with empty HTML name".to_string());
            }
            if !section_names.insert(section.name()) {
                return Err(format!("duplicate section '{}'", section.name()));
            }
            for article in &section.articles {
                if article.html.name.trim().is_empty() {
                    return Err(format!(
                        "article with empty HTML name in section '{}'",
                        section.name()
                    ));
                }
            }
        }

        if let Some(imprint) = &self.imprint {
            if imprint.html.name.trim().is_empty() {
                return Err("imprint article with empty HTML name".to_string());
            }
        }

        let mut pdf_names = std::collections::HashSet::new();
        for page in &self.pages {
            if page.pdf.name.trim().is_empty() {
                return Err("page with empty PDF name".to_string());
            }
            if !pdf_names.insert(page.pdf.name.as_str()) {
                return Err(format!("duplicate page '{}'", page.pdf.name));
            }
            for frame in &page.frames {
                if ![frame.x1, frame.y1, frame.x2, frame.y2]
                    .iter()
                    .all(|c| c.is_finite())
                {
                    return Err(format!(
                        "frame with non-finite coordinates on page '{}'",
                        page.pdf.name
                    ));
                }
            }
        }

        Ok(())
    }
}
