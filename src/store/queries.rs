//! Read-side queries and user-state setters.
//!
//! Lookups of a specific record return `Ok(None)` when it does not exist;
//! only real database failures surface as errors.

use anyhow::Result;

use super::schema::Store;
use super::types::{
    Article, Author, Frame, Image, Issue, Moment, Page, Section, StoreStats,
};

const ISSUE_COLUMNS: &str = "id, feed_id, date, modified, weekend, base_url, status, \
     min_resource_version, zip_name, zip_pdf_name, is_complete, is_ovw_complete, \
     last_article, last_section, last_page, payload_id, moment_id, imprint_article_id";

const ARTICLE_COLUMNS: &str = "id, html_name, title, teaser, online_link, bookmarked, \
     reading_position, html_file_id, audio_file_id";

impl Store {
    // ========================================================================
    // Issue Listing
    // ========================================================================

    /// Up to `count` issues of a feed, newest first, optionally starting at
    /// (and including) `from_date`. ISO dates sort lexically, so the date
    /// column orders chronologically as TEXT.
    pub async fn issues_in_feed(
        &self,
        feed_id: i64,
        count: u32,
        from_date: Option<&str>,
    ) -> Result<Vec<Issue>> {
        let sql = format!(
            "SELECT {ISSUE_COLUMNS} FROM issues
             WHERE feed_id = ? AND (? IS NULL OR date <= ?)
             ORDER BY date DESC LIMIT ?"
        );
        let issues = sqlx::query_as::<_, Issue>(&sql)
            .bind(feed_id)
            .bind(from_date)
            .bind(from_date)
            .bind(count as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(issues)
    }

    /// The newest issue of a feed.
    pub async fn latest_issue(&self, feed_id: i64) -> Result<Option<Issue>> {
        let sql = format!(
            "SELECT {ISSUE_COLUMNS} FROM issues WHERE feed_id = ? ORDER BY date DESC LIMIT 1"
        );
        let issue = sqlx::query_as::<_, Issue>(&sql)
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(issue)
    }

    /// One issue by its `(feed, date)` key.
    pub async fn issue(&self, feed_id: i64, date: &str) -> Result<Option<Issue>> {
        let sql = format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE feed_id = ? AND date = ?");
        let issue = sqlx::query_as::<_, Issue>(&sql)
            .bind(feed_id)
            .bind(date)
            .fetch_optional(&self.pool)
            .await?;
        Ok(issue)
    }

    // ========================================================================
    // Issue Contents
    // ========================================================================

    /// An issue's sections in snapshot order.
    pub async fn sections_of_issue(&self, issue_id: i64) -> Result<Vec<Section>> {
        let sections = sqlx::query_as::<_, Section>(
            "SELECT id, issue_id, pos, name, extended_title, kind, html_file_id, nav_button_image_id
             FROM sections WHERE issue_id = ? ORDER BY pos",
        )
        .bind(issue_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(sections)
    }

    /// A section's articles in reading order.
    pub async fn articles_in_section(&self, section_id: i64) -> Result<Vec<Article>> {
        let articles = sqlx::query_as::<_, Article>(
            "SELECT a.id, a.html_name, a.title, a.teaser, a.online_link, a.bookmarked,
                    a.reading_position, a.html_file_id, a.audio_file_id
             FROM articles a
             JOIN section_articles sa ON sa.article_id = a.id
             WHERE sa.section_id = ? ORDER BY sa.pos",
        )
        .bind(section_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(articles)
    }

    /// Look up an article by its HTML file name.
    pub async fn article_by_name(&self, html_name: &str) -> Result<Option<Article>> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE html_name = ?");
        let article = sqlx::query_as::<_, Article>(&sql)
            .bind(html_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(article)
    }

    /// An article's authors in byline order.
    pub async fn authors_of_article(&self, article_id: i64) -> Result<Vec<Author>> {
        let authors = sqlx::query_as::<_, Author>(
            "SELECT au.id, au.author_key, au.name, au.photo_image_id
             FROM authors au
             JOIN article_authors aa ON aa.author_id = au.id
             WHERE aa.article_id = ? ORDER BY aa.pos",
        )
        .bind(article_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(authors)
    }

    /// An issue's pages in print order.
    pub async fn pages_of_issue(&self, issue_id: i64) -> Result<Vec<Page>> {
        let pages = sqlx::query_as::<_, Page>(
            "SELECT id, issue_id, pos, title, pagina, kind, pdf_name, pdf_file_id, facsimile_image_id
             FROM pages WHERE issue_id = ? ORDER BY pos",
        )
        .bind(issue_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(pages)
    }

    /// A page's frames in snapshot order.
    pub async fn frames_of_page(&self, page_id: i64) -> Result<Vec<Frame>> {
        let frames = sqlx::query_as::<_, Frame>(
            "SELECT id, page_id, pos, x1, y1, x2, y2, link FROM frames WHERE page_id = ? ORDER BY pos",
        )
        .bind(page_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(frames)
    }

    /// Resolve a frame's link to the article it points at, if any.
    pub async fn article_for_frame(&self, frame_id: i64) -> Result<Option<Article>> {
        let article = sqlx::query_as::<_, Article>(
            "SELECT a.id, a.html_name, a.title, a.teaser, a.online_link, a.bookmarked,
                    a.reading_position, a.html_file_id, a.audio_file_id
             FROM articles a
             JOIN frames fr ON fr.link = a.html_name
             WHERE fr.id = ?",
        )
        .bind(frame_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(article)
    }

    /// An issue's moment (cover representation).
    pub async fn moment_of_issue(&self, issue_id: i64) -> Result<Option<Moment>> {
        let moment = sqlx::query_as::<_, Moment>(
            "SELECT m.id, m.first_page_id, m.raw_file_id FROM moments m
             JOIN issues i ON i.moment_id = m.id WHERE i.id = ?",
        )
        .bind(issue_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(moment)
    }

    /// A moment's images of one kind ("image" or "credit"), in order.
    pub async fn moment_images(&self, moment_id: i64, kind: &str) -> Result<Vec<Image>> {
        let images = sqlx::query_as::<_, Image>(
            "SELECT i.id, i.file_entry_id, i.resolution, i.kind, i.alpha, i.sharable
             FROM images i
             JOIN moment_images mi ON mi.image_id = i.id
             WHERE mi.moment_id = ? AND mi.kind = ? ORDER BY mi.pos",
        )
        .bind(moment_id)
        .bind(kind)
        .fetch_all(&self.pool)
        .await?;
        Ok(images)
    }

    // ========================================================================
    // User State
    // ========================================================================

    /// All bookmarked articles, ordered by name for a stable listing.
    pub async fn bookmarked_articles(&self) -> Result<Vec<Article>> {
        let sql = format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE bookmarked = 1 ORDER BY html_name"
        );
        let articles = sqlx::query_as::<_, Article>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(articles)
    }

    /// Set or clear an article's bookmark flag.
    pub async fn set_article_bookmark(&self, article_id: i64, bookmarked: bool) -> Result<()> {
        sqlx::query("UPDATE articles SET bookmarked = ? WHERE id = ?")
            .bind(bookmarked)
            .bind(article_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist how far into an article the reader got, clamped to [0, 1].
    pub async fn set_reading_position(&self, article_id: i64, position: f64) -> Result<()> {
        sqlx::query("UPDATE articles SET reading_position = ? WHERE id = ?")
            .bind(position.clamp(0.0, 1.0))
            .bind(article_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remember where the reader left off inside an issue.
    pub async fn set_issue_position(
        &self,
        issue_id: i64,
        last_section: Option<i64>,
        last_article: Option<i64>,
        last_page: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE issues SET last_section = ?, last_article = ?, last_page = ? WHERE id = ?",
        )
        .bind(last_section)
        .bind(last_article)
        .bind(last_page)
        .bind(issue_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Aggregate counts and byte totals across the whole cache.
    pub async fn stats(&self) -> Result<StoreStats> {
        let (feeds,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feeds")
            .fetch_one(&self.pool)
            .await?;
        let (issues, complete_issues): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(is_complete), 0) FROM issues",
        )
        .fetch_one(&self.pool)
        .await?;
        let (file_entries, bytes_declared, bytes_stored): (i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(size), 0), COALESCE(SUM(stored_size), 0) FROM file_entries",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            feeds,
            issues,
            complete_issues,
            file_entries,
            bytes_declared,
            bytes_stored,
        })
    }
}
