//! Shared snapshot builders for integration tests.
#![allow(dead_code)] // each test binary uses its own subset of the helpers

use kiosk::snapshot::{
    ArticleSnapshot, FeedSnapshot, FeederSnapshot, FileSnapshot, FrameSnapshot, ImageSnapshot,
    IssueSnapshot, MomentSnapshot, PageSnapshot, PayloadSnapshot, SectionSnapshot,
};
use kiosk::store::{StorageType, Store};

static TRACING: std::sync::Once = std::sync::Once::new();

/// Fresh in-memory store with a per-test blob dir. Store logs go through
/// the test writer; set RUST_LOG to see them on failure.
pub async fn open_store(tag: &str) -> Store {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
    let dir = std::env::temp_dir().join(format!("kiosk_it_{tag}"));
    std::fs::create_dir_all(&dir).unwrap();
    Store::open(":memory:", dir).await.unwrap()
}

pub fn file(name: &str, size: i64) -> FileSnapshot {
    FileSnapshot {
        name: name.to_string(),
        storage_type: StorageType::Issue,
        mod_time: Some(1704441600),
        size,
        sha256: Some(format!("sum-{name}")),
    }
}

pub fn image(name: &str) -> ImageSnapshot {
    ImageSnapshot {
        file: file(name, 40),
        resolution: Some("high".to_string()),
        kind: None,
        alpha: 1.0,
        sharable: true,
    }
}

pub fn article(html_name: &str, title: &str) -> ArticleSnapshot {
    ArticleSnapshot {
        html: file(html_name, 20),
        title: Some(title.to_string()),
        teaser: None,
        online_link: None,
        audio: None,
        images: vec![],
        authors: vec![],
    }
}

pub fn section(html_name: &str, articles: Vec<ArticleSnapshot>) -> SectionSnapshot {
    SectionSnapshot {
        html: file(html_name, 15),
        extended_title: None,
        kind: None,
        nav_button: None,
        images: vec![],
        articles,
    }
}

pub fn page(pdf_name: &str, frames: Vec<FrameSnapshot>) -> PageSnapshot {
    PageSnapshot {
        pdf: file(pdf_name, 500),
        title: None,
        pagina: Some("1".to_string()),
        kind: None,
        frames,
    }
}

pub fn frame(x1: f64, y1: f64, x2: f64, y2: f64, link: Option<&str>) -> FrameSnapshot {
    FrameSnapshot {
        x1,
        y1,
        x2,
        y2,
        link: link.map(str::to_string),
    }
}

/// File names carry the issue date: every issue owns a distinct file set,
/// like the real feed (shared files across issues are built explicitly in
/// the tests that need them).
pub fn named(date: &str, base: &str) -> String {
    format!("{date}-{base}")
}

/// One issue with two sections (three articles), one page whose two frames
/// link into the articles, a moment image and an imprint. The moment image
/// and the first section HTML form the overview set.
pub fn standard_issue(date: &str) -> IssueSnapshot {
    let n = |base: &str| named(date, base);
    let sections = vec![
        section(
            &n("politics.html"),
            vec![
                article(&n("art-senate.html"), "Senate vote"),
                article(&n("art-budget.html"), "Budget talks"),
            ],
        ),
        section(
            &n("culture.html"),
            vec![article(&n("art-opera.html"), "Opera premiere")],
        ),
    ];
    let pages = vec![page(
        &n("page01.pdf"),
        vec![
            frame(0.0, 0.0, 0.5, 0.4, Some(&n("art-senate.html"))),
            frame(0.0, 0.4, 0.5, 0.9, Some(&n("art-opera.html"))),
        ],
    )];

    IssueSnapshot {
        date: date.parse().unwrap(),
        modified: Some(1704441600),
        weekend: false,
        base_url: Some("https://feed.example.com/daily".to_string()),
        status: Some("regular".to_string()),
        min_resource_version: 2,
        zip_name: None,
        zip_pdf_name: None,
        payload: PayloadSnapshot {
            local_dir: date.to_string(),
            remote_base_url: Some(format!("https://feed.example.com/daily/{date}")),
            zip_name: None,
            files: vec![
                file(&n("moment.jpg"), 30),
                file(&n("politics.html"), 15),
                file(&n("culture.html"), 15),
                file(&n("art-senate.html"), 20),
                file(&n("art-budget.html"), 20),
                file(&n("art-opera.html"), 20),
                file(&n("imprint.html"), 10),
                file(&n("page01.pdf"), 500),
            ],
            overview_files: vec![n("moment.jpg"), n("politics.html")],
        },
        moment: MomentSnapshot {
            raw: None,
            images: vec![image(&n("moment.jpg"))],
            credited: vec![],
            animation: vec![],
        },
        imprint: Some(article(&n("imprint.html"), "Imprint")),
        sections,
        pages,
    }
}

pub fn standard_feeder(dates: &[&str]) -> FeederSnapshot {
    FeederSnapshot {
        title: "The Daily".to_string(),
        timezone: Some("Europe/Berlin".to_string()),
        base_url: "https://feed.example.com/api".to_string(),
        global_base_url: None,
        auth_token: Some("token-abc".to_string()),
        resource_version: 2,
        feeds: vec![FeedSnapshot {
            name: "daily".to_string(),
            cycle: Some("daily".to_string()),
            kind: None,
            moment_ratio: Some(0.75),
            issue_count: None,
            first_issue_date: None,
            last_issue_date: None,
            issues: dates.iter().map(|d| standard_issue(d)).collect(),
        }],
    }
}
