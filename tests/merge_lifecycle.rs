//! End-to-end merge behavior: building the graph from snapshots, idempotent
//! re-merges, skip reporting and frame identity.

mod common;

use common::*;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_feeder_merge_builds_graph() {
    let store = open_store("build_graph").await;
    let outcome = store
        .merge_feeder(&standard_feeder(&["2024-01-05"]))
        .await
        .unwrap();
    assert_eq!(outcome.merged_issues, 1);
    assert!(outcome.skipped.is_empty());

    let feeder = store
        .feeder("https://feed.example.com/api")
        .await
        .unwrap()
        .expect("feeder persisted");
    assert_eq!(feeder.title, "The Daily");
    assert_eq!(feeder.resource_version, 2);

    let feed = store.feed(feeder.id, "daily").await.unwrap().unwrap();
    assert_eq!(feed.issue_count, 1);
    assert_eq!(feed.last_issue_date.as_deref(), Some("2024-01-05"));

    let issue = store.latest_issue(feed.id).await.unwrap().unwrap();
    assert_eq!(issue.date, "2024-01-05");
    assert!(issue.payload_id.is_some());
    assert!(issue.moment_id.is_some());
    assert!(issue.imprint_article_id.is_some());
    assert!(!issue.is_complete, "nothing downloaded yet");

    let sections = store.sections_of_issue(issue.id).await.unwrap();
    assert_eq!(sections.len(), 2);
    assert_eq!(sections[0].name, named("2024-01-05", "politics.html"));
    assert_eq!(sections[1].name, named("2024-01-05", "culture.html"));

    let politics = store.articles_in_section(sections[0].id).await.unwrap();
    assert_eq!(politics.len(), 2);
    assert_eq!(politics[0].title.as_deref(), Some("Senate vote"));
    assert_eq!(politics[1].title.as_deref(), Some("Budget talks"));

    let pages = store.pages_of_issue(issue.id).await.unwrap();
    assert_eq!(pages.len(), 1);
    let frames = store.frames_of_page(pages[0].id).await.unwrap();
    assert_eq!(frames.len(), 2);
    let linked = store
        .article_for_frame(frames[0].id)
        .await
        .unwrap()
        .expect("frame links to senate article");
    assert_eq!(linked.title.as_deref(), Some("Senate vote"));

    let moment = store.moment_of_issue(issue.id).await.unwrap().unwrap();
    assert_eq!(moment.first_page_id, Some(pages[0].id));
    let covers = store.moment_images(moment.id, "image").await.unwrap();
    assert_eq!(covers.len(), 1);

    let payload = store.payload(issue.payload_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(payload.bytes_total, 630);
    assert_eq!(payload.bytes_loaded, 0);
    let members = store.payload_files(payload.id).await.unwrap();
    assert_eq!(members.len(), 8);
    assert_eq!(members[0].name, named("2024-01-05", "moment.jpg"));
}

#[tokio::test]
async fn test_remerge_preserves_user_state_and_progress() {
    let store = open_store("remerge").await;
    let feeder = standard_feeder(&["2024-01-05"]);
    store.merge_feeder(&feeder).await.unwrap();

    let fid = store.feeder("https://feed.example.com/api").await.unwrap().unwrap().id;
    let feed = store.feed(fid, "daily").await.unwrap().unwrap();
    let issue = store.latest_issue(feed.id).await.unwrap().unwrap();
    let payload_id = issue.payload_id.unwrap();

    let senate = store
        .article_by_name(&named("2024-01-05", "art-senate.html"))
        .await
        .unwrap()
        .unwrap();
    store.set_article_bookmark(senate.id, true).await.unwrap();
    store.set_reading_position(senate.id, 0.5).await.unwrap();
    store.begin_download(payload_id).await.unwrap();
    store.record_progress(payload_id, 100).await.unwrap();

    // Same snapshot again: nothing may be lost or duplicated
    store.merge_feeder(&feeder).await.unwrap();

    let senate_after = store
        .article_by_name(&named("2024-01-05", "art-senate.html"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(senate_after.id, senate.id);
    assert!(senate_after.bookmarked);
    assert_eq!(senate_after.reading_position, 0.5);
    assert_eq!(store.bookmarked_articles().await.unwrap().len(), 1);

    let payload = store.payload(payload_id).await.unwrap().unwrap();
    assert_eq!(payload.bytes_loaded, 100, "unchanged file set keeps progress");
    assert!(payload.dl_started.is_some());

    let issues = store.issues_in_feed(feed.id, 10, None).await.unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(store.sections_of_issue(issue.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_merge_issue_is_unique_per_feed_and_date() {
    let store = open_store("unique_date").await;
    store.merge_feeder(&standard_feeder(&[])).await.unwrap();
    let fid = store.feeder("https://feed.example.com/api").await.unwrap().unwrap().id;
    let feed = store.feed(fid, "daily").await.unwrap().unwrap();

    let first = store
        .merge_issue(feed.id, &standard_issue("2024-01-05"))
        .await
        .unwrap();
    let second = store
        .merge_issue(feed.id, &standard_issue("2024-01-05"))
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(store.issues_in_feed(feed.id, 10, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_windowed_merge_keeps_older_issues() {
    let store = open_store("windowed").await;
    store
        .merge_feeder(&standard_feeder(&["2024-01-04"]))
        .await
        .unwrap();
    // Next day's query carries only the new issue
    store
        .merge_feeder(&standard_feeder(&["2024-01-05"]))
        .await
        .unwrap();

    let fid = store.feeder("https://feed.example.com/api").await.unwrap().unwrap().id;
    let feed = store.feed(fid, "daily").await.unwrap().unwrap();
    let issues = store.issues_in_feed(feed.id, 10, None).await.unwrap();
    assert_eq!(issues.len(), 2, "issues outside the window are kept");
    assert_eq!(issues[0].date, "2024-01-05");
    assert_eq!(issues[1].date, "2024-01-04");

    let older = store
        .issues_in_feed(feed.id, 10, Some("2024-01-04"))
        .await
        .unwrap();
    assert_eq!(older.len(), 1);
    assert_eq!(older[0].date, "2024-01-04");
}

#[tokio::test]
async fn test_absent_section_prunes_exclusive_articles() {
    let store = open_store("prune_section").await;
    store.merge_feeder(&standard_feeder(&[])).await.unwrap();
    let fid = store.feeder("https://feed.example.com/api").await.unwrap().unwrap().id;
    let feed = store.feed(fid, "daily").await.unwrap().unwrap();

    let issue_id = store
        .merge_issue(feed.id, &standard_issue("2024-01-05"))
        .await
        .unwrap();

    // The culture section (and its article's file) disappears from the feed
    let mut snap = standard_issue("2024-01-05");
    snap.sections.retain(|s| s.name() != named("2024-01-05", "culture.html"));
    snap.payload.files.retain(|f| {
        f.name != named("2024-01-05", "culture.html")
            && f.name != named("2024-01-05", "art-opera.html")
    });
    store.merge_issue(feed.id, &snap).await.unwrap();

    let sections = store.sections_of_issue(issue_id).await.unwrap();
    assert_eq!(sections.len(), 1);
    assert!(store
        .article_by_name(&named("2024-01-05", "art-opera.html"))
        .await
        .unwrap()
        .is_none());
    assert!(store
        .file_entry(&named("2024-01-05", "art-opera.html"))
        .await
        .unwrap()
        .is_none());
    // Surviving section untouched
    assert!(store
        .article_by_name(&named("2024-01-05", "art-senate.html"))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_invalid_issue_is_skipped_siblings_merge() {
    let store = open_store("skip_invalid").await;
    let mut feeder = standard_feeder(&["2024-01-04", "2024-01-05"]);
    // Duplicate payload member makes the first issue structurally invalid
    let dup = feeder.feeds[0].issues[0].payload.files[0].clone();
    feeder.feeds[0].issues[0].payload.files.push(dup);

    let outcome = store.merge_feeder(&feeder).await.unwrap();
    assert_eq!(outcome.merged_issues, 1);
    assert_eq!(outcome.skipped.len(), 1);
    assert_eq!(outcome.skipped[0].entity, "issue");
    assert_eq!(outcome.skipped[0].key, "daily/2024-01-04");

    let fid = store.feeder("https://feed.example.com/api").await.unwrap().unwrap().id;
    let feed = store.feed(fid, "daily").await.unwrap().unwrap();
    let issues = store.issues_in_feed(feed.id, 10, None).await.unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].date, "2024-01-05");
}

#[tokio::test]
async fn test_invalid_feeder_snapshot_is_refused_whole() {
    let store = open_store("refuse_feeder").await;
    let mut feeder = standard_feeder(&["2024-01-05"]);
    feeder.base_url = "ftp://feed.example.com".to_string();

    assert!(store.merge_feeder(&feeder).await.is_err());
    assert!(store
        .feeder("ftp://feed.example.com")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_moment_raw_blob_is_persisted_and_cleared() {
    let store = open_store("moment_raw").await;
    store.merge_feeder(&standard_feeder(&[])).await.unwrap();
    let fid = store.feeder("https://feed.example.com/api").await.unwrap().unwrap().id;
    let feed = store.feed(fid, "daily").await.unwrap().unwrap();

    let mut snap = standard_issue("2024-01-05");
    let raw_name = named("2024-01-05", "moment-raw.jpg");
    snap.payload.files.push(file(&raw_name, 90));
    snap.moment.raw = Some(file(&raw_name, 90));
    let issue_id = store.merge_issue(feed.id, &snap).await.unwrap();

    let moment = store.moment_of_issue(issue_id).await.unwrap().unwrap();
    let raw_entry = store.file_entry(&raw_name).await.unwrap().unwrap();
    assert_eq!(moment.raw_file_id, Some(raw_entry.id));

    // Feed stops shipping the raw blob: reference and file go away
    store
        .merge_issue(feed.id, &standard_issue("2024-01-05"))
        .await
        .unwrap();
    let moment = store.moment_of_issue(issue_id).await.unwrap().unwrap();
    assert_eq!(moment.raw_file_id, None);
    assert!(store.file_entry(&raw_name).await.unwrap().is_none());
}

#[tokio::test]
async fn test_frame_identity_by_coordinate_tolerance() {
    let store = open_store("frame_tolerance").await;
    store.merge_feeder(&standard_feeder(&[])).await.unwrap();
    let fid = store.feeder("https://feed.example.com/api").await.unwrap().unwrap().id;
    let feed = store.feed(fid, "daily").await.unwrap().unwrap();

    let issue_id = store
        .merge_issue(feed.id, &standard_issue("2024-01-05"))
        .await
        .unwrap();
    let pages = store.pages_of_issue(issue_id).await.unwrap();
    let before = store.frames_of_page(pages[0].id).await.unwrap();

    // Sub-tolerance jitter: same frames, updated in place
    let mut snap = standard_issue("2024-01-05");
    for f in &mut snap.pages[0].frames {
        f.x1 += 5e-5;
        f.y2 -= 5e-5;
    }
    store.merge_issue(feed.id, &snap).await.unwrap();
    let after = store.frames_of_page(pages[0].id).await.unwrap();
    let ids = |fs: &[kiosk::store::Frame]| fs.iter().map(|f| f.id).collect::<Vec<_>>();
    assert_eq!(ids(&before), ids(&after));

    // A real move: the old frame is replaced
    let mut snap = standard_issue("2024-01-05");
    snap.pages[0].frames[0].x1 += 0.01;
    store.merge_issue(feed.id, &snap).await.unwrap();
    let moved = store.frames_of_page(pages[0].id).await.unwrap();
    assert_eq!(moved.len(), 2);
    assert_ne!(moved[0].id, before[0].id);
    assert_eq!(moved[1].id, before[1].id);
}
