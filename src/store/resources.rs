//! Versioned shared resource bundles (fonts, stylesheets, shared scripts).

use anyhow::Result;

use super::blobs::delete_entries_if_unowned;
use super::payloads::merge_payload;
use super::schema::Store;
use super::types::{Resources, StorageType, StoreError};
use crate::snapshot::ResourcesSnapshot;

impl Store {
    /// Merge a resources bundle snapshot, keyed by its version number.
    ///
    /// Re-merging an existing version reconciles its payload like any other
    /// (idempotent for an unchanged file set). Returns the resources id.
    pub async fn merge_resources(&self, snap: &ResourcesSnapshot) -> Result<i64> {
        if snap.payload.local_dir.trim().is_empty() {
            return Err(StoreError::Integrity(format!(
                "resources v{}: payload with empty local_dir",
                snap.version
            ))
            .into());
        }

        let mut tx = self.pool.begin().await?;
        let mut unlink = Vec::new();

        let existing: Option<(i64, Option<i64>)> =
            sqlx::query_as("SELECT id, payload_id FROM resources WHERE version = ?")
                .bind(snap.version)
                .fetch_optional(&mut *tx)
                .await?;

        let (payload_id, _) = merge_payload(
            &mut *tx,
            self,
            existing.as_ref().and_then(|(_, p)| *p),
            &snap.payload,
            StorageType::Resource,
            &mut unlink,
        )
        .await?;

        let id = match existing {
            Some((id, _)) => {
                sqlx::query("UPDATE resources SET payload_id = ? WHERE id = ?")
                    .bind(payload_id)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                id
            }
            None => {
                let row: (i64,) = sqlx::query_as(
                    "INSERT INTO resources (version, payload_id) VALUES (?, ?) RETURNING id",
                )
                .bind(snap.version)
                .bind(payload_id)
                .fetch_one(&mut *tx)
                .await?;
                row.0
            }
        };

        tx.commit().await?;
        self.unlink_blobs(&unlink);
        self.clear_resolve_cache();
        tracing::info!(version = snap.version, "Merged resources bundle");
        Ok(id)
    }

    /// The highest-versioned resources bundle, if any.
    pub async fn latest_resources(&self) -> Result<Option<Resources>> {
        let res = sqlx::query_as::<_, Resources>(
            "SELECT id, version, payload_id FROM resources ORDER BY version DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(res)
    }

    /// Drop every resources bundle except the highest version, releasing
    /// member files that no other payload still owns. Returns the number of
    /// bundles removed.
    pub async fn prune_resources(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut unlink = Vec::new();

        let old: Vec<(i64, Option<i64>)> = sqlx::query_as(
            "SELECT id, payload_id FROM resources
             WHERE version < (SELECT MAX(version) FROM resources)",
        )
        .fetch_all(&mut *tx)
        .await?;

        for (id, payload_id) in &old {
            if let Some(pid) = payload_id {
                let members: Vec<(i64,)> =
                    sqlx::query_as("SELECT file_entry_id FROM payload_files WHERE payload_id = ?")
                        .bind(pid)
                        .fetch_all(&mut *tx)
                        .await?;
                sqlx::query("DELETE FROM payloads WHERE id = ?")
                    .bind(pid)
                    .execute(&mut *tx)
                    .await?;
                let ids: Vec<i64> = members.into_iter().map(|(i,)| i).collect();
                delete_entries_if_unowned(&mut *tx, self, &ids, &mut unlink).await?;
            }
            sqlx::query("DELETE FROM resources WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        self.unlink_blobs(&unlink);

        let removed = old.len() as u64;
        if removed > 0 {
            tracing::info!(removed, "Pruned superseded resource bundles");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use crate::snapshot::{FileSnapshot, PayloadSnapshot, ResourcesSnapshot};
    use crate::store::{StorageType, Store};

    async fn test_store() -> Store {
        let dir = std::env::temp_dir().join("kiosk_resources_test");
        std::fs::create_dir_all(&dir).unwrap();
        Store::open(":memory:", dir).await.unwrap()
    }

    fn bundle(version: i64, files: &[&str]) -> ResourcesSnapshot {
        ResourcesSnapshot {
            version,
            payload: PayloadSnapshot {
                local_dir: format!("res-v{version}"),
                remote_base_url: None,
                zip_name: None,
                files: files
                    .iter()
                    .map(|name| FileSnapshot {
                        name: name.to_string(),
                        storage_type: StorageType::Resource,
                        mod_time: None,
                        size: 10,
                        sha256: None,
                    })
                    .collect(),
                overview_files: vec![],
            },
        }
    }

    #[tokio::test]
    async fn test_latest_wins_and_prune_drops_old() {
        let store = test_store().await;
        store
            .merge_resources(&bundle(3, &["style-v3.css", "common.js"]))
            .await
            .unwrap();
        store
            .merge_resources(&bundle(5, &["style-v5.css", "common.js"]))
            .await
            .unwrap();

        let latest = store.latest_resources().await.unwrap().unwrap();
        assert_eq!(latest.version, 5);

        let removed = store.prune_resources().await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.file_entry("style-v3.css").await.unwrap().is_none());
        // Shared between bundles, still owned by v5
        assert!(store.file_entry("common.js").await.unwrap().is_some());
        assert_eq!(
            store.latest_resources().await.unwrap().unwrap().version,
            5
        );
    }

    #[tokio::test]
    async fn test_shared_entry_follows_newest_bundle_dir() {
        let store = test_store().await;
        store
            .merge_resources(&bundle(3, &["common.js"]))
            .await
            .unwrap();

        // Resolving now caches the v3 location
        let before = store.file_for_name("common.js").await.unwrap().unwrap();
        assert!(before.to_string_lossy().contains("res-v3"));

        // The newer bundle relocates the shared entry; the cached v3 path
        // must not be served afterwards
        store
            .merge_resources(&bundle(5, &["common.js"]))
            .await
            .unwrap();
        let after = store.file_for_name("common.js").await.unwrap().unwrap();
        assert!(after.to_string_lossy().contains("res-v5"));
    }

    #[tokio::test]
    async fn test_empty_local_dir_refused() {
        let store = test_store().await;
        let mut snap = bundle(1, &["a.css"]);
        snap.payload.local_dir = "  ".to_string();
        assert!(store.merge_resources(&snap).await.is_err());
    }
}
