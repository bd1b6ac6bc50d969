//! kiosk — an offline content cache for periodical publication feeds.
//!
//! The crate persists a hierarchical publication graph (feeder → feeds →
//! issues → sections/articles and pages/frames) in an embedded SQLite
//! database, with the actual content files kept as checksummed blobs in a
//! directory tree. Remote snapshots are reconciled idempotently into the
//! persisted graph; download progress is tracked per payload; old issues
//! can be reduced back to a lightweight overview representation.
//!
//! ```no_run
//! use kiosk::config::CacheConfig;
//! use kiosk::store::Store;
//!
//! # async fn open() -> anyhow::Result<()> {
//! let config = CacheConfig::load(std::path::Path::new("kiosk.toml"))?;
//! let store = Store::open(
//!     config.database_path().to_str().unwrap_or("kiosk.db"),
//!     &config.data_dir,
//! )
//! .await?;
//! let stats = store.stats().await?;
//! println!("{} issues cached", stats.issues);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod snapshot;
pub mod store;
pub mod util;

pub use store::{Store, StoreError};
