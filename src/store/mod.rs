//! Persistence layer: the entity graph in SQLite plus the physical blob
//! tree, behind a single cloneable [`Store`] handle.
//!
//! Writes go through the merge entry points ([`Store::merge_feeder`],
//! [`Store::merge_issue`], [`Store::merge_resources`]), which reconcile a
//! remote snapshot with the persisted graph in one transaction each.
//! Reads are plain queries; download bookkeeping and eviction mutate
//! counters and prune subtrees without ever touching snapshot data.

mod blobs;
mod eviction;
mod feeders;
mod issues;
mod pages;
mod payloads;
mod queries;
mod resources;
mod schema;
mod sections;
mod types;

pub use pages::FacsimileRenderer;
pub use schema::Store;
pub use types::{
    Article, Author, Feed, Feeder, FileEntry, Frame, Image, Issue, MergeOutcome, MergeSkip,
    Moment, Page, Payload, Resources, Section, StorageType, StoreError, StoreStats,
};
