//! # logkv-storage
//!
//! why: provide durable persistence for the replicated log using standard rust fs apis
//! relations: implements the LogStore seam from logkv-core, snapshots consumed by logkv-server
//! what: Wal (text-line log plus election metadata), SnapshotManager

pub mod snapshot;
mod wal;

pub use snapshot::{SnapshotError, SnapshotManager, SnapshotMeta};
pub use wal::Wal;
