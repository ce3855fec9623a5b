//! Harvest module - checkpointed acquisition of catalog entries.
//!
//! This module provides the moving parts of a harvest:
//! - **Traits**: [`SourceAdapter`] and the [`HarvestError`] taxonomy
//! - **Sources**: one adapter per upstream in [`sources`]
//! - **Pipeline**: the checkpointed, retrying [`HarvestOrchestrator`]
//! - **Storage**: full-replace upserts via [`CatalogStore`], progress via
//!   [`CheckpointStore`]
//! - **Plumbing**: [`RetryPolicy`], bounded HTTP downloads and the in-memory
//!   [`SafeArchiveExtractor`]

pub mod archive;
pub mod checkpoint;
pub mod http;
pub mod pipeline;
pub mod retry;
pub mod schema;
pub mod sources;
pub mod store;
pub mod traits;

// Re-export commonly used types
pub use archive::{ArchiveError, ExtractedArchive, SafeArchiveExtractor};
pub use checkpoint::{CheckpointCounts, CheckpointStore};
pub use pipeline::HarvestOrchestrator;
pub use retry::{RetryPolicy, RetrySettings};
pub use sources::{build_adapter, SourceKind};
pub use store::CatalogStore;
pub use traits::{HarvestError, HarvestFailed, RawArtifact, SourceAdapter};
