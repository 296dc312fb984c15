// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod error;
pub mod ingest;
pub mod metrics;
pub mod sync;

// ---- Re-exports for stable public API ----
pub use crate::error::SyncError;
pub use crate::ingest::config::{load_config_default, load_config_from, SyncConfig};
pub use crate::ingest::convert::CanonicalEvent;
pub use crate::ingest::types::{
    EventSource, RawExternalEvent, SearchParams, SourceAdapter, SourceRegistry,
};
pub use crate::ingest::{Aggregator, AggregatorSettings};
pub use crate::sync::types::{SyncJobResult, SyncJobType, SyncStatus};
pub use crate::sync::SyncOrchestrator;
