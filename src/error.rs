//! Failure taxonomy of the sync pipeline.
//!
//! Only [`SyncError::SyncConflict`] and [`SyncError::BudgetExceeded`] are
//! returned to callers of `SyncOrchestrator::sync_source`. The remaining
//! variants describe failures isolated at the smallest unit (adapter, record
//! or source); they are logged and rendered into `SyncJobResult::errors`.

use crate::ingest::types::EventSource;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("source {provider} unavailable: {reason}")]
    SourceUnavailable { provider: EventSource, reason: String },

    #[error("conversion failed for {provider}:{source_id}: {reason}")]
    ConversionFailure {
        provider: EventSource,
        source_id: String,
        reason: String,
    },

    #[error("budget exceeded for {provider}: {reason}")]
    BudgetExceeded { provider: EventSource, reason: String },

    #[error("sync already in progress for {provider}")]
    SyncConflict { provider: EventSource },

    #[error("persistence failed for {provider}:{source_id}: {reason}")]
    PersistenceFailure {
        provider: EventSource,
        source_id: String,
        reason: String,
    },
}

impl SyncError {
    pub fn source_unavailable(provider: EventSource, err: impl std::fmt::Display) -> Self {
        Self::SourceUnavailable {
            provider,
            reason: err.to_string(),
        }
    }

    pub fn persistence(provider: EventSource, source_id: &str, err: &anyhow::Error) -> Self {
        Self::PersistenceFailure {
            provider,
            source_id: source_id.to_string(),
            reason: format!("{err:#}"),
        }
    }

    /// Rejections happen before any work starts and cost nothing.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::SyncConflict { .. } | Self::BudgetExceeded { .. }
        )
    }
}
