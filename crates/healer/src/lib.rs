//! Sentinel healer: autonomous re-verification of stale relationships.
//!
//! A healing cycle scans the store for open edges that have not been
//! confirmed within a threshold, fetches each edge's source document again
//! through a [`FactSource`], and feeds the fresh candidates back through
//! [`TemporalGraph::upsert`](sentinel::TemporalGraph::upsert). Unchanged facts
//! only move `last_verified`; changed facts supersede their previous version.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sentinel::TemporalGraph;
//! use sentinel_healer::{HealerConfig, HealingCoordinator, HttpFactSource};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let graph = Arc::new(TemporalGraph::open("knowledge.redb")?);
//! let source = Arc::new(HttpFactSource::new("http://localhost:8600/extract")?);
//! let healer = HealingCoordinator::new(graph, source, HealerConfig::default());
//!
//! let report = healer.heal(chrono::Duration::days(7), false).await?;
//! println!("reprocessed {} sources", report.reprocessed);
//! # Ok(())
//! # }
//! ```

mod config;
mod coordinator;
mod source;

pub use config::HealerConfig;
pub use coordinator::{
    FailureKind, HealingCoordinator, HealingFailure, HealingReport, HealingState, SourceOutcome,
};
pub use source::{CollaboratorError, CollaboratorErrorKind, FactSource, HttpFactSource};

#[derive(Debug, thiserror::Error)]
pub enum HealError {
    #[error("a healing cycle is already in progress")]
    CycleInProgress,
    #[error("store error: {0}")]
    Store(#[from] sentinel::StoreError),
    #[error("storage call exceeded {0:?}")]
    Timeout(std::time::Duration),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, HealError>;
