//! Healing cycle: scan, reprocess, report.
//!
//! ```text
//! Idle ──heal()──▶ Scanning ──stale keys──▶ Reprocessing ──▶ Idle
//!                     │                          │
//!                     └──── dry run / error ─────┴──▶ Idle
//! ```
//!
//! The coordinator is the only thing that moves its state. A cycle that is
//! dropped part way (cancelled, timed out by the caller) still returns to
//! `Idle` through its cycle guard.

use crate::{CollaboratorErrorKind, FactSource, HealError, HealerConfig, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use sentinel::{CandidateBatch, ClassificationCounts, EdgeKey, TemporalGraph, UpsertReport};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingState {
    Idle,
    Scanning,
    Reprocessing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Fetch or extraction failed but may succeed later.
    Transient,
    /// The source cannot be reprocessed.
    Permanent,
    /// The store rejected or failed the upsert.
    Storage,
    /// The upsert did not finish within the storage timeout.
    Timeout,
    /// The fresh extraction no longer contains some of the stale
    /// relationships it was fetched for; they stay stale.
    NotReconfirmed,
}

impl FailureKind {
    pub fn escalates(self) -> bool {
        match self {
            FailureKind::Transient | FailureKind::Storage | FailureKind::Timeout => true,
            FailureKind::Permanent | FailureKind::NotReconfirmed => false,
        }
    }
}

/// One source document that could not be reprocessed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingFailure {
    pub source_url: String,
    pub kind: FailureKind,
    /// Needs attention beyond waiting for the next cycle.
    pub escalate: bool,
    pub reason: String,
}

impl HealingFailure {
    fn new(source_url: &str, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            source_url: source_url.to_string(),
            kind,
            escalate: kind.escalates(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub source_url: String,
    pub report: UpsertReport,
}

/// Summary of one healing cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingReport {
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Stale keys found by the scan.
    pub candidates: Vec<EdgeKey>,
    /// Distinct source URLs behind `candidates`, sorted.
    pub sources: Vec<String>,
    /// Sources whose fresh upsert applied cleanly and re-confirmed every
    /// stale key fetched for.
    pub reprocessed: usize,
    pub failed: Vec<HealingFailure>,
    pub outcomes: Vec<SourceOutcome>,
    /// Every upsert that ran, including those also listed in `failed`.
    /// Classification counts are summed into `totals`.
    pub totals: ClassificationCounts,
}

impl HealingReport {
    pub fn escalations(&self) -> impl Iterator<Item = &HealingFailure> {
        self.failed.iter().filter(|f| f.escalate)
    }
}

// Turns an upsert that ran but left work undone into a failure entry.
fn shortfall(outcome: &SourceOutcome, stale_keys: &[EdgeKey]) -> Option<HealingFailure> {
    let url = outcome.source_url.as_str();
    let upsert = &outcome.report;

    if !upsert.is_clean() {
        let first = upsert
            .failures
            .first()
            .map(|f| format!("{}: {}", f.key, f.reason))
            .or_else(|| {
                upsert
                    .entity_failures
                    .first()
                    .map(|f| format!("entity {:?}: {}", f.id, f.reason))
            })
            .unwrap_or_default();
        warn!(
            source_url = url,
            edges = upsert.failures.len(),
            entities = upsert.entity_failures.len(),
            "fresh candidates rejected by the store"
        );
        return Some(HealingFailure::new(
            url,
            FailureKind::Storage,
            format!(
                "{} edge(s) and {} entity hint(s) not applied; first {first}",
                upsert.failures.len(),
                upsert.entity_failures.len()
            ),
        ));
    }

    let missing: Vec<&EdgeKey> = stale_keys
        .iter()
        .filter(|key| upsert.classification_of(key).is_none())
        .collect();
    let first = missing.first()?;
    info!(
        source_url = url,
        missing = missing.len(),
        "stale relationships absent from fresh extraction"
    );
    Some(HealingFailure::new(
        url,
        FailureKind::NotReconfirmed,
        format!(
            "{} stale relationship(s) not in the fresh extraction, first {first}",
            missing.len()
        ),
    ))
}

// Resets the coordinator to Idle however the cycle ends.
struct CycleGuard<'a> {
    state: &'a Mutex<HealingState>,
}

impl CycleGuard<'_> {
    fn set(&self, next: HealingState) {
        *lock(self.state) = next;
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        *lock(self.state) = HealingState::Idle;
    }
}

// A panic while holding the lock cannot leave a half-written enum behind.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drives healing cycles against one store and one fact source.
///
/// Cycles are single-flight: [`heal`](HealingCoordinator::heal) while
/// another cycle runs returns [`HealError::CycleInProgress`]. Interactive
/// upserts may run alongside a cycle; the store serializes per key.
pub struct HealingCoordinator {
    graph: Arc<TemporalGraph>,
    source: Arc<dyn FactSource>,
    config: HealerConfig,
    state: Mutex<HealingState>,
    last_report: Mutex<Option<HealingReport>>,
}

impl HealingCoordinator {
    pub fn new(graph: Arc<TemporalGraph>, source: Arc<dyn FactSource>, config: HealerConfig) -> Self {
        Self {
            graph,
            source,
            config,
            state: Mutex::new(HealingState::Idle),
            last_report: Mutex::new(None),
        }
    }

    pub fn state(&self) -> HealingState {
        *lock(&self.state)
    }

    /// The most recent completed cycle, dry runs included.
    pub fn last_report(&self) -> Option<HealingReport> {
        lock(&self.last_report).clone()
    }

    pub fn config(&self) -> &HealerConfig {
        &self.config
    }

    fn begin(&self) -> Result<CycleGuard<'_>> {
        let mut state = lock(&self.state);
        if *state != HealingState::Idle {
            return Err(HealError::CycleInProgress);
        }
        *state = HealingState::Scanning;
        Ok(CycleGuard { state: &self.state })
    }

    /// Run one cycle.
    ///
    /// With `dry_run` the scan result is reported and nothing is fetched or
    /// written.
    ///
    /// # Errors
    ///
    /// [`HealError::CycleInProgress`] if a cycle is active. A failed or
    /// timed-out scan aborts the cycle; failures while reprocessing a single
    /// source are recorded in [`HealingReport::failed`] instead.
    pub async fn heal(&self, threshold: chrono::Duration, dry_run: bool) -> Result<HealingReport> {
        let guard = self.begin()?;
        let started_at = Utc::now();

        let stale = self
            .blocking(move |graph| graph.find_stale_relations(threshold, started_at))
            .await?;

        let candidates: Vec<EdgeKey> = stale.iter().map(|r| r.key()).collect();
        let mut by_source: BTreeMap<String, Vec<EdgeKey>> = BTreeMap::new();
        for relation in &stale {
            by_source
                .entry(relation.source_url.clone())
                .or_default()
                .push(relation.key());
        }
        let sources: Vec<String> = by_source.keys().cloned().collect();
        info!(
            candidates = candidates.len(),
            sources = sources.len(),
            dry_run,
            "staleness scan complete"
        );

        let mut report = HealingReport {
            dry_run,
            started_at,
            finished_at: started_at,
            candidates,
            sources,
            reprocessed: 0,
            failed: Vec::new(),
            outcomes: Vec::new(),
            totals: ClassificationCounts::default(),
        };

        if !dry_run && !by_source.is_empty() {
            guard.set(HealingState::Reprocessing);
            // Collected before streaming so the cycle future stays `Send`.
            let fetches: Vec<_> = by_source.keys().map(|url| self.reprocess(url)).collect();
            let results: Vec<_> = stream::iter(fetches)
                .buffer_unordered(self.config.concurrency.max(1))
                .collect()
                .await;

            for result in results {
                match result {
                    Ok(outcome) => {
                        let stale_keys = by_source
                            .get(&outcome.source_url)
                            .map(Vec::as_slice)
                            .unwrap_or_default();
                        match shortfall(&outcome, stale_keys) {
                            Some(failure) => report.failed.push(failure),
                            None => report.reprocessed += 1,
                        }
                        report.totals.absorb(&outcome.report.counts);
                        report.outcomes.push(outcome);
                    }
                    Err(failure) => report.failed.push(failure),
                }
            }
            report.outcomes.sort_by(|a, b| a.source_url.cmp(&b.source_url));
            report.failed.sort_by(|a, b| a.source_url.cmp(&b.source_url));
        }

        report.finished_at = Utc::now();
        info!(
            reprocessed = report.reprocessed,
            failed = report.failed.len(),
            created = report.totals.created,
            verified_unchanged = report.totals.verified_unchanged,
            superseded = report.totals.superseded,
            "healing cycle complete"
        );
        *lock(&self.last_report) = Some(report.clone());
        drop(guard);
        Ok(report)
    }

    async fn reprocess(&self, url: &str) -> std::result::Result<SourceOutcome, HealingFailure> {
        let batch: CandidateBatch = match self.source.fetch_and_extract(url).await {
            Ok(batch) => batch,
            Err(e) => {
                let kind = match e.kind {
                    CollaboratorErrorKind::Transient => {
                        warn!(source_url = url, error = %e.message, "fetch failed, escalating");
                        FailureKind::Transient
                    }
                    CollaboratorErrorKind::Permanent => {
                        info!(source_url = url, error = %e.message, "source cannot be reprocessed");
                        FailureKind::Permanent
                    }
                };
                return Err(HealingFailure::new(url, kind, e.message));
            }
        };
        debug!(source_url = url, edges = batch.edges.len(), "fetched fresh candidates");

        let owned_url = url.to_string();
        let now = Utc::now();
        match self
            .blocking(move |graph| graph.upsert(&batch, &owned_url, now))
            .await
        {
            Ok(report) => Ok(SourceOutcome {
                source_url: url.to_string(),
                report,
            }),
            Err(HealError::Timeout(limit)) => {
                warn!(source_url = url, ?limit, "upsert timed out");
                Err(HealingFailure::new(
                    url,
                    FailureKind::Timeout,
                    format!("upsert exceeded {limit:?}"),
                ))
            }
            Err(e) => {
                warn!(source_url = url, error = %e, "upsert failed");
                Err(HealingFailure::new(url, FailureKind::Storage, e.to_string()))
            }
        }
    }

    // Store calls are synchronous; run them off the async workers with a
    // deadline. A timed-out call keeps running on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&TemporalGraph) -> sentinel::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let graph = Arc::clone(&self.graph);
        let limit = self.config.storage_timeout();
        let task = tokio::task::spawn_blocking(move || f(&graph));
        match tokio::time::timeout(limit, task).await {
            Ok(joined) => Ok(joined??),
            Err(_) => Err(HealError::Timeout(limit)),
        }
    }

    /// Heal every `interval` until `shutdown` is cancelled.
    ///
    /// A tick that fires while a cycle is still running (including one
    /// started through [`heal`](HealingCoordinator::heal)) is skipped.
    /// Cancelling mid-cycle abandons the cycle.
    pub async fn run(&self, threshold: chrono::Duration, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), "healing loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tokio::select! {
                        result = self.heal(threshold, false) => match result {
                            Ok(report) => debug!(reprocessed = report.reprocessed, "scheduled cycle finished"),
                            Err(HealError::CycleInProgress) => debug!("cycle already running, tick skipped"),
                            Err(e) => error!(error = %e, "healing cycle failed"),
                        },
                        _ = shutdown.cancelled() => {
                            info!("healing loop cancelled mid-cycle");
                            break;
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("healing loop shutting down");
                    break;
                }
            }
        }
    }
}
