//! Staleness scanning.
//!
//! An open version is stale when nothing has re-confirmed it for longer than
//! a threshold: `last_verified < at - threshold`, strictly. Closed versions
//! are history and are never reported.
//!
//! Scans read one consistent view of the open edges. A key that an upsert
//! refreshes while a scan is running may or may not be reported; re-ingesting
//! it is idempotent, so the healing cycle tolerates either.

use crate::{EdgeKey, Result, StoreError, TemporalGraph, TemporalRelation};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use tracing::debug;

/// Is `relation` stale given `cutoff = at - threshold`? Always false for
/// closed versions.
pub fn is_stale(relation: &TemporalRelation, cutoff: DateTime<Utc>) -> bool {
    relation.is_open() && relation.last_verified < cutoff
}

fn cutoff(threshold: Duration, at: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if threshold < Duration::zero() {
        return Err(StoreError::InvalidInput(format!(
            "staleness threshold must not be negative, got {threshold}"
        )));
    }
    at.checked_sub_signed(threshold).ok_or_else(|| {
        StoreError::InvalidInput(format!("staleness threshold {threshold} is out of range"))
    })
}

impl TemporalGraph {
    /// Keys of every open version not verified within `threshold` of `at`.
    ///
    /// Ordered by key.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidInput`] for a negative threshold.
    pub fn find_stale(&self, threshold: Duration, at: DateTime<Utc>) -> Result<Vec<EdgeKey>> {
        Ok(self
            .find_stale_relations(threshold, at)?
            .iter()
            .map(TemporalRelation::key)
            .collect())
    }

    /// Like [`find_stale`](TemporalGraph::find_stale) but returns the full
    /// open versions, including their `source_url`.
    pub fn find_stale_relations(
        &self,
        threshold: Duration,
        at: DateTime<Utc>,
    ) -> Result<Vec<TemporalRelation>> {
        let cutoff = cutoff(threshold, at)?;
        let stale: Vec<TemporalRelation> = self
            .active_relations()?
            .into_iter()
            .filter(|r| is_stale(r, cutoff))
            .collect();
        debug!(%at, %cutoff, stale = stale.len(), "staleness scan");
        Ok(stale)
    }

    /// Distinct source documents behind stale edges, sorted.
    pub fn stale_sources(&self, threshold: Duration, at: DateTime<Utc>) -> Result<Vec<String>> {
        let urls: BTreeSet<String> = self
            .find_stale_relations(threshold, at)?
            .into_iter()
            .map(|r| r.source_url)
            .collect();
        Ok(urls.into_iter().collect())
    }
}
