//! Sentinel: embedded temporal knowledge graph.
//!
//! Facts extracted from documents are stored as directed relationships whose
//! every version carries a validity interval. Re-ingesting a document either
//! re-confirms what is already known (`last_verified` moves forward), or
//! closes the current version and opens a new one. Nothing is deleted, so
//! the graph can be reconstructed as of any instant.
//!
//! # Versions and the open edge
//!
//! A relationship is identified by its [`EdgeKey`]
//! `(source_id, relation, target_id)`. For every key there is at most one
//! *open* [`TemporalRelation`] (`valid_to == None`); all other versions are
//! closed and form the key's history. Whether an incoming fact is the same as
//! the open version is decided by its [`ContentHash`], never by comparing
//! timestamps.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use sentinel::{CandidateBatch, CandidateEdge, TemporalGraph};
//! use chrono::Utc;
//!
//! let db = TemporalGraph::open("knowledge.redb").unwrap();
//!
//! let batch = CandidateBatch::from_edges(vec![
//!     CandidateEdge::new("tesla", "FOUNDED_BY", "eberhard").with_property("year", "2003"),
//! ]);
//! let report = db.upsert(&batch, "https://example.com/tesla", Utc::now()).unwrap();
//! assert_eq!(report.counts.created, 1);
//!
//! // Point-in-time reconstruction
//! let past = "2024-03-01T00:00:00Z".parse().unwrap();
//! let then = db.snapshot(Some(past)).unwrap();
//! ```

mod backend;
mod fact_hash;
mod staleness;

pub use backend::{EntityWrite, KeyChange, RedbBackend, StoreStats, TemporalBackend};
pub use fact_hash::{content_hash, is_unhashed_key, ContentHash, UNHASHED_PROPERTY_KEYS};
pub use staleness::is_stale;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use ulid::{Generator, Ulid};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("transaction conflict on {0}")]
    TransactionConflict(String),
    #[error("invalid edge: {0}")]
    InvalidEdge(String),
    #[error("out-of-order write on {key}: {now} precedes the open version's valid_from {valid_from}")]
    OutOfOrder {
        key: String,
        now: DateTime<Utc>,
        valid_from: DateTime<Utc>,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("write deadline exceeded")]
    Timeout,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Errors that concern one edge and are recorded in a report instead of
    /// aborting the batch.
    pub fn is_per_edge(&self) -> bool {
        matches!(
            self,
            StoreError::TransactionConflict(_)
                | StoreError::InvalidEdge(_)
                | StoreError::OutOfOrder { .. }
                | StoreError::Timeout
        )
    }
}

impl From<redb::DatabaseError> for StoreError {
    fn from(e: redb::DatabaseError) -> Self {
        StoreError::StorageUnavailable(e.to_string())
    }
}
impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        StoreError::StorageUnavailable(e.to_string())
    }
}
impl From<redb::TableError> for StoreError {
    fn from(e: redb::TableError) -> Self {
        StoreError::StorageUnavailable(e.to_string())
    }
}
impl From<redb::StorageError> for StoreError {
    fn from(e: redb::StorageError) -> Self {
        StoreError::StorageUnavailable(e.to_string())
    }
}
impl From<redb::CommitError> for StoreError {
    fn from(e: redb::CommitError) -> Self {
        StoreError::StorageUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Separator used when a key is flattened into a storage row key.
/// Identifiers containing it are rejected.
pub const KEY_SEPARATOR: char = '\u{1f}';

/// Label given to an entity first seen without an extractor hint.
pub const DEFAULT_ENTITY_LABEL: &str = "Entity";

/// A scalar property value.
///
/// Serializes as `{"type": "Text", "value": ...}`. Deserializing also
/// accepts a plain JSON string, number or boolean, which is what extractor
/// services emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", from = "PropertyValueRepr")]
pub enum PropertyValue {
    /// A text string.
    Text(String),
    /// A numeric value.
    Number(f64),
    /// A boolean.
    Boolean(bool),
}

#[derive(Deserialize)]
#[serde(tag = "type", content = "value")]
enum TaggedPropertyValue {
    Text(String),
    Number(f64),
    Boolean(bool),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PropertyValueRepr {
    Tagged(TaggedPropertyValue),
    Text(String),
    Number(f64),
    Boolean(bool),
}

impl From<PropertyValueRepr> for PropertyValue {
    fn from(repr: PropertyValueRepr) -> Self {
        match repr {
            PropertyValueRepr::Tagged(TaggedPropertyValue::Text(s))
            | PropertyValueRepr::Text(s) => PropertyValue::Text(s),
            PropertyValueRepr::Tagged(TaggedPropertyValue::Number(n))
            | PropertyValueRepr::Number(n) => PropertyValue::Number(n),
            PropertyValueRepr::Tagged(TaggedPropertyValue::Boolean(b))
            | PropertyValueRepr::Boolean(b) => PropertyValue::Boolean(b),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Text(s.to_string())
    }
}
impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::Text(s)
    }
}
impl From<f64> for PropertyValue {
    fn from(n: f64) -> Self {
        PropertyValue::Number(n)
    }
}
impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Boolean(b)
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::Text(s) => write!(f, "{s}"),
            PropertyValue::Number(n) => write!(f, "{n}"),
            PropertyValue::Boolean(b) => write!(f, "{b}"),
        }
    }
}

/// String-keyed scalar properties. Ordered, so serialization is key-sorted.
pub type Properties = BTreeMap<String, PropertyValue>;

/// Identity of a relationship across all of its versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub source_id: String,
    pub relation: String,
    pub target_id: String,
}

impl EdgeKey {
    pub fn new(
        source_id: impl Into<String>,
        relation: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            relation: relation.into(),
            target_id: target_id.into(),
        }
    }

    /// Flattened row key: the three parts joined by [`KEY_SEPARATOR`].
    pub(crate) fn encode(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.source_id,
            self.relation,
            self.target_id,
            sep = KEY_SEPARATOR
        )
    }
}

impl std::fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -[{}]-> {}",
            self.source_id, self.relation, self.target_id
        )
    }
}

/// A stable, time-sortable identifier for one [`TemporalRelation`] version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeId(pub String);

impl EdgeId {
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }
}

impl Default for EdgeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A graph node. Created on first mention, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable external key, e.g. a normalized name.
    pub id: String,
    /// Type tag such as `Person` or `Company`.
    pub label: String,
    pub properties: Properties,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One version of a directed relationship.
///
/// # Validity
///
/// `valid_from` is set when the version is created. `valid_to` stays `None`
/// while this is the believed-true state; a later upsert with different
/// content sets it and opens a replacement. `last_verified` records the most
/// recent ingestion that re-confirmed the version unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalRelation {
    pub id: EdgeId,
    pub source_id: String,
    pub relation: String,
    pub target_id: String,
    pub properties: Properties,
    pub valid_from: DateTime<Utc>,
    /// `None` = the open (current) version.
    pub valid_to: Option<DateTime<Utc>>,
    pub last_verified: DateTime<Utc>,
    pub content_hash: ContentHash,
    /// Document the fact was extracted from.
    pub source_url: String,
}

impl TemporalRelation {
    pub fn key(&self) -> EdgeKey {
        EdgeKey::new(&self.source_id, &self.relation, &self.target_id)
    }

    /// Is this the current version of its key?
    pub fn is_open(&self) -> bool {
        self.valid_to.is_none()
    }

    /// Was this version the believed state at `at`?
    pub fn was_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && self.valid_to.is_none_or(|t| t > at)
    }

    /// Extractor confidence recorded with this version, if any.
    pub fn confidence(&self) -> Option<f64> {
        match self.properties.get("confidence") {
            Some(PropertyValue::Number(n)) => Some(*n),
            _ => None,
        }
    }
}

/// A relationship proposed by the extractor for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEdge {
    pub source_id: String,
    pub relation: String,
    pub target_id: String,
    #[serde(default)]
    pub properties: Properties,
    /// Stored as the `confidence` property; not part of the content hash.
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl CandidateEdge {
    pub fn new(
        source_id: impl Into<String>,
        relation: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            relation: relation.into(),
            target_id: target_id.into(),
            properties: Properties::new(),
            confidence: None,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn key(&self) -> EdgeKey {
        EdgeKey::new(&self.source_id, &self.relation, &self.target_id)
    }

    pub fn content_hash(&self) -> ContentHash {
        content_hash(
            &self.source_id,
            &self.target_id,
            &self.relation,
            &self.properties,
        )
    }

    /// Properties as they will be stored, confidence included.
    fn stored_properties(&self) -> Properties {
        let mut properties = self.properties.clone();
        if let Some(confidence) = self.confidence {
            properties.insert("confidence".to_string(), PropertyValue::Number(confidence));
        }
        properties
    }
}

/// Label and properties the extractor reported for an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEntity {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub properties: Properties,
}

impl CandidateEntity {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: Some(label.into()),
            properties: Properties::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Everything extracted from one source document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateBatch {
    #[serde(default)]
    pub entities: Vec<CandidateEntity>,
    #[serde(default)]
    pub edges: Vec<CandidateEdge>,
}

impl CandidateBatch {
    pub fn from_edges(edges: Vec<CandidateEdge>) -> Self {
        Self {
            entities: Vec::new(),
            edges,
        }
    }

    pub fn with_entity(mut self, entity: CandidateEntity) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.edges.is_empty()
    }
}

/// The reconstructed graph as of [`GraphView::at`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphView {
    pub at: DateTime<Utc>,
    /// Ordered by entity id.
    pub entities: Vec<Entity>,
    /// Ordered by key, then version.
    pub relations: Vec<TemporalRelation>,
}

impl GraphView {
    pub fn node_count(&self) -> usize {
        self.entities.len()
    }

    pub fn link_count(&self) -> usize {
        self.relations.len()
    }

    pub fn relations_for<'a>(
        &'a self,
        key: &'a EdgeKey,
    ) -> impl Iterator<Item = &'a TemporalRelation> + 'a {
        self.relations.iter().filter(move |r| {
            r.source_id == key.source_id && r.relation == key.relation && r.target_id == key.target_id
        })
    }
}

// ---------------------------------------------------------------------------
// Upsert reports
// ---------------------------------------------------------------------------

/// What an upsert did with one candidate edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// No open version existed; one was created.
    Created,
    /// The open version has the same content; only `last_verified` moved.
    VerifiedUnchanged,
    /// The open version was closed and replaced.
    Superseded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationCounts {
    pub created: usize,
    pub verified_unchanged: usize,
    pub superseded: usize,
}

impl ClassificationCounts {
    pub fn record(&mut self, classification: Classification) {
        match classification {
            Classification::Created => self.created += 1,
            Classification::VerifiedUnchanged => self.verified_unchanged += 1,
            Classification::Superseded => self.superseded += 1,
        }
    }

    pub fn absorb(&mut self, other: &ClassificationCounts) {
        self.created += other.created;
        self.verified_unchanged += other.verified_unchanged;
        self.superseded += other.superseded;
    }

    /// Edges that actually changed the graph.
    pub fn changed(&self) -> usize {
        self.created + self.superseded
    }

    pub fn total(&self) -> usize {
        self.created + self.verified_unchanged + self.superseded
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeOutcome {
    /// Position of the candidate in the submitted batch.
    pub index: usize,
    pub key: EdgeKey,
    pub classification: Classification,
    /// The open version after the upsert.
    pub edge_id: EdgeId,
    /// The version closed by a supersede.
    pub closed: Option<EdgeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityOutcome {
    pub id: String,
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeFailureKind {
    InvalidEdge,
    TransactionConflict,
    OutOfOrder,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeFailure {
    pub index: usize,
    pub key: EdgeKey,
    pub kind: EdgeFailureKind,
    pub reason: String,
}

/// An entity hint that was not merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityFailure {
    /// Position of the hint in the batch's `entities`.
    pub index: usize,
    pub id: String,
    pub reason: String,
}

/// Result of one [`TemporalGraph::upsert`] call.
///
/// Partial failure is reported here, never raised: an empty `failures` list
/// with zero changed edges means nothing needed updating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertReport {
    pub source_url: String,
    pub at: DateTime<Utc>,
    pub counts: ClassificationCounts,
    pub edges: Vec<EdgeOutcome>,
    pub entities: Vec<EntityOutcome>,
    pub failures: Vec<EdgeFailure>,
    #[serde(default)]
    pub entity_failures: Vec<EntityFailure>,
}

impl UpsertReport {
    fn new(source_url: &str, at: DateTime<Utc>) -> Self {
        Self {
            source_url: source_url.to_string(),
            at,
            counts: ClassificationCounts::default(),
            edges: Vec::new(),
            entities: Vec::new(),
            failures: Vec::new(),
            entity_failures: Vec::new(),
        }
    }

    fn fail(&mut self, index: usize, key: EdgeKey, err: &StoreError) {
        let kind = match err {
            StoreError::TransactionConflict(_) => EdgeFailureKind::TransactionConflict,
            StoreError::OutOfOrder { .. } => EdgeFailureKind::OutOfOrder,
            StoreError::Timeout => EdgeFailureKind::Timeout,
            _ => EdgeFailureKind::InvalidEdge,
        };
        self.failures.push(EdgeFailure {
            index,
            key,
            kind,
            reason: err.to_string(),
        });
    }

    /// True when every candidate edge and entity hint was applied.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.entity_failures.is_empty()
    }

    pub fn classification_of(&self, key: &EdgeKey) -> Option<Classification> {
        self.edges
            .iter()
            .rev()
            .find(|o| &o.key == key)
            .map(|o| o.classification)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Tuning for write paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Retries after a compare-and-swap conflict before the key is reported
    /// as failed.
    pub max_conflict_retries: u32,
    /// Upper bound for one upsert call. Keys not reached in time are
    /// reported as [`EdgeFailureKind::Timeout`].
    pub write_timeout: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
            write_timeout: None,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }
}

/// Sentinel temporal knowledge graph.
///
/// All state lives behind a [`TemporalBackend`]; the default is
/// [`RedbBackend`]. The store owns the decision logic (create, verify,
/// supersede) and hands each decision to the backend as a compare-and-swap
/// on the key's open version.
///
/// # Example
///
/// ```rust,no_run
/// use sentinel::{CandidateBatch, CandidateEdge, TemporalGraph};
///
/// let db = TemporalGraph::open_in_memory().unwrap();
/// let batch = CandidateBatch::from_edges(vec![CandidateEdge::new("alice", "WORKS_AT", "acme")]);
/// db.upsert_now(&batch, "https://example.com/alice").unwrap();
/// assert_eq!(db.snapshot(None).unwrap().link_count(), 1);
/// ```
pub struct TemporalGraph {
    backend: Box<dyn TemporalBackend>,
    config: StoreConfig,
    ids: Mutex<Generator>,
}

impl TemporalGraph {
    /// Open or create a database file at `path`.
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self::with_backend(
            Box::new(RedbBackend::open(path)?),
            StoreConfig::default(),
        ))
    }

    /// Create an in-memory database. Data is lost when the instance is dropped.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::with_backend(
            Box::new(RedbBackend::in_memory()?),
            StoreConfig::default(),
        ))
    }

    pub fn with_backend(backend: Box<dyn TemporalBackend>, config: StoreConfig) -> Self {
        Self {
            backend,
            config,
            ids: Mutex::new(Generator::new()),
        }
    }

    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// [`upsert`](TemporalGraph::upsert) with the wall clock as `now`.
    pub fn upsert_now(&self, batch: &CandidateBatch, source_url: &str) -> Result<UpsertReport> {
        self.upsert(batch, source_url, Utc::now())
    }

    /// Ingest the facts extracted from one document.
    ///
    /// Each candidate edge is validated, hashed and compared with the open
    /// version of its key:
    ///
    /// - no open version: a new one is created (`Created`);
    /// - same content hash: only `last_verified` moves (`VerifiedUnchanged`);
    /// - different hash: the open version is closed at `now` and a new one
    ///   opened (`Superseded`).
    ///
    /// Entities referenced by accepted edges, and any entity hints in the
    /// batch, are merged first.
    ///
    /// # Errors
    ///
    /// Only [`StoreError::StorageUnavailable`] (and corrupt rows) abort the
    /// call. Invalid edges, exhausted conflict retries, out-of-order clocks and
    /// deadline overruns are listed in [`UpsertReport::failures`].
    pub fn upsert(
        &self,
        batch: &CandidateBatch,
        source_url: &str,
        now: DateTime<Utc>,
    ) -> Result<UpsertReport> {
        let started = Instant::now();
        let mut report = UpsertReport::new(source_url, now);

        let mut accepted = Vec::with_capacity(batch.edges.len());
        for (index, edge) in batch.edges.iter().enumerate() {
            match validate_edge(edge, source_url) {
                Ok(()) => accepted.push((index, edge)),
                Err(e) => {
                    debug!(index, key = %edge.key(), error = %e, "rejected candidate edge");
                    report.fail(index, edge.key(), &e);
                }
            }
        }

        for (index, hint) in batch.entities.iter().enumerate() {
            if let Err(reason) = validate_entity_id(&hint.id) {
                debug!(index, id = %hint.id, reason, "rejected entity hint");
                report.entity_failures.push(EntityFailure {
                    index,
                    id: hint.id.clone(),
                    reason: reason.to_string(),
                });
            }
        }

        let writes = entity_writes(batch, accepted.iter().map(|(_, edge)| *edge));
        if !writes.is_empty() {
            report.entities = self.backend.merge_entities(&writes, now)?;
        }

        for (index, edge) in accepted {
            let key = edge.key();
            match self.upsert_edge(index, &key, edge, source_url, now, started) {
                Ok(outcome) => {
                    report.counts.record(outcome.classification);
                    report.edges.push(outcome);
                }
                Err(e) if e.is_per_edge() => {
                    warn!(index, key = %key, error = %e, "candidate edge not applied");
                    report.fail(index, key, &e);
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            source_url,
            created = report.counts.created,
            verified_unchanged = report.counts.verified_unchanged,
            superseded = report.counts.superseded,
            failed = report.failures.len(),
            rejected_entities = report.entity_failures.len(),
            "upsert complete"
        );
        Ok(report)
    }

    // Read-decide-write for one key, retried on compare-and-swap conflict.
    fn upsert_edge(
        &self,
        index: usize,
        key: &EdgeKey,
        edge: &CandidateEdge,
        source_url: &str,
        now: DateTime<Utc>,
        started: Instant,
    ) -> Result<EdgeOutcome> {
        let new_hash = edge.content_hash();
        let mut attempt = 0;
        loop {
            if self
                .config
                .write_timeout
                .is_some_and(|limit| started.elapsed() >= limit)
            {
                return Err(StoreError::Timeout);
            }

            let open = self.backend.open_relation(key)?;
            let (change, expected, outcome) = match open {
                None => {
                    let created = self.new_version(edge, source_url, now, new_hash.clone())?;
                    let outcome = EdgeOutcome {
                        index,
                        key: key.clone(),
                        classification: Classification::Created,
                        edge_id: created.id.clone(),
                        closed: None,
                    };
                    (KeyChange::Create(created), None, outcome)
                }
                Some(open) if open.content_hash == new_hash => {
                    let outcome = EdgeOutcome {
                        index,
                        key: key.clone(),
                        classification: Classification::VerifiedUnchanged,
                        edge_id: open.id.clone(),
                        closed: None,
                    };
                    let change = KeyChange::Touch {
                        id: open.id.clone(),
                        last_verified: open.last_verified.max(now),
                    };
                    (change, Some(open.id), outcome)
                }
                Some(open) => {
                    if now < open.valid_from {
                        return Err(StoreError::OutOfOrder {
                            key: key.to_string(),
                            now,
                            valid_from: open.valid_from,
                        });
                    }
                    let replacement = self.new_version(edge, source_url, now, new_hash.clone())?;
                    let outcome = EdgeOutcome {
                        index,
                        key: key.clone(),
                        classification: Classification::Superseded,
                        edge_id: replacement.id.clone(),
                        closed: Some(open.id.clone()),
                    };
                    let change = KeyChange::Supersede {
                        closed: open.id.clone(),
                        valid_to: now,
                        replacement,
                    };
                    (change, Some(open.id), outcome)
                }
            };

            match self.backend.apply(key, expected.as_ref(), change) {
                Ok(()) => {
                    debug!(key = %key, classification = ?outcome.classification, "edge applied");
                    return Ok(outcome);
                }
                Err(StoreError::TransactionConflict(_))
                    if attempt < self.config.max_conflict_retries =>
                {
                    attempt += 1;
                    debug!(key = %key, attempt, "open version moved, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn new_version(
        &self,
        edge: &CandidateEdge,
        source_url: &str,
        now: DateTime<Utc>,
        content_hash: ContentHash,
    ) -> Result<TemporalRelation> {
        Ok(TemporalRelation {
            id: self.next_id()?,
            source_id: edge.source_id.clone(),
            relation: edge.relation.clone(),
            target_id: edge.target_id.clone(),
            properties: edge.stored_properties(),
            valid_from: now,
            valid_to: None,
            last_verified: now,
            content_hash,
            source_url: source_url.to_string(),
        })
    }

    // Monotonic within the process, so versions of one key created in the
    // same millisecond still sort in creation order.
    fn next_id(&self) -> Result<EdgeId> {
        let mut ids = self
            .ids
            .lock()
            .map_err(|_| StoreError::Internal("id generator lock poisoned".into()))?;
        let id = ids
            .generate()
            .map_err(|e| StoreError::Internal(format!("id generator exhausted: {e}")))?;
        Ok(EdgeId(id.to_string()))
    }

    /// Reconstruct the graph as of `at` (now when `None`).
    ///
    /// Returns every entity and every version with
    /// `valid_from <= at < valid_to` (open versions have no upper bound).
    /// Pure read: no field is modified.
    pub fn snapshot(&self, at: Option<DateTime<Utc>>) -> Result<GraphView> {
        let at = at.unwrap_or_else(Utc::now);
        let (entities, relations) = self.backend.read_all()?;
        let relations = relations
            .into_iter()
            .filter(|r| r.was_valid_at(at))
            .collect();
        Ok(GraphView {
            at,
            entities,
            relations,
        })
    }

    /// The open version of `key`, if any.
    pub fn open_relation(&self, key: &EdgeKey) -> Result<Option<TemporalRelation>> {
        self.backend.open_relation(key)
    }

    /// Every currently open version.
    pub fn active_relations(&self) -> Result<Vec<TemporalRelation>> {
        self.backend.open_relations()
    }

    /// Retrieve one version by id.
    pub fn relation(&self, id: &EdgeId) -> Result<TemporalRelation> {
        self.backend
            .relation(id)?
            .ok_or_else(|| StoreError::NotFound(format!("edge id {id}")))
    }

    /// All versions of `key`, oldest first.
    pub fn history(&self, key: &EdgeKey) -> Result<Vec<TemporalRelation>> {
        let mut versions = self.backend.history(key)?;
        versions.sort_by(|a, b| {
            a.valid_from
                .cmp(&b.valid_from)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(versions)
    }

    pub fn entity(&self, id: &str) -> Result<Entity> {
        self.backend
            .entity(id)?
            .ok_or_else(|| StoreError::NotFound(format!("entity {id}")))
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.backend.stats()
    }
}

fn validate_edge(edge: &CandidateEdge, source_url: &str) -> Result<()> {
    for (field, value) in [
        ("source_id", edge.source_id.as_str()),
        ("relation", edge.relation.as_str()),
        ("target_id", edge.target_id.as_str()),
        ("source_url", source_url),
    ] {
        if value.trim().is_empty() {
            return Err(StoreError::InvalidEdge(format!("{field} must not be empty")));
        }
        if value.contains(KEY_SEPARATOR) {
            return Err(StoreError::InvalidEdge(format!(
                "{field} contains the reserved separator U+001F"
            )));
        }
    }
    Ok(())
}

fn validate_entity_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.trim().is_empty() {
        Err("entity id must not be empty")
    } else if id.contains(KEY_SEPARATOR) {
        Err("entity id contains the reserved separator U+001F")
    } else {
        Ok(())
    }
}

// One write per entity id: hints first (later hints win per property), then
// bare ids referenced by accepted edges.
fn entity_writes<'a>(
    batch: &CandidateBatch,
    edges: impl Iterator<Item = &'a CandidateEdge>,
) -> Vec<EntityWrite> {
    let mut writes: BTreeMap<String, EntityWrite> = BTreeMap::new();
    for hint in &batch.entities {
        if validate_entity_id(&hint.id).is_err() {
            continue;
        }
        let write = writes.entry(hint.id.clone()).or_insert_with(|| EntityWrite {
            id: hint.id.clone(),
            label: None,
            properties: Properties::new(),
        });
        if hint.label.is_some() {
            write.label = hint.label.clone();
        }
        write.properties.extend(hint.properties.clone());
    }
    for edge in edges {
        for id in [&edge.source_id, &edge.target_id] {
            writes.entry(id.clone()).or_insert_with(|| EntityWrite {
                id: id.clone(),
                label: None,
                properties: Properties::new(),
            });
        }
    }
    writes.into_values().collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn open_temp_db() -> (TemporalGraph, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let db = TemporalGraph::open(&path).unwrap();
        (db, file)
    }

    fn dt(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    const URL: &str = "https://example.com/tesla";

    fn founded_by(year: &str) -> CandidateBatch {
        CandidateBatch::from_edges(vec![
            CandidateEdge::new("tesla", "FOUNDED_BY", "eberhard").with_property("year", year)
        ])
    }

    fn key() -> EdgeKey {
        EdgeKey::new("tesla", "FOUNDED_BY", "eberhard")
    }

    #[test]
    fn scenario_create_verify_supersede() {
        let (db, _tmp) = open_temp_db();
        let t0 = dt("2024-01-01T00:00:00Z");
        let t1 = dt("2024-01-02T00:00:00Z");
        let t2 = dt("2024-01-03T00:00:00Z");

        let first = db.upsert(&founded_by("2003"), URL, t0).unwrap();
        assert_eq!(first.classification_of(&key()), Some(Classification::Created));

        let second = db.upsert(&founded_by("2003"), URL, t1).unwrap();
        assert_eq!(
            second.classification_of(&key()),
            Some(Classification::VerifiedUnchanged)
        );
        let open = db.open_relation(&key()).unwrap().unwrap();
        assert_eq!(open.valid_from, t0);
        assert_eq!(open.last_verified, t1);

        let third = db.upsert(&founded_by("2004"), URL, t2).unwrap();
        assert_eq!(third.classification_of(&key()), Some(Classification::Superseded));
        assert_eq!(third.edges[0].closed, Some(open.id.clone()));

        let at_t1 = db.snapshot(Some(t1)).unwrap();
        assert_eq!(at_t1.link_count(), 1);
        assert_eq!(at_t1.relations[0].id, open.id);
        assert_eq!(
            at_t1.relations[0].properties.get("year"),
            Some(&PropertyValue::from("2003"))
        );

        let at_t2 = db.snapshot(Some(t2)).unwrap();
        assert_eq!(at_t2.link_count(), 1);
        assert_eq!(at_t2.relations[0].id, third.edges[0].edge_id);
        assert_eq!(
            at_t2.relations[0].properties.get("year"),
            Some(&PropertyValue::from("2004"))
        );
    }

    #[test]
    fn resubmitting_identical_batch_only_verifies() {
        let db = TemporalGraph::open_in_memory().unwrap();
        let batch = CandidateBatch::from_edges(vec![
            CandidateEdge::new("tesla", "FOUNDED_BY", "eberhard"),
            CandidateEdge::new("tesla", "LOCATED_IN", "austin").with_property("since", "2021"),
            CandidateEdge::new("spacex", "LED_BY", "musk"),
        ]);
        let first = db
            .upsert(&batch, URL, dt("2024-01-01T00:00:00Z"))
            .unwrap();
        assert_eq!(first.counts.created, 3);

        let second = db
            .upsert(&batch, URL, dt("2024-01-05T00:00:00Z"))
            .unwrap();
        assert_eq!(second.counts.created, 0);
        assert_eq!(second.counts.superseded, 0);
        assert_eq!(second.counts.verified_unchanged, 3);
        assert_eq!(db.stats().unwrap().closed_relations, 0);
    }

    #[test]
    fn history_has_one_version_per_distinct_hash() {
        let db = TemporalGraph::open_in_memory().unwrap();
        let years = ["2003", "2003", "2004", "2004", "2003", "2005"];
        let mut distinct_in_order: Vec<ContentHash> = Vec::new();
        for (day, year) in years.iter().enumerate() {
            let now = dt("2024-01-01T00:00:00Z") + chrono::Duration::days(day as i64);
            db.upsert(&founded_by(year), URL, now).unwrap();
            let hash = founded_by(year).edges[0].content_hash();
            if distinct_in_order.last() != Some(&hash) {
                distinct_in_order.push(hash);
            }
        }

        let history = db.history(&key()).unwrap();
        let hashes: Vec<ContentHash> = history.iter().map(|r| r.content_hash.clone()).collect();
        assert_eq!(hashes, distinct_in_order);
        assert_eq!(history.iter().filter(|r| r.is_open()).count(), 1);
        assert!(history.last().unwrap().is_open());
        for pair in history.windows(2) {
            assert_eq!(pair[0].valid_to, Some(pair[1].valid_from));
        }
    }

    #[test]
    fn snapshot_interval_boundaries() {
        let db = TemporalGraph::open_in_memory().unwrap();
        let t1 = dt("2024-01-01T00:00:00Z");
        let t2 = dt("2024-02-01T00:00:00Z");
        db.upsert(&founded_by("2003"), URL, t1).unwrap();
        db.upsert(&founded_by("2004"), URL, t2).unwrap();
        let history = db.history(&key()).unwrap();
        let (old, new) = (&history[0], &history[1]);

        let before = db.snapshot(Some(t1 - chrono::Duration::seconds(1))).unwrap();
        assert_eq!(before.link_count(), 0);

        for t in [t1, t2 - chrono::Duration::seconds(1)] {
            let view = db.snapshot(Some(t)).unwrap();
            let ids: Vec<&EdgeId> = view.relations.iter().map(|r| &r.id).collect();
            assert_eq!(ids, vec![&old.id]);
        }
        for t in [t2, t2 + chrono::Duration::days(365)] {
            let view = db.snapshot(Some(t)).unwrap();
            let ids: Vec<&EdgeId> = view.relations.iter().map(|r| &r.id).collect();
            assert_eq!(ids, vec![&new.id]);
        }
    }

    #[test]
    fn snapshot_does_not_touch_last_verified() {
        let db = TemporalGraph::open_in_memory().unwrap();
        let t0 = dt("2024-01-01T00:00:00Z");
        db.upsert(&founded_by("2003"), URL, t0).unwrap();
        let before = db.open_relation(&key()).unwrap().unwrap();
        let _ = db.snapshot(None).unwrap();
        let _ = db.snapshot(Some(t0)).unwrap();
        let after = db.open_relation(&key()).unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn snapshot_includes_every_entity_and_is_ordered() {
        let db = TemporalGraph::open_in_memory().unwrap();
        let t0 = dt("2024-01-01T00:00:00Z");
        let batch = CandidateBatch::from_edges(vec![
            CandidateEdge::new("zeta", "KNOWS", "alpha"),
            CandidateEdge::new("mid", "KNOWS", "alpha"),
        ]);
        db.upsert(&batch, URL, t0).unwrap();

        let view = db.snapshot(Some(t0 - chrono::Duration::days(1))).unwrap();
        let ids: Vec<&str> = view.entities.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
        assert_eq!(view.link_count(), 0);

        let first = db.snapshot(Some(t0)).unwrap();
        let second = db.snapshot(Some(t0)).unwrap();
        assert_eq!(first.relations, second.relations);
    }

    #[test]
    fn entities_are_created_and_merged_last_write_wins() {
        let db = TemporalGraph::open_in_memory().unwrap();
        let t0 = dt("2024-01-01T00:00:00Z");
        let t1 = dt("2024-01-02T00:00:00Z");

        let batch = founded_by("2003").with_entity(
            CandidateEntity::new("tesla", "Company")
                .with_property("name", "Tesla")
                .with_property("hq", "Palo Alto"),
        );
        let report = db.upsert(&batch, URL, t0).unwrap();
        let created: HashSet<&str> = report
            .entities
            .iter()
            .filter(|e| e.created)
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(created, HashSet::from(["tesla", "eberhard"]));

        let eberhard = db.entity("eberhard").unwrap();
        assert_eq!(eberhard.label, DEFAULT_ENTITY_LABEL);

        let update = CandidateBatch::default().with_entity(
            CandidateEntity::new("tesla", "Company").with_property("hq", "Austin"),
        );
        db.upsert(&update, URL, t1).unwrap();
        let tesla = db.entity("tesla").unwrap();
        assert_eq!(tesla.properties.get("name"), Some(&PropertyValue::from("Tesla")));
        assert_eq!(tesla.properties.get("hq"), Some(&PropertyValue::from("Austin")));
        assert_eq!(tesla.created_at, t0);
        assert_eq!(tesla.updated_at, t1);
    }

    #[test]
    fn confidence_change_alone_is_unchanged() {
        let db = TemporalGraph::open_in_memory().unwrap();
        let t0 = dt("2024-01-01T00:00:00Z");
        let t1 = dt("2024-01-02T00:00:00Z");
        let at = |c: f64| {
            CandidateBatch::from_edges(vec![
                CandidateEdge::new("alice", "WORKS_AT", "acme").with_confidence(c)
            ])
        };
        db.upsert(&at(0.9), URL, t0).unwrap();
        let report = db.upsert(&at(0.5), URL, t1).unwrap();
        assert_eq!(report.counts.verified_unchanged, 1);

        let open = db
            .open_relation(&EdgeKey::new("alice", "WORKS_AT", "acme"))
            .unwrap()
            .unwrap();
        assert_eq!(open.confidence(), Some(0.9));
    }

    #[test]
    fn invalid_edges_are_rejected_without_aborting_the_batch() {
        let db = TemporalGraph::open_in_memory().unwrap();
        let batch = CandidateBatch::from_edges(vec![
            CandidateEdge::new("", "FOUNDED_BY", "eberhard"),
            CandidateEdge::new("tesla", "FOUNDED_BY", "eberhard"),
            CandidateEdge::new("tesla", "  ", "austin"),
            CandidateEdge::new("te\u{1f}sla", "LOCATED_IN", "austin"),
        ]);
        let report = db.upsert_now(&batch, URL).unwrap();
        assert_eq!(report.counts.created, 1);
        let failed: Vec<usize> = report.failures.iter().map(|f| f.index).collect();
        assert_eq!(failed, vec![0, 2, 3]);
        assert!(report
            .failures
            .iter()
            .all(|f| f.kind == EdgeFailureKind::InvalidEdge));
        assert!(db.entity("").is_err());
    }

    #[test]
    fn invalid_entity_hints_are_reported() {
        let db = TemporalGraph::open_in_memory().unwrap();
        let batch = CandidateBatch {
            entities: vec![
                CandidateEntity::new(" ", "Company"),
                CandidateEntity::new("tesla", "Company"),
                CandidateEntity::new("ac\u{1f}me", "Company"),
            ],
            edges: vec![CandidateEdge::new("tesla", "FOUNDED_BY", "eberhard")],
        };
        let report = db.upsert_now(&batch, URL).unwrap();
        assert_eq!(report.counts.created, 1);
        assert!(report.failures.is_empty());
        assert!(!report.is_clean());
        let rejected: Vec<usize> = report.entity_failures.iter().map(|f| f.index).collect();
        assert_eq!(rejected, vec![0, 2]);
        assert!(report.entity_failures[1].reason.contains("U+001F"));
        assert_eq!(db.entity("tesla").unwrap().label, "Company");
    }

    #[test]
    fn plain_json_properties_decode() {
        let batch: CandidateBatch = serde_json::from_str(
            r#"{"edges":[{"source_id":"tesla","relation":"FOUNDED_BY","target_id":"eberhard",
                "properties":{"year":"2003","employees":127000,"public":true,
                              "hq":{"type":"Text","value":"Austin"}}}]}"#,
        )
        .unwrap();
        let props = &batch.edges[0].properties;
        assert_eq!(props["year"], PropertyValue::Text("2003".into()));
        assert_eq!(props["employees"], PropertyValue::Number(127000.0));
        assert_eq!(props["public"], PropertyValue::Boolean(true));
        assert_eq!(props["hq"], PropertyValue::Text("Austin".into()));

        let nested = serde_json::from_str::<PropertyValue>(r#"{"a":[1]}"#);
        assert!(nested.is_err());
        let tagged = serde_json::to_string(&PropertyValue::Number(1.5)).unwrap();
        assert_eq!(tagged, r#"{"type":"Number","value":1.5}"#);
    }

    #[test]
    fn empty_source_url_rejects_every_edge() {
        let db = TemporalGraph::open_in_memory().unwrap();
        let report = db.upsert_now(&founded_by("2003"), " ").unwrap();
        assert_eq!(report.counts.total(), 0);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].reason.contains("source_url"));
    }

    #[test]
    fn earlier_clock_cannot_close_a_newer_version() {
        let db = TemporalGraph::open_in_memory().unwrap();
        let t1 = dt("2024-02-01T00:00:00Z");
        db.upsert(&founded_by("2003"), URL, t1).unwrap();

        let report = db
            .upsert(&founded_by("2004"), URL, dt("2024-01-01T00:00:00Z"))
            .unwrap();
        assert_eq!(report.failures[0].kind, EdgeFailureKind::OutOfOrder);
        assert_eq!(db.history(&key()).unwrap().len(), 1);

        // Unchanged content with an old clock never moves last_verified back.
        let verify = db
            .upsert(&founded_by("2003"), URL, dt("2024-01-15T00:00:00Z"))
            .unwrap();
        assert_eq!(verify.counts.verified_unchanged, 1);
        let open = db.open_relation(&key()).unwrap().unwrap();
        assert_eq!(open.last_verified, t1);
    }

    #[test]
    fn duplicate_keys_in_one_batch_apply_in_order() {
        let db = TemporalGraph::open_in_memory().unwrap();
        let t0 = dt("2024-01-01T00:00:00Z");
        let mut batch = founded_by("2003");
        batch.edges.extend(founded_by("2004").edges);
        let report = db.upsert(&batch, URL, t0).unwrap();
        assert_eq!(report.counts.created, 1);
        assert_eq!(report.counts.superseded, 1);

        let history = db.history(&key()).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].valid_from, history[0].valid_to.unwrap());
        let view = db.snapshot(Some(t0)).unwrap();
        assert_eq!(view.relations[0].id, history[1].id);
    }

    #[test]
    fn state_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("reopen.redb");
        let path_str = path.to_str().unwrap();
        let t0 = dt("2024-01-01T00:00:00Z");

        {
            let db = TemporalGraph::open(path_str).unwrap();
            db.upsert(&founded_by("2003"), URL, t0).unwrap();
        }

        let db = TemporalGraph::open(path_str).unwrap();
        let report = db
            .upsert(&founded_by("2003"), URL, t0 + chrono::Duration::days(1))
            .unwrap();
        assert_eq!(report.counts.verified_unchanged, 1);
        assert_eq!(db.stats().unwrap().entities, 2);
    }

    #[test]
    fn concurrent_upserts_keep_one_open_version_per_key() {
        let db = Arc::new(TemporalGraph::open_in_memory().unwrap());
        let now = dt("2024-01-01T00:00:00Z");
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || {
                    let batch = CandidateBatch::from_edges(vec![
                        CandidateEdge::new("tesla", "FOUNDED_BY", "eberhard"),
                        CandidateEdge::new("worker", "RAN", format!("job-{i}")),
                    ]);
                    db.upsert(&batch, URL, now).unwrap()
                })
            })
            .collect();
        let reports: Vec<UpsertReport> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let created_shared = reports
            .iter()
            .filter(|r| r.classification_of(&key()) == Some(Classification::Created))
            .count();
        assert_eq!(created_shared, 1, "exactly one writer may create the shared key");
        assert_eq!(db.history(&key()).unwrap().len(), 1);
        assert_eq!(db.active_relations().unwrap().len(), 9);
    }

    // -- fault injection --------------------------------------------------

    /// Wraps an in-memory redb backend and injects failures.
    struct FaultyBackend {
        inner: RedbBackend,
        conflicts: Mutex<HashMap<EdgeKey, u32>>,
        unavailable: AtomicBool,
    }

    impl FaultyBackend {
        fn new() -> Self {
            Self {
                inner: RedbBackend::in_memory().unwrap(),
                conflicts: Mutex::new(HashMap::new()),
                unavailable: AtomicBool::new(false),
            }
        }

        fn conflict_on(self, key: EdgeKey, times: u32) -> Self {
            self.conflicts.lock().unwrap().insert(key, times);
            self
        }

        fn check(&self) -> Result<()> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(StoreError::StorageUnavailable("connection refused".into()));
            }
            Ok(())
        }
    }

    impl TemporalBackend for FaultyBackend {
        fn open_relation(&self, key: &EdgeKey) -> Result<Option<TemporalRelation>> {
            self.check()?;
            self.inner.open_relation(key)
        }

        fn apply(&self, key: &EdgeKey, expected_open: Option<&EdgeId>, change: KeyChange) -> Result<()> {
            self.check()?;
            if let Some(remaining) = self.conflicts.lock().unwrap().get_mut(key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StoreError::TransactionConflict(key.to_string()));
                }
            }
            self.inner.apply(key, expected_open, change)
        }

        fn merge_entities(&self, writes: &[EntityWrite], now: DateTime<Utc>) -> Result<Vec<EntityOutcome>> {
            self.check()?;
            self.inner.merge_entities(writes, now)
        }

        fn entity(&self, id: &str) -> Result<Option<Entity>> {
            self.inner.entity(id)
        }

        fn relation(&self, id: &EdgeId) -> Result<Option<TemporalRelation>> {
            self.inner.relation(id)
        }

        fn history(&self, key: &EdgeKey) -> Result<Vec<TemporalRelation>> {
            self.inner.history(key)
        }

        fn open_relations(&self) -> Result<Vec<TemporalRelation>> {
            self.check()?;
            self.inner.open_relations()
        }

        fn read_all(&self) -> Result<(Vec<Entity>, Vec<TemporalRelation>)> {
            self.check()?;
            self.inner.read_all()
        }

        fn stats(&self) -> Result<StoreStats> {
            self.inner.stats()
        }
    }

    #[test]
    fn conflicts_are_retried_then_succeed() {
        let backend = FaultyBackend::new().conflict_on(key(), 2);
        let db = TemporalGraph::with_backend(Box::new(backend), StoreConfig::default());
        let report = db.upsert_now(&founded_by("2003"), URL).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.counts.created, 1);
    }

    #[test]
    fn exhausted_conflicts_fail_only_that_key() {
        let backend = FaultyBackend::new().conflict_on(key(), 10);
        let db = TemporalGraph::with_backend(
            Box::new(backend),
            StoreConfig::new().with_max_conflict_retries(2),
        );
        let mut batch = founded_by("2003");
        batch
            .edges
            .push(CandidateEdge::new("tesla", "LOCATED_IN", "austin"));
        let report = db.upsert_now(&batch, URL).unwrap();

        assert_eq!(report.counts.created, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].key, key());
        assert_eq!(report.failures[0].kind, EdgeFailureKind::TransactionConflict);
        assert!(db.open_relation(&key()).unwrap().is_none());
    }

    #[test]
    fn storage_unavailable_aborts_the_call() {
        let backend = FaultyBackend::new();
        backend.unavailable.store(true, Ordering::SeqCst);
        let db = TemporalGraph::with_backend(Box::new(backend), StoreConfig::default());
        let err = db.upsert_now(&founded_by("2003"), URL).unwrap_err();
        assert!(matches!(err, StoreError::StorageUnavailable(_)));
        assert!(matches!(
            db.snapshot(None).unwrap_err(),
            StoreError::StorageUnavailable(_)
        ));
    }

    #[test]
    fn zero_write_timeout_reports_every_key_as_timed_out() {
        let db = TemporalGraph::open_in_memory()
            .unwrap()
            .with_config(StoreConfig::new().with_write_timeout(Duration::ZERO));
        let report = db.upsert_now(&founded_by("2003"), URL).unwrap();
        assert_eq!(report.counts.total(), 0);
        assert_eq!(report.failures[0].kind, EdgeFailureKind::Timeout);
    }

    #[test]
    fn relation_lookup_by_id() {
        let db = TemporalGraph::open_in_memory().unwrap();
        let report = db.upsert_now(&founded_by("2003"), URL).unwrap();
        let id = &report.edges[0].edge_id;
        let relation = db.relation(id).unwrap();
        assert_eq!(relation.key(), key());
        assert_eq!(relation.source_url, URL);
        assert!(matches!(
            db.relation(&EdgeId("missing".into())),
            Err(StoreError::NotFound(_))
        ));
    }
}
