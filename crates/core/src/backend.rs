//! Persistence seam for the temporal store.
//!
//! [`TemporalGraph`](crate::TemporalGraph) decides what happens to a key;
//! a [`TemporalBackend`] makes that decision durable. Every write to a key
//! is a compare-and-swap on the key's open-version pointer, so two writers
//! that read the same open version cannot both close it.
//!
//! # Storage layout (redb)
//!
//! | table          | key                              | value               |
//! |----------------|----------------------------------|---------------------|
//! | `entities`     | entity id                        | JSON [`Entity`]     |
//! | `relations`    | edge id                          | JSON version        |
//! | `key_history`  | `{encoded key}\x1f{edge id}`     | edge id             |
//! | `open_edges`   | encoded key                      | edge id of the open version |
//!
//! Edge ids are ULIDs, so a key's history rows sort oldest first.

use crate::{
    Entity, EntityOutcome, EdgeId, EdgeKey, Properties, Result, StoreError, TemporalRelation,
    DEFAULT_ENTITY_LABEL, KEY_SEPARATOR,
};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};

const ENTITIES: TableDefinition<&str, &str> = TableDefinition::new("entities");
const RELATIONS: TableDefinition<&str, &str> = TableDefinition::new("relations");
const KEY_HISTORY: TableDefinition<&str, &str> = TableDefinition::new("key_history");
const OPEN_EDGES: TableDefinition<&str, &str> = TableDefinition::new("open_edges");

/// A write to one key, applied atomically by [`TemporalBackend::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum KeyChange {
    /// First version of a key that has no open version.
    Create(TemporalRelation),
    /// Re-confirm the open version. The stored `last_verified` never moves
    /// backwards.
    Touch {
        id: EdgeId,
        last_verified: DateTime<Utc>,
    },
    /// Close the open version at `valid_to` and open `replacement`.
    Supersede {
        closed: EdgeId,
        valid_to: DateTime<Utc>,
        replacement: TemporalRelation,
    },
}

/// Entity upsert request. `label: None` keeps the stored label, or uses the
/// default label for a new entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityWrite {
    pub id: String,
    pub label: Option<String>,
    pub properties: Properties,
}

impl EntityWrite {
    fn has_hint(&self) -> bool {
        self.label.is_some() || !self.properties.is_empty()
    }
}

/// Row counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub entities: u64,
    pub relations: u64,
    pub open_relations: u64,
    pub closed_relations: u64,
}

pub trait TemporalBackend: Send + Sync {
    fn open_relation(&self, key: &EdgeKey) -> Result<Option<TemporalRelation>>;

    /// Apply `change` iff the key's open version is still `expected_open`.
    ///
    /// # Errors
    ///
    /// [`StoreError::TransactionConflict`] when the pointer moved; nothing
    /// is written in that case.
    fn apply(&self, key: &EdgeKey, expected_open: Option<&EdgeId>, change: KeyChange)
        -> Result<()>;

    /// Create or merge entities in one transaction. Later writes win per
    /// property.
    fn merge_entities(
        &self,
        writes: &[EntityWrite],
        now: DateTime<Utc>,
    ) -> Result<Vec<EntityOutcome>>;

    fn entity(&self, id: &str) -> Result<Option<Entity>>;

    fn relation(&self, id: &EdgeId) -> Result<Option<TemporalRelation>>;

    /// Every version of `key`, in id order.
    fn history(&self, key: &EdgeKey) -> Result<Vec<TemporalRelation>>;

    /// Every open version, ordered by key.
    fn open_relations(&self) -> Result<Vec<TemporalRelation>>;

    /// All entities (by id) and all versions (by key, then id), read from a
    /// single consistent view.
    fn read_all(&self) -> Result<(Vec<Entity>, Vec<TemporalRelation>)>;

    fn stats(&self) -> Result<StoreStats>;
}

// ---------------------------------------------------------------------------
// redb
// ---------------------------------------------------------------------------

pub struct RedbBackend {
    db: Database,
}

impl RedbBackend {
    /// Open or create a database file. The `.redb` extension is
    /// conventional but not enforced.
    pub fn open(path: &str) -> Result<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    pub fn in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(ENTITIES)?;
            write_txn.open_table(RELATIONS)?;
            write_txn.open_table(KEY_HISTORY)?;
            write_txn.open_table(OPEN_EDGES)?;
            write_txn.commit()?;
        }
        Ok(Self { db })
    }
}

fn history_row(key: &str, id: &EdgeId) -> String {
    format!("{key}{KEY_SEPARATOR}{id}")
}

fn load_relation(txn: &WriteTransaction, id: &EdgeId) -> Result<TemporalRelation> {
    let table = txn.open_table(RELATIONS)?;
    let row = table.get(id.0.as_str())?;
    let relation = match row {
        Some(v) => serde_json::from_str(v.value())?,
        None => {
            return Err(StoreError::Internal(format!(
                "open edge pointer references missing version {id}"
            )))
        }
    };
    Ok(relation)
}

fn insert_version(txn: &WriteTransaction, key: &str, relation: &TemporalRelation) -> Result<()> {
    let value = serde_json::to_string(relation)?;
    txn.open_table(RELATIONS)?
        .insert(relation.id.0.as_str(), value.as_str())?;
    txn.open_table(KEY_HISTORY)?.insert(
        history_row(key, &relation.id).as_str(),
        relation.id.0.as_str(),
    )?;
    txn.open_table(OPEN_EDGES)?
        .insert(key, relation.id.0.as_str())?;
    Ok(())
}

fn store_relation(txn: &WriteTransaction, relation: &TemporalRelation) -> Result<()> {
    let value = serde_json::to_string(relation)?;
    txn.open_table(RELATIONS)?
        .insert(relation.id.0.as_str(), value.as_str())?;
    Ok(())
}

impl TemporalBackend for RedbBackend {
    fn open_relation(&self, key: &EdgeKey) -> Result<Option<TemporalRelation>> {
        let read_txn = self.db.begin_read()?;
        let open = read_txn.open_table(OPEN_EDGES)?;
        let encoded = key.encode();
        let Some(id) = open.get(encoded.as_str())? else {
            return Ok(None);
        };
        let relations = read_txn.open_table(RELATIONS)?;
        let row = relations.get(id.value())?;
        let relation = match row {
            Some(v) => serde_json::from_str(v.value())?,
            None => {
                return Err(StoreError::Internal(format!(
                    "open edge pointer references missing version {}",
                    id.value()
                )))
            }
        };
        Ok(Some(relation))
    }

    fn apply(
        &self,
        key: &EdgeKey,
        expected_open: Option<&EdgeId>,
        change: KeyChange,
    ) -> Result<()> {
        let encoded = key.encode();
        let write_txn = self.db.begin_write()?;

        let current: Option<String> = {
            let open = write_txn.open_table(OPEN_EDGES)?;
            let row = open.get(encoded.as_str())?;
            row.map(|v| v.value().to_string())
        };
        if current.as_deref() != expected_open.map(|id| id.0.as_str()) {
            // Dropping the transaction aborts it.
            return Err(StoreError::TransactionConflict(key.to_string()));
        }

        match change {
            KeyChange::Create(relation) => {
                insert_version(&write_txn, &encoded, &relation)?;
            }
            KeyChange::Touch { id, last_verified } => {
                let mut relation = load_relation(&write_txn, &id)?;
                relation.last_verified = relation.last_verified.max(last_verified);
                store_relation(&write_txn, &relation)?;
            }
            KeyChange::Supersede {
                closed,
                valid_to,
                replacement,
            } => {
                let mut previous = load_relation(&write_txn, &closed)?;
                previous.valid_to = Some(valid_to);
                store_relation(&write_txn, &previous)?;
                insert_version(&write_txn, &encoded, &replacement)?;
            }
        }

        write_txn.commit()?;
        Ok(())
    }

    fn merge_entities(
        &self,
        writes: &[EntityWrite],
        now: DateTime<Utc>,
    ) -> Result<Vec<EntityOutcome>> {
        let write_txn = self.db.begin_write()?;
        let mut outcomes = Vec::with_capacity(writes.len());
        {
            let mut table = write_txn.open_table(ENTITIES)?;
            for write in writes {
                let existing: Option<Entity> = {
                    let row = table.get(write.id.as_str())?;
                    match row {
                        Some(v) => Some(serde_json::from_str(v.value())?),
                        None => None,
                    }
                };
                let (entity, created) = match existing {
                    Some(mut entity) => {
                        if !write.has_hint() {
                            outcomes.push(EntityOutcome {
                                id: write.id.clone(),
                                created: false,
                            });
                            continue;
                        }
                        if let Some(label) = &write.label {
                            entity.label = label.clone();
                        }
                        entity.properties.extend(write.properties.clone());
                        entity.updated_at = now;
                        (entity, false)
                    }
                    None => (
                        Entity {
                            id: write.id.clone(),
                            label: write
                                .label
                                .clone()
                                .unwrap_or_else(|| DEFAULT_ENTITY_LABEL.to_string()),
                            properties: write.properties.clone(),
                            created_at: now,
                            updated_at: now,
                        },
                        true,
                    ),
                };
                let value = serde_json::to_string(&entity)?;
                table.insert(entity.id.as_str(), value.as_str())?;
                outcomes.push(EntityOutcome {
                    id: entity.id,
                    created,
                });
            }
        }
        write_txn.commit()?;
        Ok(outcomes)
    }

    fn entity(&self, id: &str) -> Result<Option<Entity>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTITIES)?;
        let row = table.get(id)?;
        let entity = match row {
            Some(v) => Some(serde_json::from_str(v.value())?),
            None => None,
        };
        Ok(entity)
    }

    fn relation(&self, id: &EdgeId) -> Result<Option<TemporalRelation>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RELATIONS)?;
        let row = table.get(id.0.as_str())?;
        let relation = match row {
            Some(v) => Some(serde_json::from_str(v.value())?),
            None => None,
        };
        Ok(relation)
    }

    fn history(&self, key: &EdgeKey) -> Result<Vec<TemporalRelation>> {
        let prefix = format!("{}{KEY_SEPARATOR}", key.encode());
        let read_txn = self.db.begin_read()?;
        let history = read_txn.open_table(KEY_HISTORY)?;
        let relations = read_txn.open_table(RELATIONS)?;

        let mut results = Vec::new();
        for entry in history.range(prefix.as_str()..)? {
            let (k, id) = entry?;
            if !k.value().starts_with(&prefix) {
                break;
            }
            if let Some(v) = relations.get(id.value())? {
                results.push(serde_json::from_str(v.value())?);
            }
        }
        Ok(results)
    }

    fn open_relations(&self) -> Result<Vec<TemporalRelation>> {
        let read_txn = self.db.begin_read()?;
        let open = read_txn.open_table(OPEN_EDGES)?;
        let relations = read_txn.open_table(RELATIONS)?;

        let mut results = Vec::new();
        for entry in open.iter()? {
            let (_k, id) = entry?;
            if let Some(v) = relations.get(id.value())? {
                results.push(serde_json::from_str(v.value())?);
            }
        }
        Ok(results)
    }

    fn read_all(&self) -> Result<(Vec<Entity>, Vec<TemporalRelation>)> {
        let read_txn = self.db.begin_read()?;
        let entity_table = read_txn.open_table(ENTITIES)?;
        let history = read_txn.open_table(KEY_HISTORY)?;
        let relation_table = read_txn.open_table(RELATIONS)?;

        let mut entities = Vec::new();
        for entry in entity_table.iter()? {
            let (_k, v) = entry?;
            entities.push(serde_json::from_str(v.value())?);
        }

        let mut relations = Vec::new();
        for entry in history.iter()? {
            let (_k, id) = entry?;
            if let Some(v) = relation_table.get(id.value())? {
                relations.push(serde_json::from_str(v.value())?);
            }
        }
        Ok((entities, relations))
    }

    fn stats(&self) -> Result<StoreStats> {
        let read_txn = self.db.begin_read()?;
        let entities = read_txn.open_table(ENTITIES)?.iter()?.count() as u64;
        let relations = read_txn.open_table(RELATIONS)?.iter()?.count() as u64;
        let open_relations = read_txn.open_table(OPEN_EDGES)?.iter()?.count() as u64;
        Ok(StoreStats {
            entities,
            relations,
            open_relations,
            closed_relations: relations.saturating_sub(open_relations),
        })
    }
}
