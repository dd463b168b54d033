//! Identity Map: one tracked record per (entity type, primary key).
//!
//! Every row that enters a unit of work, whether fetched directly, joined
//! in by an eager load, or fetched by a lazy navigation, is routed through
//! [`IdentityMap::get_or_create`]. The first load of a key wins: later loads
//! of the same key return the existing record and ignore the fetched values,
//! so in-memory edits are never clobbered by a re-read.
//!
//! Records added with a store-generated key that is still NULL are keyed by
//! a provisional id until commit learns the real key.

use crate::change_tracker::{
    RecordId, RecordKey, RecordRef, RecordState, TrackedRecord, read_record, write_record,
};
use crate::relationship::NavigationLoader;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use trackorm_core::{
    ConflictError, EntityMeta, Error, FieldValues, PrimaryKey, Result, ValidationErrorKind, Value,
};

/// How `attach` treats a key that is already tracked with different values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// Refuse when the tracked record has pending edits that differ.
    #[default]
    None,
    /// Keep the tracked record and its pending edits.
    KeepCurrent,
    /// Replace the tracked snapshots with the supplied values.
    Overwrite,
}

/// Per unit-of-work cache of tracked records.
pub struct IdentityMap {
    records: HashMap<RecordKey, RecordRef>,
    loader: Option<Weak<dyn NavigationLoader>>,
    next_provisional: u64,
    next_seq: u64,
}

impl std::fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMap")
            .field("len", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl Default for IdentityMap {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityMap {
    /// A map whose records cannot resolve navigations.
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            loader: None,
            next_provisional: 0,
            next_seq: 0,
        }
    }

    pub(crate) fn with_loader(loader: Weak<dyn NavigationLoader>) -> Self {
        Self {
            loader: Some(loader),
            ..Self::new()
        }
    }

    fn create(
        &mut self,
        key: RecordKey,
        meta: &EntityMeta,
        values: FieldValues,
        state: RecordState,
    ) -> RecordRef {
        let seq = self.next_seq;
        self.next_seq += 1;
        let record = TrackedRecord::create(key.clone(), *meta, values, state, seq, self.loader.clone());
        self.records.insert(key, Arc::clone(&record));
        record
    }

    /// Return the record tracked under `key`, or start tracking `values` as `Unchanged`.
    ///
    /// An existing record is returned as is; `values` are ignored.
    pub fn get_or_create(
        &mut self,
        meta: &EntityMeta,
        key: PrimaryKey,
        values: FieldValues,
    ) -> Result<RecordRef> {
        let record_key = RecordKey::new(meta.table, key);
        if let Some(existing) = self.records.get(&record_key) {
            return Ok(Arc::clone(existing));
        }
        let values = values.conform(meta.table, meta.fields)?;
        tracing::trace!(record = %record_key, "Tracking loaded record");
        Ok(self.create(record_key, meta, values, RecordState::Unchanged))
    }

    /// Track a detached copy of a persisted row.
    ///
    /// If the key is already tracked, `policy` decides: with
    /// [`MergePolicy::None`] a record whose pending edits differ from
    /// `values` is a [`Error::Conflict`]; otherwise the tracked record wins.
    /// `KeepCurrent` always keeps the tracked record. `Overwrite` replaces
    /// the snapshots of an `Unchanged` or `Modified` record and resets it to
    /// `Unchanged`.
    pub fn attach(
        &mut self,
        meta: &EntityMeta,
        values: FieldValues,
        policy: MergePolicy,
    ) -> Result<RecordRef> {
        let values = values.conform(meta.table, meta.fields)?;
        let key = complete_key(meta, &values)?;
        let record_key = RecordKey::new(meta.table, key);
        let Some(existing) = self.records.get(&record_key).cloned() else {
            return Ok(self.create(record_key, meta, values, RecordState::Unchanged));
        };

        let (state, same) = {
            let guard = read_record(&existing);
            (guard.state(), guard.current() == &values)
        };
        match (policy, state) {
            (_, _) if same => Ok(existing),
            (MergePolicy::KeepCurrent, _) | (MergePolicy::None, RecordState::Unchanged) => {
                Ok(existing)
            }
            (MergePolicy::Overwrite, RecordState::Unchanged | RecordState::Modified) => {
                tracing::debug!(record = %record_key, "Overwriting tracked record on attach");
                write_record(&existing).overwrite(values);
                Ok(existing)
            }
            _ => Err(Error::Conflict(ConflictError {
                table: meta.table.to_string(),
                key: record_key.id.to_string(),
                message: format!("already tracked as {state:?} with different values"),
            })),
        }
    }

    /// Track a new record as `Added`.
    ///
    /// A NULL store-generated key gets a provisional id; any other key must
    /// be complete and not tracked yet.
    pub fn insert_added(&mut self, meta: &EntityMeta, values: FieldValues) -> Result<RecordRef> {
        let values = values.conform(meta.table, meta.fields)?;
        let record_key = self.reserve_key(meta, &values)?;
        tracing::trace!(record = %record_key, "Tracking added record");
        Ok(self.create(record_key, meta, values, RecordState::Added))
    }

    /// Re-track a detached record as `Added`, keeping the caller's instance.
    ///
    /// A store-generated key is cleared so the store assigns a fresh one.
    pub(crate) fn readd(&mut self, record: &RecordRef) -> Result<()> {
        let (meta, mut values) = {
            let guard = read_record(record);
            (*guard.meta(), guard.current().clone())
        };
        if let Some(column) = meta.generated_key() {
            values.set(column, Value::Null);
        }
        let record_key = self.reserve_key(&meta, &values)?;
        write_record(record).reset_added(record_key.clone(), values);
        self.records.insert(record_key, Arc::clone(record));
        Ok(())
    }

    fn reserve_key(&mut self, meta: &EntityMeta, values: &FieldValues) -> Result<RecordKey> {
        let pending_key = meta
            .generated_key()
            .is_some_and(|column| values.get(column).is_none_or(Value::is_null));
        let record_key = if pending_key {
            self.next_provisional += 1;
            RecordKey {
                table: meta.table,
                id: RecordId::Provisional(self.next_provisional),
            }
        } else {
            RecordKey::new(meta.table, complete_key(meta, values)?)
        };
        if self.records.contains_key(&record_key) {
            return Err(Error::Conflict(ConflictError {
                table: meta.table.to_string(),
                key: record_key.id.to_string(),
                message: "a record with this key is already tracked".to_string(),
            }));
        }
        Ok(record_key)
    }

    pub fn get(&self, key: &RecordKey) -> Option<RecordRef> {
        self.records.get(key).cloned()
    }

    pub fn get_by_key(&self, table: &'static str, key: PrimaryKey) -> Option<RecordRef> {
        self.get(&RecordKey::new(table, key))
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.records.contains_key(key)
    }

    /// Find a tracked record of `table` whose current `columns` equal `values`.
    ///
    /// Uses the key index when `columns` are the primary key columns.
    pub fn find_by_columns(
        &self,
        table: &'static str,
        columns: &[&str],
        values: &[Value],
    ) -> Option<RecordRef> {
        let by_key = self
            .records
            .iter()
            .find(|(k, _)| k.table == table)
            .is_some_and(|(_, r)| read_record(r).meta().primary_key == columns);
        if by_key {
            return self.get_by_key(table, PrimaryKey::new(values.to_vec()));
        }
        self.records_of(table).into_iter().find(|record| {
            let guard = read_record(record);
            columns
                .iter()
                .zip(values)
                .all(|(column, value)| guard.get(column) == Some(value))
        })
    }

    pub fn remove(&mut self, key: &RecordKey) -> Option<RecordRef> {
        self.records.remove(key)
    }

    /// Move a record to a new key. An existing entry at `new` is replaced.
    pub fn rekey(&mut self, old: &RecordKey, new: RecordKey) {
        if old == &new {
            return;
        }
        if let Some(record) = self.records.remove(old) {
            write_record(&record).rekey(new.clone());
            if let Some(replaced) = self.records.insert(new.clone(), record) {
                tracing::warn!(record = %new, "Rekey replaced an existing tracked record");
                write_record(&replaced).detach();
            }
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &RecordRef> {
        self.records.values()
    }

    /// Records of one entity type, in tracking order.
    pub fn records_of(&self, table: &str) -> Vec<RecordRef> {
        let mut out: Vec<(u64, RecordRef)> = self
            .records
            .iter()
            .filter(|(k, _)| k.table == table)
            .map(|(_, r)| (read_record(r).seq(), Arc::clone(r)))
            .collect();
        out.sort_unstable_by_key(|(seq, _)| *seq);
        out.into_iter().map(|(_, r)| r).collect()
    }

    /// All records in tracking order.
    pub fn ordered(&self) -> Vec<RecordRef> {
        let mut out: Vec<(u64, RecordRef)> = self
            .records
            .values()
            .map(|r| (read_record(r).seq(), Arc::clone(r)))
            .collect();
        out.sort_unstable_by_key(|(seq, _)| *seq);
        out.into_iter().map(|(_, r)| r).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Stop tracking everything; every record becomes `Detached`.
    pub fn clear(&mut self) {
        for (_, record) in self.records.drain() {
            write_record(&record).detach();
        }
    }
}

fn complete_key(meta: &EntityMeta, values: &FieldValues) -> Result<PrimaryKey> {
    values
        .key(meta.primary_key)
        .filter(PrimaryKey::is_complete)
        .ok_or_else(|| {
            Error::validation(
                ValidationErrorKind::Key,
                meta.table,
                "primary key is missing or NULL",
            )
        })
}
