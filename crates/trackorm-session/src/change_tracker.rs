//! Change tracking for records held by a unit of work.
//!
//! Every tracked record keeps two field snapshots:
//!
//! - **original**: the values as loaded from (or last written to) the store
//! - **current**: the live values, edited through [`TrackedRecord::set_field`]
//!
//! plus a [`RecordState`] tag. A record moves to `Modified` the first time a
//! write makes a current value diverge from its original value and stays
//! there until the next successful commit, even if later writes restore the
//! original value.

use crate::relationship::{NavigationLoader, NavigationSlot};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use trackorm_core::{
    Entity, EntityMeta, Error, FieldValues, FromValue, NavigationKind, PrimaryKey, Result,
    ValidationError, ValidationErrorKind, Value,
};

/// Shared handle to a tracked record.
pub type RecordRef = Arc<RwLock<TrackedRecord>>;

/// Lifecycle state of a tracked record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RecordState {
    /// Loaded or attached; current values equal the original snapshot.
    Unchanged,
    /// New; inserted on commit.
    Added,
    /// At least one field diverged from the original snapshot; updated on commit.
    Modified,
    /// Deleted on commit; stays in the identity map until then.
    Deleted,
    /// No longer tracked by any unit of work.
    Detached,
}

impl RecordState {
    /// Whether the record still counts as existing for navigation reads.
    pub const fn is_live(self) -> bool {
        matches!(
            self,
            RecordState::Unchanged | RecordState::Added | RecordState::Modified
        )
    }
}

/// The identity of a row within one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum RecordId {
    /// The real primary key.
    Key(PrimaryKey),
    /// Stand-in for a store-generated key that is not known yet.
    Provisional(u64),
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Key(key) => write!(f, "{key}"),
            RecordId::Provisional(n) => write!(f, "provisional#{n}"),
        }
    }
}

/// Identity-map key: entity type (by table) plus row identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RecordKey {
    pub table: &'static str,
    pub id: RecordId,
}

impl RecordKey {
    pub fn new(table: &'static str, key: PrimaryKey) -> Self {
        Self {
            table,
            id: RecordId::Key(key),
        }
    }

    pub fn primary_key(&self) -> Option<&PrimaryKey> {
        match &self.id {
            RecordId::Key(key) => Some(key),
            RecordId::Provisional(_) => None,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self.id, RecordId::Provisional(_))
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.table, self.id)
    }
}

/// A record tracked by a unit of work.
pub struct TrackedRecord {
    key: RecordKey,
    meta: EntityMeta,
    original: FieldValues,
    current: FieldValues,
    state: RecordState,
    /// Creation order within the unit of work; breaks ties when ordering inserts.
    seq: u64,
    navigations: HashMap<&'static str, Arc<NavigationSlot>>,
    /// Pending parent references set with `link`, by many-to-one navigation name.
    links: HashMap<&'static str, Weak<RwLock<TrackedRecord>>>,
}

impl fmt::Debug for TrackedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedRecord")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

impl TrackedRecord {
    /// Build a record inside `Arc::new_cyclic` so its navigation slots can
    /// point back at it.
    pub(crate) fn create(
        key: RecordKey,
        meta: EntityMeta,
        values: FieldValues,
        state: RecordState,
        seq: u64,
        loader: Option<Weak<dyn NavigationLoader>>,
    ) -> RecordRef {
        Arc::new_cyclic(|me| {
            let navigations = meta
                .navigations
                .iter()
                .map(|nav| {
                    let slot = NavigationSlot::new(nav, meta.table, me.clone(), loader.clone());
                    (nav.name, Arc::new(slot))
                })
                .collect();
            RwLock::new(TrackedRecord {
                key,
                meta,
                original: values.clone(),
                current: values,
                state,
                seq,
                navigations,
                links: HashMap::new(),
            })
        })
    }

    pub fn key(&self) -> &RecordKey {
        &self.key
    }

    pub fn table(&self) -> &'static str {
        self.meta.table
    }

    pub fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    pub fn original(&self) -> &FieldValues {
        &self.original
    }

    pub fn current(&self) -> &FieldValues {
        &self.current
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.current.get(field)
    }

    pub fn get_as<T: FromValue>(&self, field: &str) -> Result<T> {
        self.current.get_as(field)
    }

    /// Fields whose current value differs from the original snapshot.
    pub fn changed_fields(&self) -> Vec<&'static str> {
        self.current
            .iter()
            .filter(|(name, value)| self.original.get(name) != Some(*value))
            .map(|(name, _)| name)
            .collect()
    }

    /// Set one field.
    ///
    /// Returns whether the stored value changed. Writing the value a field
    /// already holds is a no-op. Key columns can only be written while the
    /// record is `Added`.
    pub fn set_field(&mut self, field: &str, value: impl Into<Value>) -> Result<bool> {
        let value = value.into();
        let Some(info) = self.meta.field(field) else {
            return Err(ValidationError::new(
                ValidationErrorKind::UnknownField,
                self.meta.table,
                "field is not declared on the entity",
            )
            .with_field(field)
            .into());
        };
        match self.state {
            RecordState::Deleted | RecordState::Detached => {
                return Err(ValidationError::new(
                    ValidationErrorKind::InvalidState,
                    self.meta.table,
                    format!("cannot write to a {:?} record {}", self.state, self.key),
                )
                .with_field(field)
                .into());
            }
            RecordState::Unchanged | RecordState::Modified if info.primary_key => {
                return Err(ValidationError::new(
                    ValidationErrorKind::InvalidState,
                    self.meta.table,
                    "primary key of a persisted record cannot change",
                )
                .with_field(field)
                .into());
            }
            _ => {}
        }

        let value = info.coerce(value);
        if self.current.get(info.name) == Some(&value) {
            return Ok(false);
        }
        let diverges = self.original.get(info.name) != Some(&value);
        self.current.set(info.name, value);
        if diverges && self.state == RecordState::Unchanged {
            self.state = RecordState::Modified;
            tracing::trace!(record = %self.key, field = info.name, "Record modified");
        }
        self.forget_reference(info.name);
        Ok(true)
    }

    /// A write to a foreign key column invalidates the many-to-one
    /// navigations over it, including any pending link.
    fn forget_reference(&mut self, column: &str) {
        for nav in self.meta.navigations {
            if nav.kind == NavigationKind::ManyToOne && nav.local_columns.contains(&column) {
                self.links.remove(nav.name);
                self.reset_navigation(nav.name);
            }
        }
    }

    pub(crate) fn reset_navigation(&mut self, name: &str) {
        if let Some(slot) = self.navigations.get_mut(name) {
            *slot = Arc::new(slot.fresh());
        }
    }

    /// The navigation slot named `name`.
    pub fn navigation(&self, name: &str) -> Result<Arc<NavigationSlot>> {
        self.navigations.get(name).cloned().ok_or_else(|| {
            ValidationError::new(
                ValidationErrorKind::Unknown,
                self.meta.table,
                "no such navigation",
            )
            .with_field(name)
            .into()
        })
    }

    pub(crate) fn links(&self) -> impl Iterator<Item = (&'static str, &Weak<RwLock<TrackedRecord>>)> {
        self.links.iter().map(|(name, parent)| (*name, parent))
    }

    pub(crate) fn link_target(&self, navigation: &str) -> Option<&Weak<RwLock<TrackedRecord>>> {
        self.links.get(navigation)
    }

    pub(crate) fn set_link(&mut self, navigation: &'static str, parent: Weak<RwLock<TrackedRecord>>) {
        self.links.insert(navigation, parent);
        self.reset_navigation(navigation);
    }

    /// Start over as a new record under `key`.
    pub(crate) fn reset_added(&mut self, key: RecordKey, values: FieldValues) {
        self.key = key;
        self.current = values;
        self.state = RecordState::Added;
        let names: Vec<_> = self.navigations.keys().copied().collect();
        for name in names {
            self.reset_navigation(name);
        }
    }

    /// Flag for deletion. Returns `false` when the record was `Added`, in
    /// which case nothing has to reach the store and the caller detaches it.
    pub(crate) fn mark_deleted(&mut self) -> bool {
        match self.state {
            RecordState::Added => false,
            _ => {
                self.state = RecordState::Deleted;
                true
            }
        }
    }

    /// Mark an unchanged record as modified without writing a field, for a
    /// link whose foreign key value is only known at commit.
    pub(crate) fn touch(&mut self) {
        if self.state == RecordState::Unchanged {
            self.state = RecordState::Modified;
        }
    }

    /// Make the current values the new original snapshot.
    pub(crate) fn accept_changes(&mut self) {
        self.original = self.current.clone();
        self.state = RecordState::Unchanged;
        self.links.clear();
    }

    /// Replace both snapshots and reset to `Unchanged`.
    pub(crate) fn overwrite(&mut self, values: FieldValues) {
        self.original = values.clone();
        self.current = values;
        self.state = RecordState::Unchanged;
        self.links.clear();
        let names: Vec<_> = self.navigations.keys().copied().collect();
        for name in names {
            self.reset_navigation(name);
        }
    }

    pub(crate) fn commit_values(&mut self, values: FieldValues) {
        self.current = values;
        self.accept_changes();
    }

    pub(crate) fn rekey(&mut self, key: RecordKey) {
        self.key = key;
    }

    pub(crate) fn detach(&mut self) {
        self.state = RecordState::Detached;
        self.links.clear();
    }

    /// Materialize the current values as a typed entity.
    pub fn to_entity<E: Entity>(&self) -> Result<E> {
        if self.meta.table != E::TABLE_NAME {
            return Err(Error::validation(
                ValidationErrorKind::Unknown,
                self.meta.table,
                format!("record is not a '{}'", E::TABLE_NAME),
            ));
        }
        E::from_values(&self.current)
    }

    /// Dump the record for logs and debugging.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "table": self.meta.table,
            "key": self.key.id.to_string(),
            "state": self.state,
            "original": self.original.to_json(),
            "current": self.current.to_json(),
        })
    }
}

/// Read-lock a record, recovering from poisoning.
pub fn read_record(record: &RecordRef) -> RwLockReadGuard<'_, TrackedRecord> {
    record.read().unwrap_or_else(PoisonError::into_inner)
}

/// Write-lock a record, recovering from poisoning.
pub fn write_record(record: &RecordRef) -> RwLockWriteGuard<'_, TrackedRecord> {
    record.write().unwrap_or_else(PoisonError::into_inner)
}
