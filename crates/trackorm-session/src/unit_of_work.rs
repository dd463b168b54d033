//! The unit of work: the scope across which records are tracked and
//! persisted together.
//!
//! A [`UnitOfWork`] owns an [`IdentityMap`] and a store driver. Every fetch
//! goes through the map, so two reads of the same key return the same
//! [`RecordRef`]. Edits stay in memory until [`UnitOfWork::commit`].
//!
//! Ending the unit of work (by [`UnitOfWork::end`] or by dropping it)
//! detaches every record; a lazy navigation read after that fails with
//! [`Error::DetachedAccess`].

use crate::change_tracker::{RecordRef, RecordState, read_record, write_record};
use crate::flush::{self, CommitResult};
use crate::identity_map::{IdentityMap, MergePolicy};
use crate::relationship::{Loaded, NavigationLoader};
use crate::{SessionConfig, relationship};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use trackorm_core::{
    CancellationToken, Entity, EntityMeta, EntityRegistry, Error, FieldValues, NavigationInfo,
    NavigationKind, PrimaryKey, Result, StoreDriver, TypeError, ValidationError,
    ValidationErrorKind, Value, sql,
};

/// State shared between a unit of work and the navigation slots of its records.
struct Inner<D: StoreDriver + 'static> {
    driver: D,
    registry: Arc<EntityRegistry>,
    config: SessionConfig,
    map: Mutex<IdentityMap>,
    open: AtomicBool,
}

impl<D: StoreDriver + 'static> Inner<D> {
    fn lock_map(&self) -> MutexGuard<'_, IdentityMap> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn meta(&self, table: &str) -> Result<EntityMeta> {
        self.registry.require(table).copied()
    }

    /// Plain SELECT of `meta` rows, routed through the identity map.
    fn fetch(&self, meta: &EntityMeta, filters: &[(&str, &Value)]) -> Result<Vec<RecordRef>> {
        let statement = sql::select_where(self.driver.dialect(), meta, filters);
        tracing::trace!(sql = %statement.sql, "Fetching");
        let rows = self.driver.execute_query(&statement.sql, &statement.params)?;
        let mut loaded = Vec::with_capacity(rows.len());
        for row in &rows {
            let values = FieldValues::from_row(meta.fields, row, None)?;
            if let Some(key) = values.key(meta.primary_key).filter(PrimaryKey::is_complete) {
                loaded.push((key, values));
            }
        }

        let mut map = self.lock_map();
        loaded
            .into_iter()
            .map(|(key, values)| map.get_or_create(meta, key, values))
            .collect()
    }

    /// SELECT of `meta` rows with every eager navigation joined in.
    #[tracing::instrument(level = "debug", skip(self, filters), fields(table = meta.table))]
    fn fetch_graph(&self, meta: &EntityMeta, filters: &[(&str, &Value)]) -> Result<Vec<RecordRef>> {
        let eager: Vec<(&'static NavigationInfo, EntityMeta)> = meta
            .navigations
            .iter()
            .filter(|nav| nav.is_eager())
            .map(|nav| self.meta(nav.target).map(|target| (nav, target)))
            .collect::<Result<_>>()?;
        if eager.is_empty() {
            return self.fetch(meta, filters);
        }

        let joins: Vec<(&NavigationInfo, &EntityMeta)> =
            eager.iter().map(|(nav, target)| (*nav, target)).collect();
        let statement = sql::select_joined(self.driver.dialect(), meta, &joins, filters);
        tracing::trace!(sql = %statement.sql, "Fetching with eager joins");
        let rows = self.driver.execute_query(&statement.sql, &statement.params)?;

        // Owner values plus, per eager navigation, the joined target (if any).
        let mut parsed = Vec::with_capacity(rows.len());
        for row in &rows {
            let owner = FieldValues::from_row(meta.fields, row, Some("t0"))?;
            let Some(owner_key) = owner.key(meta.primary_key).filter(PrimaryKey::is_complete) else {
                continue;
            };
            let mut targets = Vec::with_capacity(eager.len());
            for (i, (_, target)) in eager.iter().enumerate() {
                let prefix = format!("t{}", i + 1);
                let values = FieldValues::from_row(target.fields, row, Some(prefix.as_str()))?;
                let key = values.key(target.primary_key).filter(PrimaryKey::is_complete);
                targets.push(key.map(|key| (key, values)));
            }
            parsed.push((owner_key, owner, targets));
        }

        let mut map = self.lock_map();
        let mut owners: Vec<RecordRef> = Vec::new();
        let mut joined: Vec<Vec<Vec<RecordRef>>> = Vec::new();
        for (owner_key, owner_values, targets) in parsed {
            let owner = map.get_or_create(meta, owner_key, owner_values)?;
            let slot = match owners.iter().position(|o| Arc::ptr_eq(o, &owner)) {
                Some(i) => i,
                None => {
                    owners.push(owner);
                    joined.push(vec![Vec::new(); eager.len()]);
                    owners.len() - 1
                }
            };
            for (i, target) in targets.into_iter().enumerate() {
                let Some((key, values)) = target else {
                    continue;
                };
                let record = map.get_or_create(&eager[i].1, key, values)?;
                let related = &mut joined[slot][i];
                if !related.iter().any(|r| Arc::ptr_eq(r, &record)) {
                    related.push(record);
                }
            }
        }

        for (owner, related) in owners.iter().zip(joined) {
            // Joined rows reflect stored foreign keys, which a pending edit may have changed.
            if read_record(owner).state() != RecordState::Unchanged {
                continue;
            }
            for ((nav, _), records) in eager.iter().zip(related) {
                let slot = read_record(owner).navigation(nav.name)?;
                let loaded = match nav.kind {
                    NavigationKind::OneToMany => Loaded::Many(records),
                    NavigationKind::ManyToOne => {
                        Loaded::One(records.first().map(Arc::downgrade))
                    }
                };
                slot.prefill(loaded);
            }
        }
        tracing::debug!(owners = owners.len(), "Eager fetch routed");
        Ok(owners)
    }
}

impl<D: StoreDriver + 'static> NavigationLoader for Inner<D> {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn fetch_matching(
        &self,
        target: &'static str,
        columns: &[&'static str],
        values: &[Value],
    ) -> Result<Vec<RecordRef>> {
        let meta = self.meta(target)?;
        let filters: Vec<(&str, &Value)> = columns.iter().copied().zip(values).collect();
        // Targets reached lazily still bring their own eager navigations.
        self.fetch_graph(&meta, &filters)
    }

    fn inspect(&self, f: &mut dyn FnMut(&IdentityMap)) {
        f(&self.lock_map());
    }
}

fn invalid_state(table: &str, message: impl Into<String>) -> Error {
    Error::validation(ValidationErrorKind::InvalidState, table, message)
}

/// Tracks records loaded from and added to one store, and commits their
/// changes in one transaction.
///
/// All methods take `&self`. A unit of work is not meant for concurrent
/// mutation, but its records can be read from several threads.
pub struct UnitOfWork<D: StoreDriver + 'static> {
    inner: Arc<Inner<D>>,
}

impl<D: StoreDriver + 'static> UnitOfWork<D> {
    pub fn new(driver: D, registry: Arc<EntityRegistry>) -> Self {
        Self::with_config(driver, registry, SessionConfig::default())
    }

    pub fn with_config(driver: D, registry: Arc<EntityRegistry>, config: SessionConfig) -> Self {
        let inner = Arc::new_cyclic(|me: &Weak<Inner<D>>| {
            let loader: Weak<dyn NavigationLoader> = me.clone();
            Inner {
                driver,
                registry,
                config,
                map: Mutex::new(IdentityMap::with_loader(loader)),
                open: AtomicBool::new(true),
            }
        });
        tracing::debug!(tables = inner.registry.len(), "Unit of work opened");
        Self { inner }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.inner.registry
    }

    pub fn driver(&self) -> &D {
        &self.inner.driver
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Look a record up by key: first in the identity map, then in the store.
    ///
    /// A record deleted in this unit of work is reported as absent.
    pub fn find(&self, table: &str, key: impl Into<PrimaryKey>) -> Result<Option<RecordRef>> {
        let meta = self.inner.meta(table)?;
        let key = key.into();
        if key.values().len() != meta.primary_key.len() || !key.is_complete() {
            return Err(Error::validation(
                ValidationErrorKind::Key,
                meta.table,
                format!("{key} does not match key columns {:?}", meta.primary_key),
            ));
        }
        let tracked = self.inner.lock_map().get_by_key(meta.table, key.clone());
        if let Some(record) = tracked {
            let live = read_record(&record).state().is_live();
            return Ok(live.then_some(record));
        }
        let filters: Vec<(&str, &Value)> = meta
            .primary_key
            .iter()
            .copied()
            .zip(key.values())
            .collect();
        Ok(self.inner.fetch_graph(&meta, &filters)?.into_iter().next())
    }

    /// [`find`](Self::find), materialized as a typed entity.
    pub fn find_entity<E: Entity>(&self, key: impl Into<PrimaryKey>) -> Result<Option<E>> {
        self.find(E::TABLE_NAME, key)?
            .map(|record| read_record(&record).to_entity::<E>())
            .transpose()
    }

    /// Fetch every row of `table` whose columns equal the given values.
    pub fn load_where(&self, table: &str, filters: &[(&str, Value)]) -> Result<Vec<RecordRef>> {
        let meta = self.inner.meta(table)?;
        if let Some((column, _)) = filters.iter().find(|(c, _)| meta.field(c).is_none()) {
            return Err(ValidationError::new(
                ValidationErrorKind::UnknownField,
                meta.table,
                "filter on an undeclared column",
            )
            .with_field(*column)
            .into());
        }
        let filters: Vec<(&str, &Value)> = filters.iter().map(|(c, v)| (*c, v)).collect();
        let records = self.inner.fetch_graph(&meta, &filters)?;
        Ok(records
            .into_iter()
            .filter(|r| read_record(r).state().is_live())
            .collect())
    }

    pub fn load_all(&self, table: &str) -> Result<Vec<RecordRef>> {
        self.load_where(table, &[])
    }

    /// Number of rows stored in an entity's table.
    pub fn count<E: Entity>(&self) -> Result<u64> {
        self.count_table(E::TABLE_NAME)
    }

    pub fn count_table(&self, table: &str) -> Result<u64> {
        let meta = self.inner.meta(table)?;
        let statement = sql::count(self.inner.driver.dialect(), meta.table, &[]);
        let rows = self
            .inner
            .driver
            .execute_query(&statement.sql, &statement.params)?;
        let count = match rows.first() {
            Some(row) => row.get_named::<i64>("count")?,
            None => 0,
        };
        u64::try_from(count).map_err(|_| {
            Error::Type(TypeError {
                expected: "non-negative count",
                actual: count.to_string(),
                column: Some("count".to_string()),
            })
        })
    }

    // ========================================================================
    // Tracking
    // ========================================================================

    /// Track a loaded row; an already tracked key returns the existing record.
    pub fn get_or_create(
        &self,
        table: &str,
        key: impl Into<PrimaryKey>,
        values: FieldValues,
    ) -> Result<RecordRef> {
        let meta = self.inner.meta(table)?;
        self.inner.lock_map().get_or_create(&meta, key.into(), values)
    }

    /// Track a detached copy of a persisted row using the configured merge policy.
    pub fn attach(&self, table: &str, values: FieldValues) -> Result<RecordRef> {
        self.attach_with(table, values, self.inner.config.merge_policy)
    }

    pub fn attach_with(
        &self,
        table: &str,
        values: FieldValues,
        policy: MergePolicy,
    ) -> Result<RecordRef> {
        let meta = self.inner.meta(table)?;
        self.inner.lock_map().attach(&meta, values, policy)
    }

    pub fn attach_entity<E: Entity>(&self, entity: &E) -> Result<RecordRef> {
        self.attach(E::TABLE_NAME, entity.to_values())
    }

    /// Track a new record, inserted on commit.
    pub fn add(&self, table: &str, values: FieldValues) -> Result<RecordRef> {
        let meta = self.inner.meta(table)?;
        let record = self.inner.lock_map().insert_added(&meta, values)?;
        tracing::debug!(record = %read_record(&record).key(), "Record added");
        Ok(record)
    }

    pub fn add_entity<E: Entity>(&self, entity: &E) -> Result<RecordRef> {
        self.add(E::TABLE_NAME, entity.to_values())
    }

    /// Track a detached record again as new.
    ///
    /// A store-generated key is cleared so the store assigns a fresh one;
    /// other keys must not be tracked already.
    pub fn mark_added(&self, record: &RecordRef) -> Result<()> {
        let mut map = self.inner.lock_map();
        let (state, table) = {
            let guard = read_record(record);
            (guard.state(), guard.table())
        };
        match state {
            RecordState::Added => Ok(()),
            RecordState::Detached => map.readd(record),
            _ => Err(invalid_state(
                table,
                format!("only a detached record can be added again, not a {state:?} one"),
            )),
        }
    }

    /// Write one field; see [`TrackedRecord::set_field`](crate::TrackedRecord::set_field).
    pub fn set_field(&self, record: &RecordRef, field: &str, value: impl Into<Value>) -> Result<bool> {
        write_record(record).set_field(field, value)
    }

    /// Flag a record for deletion.
    ///
    /// An `Added` record is simply dropped from the unit of work. Deleting a
    /// `Deleted` record again does nothing.
    pub fn mark_deleted(&self, record: &RecordRef) -> Result<()> {
        let mut map = self.inner.lock_map();
        let mut guard = write_record(record);
        match guard.state() {
            RecordState::Detached => Err(invalid_state(guard.table(), "record is not tracked")),
            RecordState::Deleted => Ok(()),
            _ => {
                if !guard.mark_deleted() {
                    let key = guard.key().clone();
                    guard.detach();
                    drop(guard);
                    map.remove(&key);
                    tracing::debug!(record = %key, "Added record discarded");
                }
                Ok(())
            }
        }
    }

    /// Point `child`'s many-to-one `navigation` at `parent`.
    ///
    /// If the parent's key is known the foreign key columns are written now;
    /// otherwise they are filled in at commit, after the parent is inserted.
    pub fn link(&self, child: &RecordRef, navigation: &str, parent: &RecordRef) -> Result<()> {
        let (child_table, nav) = {
            let guard = read_record(child);
            let nav = guard.meta().navigation(navigation).ok_or_else(|| {
                Error::Validation(
                    ValidationError::new(
                        ValidationErrorKind::Unknown,
                        guard.table(),
                        "no such navigation",
                    )
                    .with_field(navigation),
                )
            })?;
            (guard.table(), nav)
        };
        if nav.kind != NavigationKind::ManyToOne {
            return Err(invalid_state(
                child_table,
                format!("'{}' is not a many-to-one navigation", nav.name),
            ));
        }
        let parent_values = {
            let guard = read_record(parent);
            if guard.table() != nav.target {
                return Err(Error::validation(
                    ValidationErrorKind::Unknown,
                    child_table,
                    format!("'{}' expects a {}, not a {}", nav.name, nav.target, guard.table()),
                ));
            }
            if !guard.state().is_live() {
                return Err(invalid_state(
                    nav.target,
                    format!("cannot link to a {:?} record", guard.state()),
                ));
            }
            nav.remote_columns
                .iter()
                .map(|c| guard.get(c).cloned().unwrap_or(Value::Null))
                .collect::<Vec<_>>()
        };

        let mut guard = write_record(child);
        if !guard.state().is_live() {
            return Err(invalid_state(
                child_table,
                format!("cannot link from a {:?} record", guard.state()),
            ));
        }
        if PrimaryKey::new(parent_values.clone()).is_complete() {
            for (column, value) in nav.local_columns.iter().zip(parent_values) {
                guard.set_field(column, value)?;
            }
        } else {
            guard.touch();
        }
        guard.set_link(nav.name, Arc::downgrade(parent));
        Ok(())
    }

    /// Stop tracking a record. It keeps its values and becomes `Detached`.
    pub fn detach(&self, record: &RecordRef) {
        let mut map = self.inner.lock_map();
        let key = read_record(record).key().clone();
        if map.get(&key).is_some_and(|tracked| Arc::ptr_eq(&tracked, record)) {
            map.remove(&key);
        }
        write_record(record).detach();
    }

    pub fn is_tracked(&self, record: &RecordRef) -> bool {
        let key = read_record(record).key().clone();
        self.inner
            .lock_map()
            .get(&key)
            .is_some_and(|tracked| Arc::ptr_eq(&tracked, record))
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.lock_map().len()
    }

    /// Every tracked record with pending changes, in tracking order.
    pub fn snapshot(&self) -> Vec<RecordRef> {
        self.inner
            .lock_map()
            .ordered()
            .into_iter()
            .filter(|r| read_record(r).state() != RecordState::Unchanged)
            .collect()
    }

    pub fn has_changes(&self) -> bool {
        !self.snapshot().is_empty()
    }

    // ========================================================================
    // Navigation
    // ========================================================================

    pub fn related(&self, record: &RecordRef, navigation: &str) -> Result<Vec<RecordRef>> {
        relationship::related(record, navigation)
    }

    pub fn related_one(&self, record: &RecordRef, navigation: &str) -> Result<Option<RecordRef>> {
        relationship::related_one(record, navigation)
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Write every pending change in one transaction.
    pub fn commit(&self) -> Result<CommitResult> {
        self.commit_with_cancel(&CancellationToken::new())
    }

    /// [`commit`](Self::commit), abandoned if `token` is cancelled before the
    /// transaction begins.
    pub fn commit_with_cancel(&self, token: &CancellationToken) -> Result<CommitResult> {
        let mut map = self.inner.lock_map();
        flush::commit(
            &mut map,
            &self.inner.registry,
            &self.inner.driver,
            &self.inner.config,
            token,
        )
    }

    /// End the unit of work, discarding all tracking state.
    pub fn end(self) {
        drop(self);
    }
}

impl<D: StoreDriver + 'static> Drop for UnitOfWork<D> {
    fn drop(&mut self) {
        self.inner.open.store(false, Ordering::Release);
        let mut map = self.inner.lock_map();
        let tracked = map.len();
        map.clear();
        tracing::debug!(tracked, "Unit of work ended");
    }
}

impl<D: StoreDriver + 'static> std::fmt::Debug for UnitOfWork<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("tracked", &self.tracked_count())
            .field("open", &self.inner.open.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockDriver, customer_values, invoice_values, registry};

    fn uow() -> UnitOfWork<Arc<MockDriver>> {
        let driver = Arc::new(MockDriver::new());
        driver.seed("customer", customer_values(1, "Acme"));
        driver.seed("customer", customer_values(2, "Globex"));
        driver.seed("invoice", invoice_values(10, 1, 50.0));
        driver.seed("invoice", invoice_values(11, 1, 75.0));
        driver.seed("invoice", invoice_values(12, 2, 20.0));
        UnitOfWork::new(driver, Arc::new(registry()))
    }

    #[test]
    fn test_find_uses_identity_map() {
        let uow = uow();
        let a = uow.find("customer", 1).unwrap().unwrap();
        let b = uow.find("customer", 1).unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(uow.driver().query_count(), 1);
        assert_eq!(read_record(&a).state(), RecordState::Unchanged);
        assert!(uow.find("customer", 99).unwrap().is_none());
    }

    #[test]
    fn test_find_rejects_wrong_key_arity() {
        let uow = uow();
        let err = uow
            .find("customer", vec![Value::BigInt(1), Value::BigInt(2)])
            .unwrap_err();
        assert!(matches!(err, Error::Validation(v) if v.kind == ValidationErrorKind::Key));
        assert!(matches!(uow.find("nope", 1), Err(Error::Validation(_))));
    }

    #[test]
    fn test_lazy_navigation_fetches_once() {
        let uow = uow();
        let customer = uow.find("customer", 1).unwrap().unwrap();
        let invoices = uow.related(&customer, "invoices").unwrap();
        assert_eq!(invoices.len(), 2);
        let queries = uow.driver().query_count();
        assert_eq!(uow.related(&customer, "invoices").unwrap().len(), 2);
        assert_eq!(uow.driver().query_count(), queries);

        // The reverse navigation finds the tracked customer without a query.
        let parent = uow.related_one(&invoices[0], "customer").unwrap().unwrap();
        assert!(Arc::ptr_eq(&parent, &customer));
        assert_eq!(uow.driver().query_count(), queries);
    }

    #[test]
    fn test_loaded_invoice_shared_with_navigation() {
        let uow = uow();
        let invoice = uow.find("invoice", 10).unwrap().unwrap();
        let customer = uow.find("customer", 1).unwrap().unwrap();
        let invoices = uow.related(&customer, "invoices").unwrap();
        assert!(invoices.iter().any(|i| Arc::ptr_eq(i, &invoice)));
        assert_eq!(uow.tracked_count(), 3);
    }

    #[test]
    fn test_added_child_appears_in_parent_collection() {
        let uow = uow();
        let customer = uow.find("customer", 2).unwrap().unwrap();
        let invoice = uow
            .add("invoice", FieldValues::new().with("total", 5.0))
            .unwrap();
        uow.link(&invoice, "customer", &customer).unwrap();
        assert_eq!(read_record(&invoice).get("customer_id"), Some(&Value::BigInt(2)));
        assert_eq!(uow.related(&customer, "invoices").unwrap().len(), 2);

        let result = uow.commit().unwrap();
        assert_eq!(result.inserted, 1);
        assert_eq!(read_record(&invoice).state(), RecordState::Unchanged);
    }

    #[test]
    fn test_link_to_added_parent_patches_at_commit() {
        let uow = uow();
        let customer = uow
            .add("customer", FieldValues::new().with("legal_name", "Initech"))
            .unwrap();
        let invoice = uow
            .add("invoice", FieldValues::new().with("total", 5.0))
            .unwrap();
        uow.link(&invoice, "customer", &customer).unwrap();
        assert!(read_record(&invoice).get("customer_id").unwrap().is_null());
        assert!(Arc::ptr_eq(
            &uow.related_one(&invoice, "customer").unwrap().unwrap(),
            &customer
        ));

        uow.commit().unwrap();
        let customer_id = read_record(&customer).get("customer_id").cloned().unwrap();
        assert!(!customer_id.is_null());
        assert_eq!(read_record(&invoice).get("customer_id"), Some(&customer_id));
    }

    #[test]
    fn test_link_validates_navigation() {
        let uow = uow();
        let customer = uow.find("customer", 1).unwrap().unwrap();
        let invoice = uow.find("invoice", 10).unwrap().unwrap();
        assert!(uow.link(&customer, "invoices", &invoice).is_err());
        assert!(uow.link(&invoice, "supplier", &customer).is_err());
        assert!(uow.link(&invoice, "customer", &invoice).is_err());
    }

    #[test]
    fn test_remove_added_record_discards_it() {
        let uow = uow();
        let customer = uow
            .add("customer", FieldValues::new().with("legal_name", "Temp"))
            .unwrap();
        uow.mark_deleted(&customer).unwrap();
        assert_eq!(read_record(&customer).state(), RecordState::Detached);
        assert_eq!(uow.tracked_count(), 0);
        assert!(!uow.has_changes());
        assert!(uow.mark_deleted(&customer).is_err());

        uow.mark_added(&customer).unwrap();
        assert_eq!(read_record(&customer).state(), RecordState::Added);
        assert!(uow.is_tracked(&customer));
    }

    #[test]
    fn test_removed_record_is_not_found() {
        let uow = uow();
        let invoice = uow.find("invoice", 12).unwrap().unwrap();
        uow.mark_deleted(&invoice).unwrap();
        assert!(uow.find("invoice", 12).unwrap().is_none());
        assert_eq!(uow.snapshot().len(), 1);

        let result = uow.commit().unwrap();
        assert_eq!(result.deleted, 1);
        assert!(!uow.is_tracked(&invoice));
    }

    #[test]
    fn test_attach_conflict_and_config_policy() {
        let uow = uow();
        let customer = uow.find("customer", 1).unwrap().unwrap();
        uow.set_field(&customer, "legal_name", "Acme Ltd").unwrap();
        assert!(matches!(
            uow.attach("customer", customer_values(1, "Stale")),
            Err(Error::Conflict(_))
        ));

        let driver = Arc::new(MockDriver::new());
        let keep = UnitOfWork::with_config(
            driver,
            Arc::new(registry()),
            SessionConfig::default().merge_policy(MergePolicy::KeepCurrent),
        );
        let a = keep.attach("customer", customer_values(5, "A")).unwrap();
        keep.set_field(&a, "legal_name", "B").unwrap();
        let b = keep.attach("customer", customer_values(5, "C")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(read_record(&b).get("legal_name"), Some(&Value::from("B")));
    }

    #[test]
    fn test_count() {
        let uow = uow();
        assert_eq!(uow.count_table("invoice").unwrap(), 3);
        assert_eq!(uow.count_table("line_item").unwrap(), 0);
    }

    #[test]
    fn test_load_where_filters() {
        let uow = uow();
        let invoices = uow
            .load_where("invoice", &[("customer_id", Value::BigInt(1))])
            .unwrap();
        assert_eq!(invoices.len(), 2);
        assert!(uow.load_where("invoice", &[("nope", Value::Null)]).is_err());
        assert_eq!(uow.load_all("customer").unwrap().len(), 2);
    }

    #[test]
    fn test_navigation_after_end_is_detached_access() {
        let uow = uow();
        let customer = uow.find("customer", 1).unwrap().unwrap();
        uow.end();
        assert_eq!(read_record(&customer).state(), RecordState::Detached);
        let err = relationship::related(&customer, "invoices").unwrap_err();
        assert!(matches!(err, Error::DetachedAccess(d) if d.table == "customer" && d.navigation == "invoices"));
    }

    #[test]
    fn test_commit_through_shared_driver() {
        let uow = uow();
        let customer = uow.find("customer", 1).unwrap().unwrap();
        uow.set_field(&customer, "gstin", "29ABCDE1234F1Z5").unwrap();
        assert!(uow.has_changes());
        let result = uow.commit().unwrap();
        assert_eq!(result.updated, 1);
        assert!(!uow.has_changes());
        let log = uow.driver().log();
        assert!(log.iter().any(|s| s == "COMMIT"));
    }
}
