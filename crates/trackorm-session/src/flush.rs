//! Commit planning and execution.
//!
//! A commit runs in three phases:
//!
//! 1. **Plan**: partition the tracked records by state, resolve pending
//!    links, validate required references and deletions, and order the
//!    statements. No write is sent while planning.
//! 2. **Execute**: run every statement inside one transaction:
//!    INSERT parent-first, then UPDATE, then DELETE child-first.
//! 3. **Apply**: only after the transaction commits are the tracked records
//!    touched. A failed commit leaves every record with its pre-commit
//!    state, values and key.

use crate::change_tracker::{
    RecordKey, RecordRef, RecordState, TrackedRecord, read_record, write_record,
};
use crate::identity_map::IdentityMap;
use crate::{SessionConfig, UpdateMode};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Instant;
use trackorm_core::{
    CancellationToken, Dependent, EntityMeta, EntityRegistry, Error, FieldValues, NavigationInfo,
    NavigationKind, PersistOperation, PersistenceError, PrimaryKey, Result, StoreDriver,
    ValidationError, ValidationErrorKind, Value, sql,
};

/// Number of rows written by a commit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommitResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl CommitResult {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

/// Copy `parent_columns` of an inserted record into `columns` once its key is known.
#[derive(Debug, Clone, Copy)]
struct KeyPatch {
    columns: &'static [&'static str],
    parent_columns: &'static [&'static str],
    /// Index of the parent in the insert list
    parent: usize,
}

struct PendingInsert {
    record: RecordRef,
    key: RecordKey,
    meta: EntityMeta,
    seq: u64,
    values: FieldValues,
    patches: Vec<KeyPatch>,
}

struct PendingUpdate {
    record: RecordRef,
    key: PrimaryKey,
    meta: EntityMeta,
    original: FieldValues,
    values: FieldValues,
    patches: Vec<KeyPatch>,
}

struct PendingDelete {
    record: RecordRef,
    record_key: RecordKey,
    key: PrimaryKey,
    meta: EntityMeta,
    seq: u64,
    original: FieldValues,
}

/// Where the links of a planned record are resolved into.
#[derive(Clone, Copy)]
enum LinkOwner {
    Insert(usize),
    Update(usize),
}

type PendingLinks = Vec<(&'static NavigationInfo, Weak<RwLock<TrackedRecord>>)>;

/// Ordered statements for one commit.
pub(crate) struct FlushPlan {
    inserts: Vec<PendingInsert>,
    updates: Vec<PendingUpdate>,
    deletes: Vec<PendingDelete>,
}

/// Values produced by a successful transaction, applied to the records afterwards.
struct Executed {
    inserted: Vec<FieldValues>,
    updated: Vec<FieldValues>,
    result: CommitResult,
}

fn persisted_key(meta: &EntityMeta, key: &RecordKey) -> Result<PrimaryKey> {
    key.primary_key().cloned().ok_or_else(|| {
        Error::validation(
            ValidationErrorKind::Key,
            meta.table,
            format!("record {key} has no store key yet"),
        )
    })
}

impl FlushPlan {
    /// Plan a commit of every pending change in `map`.
    #[tracing::instrument(level = "debug", skip_all)]
    pub(crate) fn build(
        map: &IdentityMap,
        registry: &EntityRegistry,
        driver: &dyn StoreDriver,
        config: &SessionConfig,
    ) -> Result<Self> {
        let mut plan = FlushPlan {
            inserts: Vec::new(),
            updates: Vec::new(),
            deletes: Vec::new(),
        };
        let mut links: Vec<(LinkOwner, PendingLinks)> = Vec::new();

        for record in map.ordered() {
            let guard = read_record(&record);
            let meta = *guard.meta();
            let pending: PendingLinks = guard
                .links()
                .filter_map(|(name, parent)| {
                    meta.navigation(name)
                        .filter(|nav| nav.kind == NavigationKind::ManyToOne)
                        .map(|nav| (nav, parent.clone()))
                })
                .collect();
            match guard.state() {
                RecordState::Added => {
                    links.push((LinkOwner::Insert(plan.inserts.len()), pending));
                    plan.inserts.push(PendingInsert {
                        record: Arc::clone(&record),
                        key: guard.key().clone(),
                        meta,
                        seq: guard.seq(),
                        values: guard.current().clone(),
                        patches: Vec::new(),
                    });
                }
                RecordState::Modified => {
                    links.push((LinkOwner::Update(plan.updates.len()), pending));
                    plan.updates.push(PendingUpdate {
                        record: Arc::clone(&record),
                        key: persisted_key(&meta, guard.key())?,
                        meta,
                        original: guard.original().clone(),
                        values: guard.current().clone(),
                        patches: Vec::new(),
                    });
                }
                RecordState::Deleted => plan.deletes.push(PendingDelete {
                    record: Arc::clone(&record),
                    record_key: guard.key().clone(),
                    key: persisted_key(&meta, guard.key())?,
                    meta,
                    seq: guard.seq(),
                    original: guard.original().clone(),
                }),
                RecordState::Unchanged | RecordState::Detached => {}
            }
        }

        for (owner, pending) in links {
            for (nav, parent) in pending {
                plan.resolve_link(owner, nav, &parent)?;
            }
        }
        plan.check_required()?;
        plan.order_inserts()?;
        for delete in &plan.deletes {
            check_dependents(map, registry, driver, config, delete)?;
        }
        plan.order_deletes()?;
        Ok(plan)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    fn target(&mut self, owner: LinkOwner) -> (&'static str, &mut FieldValues, &mut Vec<KeyPatch>) {
        match owner {
            LinkOwner::Insert(i) => {
                let insert = &mut self.inserts[i];
                (insert.meta.table, &mut insert.values, &mut insert.patches)
            }
            LinkOwner::Update(i) => {
                let update = &mut self.updates[i];
                (update.meta.table, &mut update.values, &mut update.patches)
            }
        }
    }

    /// Turn one pending link into either a key patch (parent not inserted
    /// yet) or an immediate copy of the parent's key values.
    fn resolve_link(
        &mut self,
        owner: LinkOwner,
        nav: &'static NavigationInfo,
        parent: &Weak<RwLock<TrackedRecord>>,
    ) -> Result<()> {
        let Some(parent) = parent.upgrade() else {
            return Ok(());
        };
        let parent_insert = self
            .inserts
            .iter()
            .position(|insert| Arc::ptr_eq(&insert.record, &parent));
        let (state, parent_values) = {
            let guard = read_record(&parent);
            let values: Vec<Value> = nav
                .remote_columns
                .iter()
                .map(|c| guard.get(c).cloned().unwrap_or(Value::Null))
                .collect();
            (guard.state(), values)
        };
        let (table, values, patches) = self.target(owner);
        match (state, parent_insert) {
            (RecordState::Added, Some(parent)) => patches.push(KeyPatch {
                columns: nav.local_columns,
                parent_columns: nav.remote_columns,
                parent,
            }),
            (RecordState::Unchanged | RecordState::Modified, _) => {
                for (column, value) in nav.local_columns.iter().zip(parent_values) {
                    values.set(*column, value);
                }
            }
            _ => {
                return Err(ValidationError::new(
                    ValidationErrorKind::InvalidState,
                    table,
                    format!("linked {} is {state:?}", nav.target),
                )
                .with_field(nav.name)
                .into());
            }
        }
        Ok(())
    }

    /// Every required reference of a pending insert or update must be set or linked.
    fn check_required(&self) -> Result<()> {
        let pending = self
            .inserts
            .iter()
            .map(|i| (&i.meta, &i.values, &i.patches))
            .chain(self.updates.iter().map(|u| (&u.meta, &u.values, &u.patches)));
        for (meta, values, patches) in pending {
            for field in meta.fields.iter().filter(|f| f.is_required_reference()) {
                let set = values.get(field.name).is_some_and(|v| !v.is_null());
                let linked = patches.iter().any(|p| p.columns.contains(&field.name));
                if !set && !linked {
                    return Err(ValidationError::new(
                        ValidationErrorKind::Required,
                        meta.table,
                        "required reference is neither set nor linked",
                    )
                    .with_field(field.name)
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Order inserts so that every parent precedes its dependents.
    fn order_inserts(&mut self) -> Result<()> {
        let mut edges = Vec::new();
        for (child, insert) in self.inserts.iter().enumerate() {
            edges.extend(insert.patches.iter().map(|p| (p.parent, child)));
            for key in insert.meta.foreign_keys() {
                let Some(values) = key_values(&insert.values, &key.columns) else {
                    continue;
                };
                for (parent, candidate) in self.inserts.iter().enumerate() {
                    if parent != child
                        && candidate.meta.table == key.target
                        && references_match(&candidate.values, &key.references, &values)
                    {
                        edges.push((parent, child));
                    }
                }
            }
        }
        let seqs: Vec<u64> = self.inserts.iter().map(|i| i.seq).collect();
        let Some(order) = topological_order(&seqs, &edges) else {
            let table = self.inserts.first().map_or("", |i| i.meta.table);
            return Err(Error::validation(
                ValidationErrorKind::Cycle,
                table,
                "inserted records reference each other in a cycle",
            ));
        };

        let mut position = vec![0; order.len()];
        for (new, old) in order.iter().enumerate() {
            position[*old] = new;
        }
        let mut slots: Vec<Option<PendingInsert>> = self.inserts.drain(..).map(Some).collect();
        self.inserts = order.iter().filter_map(|old| slots[*old].take()).collect();
        let patches = self
            .inserts
            .iter_mut()
            .flat_map(|i| i.patches.iter_mut())
            .chain(self.updates.iter_mut().flat_map(|u| u.patches.iter_mut()));
        for patch in patches {
            patch.parent = position[patch.parent];
        }
        Ok(())
    }

    /// Order deletes so that dependents go before the rows they reference.
    fn order_deletes(&mut self) -> Result<()> {
        let mut edges = Vec::new();
        for (child, delete) in self.deletes.iter().enumerate() {
            for key in delete.meta.foreign_keys() {
                let Some(values) = key_values(&delete.original, &key.columns) else {
                    continue;
                };
                for (parent, candidate) in self.deletes.iter().enumerate() {
                    if parent != child
                        && candidate.meta.table == key.target
                        && references_match(&candidate.original, &key.references, &values)
                    {
                        edges.push((child, parent));
                    }
                }
            }
        }
        let seqs: Vec<u64> = self.deletes.iter().map(|d| d.seq).collect();
        let Some(order) = topological_order(&seqs, &edges) else {
            let table = self.deletes.first().map_or("", |d| d.meta.table);
            return Err(Error::validation(
                ValidationErrorKind::Cycle,
                table,
                "deleted records reference each other in a cycle",
            ));
        };
        let mut slots: Vec<Option<PendingDelete>> = self.deletes.drain(..).map(Some).collect();
        self.deletes = order.iter().filter_map(|old| slots[*old].take()).collect();
        Ok(())
    }

    /// Run every statement in one transaction.
    fn execute(&self, driver: &dyn StoreDriver, config: &SessionConfig) -> Result<Executed> {
        let dialect = driver.dialect();
        let transaction = TransactionGuard::begin(driver)?;
        let mut result = CommitResult::default();

        let mut inserted: Vec<FieldValues> = Vec::with_capacity(self.inserts.len());
        for insert in &self.inserts {
            let mut values = insert.values.clone();
            apply_patches(&mut values, &insert.patches, &inserted);
            let fail = |cause| failure(insert.meta.table, &insert.key, PersistOperation::Insert, cause);
            let statement = sql::insert(dialect, &insert.meta, &values);
            tracing::trace!(sql = %statement.sql, "Executing insert");
            let id = driver
                .execute_insert(&statement.sql, &statement.params)
                .map_err(|e| fail(Some(e)))?;
            if let Some(column) = insert.meta.generated_key() {
                if values.get(column).is_none_or(Value::is_null) {
                    let id = id.ok_or_else(|| {
                        fail(Some(Error::Custom(
                            "store did not report a generated key".to_string(),
                        )))
                    })?;
                    values.set(column, Value::BigInt(id));
                }
            }
            result.inserted += 1;
            inserted.push(values);
        }

        let mut updated = Vec::with_capacity(self.updates.len());
        for update in &self.updates {
            let mut values = update.values.clone();
            apply_patches(&mut values, &update.patches, &inserted);
            let assignments: Vec<(&str, Value)> = update
                .meta
                .value_columns()
                .filter(|f| {
                    config.update_mode == UpdateMode::FullRow
                        || values.get(f.name) != update.original.get(f.name)
                })
                .map(|f| (f.name, values.get(f.name).cloned().unwrap_or(Value::Null)))
                .collect();
            if !assignments.is_empty() {
                let record_key = RecordKey::new(update.meta.table, update.key.clone());
                let fail = |cause| failure(update.meta.table, &record_key, PersistOperation::Update, cause);
                let statement = sql::update(dialect, &update.meta, &assignments, &update.key);
                tracing::trace!(sql = %statement.sql, "Executing update");
                let rows = driver
                    .execute_non_query(&statement.sql, &statement.params)
                    .map_err(|e| fail(Some(e)))?;
                if rows == 0 {
                    return Err(fail(None));
                }
                result.updated += 1;
            }
            updated.push(values);
        }

        for delete in &self.deletes {
            let fail = |cause| failure(delete.meta.table, &delete.record_key, PersistOperation::Delete, cause);
            let statement = sql::delete(dialect, &delete.meta, &delete.key);
            tracing::trace!(sql = %statement.sql, "Executing delete");
            let rows = driver
                .execute_non_query(&statement.sql, &statement.params)
                .map_err(|e| fail(Some(e)))?;
            if rows == 0 {
                return Err(fail(None));
            }
            result.deleted += 1;
        }

        transaction.commit()?;
        Ok(Executed {
            inserted,
            updated,
            result,
        })
    }

    /// Bring the tracked records in line with the committed store.
    fn apply(self, map: &mut IdentityMap, executed: Executed) {
        for (insert, values) in self.inserts.into_iter().zip(executed.inserted) {
            let key = values
                .key(insert.meta.primary_key)
                .filter(PrimaryKey::is_complete);
            write_record(&insert.record).commit_values(values);
            if let Some(key) = key {
                map.rekey(&insert.key, RecordKey::new(insert.meta.table, key));
            }
        }
        for (update, values) in self.updates.into_iter().zip(executed.updated) {
            write_record(&update.record).commit_values(values);
        }
        for delete in self.deletes {
            map.remove(&delete.record_key);
            write_record(&delete.record).detach();
        }
    }
}

/// Values of `columns`, or `None` when any of them is unset or NULL.
fn key_values(values: &FieldValues, columns: &[&str]) -> Option<Vec<Value>> {
    columns
        .iter()
        .map(|column| values.get(column).filter(|v| !v.is_null()).cloned())
        .collect()
}

fn references_match(values: &FieldValues, columns: &[&str], expected: &[Value]) -> bool {
    columns
        .iter()
        .zip(expected)
        .all(|(column, value)| values.get(column) == Some(value))
}

fn apply_patches(values: &mut FieldValues, patches: &[KeyPatch], inserted: &[FieldValues]) {
    for patch in patches {
        let Some(parent) = inserted.get(patch.parent) else {
            continue;
        };
        for (column, parent_column) in patch.columns.iter().zip(patch.parent_columns) {
            let value = parent.get(parent_column).cloned().unwrap_or(Value::Null);
            values.set(*column, value);
        }
    }
}

fn failure(
    table: &str,
    key: &RecordKey,
    operation: PersistOperation,
    cause: Option<Error>,
) -> Error {
    Error::Persistence(PersistenceError {
        table: table.to_string(),
        key: key.id.to_string(),
        operation,
        cause: cause.map(Box::new),
    })
}

fn transaction_failure(operation: PersistOperation, cause: Error) -> Error {
    Error::Persistence(PersistenceError {
        table: String::new(),
        key: String::new(),
        operation,
        cause: Some(Box::new(cause)),
    })
}

/// Kahn's algorithm; among ready nodes the lowest `seq` goes first.
///
/// `edges` are `(before, after)` pairs. Returns `None` on a cycle.
fn topological_order(seqs: &[u64], edges: &[(usize, usize)]) -> Option<Vec<usize>> {
    let n = seqs.len();
    let mut indegree = vec![0_usize; n];
    let mut successors = vec![Vec::new(); n];
    for &(before, after) in edges {
        successors[before].push(after);
        indegree[after] += 1;
    }
    let mut ready: BinaryHeap<Reverse<(u64, usize)>> = (0..n)
        .filter(|i| indegree[*i] == 0)
        .map(|i| Reverse((seqs[i], i)))
        .collect();
    let mut order = Vec::with_capacity(n);
    while let Some(Reverse((_, node))) = ready.pop() {
        order.push(node);
        for &next in &successors[node] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(Reverse((seqs[next], next)));
            }
        }
    }
    (order.len() == n).then_some(order)
}

/// Whether `record` still references `values` through `dependent.columns`.
///
/// A pending link over any of the columns decides; otherwise every current
/// value must match.
fn still_depends(record: &RecordRef, dependent: &Dependent, values: &[Value], deleted: &RecordRef) -> bool {
    let guard = read_record(record);
    if !guard.state().is_live() {
        return false;
    }
    for (name, parent) in guard.links() {
        let over_key = guard.meta().navigation(name).is_some_and(|nav| {
            nav.local_columns
                .iter()
                .any(|c| dependent.columns.contains(c))
        });
        if over_key {
            return std::ptr::eq(parent.as_ptr(), Arc::as_ptr(deleted));
        }
    }
    dependent
        .columns
        .iter()
        .zip(values)
        .all(|(column, value)| guard.get(column) == Some(value))
}

/// Refuse to delete a record that required references still point at.
fn check_dependents(
    map: &IdentityMap,
    registry: &EntityRegistry,
    driver: &dyn StoreDriver,
    config: &SessionConfig,
    delete: &PendingDelete,
) -> Result<()> {
    let live = |dependent: &Dependent| {
        Error::Validation(
            ValidationError::new(
                ValidationErrorKind::LiveDependents,
                delete.meta.table,
                format!(
                    "{} is still referenced by {}({})",
                    delete.record_key,
                    dependent.table,
                    dependent.columns.join(", ")
                ),
            )
            .with_field(dependent.references.join(", ")),
        )
    };

    for dependent in registry
        .dependents_of(delete.meta.table)
        .into_iter()
        .filter(|d| d.required)
    {
        let Some(values) = key_values(&delete.original, &dependent.references) else {
            continue;
        };
        if map
            .records_of(dependent.table)
            .iter()
            .any(|r| still_depends(r, &dependent, &values, &delete.record))
        {
            return Err(live(&dependent));
        }

        if !config.validate_store_dependents {
            continue;
        }
        let Some(dependent_meta) = registry.get(dependent.table) else {
            continue;
        };
        let filters: Vec<(&str, &Value)> = dependent.columns.iter().copied().zip(&values).collect();
        let statement = sql::select_where(driver.dialect(), dependent_meta, &filters);
        tracing::trace!(sql = %statement.sql, "Checking stored dependents");
        for row in driver.execute_query(&statement.sql, &statement.params)? {
            let stored = FieldValues::from_row(dependent_meta.fields, &row, None)?;
            let tracked = stored
                .key(dependent_meta.primary_key)
                .and_then(|key| map.get_by_key(dependent.table, key));
            match tracked {
                Some(record) if !still_depends(&record, &dependent, &values, &delete.record) => {}
                _ => return Err(live(&dependent)),
            }
        }
    }
    Ok(())
}

/// An open transaction that rolls back unless committed.
struct TransactionGuard<'a> {
    driver: &'a dyn StoreDriver,
    committed: bool,
}

impl<'a> TransactionGuard<'a> {
    fn begin(driver: &'a dyn StoreDriver) -> Result<Self> {
        driver
            .begin_transaction()
            .map_err(|e| transaction_failure(PersistOperation::Begin, e))?;
        Ok(Self {
            driver,
            committed: false,
        })
    }

    fn commit(mut self) -> Result<()> {
        self.driver
            .commit()
            .map_err(|e| transaction_failure(PersistOperation::Commit, e))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            tracing::debug!("Rolling back commit transaction");
            if let Err(e) = self.driver.rollback() {
                tracing::warn!(error = %e, "Rollback failed");
            }
        }
    }
}

/// Plan, execute and apply a commit of every pending change in `map`.
#[tracing::instrument(level = "info", skip_all)]
pub(crate) fn commit(
    map: &mut IdentityMap,
    registry: &EntityRegistry,
    driver: &dyn StoreDriver,
    config: &SessionConfig,
    token: &CancellationToken,
) -> Result<CommitResult> {
    token.check()?;
    let start = Instant::now();
    let plan = FlushPlan::build(map, registry, driver, config)?;
    if plan.is_empty() {
        tracing::debug!("Nothing to commit");
        return Ok(CommitResult::default());
    }
    tracing::debug!(
        inserts = plan.inserts.len(),
        updates = plan.updates.len(),
        deletes = plan.deletes.len(),
        "Commit planned"
    );
    token.check()?;

    let executed = plan.execute(driver, config)?;
    let result = executed.result;
    plan.apply(map, executed);

    tracing::info!(
        elapsed_ms = start.elapsed().as_millis(),
        inserted = result.inserted,
        updated = result.updated,
        deleted = result.deleted,
        "Commit complete"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        MockDriver, customer_meta, customer_values, invoice_meta, invoice_values, line_item_meta,
        line_item_values, line_note_meta, line_note_values, registry,
    };

    fn run(map: &mut IdentityMap, driver: &MockDriver, config: &SessionConfig) -> Result<CommitResult> {
        commit(map, &registry(), driver, config, &CancellationToken::new())
    }

    #[test]
    fn test_topological_order_breaks_ties_by_seq() {
        assert_eq!(topological_order(&[2, 0, 1], &[]), Some(vec![1, 2, 0]));
        assert_eq!(topological_order(&[0, 1, 2], &[(2, 0)]), Some(vec![1, 2, 0]));
        assert_eq!(topological_order(&[0, 1], &[(0, 1), (1, 0)]), None);
    }

    #[test]
    fn test_parent_inserted_before_child_and_key_patched() {
        let mut map = IdentityMap::new();
        let driver = MockDriver::new();
        // Child is tracked first to show ordering is by dependency, not by add order.
        let invoice = map
            .insert_added(&invoice_meta(), invoice_values(0, 0, 9.5).with("invoice_id", Value::Null).with("customer_id", Value::Null))
            .unwrap();
        let customer = map
            .insert_added(&customer_meta(), customer_values(0, "Acme").with("customer_id", Value::Null))
            .unwrap();
        write_record(&invoice).set_link("customer", Arc::downgrade(&customer));

        let result = run(&mut map, &driver, &SessionConfig::default()).unwrap();
        assert_eq!(result.inserted, 2);
        let writes = driver.writes();
        assert!(writes[0].starts_with("INSERT INTO \"customer\""));
        assert!(writes[1].starts_with("INSERT INTO \"invoice\""));

        let customer_id = read_record(&customer).get("customer_id").cloned().unwrap();
        assert_eq!(customer_id, Value::BigInt(100));
        let guard = read_record(&invoice);
        assert_eq!(guard.get("customer_id"), Some(&customer_id));
        assert_eq!(guard.state(), RecordState::Unchanged);
        assert!(!guard.key().is_provisional());
        drop(guard);
        assert!(map.get_by_key("customer", PrimaryKey::from(100)).is_some());
    }

    #[test]
    fn test_failed_commit_keeps_pre_commit_state() {
        let mut map = IdentityMap::new();
        let driver = MockDriver::new();
        driver.fail_on("INSERT INTO \"invoice\"");
        let customer = map
            .insert_added(&customer_meta(), customer_values(0, "Acme").with("customer_id", Value::Null))
            .unwrap();
        let invoice = map
            .insert_added(&invoice_meta(), invoice_values(0, 0, 1.0).with("invoice_id", Value::Null).with("customer_id", Value::Null))
            .unwrap();
        write_record(&invoice).set_link("customer", Arc::downgrade(&customer));
        let customer_key = read_record(&customer).key().clone();

        let err = run(&mut map, &driver, &SessionConfig::default()).unwrap_err();
        match err {
            Error::Persistence(p) => {
                assert_eq!(p.table, "invoice");
                assert_eq!(p.operation, PersistOperation::Insert);
                assert!(p.cause.is_some());
            }
            other => panic!("expected persistence error, got {other:?}"),
        }
        assert_eq!(driver.log().last().map(String::as_str), Some("ROLLBACK"));
        let guard = read_record(&customer);
        assert_eq!(guard.state(), RecordState::Added);
        assert_eq!(guard.get("customer_id"), Some(&Value::Null));
        assert_eq!(guard.key(), &customer_key);
        assert!(map.contains(&customer_key));
    }

    #[test]
    fn test_delete_with_live_dependent_is_rejected_before_any_statement() {
        let mut map = IdentityMap::new();
        let driver = MockDriver::new();
        let customer = map
            .get_or_create(&customer_meta(), PrimaryKey::from(1), customer_values(1, "Acme"))
            .unwrap();
        map.get_or_create(&invoice_meta(), PrimaryKey::from(7), invoice_values(7, 1, 3.0))
            .unwrap();
        write_record(&customer).mark_deleted();

        let err = run(&mut map, &driver, &SessionConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Validation(v) if v.kind == ValidationErrorKind::LiveDependents));
        assert!(driver.log().is_empty());
        assert_eq!(read_record(&customer).state(), RecordState::Deleted);
    }

    #[test]
    fn test_delete_with_stored_dependent_is_rejected() {
        let mut map = IdentityMap::new();
        let driver = MockDriver::new();
        driver.seed("invoice", invoice_values(8, 1, 3.0));
        let customer = map
            .get_or_create(&customer_meta(), PrimaryKey::from(1), customer_values(1, "Acme"))
            .unwrap();
        write_record(&customer).mark_deleted();

        let err = run(&mut map, &driver, &SessionConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Validation(v) if v.kind == ValidationErrorKind::LiveDependents));
        assert!(driver.writes().is_empty());
        assert!(!driver.log().iter().any(|s| s == "BEGIN"));

        let unchecked = SessionConfig::default().validate_store_dependents(false);
        assert_eq!(run(&mut map, &driver, &unchecked).unwrap().deleted, 1);
    }

    #[test]
    fn test_composite_reference_needs_every_column_to_match() {
        let line_key = |line: i64| PrimaryKey::new(vec![Value::BigInt(1), Value::BigInt(line)]);
        let mut map = IdentityMap::new();
        let driver = MockDriver::new();
        // Both notes share invoice 1 with line (1, 1) but sit on line 2.
        driver.seed("line_note", line_note_values(3, 1, 2));
        let line = map
            .get_or_create(&line_item_meta(), line_key(1), line_item_values(1, 1))
            .unwrap();
        map.get_or_create(&line_note_meta(), PrimaryKey::from(4), line_note_values(4, 1, 2))
            .unwrap();
        write_record(&line).mark_deleted();
        assert_eq!(run(&mut map, &driver, &SessionConfig::default()).unwrap().deleted, 1);
        assert!(driver.log().iter().any(|s| s.contains("\"invoice_id\" = ?1 AND \"line_no\" = ?2")));

        let mut map = IdentityMap::new();
        let line = map
            .get_or_create(&line_item_meta(), line_key(2), line_item_values(1, 2))
            .unwrap();
        map.get_or_create(&line_note_meta(), PrimaryKey::from(4), line_note_values(4, 1, 2))
            .unwrap();
        write_record(&line).mark_deleted();
        let err = run(&mut map, &driver, &SessionConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(v) if v.kind == ValidationErrorKind::LiveDependents
                && v.message.contains("line_note(invoice_id, line_no)")
        ));
    }

    #[test]
    fn test_composite_reference_orders_only_the_matching_delete() {
        let mut map = IdentityMap::new();
        let driver = MockDriver::new();
        let line = map
            .get_or_create(
                &line_item_meta(),
                PrimaryKey::new(vec![Value::BigInt(1), Value::BigInt(1)]),
                line_item_values(1, 1),
            )
            .unwrap();
        // The note sits on line 2, so nothing moves it ahead of line 1.
        let note = map
            .get_or_create(&line_note_meta(), PrimaryKey::from(4), line_note_values(4, 1, 2))
            .unwrap();
        write_record(&line).mark_deleted();
        write_record(&note).mark_deleted();

        let config = SessionConfig::default().validate_store_dependents(false);
        assert_eq!(run(&mut map, &driver, &config).unwrap().deleted, 2);
        let writes = driver.writes();
        assert!(writes[0].starts_with("DELETE FROM \"line_item\""));
        assert!(writes[1].starts_with("DELETE FROM \"line_note\""));
    }

    #[test]
    fn test_deletes_run_dependents_first() {
        let mut map = IdentityMap::new();
        let driver = MockDriver::new();
        let customer = map
            .get_or_create(&customer_meta(), PrimaryKey::from(1), customer_values(1, "Acme"))
            .unwrap();
        let invoice = map
            .get_or_create(&invoice_meta(), PrimaryKey::from(7), invoice_values(7, 1, 3.0))
            .unwrap();
        write_record(&customer).mark_deleted();
        write_record(&invoice).mark_deleted();

        let result = run(&mut map, &driver, &SessionConfig::default()).unwrap();
        assert_eq!(result.deleted, 2);
        let writes = driver.writes();
        assert!(writes[0].starts_with("DELETE FROM \"invoice\""));
        assert!(writes[1].starts_with("DELETE FROM \"customer\""));
        assert!(map.is_empty());
        assert_eq!(read_record(&customer).state(), RecordState::Detached);
    }

    #[test]
    fn test_reassigned_dependent_allows_delete() {
        let mut map = IdentityMap::new();
        let driver = MockDriver::new();
        let old = map
            .get_or_create(&customer_meta(), PrimaryKey::from(1), customer_values(1, "Old"))
            .unwrap();
        map.get_or_create(&customer_meta(), PrimaryKey::from(2), customer_values(2, "New"))
            .unwrap();
        let invoice = map
            .get_or_create(&invoice_meta(), PrimaryKey::from(7), invoice_values(7, 1, 3.0))
            .unwrap();
        write_record(&invoice).set_field("customer_id", 2_i64).unwrap();
        write_record(&old).mark_deleted();

        let result = run(
            &mut map,
            &driver,
            &SessionConfig::default().validate_store_dependents(false),
        )
        .unwrap();
        assert_eq!((result.updated, result.deleted), (1, 1));
        let writes = driver.writes();
        assert!(writes[0].starts_with("UPDATE \"invoice\""));
        assert!(writes[1].starts_with("DELETE FROM \"customer\""));
    }

    #[test]
    fn test_missing_required_reference() {
        let mut map = IdentityMap::new();
        let driver = MockDriver::new();
        map.insert_added(&invoice_meta(), invoice_values(0, 0, 1.0).with("invoice_id", Value::Null).with("customer_id", Value::Null))
            .unwrap();
        let err = run(&mut map, &driver, &SessionConfig::default()).unwrap_err();
        match err {
            Error::Validation(v) => {
                assert_eq!(v.kind, ValidationErrorKind::Required);
                assert_eq!(v.field.as_deref(), Some("customer_id"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(driver.log().is_empty());
    }

    #[test]
    fn test_update_modes() {
        let driver = MockDriver::new();
        for (mode, expected) in [
            (UpdateMode::ChangedColumns, "UPDATE \"customer\" SET \"gstin\" = ?1 WHERE \"customer_id\" = ?2"),
            (
                UpdateMode::FullRow,
                "UPDATE \"customer\" SET \"legal_name\" = ?1, \"gstin\" = ?2 WHERE \"customer_id\" = ?3",
            ),
        ] {
            let mut map = IdentityMap::new();
            let customer = map
                .get_or_create(&customer_meta(), PrimaryKey::from(1), customer_values(1, "Acme"))
                .unwrap();
            write_record(&customer).set_field("gstin", "29ABCDE1234F1Z5").unwrap();
            let result = run(&mut map, &driver, &SessionConfig::default().update_mode(mode)).unwrap();
            assert_eq!(result.updated, 1);
            assert_eq!(driver.writes().last().map(String::as_str), Some(expected));
            assert_eq!(read_record(&customer).state(), RecordState::Unchanged);
        }
    }

    #[test]
    fn test_restored_value_sends_no_update() {
        let mut map = IdentityMap::new();
        let driver = MockDriver::new();
        let customer = map
            .get_or_create(&customer_meta(), PrimaryKey::from(1), customer_values(1, "Acme"))
            .unwrap();
        {
            let mut guard = write_record(&customer);
            guard.set_field("legal_name", "Other").unwrap();
            guard.set_field("legal_name", "Acme").unwrap();
        }
        let result = run(&mut map, &driver, &SessionConfig::default()).unwrap();
        assert_eq!(result.total(), 0);
        assert!(driver.writes().is_empty());
        assert_eq!(read_record(&customer).state(), RecordState::Unchanged);
    }

    #[test]
    fn test_zero_rows_affected_is_a_persistence_error() {
        let mut map = IdentityMap::new();
        let driver = MockDriver::new();
        driver.set_affected(0);
        let customer = map
            .get_or_create(&customer_meta(), PrimaryKey::from(1), customer_values(1, "Acme"))
            .unwrap();
        write_record(&customer).set_field("legal_name", "Gone").unwrap();
        let err = run(&mut map, &driver, &SessionConfig::default()).unwrap_err();
        assert!(matches!(&err, Error::Persistence(p) if p.operation == PersistOperation::Update && p.cause.is_none()));
        assert_eq!(read_record(&customer).state(), RecordState::Modified);
    }

    #[test]
    fn test_cancelled_before_begin() {
        let mut map = IdentityMap::new();
        let driver = MockDriver::new();
        map.insert_added(&customer_meta(), customer_values(0, "Acme").with("customer_id", Value::Null))
            .unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let err = commit(&mut map, &registry(), &driver, &SessionConfig::default(), &token).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(driver.log().is_empty());
    }

    #[test]
    fn test_empty_commit_sends_nothing() {
        let mut map = IdentityMap::new();
        let driver = MockDriver::new();
        assert_eq!(run(&mut map, &driver, &SessionConfig::default()).unwrap(), CommitResult::default());
        assert!(driver.log().is_empty());
    }
}
