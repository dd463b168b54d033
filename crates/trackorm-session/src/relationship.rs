//! Navigation resolution.
//!
//! Each tracked record owns one [`NavigationSlot`] per navigation declared
//! on its entity. A slot starts empty. The first read fetches the related
//! rows once, routes them through the identity map and memoizes them; later
//! reads are served from memory. Eager navigations are filled while the
//! owner is fetched and never query on read.
//!
//! Reads are answered against the live identity map, so a collection also
//! reflects tracked records added, linked, re-pointed or deleted in the
//! same unit of work. Deleted records are never returned.
//!
//! Ownership runs one way: a one-to-many memo holds its children strongly,
//! while a many-to-one memo, a slot's owner and a slot's loader are weak.

use crate::change_tracker::{RecordRef, RecordState, TrackedRecord, read_record};
use crate::identity_map::IdentityMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};
use trackorm_core::{
    DetachedAccessError, Error, NavigationInfo, NavigationKind, PrimaryKey, Result, Value,
};

/// The unit-of-work services a navigation slot needs.
///
/// Implemented by the unit of work; slots hold it weakly so that a slot
/// outliving its unit of work reports [`Error::DetachedAccess`].
pub trait NavigationLoader: Send + Sync {
    /// Whether the unit of work is still open.
    fn is_open(&self) -> bool;

    /// Fetch `target` rows whose `columns` equal `values`, routed through the identity map.
    fn fetch_matching(
        &self,
        target: &'static str,
        columns: &[&'static str],
        values: &[Value],
    ) -> Result<Vec<RecordRef>>;

    /// Run `f` against the identity map.
    fn inspect(&self, f: &mut dyn FnMut(&IdentityMap));
}

/// Memoized result of a navigation fetch.
#[derive(Debug, Clone)]
pub enum Loaded {
    /// Children of a one-to-many navigation.
    Many(Vec<RecordRef>),
    /// Target of a many-to-one navigation.
    One(Option<Weak<RwLock<TrackedRecord>>>),
}

/// The answer to a navigation read.
#[derive(Debug, Clone)]
pub enum Navigated {
    Many(Vec<RecordRef>),
    One(Option<RecordRef>),
}

impl Navigated {
    pub fn into_many(self) -> Vec<RecordRef> {
        match self {
            Navigated::Many(records) => records,
            Navigated::One(record) => record.into_iter().collect(),
        }
    }

    pub fn into_one(self) -> Option<RecordRef> {
        match self {
            Navigated::Many(records) => records.into_iter().next(),
            Navigated::One(record) => record,
        }
    }
}

/// Lazily resolved state of one navigation of one record.
pub struct NavigationSlot {
    info: &'static NavigationInfo,
    owner_table: &'static str,
    owner: Weak<RwLock<TrackedRecord>>,
    loader: Option<Weak<dyn NavigationLoader>>,
    loaded: OnceLock<Loaded>,
    /// Serializes the first fetch.
    fetch_guard: Mutex<()>,
}

impl std::fmt::Debug for NavigationSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NavigationSlot")
            .field("navigation", &self.info.name)
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}

impl NavigationSlot {
    pub(crate) fn new(
        info: &'static NavigationInfo,
        owner_table: &'static str,
        owner: Weak<RwLock<TrackedRecord>>,
        loader: Option<Weak<dyn NavigationLoader>>,
    ) -> Self {
        Self {
            info,
            owner_table,
            owner,
            loader,
            loaded: OnceLock::new(),
            fetch_guard: Mutex::new(()),
        }
    }

    /// An empty slot for the same navigation and owner.
    pub(crate) fn fresh(&self) -> Self {
        Self::new(
            self.info,
            self.owner_table,
            self.owner.clone(),
            self.loader.clone(),
        )
    }

    pub fn info(&self) -> &'static NavigationInfo {
        self.info
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.get().is_some()
    }

    /// Fill the slot from an eager fetch. The first fill wins.
    pub(crate) fn prefill(&self, loaded: Loaded) -> bool {
        self.loaded.set(loaded).is_ok()
    }

    fn detached(&self) -> Error {
        Error::DetachedAccess(DetachedAccessError {
            table: self.owner_table.to_string(),
            navigation: self.info.name.to_string(),
        })
    }

    fn loader(&self) -> Result<Arc<dyn NavigationLoader>> {
        self.loader
            .as_ref()
            .and_then(Weak::upgrade)
            .filter(|loader| loader.is_open())
            .ok_or_else(|| self.detached())
    }

    /// Run `fetch` unless the slot is already loaded. Concurrent callers
    /// wait for the first one; a failed fetch leaves the slot empty.
    fn ensure_loaded(&self, fetch: impl FnOnce() -> Result<Loaded>) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }
        let _guard = self.fetch_guard.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_loaded() {
            return Ok(());
        }
        let loaded = fetch()?;
        let _ = self.loaded.set(loaded);
        Ok(())
    }

    /// Resolve the navigation.
    ///
    /// Fails with `DetachedAccess` once the unit of work has ended or the
    /// owner is no longer tracked.
    #[tracing::instrument(level = "trace", skip(self), fields(navigation = self.info.name))]
    pub fn load(&self) -> Result<Navigated> {
        let loader = self.loader()?;
        let owner = self.owner.upgrade().ok_or_else(|| self.detached())?;
        if read_record(&owner).state() == RecordState::Detached {
            return Err(self.detached());
        }
        match self.info.kind {
            NavigationKind::OneToMany => self.load_many(loader.as_ref(), &owner).map(Navigated::Many),
            NavigationKind::ManyToOne => self.load_one(loader.as_ref(), &owner).map(Navigated::One),
        }
    }

    fn load_many(&self, loader: &dyn NavigationLoader, owner: &RecordRef) -> Result<Vec<RecordRef>> {
        let info = self.info;
        let owner_values = column_values(owner, info.local_columns);
        if let Some(values) = &owner_values {
            self.ensure_loaded(|| {
                tracing::debug!(navigation = info.name, target = info.target, "Lazy load");
                loader
                    .fetch_matching(info.target, info.remote_columns, values)
                    .map(Loaded::Many)
            })?;
        }
        let memo = match self.loaded.get() {
            Some(Loaded::Many(children)) => children.clone(),
            _ => Vec::new(),
        };

        let owner_table = self.owner_table;
        let mut out: Vec<RecordRef> = Vec::new();
        loader.inspect(&mut |map| {
            let belongs = |child: &RecordRef| {
                is_child_of(child, owner, owner_table, info, owner_values.as_deref())
            };
            for child in &memo {
                if belongs(child) && !out.iter().any(|c| Arc::ptr_eq(c, child)) {
                    out.push(Arc::clone(child));
                }
            }
            for child in map.records_of(info.target) {
                if belongs(&child) && !out.iter().any(|c| Arc::ptr_eq(c, &child)) {
                    out.push(child);
                }
            }
        });
        Ok(out)
    }

    fn load_one(&self, loader: &dyn NavigationLoader, owner: &RecordRef) -> Result<Option<RecordRef>> {
        let info = self.info;
        let linked = read_record(owner).link_target(info.name).cloned();
        if let Some(parent) = linked {
            return Ok(parent.upgrade().filter(is_live));
        }
        let Some(values) = column_values(owner, info.local_columns) else {
            return Ok(None);
        };

        let mut tracked = None;
        loader.inspect(&mut |map| tracked = map.find_by_columns(info.target, info.remote_columns, &values));
        if let Some(target) = tracked {
            return Ok(Some(target).filter(is_live));
        }

        self.ensure_loaded(|| {
            tracing::debug!(navigation = info.name, target = info.target, "Lazy load");
            let found = loader.fetch_matching(info.target, info.remote_columns, &values)?;
            Ok(Loaded::One(found.first().map(Arc::downgrade)))
        })?;
        match self.loaded.get() {
            Some(Loaded::One(Some(target))) => Ok(target.upgrade().filter(is_live)),
            _ => Ok(None),
        }
    }
}

fn is_live(record: &RecordRef) -> bool {
    read_record(record).state().is_live()
}

/// Current values of `columns`, or `None` when any is NULL or missing.
fn column_values(record: &RecordRef, columns: &[&str]) -> Option<Vec<Value>> {
    let guard = read_record(record);
    let values: Vec<Value> = columns
        .iter()
        .map(|c| guard.get(c).cloned().unwrap_or(Value::Null))
        .collect();
    PrimaryKey::new(values.clone()).is_complete().then_some(values)
}

/// Whether `child` currently belongs to `owner` under the one-to-many `info`.
///
/// A pending link on the inverse navigation decides; otherwise the child's
/// foreign key values must equal the owner's key values.
fn is_child_of(
    child: &RecordRef,
    owner: &RecordRef,
    owner_table: &str,
    info: &NavigationInfo,
    owner_values: Option<&[Value]>,
) -> bool {
    let guard = read_record(child);
    if !guard.state().is_live() || guard.table() != info.target {
        return false;
    }
    for (name, parent) in guard.links() {
        let Some(inverse) = guard.meta().navigation(name) else {
            continue;
        };
        if inverse.target == owner_table && inverse.local_columns == info.remote_columns {
            return std::ptr::eq(parent.as_ptr(), Arc::as_ptr(owner));
        }
    }
    let Some(owner_values) = owner_values else {
        return false;
    };
    info.remote_columns
        .iter()
        .zip(owner_values)
        .all(|(column, value)| guard.get(column) == Some(value))
}

/// Resolve `navigation` on `record`.
pub fn navigate(record: &RecordRef, navigation: &str) -> Result<Navigated> {
    let slot = read_record(record).navigation(navigation)?;
    slot.load()
}

/// Resolve a one-to-many navigation.
pub fn related(record: &RecordRef, navigation: &str) -> Result<Vec<RecordRef>> {
    navigate(record, navigation).map(Navigated::into_many)
}

/// Resolve a many-to-one navigation.
pub fn related_one(record: &RecordRef, navigation: &str) -> Result<Option<RecordRef>> {
    navigate(record, navigation).map(Navigated::into_one)
}
