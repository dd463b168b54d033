//! Unit of work for trackorm.
//!
//! `trackorm-session` is the **change-tracking layer**. It keeps one tracked
//! record per primary key, remembers what each record looked like when it was
//! loaded, resolves navigations between records and writes the difference
//! back in one transaction.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one in-memory [`TrackedRecord`] per (table, key).
//! - **Change tracking**: original and current snapshots plus a [`RecordState`].
//! - **Relationship loading**: lazy single-flight slots and eager joins.
//! - **Persistence**: dependency-ordered INSERT/UPDATE/DELETE inside one
//!   transaction; records change state only after the store commits.
//!
//! # Example
//!
//! ```ignore
//! let uow = UnitOfWork::new(driver, Arc::new(registry));
//!
//! let customer = uow.find("customer", 1)?.expect("customer 1");
//! uow.set_field(&customer, "legal_name", "Acme Traders")?;
//!
//! let invoice = uow.add("invoice", FieldValues::new().with("total", 120.0))?;
//! uow.link(&invoice, "customer", &customer)?;
//!
//! let result = uow.commit()?;
//! assert_eq!(result.inserted, 1);
//! ```

pub mod change_tracker;
pub mod flush;
pub mod identity_map;
pub mod relationship;
pub mod unit_of_work;

#[cfg(test)]
mod test_support;

pub use change_tracker::{
    RecordId, RecordKey, RecordRef, RecordState, TrackedRecord, read_record, write_record,
};
pub use flush::CommitResult;
pub use identity_map::{IdentityMap, MergePolicy};
pub use relationship::{Navigated, NavigationLoader, NavigationSlot, navigate, related, related_one};
pub use unit_of_work::UnitOfWork;

/// Which columns an UPDATE writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateMode {
    /// Only the columns whose current value differs from the original.
    #[default]
    ChangedColumns,
    /// Every non-key column.
    FullRow,
}

/// Configuration for a [`UnitOfWork`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Columns written by updates.
    pub update_mode: UpdateMode,
    /// Policy used by [`UnitOfWork::attach`].
    pub merge_policy: MergePolicy,
    /// Query the store for untracked dependents before deleting a record.
    pub validate_store_dependents: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            update_mode: UpdateMode::ChangedColumns,
            merge_policy: MergePolicy::None,
            validate_store_dependents: true,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_mode(mut self, mode: UpdateMode) -> Self {
        self.update_mode = mode;
        self
    }

    pub fn merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn validate_store_dependents(mut self, enabled: bool) -> Self {
        self.validate_store_dependents = enabled;
        self
    }
}
