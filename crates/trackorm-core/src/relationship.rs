//! Navigation metadata.
//!
//! A navigation is a named, directed edge from an owning entity to related
//! records of a target entity. Its load strategy is fixed here, at
//! configuration time, rather than chosen per query.

/// The cardinality of a navigation, seen from its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationKind {
    /// The owner is referenced by many target rows (`customer.invoices`).
    OneToMany,
    /// The owner references one target row (`invoice.customer`).
    ManyToOne,
}

/// When the related records of a navigation are fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadStrategy {
    /// Fetched on first access, one query per owning record.
    #[default]
    Lazy,
    /// Joined into the query that fetches the owning records.
    Eager,
}

/// Metadata for one navigation of an entity.
///
/// `local_columns` live on the owner and `remote_columns` on the target;
/// they are matched pairwise. For a one-to-many edge the local columns are
/// the owner's key and the remote columns the child's foreign key; for a
/// many-to-one edge it is the other way round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigationInfo {
    pub name: &'static str,
    pub kind: NavigationKind,
    /// Table of the related entity
    pub target: &'static str,
    pub local_columns: &'static [&'static str],
    pub remote_columns: &'static [&'static str],
    pub load: LoadStrategy,
}

impl NavigationInfo {
    /// A collection navigation: target rows whose `remote_columns` equal the owner's `local_columns`.
    pub const fn one_to_many(
        name: &'static str,
        target: &'static str,
        local_columns: &'static [&'static str],
        remote_columns: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            kind: NavigationKind::OneToMany,
            target,
            local_columns,
            remote_columns,
            load: LoadStrategy::Lazy,
        }
    }

    /// A reference navigation through the owner's foreign key columns.
    pub const fn many_to_one(
        name: &'static str,
        target: &'static str,
        local_columns: &'static [&'static str],
        remote_columns: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            kind: NavigationKind::ManyToOne,
            target,
            local_columns,
            remote_columns,
            load: LoadStrategy::Lazy,
        }
    }

    /// Load this navigation in the same statement as its owner.
    pub const fn eager(mut self) -> Self {
        self.load = LoadStrategy::Eager;
        self
    }

    pub const fn is_eager(&self) -> bool {
        matches!(self.load, LoadStrategy::Eager)
    }

    pub const fn is_many(&self) -> bool {
        matches!(self.kind, NavigationKind::OneToMany)
    }
}
