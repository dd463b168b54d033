//! The store driver contract.
//!
//! A driver executes parameterized SQL against a backing store. The unit of
//! work never parses or rewrites SQL; it only builds statements with
//! [`crate::sql`] and hands them to a driver.

use crate::error::Result;
use crate::row::Row;
use crate::value::Value;

/// SQL dialect, used to pick parameter placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// `$1, $2, ...`
    Postgres,
    /// `?1, ?2, ...`
    #[default]
    Sqlite,
}

impl Dialect {
    /// Placeholder for the 1-based parameter `index`.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
        }
    }
}

/// A synchronous connection to a backing store.
///
/// All methods take `&self`; drivers serialize access internally. A unit of
/// work issues at most one transaction at a time on its driver.
pub trait StoreDriver: Send + Sync {
    /// Run a query and return all rows.
    fn execute_query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Run a statement and return the number of affected rows.
    fn execute_non_query(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Run an INSERT and return the store-generated row id, if the store reports one.
    ///
    /// Drivers without generated keys keep the default, which reports none.
    fn execute_insert(&self, sql: &str, params: &[Value]) -> Result<Option<i64>> {
        self.execute_non_query(sql, params).map(|_| None)
    }

    fn begin_transaction(&self) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }
}

impl<D: StoreDriver + ?Sized> StoreDriver for std::sync::Arc<D> {
    fn execute_query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        (**self).execute_query(sql, params)
    }

    fn execute_non_query(&self, sql: &str, params: &[Value]) -> Result<u64> {
        (**self).execute_non_query(sql, params)
    }

    fn execute_insert(&self, sql: &str, params: &[Value]) -> Result<Option<i64>> {
        (**self).execute_insert(sql, params)
    }

    fn begin_transaction(&self) -> Result<()> {
        (**self).begin_transaction()
    }

    fn commit(&self) -> Result<()> {
        (**self).commit()
    }

    fn rollback(&self) -> Result<()> {
        (**self).rollback()
    }

    fn dialect(&self) -> Dialect {
        (**self).dialect()
    }
}
