//! Building units of work.
//!
//! A [`SessionBuilder`] collects entity registrations and a
//! [`SessionConfig`] once, then opens any number of units of work that share
//! the resulting registry.
//!
//! # Example
//!
//! ```rust,ignore
//! use trackorm::prelude::*;
//!
//! let mut sessions = SessionBuilder::new()
//!     .register::<Customer>()?
//!     .register::<Invoice>()?
//!     .update_mode(UpdateMode::FullRow);
//!
//! let driver = Arc::new(SqliteDriver::open_memory()?);
//! let uow = sessions.open(Arc::clone(&driver));
//! ```

use std::sync::Arc;
use trackorm_core::{Entity, EntityMeta, EntityRegistry, Result, StoreDriver};
use trackorm_session::{MergePolicy, SessionConfig, UnitOfWork, UpdateMode};

/// Registry and configuration shared by the units of work it opens.
#[derive(Debug, Clone, Default)]
pub struct SessionBuilder {
    registry: EntityRegistry,
    config: SessionConfig,
    frozen: Option<Arc<EntityRegistry>>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity type.
    pub fn register<E: Entity>(mut self) -> Result<Self> {
        self.registry.register::<E>()?;
        self.frozen = None;
        Ok(self)
    }

    /// Register metadata built by hand.
    pub fn register_meta(mut self, meta: EntityMeta) -> Result<Self> {
        self.registry.register_meta(meta)?;
        self.frozen = None;
        Ok(self)
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn update_mode(mut self, mode: UpdateMode) -> Self {
        self.config = self.config.update_mode(mode);
        self
    }

    pub fn merge_policy(mut self, policy: MergePolicy) -> Self {
        self.config = self.config.merge_policy(policy);
        self
    }

    pub fn validate_store_dependents(mut self, enabled: bool) -> Self {
        self.config = self.config.validate_store_dependents(enabled);
        self
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Open a unit of work over `driver`.
    ///
    /// Units of work opened from the same builder share one registry.
    pub fn open<D: StoreDriver + 'static>(&mut self, driver: D) -> UnitOfWork<D> {
        let registry = self.frozen.get_or_insert_with(|| {
            tracing::debug!(entities = self.registry.len(), "Freezing entity registry");
            Arc::new(self.registry.clone())
        });
        UnitOfWork::with_config(driver, Arc::clone(registry), self.config.clone())
    }
}
