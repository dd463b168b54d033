//! Entity registry: table, key, column and navigation metadata by table name.

use crate::entity::{Entity, FieldInfo};
use crate::error::{ConfigError, Error, Result, ValidationErrorKind};
use crate::relationship::{NavigationInfo, NavigationKind};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Static metadata of one registered entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityMeta {
    pub table: &'static str,
    pub primary_key: &'static [&'static str],
    pub fields: &'static [FieldInfo],
    pub navigations: &'static [NavigationInfo],
}

impl EntityMeta {
    pub fn of<E: Entity>() -> Self {
        Self {
            table: E::TABLE_NAME,
            primary_key: E::PRIMARY_KEY,
            fields: E::fields(),
            navigations: E::navigations(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&'static FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn navigation(&self, name: &str) -> Option<&'static NavigationInfo> {
        self.navigations.iter().find(|n| n.name == name)
    }

    /// The single store-generated key column, if the key is one.
    pub fn generated_key(&self) -> Option<&'static str> {
        match self.primary_key {
            [column] => self
                .field(column)
                .filter(|f| f.store_generated)
                .map(|f| f.name),
            _ => None,
        }
    }

    pub fn is_key_column(&self, name: &str) -> bool {
        self.primary_key.contains(&name)
    }

    /// Columns that are neither part of the key nor store-generated; the
    /// columns an UPDATE may write.
    pub fn value_columns(&self) -> impl Iterator<Item = &'static FieldInfo> {
        let key = self.primary_key;
        self.fields
            .iter()
            .filter(move |f| !key.contains(&f.name) && !f.store_generated)
    }

    /// Foreign keys declared by the fields, in declaration order.
    ///
    /// Fields referencing distinct columns of the same table form one
    /// composite key, so `(invoice_id, line_no)` pointing at
    /// `line_item(invoice_id, line_no)` is a single reference. Fields
    /// referencing the same column of a table (a billing and a shipping
    /// customer, say) are separate keys.
    pub fn foreign_keys(&self) -> Vec<ForeignKey> {
        let mut keys: Vec<ForeignKey> = Vec::new();
        for field in self.fields {
            let Some((target, column)) = field.references() else {
                continue;
            };
            let open = keys
                .iter_mut()
                .find(|k| k.target == target && !k.references.contains(&column));
            match open {
                Some(key) => {
                    key.columns.push(field.name);
                    key.references.push(column);
                    key.required &= !field.nullable;
                }
                None => keys.push(ForeignKey {
                    target,
                    columns: vec![field.name],
                    references: vec![column],
                    required: !field.nullable,
                }),
            }
        }
        keys
    }
}

/// One foreign key of an entity: `columns` pair up with `references` on `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub target: &'static str,
    pub columns: Vec<&'static str>,
    pub references: Vec<&'static str>,
    /// No column is nullable
    pub required: bool,
}

/// A foreign key pointing at some table, seen from the referenced side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependent {
    /// Table holding the foreign key
    pub table: &'static str,
    /// Foreign key columns on `table`
    pub columns: Vec<&'static str>,
    /// Referenced columns on the principal table, paired with `columns`
    pub references: Vec<&'static str>,
    /// No foreign key column is nullable
    pub required: bool,
}

fn identifier_pattern() -> Option<&'static Regex> {
    static IDENT: OnceLock<Option<Regex>> = OnceLock::new();
    IDENT
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
}

fn check_identifier(what: &str, name: &str) -> Result<()> {
    let valid = identifier_pattern().is_some_and(|re| re.is_match(name));
    if valid {
        Ok(())
    } else {
        Err(Error::Config(ConfigError::new(format!(
            "invalid {what} identifier '{name}'"
        ))))
    }
}

/// Lookup of entity metadata by table name.
///
/// Filled once at startup and shared read-only by every unit of work.
#[derive(Debug, Default, Clone)]
pub struct EntityRegistry {
    entities: HashMap<&'static str, EntityMeta>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity type. Registering a table again replaces its entry.
    pub fn register<E: Entity>(&mut self) -> Result<&mut Self> {
        self.register_meta(EntityMeta::of::<E>())
    }

    #[tracing::instrument(level = "debug", skip(self, meta), fields(table = meta.table))]
    pub fn register_meta(&mut self, meta: EntityMeta) -> Result<&mut Self> {
        validate_meta(&meta)?;
        if self.entities.insert(meta.table, meta).is_some() {
            tracing::debug!(table = meta.table, "Replaced entity registration");
        }
        Ok(self)
    }

    pub fn get(&self, table: &str) -> Option<&EntityMeta> {
        self.entities.get(table)
    }

    /// Like `get`, but an unregistered table is a validation error.
    pub fn require(&self, table: &str) -> Result<&EntityMeta> {
        self.get(table).ok_or_else(|| {
            Error::validation(
                ValidationErrorKind::Unknown,
                table,
                "entity type is not registered",
            )
        })
    }

    pub fn contains(&self, table: &str) -> bool {
        self.entities.contains_key(table)
    }

    /// Registered table names, sorted.
    pub fn tables(&self) -> Vec<&'static str> {
        let mut tables: Vec<_> = self.entities.keys().copied().collect();
        tables.sort_unstable();
        tables
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Every foreign key, on any registered table, that references `table`.
    pub fn dependents_of(&self, table: &str) -> Vec<Dependent> {
        let mut out: Vec<Dependent> = self
            .entities
            .values()
            .flat_map(|meta| {
                meta.foreign_keys()
                    .into_iter()
                    .filter(move |key| key.target == table)
                    .map(move |key| Dependent {
                        table: meta.table,
                        columns: key.columns,
                        references: key.references,
                        required: key.required,
                    })
            })
            .collect();
        out.sort_unstable_by(|a, b| (a.table, &a.columns).cmp(&(b.table, &b.columns)));
        out
    }

    /// Tables that `table` references through its foreign keys.
    pub fn dependencies_of(&self, table: &str) -> Vec<&'static str> {
        let Some(meta) = self.get(table) else {
            return Vec::new();
        };
        let mut out: Vec<_> = meta
            .fields
            .iter()
            .filter_map(FieldInfo::references)
            .map(|(target, _)| target)
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}

fn validate_meta(meta: &EntityMeta) -> Result<()> {
    check_identifier("table", meta.table)?;
    if meta.primary_key.is_empty() {
        return Err(Error::Config(ConfigError::new(format!(
            "entity '{}' declares no primary key",
            meta.table
        ))));
    }
    for field in meta.fields {
        check_identifier("column", field.name)?;
        if let Some(reference) = field.foreign_key {
            let Some((table, column)) = field.references() else {
                return Err(Error::Config(ConfigError::new(format!(
                    "foreign key '{}.{}' must be written as table.column, got '{}'",
                    meta.table, field.name, reference
                ))));
            };
            check_identifier("table", table)?;
            check_identifier("column", column)?;
        }
    }
    for column in meta.primary_key {
        if meta.field(column).is_none() {
            return Err(Error::Config(ConfigError::new(format!(
                "primary key column '{}' is not a field of '{}'",
                column, meta.table
            ))));
        }
    }
    for nav in meta.navigations {
        check_identifier("navigation", nav.name)?;
        check_identifier("table", nav.target)?;
        if nav.local_columns.is_empty() || nav.local_columns.len() != nav.remote_columns.len() {
            return Err(Error::Config(ConfigError::new(format!(
                "navigation '{}.{}' must pair local and remote columns one to one",
                meta.table, nav.name
            ))));
        }
        for column in nav.local_columns {
            if meta.field(column).is_none() {
                return Err(Error::Config(ConfigError::new(format!(
                    "navigation '{}.{}' uses unknown column '{}'",
                    meta.table, nav.name, column
                ))));
            }
        }
        for column in nav.remote_columns {
            check_identifier("column", column)?;
        }
        if nav.kind == NavigationKind::OneToMany
            && nav.local_columns.iter().any(|c| !meta.is_key_column(c))
        {
            return Err(Error::Config(ConfigError::new(format!(
                "one-to-many navigation '{}.{}' must start from the primary key",
                meta.table, nav.name
            ))));
        }
    }
    Ok(())
}
