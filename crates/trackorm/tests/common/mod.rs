//! Sales schema shared by the SQLite integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use trackorm::prelude::*;
use trackorm::Row;

pub const SCHEMA: &str = "
    CREATE TABLE customer (
        customer_id INTEGER PRIMARY KEY,
        legal_name TEXT NOT NULL,
        gstin TEXT
    );
    CREATE TABLE customer_address (
        address_id INTEGER PRIMARY KEY,
        customer_id INTEGER NOT NULL REFERENCES customer(customer_id),
        city TEXT NOT NULL
    );
    CREATE TABLE invoice (
        invoice_id INTEGER PRIMARY KEY,
        customer_id INTEGER NOT NULL REFERENCES customer(customer_id),
        total REAL NOT NULL
    );
    CREATE TABLE product (
        product_id INTEGER PRIMARY KEY,
        sku TEXT NOT NULL UNIQUE,
        unit_price REAL NOT NULL
    );
    CREATE TABLE line_item (
        invoice_id INTEGER NOT NULL REFERENCES invoice(invoice_id),
        line_no INTEGER NOT NULL,
        product_id INTEGER NOT NULL REFERENCES product(product_id),
        quantity INTEGER NOT NULL,
        PRIMARY KEY (invoice_id, line_no)
    );
    CREATE TABLE promotion (
        promotion_id INTEGER PRIMARY KEY,
        active INTEGER NOT NULL,
        discount TEXT NOT NULL,
        rules TEXT
    );
";

#[derive(Debug, Clone, PartialEq)]
pub struct Customer {
    pub customer_id: Option<i64>,
    pub legal_name: String,
    pub gstin: Option<String>,
}

impl Entity for Customer {
    const TABLE_NAME: &'static str = "customer";
    const PRIMARY_KEY: &'static [&'static str] = &["customer_id"];

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("customer_id").primary_key().store_generated(),
            FieldInfo::new("legal_name"),
            FieldInfo::new("gstin").nullable(),
        ];
        FIELDS
    }

    fn navigations() -> &'static [NavigationInfo] {
        const NAVS: &[NavigationInfo] = &[
            NavigationInfo::one_to_many("invoices", "invoice", &["customer_id"], &["customer_id"]),
            NavigationInfo::one_to_many(
                "addresses",
                "customer_address",
                &["customer_id"],
                &["customer_id"],
            )
            .eager(),
        ];
        NAVS
    }

    fn to_values(&self) -> FieldValues {
        FieldValues::new()
            .with("customer_id", self.customer_id)
            .with("legal_name", self.legal_name.as_str())
            .with("gstin", self.gstin.clone())
    }

    fn from_values(values: &FieldValues) -> Result<Self> {
        Ok(Self {
            customer_id: values.get_as("customer_id")?,
            legal_name: values.get_as("legal_name")?,
            gstin: values.get_as("gstin")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomerAddress {
    pub address_id: Option<i64>,
    pub customer_id: Option<i64>,
    pub city: String,
}

impl Entity for CustomerAddress {
    const TABLE_NAME: &'static str = "customer_address";
    const PRIMARY_KEY: &'static [&'static str] = &["address_id"];

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("address_id").primary_key().store_generated(),
            FieldInfo::new("customer_id").foreign_key("customer.customer_id"),
            FieldInfo::new("city"),
        ];
        FIELDS
    }

    fn navigations() -> &'static [NavigationInfo] {
        const NAVS: &[NavigationInfo] = &[NavigationInfo::many_to_one(
            "customer",
            "customer",
            &["customer_id"],
            &["customer_id"],
        )];
        NAVS
    }

    fn to_values(&self) -> FieldValues {
        FieldValues::new()
            .with("address_id", self.address_id)
            .with("customer_id", self.customer_id)
            .with("city", self.city.as_str())
    }

    fn from_values(values: &FieldValues) -> Result<Self> {
        Ok(Self {
            address_id: values.get_as("address_id")?,
            customer_id: values.get_as("customer_id")?,
            city: values.get_as("city")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Invoice {
    pub invoice_id: Option<i64>,
    pub customer_id: Option<i64>,
    pub total: f64,
}

impl Entity for Invoice {
    const TABLE_NAME: &'static str = "invoice";
    const PRIMARY_KEY: &'static [&'static str] = &["invoice_id"];

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("invoice_id").primary_key().store_generated(),
            FieldInfo::new("customer_id").foreign_key("customer.customer_id"),
            FieldInfo::new("total"),
        ];
        FIELDS
    }

    fn navigations() -> &'static [NavigationInfo] {
        const NAVS: &[NavigationInfo] = &[
            NavigationInfo::many_to_one("customer", "customer", &["customer_id"], &["customer_id"]),
            NavigationInfo::one_to_many("lines", "line_item", &["invoice_id"], &["invoice_id"]),
        ];
        NAVS
    }

    fn to_values(&self) -> FieldValues {
        FieldValues::new()
            .with("invoice_id", self.invoice_id)
            .with("customer_id", self.customer_id)
            .with("total", self.total)
    }

    fn from_values(values: &FieldValues) -> Result<Self> {
        Ok(Self {
            invoice_id: values.get_as("invoice_id")?,
            customer_id: values.get_as("customer_id")?,
            total: values.get_as("total")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub product_id: Option<i64>,
    pub sku: String,
    pub unit_price: f64,
}

impl Entity for Product {
    const TABLE_NAME: &'static str = "product";
    const PRIMARY_KEY: &'static [&'static str] = &["product_id"];

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("product_id").primary_key().store_generated(),
            FieldInfo::new("sku"),
            FieldInfo::new("unit_price"),
        ];
        FIELDS
    }

    fn to_values(&self) -> FieldValues {
        FieldValues::new()
            .with("product_id", self.product_id)
            .with("sku", self.sku.as_str())
            .with("unit_price", self.unit_price)
    }

    fn from_values(values: &FieldValues) -> Result<Self> {
        Ok(Self {
            product_id: values.get_as("product_id")?,
            sku: values.get_as("sku")?,
            unit_price: values.get_as("unit_price")?,
        })
    }
}

/// Mapped to `line_item`; the type name and table name differ.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceLine {
    pub invoice_id: i64,
    pub line_no: i32,
    pub product_id: i64,
    pub quantity: i32,
}

impl Entity for InvoiceLine {
    const TABLE_NAME: &'static str = "line_item";
    const PRIMARY_KEY: &'static [&'static str] = &["invoice_id", "line_no"];

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("invoice_id")
                .primary_key()
                .foreign_key("invoice.invoice_id"),
            FieldInfo::new("line_no").primary_key(),
            FieldInfo::new("product_id").foreign_key("product.product_id"),
            FieldInfo::new("quantity"),
        ];
        FIELDS
    }

    fn navigations() -> &'static [NavigationInfo] {
        const NAVS: &[NavigationInfo] = &[
            NavigationInfo::many_to_one("invoice", "invoice", &["invoice_id"], &["invoice_id"]),
            NavigationInfo::many_to_one("product", "product", &["product_id"], &["product_id"]),
        ];
        NAVS
    }

    fn to_values(&self) -> FieldValues {
        FieldValues::new()
            .with("invoice_id", self.invoice_id)
            .with("line_no", self.line_no)
            .with("product_id", self.product_id)
            .with("quantity", self.quantity)
    }

    fn from_values(values: &FieldValues) -> Result<Self> {
        Ok(Self {
            invoice_id: values.get_as("invoice_id")?,
            line_no: values.get_as("line_no")?,
            product_id: values.get_as("product_id")?,
            quantity: values.get_as("quantity")?,
        })
    }
}

/// A SQLite driver that counts SELECTs.
/// Columns SQLite stores as INTEGER or TEXT, declared with their real types.
#[derive(Debug, Clone, PartialEq)]
pub struct Promotion {
    pub promotion_id: Option<i64>,
    pub active: bool,
    pub discount: String,
    pub rules: Option<serde_json::Value>,
}

impl Entity for Promotion {
    const TABLE_NAME: &'static str = "promotion";
    const PRIMARY_KEY: &'static [&'static str] = &["promotion_id"];

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("promotion_id").primary_key().store_generated(),
            FieldInfo::new("active").sql_type(SqlType::Boolean),
            FieldInfo::new("discount").sql_type(SqlType::Decimal),
            FieldInfo::new("rules").nullable().sql_type(SqlType::Json),
        ];
        FIELDS
    }

    fn to_values(&self) -> FieldValues {
        FieldValues::new()
            .with("promotion_id", self.promotion_id)
            .with("active", self.active)
            .with("discount", Value::Decimal(self.discount.clone()))
            .with("rules", self.rules.clone().map_or(Value::Null, Value::Json))
    }

    fn from_values(values: &FieldValues) -> Result<Self> {
        Ok(Self {
            promotion_id: values.get_as("promotion_id")?,
            active: values.get_as("active")?,
            discount: values.get_as("discount")?,
            rules: values.get_as("rules")?,
        })
    }
}

pub struct CountingDriver {
    pub inner: SqliteDriver,
    queries: AtomicUsize,
}

impl CountingDriver {
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl StoreDriver for CountingDriver {
    fn execute_query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.inner.execute_query(sql, params)
    }

    fn execute_non_query(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.inner.execute_non_query(sql, params)
    }

    fn execute_insert(&self, sql: &str, params: &[Value]) -> Result<Option<i64>> {
        self.inner.execute_insert(sql, params)
    }

    fn begin_transaction(&self) -> Result<()> {
        self.inner.begin_transaction()
    }

    fn commit(&self) -> Result<()> {
        self.inner.commit()
    }

    fn rollback(&self) -> Result<()> {
        self.inner.rollback()
    }
}

pub fn sessions() -> SessionBuilder {
    SessionBuilder::new()
        .register::<Customer>()
        .and_then(SessionBuilder::register::<CustomerAddress>)
        .and_then(SessionBuilder::register::<Invoice>)
        .and_then(SessionBuilder::register::<Product>)
        .and_then(SessionBuilder::register::<InvoiceLine>)
        .and_then(SessionBuilder::register::<Promotion>)
        .expect("register sales entities")
}

pub fn open_driver() -> Arc<CountingDriver> {
    let inner = SqliteDriver::open_memory().expect("open sqlite memory db");
    inner.execute_raw(SCHEMA).expect("create schema");
    Arc::new(CountingDriver {
        inner,
        queries: AtomicUsize::new(0),
    })
}

/// Two customers: Acme (1) with invoices 10 and 11 and one address, Birla (2)
/// with invoice 12.
pub fn seed(driver: &CountingDriver) {
    driver
        .inner
        .execute_raw(
            "INSERT INTO customer VALUES (1, 'Acme Traders', '27AAACA1234F1Z5'), (2, 'Birla Stores', NULL);
             INSERT INTO customer_address VALUES (1, 1, 'Pune');
             INSERT INTO invoice VALUES (10, 1, 120.0), (11, 1, 80.5), (12, 2, 42.0);
             INSERT INTO product VALUES (1, 'TEA-250', 4.5);
             INSERT INTO line_item VALUES (10, 1, 1, 3);",
        )
        .expect("seed rows");
}

pub fn get_i64(record: &RecordRef, field: &str) -> i64 {
    read_record(record).get_as::<i64>(field).expect("integer field")
}
