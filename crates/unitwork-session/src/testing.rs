//! Mock models shared by the unit tests in this crate.

use std::sync::{Arc, PoisonError, RwLock, Weak};
use unitwork_core::{
    ColumnInfo, EntityRef, Model, ModelRef, Record, RelationInfo, Result, Value, entity_ref,
    model_ref,
};

fn read_id(record: &Record, slot: &mut Option<i64>) {
    if let Some(id) = record.get("id").and_then(Value::as_i64) {
        *slot = Some(id);
    }
}

pub(crate) struct Item {
    pub id: Option<i64>,
    pub name: String,
}

impl Model for Item {
    const ENTITY_NAME: &'static str = "items";

    fn fields() -> &'static [ColumnInfo] {
        static FIELDS: &[ColumnInfo] = &[
            ColumnInfo::new("id").primary_key(true).generated(true),
            ColumnInfo::new("name"),
        ];
        FIELDS
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id)
            .with("name", self.name.as_str())
    }

    fn apply_record(&mut self, record: &Record) -> Result<()> {
        read_id(record, &mut self.id);
        if let Some(name) = record.get("name").and_then(Value::as_str) {
            self.name = name.to_string();
        }
        Ok(())
    }
}

pub(crate) fn item(name: &str) -> ModelRef<Item> {
    model_ref(Item {
        id: None,
        name: name.to_string(),
    })
}

pub(crate) struct Customer {
    pub id: Option<i64>,
    pub name: String,
}

impl Model for Customer {
    const ENTITY_NAME: &'static str = "customers";

    fn fields() -> &'static [ColumnInfo] {
        static FIELDS: &[ColumnInfo] = &[
            ColumnInfo::new("id").primary_key(true).generated(true),
            ColumnInfo::new("name"),
        ];
        FIELDS
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id)
            .with("name", self.name.as_str())
    }

    fn apply_record(&mut self, record: &Record) -> Result<()> {
        read_id(record, &mut self.id);
        Ok(())
    }
}

pub(crate) fn customer(name: &str) -> ModelRef<Customer> {
    model_ref(Customer {
        id: None,
        name: name.to_string(),
    })
}

/// Owns its line items and references a customer.
pub(crate) struct Order {
    pub id: Option<i64>,
    pub note: String,
    pub version: Option<i64>,
    pub customer: Option<ModelRef<Customer>>,
    pub lines: Vec<ModelRef<LineItem>>,
}

impl Model for Order {
    const ENTITY_NAME: &'static str = "orders";
    const RELATIONS: &'static [RelationInfo] = &[
        RelationInfo::child("lines", "line_items"),
        RelationInfo::parent("customer", "customers"),
    ];

    fn fields() -> &'static [ColumnInfo] {
        static FIELDS: &[ColumnInfo] = &[
            ColumnInfo::new("id").primary_key(true).generated(true),
            ColumnInfo::new("note"),
            ColumnInfo::new("version").version(true),
        ];
        FIELDS
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id)
            .with("note", self.note.as_str())
            .with("version", self.version)
    }

    fn apply_record(&mut self, record: &Record) -> Result<()> {
        read_id(record, &mut self.id);
        if let Some(version) = record.get("version").and_then(Value::as_i64) {
            self.version = Some(version);
        }
        Ok(())
    }

    fn related(&self, relation: &str) -> Vec<EntityRef> {
        match relation {
            "lines" => self.lines.iter().map(entity_ref).collect(),
            "customer" => self.customer.iter().map(entity_ref).collect(),
            _ => Vec::new(),
        }
    }
}

/// Points back at its order without keeping it alive.
pub(crate) struct LineItem {
    pub id: Option<i64>,
    pub sku: String,
    pub order: Option<Weak<RwLock<Order>>>,
}

impl Model for LineItem {
    const ENTITY_NAME: &'static str = "line_items";
    const RELATIONS: &'static [RelationInfo] = &[RelationInfo::parent("order", "orders")];

    fn fields() -> &'static [ColumnInfo] {
        static FIELDS: &[ColumnInfo] = &[
            ColumnInfo::new("id").primary_key(true).generated(true),
            ColumnInfo::new("sku"),
        ];
        FIELDS
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id)
            .with("sku", self.sku.as_str())
    }

    fn apply_record(&mut self, record: &Record) -> Result<()> {
        read_id(record, &mut self.id);
        Ok(())
    }

    fn related(&self, relation: &str) -> Vec<EntityRef> {
        match relation {
            "order" => self
                .order
                .as_ref()
                .and_then(Weak::upgrade)
                .map(|order| vec![entity_ref(&order)])
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

/// An order with one line item per sku, wired in both directions.
pub(crate) fn order_with_lines(
    note: &str,
    skus: &[&str],
) -> (ModelRef<Order>, Vec<ModelRef<LineItem>>) {
    let order = model_ref(Order {
        id: None,
        note: note.to_string(),
        version: None,
        customer: None,
        lines: Vec::new(),
    });
    let lines: Vec<_> = skus
        .iter()
        .map(|sku| {
            model_ref(LineItem {
                id: None,
                sku: (*sku).to_string(),
                order: Some(Arc::downgrade(&order)),
            })
        })
        .collect();
    order
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .lines
        .clone_from(&lines);
    (order, lines)
}
