use crate::error::{RdbError, Result};
use crate::query::{Operator, Query, Rule};
use crate::subscription::{ChangeKind, Subscription, SubscriptionEvent};
use crate::table::{self, Table};
use crate::validation;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

/// A flat key/value row as stored in a table file.
pub type Row = Map<String, Value>;

/// Current time in the timestamp format rows are stamped with.
pub fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Read the numeric `id` of a row.
pub fn row_id(row: &Row) -> Option<u64> {
    row.get("id").and_then(Value::as_u64)
}

/// In-memory, mutable view of one row, bound to the table it was read from.
///
/// Fields are kept in key order, so the serialized form is canonical. Two
/// records are equal when they belong to the same table and share an `id`.
#[derive(Clone)]
pub struct Record {
    table: Table,
    fields: Row,
}

impl Record {
    /// Wrap a row read from `table`. Rows lacking timestamps get them stamped;
    /// stored timestamps are kept as they are.
    pub(crate) fn from_row(table: Table, mut fields: Row) -> Self {
        if !fields.contains_key("createdAt") {
            fields.insert("createdAt".into(), Value::String(timestamp()));
        }
        if !fields.contains_key("updatedAt") {
            let created = fields.get("createdAt").cloned().unwrap_or(Value::Null);
            fields.insert("updatedAt".into(), created);
        }
        Record { table, fields }
    }

    /// Row id, or 0 for a row that was never stamped by a table.
    pub fn id(&self) -> u64 {
        row_id(&self.fields).unwrap_or_default()
    }

    pub fn created_at(&self) -> Option<&str> {
        self.fields.get("createdAt").and_then(Value::as_str)
    }

    pub fn updated_at(&self) -> Option<&str> {
        self.fields.get("updatedAt").and_then(Value::as_str)
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn fields(&self) -> &Row {
        &self.fields
    }

    pub fn into_fields(self) -> Row {
        self.fields
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    /// Raw field write. No validation and nothing is persisted.
    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        self.fields.insert(column.into(), value);
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// SHA-256 over the canonical JSON form of the fields, hex encoded.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Validate and set one column, saving right away when `autosave` is on.
    /// The record is left untouched if validation or the save fails; a
    /// `unique` conflict surfaces from the save.
    pub fn update(&mut self, column: &str, value: Value, autosave: bool) -> Result<()> {
        self.table.ensure_active()?;
        validation::validate_change(self.table.schema(), column, &value)?;
        let previous = self.fields.insert(column.to_string(), value);
        if autosave {
            if let Err(e) = self.save() {
                match previous {
                    Some(previous) => self.fields.insert(column.to_string(), previous),
                    None => self.fields.remove(column),
                };
                return Err(e);
            }
        }
        Ok(())
    }

    /// Write this record over its stored row. Returns `false` without writing
    /// when the stored row already serializes identically.
    pub fn save(&mut self) -> Result<bool> {
        let table = self.table.clone();
        table.ensure_active()?;
        let _guard = table.lock_writes();
        self.save_locked()
    }

    /// `save` for callers already holding the table lock.
    pub(crate) fn save_locked(&mut self) -> Result<bool> {
        let mut file = self.table.read_file()?;
        let id = self.id();
        let index = file.position(id).ok_or_else(|| RdbError::NotFound {
            table: self.table.name().to_string(),
            id,
        })?;

        if serde_json::to_string(&file.data[index])? == serde_json::to_string(&self.fields)? {
            return Ok(false);
        }

        table::check_unique(self.table.schema(), &file.data, &self.fields, Some(id))?;

        self.fields
            .insert("updatedAt".into(), Value::String(timestamp()));
        file.data[index] = self.fields.clone();
        self.table.write_file(&mut file)?;
        log::debug!("Saved record {}/{id}", self.table.name());
        Ok(true)
    }

    /// Delete this record's row from the table file.
    pub fn remove(&self) -> Result<bool> {
        self.table.remove(self)
    }

    /// Watch this record for changes. Only `removed` and `updated` events are
    /// forwarded.
    pub fn subscribe<F>(&self, listener: F) -> Result<Subscription>
    where
        F: Fn(&SubscriptionEvent) + Send + Sync + 'static,
    {
        Query::new(self.table.clone())
            .and_where(Rule::new("id", Operator::Eq, self.id()))
            .subscribe(move |event| {
                if matches!(event.kind, ChangeKind::Removed | ChangeKind::Updated) {
                    listener(event);
                }
            })
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id() && self.table.name() == other.table.name()
    }
}

impl Eq for Record {}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("table", &self.table.name())
            .field("fields", &self.fields)
            .finish()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(&self.fields).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}
