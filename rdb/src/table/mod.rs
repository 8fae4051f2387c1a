mod file;

pub use file::TableFile;

use crate::error::{RdbError, Result};
use crate::lock::{TableLock, TableLockGuard};
use crate::query::{values_equal, Ruleset, Selection};
use crate::record::{row_id, timestamp, Record, Row};
use crate::schema::{TableSchema, RESERVED_COLUMNS};
use crate::subscription::{Listener, Subscription, SubscriptionRegistry};
use crate::validation;
use crate::watcher::ChangeSource;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Handle to one table file. Cloning is cheap; clones share the lock,
/// the dropped flag and the subscriptions.
#[derive(Clone)]
pub struct Table {
    inner: Arc<TableInner>,
}

struct TableInner {
    name: String,
    schema: TableSchema,
    path: PathBuf,
    lock: TableLock,
    dropped: AtomicBool,
    subscriptions: Mutex<SubscriptionRegistry>,
    change_source: Arc<dyn ChangeSource>,
}

impl Table {
    /// Open the table stored at `path`, creating the file if it does not
    /// exist yet. The schema given here is authoritative and is written back
    /// on every write.
    pub fn open(
        schema: TableSchema,
        path: PathBuf,
        change_source: Arc<dyn ChangeSource>,
    ) -> Result<Self> {
        schema.validate()?;

        if !path.exists() {
            log::info!(
                "Creating table {} with columns: {}",
                schema.name,
                schema.column_names().join(", ")
            );
            TableFile::new(schema.clone()).write(&path)?;
        } else {
            // Fail early on a file that is not a table.
            TableFile::read(&path)?;
        }

        Ok(Table {
            inner: Arc::new(TableInner {
                name: schema.name.clone(),
                schema,
                path,
                lock: TableLock::new(),
                dropped: AtomicBool::new(false),
                subscriptions: Mutex::new(SubscriptionRegistry::default()),
                change_source,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn schema(&self) -> &TableSchema {
        &self.inner.schema
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.inner.schema.column_names()
    }

    pub fn is_dropped(&self) -> bool {
        self.inner.dropped.load(Ordering::SeqCst)
    }

    pub fn ensure_active(&self) -> Result<()> {
        if self.is_dropped() {
            return Err(RdbError::TableDropped(self.inner.name.clone()));
        }
        Ok(())
    }

    pub fn last_insert_id(&self) -> Result<u64> {
        self.ensure_active()?;
        Ok(self.read_file()?.last_insert_id)
    }

    pub(crate) fn lock_writes(&self) -> TableLockGuard<'_> {
        self.inner.lock.lock()
    }

    pub(crate) fn read_file(&self) -> Result<TableFile> {
        TableFile::read(&self.inner.path)
    }

    pub(crate) fn write_file(&self, file: &mut TableFile) -> Result<()> {
        file.schema = self.inner.schema.clone();
        file.write(&self.inner.path)?;
        log::debug!(
            "Wrote table {} ({} rows, lastInsertID {})",
            self.inner.name,
            file.data.len(),
            file.last_insert_id
        );
        Ok(())
    }

    fn to_records(&self, rows: Vec<Row>) -> Vec<Record> {
        rows.into_iter()
            .map(|row| Record::from_row(self.clone(), row))
            .collect()
    }

    // ── Insert ──────────────────────────────────────────────────────

    /// Validate `row` and append it with a fresh id. Nothing is written when
    /// validation fails.
    pub fn insert(&self, row: Row) -> Result<Record> {
        self.ensure_active()?;
        let _guard = self.lock_writes();
        self.insert_locked(row)
    }

    /// Insert rows one after another under a single lock hold. The first
    /// failure stops the batch; rows before it stay inserted.
    pub fn insert_many(&self, rows: Vec<Row>) -> Result<Vec<Record>> {
        self.ensure_active()?;
        let _guard = self.lock_writes();
        rows.into_iter().map(|row| self.insert_locked(row)).collect()
    }

    fn insert_locked(&self, mut row: Row) -> Result<Record> {
        // The table may have been dropped while we waited for the lock.
        self.ensure_active()?;
        let schema = &self.inner.schema;
        let mut file = self.read_file()?;
        let id = file.last_insert_id + 1;

        validation::validate_row(schema, &row)?;

        for column in schema.columns.iter().filter(|c| c.auto_increment) {
            row.entry(column.name.clone()).or_insert_with(|| Value::from(id));
        }

        check_unique(schema, &file.data, &row, None)?;

        let now = timestamp();
        row.insert("id".into(), Value::from(id));
        row.insert("createdAt".into(), Value::String(now.clone()));
        row.insert("updatedAt".into(), Value::String(now));

        file.data.push(row.clone());
        file.last_insert_id = id;
        self.write_file(&mut file)?;
        log::debug!("Inserted record {}/{id}", self.inner.name);

        Ok(Record::from_row(self.clone(), row))
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// Records matching `ruleset`, in file order.
    pub fn find(&self, ruleset: &Ruleset) -> Result<Vec<Record>> {
        self.find_with(&Selection::new(ruleset.clone()))
    }

    pub fn find_with(&self, selection: &Selection) -> Result<Vec<Record>> {
        self.ensure_active()?;
        selection.check_columns(&self.inner.schema)?;
        selection.apply(self.records()?)
    }

    pub fn find_one(&self, ruleset: &Ruleset) -> Result<Option<Record>> {
        let selection = Selection {
            limit: Some(1),
            ..Selection::new(ruleset.clone())
        };
        Ok(self.find_with(&selection)?.into_iter().next())
    }

    /// Every row in the table.
    pub fn records(&self) -> Result<Vec<Record>> {
        self.ensure_active()?;
        let file = self.read_file()?;
        Ok(self.to_records(file.data))
    }

    pub fn count(&self) -> Result<usize> {
        self.ensure_active()?;
        Ok(self.read_file()?.data.len())
    }

    // ── Update ──────────────────────────────────────────────────────

    /// Apply `patch` to every matching record. Returns how many records
    /// actually changed on disk.
    pub fn update(&self, ruleset: &Ruleset, patch: Row) -> Result<usize> {
        let changed = self.update_selection(&Selection::new(ruleset.clone()), &patch)?;
        Ok(changed.len())
    }

    pub(crate) fn update_selection(&self, selection: &Selection, patch: &Row) -> Result<Vec<Record>> {
        self.ensure_active()?;
        selection.check_columns(&self.inner.schema)?;
        let schema = &self.inner.schema;

        for (column, value) in patch {
            if RESERVED_COLUMNS.contains(&column.as_str()) {
                return Err(RdbError::Query(format!(
                    "Column '{column}' is managed by the table and cannot be updated"
                )));
            }
            validation::validate_change(schema, column, value)?;
        }

        let _guard = self.lock_writes();
        self.ensure_active()?;

        let all = self.records()?;
        let matched = selection.apply(all.clone())?;
        let matched_ids: HashSet<u64> = matched.iter().map(Record::id).collect();

        for column in schema.columns.iter().filter(|c| c.unique) {
            let Some(value) = patch.get(&column.name).filter(|v| !v.is_null()) else {
                continue;
            };
            if matched.len() > 1 {
                return Err(RdbError::Validation(format!(
                    "Column '{}' is unique and cannot be set to {value} on {} records",
                    column.name,
                    matched.len()
                )));
            }
            if let Some(existing) = all.iter().find(|r| {
                !matched_ids.contains(&r.id())
                    && r.get(&column.name).is_some_and(|v| values_equal(v, value))
            }) {
                return Err(RdbError::Validation(format!(
                    "Column '{name}' is unique but a record with this '{name}: {value}' \
                     already exists: {}",
                    existing.id(),
                    name = column.name,
                )));
            }
        }

        let mut changed = Vec::new();
        for mut record in matched {
            for (column, value) in patch {
                record.set(column.clone(), value.clone());
            }
            if record.save_locked()? {
                changed.push(record);
            }
        }
        Ok(changed)
    }

    // ── Remove / delete ─────────────────────────────────────────────

    /// Remove the row backing `record`. Returns `false` if it was already gone.
    pub fn remove(&self, record: &Record) -> Result<bool> {
        self.ensure_active()?;
        let _guard = self.lock_writes();
        self.ensure_active()?;

        let mut file = self.read_file()?;
        let Some(index) = file.position(record.id()) else {
            return Ok(false);
        };
        file.data.remove(index);
        self.write_file(&mut file)?;
        Ok(true)
    }

    /// Delete every matching record in one write. The returned [`Undo`] can
    /// put them back.
    pub fn delete(&self, ruleset: &Ruleset) -> Result<Undo> {
        self.delete_selection(&Selection::new(ruleset.clone()))
    }

    pub(crate) fn delete_selection(&self, selection: &Selection) -> Result<Undo> {
        self.ensure_active()?;
        selection.check_columns(&self.inner.schema)?;
        let _guard = self.lock_writes();
        self.ensure_active()?;

        let mut file = self.read_file()?;
        let removed = selection.apply(self.to_records(file.data.clone()))?;
        if !removed.is_empty() {
            let ids: HashSet<u64> = removed.iter().map(Record::id).collect();
            file.data
                .retain(|row| !row_id(row).is_some_and(|id| ids.contains(&id)));
            self.write_file(&mut file)?;
        }

        Ok(Undo {
            table: self.clone(),
            rows: removed.into_iter().map(Record::into_fields).collect(),
        })
    }

    // ── Drop ────────────────────────────────────────────────────────

    /// Delete the table file. Every later call on this table, or on any
    /// clone of it, fails with [`RdbError::TableDropped`].
    pub fn drop(&self) -> Result<()> {
        let _guard = self.lock_writes();
        if self.inner.dropped.swap(true, Ordering::SeqCst) {
            return Err(RdbError::TableDropped(self.inner.name.clone()));
        }

        let watch = self.registry().clear();
        if let Some(watch) = watch {
            watch.stop();
        }

        match std::fs::remove_file(&self.inner.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        log::info!("Dropped table {}", self.inner.name);
        Ok(())
    }

    // ── Subscriptions ───────────────────────────────────────────────

    fn registry(&self) -> MutexGuard<'_, SubscriptionRegistry> {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscription_count(&self) -> usize {
        self.registry().len()
    }

    /// Whether a change source is currently watching the table file.
    pub fn is_watching(&self) -> bool {
        self.registry().is_watching()
    }

    pub(crate) fn subscribe(&self, selection: Selection, listener: Listener) -> Result<Subscription> {
        self.ensure_active()?;
        selection.check_columns(&self.inner.schema)?;
        let snapshot: Vec<Row> = selection
            .apply(self.records()?)?
            .into_iter()
            .map(Record::into_fields)
            .collect();

        let mut registry = self.registry();
        let id = registry.add(selection, snapshot, listener);

        if !registry.is_watching() {
            let weak = Arc::downgrade(&self.inner);
            let started = self.inner.change_source.watch(
                &self.inner.path,
                Box::new(move || {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let table = Table { inner };
                    if let Err(e) = table.refresh_subscriptions() {
                        log::warn!("Refreshing subscriptions on {} failed: {e}", table.name());
                    }
                }),
            );
            match started {
                Ok(watch) => registry.set_watch(watch),
                Err(e) => {
                    registry.remove(id);
                    return Err(e);
                }
            }
        }

        log::debug!("Subscription {id} added on table {}", self.inner.name);
        Ok(Subscription::new(id, self.clone()))
    }

    /// Remove a subscription; the change source stops with the last one.
    pub(crate) fn unsubscribe(&self, id: u64) -> bool {
        let (removed, watch) = self.registry().remove(id);
        if let Some(watch) = watch {
            watch.stop();
        }
        removed
    }

    /// Re-read the table and notify every subscription whose result set
    /// changed since the last evaluation. This is what each change-source
    /// tick runs.
    pub fn refresh_subscriptions(&self) -> Result<()> {
        self.ensure_active()?;
        if self.subscription_count() == 0 {
            return Ok(());
        }
        let records = self.records()?;
        let deliveries = self.registry().evaluate(self, &records);
        log::debug!(
            "Subscription tick on {}: {} event(s)",
            self.inner.name,
            deliveries.len()
        );
        for (listener, event) in deliveries {
            listener(&event);
        }
        Ok(())
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.inner.name)
            .field("path", &self.inner.path)
            .field("dropped", &self.is_dropped())
            .finish()
    }
}

/// Fail if `row` repeats the value of a `unique` column held by any row in
/// `rows` other than `own_id`. Nulls never conflict.
pub(crate) fn check_unique(
    schema: &TableSchema,
    rows: &[Row],
    row: &Row,
    own_id: Option<u64>,
) -> Result<()> {
    for column in schema.columns.iter().filter(|c| c.unique) {
        let Some(value) = row.get(&column.name).filter(|v| !v.is_null()) else {
            continue;
        };
        let conflict = rows.iter().find(|other| {
            (own_id.is_none() || row_id(other) != own_id)
                && other.get(&column.name).is_some_and(|v| values_equal(v, value))
        });
        if let Some(existing) = conflict {
            return Err(RdbError::Validation(format!(
                "Column '{name}' is unique but a record with this '{name}: {value}' \
                 already exists: {}",
                row_id(existing).unwrap_or_default(),
                name = column.name,
            )));
        }
    }
    Ok(())
}

/// Compensating action for [`Table::delete`].
#[derive(Debug)]
pub struct Undo {
    table: Table,
    rows: Vec<Row>,
}

impl Undo {
    pub fn removed(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_removed(self) -> Vec<Record> {
        self.table.to_records(self.rows)
    }

    /// Put the removed rows back with their original ids. Rows whose id has
    /// reappeared in the meantime, or whose `unique` values are now taken by
    /// another row, are skipped. Returns how many were restored.
    pub fn undo(self) -> Result<usize> {
        if self.rows.is_empty() {
            return Ok(0);
        }
        let table = &self.table;
        table.ensure_active()?;
        let _guard = table.lock_writes();
        table.ensure_active()?;

        let mut file = table.read_file()?;
        let present: HashSet<Option<u64>> = file.data.iter().map(row_id).collect();
        let mut restored = 0;
        for row in self.rows {
            if present.contains(&row_id(&row)) {
                continue;
            }
            if let Err(e) = check_unique(table.schema(), &file.data, &row, None) {
                log::warn!("Not restoring {}/{}: {e}", table.name(), row_id(&row).unwrap_or_default());
                continue;
            }
            file.data.push(row);
            restored += 1;
        }
        if restored > 0 {
            file.data.sort_by_key(|row| row_id(row).unwrap_or_default());
            table.write_file(&mut file)?;
        }
        Ok(restored)
    }
}
