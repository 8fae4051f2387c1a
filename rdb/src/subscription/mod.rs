use crate::query::Selection;
use crate::record::{row_id, Record, Row};
use crate::table::Table;
use crate::watcher::WatchHandle;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Kind of change reported to a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Removed,
    Updated,
}

/// One batch of changes of a single kind.
#[derive(Debug, Clone)]
pub struct SubscriptionEvent {
    pub kind: ChangeKind,
    /// The rows affected by this change
    pub records: Vec<Record>,
    /// Full result set of the subscribed query after the change
    pub snapshot: Vec<Record>,
}

pub type Listener = Arc<dyn Fn(&SubscriptionEvent) + Send + Sync>;

/// Difference between two result sets, by row id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotDiff {
    pub added: Vec<Row>,
    pub removed: Vec<Row>,
    pub updated: Vec<Row>,
}

fn serialized(row: &Row) -> String {
    serde_json::to_string(row).unwrap_or_default()
}

/// Compare two snapshots. Returns `None` when they serialize identically.
///
/// * added: rows in `next` whose id is not in `current`
/// * removed: rows in `current` whose id is not in `next`
/// * updated: rows in both whose serialized form differs
pub fn diff_snapshots(current: &[Row], next: &[Row]) -> Option<SnapshotDiff> {
    let current_text: Vec<String> = current.iter().map(serialized).collect();
    let next_text: Vec<String> = next.iter().map(serialized).collect();
    if current_text == next_text {
        return None;
    }

    let before: HashMap<Option<u64>, &String> = current
        .iter()
        .map(row_id)
        .zip(current_text.iter())
        .collect();
    let after_ids: HashSet<Option<u64>> = next.iter().map(row_id).collect();

    let mut diff = SnapshotDiff::default();
    for (row, text) in next.iter().zip(next_text.iter()) {
        match before.get(&row_id(row)) {
            None => diff.added.push(row.clone()),
            Some(previous) if *previous != text => diff.updated.push(row.clone()),
            Some(_) => {}
        }
    }
    diff.removed = current
        .iter()
        .filter(|row| !after_ids.contains(&row_id(row)))
        .cloned()
        .collect();
    Some(diff)
}

pub(crate) struct SubscriptionEntry {
    id: u64,
    selection: Selection,
    snapshot: Vec<Row>,
    listener: Listener,
}

/// Active subscriptions of one table plus the watch feeding them.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    next_id: u64,
    entries: Vec<SubscriptionEntry>,
    watch: Option<WatchHandle>,
}

impl SubscriptionRegistry {
    pub fn add(&mut self, selection: Selection, snapshot: Vec<Row>, listener: Listener) -> u64 {
        self.next_id += 1;
        self.entries.push(SubscriptionEntry {
            id: self.next_id,
            selection,
            snapshot,
            listener,
        });
        self.next_id
    }

    /// Remove one subscription. Once none remain, the watch is handed back so
    /// the caller can stop it outside the registry lock.
    pub fn remove(&mut self, id: u64) -> (bool, Option<WatchHandle>) {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        let removed = self.entries.len() != before;
        let watch = if self.entries.is_empty() {
            self.watch.take()
        } else {
            None
        };
        (removed, watch)
    }

    pub fn clear(&mut self) -> Option<WatchHandle> {
        self.entries.clear();
        self.watch.take()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_watching(&self) -> bool {
        self.watch.is_some()
    }

    pub fn set_watch(&mut self, watch: WatchHandle) {
        self.watch = Some(watch);
    }

    /// Re-run every subscription against `records` and collect the events
    /// to deliver. Snapshots are replaced as a side effect.
    pub fn evaluate(&mut self, table: &Table, records: &[Record]) -> Vec<(Listener, SubscriptionEvent)> {
        let mut deliveries = Vec::new();

        for entry in &mut self.entries {
            let next: Vec<Row> = match entry.selection.apply(records.to_vec()) {
                Ok(selected) => selected.into_iter().map(Record::into_fields).collect(),
                Err(e) => {
                    log::warn!(
                        "Subscription {} on table '{}' failed to re-evaluate: {e}",
                        entry.id,
                        table.name()
                    );
                    continue;
                }
            };

            let Some(diff) = diff_snapshots(&entry.snapshot, &next) else {
                continue;
            };

            let to_records = |rows: Vec<Row>| -> Vec<Record> {
                rows.into_iter()
                    .map(|row| Record::from_row(table.clone(), row))
                    .collect()
            };
            let snapshot = to_records(next.clone());
            for (kind, rows) in [
                (ChangeKind::Added, diff.added),
                (ChangeKind::Removed, diff.removed),
                (ChangeKind::Updated, diff.updated),
            ] {
                if rows.is_empty() {
                    continue;
                }
                deliveries.push((
                    Arc::clone(&entry.listener),
                    SubscriptionEvent {
                        kind,
                        records: to_records(rows),
                        snapshot: snapshot.clone(),
                    },
                ));
            }
            entry.snapshot = next;
        }

        deliveries
    }
}

/// Handle to a live subscription. Events keep flowing until
/// [`Subscription::unsubscribe`] is called or the table is dropped.
pub struct Subscription {
    id: u64,
    table: Table,
}

impl Subscription {
    pub(crate) fn new(id: u64, table: Table) -> Self {
        Subscription { id, table }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Stop receiving events. Returns `false` if the subscription was already
    /// gone (for example because the table was dropped).
    pub fn unsubscribe(self) -> bool {
        self.table.unsubscribe(self.id)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("table", &self.table.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Operator, Query, Rule, Ruleset};
    use crate::schema::{Column, ColumnType, TableSchema};
    use crate::table::TableFile;
    use crate::watcher::PollingSource;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn ids(rows: &[Record]) -> Vec<u64> {
        rows.iter().map(Record::id).collect()
    }

    fn setup(interval: Duration) -> (TempDir, Table) {
        let tmp = TempDir::new().unwrap();
        let schema = TableSchema::new("people", vec![Column::new("age", ColumnType::Number)]);
        let path = tmp.path().join(schema.file_name());
        let table = Table::open(schema, path, Arc::new(PollingSource::new(interval))).unwrap();
        table.insert(row(json!({ "age": 20 }))).unwrap();
        table.insert(row(json!({ "age": 40 }))).unwrap();
        (tmp, table)
    }

    /// Rewrite the table file the way another writer would.
    fn edit_externally(table: &Table, edit: impl FnOnce(&mut TableFile)) {
        let mut file = TableFile::read(table.path()).unwrap();
        edit(&mut file);
        file.write(table.path()).unwrap();
    }

    fn drain(rx: &mpsc::Receiver<SubscriptionEvent>) -> Vec<SubscriptionEvent> {
        rx.try_iter().collect()
    }

    #[test]
    fn test_diff_identical_is_none() {
        let rows = vec![row(json!({ "id": 1, "age": 20 }))];
        assert_eq!(diff_snapshots(&rows, &rows.clone()), None);
    }

    #[test]
    fn test_diff_by_id() {
        let current = vec![
            row(json!({ "id": 1, "age": 20 })),
            row(json!({ "id": 2, "age": 40 })),
        ];
        let next = vec![
            row(json!({ "id": 1, "age": 21 })),
            row(json!({ "id": 3, "age": 50 })),
        ];
        let diff = diff_snapshots(&current, &next).unwrap();
        assert_eq!(diff.added, vec![row(json!({ "id": 3, "age": 50 }))]);
        assert_eq!(diff.removed, vec![row(json!({ "id": 2, "age": 40 }))]);
        assert_eq!(diff.updated, vec![row(json!({ "id": 1, "age": 21 }))]);
    }

    #[test]
    fn test_diff_reorder_only_reports_nothing_per_group() {
        let a = row(json!({ "id": 1 }));
        let b = row(json!({ "id": 2 }));
        let diff = diff_snapshots(&[a.clone(), b.clone()], &[b, a]).unwrap();
        assert_eq!(diff, SnapshotDiff::default());
    }

    #[test]
    fn test_external_update_and_insert() {
        let (_tmp, table) = setup(Duration::from_secs(3600));
        let (subscription, rx) = Query::new(table.clone())
            .and_where(Rule::new("age", Operator::Gt, 30))
            .watch()
            .unwrap();

        edit_externally(&table, |file| {
            file.data[1].insert("age".into(), json!(25));
            file.data.push(row(json!({
                "id": 3,
                "age": 50,
                "createdAt": "2024-01-01T00:00:00.000Z",
                "updatedAt": "2024-01-01T00:00:00.000Z"
            })));
            file.last_insert_id = 3;
        });
        table.refresh_subscriptions().unwrap();

        let events = drain(&rx);
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Added, ChangeKind::Removed]);
        assert_eq!(ids(&events[0].records), vec![3]);
        assert_eq!(ids(&events[1].records), vec![2]);
        assert_eq!(ids(&events[1].snapshot), vec![3]);

        // Nothing changed since, so the next tick is silent.
        table.refresh_subscriptions().unwrap();
        assert!(drain(&rx).is_empty());
        assert!(subscription.unsubscribe());
    }

    #[test]
    fn test_updated_event() {
        let (_tmp, table) = setup(Duration::from_secs(3600));
        let (_subscription, rx) = Query::new(table.clone()).watch().unwrap();

        table
            .update(
                &Ruleset::all().and(Rule::new("id", Operator::Eq, 1)),
                row(json!({ "age": 21 })),
            )
            .unwrap();
        table.refresh_subscriptions().unwrap();

        let events = drain(&rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Updated);
        assert_eq!(events[0].records[0].get("age"), Some(&json!(21)));
        assert_eq!(events[0].snapshot.len(), 2);
    }

    #[test]
    fn test_unsubscribe_stops_events_and_watch() {
        let (_tmp, table) = setup(Duration::from_secs(3600));
        let (subscription, rx) = Query::new(table.clone()).watch().unwrap();
        assert_eq!(table.subscription_count(), 1);

        assert!(subscription.unsubscribe());
        assert_eq!(table.subscription_count(), 0);
        assert!(!table.is_watching());

        table.insert(row(json!({ "age": 70 }))).unwrap();
        table.refresh_subscriptions().unwrap();
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn test_record_subscription_forwards_removed_and_updated() {
        let (_tmp, table) = setup(Duration::from_secs(3600));
        let record = table.records().unwrap().remove(0);
        let (tx, rx) = mpsc::channel();
        let _subscription = record
            .subscribe(move |event| {
                let _ = tx.send(event.kind);
            })
            .unwrap();

        let mut copy = record.clone();
        copy.set("age", json!(22));
        copy.save().unwrap();
        table.refresh_subscriptions().unwrap();

        record.remove().unwrap();
        table.refresh_subscriptions().unwrap();

        let kinds: Vec<_> = rx.try_iter().collect();
        assert_eq!(kinds, vec![ChangeKind::Updated, ChangeKind::Removed]);
    }

    #[test]
    fn test_polling_drives_subscriptions() {
        let (_tmp, table) = setup(Duration::from_millis(20));
        let (_subscription, rx) = Query::new(table.clone())
            .and_where(Rule::new("age", Operator::Gte, 60))
            .watch()
            .unwrap();
        assert!(table.is_watching());

        table.insert(row(json!({ "age": 65 }))).unwrap();
        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.kind, ChangeKind::Added);
        assert_eq!(ids(&event.records), vec![3]);
    }

    #[test]
    fn test_drop_detaches_subscriptions() {
        let (_tmp, table) = setup(Duration::from_secs(3600));
        let (subscription, _rx) = Query::new(table.clone()).watch().unwrap();
        table.drop().unwrap();
        assert_eq!(table.subscription_count(), 0);
        assert!(!table.is_watching());
        assert!(!subscription.unsubscribe());
    }
}
