//! Embedded record store keeping each table in a single JSON file, with
//! schema validation, rule-based queries and live query subscriptions.

pub mod database;
pub mod error;
pub mod lock;
pub mod query;
pub mod record;
pub mod schema;
pub mod subscription;
pub mod table;
pub mod validation;
pub mod watcher;

pub use database::{Database, DatabaseOptions};
pub use error::{RdbError, Result};
pub use query::{Direction, Operator, OrderBy, Query, QueryKind, Rule, Ruleset, Selection};
pub use record::{Record, Row};
pub use schema::{Column, ColumnType, TableSchema};
pub use subscription::{ChangeKind, Subscription, SubscriptionEvent};
pub use table::{Table, Undo};
pub use watcher::{ChangeSource, ChangeSourceKind, NotifySource, PollingSource, WatchHandle};
