mod eval;

pub use eval::{compare_values, values_equal, CompiledRuleset};

use crate::error::{RdbError, Result};
use crate::record::{Record, Row};
use crate::schema::TableSchema;
use crate::subscription::{Subscription, SubscriptionEvent};
use crate::table::Table;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{mpsc, Arc};

/// Comparison operator of a single rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    /// Case-insensitive containment, not SQL `IN`
    #[serde(rename = "in")]
    In,
    #[serde(rename = "nin")]
    NotIn,
    #[serde(rename = "regex")]
    Regex,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::In => "in",
            Operator::NotIn => "nin",
            Operator::Regex => "regex",
        }
    }

    pub fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "=" | "==" => Operator::Eq,
            "!=" => Operator::Ne,
            ">" => Operator::Gt,
            ">=" => Operator::Gte,
            "<" => Operator::Lt,
            "<=" => Operator::Lte,
            "in" => Operator::In,
            "nin" => Operator::NotIn,
            "regex" => Operator::Regex,
            _ => return None,
        })
    }
}

/// A single `(column, op, value)` comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub column: String,
    pub op: Operator,
    pub value: Value,
}

impl Rule {
    pub fn new(column: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Rule {
            column: column.into(),
            op,
            value: value.into(),
        }
    }
}

/// Declarative AND/OR rule tree.
///
/// Every `and` rule must hold and at least one `or` rule must hold; a clause
/// that is absent counts as satisfied. A ruleset with neither clause matches
/// every row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ruleset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub and: Option<Vec<Rule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub or: Option<Vec<Rule>>,
}

impl Ruleset {
    /// The ruleset matching every row
    pub fn all() -> Self {
        Self::default()
    }

    pub fn and(mut self, rule: Rule) -> Self {
        self.and.get_or_insert_with(Vec::new).push(rule);
        self
    }

    pub fn or(mut self, rule: Rule) -> Self {
        self.or.get_or_insert_with(Vec::new).push(rule);
        self
    }

    /// True when neither clause was ever set.
    pub fn is_unconditional(&self) -> bool {
        self.and.is_none() && self.or.is_none()
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.and.iter().flatten().chain(self.or.iter().flatten())
    }

    pub fn compile(&self) -> Result<CompiledRuleset> {
        CompiledRuleset::compile(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub direction: Direction,
}

/// A ruleset plus the ordering and limit applied after filtering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub ruleset: Ruleset,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl Selection {
    pub fn new(ruleset: Ruleset) -> Self {
        Selection {
            ruleset,
            ..Default::default()
        }
    }

    /// Every column a rule or the ordering refers to must exist in the table.
    pub fn check_columns(&self, schema: &TableSchema) -> Result<()> {
        let referenced = self
            .ruleset
            .rules()
            .map(|r| r.column.as_str())
            .chain(self.order_by.iter().map(|o| o.column.as_str()));
        for column in referenced {
            if !schema.has_column(column) {
                return Err(RdbError::Query(format!(
                    "Column '{column}' does not exist in table {}. This is case-sensitive. \
                     Valid columns are: {}",
                    schema.name,
                    schema.column_names().join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Filter, then sort, then limit. Without a ruleset the filter step is
    /// skipped entirely.
    pub fn apply(&self, records: Vec<Record>) -> Result<Vec<Record>> {
        let mut selected = if self.ruleset.is_unconditional() {
            records
        } else {
            let compiled = self.ruleset.compile()?;
            records.into_iter().filter(|r| compiled.matches(r)).collect()
        };

        if let Some(order) = &self.order_by {
            selected.sort_by(|a, b| {
                eval::sort_order(a.get(&order.column), b.get(&order.column), order.direction)
            });
        }
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        Ok(selected)
    }
}

/// What a query does when executed
#[derive(Debug, Clone, PartialEq)]
pub enum QueryKind {
    Fetch,
    Insert(Vec<Row>),
    Update(Row),
    Delete,
}

impl QueryKind {
    pub fn name(&self) -> &'static str {
        match self {
            QueryKind::Fetch => "fetch",
            QueryKind::Insert(_) => "insert",
            QueryKind::Update(_) => "update",
            QueryKind::Delete => "delete",
        }
    }
}

/// Chainable query against one table.
///
/// ```no_run
/// # use rdb::{Database, DatabaseOptions, Operator, Rule, Direction};
/// # fn main() -> rdb::Result<()> {
/// let db = Database::open(DatabaseOptions::directory("data"))?;
/// let adults = db
///     .query("users")?
///     .and_where(Rule::new("age", Operator::Gt, 30))
///     .order_by("age", Direction::Desc)
///     .limit(10)
///     .execute()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Query {
    table: Table,
    selection: Selection,
    kind: QueryKind,
}

impl Query {
    pub fn new(table: Table) -> Self {
        Query {
            table,
            selection: Selection::default(),
            kind: QueryKind::Fetch,
        }
    }

    pub fn kind(&self) -> &QueryKind {
        &self.kind
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn ruleset(mut self, ruleset: Ruleset) -> Self {
        self.selection.ruleset = ruleset;
        self
    }

    /// Alias of [`Query::or_where`]; calling it repeatedly adds alternatives.
    pub fn filter(self, rule: Rule) -> Self {
        self.or_where(rule)
    }

    pub fn and_where(mut self, rule: Rule) -> Self {
        self.selection.ruleset = self.selection.ruleset.and(rule);
        self
    }

    pub fn or_where(mut self, rule: Rule) -> Self {
        self.selection.ruleset = self.selection.ruleset.or(rule);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.selection.limit = Some(limit);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, direction: Direction) -> Self {
        self.selection.order_by = Some(OrderBy {
            column: column.into(),
            direction,
        });
        self
    }

    /// Turn this into an insert query; may be called several times to batch rows.
    pub fn insert(mut self, row: Row) -> Self {
        match &mut self.kind {
            QueryKind::Insert(rows) => rows.push(row),
            _ => self.kind = QueryKind::Insert(vec![row]),
        }
        self
    }

    /// Turn this into an update query setting the given fields.
    pub fn set(mut self, patch: Row) -> Self {
        match &mut self.kind {
            QueryKind::Update(existing) => existing.extend(patch),
            _ => self.kind = QueryKind::Update(patch),
        }
        self
    }

    pub fn delete(mut self) -> Self {
        self.kind = QueryKind::Delete;
        self
    }

    /// Matching records, ignoring the query kind.
    pub fn find(&self) -> Result<Vec<Record>> {
        self.table.find_with(&self.selection)
    }

    /// Run the query.
    ///
    /// * fetch: the matching records, sorted and limited
    /// * insert: the inserted records; the first failure aborts the batch
    /// * update: the records that actually changed, chosen by the ruleset with
    ///   ordering and limit applied
    /// * delete: the removed records, chosen the same way
    pub fn execute(&self) -> Result<Vec<Record>> {
        match &self.kind {
            QueryKind::Fetch => self.find(),
            QueryKind::Insert(rows) => {
                if rows.is_empty() {
                    return Err(RdbError::Query("No data to insert".into()));
                }
                self.table.insert_many(rows.clone())
            }
            QueryKind::Update(patch) => self.table.update_selection(&self.selection, patch),
            QueryKind::Delete => Ok(self.table.delete_selection(&self.selection)?.into_removed()),
        }
    }

    /// Register a live subscription. Only fetch queries can be subscribed.
    pub fn subscribe<F>(&self, listener: F) -> Result<Subscription>
    where
        F: Fn(&SubscriptionEvent) + Send + Sync + 'static,
    {
        if self.kind != QueryKind::Fetch {
            return Err(RdbError::Query(format!(
                "Only fetch queries can be subscribed to. This query type: '{}'.",
                self.kind.name()
            )));
        }
        self.table
            .subscribe(self.selection.clone(), Arc::new(listener))
    }

    /// Like [`Query::subscribe`], delivering events over a channel.
    pub fn watch(&self) -> Result<(Subscription, mpsc::Receiver<SubscriptionEvent>)> {
        let (tx, rx) = mpsc::channel();
        let subscription = self.subscribe(move |event| {
            let _ = tx.send(event.clone());
        })?;
        Ok((subscription, rx))
    }
}
