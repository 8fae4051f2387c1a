use super::{Direction, Operator, Rule, Ruleset};
use crate::error::{RdbError, Result};
use crate::record::{Record, Row};
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;

/// A ruleset turned into predicates, with regex patterns compiled once.
#[derive(Debug, Clone)]
pub struct CompiledRuleset {
    and: Option<Vec<CompiledRule>>,
    or: Option<Vec<CompiledRule>>,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: Rule,
    pattern: Option<Regex>,
}

impl CompiledRuleset {
    pub(crate) fn compile(ruleset: &Ruleset) -> Result<Self> {
        let compile_all = |rules: &Option<Vec<Rule>>| -> Result<Option<Vec<CompiledRule>>> {
            rules
                .as_ref()
                .map(|rules| rules.iter().map(CompiledRule::compile).collect::<Result<Vec<_>>>())
                .transpose()
        };
        Ok(CompiledRuleset {
            and: compile_all(&ruleset.and)?,
            or: compile_all(&ruleset.or)?,
        })
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.matches_row(record.fields())
    }

    pub fn matches_row(&self, row: &Row) -> bool {
        let and_result = self
            .and
            .as_ref()
            .map_or(true, |rules| rules.iter().all(|r| r.matches(row)));
        let or_result = self
            .or
            .as_ref()
            .map_or(true, |rules| rules.iter().any(|r| r.matches(row)));
        and_result && or_result
    }
}

impl CompiledRule {
    fn compile(rule: &Rule) -> Result<Self> {
        let pattern = match rule.op {
            Operator::Regex => {
                let source = rule.value.as_str().ok_or_else(|| {
                    RdbError::Query(format!(
                        "Rule on column '{}' uses regex but the value {} is not a string",
                        rule.column, rule.value
                    ))
                })?;
                let regex = Regex::new(source).map_err(|e| {
                    RdbError::Query(format!(
                        "Invalid regex for column '{}': {e}",
                        rule.column
                    ))
                })?;
                Some(regex)
            }
            _ => None,
        };
        Ok(CompiledRule {
            rule: rule.clone(),
            pattern,
        })
    }

    fn matches(&self, row: &Row) -> bool {
        let actual = row.get(&self.rule.column).unwrap_or(&Value::Null);
        let expected = &self.rule.value;
        match self.rule.op {
            Operator::Eq => values_equal(actual, expected),
            Operator::Ne => !values_equal(actual, expected),
            Operator::Gt => compare_values(actual, expected) == Some(Ordering::Greater),
            Operator::Gte => matches!(
                compare_values(actual, expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::Lt => compare_values(actual, expected) == Some(Ordering::Less),
            Operator::Lte => matches!(
                compare_values(actual, expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::In => contains(actual, expected),
            Operator::NotIn => !contains(actual, expected),
            Operator::Regex => match (&self.pattern, text_of(actual)) {
                (Some(pattern), Some(text)) => pattern.is_match(&text),
                _ => false,
            },
        }
    }
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Order two scalars of the same kind. Numbers compare numerically regardless
/// of integer/float representation; mixed kinds are unordered.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    match compare_values(a, b) {
        Some(ordering) => ordering == Ordering::Equal,
        None => a == b,
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => x.to_lowercase() == y.to_lowercase(),
        _ => values_equal(a, b),
    }
}

/// `in` semantics: membership when either side is an array, otherwise a
/// case-insensitive substring test between two strings.
fn contains(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (_, Value::Array(items)) => items.iter().any(|item| loosely_equal(actual, item)),
        (Value::Array(items), _) => items.iter().any(|item| loosely_equal(item, expected)),
        (Value::String(haystack), Value::String(needle)) => haystack
            .to_lowercase()
            .contains(&needle.to_lowercase()),
        _ => false,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order used by `order_by`. Missing and null values always sort last;
/// otherwise values order by kind (bool, number, string, array, object) and
/// then by value within a kind.
pub(crate) fn sort_order(a: Option<&Value>, b: Option<&Value>, direction: Direction) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    let (a, b) = match (a, b) {
        (None, None) => return Ordering::Equal,
        (None, Some(_)) => return Ordering::Greater,
        (Some(_), None) => return Ordering::Less,
        (Some(a), Some(b)) => (a, b),
    };

    let ordering = type_rank(a).cmp(&type_rank(b)).then_with(|| {
        compare_values(a, b).unwrap_or_else(|| a.to_string().cmp(&b.to_string()))
    });
    match direction {
        Direction::Asc => ordering,
        Direction::Desc => ordering.reverse(),
    }
}
