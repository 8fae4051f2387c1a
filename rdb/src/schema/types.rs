use crate::error::{RdbError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Fields the table stamps on every row. They are always queryable and never
/// need to be declared.
pub const RESERVED_COLUMNS: [&str; 3] = ["id", "createdAt", "updatedAt"];

/// Schema of one table: its name and the validation contract of its columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<Column>,
}

/// Validation contract for a single column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default, skip_serializing_if = "is_false")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub auto_increment: bool,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
}

/// Column type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Number,
    Boolean,
    Email,
    /// ISO-8601 timestamp with millisecond precision, e.g. `2021-01-01T00:00:00.000Z`
    Date,
    Url,
    Array,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Column {
    /// A bare, optional column of the given type.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Column {
            name: name.into(),
            column_type,
            required: false,
            unique: false,
            nullable: false,
            auto_increment: false,
            enum_values: None,
            min_length: None,
            max_length: None,
            minimum: None,
            maximum: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn one_of(mut self, values: Vec<serde_json::Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    pub fn length(mut self, min: usize, max: usize) -> Self {
        self.min_length = Some(min);
        self.max_length = Some(max);
        self
    }

    pub fn range(mut self, minimum: f64, maximum: f64) -> Self {
        self.minimum = Some(minimum);
        self.maximum = Some(maximum);
        self
    }
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        TableSchema {
            name: name.into(),
            columns,
        }
    }

    /// Look up a declared column by name
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Names of the declared columns, in declaration order
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Whether `name` can be referenced in a rule: a declared or reserved column.
    pub fn has_column(&self, name: &str) -> bool {
        RESERVED_COLUMNS.contains(&name) || self.column(name).is_some()
    }

    pub fn required_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.required)
    }

    /// On-disk file name for this table
    pub fn file_name(&self) -> String {
        format!("{}_table.json", self.name)
    }

    /// Check the schema object itself is well formed.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RdbError::Schema("Table name must not be empty".into()));
        }
        if self
            .name
            .chars()
            .any(|c| matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        {
            return Err(RdbError::Schema(format!(
                "Table name '{}' contains characters not allowed in a file name",
                self.name
            )));
        }
        if self.columns.is_empty() {
            return Err(RdbError::Database(format!(
                "Schema for table '{}' does not have columns defined",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if column.name.trim().is_empty() {
                return Err(RdbError::Schema(format!(
                    "Table '{}' has a column with an empty name",
                    self.name
                )));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(RdbError::Schema(format!(
                    "Column '{}' is declared twice in table '{}'",
                    column.name, self.name
                )));
            }
            if let (Some(min), Some(max)) = (column.min_length, column.max_length) {
                if min > max {
                    return Err(RdbError::Schema(format!(
                        "Column '{}.{}' has minLength {min} greater than maxLength {max}",
                        self.name, column.name
                    )));
                }
            }
            if let (Some(min), Some(max)) = (column.minimum, column.maximum) {
                if min > max {
                    return Err(RdbError::Schema(format!(
                        "Column '{}.{}' has minimum {min} greater than maximum {max}",
                        self.name, column.name
                    )));
                }
            }
            if matches!(&column.enum_values, Some(values) if values.is_empty()) {
                return Err(RdbError::Schema(format!(
                    "Column '{}.{}' declares an empty enum",
                    self.name, column.name
                )));
            }
        }

        Ok(())
    }
}
