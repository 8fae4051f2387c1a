use crate::error::{RdbError, Result};
use crate::schema::{Column, ColumnType, TableSchema, RESERVED_COLUMNS};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

pub const DEFAULT_MIN_LENGTH: usize = 1;
pub const DEFAULT_MAX_STRING_LENGTH: usize = 5000;
pub const DEFAULT_MAX_ARRAY_LENGTH: usize = 255;
pub const DEFAULT_MINIMUM: f64 = 0.0;
pub const DEFAULT_MAXIMUM: f64 = 1_999_999_999_999_999.0;

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9._-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,4}$").expect("valid email pattern")
    })
}

fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"^(ftp|http|https)://[^ "]+$"#).expect("valid url pattern"))
}

fn iso_date_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d{3}Z$").expect("valid date pattern")
    })
}

pub fn validate_email(value: &str) -> bool {
    email_pattern().is_match(value)
}

pub fn validate_url(value: &str) -> bool {
    url_pattern().is_match(value)
}

/// Accepts UTC timestamps in the shape `YYYY-MM-DDTHH:MM:SS.mmmZ` that are
/// also real calendar instants.
pub fn validate_iso_date(value: &str) -> bool {
    iso_date_pattern().is_match(value) && chrono::DateTime::parse_from_rfc3339(value).is_ok()
}

pub fn validate_array_length(values: &[Value], min: usize, max: usize) -> bool {
    (min..=max).contains(&values.len())
}

pub fn validate_boolean(value: &Value) -> bool {
    value.is_boolean()
}

pub fn validate_numeric(value: f64, minimum: f64, maximum: f64) -> bool {
    !value.is_nan() && value >= minimum && value <= maximum
}

pub fn validate_string(value: &str, min: usize, max: usize) -> bool {
    (min..=max).contains(&value.chars().count())
}

/// Check one value against its column contract. Returns a human readable
/// reason on failure.
pub fn validate_value(column: &Column, value: &Value) -> std::result::Result<(), String> {
    if value.is_null() {
        return if column.nullable && !column.required {
            Ok(())
        } else {
            Err(format!("Column '{}' does not accept null", column.name))
        };
    }

    if let Some(allowed) = &column.enum_values {
        if !allowed.contains(value) {
            return Err(format!(
                "Column '{}' value {} is not in enum: {}",
                column.name,
                value,
                Value::Array(allowed.clone())
            ));
        }
    }

    let min_length = column.min_length.unwrap_or(DEFAULT_MIN_LENGTH);
    let ok = match column.column_type {
        ColumnType::String => value.as_str().map_or(false, |s| {
            validate_string(s, min_length, column.max_length.unwrap_or(DEFAULT_MAX_STRING_LENGTH))
        }),
        ColumnType::Number => value.as_f64().map_or(false, |n| {
            validate_numeric(
                n,
                column.minimum.unwrap_or(DEFAULT_MINIMUM),
                column.maximum.unwrap_or(DEFAULT_MAXIMUM),
            )
        }),
        ColumnType::Boolean => validate_boolean(value),
        ColumnType::Email => value.as_str().map_or(false, validate_email),
        ColumnType::Date => value.as_str().map_or(false, validate_iso_date),
        ColumnType::Url => value.as_str().map_or(false, validate_url),
        ColumnType::Array => value.as_array().map_or(false, |items| {
            validate_array_length(
                items,
                min_length,
                column.max_length.unwrap_or(DEFAULT_MAX_ARRAY_LENGTH),
            )
        }),
    };

    if ok {
        Ok(())
    } else {
        Err(format!(
            "Column '{}' expected {}, got {}",
            column.name,
            describe(column),
            value
        ))
    }
}

fn describe(column: &Column) -> String {
    match column.column_type {
        ColumnType::String => format!(
            "string of length {}..={}",
            column.min_length.unwrap_or(DEFAULT_MIN_LENGTH),
            column.max_length.unwrap_or(DEFAULT_MAX_STRING_LENGTH)
        ),
        ColumnType::Number => format!(
            "number in {}..={}",
            column.minimum.unwrap_or(DEFAULT_MINIMUM),
            column.maximum.unwrap_or(DEFAULT_MAXIMUM)
        ),
        ColumnType::Boolean => "boolean".into(),
        ColumnType::Email => "email address".into(),
        ColumnType::Date => "ISO-8601 date (YYYY-MM-DDTHH:MM:SS.mmmZ)".into(),
        ColumnType::Url => "ftp/http/https URL".into(),
        ColumnType::Array => format!(
            "array of length {}..={}",
            column.min_length.unwrap_or(DEFAULT_MIN_LENGTH),
            column.max_length.unwrap_or(DEFAULT_MAX_ARRAY_LENGTH)
        ),
    }
}

/// Validate a row about to be inserted: required columns present, no
/// undeclared columns, every declared column satisfies its type. Reserved
/// columns are stamped by the table and skipped here.
pub fn validate_row(schema: &TableSchema, row: &Map<String, Value>) -> Result<()> {
    let valid_columns = schema.column_names().join(", ");

    for column in schema.required_columns() {
        if RESERVED_COLUMNS.contains(&column.name.as_str()) || column.auto_increment {
            continue;
        }
        if row.get(&column.name).map_or(true, Value::is_null) {
            return Err(RdbError::Validation(format!(
                "Error inserting into table {}: Column '{}' is required but was not provided. \
                 This is case-sensitive. Valid columns are: {valid_columns}",
                schema.name, column.name
            )));
        }
    }

    for (name, value) in row {
        if RESERVED_COLUMNS.contains(&name.as_str()) {
            continue;
        }
        let column = schema.column(name).ok_or_else(|| {
            RdbError::Validation(format!(
                "Error inserting into table {}: Column '{name}' does not exist in table {}. \
                 This is case-sensitive. Valid columns are: {valid_columns}",
                schema.name, schema.name
            ))
        })?;
        validate_value(column, value).map_err(|reason| {
            RdbError::Validation(format!(
                "Error inserting into table {}: {reason}",
                schema.name
            ))
        })?;
    }

    Ok(())
}

/// Validate a single-column change to an existing row.
pub fn validate_change(schema: &TableSchema, column: &str, value: &Value) -> Result<()> {
    let definition = schema.column(column).ok_or_else(|| {
        RdbError::Query(format!(
            "Column '{column}' does not exist in table '{}'",
            schema.name
        ))
    })?;
    validate_value(definition, value).map_err(RdbError::Validation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn users() -> TableSchema {
        TableSchema::new(
            "users",
            vec![
                Column::new("name", ColumnType::String).required(),
                Column::new("email", ColumnType::Email).required(),
                Column::new("age", ColumnType::Number).range(0.0, 150.0),
                Column::new("role", ColumnType::String).one_of(vec![json!("admin"), json!("member")]),
                Column::new("tags", ColumnType::Array).length(0, 3),
                Column::new("nickname", ColumnType::String).nullable(),
            ],
        )
    }

    fn row(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_email() {
        assert!(validate_email("test@email.com"));
        assert!(validate_email("test-email@email.com"));
        assert!(validate_email("test.email@email.com"));
        assert!(validate_email("test123email@email.com"));
        assert!(!validate_email("test"));
        assert!(!validate_email("test.emailemail.com"));
        assert!(!validate_email("test(io\"epam)example]com"));
        assert!(!validate_email("test+email@email.com"));
    }

    #[test]
    fn test_url() {
        assert!(validate_url("https://www.google.com"));
        assert!(validate_url("http://www.google.com"));
        assert!(validate_url("ftp://files.example.org/a"));
        assert!(!validate_url("www.google.com"));
        assert!(!validate_url("google.com"));
    }

    #[test]
    fn test_iso_date() {
        assert!(validate_iso_date("2021-01-01T00:00:00.000Z"));
        assert!(!validate_iso_date("2021-01-01"));
        assert!(!validate_iso_date("2021-13-40T00:00:00.000Z"));
    }

    #[test]
    fn test_lengths_and_ranges() {
        assert!(validate_string("abc", 1, 3));
        assert!(!validate_string("", 1, 3));
        assert!(!validate_string("abcd", 1, 3));
        assert!(validate_numeric(5.0, 0.0, 10.0));
        assert!(!validate_numeric(-1.0, 0.0, 10.0));
        assert!(!validate_numeric(f64::NAN, 0.0, 10.0));
        assert!(validate_array_length(&[json!(1)], 1, 2));
        assert!(!validate_array_length(&[], 1, 2));
    }

    #[test]
    fn test_valid_row() {
        let schema = users();
        let data = row(json!({
            "name": "Alice",
            "email": "alice@test.com",
            "age": 31,
            "role": "admin",
            "tags": [],
            "nickname": null
        }));
        assert!(validate_row(&schema, &data).is_ok());
    }

    #[test]
    fn test_missing_required_names_column_and_valid_list() {
        let schema = users();
        let err = validate_row(&schema, &row(json!({ "name": "Alice" }))).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("'email'"), "{message}");
        assert!(message.contains("name, email, age, role, tags, nickname"), "{message}");
    }

    #[test]
    fn test_unknown_column_rejected() {
        let schema = users();
        let data = row(json!({ "name": "A", "email": "a@test.com", "extra": 1 }));
        let err = validate_row(&schema, &data).unwrap_err();
        assert!(err.to_string().contains("extra"));
    }

    #[test]
    fn test_reserved_columns_skipped() {
        let schema = users();
        let data = row(json!({ "id": 9, "createdAt": "x", "name": "A", "email": "a@test.com" }));
        assert!(validate_row(&schema, &data).is_ok());
    }

    #[test]
    fn test_type_mismatch() {
        let schema = users();
        let data = row(json!({ "name": 4, "email": "a@test.com" }));
        assert!(matches!(validate_row(&schema, &data), Err(RdbError::Validation(_))));

        let data = row(json!({ "name": "A", "email": "a@test", "age": "20" }));
        assert!(validate_row(&schema, &data).is_err());
    }

    #[test]
    fn test_enum_checked_first() {
        let schema = users();
        let data = row(json!({ "name": "A", "email": "a@test.com", "role": "owner" }));
        let err = validate_row(&schema, &data).unwrap_err();
        assert!(err.to_string().contains("not in enum"));
    }

    #[test]
    fn test_null_only_for_nullable() {
        let schema = users();
        let data = row(json!({ "name": "A", "email": "a@test.com", "age": null }));
        assert!(validate_row(&schema, &data).is_err());
    }

    #[test]
    fn test_validate_change() {
        let schema = users();
        assert!(validate_change(&schema, "age", &json!(40)).is_ok());
        assert!(matches!(
            validate_change(&schema, "age", &json!(400)),
            Err(RdbError::Validation(_))
        ));
        assert!(matches!(
            validate_change(&schema, "missing", &json!(1)),
            Err(RdbError::Query(_))
        ));
    }
}
