use super::types::TableSchema;
use crate::error::Result;
use std::path::Path;

/// Parse a schema file (YAML or JSON) holding a list of table schemas
pub fn parse_schemas(path: &Path) -> Result<Vec<TableSchema>> {
    let content = std::fs::read_to_string(path)?;
    parse_schemas_str(&content)
}

/// Parse a YAML/JSON string holding a list of table schemas, validating each one
pub fn parse_schemas_str(content: &str) -> Result<Vec<TableSchema>> {
    let schemas: Vec<TableSchema> = serde_yaml::from_str(content)?;
    for schema in &schemas {
        schema.validate()?;
    }
    Ok(schemas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;

    #[test]
    fn test_parse_yaml_schemas() {
        let schemas = parse_schemas_str(
            r#"
- name: users
  columns:
    - { name: name, type: string, required: true }
    - { name: email, type: email, required: true, unique: true }
    - { name: age, type: number, minimum: 0, maximum: 150 }
    - { name: role, type: string, enum: [admin, member] }
- name: posts
  columns:
    - { name: title, type: string, required: true, maxLength: 120 }
    - { name: tags, type: array, minLength: 0 }
"#,
        )
        .unwrap();

        assert_eq!(schemas.len(), 2);
        let users = &schemas[0];
        assert_eq!(users.name, "users");
        assert_eq!(users.columns.len(), 4);
        let email = users.column("email").unwrap();
        assert_eq!(email.column_type, ColumnType::Email);
        assert!(email.unique);
        assert_eq!(users.column("age").unwrap().maximum, Some(150.0));
        assert_eq!(schemas[1].column("title").unwrap().max_length, Some(120));
    }

    #[test]
    fn test_parse_json_schemas() {
        let schemas = parse_schemas_str(
            r#"[{"name": "notes", "columns": [{"name": "body", "type": "string"}]}]"#,
        )
        .unwrap();
        assert_eq!(schemas[0].file_name(), "notes_table.json");
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        let result = parse_schemas_str("- name: t\n  columns:\n    - { name: a, type: blob }\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_rejects_invalid_schema() {
        let result = parse_schemas_str(
            "- name: t\n  columns:\n    - { name: a, type: string }\n    - { name: a, type: number }\n",
        );
        assert!(matches!(result, Err(crate::RdbError::Schema(_))));
    }
}
