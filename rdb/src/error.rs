use thiserror::Error;

#[derive(Error, Debug)]
pub enum RdbError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Table '{0}' no longer exists")]
    TableDropped(String),

    #[error("Record not found: {table}/{id}")]
    NotFound { table: String, id: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),
}

impl RdbError {
    /// Errors raised by a query against a table, including use of a dropped table.
    pub fn is_query_error(&self) -> bool {
        matches!(self, RdbError::Query(_) | RdbError::TableDropped(_))
    }
}

pub type Result<T> = std::result::Result<T, RdbError>;
