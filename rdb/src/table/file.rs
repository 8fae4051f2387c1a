use crate::error::{RdbError, Result};
use crate::record::{row_id, Row};
use crate::schema::TableSchema;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

/// On-disk layout of a table file.
///
/// ```json
/// { "schema": { "name": "users", "columns": [...] }, "lastInsertID": 2, "data": [...] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableFile {
    pub schema: TableSchema,
    #[serde(rename = "lastInsertID", default)]
    pub last_insert_id: u64,
    #[serde(default)]
    pub data: Vec<Row>,
}

impl TableFile {
    pub fn new(schema: TableSchema) -> Self {
        TableFile {
            schema,
            last_insert_id: 0,
            data: Vec::new(),
        }
    }

    /// Load a table file. A counter behind the highest stored id (or missing
    /// altogether) is raised to that id so ids are never issued twice.
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut file: TableFile = serde_json::from_str(&content).map_err(|e| {
            RdbError::Database(format!("Malformed table file {}: {e}", path.display()))
        })?;
        if let Some(max_id) = file.data.iter().filter_map(row_id).max() {
            if max_id > file.last_insert_id {
                log::warn!(
                    "{}: lastInsertID {} is behind stored id {max_id}",
                    path.display(),
                    file.last_insert_id
                );
                file.last_insert_id = max_id;
            }
        }
        Ok(file)
    }

    /// Replace the file at `path` in one step: the JSON goes to a temporary
    /// file in the same directory, which is then renamed over the target.
    pub fn write(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| RdbError::Io(e.error))?;
        Ok(())
    }

    /// Index of the row with the given id.
    pub fn position(&self, id: u64) -> Option<usize> {
        self.data.iter().position(|row| row_id(row) == Some(id))
    }
}
