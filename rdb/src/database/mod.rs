use crate::error::{RdbError, Result};
use crate::query::Query;
use crate::schema::{self, TableSchema};
use crate::table::{Table, TableFile};
use crate::watcher::{ChangeSource, ChangeSourceKind, DEFAULT_POLL_INTERVAL};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Table files are recognised by this suffix.
pub const TABLE_FILE_SUFFIX: &str = "_table.json";

/// How to open a [`Database`].
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub directory: PathBuf,
    /// Tables to create or open. When empty, tables are discovered from the
    /// `*_table.json` files already in `directory`.
    pub schemas: Vec<TableSchema>,
    pub change_source: ChangeSourceKind,
    pub poll_interval: Duration,
}

impl DatabaseOptions {
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        DatabaseOptions {
            directory: path.into(),
            schemas: Vec::new(),
            change_source: ChangeSourceKind::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_schemas(mut self, schemas: Vec<TableSchema>) -> Self {
        self.schemas = schemas;
        self
    }

    /// Load the table definitions from a YAML or JSON schema file.
    pub fn with_schema_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        self.schemas = schema::parse_schemas(path.as_ref())?;
        Ok(self)
    }

    pub fn with_change_source(mut self, kind: ChangeSourceKind) -> Self {
        self.change_source = kind;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// A directory of table files.
pub struct Database {
    directory: PathBuf,
    tables: BTreeMap<String, Table>,
    change_source: Arc<dyn ChangeSource>,
}

impl Database {
    /// Open the database directory. With schemas in `options` every table is
    /// created (or opened, if its file exists); without, existing table files
    /// are discovered.
    pub fn open(options: DatabaseOptions) -> Result<Self> {
        let directory = options.directory;
        if !directory.is_dir() {
            return Err(RdbError::Database(format!(
                "Data directory does not exist: {}",
                directory.display()
            )));
        }

        let mut db = Database {
            directory,
            tables: BTreeMap::new(),
            change_source: options.change_source.build(options.poll_interval),
        };

        if options.schemas.is_empty() {
            db.discover()?;
        } else {
            db.create(options.schemas)?;
        }
        Ok(db)
    }

    fn discover(&mut self) -> Result<()> {
        let pattern = self.directory.join(format!("*{TABLE_FILE_SUFFIX}"));
        let pattern = pattern.to_string_lossy();
        let files: Vec<PathBuf> = glob::glob(&pattern)
            .map_err(|e| RdbError::Database(format!("Glob error: {e}")))?
            .filter_map(|r| r.ok())
            .collect();

        if files.is_empty() {
            return Err(RdbError::Database(format!(
                "No tables found in {}",
                self.directory.display()
            )));
        }

        for path in files {
            let file = TableFile::read(&path)?;
            let name = file.schema.name.clone();
            if self.tables.contains_key(&name) {
                return Err(RdbError::Database(format!(
                    "Table '{name}' is defined by more than one file ({})",
                    path.display()
                )));
            }
            log::info!("Found table {name} at {}", path.display());
            let table = Table::open(file.schema, path, Arc::clone(&self.change_source))?;
            self.tables.insert(name, table);
        }
        Ok(())
    }

    /// Create tables for `schemas`, keeping any rows already on disk.
    pub fn create(&mut self, schemas: Vec<TableSchema>) -> Result<Vec<Table>> {
        let mut created = Vec::with_capacity(schemas.len());
        for schema in schemas {
            if self.tables.contains_key(&schema.name) {
                return Err(RdbError::Database(format!(
                    "Table '{}' already exists",
                    schema.name
                )));
            }
            let path = self.directory.join(schema.file_name());
            let name = schema.name.clone();
            let table = Table::open(schema, path, Arc::clone(&self.change_source))?;
            self.tables.insert(name, table.clone());
            created.push(table);
        }
        Ok(created)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn table(&self, name: &str) -> Result<Table> {
        self.tables.get(name).cloned().ok_or_else(|| {
            RdbError::Database(format!(
                "Table '{name}' not found. Available tables: {}",
                self.table_names().join(", ")
            ))
        })
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(String::as_str).collect()
    }

    /// Start a fetch query against a table.
    pub fn query(&self, name: &str) -> Result<Query> {
        Ok(Query::new(self.table(name)?))
    }

    /// Drop a table and forget it. Handles to it held elsewhere stop working.
    pub fn drop(&mut self, name: &str) -> Result<()> {
        let table = self.table(name)?;
        table.drop()?;
        self.tables.remove(name);
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("directory", &self.directory)
            .field("tables", &self.table_names())
            .finish()
    }
}
