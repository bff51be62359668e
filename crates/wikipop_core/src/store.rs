use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, params};
use tracing::debug;

use crate::model::{CacheRow, PopularityTier, PopularityUpdate, normalize_title};

pub const DEFAULT_CACHE_TABLE: &str = "popularity_cache";
pub const DEFAULT_CATALOG_TABLE: &str = "page";

/// Validated table names for one store handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTables {
    cache: String,
    catalog: String,
}

impl CacheTables {
    pub fn new(cache: &str, catalog: &str) -> Result<Self> {
        validate_identifier(cache).context("invalid cache table name")?;
        validate_identifier(catalog).context("invalid catalog table name")?;
        if cache == catalog {
            bail!("cache table and catalog table must differ (both are `{cache}`)");
        }
        Ok(Self {
            cache: cache.to_string(),
            catalog: catalog.to_string(),
        })
    }

    pub fn cache(&self) -> &str {
        &self.cache
    }

    pub fn catalog(&self) -> &str {
        &self.catalog
    }
}

impl Default for CacheTables {
    fn default() -> Self {
        Self {
            cache: DEFAULT_CACHE_TABLE.to_string(),
            catalog: DEFAULT_CATALOG_TABLE.to_string(),
        }
    }
}

/// Handle on the popularity cache database.
pub struct CacheStore {
    connection: Connection,
    tables: CacheTables,
    db_path: PathBuf,
}

impl CacheStore {
    /// Opens an existing database. Never creates the file or the tables.
    pub fn open(db_path: &Path, tables: CacheTables) -> Result<Self> {
        if !db_path.exists() {
            bail!(
                "cache database not found: {} (run `wikipop init` and populate it first)",
                normalize_path(db_path)
            );
        }
        let connection = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open {}", db_path.display()))?;
        configure_connection(&connection)?;

        let store = Self {
            connection,
            tables,
            db_path: db_path.to_path_buf(),
        };
        for table in [store.tables.catalog(), store.tables.cache()] {
            if !table_exists(&store.connection, table)? {
                bail!(
                    "table `{table}` is missing from {}",
                    normalize_path(&store.db_path)
                );
            }
        }
        Ok(store)
    }

    /// Opens or creates the database and makes sure the (empty) schema exists.
    pub fn create(db_path: &Path, tables: CacheTables) -> Result<Self> {
        ensure_parent_dir(db_path)?;
        let connection = Connection::open(db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        configure_connection(&connection)?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL journal mode")?;
        let store = Self {
            connection,
            tables,
            db_path: db_path.to_path_buf(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn tables(&self) -> &CacheTables {
        &self.tables
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn ensure_schema(&self) -> Result<()> {
        let catalog = self.tables.catalog();
        let cache = self.tables.cache();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {catalog} (
                page_id INTEGER PRIMARY KEY,
                page_namespace INTEGER NOT NULL DEFAULT 0,
                page_title BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {cache} (
                page_id INTEGER PRIMARY KEY REFERENCES {catalog}(page_id),
                pop_timestamp TEXT,
                pop_count INTEGER NOT NULL DEFAULT 0,
                popularity INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_{cache}_pop_timestamp ON {cache}(pop_timestamp);"
        );
        self.connection
            .execute_batch(&sql)
            .context("failed to initialize popularity cache schema")
    }

    /// Smallest non-NULL `pop_timestamp` across the whole cache table, raw.
    pub fn min_pop_timestamp(&self) -> Result<Option<String>> {
        let sql = format!(
            "SELECT MIN(pop_timestamp) FROM {} WHERE pop_timestamp IS NOT NULL",
            self.tables.cache()
        );
        self.connection
            .query_row(&sql, [], |row| row.get::<_, Option<String>>(0))
            .context("failed to read minimum pop_timestamp")
    }

    /// All cache rows that have a catalog entry, in ascending `page_id` order.
    pub fn load_rows(&self) -> Result<Vec<CacheRow>> {
        let sql = format!(
            "SELECT c.page_id, p.page_title, c.pop_timestamp, c.pop_count, c.popularity
             FROM {catalog} AS p
             JOIN {cache} AS c ON c.page_id = p.page_id
             ORDER BY c.page_id",
            catalog = self.tables.catalog(),
            cache = self.tables.cache(),
        );
        let mut statement = self
            .connection
            .prepare(&sql)
            .context("failed to prepare cache row query")?;
        let rows = statement
            .query_map([], |row| {
                let popularity: Option<i64> = row.get(4)?;
                Ok(CacheRow {
                    page_id: row.get(0)?,
                    page_title: title_from_value(row.get_ref(1)?),
                    pop_timestamp: row.get(2)?,
                    pop_count: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                    popularity: popularity.and_then(PopularityTier::from_ordinal),
                })
            })
            .context("failed to run cache row query")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode cache row")?);
        }
        debug!(rows = out.len(), "loaded cache rows");
        Ok(out)
    }

    /// Applies every update inside one transaction. Returns the number of rows
    /// the database reports as changed. On error nothing is committed.
    pub fn apply_updates(&mut self, updates: &[PopularityUpdate]) -> Result<usize> {
        if updates.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {} SET pop_timestamp = ?1, pop_count = ?2, popularity = ?3 WHERE page_id = ?4",
            self.tables.cache()
        );

        let transaction = self
            .connection
            .transaction()
            .context("failed to begin popularity update transaction")?;
        let mut changed = 0usize;
        {
            let mut statement = transaction
                .prepare(&sql)
                .context("failed to prepare popularity update")?;
            for update in updates {
                changed += statement
                    .execute(params![
                        update.pop_timestamp,
                        update.pop_count,
                        update.popularity.ordinal(),
                        update.page_id
                    ])
                    .with_context(|| {
                        format!("failed to update popularity for page_id {}", update.page_id)
                    })?;
            }
        }
        transaction
            .commit()
            .context("failed to commit popularity updates")?;
        Ok(changed)
    }
}

pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        bail!("table name cannot be empty");
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        bail!("table name `{name}` must start with a letter or underscore");
    }
    if !chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        bail!("table name `{name}` may only contain ASCII letters, digits and underscores");
    }
    Ok(())
}

fn title_from_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => normalize_title(bytes),
        ValueRef::Integer(number) => number.to_string(),
        ValueRef::Real(number) => number.to_string(),
        ValueRef::Null => String::new(),
    }
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys pragma")?;
    Ok(())
}

fn table_exists(connection: &Connection, table_name: &str) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to inspect sqlite_master for table {table_name}"))?;
    Ok(exists == 1)
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create database parent directory {}",
            parent.display()
        )
    })
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
