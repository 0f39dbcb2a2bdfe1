//! SQLite-backed table store.
//!
//! Every logical namespace is its own table with the schema
//! `(name TEXT UNIQUE, data TEXT)`, created on first use. Table identifiers
//! are validated against an alphanumeric allow-list right before they are
//! spliced into SQL; names and values always travel as bound parameters.
//!
//! When SQLite reports that the file is not a database (or is encrypted or
//! corrupt), the file is deleted, recreated, and the operation retried once.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use tracing::{debug, info, warn};

use crate::error::StoreError;

/// Keeps only ASCII letters and digits.
pub fn sanitize_table(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_alphanumeric).collect()
}

/// Deny-by-default check applied where a table name becomes part of a statement.
pub fn validate_table(raw: &str) -> Result<&str, StoreError> {
    if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_alphanumeric()) {
        Ok(raw)
    } else {
        Err(StoreError::InvalidTable(raw.to_string()))
    }
}

pub struct Store {
    path: Option<PathBuf>,
    conn: Connection,
    tables: HashSet<String>,
}

impl Store {
    /// Opens or creates the store file. A file SQLite refuses to open is replaced.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                info!(path = %parent.display(), "creating store directory");
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = match Connection::open(path) {
            Ok(conn) => conn,
            Err(error) => {
                warn!(path = %path.display(), %error, "store open failed; deleting and retrying");
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                Connection::open(path)?
            }
        };
        debug!(path = %path.display(), "store opened");

        Ok(Self {
            path: Some(path.to_path_buf()),
            conn,
            tables: HashSet::new(),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            path: None,
            conn: Connection::open_in_memory()?,
            tables: HashSet::new(),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&mut self, table: &str, name: &str) -> Result<Option<String>, StoreError> {
        self.with_table(table, |conn, table| {
            conn.query_row(
                &format!("SELECT data FROM \"{table}\" WHERE name = ?1"),
                params![name],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map(Option::flatten)
        })
    }

    /// Looks up `prefix + item` for every item; misses come back as empty strings.
    pub fn get_multi(
        &mut self,
        table: &str,
        prefix: &str,
        items: &[String],
    ) -> Result<Vec<String>, StoreError> {
        self.with_table(table, |conn, table| {
            let mut statement =
                conn.prepare(&format!("SELECT data FROM \"{table}\" WHERE name = ?1"))?;
            items
                .iter()
                .map(|item| {
                    statement
                        .query_row(params![format!("{prefix}{item}")], |row| {
                            row.get::<_, Option<String>>(0)
                        })
                        .optional()
                        .map(|found| found.flatten().unwrap_or_default())
                })
                .collect()
        })
    }

    /// Upsert: one row per name, last writer wins.
    pub fn set(&mut self, table: &str, name: &str, data: &str) -> Result<(), StoreError> {
        self.with_table(table, |conn, table| {
            conn.execute(&upsert_sql(table), params![name, data])
                .map(|_| ())
        })
    }

    pub fn set_multi(
        &mut self,
        table: &str,
        prefix: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        self.with_table(table, |conn, table| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut statement = tx.prepare(&upsert_sql(table))?;
                for (name, value) in data {
                    statement.execute(params![format!("{prefix}{name}"), value])?;
                }
            }
            tx.commit()
        })
    }

    /// Deletes every row whose name matches the SQL `LIKE` pattern.
    pub fn delete(&mut self, table: &str, pattern: &str) -> Result<usize, StoreError> {
        self.with_table(table, |conn, table| {
            conn.execute(
                &format!("DELETE FROM \"{table}\" WHERE name LIKE ?1"),
                params![pattern],
            )
        })
    }

    /// Deletes exactly one row, without pattern matching.
    pub fn remove(&mut self, table: &str, name: &str) -> Result<usize, StoreError> {
        self.with_table(table, |conn, table| {
            conn.execute(
                &format!("DELETE FROM \"{table}\" WHERE name = ?1"),
                params![name],
            )
        })
    }

    /// Runs `op` against a validated, existing table, healing a corrupt file once.
    fn with_table<T, F>(&mut self, table: &str, op: F) -> Result<T, StoreError>
    where
        F: Fn(&Connection, &str) -> rusqlite::Result<T>,
    {
        let table = validate_table(table)?;
        match self.attempt(table, &op) {
            Err(StoreError::Corrupt(reason)) => {
                warn!(%reason, "deleting broken database file");
                self.recreate()?;
                self.attempt(table, &op)
            }
            other => other,
        }
    }

    fn attempt<T, F>(&mut self, table: &str, op: &F) -> Result<T, StoreError>
    where
        F: Fn(&Connection, &str) -> rusqlite::Result<T>,
    {
        self.ensure_table(table)?;
        op(&self.conn, table).map_err(classify)
    }

    fn ensure_table(&mut self, table: &str) -> Result<(), StoreError> {
        if self.tables.contains(table) {
            return Ok(());
        }
        self.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS \"{table}\" (name TEXT UNIQUE, data TEXT);"
            ))
            .map_err(classify)?;
        debug!(table, "table ready");
        self.tables.insert(table.to_string());
        Ok(())
    }

    fn recreate(&mut self) -> Result<(), StoreError> {
        self.tables.clear();
        let stale = std::mem::replace(&mut self.conn, Connection::open_in_memory()?);
        drop(stale);

        if let Some(path) = &self.path {
            for file in [path.clone(), journal_path(path)] {
                if file.exists() {
                    std::fs::remove_file(&file)?;
                }
            }
            self.conn = Connection::open(path)?;
            info!(path = %path.display(), "database file recreated");
        }
        Ok(())
    }
}

fn upsert_sql(table: &str) -> String {
    format!(
        "INSERT INTO \"{table}\" (name, data) VALUES (?1, ?2) \
         ON CONFLICT(name) DO UPDATE SET data = excluded.data"
    )
}

fn journal_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push("-journal");
    PathBuf::from(name)
}

fn classify(error: rusqlite::Error) -> StoreError {
    let corrupt_code = matches!(
        error.sqlite_error_code(),
        Some(ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
    );
    let message = error.to_string();
    if corrupt_code
        || message.contains("file is encrypted")
        || message.contains("not a database")
    {
        StoreError::Corrupt(message)
    } else {
        StoreError::Sqlite(error)
    }
}
