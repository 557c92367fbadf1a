use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use rusqlite::config::DbConfig;
use rusqlite::{Connection, OpenFlags};

use crate::config::{Environment, RunConfiguration};
use crate::error::MigrateError;

const MEMORY_STORE: &str = ":memory:";

/// Where the target store lives, parsed from a configured location string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// A file-backed SQLite store. Backups are byte copies of this file.
    File(PathBuf),
    /// A store with no backing file. Backups degrade to a placeholder.
    Memory,
}

impl StoreLocation {
    /// Accepts `sqlite:///relative.db`, `sqlite:////absolute.db`, a bare path,
    /// or `:memory:` (optionally as `sqlite://:memory:`).
    pub fn parse(location: &str) -> Result<Self, MigrateError> {
        let location = location.trim();

        if location == MEMORY_STORE
            || location == "sqlite://:memory:"
            || location == "sqlite:///:memory:"
        {
            return Ok(StoreLocation::Memory);
        }

        let path = if let Some(rest) = location.strip_prefix("sqlite:////") {
            format!("/{}", rest)
        } else if let Some(rest) = location.strip_prefix("sqlite:///") {
            rest.to_owned()
        } else if location.contains("://") {
            return Err(MigrateError::ConnectionError(format!(
                "unsupported store location '{}': only SQLite stores can be migrated",
                location
            )));
        } else {
            location.to_owned()
        };

        if path.is_empty() {
            return Err(MigrateError::ConnectionError(format!(
                "store location '{}' does not name a database file",
                location
            )));
        }

        Ok(StoreLocation::File(PathBuf::from(path)))
    }

    pub fn file_path(&self) -> Option<&Path> {
        match self {
            StoreLocation::File(path) => Some(path),
            StoreLocation::Memory => None,
        }
    }
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreLocation::File(path) => write!(f, "{}", path.display()),
            StoreLocation::Memory => write!(f, "{}", MEMORY_STORE),
        }
    }
}

/// A live session on the target store. Closed when dropped.
pub struct Database {
    conn: Connection,
    location: StoreLocation,
    environment: Environment,
}

impl Database {
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    /// Identity of the source store recorded in backup records.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.environment, self.location)
    }

    /// Run `f` inside `BEGIN IMMEDIATE` ... `COMMIT`. Any error from `f`, or
    /// from the commit itself, rolls the whole transaction back.
    pub fn immediate_transaction<T, F>(conn: &Connection, f: F) -> Result<T, MigrateError>
    where
        F: FnOnce(&Connection) -> Result<T, MigrateError>,
    {
        conn.execute_batch("BEGIN IMMEDIATE")?;

        match f(conn) {
            Ok(value) => {
                if let Err(err) = conn.execute_batch("COMMIT") {
                    Self::rollback_quietly(conn);
                    return Err(err.into());
                }
                Ok(value)
            }
            Err(err) => {
                Self::rollback_quietly(conn);
                Err(err)
            }
        }
    }

    fn rollback_quietly(conn: &Connection) {
        // Some failures (e.g. SQLITE_FULL) already rolled the transaction back
        if conn.is_autocommit() {
            return;
        }
        if let Err(err) = conn.execute_batch("ROLLBACK") {
            warn!("Rollback failed: {}", err);
        }
    }
}

/// Resolves a run configuration to a live session. No retries: a failure here
/// is fatal to the run and is reported verbatim.
pub struct ConnectionManager;

impl ConnectionManager {
    pub fn connect(config: &RunConfiguration) -> Result<Database, MigrateError> {
        let location = StoreLocation::parse(&config.store)?;

        let (conn, location) = match location {
            StoreLocation::Memory => {
                let conn = Connection::open_in_memory().map_err(|e| {
                    MigrateError::ConnectionError(format!("failed to open in-memory store: {}", e))
                })?;
                (conn, StoreLocation::Memory)
            }
            StoreLocation::File(path) => {
                // Canonicalize so backups land next to the real file, and so a
                // missing file is reported as unreachable instead of created.
                let resolved = dunce::canonicalize(&path).map_err(|e| {
                    MigrateError::ConnectionError(format!(
                        "store '{}' is unreachable: {}",
                        path.display(),
                        e
                    ))
                })?;
                if !resolved.is_file() {
                    return Err(MigrateError::ConnectionError(format!(
                        "store '{}' is not a file",
                        resolved.display()
                    )));
                }

                let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
                let conn = Connection::open_with_flags(&resolved, flags).map_err(|e| {
                    MigrateError::ConnectionError(format!(
                        "failed to open store '{}': {}",
                        resolved.display(),
                        e
                    ))
                })?;
                (conn, StoreLocation::File(resolved))
            }
        };

        Self::prepare_session(&conn).map_err(|e| {
            MigrateError::ConnectionError(format!("store '{}' is not usable: {}", location, e))
        })?;

        info!("Connected to {} store at {}", config.environment, location);

        Ok(Database {
            conn,
            location,
            environment: config.environment,
        })
    }

    /// Ping the store (a non-database file fails here, not in a later stage),
    /// turn on foreign key enforcement, and make double-quoted names strictly
    /// identifiers so a misspelled column is an error instead of a string.
    fn prepare_session(conn: &Connection) -> Result<(), rusqlite::Error> {
        let schema_version: i64 = conn.query_row("PRAGMA schema_version", [], |row| row.get(0))?;
        debug!("Store schema cookie: {}", schema_version);
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.set_db_config(DbConfig::SQLITE_DBCONFIG_DQS_DDL, false)?;
        conn.set_db_config(DbConfig::SQLITE_DBCONFIG_DQS_DML, false)?;
        Ok(())
    }
}
