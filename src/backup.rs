use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::{info, warn};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::BackupPolicy;
use crate::database::Database;
use crate::error::MigrateError;

const BACKUP_EXTENSION: &str = "db";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// A point-in-time copy of the store, created before any destructive stage.
/// Never mutated; retained until an operator removes the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    /// Timestamp-based identifier, `YYYYMMDD_HHMMSS`.
    pub id: String,
    /// Where the copy lives. `None` for the placeholder of a non-file store.
    pub location: Option<PathBuf>,
    /// Identity of the store that was copied.
    pub source: String,
    pub size_bytes: u64,
    pub sha256: Option<String>,
}

impl BackupRecord {
    pub fn is_placeholder(&self) -> bool {
        self.location.is_none()
    }
}

/// A backup file found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupFile {
    pub path: PathBuf,
    pub size_bytes: u64,
}

pub struct BackupService;

impl BackupService {
    /// Copy the store's backing file to
    /// `<store dir>/<policy.directory>/<prefix>_backup_<YYYYMMDD_HHMMSS>.db` and
    /// verify the copy. Stores without a backing file get a placeholder record.
    pub fn create_backup(
        db: &Database,
        policy: &BackupPolicy,
        prefix: &str,
    ) -> Result<BackupRecord, MigrateError> {
        let id = Local::now().format(TIMESTAMP_FORMAT).to_string();

        let source_path = match db.location().file_path() {
            Some(path) => path.to_path_buf(),
            None => {
                warn!(
                    "Store {} has no backing file; logical backup is outside this tool",
                    db.location()
                );
                return Ok(BackupRecord {
                    id,
                    location: None,
                    source: db.identity(),
                    size_bytes: 0,
                    sha256: None,
                });
            }
        };

        // Fold any WAL content into the main file so the byte copy is complete
        db.conn()
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .map_err(|e| backup_error(format!("could not checkpoint the store: {}", e)))?;

        let backup_dir = Self::backup_dir(&source_path, &policy.directory);
        fs::create_dir_all(&backup_dir).map_err(|e| {
            backup_error(format!(
                "could not create backup directory '{}': {}",
                backup_dir.display(),
                e
            ))
        })?;

        let target = Self::unique_target(&backup_dir, prefix, &id);
        fs::copy(&source_path, &target).map_err(|e| {
            backup_error(format!(
                "could not copy '{}' to '{}': {}",
                source_path.display(),
                target.display(),
                e
            ))
        })?;

        if let Err(err) = Self::verify_copy(&source_path, &target) {
            if let Err(remove_err) = fs::remove_file(&target) {
                warn!(
                    "Could not remove unverified backup '{}': {}",
                    target.display(),
                    remove_err
                );
            }
            return Err(err);
        }

        let size_bytes = Self::file_len(&target)?;
        let sha256 = Self::sha256_file(&target)
            .map_err(|e| backup_error(format!("could not hash '{}': {}", target.display(), e)))?;

        info!(
            "Backup of {} written to {} ({} bytes, sha256 {})",
            db.identity(),
            target.display(),
            size_bytes,
            sha256
        );

        Ok(BackupRecord {
            id,
            location: Some(target),
            source: db.identity(),
            size_bytes,
            sha256: Some(sha256),
        })
    }

    /// Backups next to `store_path`, oldest first. The timestamp in each name
    /// makes lexical order chronological.
    pub fn list_backups(store_path: &Path, directory: &str) -> Result<Vec<BackupFile>, MigrateError> {
        let backup_dir = Self::backup_dir(store_path, directory);
        if !backup_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut backups = Vec::new();
        for entry in fs::read_dir(&backup_dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_backup = path.extension().and_then(|e| e.to_str()) == Some(BACKUP_EXTENSION)
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.contains("_backup_"))
                    .unwrap_or(false);
            if is_backup && path.is_file() {
                backups.push(BackupFile {
                    size_bytes: entry.metadata()?.len(),
                    path,
                });
            }
        }

        backups.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
        Ok(backups)
    }

    pub fn backup_dir(store_path: &Path, directory: &str) -> PathBuf {
        store_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(directory)
    }

    fn unique_target(backup_dir: &Path, prefix: &str, id: &str) -> PathBuf {
        let base = format!("{}_backup_{}", prefix, id);
        let mut target = backup_dir.join(format!("{}.{}", base, BACKUP_EXTENSION));
        let mut n = 1;
        while target.exists() {
            target = backup_dir.join(format!("{}_{}.{}", base, n, BACKUP_EXTENSION));
            n += 1;
        }
        target
    }

    fn file_len(path: &Path) -> Result<u64, MigrateError> {
        fs::metadata(path)
            .map(|m| m.len())
            .map_err(|e| backup_error(format!("could not read size of '{}': {}", path.display(), e)))
    }

    fn verify_copy(source: &Path, target: &Path) -> Result<(), MigrateError> {
        let source_len = Self::file_len(source)?;
        let target_len = Self::file_len(target)?;

        if target_len == 0 {
            return Err(backup_error(format!("backup '{}' is empty", target.display())));
        }
        if target_len != source_len {
            return Err(backup_error(format!(
                "backup '{}' is {} bytes but the store is {} bytes",
                target.display(),
                target_len,
                source_len
            )));
        }

        let copy = Connection::open_with_flags(target, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| backup_error(format!("backup '{}' cannot be opened: {}", target.display(), e)))?;
        let check: String = copy
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(|e| backup_error(format!("backup '{}' failed quick_check: {}", target.display(), e)))?;
        if check != "ok" {
            return Err(backup_error(format!(
                "backup '{}' failed quick_check: {}",
                target.display(),
                check
            )));
        }

        Ok(())
    }

    fn sha256_file(path: &Path) -> io::Result<String> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    }
}

fn backup_error(msg: String) -> MigrateError {
    MigrateError::BackupError(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfiguration;
    use crate::database::ConnectionManager;
    use tempfile::TempDir;

    fn file_store(dir: &TempDir) -> Database {
        let store = dir.path().join("app.db");
        Connection::open(&store)
            .unwrap()
            .execute_batch(
                "CREATE TABLE fees (id INTEGER PRIMARY KEY, amount DECIMAL(10, 2));
                 INSERT INTO fees (amount) VALUES (800.00), (250.50);",
            )
            .unwrap();
        ConnectionManager::connect(&RunConfiguration::development(&store.to_string_lossy())).unwrap()
    }

    fn policy() -> BackupPolicy {
        RunConfiguration::development(":memory:").backup
    }

    #[test]
    fn test_backup_copies_and_verifies() {
        let dir = TempDir::new().unwrap();
        let db = file_store(&dir);

        let record = BackupService::create_backup(&db, &policy(), "fee_split").unwrap();
        let location = record.location.clone().expect("file store gets a real backup");

        assert!(location.starts_with(dunce::canonicalize(dir.path()).unwrap().join("backups")));
        let name = location.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("fee_split_backup_"), "{}", name);
        assert!(name.ends_with(".db"));
        assert_eq!(record.id.len(), "YYYYMMDD_HHMMSS".len());
        assert!(record.size_bytes > 0);
        assert_eq!(record.sha256.as_ref().map(|h| h.len()), Some(64));

        // The copy is a usable database with the same rows
        let copy = Connection::open(&location).unwrap();
        let count: i64 = copy.query_row("SELECT COUNT(*) FROM fees", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_backups_never_overwrite_each_other() {
        let dir = TempDir::new().unwrap();
        let db = file_store(&dir);

        let first = BackupService::create_backup(&db, &policy(), "fee_split").unwrap();
        let second = BackupService::create_backup(&db, &policy(), "fee_split").unwrap();
        assert_ne!(first.location, second.location);

        let store_path = db.location().file_path().unwrap();
        let listed = BackupService::list_backups(store_path, "backups").unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].path.file_name() < listed[1].path.file_name());
    }

    #[test]
    fn test_memory_store_gets_placeholder() {
        let db = ConnectionManager::connect(&RunConfiguration::development(":memory:")).unwrap();
        let record = BackupService::create_backup(&db, &policy(), "fee_split").unwrap();
        assert!(record.is_placeholder());
        assert_eq!(record.size_bytes, 0);
    }

    #[test]
    fn test_unwritable_backup_directory_is_backup_error() {
        let dir = TempDir::new().unwrap();
        let db = file_store(&dir);
        // A file where the directory should go
        fs::write(dir.path().join("backups"), b"in the way").unwrap();

        let result = BackupService::create_backup(&db, &policy(), "fee_split");
        assert!(matches!(result, Err(MigrateError::BackupError(_))));
    }

    #[test]
    fn test_vanished_copy_is_backup_error() {
        let dir = TempDir::new().unwrap();
        let db = file_store(&dir);
        let source = db.location().file_path().unwrap().to_path_buf();

        let result = BackupService::verify_copy(&source, &dir.path().join("gone.db"));
        match result {
            Err(MigrateError::BackupError(msg)) => assert!(msg.contains("gone.db"), "{}", msg),
            other => panic!("expected BackupError, got {:?}", other),
        }
    }

    #[test]
    fn test_list_backups_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let listed = BackupService::list_backups(&dir.path().join("app.db"), "backups").unwrap();
        assert!(listed.is_empty());
    }
}
