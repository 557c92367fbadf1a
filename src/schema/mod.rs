use std::collections::BTreeMap;

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::error::MigrateError;
use crate::utils::Utils;

/// One column as the store declares it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
}

/// Table name → ordered columns, captured at one point in time.
///
/// Snapshots are never carried from one stage to the next: a stage that
/// depends on the current shape takes its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct SchemaSnapshot {
    tables: BTreeMap<String, Vec<ColumnInfo>>,
}

impl SchemaSnapshot {
    pub fn columns(&self, table: &str) -> Option<&[ColumnInfo]> {
        self.tables.get(table).map(|c| c.as_slice())
    }

    pub fn tables(&self) -> impl Iterator<Item = (&String, &Vec<ColumnInfo>)> {
        self.tables.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Reads table and column metadata straight from the store.
pub struct SchemaInspector;

impl SchemaInspector {
    /// Names are matched the way SQLite resolves them, ignoring ASCII case.
    pub fn table_exists(conn: &Connection, table: &str) -> Result<bool, MigrateError> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ? COLLATE NOCASE",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Ordered `(name, declared type)` pairs. A missing table is a `SchemaError`.
    pub fn current_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>, MigrateError> {
        if !Self::table_exists(conn, table)? {
            return Err(MigrateError::SchemaError(format!(
                "table '{}' does not exist",
                table
            )));
        }

        let mut stmt = conn.prepare("SELECT name, type FROM pragma_table_info(?) ORDER BY cid")?;
        let columns = stmt
            .query_map([table], |row| {
                Ok(ColumnInfo {
                    name: row.get(0)?,
                    declared_type: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(columns)
    }

    pub fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, MigrateError> {
        Ok(Self::current_columns(conn, table)?
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case(column)))
    }

    /// Snapshot of the named tables. Tables that do not exist are left out.
    pub fn snapshot(conn: &Connection, tables: &[&str]) -> Result<SchemaSnapshot, MigrateError> {
        let mut snapshot = SchemaSnapshot::default();
        for table in tables {
            if Self::table_exists(conn, table)? {
                let columns = Self::current_columns(conn, table)?;
                snapshot.tables.insert((*table).to_owned(), columns);
            }
        }
        Ok(snapshot)
    }

    /// Snapshot of every user table in the store.
    pub fn snapshot_all(conn: &Connection) -> Result<SchemaSnapshot, MigrateError> {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        Self::snapshot(conn, &refs)
    }

    pub fn index_exists(conn: &Connection, index: &str) -> Result<bool, MigrateError> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ? COLLATE NOCASE",
            params![index],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn row_count(conn: &Connection, table: &str) -> Result<i64, MigrateError> {
        let sql = format!("SELECT COUNT(*) FROM {}", Utils::quote_ident(table));
        let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE fees (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL,
                amount DECIMAL(10, 2) NOT NULL
            );
            CREATE INDEX idx_fees_user ON fees (user_id);
            INSERT INTO fees (user_id, amount) VALUES (1, 800.00), (2, 0);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_current_columns_in_declared_order() {
        let conn = store();
        let columns = SchemaInspector::current_columns(&conn, "fees").unwrap();
        let pairs: Vec<(&str, &str)> = columns
            .iter()
            .map(|c| (c.name.as_str(), c.declared_type.as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("id", "INTEGER"),
                ("user_id", "INTEGER"),
                ("amount", "DECIMAL(10, 2)"),
            ]
        );
    }

    #[test]
    fn test_missing_table_is_schema_error() {
        let conn = store();
        let result = SchemaInspector::current_columns(&conn, "attendance");
        assert!(matches!(result, Err(MigrateError::SchemaError(_))));
        assert!(!SchemaInspector::table_exists(&conn, "attendance").unwrap());
    }

    #[test]
    fn test_snapshot_skips_missing_tables_and_reflects_changes() {
        let conn = store();
        let before = SchemaInspector::snapshot(&conn, &["fees", "attendance"]).unwrap();
        assert_eq!(before.columns("fees").map(|c| c.len()), Some(3));
        assert!(before.columns("attendance").is_none());

        conn.execute_batch("ALTER TABLE fees ADD COLUMN jf_amount DECIMAL(10, 2) DEFAULT 0.00")
            .unwrap();

        let after = SchemaInspector::snapshot(&conn, &["fees"]).unwrap();
        assert_eq!(after.columns("fees").unwrap()[3].name, "jf_amount");
        assert_ne!(before, after);
    }

    #[test]
    fn test_names_resolve_ignoring_case() {
        let conn = store();
        conn.execute_batch("ALTER TABLE fees ADD COLUMN JF_Amount DECIMAL(10, 2) DEFAULT 0.00")
            .unwrap();

        assert!(SchemaInspector::table_exists(&conn, "FEES").unwrap());
        assert!(SchemaInspector::has_column(&conn, "fees", "jf_amount").unwrap());
        assert!(SchemaInspector::has_column(&conn, "Fees", "USER_ID").unwrap());
        assert!(!SchemaInspector::has_column(&conn, "fees", "tf_amount").unwrap());
        assert!(SchemaInspector::index_exists(&conn, "IDX_FEES_USER").unwrap());
    }

    #[test]
    fn test_snapshot_all_and_indexes() {
        let conn = store();
        let all = SchemaInspector::snapshot_all(&conn).unwrap();
        assert_eq!(all.tables().count(), 1);
        assert!(SchemaInspector::index_exists(&conn, "idx_fees_user").unwrap());
        assert!(!SchemaInspector::index_exists(&conn, "idx_fees_batch").unwrap());
        assert_eq!(SchemaInspector::row_count(&conn, "fees").unwrap(), 2);
    }
}
