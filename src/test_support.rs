//! Fixtures shared by the unit and pipeline tests.

use std::path::{Path, PathBuf};

use rusqlite::Connection;

/// Schema of a store that predates the fee split.
pub const LEGACY_SCHEMA: &str = "
    CREATE TABLE fees (
        id INTEGER PRIMARY KEY,
        user_id INTEGER NOT NULL,
        batch_id INTEGER NOT NULL,
        amount DECIMAL(10, 2) NOT NULL DEFAULT 0,
        due_date DATE
    );
    CREATE TABLE attendance (
        id INTEGER PRIMARY KEY,
        user_id INTEGER NOT NULL,
        batch_id INTEGER NOT NULL,
        date DATE NOT NULL,
        status TEXT NOT NULL
    );
    INSERT INTO fees (id, user_id, batch_id, amount, due_date) VALUES
        (1, 10, 1, 800.00, '2024-01-10'),
        (2, 11, 1, 250.50, '2024-01-10'),
        (3, 12, 2, 0, '2024-02-10');
    INSERT INTO attendance (user_id, batch_id, date, status) VALUES
        (10, 1, '2024-01-08', 'present'),
        (11, 1, '2024-01-08', 'absent');
";

pub fn legacy_store() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(LEGACY_SCHEMA).unwrap();
    conn
}

/// Write a legacy store to `<dir>/app.db` and return its path.
pub fn legacy_store_file(dir: &Path) -> PathBuf {
    let path = dir.join("app.db");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(LEGACY_SCHEMA).unwrap();
    path
}

pub fn fee_row(conn: &Connection, id: i64) -> (f64, f64, f64) {
    conn.query_row(
        "SELECT amount, jf_amount, tf_amount FROM fees WHERE id = ?",
        [id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )
    .unwrap()
}
