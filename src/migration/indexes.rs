use log::info;
use rusqlite::Connection;

use crate::error::MigrateError;
use crate::migration::progress::MigrationProgress;
use crate::migration::StageOutput;
use crate::plan::MigrationPlan;
use crate::schema::SchemaInspector;
use crate::utils::Utils;

/// Creates secondary indexes. Index failures only degrade performance, so the
/// stage reports them as warnings and never fails the run.
pub struct IndexBuilder;

impl IndexBuilder {
    /// Create `index` on `table(columns)` unless an index of that name exists.
    /// Returns `true` when it was created.
    pub fn ensure_index(
        conn: &Connection,
        table: &str,
        index: &str,
        columns: &[String],
    ) -> Result<bool, MigrateError> {
        if SchemaInspector::index_exists(conn, index)? {
            return Ok(false);
        }

        // A quoted name that matches no column would be indexed as a string constant
        let existing = SchemaInspector::current_columns(conn, table)?;
        for column in columns {
            if !existing.iter().any(|c| c.name.eq_ignore_ascii_case(column)) {
                return Err(MigrateError::MigrationError(format!(
                    "creating index '{}' failed: {}.{} does not exist",
                    index, table, column
                )));
            }
        }

        let column_list: Vec<String> = columns.iter().map(|c| Utils::quote_ident(c)).collect();
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            Utils::quote_ident(index),
            Utils::quote_ident(table),
            column_list.join(", ")
        );
        conn.execute_batch(&sql)
            .map_err(|e| MigrateError::MigrationError(format!("creating index '{}' failed: {}", index, e)))?;

        info!("Applied: {}", sql);
        Ok(true)
    }

    pub fn run_stage(conn: &Connection, plan: &MigrationPlan, progress: &mut MigrationProgress) -> StageOutput {
        let mut output = StageOutput::default();
        let mut created = 0;
        let mut present = 0;

        for spec in plan.indexes() {
            match SchemaInspector::table_exists(conn, &spec.table) {
                Ok(true) => {}
                Ok(false) if plan.is_optional_table(&spec.table) => {
                    progress.send(&format!("  ℹ Skipping {} (no '{}' table)", spec.name, spec.table));
                    continue;
                }
                Ok(false) => {
                    output.warn(
                        progress,
                        format!("Index {} not created: table '{}' does not exist", spec.name, spec.table),
                    );
                    continue;
                }
                Err(e) => {
                    output.warn(progress, format!("Index {} not created: {}", spec.name, e));
                    continue;
                }
            }

            match Self::ensure_index(conn, &spec.table, &spec.name, &spec.columns) {
                Ok(true) => {
                    created += 1;
                    progress.send(&format!("  ✓ Created {} on {}({})", spec.name, spec.table, spec.columns.join(", ")));
                }
                Ok(false) => {
                    present += 1;
                    progress.send(&format!("  ℹ {} already exists", spec.name));
                }
                Err(e) => output.warn(progress, format!("Index {} not created: {}", spec.name, e)),
            }
        }

        output.detail = format!("{} index(es) created, {} already present", created, present);
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn test_ensure_index_is_idempotent() {
        let conn = test_support::legacy_store();
        let columns = vec!["user_id".to_owned(), "due_date".to_owned()];

        assert!(IndexBuilder::ensure_index(&conn, "fees", "idx_fees_user_date", &columns).unwrap());
        assert!(!IndexBuilder::ensure_index(&conn, "fees", "idx_fees_user_date", &columns).unwrap());
        assert!(SchemaInspector::index_exists(&conn, "idx_fees_user_date").unwrap());
    }

    #[test]
    fn test_bad_column_is_migration_error() {
        let conn = test_support::legacy_store();
        let result = IndexBuilder::ensure_index(&conn, "fees", "idx_fees_nope", &["nope".to_owned()]);
        match result {
            Err(MigrateError::MigrationError(msg)) => assert!(msg.contains("fees.nope"), "{}", msg),
            other => panic!("expected MigrationError, got {:?}", other),
        }
        // Nothing was created, so a later run with the column in place can still build it
        assert!(!SchemaInspector::index_exists(&conn, "idx_fees_nope").unwrap());
    }

    #[test]
    fn test_index_columns_match_case_insensitively() {
        let conn = test_support::legacy_store();
        let columns = vec!["User_ID".to_owned()];

        assert!(IndexBuilder::ensure_index(&conn, "fees", "idx_fees_user", &columns).unwrap());
        let indexed: Vec<String> = conn
            .prepare("SELECT name FROM pragma_index_info('idx_fees_user')")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(indexed, vec!["user_id".to_owned()]);
    }

    #[test]
    fn test_run_stage_creates_all_fee_split_indexes() {
        let conn = test_support::legacy_store();
        let mut progress = MigrationProgress::new(false);

        let output = IndexBuilder::run_stage(&conn, &MigrationPlan::fee_split(), &mut progress);
        assert_eq!(output.detail, "4 index(es) created, 0 already present");
        assert!(output.warnings.is_empty());

        let output = IndexBuilder::run_stage(&conn, &MigrationPlan::fee_split(), &mut progress);
        assert_eq!(output.detail, "0 index(es) created, 4 already present");
    }

    #[test]
    fn test_run_stage_failures_are_warnings() {
        let conn = test_support::legacy_store();
        // The batch index needs fees.batch_id
        conn.execute_batch(
            "CREATE TABLE fees_old AS SELECT id, user_id, amount, due_date FROM fees;
             DROP TABLE fees;
             ALTER TABLE fees_old RENAME TO fees;",
        )
        .unwrap();
        conn.execute_batch("DROP TABLE attendance;").unwrap();
        let mut progress = MigrationProgress::new(false);

        let output = IndexBuilder::run_stage(&conn, &MigrationPlan::fee_split(), &mut progress);
        assert_eq!(output.detail, "1 index(es) created, 0 already present");
        assert_eq!(output.warnings.len(), 1);
        assert!(output.warnings[0].contains("idx_fees_batch_date"));
    }
}
