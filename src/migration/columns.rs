use log::{debug, info};
use rusqlite::Connection;

use crate::database::Database;
use crate::error::MigrateError;
use crate::migration::progress::MigrationProgress;
use crate::migration::StageOutput;
use crate::plan::{ColumnSpec, MigrationPlan};
use crate::schema::SchemaInspector;

/// Applies additive column changes. Never drops, renames, or retypes.
pub struct ColumnMigrator;

impl ColumnMigrator {
    /// Add `spec.column` to `spec.table` unless the store already has it.
    ///
    /// Returns `true` when the column was added. The existence check is
    /// repeated inside the write transaction, so two overlapping runs cannot
    /// both add it. A failed statement rolls back only this column.
    pub fn ensure_column(conn: &Connection, spec: &ColumnSpec) -> Result<bool, MigrateError> {
        if SchemaInspector::has_column(conn, &spec.table, &spec.column)? {
            debug!("{}.{} already present", spec.table, spec.column);
            return Ok(false);
        }

        Database::immediate_transaction(conn, |c| {
            if SchemaInspector::has_column(c, &spec.table, &spec.column)? {
                return Ok(false);
            }
            let sql = spec.add_column_sql();
            c.execute_batch(&sql).map_err(|e| {
                MigrateError::MigrationError(format!(
                    "adding {}.{} failed: {}",
                    spec.table, spec.column, e
                ))
            })?;
            info!("Applied: {}", sql);
            Ok(true)
        })
    }

    /// Run every column change in the plan, in order.
    pub fn run_stage(
        conn: &Connection,
        plan: &MigrationPlan,
        progress: &mut MigrationProgress,
    ) -> Result<StageOutput, MigrateError> {
        let mut output = StageOutput::default();
        let mut applied = 0;
        let mut present = 0;

        for spec in plan.columns() {
            if !SchemaInspector::table_exists(conn, &spec.table)? {
                if plan.is_optional_table(&spec.table) {
                    output.warn(
                        progress,
                        format!(
                            "Table '{}' does not exist - skipping {}.{}",
                            spec.table, spec.table, spec.column
                        ),
                    );
                    continue;
                }
                return Err(MigrateError::SchemaError(format!(
                    "table '{}' does not exist",
                    spec.table
                )));
            }

            // Existing columns are never altered, only reported when they differ
            let existing = SchemaInspector::current_columns(conn, &spec.table)?
                .into_iter()
                .find(|c| c.name.eq_ignore_ascii_case(&spec.column));
            if let Some(existing) = existing {
                if !spec.column_type.matches_declared(&existing.declared_type) {
                    output.warn(
                        progress,
                        format!(
                            "{}.{} exists as '{}' but the plan declares '{}' - left unchanged",
                            spec.table, spec.column, existing.declared_type, spec.column_type
                        ),
                    );
                }
            }

            if Self::ensure_column(conn, spec)? {
                progress.send(&format!("  ✓ Added {}.{} ({})", spec.table, spec.column, spec.column_type));
                applied += 1;
            } else {
                progress.send(&format!("  ℹ {}.{} already exists", spec.table, spec.column));
                present += 1;
            }
        }

        output.detail = format!("{} column(s) added, {} already present", applied, present);
        Ok(output)
    }
}
