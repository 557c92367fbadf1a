use log::{debug, info};
use rusqlite::Connection;

use crate::database::Database;
use crate::error::MigrateError;
use crate::migration::progress::MigrationProgress;
use crate::migration::StageOutput;
use crate::plan::{BackfillRule, ColumnType, GuardCondition, MigrationPlan, SourceExpr};
use crate::schema::SchemaInspector;
use crate::utils::Utils;

/// Runs guarded backfill rules. A row is only rewritten while every guard
/// holds, so rows that already carry authoritative values are never touched
/// and a second run updates nothing.
pub struct DataBackfiller;

impl DataBackfiller {
    /// Apply `rule` in a single transaction and return the number of rows updated.
    pub fn backfill(conn: &Connection, plan: &MigrationPlan, rule: &BackfillRule) -> Result<usize, MigrateError> {
        Self::check_columns(conn, rule)?;

        let sql = Self::update_sql(plan, rule)?;
        debug!("Backfill '{}': {}", rule.name, sql);

        let updated = Database::immediate_transaction(conn, |c| {
            c.execute(&sql, []).map_err(|e| {
                MigrateError::MigrationError(format!("backfill rule '{}' failed: {}", rule.name, e))
            })
        })?;

        info!("Backfill '{}' updated {} row(s)", rule.name, updated);
        Ok(updated)
    }

    /// Rows that still satisfy the guard. Zero right after a successful backfill.
    pub fn pending(conn: &Connection, plan: &MigrationPlan, rule: &BackfillRule) -> Result<i64, MigrateError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            Utils::quote_ident(&rule.table),
            Self::guard_sql(plan, rule)?
        );
        Ok(conn.query_row(&sql, [], |row| row.get(0))?)
    }

    /// `(rows where every positive-guard column is > 0, rows where any
    /// declared target has left its default)`.
    pub fn summarize(conn: &Connection, plan: &MigrationPlan, rule: &BackfillRule) -> Result<(i64, i64), MigrateError> {
        let positive: Vec<String> = rule
            .guard
            .iter()
            .filter_map(|g| match g {
                GuardCondition::Positive(column) => Some(format!("{} > 0", Utils::quote_ident(column))),
                GuardCondition::AtDefault(_) => None,
            })
            .collect();
        let moved: Vec<String> = rule
            .set
            .iter()
            .filter_map(|a| plan.column_spec(&rule.table, &a.column))
            .map(|spec| format!("NOT {}", spec.at_default_sql()))
            .collect();

        let when = |conditions: &[String], joiner: &str| {
            if conditions.is_empty() {
                "0".to_owned()
            } else {
                conditions.join(joiner)
            }
        };
        let sql = format!(
            "SELECT COALESCE(SUM(CASE WHEN {} THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN {} THEN 1 ELSE 0 END), 0)
             FROM {}",
            when(&positive, " AND "),
            when(&moved, " OR "),
            Utils::quote_ident(&rule.table)
        );
        Ok(conn.query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?)))?)
    }

    pub fn run_stage(
        conn: &Connection,
        plan: &MigrationPlan,
        progress: &mut MigrationProgress,
    ) -> Result<StageOutput, MigrateError> {
        let mut output = StageOutput::default();
        let mut total_updated = 0;

        for rule in plan.backfills() {
            if !SchemaInspector::table_exists(conn, &rule.table)? && plan.is_optional_table(&rule.table) {
                output.warn(
                    progress,
                    format!("Table '{}' does not exist - skipping backfill '{}'", rule.table, rule.name),
                );
                continue;
            }

            let updated = Self::backfill(conn, plan, rule)?;
            total_updated += updated;
            progress.send(&format!("  ✓ {}: {} row(s) updated", rule.name, updated));

            let (legacy, split) = Self::summarize(conn, plan, rule)?;
            progress.send(&format!(
                "    {} row(s) with a positive legacy value, {} row(s) carrying values in {}",
                legacy,
                split,
                rule.set.iter().map(|a| a.column.as_str()).collect::<Vec<_>>().join(", ")
            ));

            let pending = Self::pending(conn, plan, rule)?;
            if pending > 0 {
                output.warn(
                    progress,
                    format!("{} row(s) in '{}' still match the guard of '{}'", pending, rule.table, rule.name),
                );
            }
        }

        output.detail = format!("{} row(s) updated", total_updated);
        Ok(output)
    }

    fn check_columns(conn: &Connection, rule: &BackfillRule) -> Result<(), MigrateError> {
        let columns = SchemaInspector::current_columns(conn, &rule.table)?;
        for referenced in rule.referenced_columns() {
            if !columns.iter().any(|c| c.name.eq_ignore_ascii_case(referenced)) {
                return Err(MigrateError::MigrationError(format!(
                    "backfill rule '{}' references missing column {}.{}",
                    rule.name, rule.table, referenced
                )));
            }
        }
        Ok(())
    }

    fn update_sql(plan: &MigrationPlan, rule: &BackfillRule) -> Result<String, MigrateError> {
        let assignments: Vec<String> = rule
            .set
            .iter()
            .map(|a| {
                let value = match &a.from {
                    SourceExpr::Column(source) => Utils::quote_ident(source),
                    SourceExpr::Literal(literal) => {
                        let column_type = plan
                            .column_spec(&rule.table, &a.column)
                            .map(|spec| spec.column_type)
                            .unwrap_or(ColumnType::Text);
                        literal.to_sql(column_type)
                    }
                };
                format!("{} = {}", Utils::quote_ident(&a.column), value)
            })
            .collect();

        Ok(format!(
            "UPDATE {} SET {} WHERE {}",
            Utils::quote_ident(&rule.table),
            assignments.join(", "),
            Self::guard_sql(plan, rule)?
        ))
    }

    fn guard_sql(plan: &MigrationPlan, rule: &BackfillRule) -> Result<String, MigrateError> {
        let mut conditions = Vec::with_capacity(rule.guard.len());
        for condition in &rule.guard {
            let sql = match condition {
                GuardCondition::AtDefault(column) => plan
                    .column_spec(&rule.table, column)
                    .map(|spec| spec.at_default_sql())
                    .ok_or_else(|| {
                        MigrateError::PlanError(format!(
                            "backfill rule '{}' guards on undeclared column {}.{}",
                            rule.name, rule.table, column
                        ))
                    })?,
                GuardCondition::Positive(column) => format!("{} > 0", Utils::quote_ident(column)),
            };
            conditions.push(sql);
        }
        Ok(conditions.join(" AND "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::columns::ColumnMigrator;
    use crate::test_support::{self, fee_row};
    use pretty_assertions::assert_eq;

    fn migrated_store() -> Connection {
        let conn = test_support::legacy_store();
        let mut progress = MigrationProgress::new(false);
        ColumnMigrator::run_stage(&conn, &MigrationPlan::fee_split(), &mut progress).unwrap();
        conn
    }

    #[test]
    fn test_update_sql_for_fee_split() {
        let plan = MigrationPlan::fee_split();
        let sql = DataBackfiller::update_sql(&plan, &plan.backfills()[0]).unwrap();
        assert_eq!(
            sql,
            "UPDATE \"fees\" SET \"jf_amount\" = \"amount\", \"tf_amount\" = 0.00 \
             WHERE (\"jf_amount\" IS NULL OR \"jf_amount\" = 0.00) \
             AND (\"tf_amount\" IS NULL OR \"tf_amount\" = 0.00) \
             AND \"amount\" > 0"
        );
    }

    #[test]
    fn test_backfill_moves_legacy_amount_and_is_idempotent() {
        let conn = migrated_store();
        let plan = MigrationPlan::fee_split();
        let rule = &plan.backfills()[0];

        // Row 3 has amount 0 and is left alone
        assert_eq!(DataBackfiller::backfill(&conn, &plan, rule).unwrap(), 2);
        assert_eq!(fee_row(&conn, 1), (800.0, 800.0, 0.0));
        assert_eq!(fee_row(&conn, 2), (250.5, 250.5, 0.0));
        assert_eq!(fee_row(&conn, 3), (0.0, 0.0, 0.0));

        assert_eq!(DataBackfiller::backfill(&conn, &plan, rule).unwrap(), 0);
        assert_eq!(DataBackfiller::pending(&conn, &plan, rule).unwrap(), 0);
    }

    #[test]
    fn test_summarize_counts_legacy_and_split_rows() {
        let conn = migrated_store();
        let plan = MigrationPlan::fee_split();
        let rule = &plan.backfills()[0];

        assert_eq!(DataBackfiller::summarize(&conn, &plan, rule).unwrap(), (2, 0));
        DataBackfiller::backfill(&conn, &plan, rule).unwrap();
        assert_eq!(DataBackfiller::summarize(&conn, &plan, rule).unwrap(), (2, 2));
    }

    #[test]
    fn test_backfill_never_touches_rows_with_parts() {
        let conn = migrated_store();
        conn.execute_batch("UPDATE fees SET jf_amount = 500, tf_amount = 300 WHERE id = 1;")
            .unwrap();
        let plan = MigrationPlan::fee_split();

        assert_eq!(DataBackfiller::backfill(&conn, &plan, &plan.backfills()[0]).unwrap(), 1);
        assert_eq!(fee_row(&conn, 1), (800.0, 500.0, 300.0));
    }

    #[test]
    fn test_backfill_with_one_part_set_is_skipped() {
        let conn = migrated_store();
        conn.execute_batch("UPDATE fees SET tf_amount = 100 WHERE id = 2;").unwrap();
        let plan = MigrationPlan::fee_split();

        DataBackfiller::backfill(&conn, &plan, &plan.backfills()[0]).unwrap();
        assert_eq!(fee_row(&conn, 2), (250.5, 0.0, 100.0));
    }

    #[test]
    fn test_missing_column_names_the_rule() {
        // Backfill before the columns exist
        let conn = test_support::legacy_store();
        let plan = MigrationPlan::fee_split();

        let err = DataBackfiller::backfill(&conn, &plan, &plan.backfills()[0]).unwrap_err();
        match err {
            MigrateError::MigrationError(msg) => {
                assert!(msg.contains("fees.amount_to_jf"), "{}", msg);
                assert!(msg.contains("jf_amount"), "{}", msg);
            }
            other => panic!("expected MigrationError, got {:?}", other),
        }
        assert_eq!(
            conn.query_row("SELECT amount FROM fees WHERE id = 1", [], |r| r.get::<_, f64>(0))
                .unwrap(),
            800.0
        );
    }

    #[test]
    fn test_failed_update_rolls_back_whole_rule() {
        let conn = migrated_store();
        // Abort the statement partway through the row set
        conn.execute_batch(
            "CREATE TRIGGER stop_row_two BEFORE UPDATE OF jf_amount ON fees
             WHEN NEW.id = 2 BEGIN SELECT RAISE(ABORT, 'row 2 is locked'); END;",
        )
        .unwrap();
        let plan = MigrationPlan::fee_split();

        let err = DataBackfiller::backfill(&conn, &plan, &plan.backfills()[0]).unwrap_err();
        assert!(matches!(err, MigrateError::MigrationError(_)));
        assert!(conn.is_autocommit());
        assert_eq!(fee_row(&conn, 1), (800.0, 0.0, 0.0));
    }
}
