use log::{info, warn};
use rusqlite::Connection;
use serde::Serialize;

use crate::database::Database;
use crate::domain;
use crate::error::MigrateError;
use crate::migration::progress::MigrationProgress;
use crate::migration::StageOutput;
use crate::plan::{InvariantSpec, MigrationPlan, RepairPolicy, ValueDomain};
use crate::schema::SchemaInspector;
use crate::utils::Utils;

/// Counts for one invariant check. `violating` is measured before repair,
/// `remaining` after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub invariant: String,
    pub table: String,
    pub total_rows: i64,
    pub conforming: i64,
    pub violating: i64,
    pub repaired: i64,
    pub remaining: i64,
}

/// Distinct values found in a closed-domain column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainReport {
    pub table: String,
    pub column: String,
    pub values: Vec<(String, i64)>,
    pub unrecognized: Vec<String>,
}

const NULL_LABEL: &str = "<null>";

pub struct ConsistencyValidator;

impl ConsistencyValidator {
    /// Check `total == sum(parts)` on every row, repair violating rows per the
    /// invariant's policy, and fail if any violation remains.
    pub fn validate(conn: &Connection, invariant: &InvariantSpec) -> Result<ValidationReport, MigrateError> {
        let columns = SchemaInspector::current_columns(conn, &invariant.table)?;
        for column in std::iter::once(&invariant.total).chain(invariant.parts.iter()) {
            if !columns.iter().any(|c| c.name.eq_ignore_ascii_case(column)) {
                return Err(MigrateError::ValidationError(format!(
                    "invariant '{}' references missing column {}.{}",
                    invariant.name, invariant.table, column
                )));
            }
        }

        let (total_rows, violating) = Self::count(conn, invariant)?;
        let mut repaired = 0;

        if violating > 0 && invariant.repair == RepairPolicy::TrustParts {
            // The exact sum, not a rounded one: parts may carry more places
            // than the declared scale, and the recount compares against them
            let sql = format!(
                "UPDATE {} SET {} = {} WHERE {}",
                Utils::quote_ident(&invariant.table),
                Utils::quote_ident(&invariant.total),
                Self::parts_sum_sql(invariant),
                Self::violation_sql(invariant)
            );
            repaired = Database::immediate_transaction(conn, |c| {
                c.execute(&sql, []).map_err(|e| {
                    MigrateError::ValidationError(format!(
                        "repairing '{}' failed: {}",
                        invariant.name, e
                    ))
                })
            })? as i64;
            info!("Invariant '{}': repaired {} row(s)", invariant.name, repaired);
        }

        let remaining = if violating > 0 {
            Self::count(conn, invariant)?.1
        } else {
            0
        };

        let report = ValidationReport {
            invariant: invariant.name.clone(),
            table: invariant.table.clone(),
            total_rows,
            conforming: total_rows - violating,
            violating,
            repaired,
            remaining,
        };

        if report.remaining > 0 {
            return Err(MigrateError::ValidationError(format!(
                "{} row(s) in '{}' violate {} ({} violating, {} repaired)",
                report.remaining,
                report.table,
                invariant.describe(),
                report.violating,
                report.repaired
            )));
        }

        Ok(report)
    }

    /// Distinct values of a closed-domain column. Unrecognized values are
    /// reported, never rewritten.
    pub fn check_domain(conn: &Connection, value_domain: &ValueDomain) -> Result<DomainReport, MigrateError> {
        if !SchemaInspector::has_column(conn, &value_domain.table, &value_domain.column)? {
            return Err(MigrateError::ValidationError(format!(
                "value domain references missing column {}.{}",
                value_domain.table, value_domain.column
            )));
        }

        let sql = format!(
            "SELECT CAST({col} AS TEXT), COUNT(*) FROM {table} GROUP BY 1 ORDER BY 1",
            col = Utils::quote_ident(&value_domain.column),
            table = Utils::quote_ident(&value_domain.table)
        );
        let mut stmt = conn.prepare(&sql)?;
        let values = stmt
            .query_map([], |row| {
                let value: Option<String> = row.get(0)?;
                Ok((value.unwrap_or_else(|| NULL_LABEL.to_owned()), row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let unrecognized = values
            .iter()
            .filter(|(value, _)| value == NULL_LABEL || !domain::is_recognized(&value_domain.allowed, value))
            .map(|(value, _)| value.clone())
            .collect();

        Ok(DomainReport {
            table: value_domain.table.clone(),
            column: value_domain.column.clone(),
            values,
            unrecognized,
        })
    }

    pub fn run_stage(
        conn: &Connection,
        plan: &MigrationPlan,
        progress: &mut MigrationProgress,
    ) -> Result<(StageOutput, Vec<ValidationReport>), MigrateError> {
        let mut output = StageOutput::default();
        let mut reports = Vec::new();

        for invariant in plan.invariants() {
            if !SchemaInspector::table_exists(conn, &invariant.table)? && plan.is_optional_table(&invariant.table) {
                output.warn(
                    progress,
                    format!("Table '{}' does not exist - skipping '{}'", invariant.table, invariant.name),
                );
                continue;
            }

            let report = Self::validate(conn, invariant)?;
            progress.send(&format!(
                "  ✓ {}: {} row(s), {} conforming, {} repaired",
                invariant.describe(),
                report.total_rows,
                report.conforming,
                report.repaired
            ));
            if report.repaired > 0 {
                output.warn(
                    progress,
                    format!(
                        "{} row(s) in '{}' had {} recomputed from {}",
                        report.repaired,
                        report.table,
                        invariant.total,
                        invariant.parts.join(" + ")
                    ),
                );
            }
            reports.push(report);
        }

        for value_domain in plan.domains() {
            if !SchemaInspector::table_exists(conn, &value_domain.table)? {
                if plan.is_optional_table(&value_domain.table) {
                    output.warn(
                        progress,
                        format!(
                            "Table '{}' does not exist - skipping {} check",
                            value_domain.table, value_domain.column
                        ),
                    );
                    continue;
                }
                return Err(MigrateError::SchemaError(format!(
                    "table '{}' does not exist",
                    value_domain.table
                )));
            }

            let report = Self::check_domain(conn, value_domain)?;
            let listed: Vec<String> = report
                .values
                .iter()
                .map(|(value, count)| format!("{}={}", value, count))
                .collect();
            progress.send(&format!(
                "  ✓ {}.{} values: {}",
                report.table,
                report.column,
                if listed.is_empty() { "(no rows)".to_owned() } else { listed.join(", ") }
            ));
            if !report.unrecognized.is_empty() {
                warn!("Unrecognized values in {}.{}: {:?}", report.table, report.column, report.unrecognized);
                output.warn(
                    progress,
                    format!(
                        "{}.{} has values outside {{{}}}: {}",
                        report.table,
                        report.column,
                        value_domain.allowed.join(", "),
                        report.unrecognized.join(", ")
                    ),
                );
            }
        }

        output.detail = format!(
            "{} invariant(s) hold, {} row(s) repaired",
            reports.len(),
            reports.iter().map(|r| r.repaired).sum::<i64>()
        );
        Ok((output, reports))
    }

    fn count(conn: &Connection, invariant: &InvariantSpec) -> Result<(i64, i64), MigrateError> {
        let sql = format!(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN {} THEN 1 ELSE 0 END), 0) FROM {}",
            Self::violation_sql(invariant),
            Utils::quote_ident(&invariant.table)
        );
        Ok(conn.query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?)))?)
    }

    fn parts_sum_sql(invariant: &InvariantSpec) -> String {
        let parts: Vec<String> = invariant
            .parts
            .iter()
            .map(|p| format!("COALESCE({}, 0)", Utils::quote_ident(p)))
            .collect();
        format!("({})", parts.join(" + "))
    }

    /// Rows whose total differs from the sum of parts by half a unit in the
    /// last decimal place or more.
    fn violation_sql(invariant: &InvariantSpec) -> String {
        let tolerance = 0.5 * 10f64.powi(-(invariant.scale as i32));
        format!(
            "ABS(COALESCE({}, 0) - {}) >= {:.*}",
            Utils::quote_ident(&invariant.total),
            Self::parts_sum_sql(invariant),
            invariant.scale as usize + 1,
            tolerance
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::backfill::DataBackfiller;
    use crate::migration::columns::ColumnMigrator;
    use crate::test_support::{self, fee_row};
    use pretty_assertions::assert_eq;

    fn split_store() -> Connection {
        let conn = test_support::legacy_store();
        let plan = MigrationPlan::fee_split();
        let mut progress = MigrationProgress::new(false);
        ColumnMigrator::run_stage(&conn, &plan, &mut progress).unwrap();
        DataBackfiller::run_stage(&conn, &plan, &mut progress).unwrap();
        conn
    }

    fn invariant() -> InvariantSpec {
        MigrationPlan::fee_split().invariants()[0].clone()
    }

    #[test]
    fn test_violation_sql() {
        assert_eq!(
            ConsistencyValidator::violation_sql(&invariant()),
            "ABS(COALESCE(\"amount\", 0) - (COALESCE(\"jf_amount\", 0) + COALESCE(\"tf_amount\", 0))) >= 0.005"
        );
    }

    #[test]
    fn test_backfilled_store_conforms() {
        let conn = split_store();
        let report = ConsistencyValidator::validate(&conn, &invariant()).unwrap();
        assert_eq!(
            report,
            ValidationReport {
                invariant: "fees.amount_is_jf_plus_tf".into(),
                table: "fees".into(),
                total_rows: 3,
                conforming: 3,
                violating: 0,
                repaired: 0,
                remaining: 0,
            }
        );
    }

    #[test]
    fn test_repair_recomputes_total_from_parts() {
        let conn = split_store();
        conn.execute_batch("UPDATE fees SET jf_amount = 600, tf_amount = 400 WHERE id = 1;")
            .unwrap();

        let report = ConsistencyValidator::validate(&conn, &invariant()).unwrap();
        assert_eq!(report.violating, 1);
        assert_eq!(report.repaired, 1);
        assert_eq!(report.remaining, 0);
        assert_eq!(fee_row(&conn, 1), (1000.0, 600.0, 400.0));
        // Other rows untouched
        assert_eq!(fee_row(&conn, 2), (250.5, 250.5, 0.0));
    }

    #[test]
    fn test_repair_keeps_parts_finer_than_the_scale() {
        let conn = split_store();
        conn.execute_batch("UPDATE fees SET jf_amount = 0.125, tf_amount = 0, amount = 0 WHERE id = 3;")
            .unwrap();

        let report = ConsistencyValidator::validate(&conn, &invariant()).unwrap();
        assert_eq!(report.violating, 1);
        assert_eq!(report.repaired, 1);
        assert_eq!(report.remaining, 0);
        assert_eq!(fee_row(&conn, 3), (0.125, 0.125, 0.0));
    }

    #[test]
    fn test_matching_parts_and_total_need_no_repair() {
        let conn = split_store();
        conn.execute_batch("UPDATE fees SET jf_amount = 600.00, tf_amount = 400.00, amount = 1000.00 WHERE id = 1;")
            .unwrap();

        let report = ConsistencyValidator::validate(&conn, &invariant()).unwrap();
        assert_eq!(report.violating, 0);
        assert_eq!(report.repaired, 0);
        assert_eq!(fee_row(&conn, 1), (1000.0, 600.0, 400.0));
    }

    #[test]
    fn test_invariant_columns_match_case_insensitively() {
        let conn = split_store();
        let shouted = InvariantSpec {
            total: "AMOUNT".into(),
            parts: vec!["JF_Amount".into(), "tf_amount".into()],
            ..invariant()
        };
        let report = ConsistencyValidator::validate(&conn, &shouted).unwrap();
        assert_eq!(report.total_rows, 3);
        assert_eq!(report.remaining, 0);
    }

    #[test]
    fn test_domain_on_missing_column_is_validation_error() {
        let conn = test_support::legacy_store();
        let domain = ValueDomain {
            column: "state".into(),
            ..MigrationPlan::fee_split().domains()[0].clone()
        };
        let result = ConsistencyValidator::check_domain(&conn, &domain);
        assert!(matches!(result, Err(MigrateError::ValidationError(_))));
    }

    #[test]
    fn test_sub_cent_noise_is_not_a_violation() {
        let conn = split_store();
        conn.execute_batch("UPDATE fees SET jf_amount = 0.1, tf_amount = 0.2, amount = 0.3 WHERE id = 3;")
            .unwrap();
        let report = ConsistencyValidator::validate(&conn, &invariant()).unwrap();
        assert_eq!(report.violating, 0);
    }

    #[test]
    fn test_report_only_fails_without_rewriting() {
        let conn = split_store();
        conn.execute_batch("UPDATE fees SET tf_amount = 50 WHERE id = 2;").unwrap();
        let strict = InvariantSpec {
            repair: RepairPolicy::ReportOnly,
            ..invariant()
        };

        let err = ConsistencyValidator::validate(&conn, &strict).unwrap_err();
        match err {
            MigrateError::ValidationError(msg) => assert!(msg.starts_with("1 row(s)"), "{}", msg),
            other => panic!("expected ValidationError, got {:?}", other),
        }
        assert_eq!(fee_row(&conn, 2), (250.5, 250.5, 50.0));
    }

    #[test]
    fn test_missing_part_column_is_validation_error() {
        let conn = test_support::legacy_store();
        let result = ConsistencyValidator::validate(&conn, &invariant());
        assert!(matches!(result, Err(MigrateError::ValidationError(_))));
    }

    #[test]
    fn test_domain_check_reports_unrecognized_values() {
        let conn = test_support::legacy_store();
        conn.execute_batch(
            "INSERT INTO attendance (user_id, batch_id, date, status) VALUES
                (12, 2, '2024-01-09', 'HOLIDAY'),
                (13, 2, '2024-01-09', 'late');",
        )
        .unwrap();
        let plan = MigrationPlan::fee_split();

        let report = ConsistencyValidator::check_domain(&conn, &plan.domains()[0]).unwrap();
        assert_eq!(
            report.values,
            vec![
                ("HOLIDAY".to_owned(), 1),
                ("absent".to_owned(), 1),
                ("late".to_owned(), 1),
                ("present".to_owned(), 1),
            ]
        );
        assert_eq!(report.unrecognized, vec!["late".to_owned()]);
    }

    #[test]
    fn test_run_stage_collects_reports_and_warnings() {
        let conn = split_store();
        conn.execute_batch("UPDATE fees SET jf_amount = 600, tf_amount = 400 WHERE id = 1;")
            .unwrap();
        let mut progress = MigrationProgress::new(false);

        let (output, reports) =
            ConsistencyValidator::run_stage(&conn, &MigrationPlan::fee_split(), &mut progress).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(output.detail, "1 invariant(s) hold, 1 row(s) repaired");
        assert_eq!(output.warnings.len(), 1);
    }
}
