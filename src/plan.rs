//! Declarative description of one migration run.
//!
//! A [`MigrationPlan`] is built once per invocation, either from the built-in
//! fee split plan or from a TOML plan file, and is validated as it is built.
//! Nothing in a plan is raw SQL: statements are rendered from identifiers that
//! have passed [`Utils::is_valid_identifier`] and from typed literals.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::AttendanceStatus;
use crate::error::MigrateError;
use crate::utils::Utils;

const MAX_SCALE: u8 = 6;

/// Semantic column type. Serialized as its SQL declaration, e.g. `DECIMAL(10, 2)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ColumnType {
    Integer,
    Decimal { precision: u8, scale: u8 },
    Text,
    Boolean,
    Date,
    DateTime,
}

impl ColumnType {
    /// Digits after the decimal point; zero for non-decimal types.
    pub fn scale(&self) -> u8 {
        match self {
            ColumnType::Decimal { scale, .. } => *scale,
            _ => 0,
        }
    }

    /// Compare against a declared type read back from the store.
    pub fn matches_declared(&self, declared: &str) -> bool {
        match ColumnType::from_str(declared) {
            Ok(parsed) => parsed == *self,
            Err(_) => false,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Integer => write!(f, "INTEGER"),
            ColumnType::Decimal { precision, scale } => write!(f, "DECIMAL({}, {})", precision, scale),
            ColumnType::Text => write!(f, "TEXT"),
            ColumnType::Boolean => write!(f, "BOOLEAN"),
            ColumnType::Date => write!(f, "DATE"),
            ColumnType::DateTime => write!(f, "DATETIME"),
        }
    }
}

impl FromStr for ColumnType {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase();

        let simple = match normalized.as_str() {
            "INTEGER" | "INT" => Some(ColumnType::Integer),
            "TEXT" | "VARCHAR" | "STRING" => Some(ColumnType::Text),
            "BOOLEAN" | "BOOL" => Some(ColumnType::Boolean),
            "DATE" => Some(ColumnType::Date),
            "DATETIME" | "TIMESTAMP" => Some(ColumnType::DateTime),
            _ => None,
        };
        if let Some(column_type) = simple {
            return Ok(column_type);
        }

        let args = normalized
            .strip_prefix("DECIMAL(")
            .or_else(|| normalized.strip_prefix("NUMERIC("))
            .and_then(|rest| rest.strip_suffix(')'));

        if let Some(args) = args {
            let mut parts = args.split(',');
            let precision = parts.next().and_then(|p| p.parse::<u8>().ok());
            let scale = parts.next().and_then(|p| p.parse::<u8>().ok());
            if let (Some(precision), Some(scale), None) = (precision, scale, parts.next()) {
                if precision > 0 && scale <= precision && scale <= MAX_SCALE {
                    return Ok(ColumnType::Decimal { precision, scale });
                }
            }
        }

        Err(MigrateError::PlanError(format!("unrecognized column type '{}'", s)))
    }
}

impl TryFrom<String> for ColumnType {
    type Error = MigrateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ColumnType::from_str(&value)
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.to_string()
    }
}

/// A typed literal, used for column defaults and backfill constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefaultValue {
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl DefaultValue {
    /// Render as a SQL literal for a column of `column_type`.
    pub fn to_sql(&self, column_type: ColumnType) -> String {
        let scale = column_type.scale() as usize;
        match self {
            DefaultValue::Boolean(b) => if *b { "1" } else { "0" }.to_owned(),
            DefaultValue::Integer(i) if scale > 0 => format!("{:.*}", scale, *i as f64),
            DefaultValue::Integer(i) => i.to_string(),
            DefaultValue::Real(r) if scale > 0 => format!("{:.*}", scale, r),
            DefaultValue::Real(r) => format!("{:?}", r),
            DefaultValue::Text(s) => Utils::quote_literal(s),
        }
    }

    fn is_finite(&self) -> bool {
        match self {
            DefaultValue::Real(r) => r.is_finite(),
            _ => true,
        }
    }
}

/// One additive column change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub table: String,
    pub column: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultValue>,
}

impl ColumnSpec {
    pub fn new(table: &str, column: &str, column_type: ColumnType, default: Option<DefaultValue>) -> Self {
        ColumnSpec {
            table: table.to_owned(),
            column: column.to_owned(),
            column_type,
            default,
        }
    }

    pub fn add_column_sql(&self) -> String {
        let mut sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            Utils::quote_ident(&self.table),
            Utils::quote_ident(&self.column),
            self.column_type
        );
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(&default.to_sql(self.column_type));
        }
        sql
    }

    /// SQL predicate that is true while the column still holds its default.
    pub fn at_default_sql(&self) -> String {
        let column = Utils::quote_ident(&self.column);
        match &self.default {
            Some(default) => format!(
                "({} IS NULL OR {} = {})",
                column,
                column,
                default.to_sql(self.column_type)
            ),
            None => format!("{} IS NULL", column),
        }
    }
}

/// Right-hand side of a backfill assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceExpr {
    Column(String),
    Literal(DefaultValue),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub column: String,
    pub from: SourceExpr,
}

/// One conjunct of a backfill guard predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardCondition {
    /// The column is NULL or still holds the default the plan declares for it.
    AtDefault(String),
    /// The column holds a value greater than zero.
    Positive(String),
}

/// A guarded UPDATE deriving new columns from legacy ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillRule {
    pub name: String,
    pub table: String,
    pub set: Vec<Assignment>,
    pub guard: Vec<GuardCondition>,
}

impl BackfillRule {
    /// Columns the rule reads or writes, targets first.
    pub fn referenced_columns(&self) -> Vec<&str> {
        fn push<'a>(columns: &mut Vec<&'a str>, column: &'a str) {
            if !columns.contains(&column) {
                columns.push(column);
            }
        }

        let mut columns: Vec<&str> = Vec::new();
        for assignment in &self.set {
            push(&mut columns, &assignment.column);
        }
        for assignment in &self.set {
            if let SourceExpr::Column(source) = &assignment.from {
                push(&mut columns, source);
            }
        }
        for condition in &self.guard {
            match condition {
                GuardCondition::AtDefault(c) | GuardCondition::Positive(c) => push(&mut columns, c),
            }
        }
        columns
    }
}

/// Which side of an invariant is trusted when they disagree.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RepairPolicy {
    /// Recompute the total from its parts.
    #[default]
    TrustParts,
    /// Never rewrite rows; any violation fails validation.
    ReportOnly,
}

/// `total == sum(parts)` over every row of `table`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvariantSpec {
    pub name: String,
    pub table: String,
    pub total: String,
    pub parts: Vec<String>,
    #[serde(default = "InvariantSpec::default_scale")]
    pub scale: u8,
    #[serde(default)]
    pub repair: RepairPolicy,
}

impl InvariantSpec {
    fn default_scale() -> u8 {
        2
    }

    pub fn describe(&self) -> String {
        format!("{} = {}", self.total, self.parts.join(" + "))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
}

/// A text column whose values must come from a closed set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueDomain {
    pub table: String,
    pub column: String,
    pub allowed: Vec<String>,
}

/// On-disk shape of a plan; becomes a [`MigrationPlan`] only after validation.
#[derive(Debug, Clone, Deserialize)]
struct PlanDocument {
    name: String,
    #[serde(default)]
    optional_tables: Vec<String>,
    #[serde(default)]
    columns: Vec<ColumnSpec>,
    #[serde(default)]
    backfills: Vec<BackfillRule>,
    #[serde(default)]
    invariants: Vec<InvariantSpec>,
    #[serde(default)]
    indexes: Vec<IndexSpec>,
    #[serde(default)]
    domains: Vec<ValueDomain>,
}

/// The whole unit of work for one run. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PlanDocument")]
pub struct MigrationPlan {
    name: String,
    optional_tables: Vec<String>,
    columns: Vec<ColumnSpec>,
    backfills: Vec<BackfillRule>,
    invariants: Vec<InvariantSpec>,
    indexes: Vec<IndexSpec>,
    domains: Vec<ValueDomain>,
}

impl TryFrom<PlanDocument> for MigrationPlan {
    type Error = MigrateError;

    fn try_from(doc: PlanDocument) -> Result<Self, Self::Error> {
        let plan = MigrationPlan {
            name: doc.name,
            optional_tables: doc.optional_tables,
            columns: doc.columns,
            backfills: doc.backfills,
            invariants: doc.invariants,
            indexes: doc.indexes,
            domains: doc.domains,
        };
        plan.validate()?;
        Ok(plan)
    }
}

impl MigrationPlan {
    /// The fee split migration: legacy `fees.amount` is decomposed into
    /// `jf_amount` + `tf_amount`, with the attendance table checked for the
    /// holiday status and the access-pattern indexes added.
    pub fn fee_split() -> Self {
        let money = ColumnType::Decimal { precision: 10, scale: 2 };
        let zero = Some(DefaultValue::Real(0.0));

        MigrationPlan {
            name: "fee_split".to_owned(),
            optional_tables: vec!["attendance".to_owned()],
            columns: vec![
                ColumnSpec::new("fees", "jf_amount", money, zero.clone()),
                ColumnSpec::new("fees", "tf_amount", money, zero.clone()),
                ColumnSpec::new("fees", "exam_fee", money, zero.clone()),
                ColumnSpec::new("fees", "others_fee", money, zero),
            ],
            backfills: vec![BackfillRule {
                name: "fees.amount_to_jf".to_owned(),
                table: "fees".to_owned(),
                set: vec![
                    Assignment {
                        column: "jf_amount".to_owned(),
                        from: SourceExpr::Column("amount".to_owned()),
                    },
                    Assignment {
                        column: "tf_amount".to_owned(),
                        from: SourceExpr::Literal(DefaultValue::Real(0.0)),
                    },
                ],
                guard: vec![
                    GuardCondition::AtDefault("jf_amount".to_owned()),
                    GuardCondition::AtDefault("tf_amount".to_owned()),
                    GuardCondition::Positive("amount".to_owned()),
                ],
            }],
            invariants: vec![InvariantSpec {
                name: "fees.amount_is_jf_plus_tf".to_owned(),
                table: "fees".to_owned(),
                total: "amount".to_owned(),
                parts: vec!["jf_amount".to_owned(), "tf_amount".to_owned()],
                scale: 2,
                repair: RepairPolicy::TrustParts,
            }],
            indexes: vec![
                IndexSpec {
                    name: "idx_fees_user_date".to_owned(),
                    table: "fees".to_owned(),
                    columns: vec!["user_id".to_owned(), "due_date".to_owned()],
                },
                IndexSpec {
                    name: "idx_fees_batch_date".to_owned(),
                    table: "fees".to_owned(),
                    columns: vec!["batch_id".to_owned(), "due_date".to_owned()],
                },
                IndexSpec {
                    name: "idx_attendance_user_date".to_owned(),
                    table: "attendance".to_owned(),
                    columns: vec!["user_id".to_owned(), "date".to_owned()],
                },
                IndexSpec {
                    name: "idx_attendance_batch_date".to_owned(),
                    table: "attendance".to_owned(),
                    columns: vec!["batch_id".to_owned(), "date".to_owned()],
                },
            ],
            domains: vec![ValueDomain {
                table: "attendance".to_owned(),
                column: "status".to_owned(),
                allowed: AttendanceStatus::allowed_values(),
            }],
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, MigrateError> {
        toml::from_str(contents).map_err(|e| MigrateError::PlanError(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self, MigrateError> {
        let contents = fs::read_to_string(path).map_err(|e| {
            MigrateError::PlanError(format!("could not read plan file '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
            .map_err(|e| MigrateError::PlanError(format!("{}: {}", path.display(), e)))
    }

    pub fn to_toml_string(&self) -> Result<String, MigrateError> {
        toml::to_string_pretty(self).map_err(|e| MigrateError::PlanError(e.to_string()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn backfills(&self) -> &[BackfillRule] {
        &self.backfills
    }

    pub fn invariants(&self) -> &[InvariantSpec] {
        &self.invariants
    }

    pub fn indexes(&self) -> &[IndexSpec] {
        &self.indexes
    }

    pub fn domains(&self) -> &[ValueDomain] {
        &self.domains
    }

    pub fn is_optional_table(&self, table: &str) -> bool {
        self.optional_tables.iter().any(|t| t == table)
    }

    pub fn column_spec(&self, table: &str, column: &str) -> Option<&ColumnSpec> {
        self.columns
            .iter()
            .find(|c| c.table == table && c.column == column)
    }

    /// Every table the plan touches, in order of first mention.
    pub fn tables(&self) -> Vec<&str> {
        let mentioned = self
            .columns
            .iter()
            .map(|c| c.table.as_str())
            .chain(self.backfills.iter().map(|b| b.table.as_str()))
            .chain(self.invariants.iter().map(|i| i.table.as_str()))
            .chain(self.domains.iter().map(|d| d.table.as_str()))
            .chain(self.indexes.iter().map(|i| i.table.as_str()));

        let mut tables: Vec<&str> = Vec::new();
        for table in mentioned {
            if !tables.contains(&table) {
                tables.push(table);
            }
        }
        tables
    }

    fn validate(&self) -> Result<(), MigrateError> {
        let valid_name = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid_name {
            return Err(plan_error(format!("plan name '{}' is invalid", self.name)));
        }

        for table in &self.optional_tables {
            check_ident(table)?;
        }

        let mut seen_columns = HashSet::new();
        for spec in &self.columns {
            check_ident(&spec.table)?;
            check_ident(&spec.column)?;
            if !seen_columns.insert((spec.table.as_str(), spec.column.as_str())) {
                return Err(plan_error(format!(
                    "column {}.{} is declared more than once",
                    spec.table, spec.column
                )));
            }
            if let Some(default) = &spec.default {
                check_literal(default, &format!("{}.{}", spec.table, spec.column))?;
            }
        }

        let mut seen_rules = HashSet::new();
        for rule in &self.backfills {
            if !seen_rules.insert(rule.name.as_str()) {
                return Err(plan_error(format!("backfill rule '{}' is declared more than once", rule.name)));
            }
            check_ident(&rule.table)?;
            if rule.set.is_empty() {
                return Err(plan_error(format!("backfill rule '{}' assigns nothing", rule.name)));
            }
            // An unguarded rule would rewrite authoritative rows on every run
            if rule.guard.is_empty() {
                return Err(plan_error(format!("backfill rule '{}' has no guard predicate", rule.name)));
            }
            for assignment in &rule.set {
                check_ident(&assignment.column)?;
                match &assignment.from {
                    SourceExpr::Column(source) => check_ident(source)?,
                    SourceExpr::Literal(value) => check_literal(value, &rule.name)?,
                }
            }
            for condition in &rule.guard {
                match condition {
                    GuardCondition::AtDefault(column) => {
                        check_ident(column)?;
                        if self.column_spec(&rule.table, column).is_none() {
                            return Err(plan_error(format!(
                                "backfill rule '{}' guards on the default of {}.{}, which the plan does not declare",
                                rule.name, rule.table, column
                            )));
                        }
                    }
                    GuardCondition::Positive(column) => check_ident(column)?,
                }
            }
        }

        for invariant in &self.invariants {
            check_ident(&invariant.table)?;
            check_ident(&invariant.total)?;
            if invariant.parts.is_empty() {
                return Err(plan_error(format!("invariant '{}' has no parts", invariant.name)));
            }
            for part in &invariant.parts {
                check_ident(part)?;
            }
            if invariant.scale > MAX_SCALE {
                return Err(plan_error(format!(
                    "invariant '{}' scale {} exceeds {}",
                    invariant.name, invariant.scale, MAX_SCALE
                )));
            }
        }

        let mut seen_indexes = HashSet::new();
        for index in &self.indexes {
            check_ident(&index.name)?;
            check_ident(&index.table)?;
            if !seen_indexes.insert(index.name.as_str()) {
                return Err(plan_error(format!("index '{}' is declared more than once", index.name)));
            }
            if index.columns.is_empty() {
                return Err(plan_error(format!("index '{}' has no columns", index.name)));
            }
            for column in &index.columns {
                check_ident(column)?;
            }
        }

        for domain in &self.domains {
            check_ident(&domain.table)?;
            check_ident(&domain.column)?;
            if domain.allowed.is_empty() {
                return Err(plan_error(format!(
                    "value domain {}.{} allows nothing",
                    domain.table, domain.column
                )));
            }
        }

        Ok(())
    }
}

fn plan_error(msg: String) -> MigrateError {
    MigrateError::PlanError(msg)
}

fn check_ident(name: &str) -> Result<(), MigrateError> {
    if Utils::is_valid_identifier(name) {
        Ok(())
    } else {
        Err(plan_error(format!("'{}' is not a valid identifier", name)))
    }
}

fn check_literal(value: &DefaultValue, context: &str) -> Result<(), MigrateError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(plan_error(format!("literal for {} must be finite", context)))
    }
}
