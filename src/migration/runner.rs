use std::time::Instant;

use log::{error, info, warn, Level};
use logging_timer::timer;
use rusqlite::Connection;

use crate::backup::{BackupRecord, BackupService};
use crate::config::{ConfirmationPolicy, RunConfiguration};
use crate::database::{ConnectionManager, Database};
use crate::error::MigrateError;
use crate::migration::backfill::DataBackfiller;
use crate::migration::columns::ColumnMigrator;
use crate::migration::indexes::IndexBuilder;
use crate::migration::progress::MigrationProgress;
use crate::migration::validate::{ConsistencyValidator, ValidationReport};
use crate::migration::{
    MigrationOutcome, RunState, RunStatus, Stage, StageOutput, StageReport, StageStatus,
};
use crate::plan::MigrationPlan;
use crate::prompt::OperatorPrompt;
use crate::schema::SchemaInspector;
use crate::utils::Utils;

/// Drives one plan against one store, stage by stage. Any stage error moves
/// the run to `Failed` and nothing after it runs.
pub struct MigrationRunner<'p> {
    config: RunConfiguration,
    plan: MigrationPlan,
    prompt: &'p mut dyn OperatorPrompt,
    progress: MigrationProgress,
    state: RunState,
    stages: Vec<StageReport>,
    backup: Option<BackupRecord>,
    validation: Vec<ValidationReport>,
}

impl<'p> MigrationRunner<'p> {
    pub fn new(config: RunConfiguration, plan: MigrationPlan, prompt: &'p mut dyn OperatorPrompt) -> Self {
        MigrationRunner {
            config,
            plan,
            prompt,
            progress: MigrationProgress::new(true),
            state: RunState::Idle,
            stages: Vec::new(),
            backup: None,
            validation: Vec::new(),
        }
    }

    /// Keep the narrative in the log only.
    pub fn quiet(mut self) -> Self {
        self.progress = MigrationProgress::new(false);
        self
    }

    pub fn run(mut self) -> MigrationOutcome {
        let started = Instant::now();
        info!(
            "Starting plan '{}' against {} store {}",
            self.plan.name(),
            self.config.environment,
            self.config.store
        );

        let (status, error, error_kind) = match self.drive() {
            Ok(()) => {
                self.transition(RunState::Done);
                let warnings = self.progress.warnings().count();
                if warnings > 0 {
                    self.progress.send(&format!("Completed with {} warning(s)", warnings));
                }
                self.progress.send_complete();
                (RunStatus::Succeeded, None, None)
            }
            Err(MigrateError::Cancelled(reason)) => {
                self.transition(RunState::Failed);
                self.progress.send_failed(&format!("cancelled: {}", reason));
                (RunStatus::Cancelled, Some(reason), Some("Cancelled"))
            }
            Err(e) => {
                self.transition(RunState::Failed);
                self.progress.send_failed(&e.to_string());
                (RunStatus::Failed, Some(e.to_string()), Some(e.kind()))
            }
        };

        MigrationOutcome {
            plan: self.plan.name().to_owned(),
            environment: self.config.environment,
            store: self.config.store.clone(),
            status,
            final_state: self.state,
            warnings: self.progress.warnings().map(str::to_owned).collect(),
            messages: self.progress.into_history(),
            stages: self.stages,
            backup: self.backup,
            validation: self.validation,
            error,
            error_kind,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn drive(&mut self) -> Result<(), MigrateError> {
        self.progress.send(&format!(
            "Running '{}' on {} ({})",
            self.plan.name(),
            self.config.store,
            self.config.environment
        ));

        self.confirm()?;

        self.begin(Stage::Connect);
        let result = ConnectionManager::connect(&self.config);
        let db = self.check(Stage::Connect, result)?;
        self.complete(Stage::Connect, StageOutput::with_detail(format!("connected to {}", db.location())));

        self.backup(&db)?;

        {
            let _tmr = timer!(Level::Debug; "MigrationRunner", "schema inspection");
            self.begin(Stage::SchemaInspection);
            let result = Self::inspect(db.conn(), &self.plan, &mut self.progress);
            let output = self.check(Stage::SchemaInspection, result)?;
            self.complete(Stage::SchemaInspection, output);
        }

        {
            let _tmr = timer!(Level::Debug; "MigrationRunner", "columns");
            self.begin(Stage::Columns);
            let result = ColumnMigrator::run_stage(db.conn(), &self.plan, &mut self.progress);
            let output = self.check(Stage::Columns, result)?;
            self.complete(Stage::Columns, output);
        }

        {
            let _tmr = timer!(Level::Debug; "MigrationRunner", "backfill");
            self.begin(Stage::Backfill);
            let result = DataBackfiller::run_stage(db.conn(), &self.plan, &mut self.progress);
            let output = self.check(Stage::Backfill, result)?;
            self.complete(Stage::Backfill, output);
        }

        {
            let _tmr = timer!(Level::Debug; "MigrationRunner", "validation");
            self.begin(Stage::Validation);
            let result = ConsistencyValidator::run_stage(db.conn(), &self.plan, &mut self.progress);
            let (output, reports) = self.check(Stage::Validation, result)?;
            self.validation = reports;
            self.complete(Stage::Validation, output);
        }

        {
            let _tmr = timer!(Level::Debug; "MigrationRunner", "indexes");
            self.begin(Stage::Indexes);
            let output = IndexBuilder::run_stage(db.conn(), &self.plan, &mut self.progress);
            self.complete(Stage::Indexes, output);
        }

        Ok(())
    }

    /// Production runs need the operator to type the configured token.
    /// Anything else, including a prompt that cannot be answered, cancels.
    fn confirm(&mut self) -> Result<(), MigrateError> {
        let token = match &self.config.confirmation {
            ConfirmationPolicy::NotRequired => return Ok(()),
            ConfirmationPolicy::TypedToken(token) => token.clone(),
        };

        self.progress.send(&format!(
            "This will modify the PRODUCTION store at {}",
            self.config.store
        ));
        let accepted = match self
            .prompt
            .confirm_token(&format!("Type '{}' to continue", token), &token)
        {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Confirmation prompt failed: {}", e);
                false
            }
        };

        if accepted {
            self.record(Stage::Confirmation, StageStatus::Success, StageOutput::with_detail("confirmed"));
            Ok(())
        } else {
            self.record(
                Stage::Confirmation,
                StageStatus::Failed,
                StageOutput::with_detail("confirmation token not entered"),
            );
            Err(MigrateError::Cancelled("confirmation token not entered".into()))
        }
    }

    fn backup(&mut self, db: &Database) -> Result<(), MigrateError> {
        let _tmr = timer!(Level::Debug; "MigrationRunner", "backup");
        self.begin(Stage::Backup);
        let policy = self.config.backup.clone();
        let production = self.config.environment.is_production();

        if policy.skip {
            if production {
                let err = MigrateError::ConfigError("backups cannot be skipped in production".into());
                return self.check(Stage::Backup, Err(err));
            }
            let mut output = StageOutput::with_detail("skipped by operator");
            output.warn(&mut self.progress, "Backup skipped at operator request".into());
            self.record(Stage::Backup, StageStatus::Skipped, output);
            return Ok(());
        }

        let prefix = policy.prefix.clone().unwrap_or_else(|| self.plan.name().to_owned());
        match BackupService::create_backup(db, &policy, &prefix) {
            Ok(record) if record.is_placeholder() => {
                let mut output = StageOutput::with_detail("store has no backing file");
                output.warn(
                    &mut self.progress,
                    format!("No file backup for {}; take a logical backup separately", db.location()),
                );
                self.backup = Some(record);
                self.record(Stage::Backup, StageStatus::Skipped, output);
            }
            Ok(record) => {
                let detail = match &record.location {
                    Some(path) => format!("{} ({})", path.display(), Utils::format_size(record.size_bytes)),
                    None => record.id.clone(),
                };
                self.progress.send(&format!("  ✓ Backup created: {}", detail));
                self.backup = Some(record);
                self.complete(Stage::Backup, StageOutput::with_detail(detail));
            }
            Err(e) => {
                self.progress.send_error(&format!("Backup failed: {}", e));
                if production {
                    let proceed = match self.prompt.confirm("Backup failed. Continue without backup?") {
                        Ok(proceed) => proceed,
                        Err(prompt_err) => {
                            warn!("Backup prompt failed: {}", prompt_err);
                            false
                        }
                    };
                    if !proceed {
                        self.record(Stage::Backup, StageStatus::Failed, StageOutput::with_detail(e.to_string()));
                        return Err(MigrateError::Cancelled(
                            "operator declined to continue without a backup".into(),
                        ));
                    }
                }
                let mut output = StageOutput::with_detail(e.to_string());
                output.warn(&mut self.progress, format!("Continuing without backup: {}", e));
                self.record(Stage::Backup, StageStatus::Skipped, output);
            }
        }

        Ok(())
    }

    fn inspect(
        conn: &Connection,
        plan: &MigrationPlan,
        progress: &mut MigrationProgress,
    ) -> Result<StageOutput, MigrateError> {
        let tables = plan.tables();
        let snapshot = SchemaInspector::snapshot(conn, &tables)?;
        let mut output = StageOutput::default();

        for table in &tables {
            match snapshot.columns(table) {
                Some(columns) => {
                    let rows = SchemaInspector::row_count(conn, table)?;
                    progress.send(&format!("  ✓ {}: {} column(s), {} row(s)", table, columns.len(), rows));
                }
                None if plan.is_optional_table(table) => output.warn(
                    progress,
                    format!("Table '{}' does not exist - its steps will be skipped", table),
                ),
                None => {
                    return Err(MigrateError::SchemaError(format!(
                        "required table '{}' does not exist",
                        table
                    )))
                }
            }
        }

        output.detail = format!("{} of {} table(s) present", snapshot.tables().count(), tables.len());
        Ok(output)
    }

    fn begin(&mut self, stage: Stage) {
        self.progress
            .send(&format!("\n[{}/{}] {}...", stage.number(), Stage::NUMBERED, stage.title()));
    }

    /// Pass a stage result through, recording the stage as failed on error.
    fn check<T>(&mut self, stage: Stage, result: Result<T, MigrateError>) -> Result<T, MigrateError> {
        if let Err(e) = &result {
            error!("{} failed: {}", stage.title(), e);
            self.progress.send_error(&e.to_string());
            self.record(stage, StageStatus::Failed, StageOutput::with_detail(e.to_string()));
        }
        result
    }

    fn complete(&mut self, stage: Stage, output: StageOutput) {
        if let Some(state) = stage.reaches() {
            self.transition(state);
        }
        let status = if output.warnings.is_empty() {
            StageStatus::Success
        } else {
            StageStatus::Warning
        };
        self.record(stage, status, output);
    }

    fn record(&mut self, stage: Stage, status: StageStatus, output: StageOutput) {
        self.stages.push(StageReport {
            stage,
            status,
            detail: output.detail,
            warnings: output.warnings,
        });
    }

    fn transition(&mut self, next: RunState) {
        if self.state.can_advance_to(next) {
            info!("Run state: {} -> {}", self.state, next);
            self.state = next;
        } else {
            error!("Refusing run state transition {} -> {}", self.state, next);
            if !self.state.is_terminal() {
                self.state = RunState::Failed;
            }
        }
    }
}
