//! The migration pipeline: an ordered set of stages driven by
//! [`MigrationRunner`], each stage owning one concern.

pub mod backfill;
pub mod columns;
pub mod indexes;
pub mod progress;
pub mod runner;
pub mod validate;


use std::fmt;

use serde::Serialize;

use crate::backup::BackupRecord;
use crate::config::Environment;
use progress::{MigrationMessage, MigrationProgress};
use validate::ValidationReport;

pub use runner::MigrationRunner;

/// Where a run is. Transitions only move forward; `Done` and `Failed` are
/// terminal. `BackedUp` may be skipped, with a warning.
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum RunState {
    Idle = 0,
    Connected = 1,
    BackedUp = 2,
    SchemaInspected = 3,
    ColumnsEnsured = 4,
    DataBackfilled = 5,
    Validated = 6,
    Indexed = 7,
    Done = 8,
    Failed = 9,
}

impl RunState {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }

    pub fn can_advance_to(&self, next: RunState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == RunState::Failed {
            return true;
        }
        next.as_i64() == self.as_i64() + 1
            || (*self == RunState::Connected && next == RunState::SchemaInspected)
    }

    pub fn full_name(&self) -> &'static str {
        match self {
            RunState::Idle => "Idle",
            RunState::Connected => "Connected",
            RunState::BackedUp => "Backed Up",
            RunState::SchemaInspected => "Schema Inspected",
            RunState::ColumnsEnsured => "Columns Ensured",
            RunState::DataBackfilled => "Data Backfilled",
            RunState::Validated => "Validated",
            RunState::Indexed => "Indexed",
            RunState::Done => "Done",
            RunState::Failed => "Failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

/// A unit of work in the pipeline and the state it reaches on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Confirmation,
    Connect,
    Backup,
    SchemaInspection,
    Columns,
    Backfill,
    Validation,
    Indexes,
}

impl Stage {
    /// Stages that get a numbered progress header.
    pub const NUMBERED: usize = 7;

    pub fn reaches(&self) -> Option<RunState> {
        match self {
            Stage::Confirmation => None,
            Stage::Connect => Some(RunState::Connected),
            Stage::Backup => Some(RunState::BackedUp),
            Stage::SchemaInspection => Some(RunState::SchemaInspected),
            Stage::Columns => Some(RunState::ColumnsEnsured),
            Stage::Backfill => Some(RunState::DataBackfilled),
            Stage::Validation => Some(RunState::Validated),
            Stage::Indexes => Some(RunState::Indexed),
        }
    }

    pub fn number(&self) -> usize {
        match self {
            Stage::Confirmation => 0,
            Stage::Connect => 1,
            Stage::Backup => 2,
            Stage::SchemaInspection => 3,
            Stage::Columns => 4,
            Stage::Backfill => 5,
            Stage::Validation => 6,
            Stage::Indexes => 7,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Stage::Confirmation => "Confirming production run",
            Stage::Connect => "Connecting to store",
            Stage::Backup => "Creating backup",
            Stage::SchemaInspection => "Inspecting schema",
            Stage::Columns => "Adding columns",
            Stage::Backfill => "Backfilling data",
            Stage::Validation => "Validating consistency",
            Stage::Indexes => "Creating indexes",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Warning,
    Skipped,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Success => "ok",
            StageStatus::Warning => "warning",
            StageStatus::Skipped => "skipped",
            StageStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    pub detail: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// What a stage hands back to the runner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOutput {
    pub detail: String,
    pub warnings: Vec<String>,
}

impl StageOutput {
    pub fn with_detail(detail: impl Into<String>) -> Self {
        StageOutput {
            detail: detail.into(),
            warnings: Vec::new(),
        }
    }

    /// Record a warning and narrate it.
    pub fn warn(&mut self, progress: &mut MigrationProgress, msg: String) {
        progress.send_warning(&msg);
        self.warnings.push(msg);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    /// The operator declined a confirmation. Ends in `Failed`, reported apart.
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// Final, machine-readable account of a run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationOutcome {
    pub plan: String,
    pub environment: Environment,
    pub store: String,
    pub status: RunStatus,
    pub final_state: RunState,
    pub stages: Vec<StageReport>,
    pub backup: Option<BackupRecord>,
    pub validation: Vec<ValidationReport>,
    pub warnings: Vec<String>,
    /// The narrative as it was reported, for consumers of `--format json`
    /// that never saw it on stdout.
    pub messages: Vec<MigrationMessage>,
    pub error: Option<String>,
    /// Taxonomy name of `error`, e.g. `ValidationError`.
    pub error_kind: Option<&'static str>,
    pub elapsed_ms: u64,
}

impl MigrationOutcome {
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Succeeded => 0,
            RunStatus::Failed | RunStatus::Cancelled => 1,
        }
    }
}

#[cfg(test)]
mod state_tests {
    use super::*;

    #[test]
    fn test_forward_only_transitions() {
        assert!(RunState::Idle.can_advance_to(RunState::Connected));
        assert!(RunState::Connected.can_advance_to(RunState::BackedUp));
        assert!(RunState::Connected.can_advance_to(RunState::SchemaInspected));
        assert!(RunState::Indexed.can_advance_to(RunState::Done));

        assert!(!RunState::Idle.can_advance_to(RunState::BackedUp));
        assert!(!RunState::Validated.can_advance_to(RunState::ColumnsEnsured));
        assert!(!RunState::BackedUp.can_advance_to(RunState::ColumnsEnsured));
    }

    #[test]
    fn test_any_live_state_can_fail_but_terminals_are_final() {
        assert!(RunState::Idle.can_advance_to(RunState::Failed));
        assert!(RunState::Indexed.can_advance_to(RunState::Failed));
        assert!(!RunState::Done.can_advance_to(RunState::Failed));
        assert!(!RunState::Failed.can_advance_to(RunState::Idle));
    }

    #[test]
    fn test_stage_numbering_matches_states() {
        for stage in [
            Stage::Connect,
            Stage::Backup,
            Stage::SchemaInspection,
            Stage::Columns,
            Stage::Backfill,
            Stage::Validation,
            Stage::Indexes,
        ] {
            let state = stage.reaches().unwrap();
            assert_eq!(state.as_i64() as usize, stage.number());
        }
        assert_eq!(Stage::Indexes.number(), Stage::NUMBERED);
    }
}
