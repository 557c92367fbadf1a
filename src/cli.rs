use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use log::info;

use crate::backup::BackupService;
use crate::config::{Config, Environment};
use crate::database::{ConnectionManager, StoreLocation};
use crate::error::MigrateError;
use crate::migration::{MigrationOutcome, MigrationRunner, RunStatus};
use crate::plan::MigrationPlan;
use crate::prompt::TerminalPrompt;
use crate::schema::SchemaInspector;
use crate::utils::Utils;

const LONG_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (built ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser)]
#[command(
    name = "safemigrate",
    version,
    long_version = LONG_VERSION,
    about = "SafeMigrate: guarded, resumable schema and data migrations"
)]
pub struct Cli {
    /// Configuration file (default: ./safemigrate.toml, then the user config directory)
    #[arg(long = "config", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the migration plan against a store
    Run {
        /// Target environment
        #[arg(long = "env", short = 'e', value_enum)]
        env: Environment,

        /// Store location, overriding the configured one (e.g. sqlite:///app.db)
        #[arg(long = "store", short = 's')]
        store: Option<String>,

        /// Plan file (default: configured plan, then the built-in fee split plan)
        #[arg(long = "plan", short = 'p')]
        plan: Option<PathBuf>,

        /// Do not take a backup first (refused in production)
        #[arg(long = "skip-backup", default_value_t = false)]
        skip_backup: bool,

        #[arg(long = "format", value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show the live columns of the plan's tables (read-only)
    Inspect {
        #[arg(long = "env", short = 'e', value_enum)]
        env: Environment,

        #[arg(long = "store", short = 's')]
        store: Option<String>,

        /// Only this table
        #[arg(long = "table", short = 't', conflicts_with = "all")]
        table: Option<String>,

        /// Every table in the store, not just the plan's
        #[arg(long = "all", default_value_t = false)]
        all: bool,

        #[arg(long = "format", value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List the backups kept next to a store
    Backups {
        #[arg(long = "env", short = 'e', value_enum)]
        env: Environment,

        #[arg(long = "store", short = 's')]
        store: Option<String>,
    },

    /// Print the plan a run would use, as TOML
    Plan {
        #[arg(long = "plan", short = 'p')]
        plan: Option<PathBuf>,
    },
}

impl Cli {
    /// Dispatch a parsed command line. Returns the process exit code.
    pub fn handle_command_line(self, config: &Config) -> Result<i32, MigrateError> {
        match self.command {
            Command::Run {
                env,
                store,
                plan,
                skip_backup,
                format,
            } => Self::run(config, env, store.as_deref(), plan.as_deref(), skip_backup, format),
            Command::Inspect {
                env,
                store,
                table,
                all,
                format,
            } => Self::inspect(config, env, store.as_deref(), table.as_deref(), all, format),
            Command::Backups { env, store } => Self::backups(config, env, store.as_deref()),
            Command::Plan { plan } => {
                let plan = Self::load_plan(config, plan.as_deref())?;
                print!("{}", plan.to_toml_string()?);
                Ok(0)
            }
        }
    }

    fn run(
        config: &Config,
        env: Environment,
        store: Option<&str>,
        plan_path: Option<&Path>,
        skip_backup: bool,
        format: OutputFormat,
    ) -> Result<i32, MigrateError> {
        let run_config = config.run_configuration(env, store, skip_backup)?;
        let plan = Self::load_plan(config, plan_path)?;

        let mut prompt = TerminalPrompt;
        let mut runner = MigrationRunner::new(run_config, plan, &mut prompt);
        if format == OutputFormat::Json {
            runner = runner.quiet();
        }
        let outcome = runner.run();

        match format {
            OutputFormat::Text => Self::print_outcome(&outcome),
            OutputFormat::Json => println!("{}", to_json(&outcome)?),
        }

        Ok(outcome.exit_code())
    }

    fn inspect(
        config: &Config,
        env: Environment,
        store: Option<&str>,
        table: Option<&str>,
        all: bool,
        format: OutputFormat,
    ) -> Result<i32, MigrateError> {
        let run_config = config.run_configuration(env, store, false)?;
        let db = ConnectionManager::connect(&run_config)?;
        let conn = db.conn();

        let snapshot = match table {
            Some(table) => {
                // Surface a missing table as an error rather than an empty listing
                SchemaInspector::current_columns(conn, table)?;
                SchemaInspector::snapshot(conn, &[table])?
            }
            None if all => SchemaInspector::snapshot_all(conn)?,
            None => {
                let plan = Self::load_plan(config, None)?;
                SchemaInspector::snapshot(conn, &plan.tables())?
            }
        };

        match format {
            OutputFormat::Json => println!("{}", to_json(&snapshot)?),
            OutputFormat::Text => {
                println!("Store: {}", db.identity());
                if snapshot.is_empty() {
                    println!("(no tables)");
                }
                for (name, columns) in snapshot.tables() {
                    let rows = SchemaInspector::row_count(conn, name)?;
                    println!("\n{} ({} rows)", name, rows);
                    for column in columns {
                        println!("  {:<24} {}", column.name, column.declared_type);
                    }
                }
            }
        }

        Ok(0)
    }

    fn backups(config: &Config, env: Environment, store: Option<&str>) -> Result<i32, MigrateError> {
        let run_config = config.run_configuration(env, store, false)?;
        let location = StoreLocation::parse(&run_config.store)?;

        let store_path = match location.file_path() {
            Some(path) => dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()),
            None => {
                println!("Store {} has no backing file, so it has no file backups", location);
                return Ok(0);
            }
        };

        let backups = BackupService::list_backups(&store_path, &run_config.backup.directory)?;
        let backup_dir = BackupService::backup_dir(&store_path, &run_config.backup.directory);
        if backups.is_empty() {
            println!("No backups in {}", backup_dir.display());
            return Ok(0);
        }

        println!("Backups in {}:", backup_dir.display());
        for backup in &backups {
            let name = backup
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            println!("  {:<48} {:>12}", name, Utils::format_size(backup.size_bytes));
        }

        Ok(0)
    }

    /// `--plan` wins over the configured plan file, which wins over the built-in plan.
    fn load_plan(config: &Config, explicit: Option<&Path>) -> Result<MigrationPlan, MigrateError> {
        let configured = config.plan.file.as_deref().map(Path::new);
        match explicit.or(configured) {
            Some(path) => {
                info!("Loading plan from {}", path.display());
                MigrationPlan::from_file(path)
            }
            None => Ok(MigrationPlan::fee_split()),
        }
    }

    fn print_outcome(outcome: &MigrationOutcome) {
        println!("\n{}", "=".repeat(60));
        println!("Plan:        {}", outcome.plan);
        println!("Store:       {} ({})", outcome.store, outcome.environment);
        println!("Status:      {}", outcome.status.as_str());
        println!("Final state: {}", outcome.final_state);
        if let Some(backup) = &outcome.backup {
            match &backup.location {
                Some(path) => {
                    println!("Backup:      {}", path.display());
                    println!("             Keep this file until the migrated store has been verified.");
                }
                None => println!("Backup:      none (store has no backing file)"),
            }
        }
        for report in &outcome.stages {
            println!("  {:<28} {:<8} {}", report.stage.title(), report.status.as_str(), report.detail);
        }
        if !outcome.warnings.is_empty() {
            println!("Warnings:    {}", outcome.warnings.len());
        }
        if let Some(error) = &outcome.error {
            println!("Error:       {}", error);
        }
        println!(
            "Elapsed:     {}",
            Utils::format_elapsed(std::time::Duration::from_millis(outcome.elapsed_ms))
        );

        match outcome.status {
            RunStatus::Succeeded => {
                println!("\nNext steps:");
                println!("  1. Restart the application against the migrated store");
                println!("  2. Spot-check records touched by the backfill");
                println!("  3. Re-running is safe; completed stages are skipped");
            }
            RunStatus::Failed => {
                println!("\nFix the error above and run again; completed stages will be skipped.");
            }
            RunStatus::Cancelled => {}
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, MigrateError> {
    serde_json::to_string_pretty(value).map_err(|e| MigrateError::Error(format!("could not render JSON: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_parsing_run_command() {
        let cli = Cli::try_parse_from(["safemigrate", "run", "--env", "production"]).unwrap();
        match cli.command {
            Command::Run {
                env,
                store,
                plan,
                skip_backup,
                format,
            } => {
                assert_eq!(env, Environment::Production);
                assert!(store.is_none());
                assert!(plan.is_none());
                assert!(!skip_backup);
                assert_eq!(format, OutputFormat::Text);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_cli_parsing_run_with_options() {
        let cli = Cli::try_parse_from([
            "safemigrate",
            "run",
            "-e",
            "development",
            "--store",
            "sqlite:///tmp/app.db",
            "--skip-backup",
            "--format",
            "json",
            "--config",
            "custom.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        assert!(matches!(
            cli.command,
            Command::Run {
                env: Environment::Development,
                skip_backup: true,
                format: OutputFormat::Json,
                ..
            }
        ));
    }

    #[test]
    fn test_cli_parsing_requires_env() {
        assert!(Cli::try_parse_from(["safemigrate", "run"]).is_err());
        assert!(Cli::try_parse_from(["safemigrate", "run", "--env", "staging"]).is_err());
        assert!(Cli::try_parse_from(["safemigrate", "inspect", "--table", "fees"]).is_err());
        assert!(
            Cli::try_parse_from(["safemigrate", "inspect", "-e", "development", "--table", "fees", "--all"]).is_err()
        );
    }

    #[test]
    fn test_cli_parsing_invalid_arguments() {
        assert!(Cli::try_parse_from(["safemigrate"]).is_err(), "a command is required");
        assert!(Cli::try_parse_from(["safemigrate", "serve"]).is_err());
        assert!(Cli::try_parse_from(["safemigrate", "plan", "--invalid-flag"]).is_err());
    }

    #[test]
    fn test_load_plan_prefers_explicit_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("plan.toml");
        let mut plan_text = MigrationPlan::fee_split().to_toml_string().unwrap();
        plan_text = plan_text.replacen("name = \"fee_split\"", "name = \"custom\"", 1);
        std::fs::write(&path, plan_text).unwrap();

        let config = Config::default();
        assert_eq!(Cli::load_plan(&config, None).unwrap().name(), "fee_split");
        assert_eq!(Cli::load_plan(&config, Some(&path)).unwrap().name(), "custom");

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            Cli::load_plan(&config, Some(&missing)),
            Err(MigrateError::PlanError(_))
        ));
    }
}
