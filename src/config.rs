use std::fmt;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::MigrateError;

pub const CONFIG_FILENAME: &str = "safemigrate.toml";
const ENV_PREFIX: &str = "SAFEMIGRATE_";

/// Target environment of a run. Production runs are operator-gated.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoggingConfig {
    pub safemigrate: String,
    pub directory: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const SAFEMIGRATE_LEVEL: &str = "info";
    const LOG_DIRECTORY: &str = "logs";

    fn default() -> Self {
        LoggingConfig {
            safemigrate: Self::SAFEMIGRATE_LEVEL.to_string(),
            directory: Self::LOG_DIRECTORY.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        let str_original = self.safemigrate.clone();
        self.safemigrate = self.safemigrate.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.safemigrate.as_str()) {
            eprintln!(
                "Config error: safemigrate log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::SAFEMIGRATE_LEVEL
            );
            self.safemigrate = Self::SAFEMIGRATE_LEVEL.to_owned();
        }

        if self.directory.trim().is_empty() {
            eprintln!(
                "Config error: log directory is empty - using default of '{}'",
                Self::LOG_DIRECTORY
            );
            self.directory = Self::LOG_DIRECTORY.to_owned();
        }
    }

    /// flexi_logger spec: third-party crates stay at warn, our own target follows config.
    pub fn log_spec(&self) -> String {
        format!("warn, safemigrate={}", self.safemigrate)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EnvironmentConfig {
    pub store: String,
    #[serde(default)]
    pub confirmation_token: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EnvironmentsConfig {
    pub development: EnvironmentConfig,
    pub production: EnvironmentConfig,
}

impl EnvironmentsConfig {
    const DEVELOPMENT_STORE: &str = "sqlite:///app_dev.db";
    const PRODUCTION_STORE: &str = "sqlite:///app.db";
    const PRODUCTION_TOKEN: &str = "MIGRATE";

    fn default() -> Self {
        EnvironmentsConfig {
            development: EnvironmentConfig {
                store: Self::DEVELOPMENT_STORE.to_owned(),
                confirmation_token: None,
            },
            production: EnvironmentConfig {
                store: Self::PRODUCTION_STORE.to_owned(),
                confirmation_token: Some(Self::PRODUCTION_TOKEN.to_owned()),
            },
        }
    }

    fn ensure_valid(&mut self) {
        self.development.store = self.development.store.trim().to_owned();
        self.production.store = self.production.store.trim().to_owned();

        // Production is never allowed to run without a typed token
        let token_missing = self
            .production
            .confirmation_token
            .as_deref()
            .map(|t| t.trim().is_empty())
            .unwrap_or(true);
        if token_missing {
            eprintln!(
                "Config error: production confirmation token is empty - using default of '{}'",
                Self::PRODUCTION_TOKEN
            );
            self.production.confirmation_token = Some(Self::PRODUCTION_TOKEN.to_owned());
        }

        if let Some(token) = self.development.confirmation_token.as_deref() {
            if token.trim().is_empty() {
                self.development.confirmation_token = None;
            }
        }
    }

    pub fn get(&self, environment: Environment) -> &EnvironmentConfig {
        match environment {
            Environment::Development => &self.development,
            Environment::Production => &self.production,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BackupConfig {
    pub directory: String,
    #[serde(default)]
    pub prefix: Option<String>,
}

impl BackupConfig {
    const BACKUP_DIRECTORY: &str = "backups";

    fn default() -> Self {
        BackupConfig {
            directory: Self::BACKUP_DIRECTORY.to_owned(),
            prefix: None,
        }
    }

    fn ensure_valid(&mut self) {
        let trimmed = self.directory.trim();
        // The backup directory always sits next to the store
        let is_single_component = !trimmed.is_empty()
            && trimmed != "."
            && trimmed != ".."
            && !trimmed.contains('/')
            && !trimmed.contains('\\');
        if !is_single_component {
            eprintln!(
                "Config error: backup directory '{}' is invalid - using default of '{}'",
                self.directory,
                Self::BACKUP_DIRECTORY
            );
            self.directory = Self::BACKUP_DIRECTORY.to_owned();
        } else {
            self.directory = trimmed.to_owned();
        }

        if let Some(prefix) = self.prefix.as_deref() {
            let valid = !prefix.is_empty()
                && prefix
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if !valid {
                eprintln!(
                    "Config error: backup prefix '{}' is invalid - using the plan name",
                    prefix
                );
                self.prefix = None;
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PlanConfig {
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub environments: EnvironmentsConfig,
    pub backup: BackupConfig,
    #[serde(default)]
    pub plan: PlanConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            environments: EnvironmentsConfig::default(),
            backup: BackupConfig::default(),
            plan: PlanConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration as defaults, then the TOML file (if any), then
    /// `SAFEMIGRATE_`-prefixed environment variables (`__` separates nesting,
    /// e.g. `SAFEMIGRATE_ENVIRONMENTS__PRODUCTION__STORE`).
    ///
    /// An explicitly requested file that is missing or malformed is an error. Running
    /// a migration against a store picked from silently substituted defaults is not.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, MigrateError> {
        let config_path = match explicit_path {
            Some(path) => {
                if !path.is_file() {
                    return Err(MigrateError::ConfigError(format!(
                        "config file '{}' does not exist",
                        path.display()
                    )));
                }
                Some(path.to_path_buf())
            }
            None => Self::discover_config_path(),
        };

        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = &config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Config = figment.extract().map_err(|err| {
            MigrateError::ConfigError(format!(
                "could not load configuration{}: {}",
                config_path
                    .as_ref()
                    .map(|p| format!(" from {}", p.display()))
                    .unwrap_or_default(),
                err
            ))
        })?;

        config.ensure_valid();

        Ok(config)
    }

    /// `./safemigrate.toml` wins over the per-user config directory.
    fn discover_config_path() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILENAME);
        if local.is_file() {
            return Some(local);
        }

        ProjectDirs::from("", "", "safemigrate")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILENAME))
            .filter(|path| path.is_file())
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.environments.ensure_valid();
        self.backup.ensure_valid();
    }

    /// Resolve the explicit per-run configuration value handed to the
    /// connection manager and the runner.
    pub fn run_configuration(
        &self,
        environment: Environment,
        store_override: Option<&str>,
        skip_backup: bool,
    ) -> Result<RunConfiguration, MigrateError> {
        if skip_backup && environment.is_production() {
            return Err(MigrateError::ConfigError(
                "--skip-backup is not permitted in production".into(),
            ));
        }

        let env_config = self.environments.get(environment);
        let store = store_override
            .map(|s| s.trim().to_owned())
            .unwrap_or_else(|| env_config.store.clone());
        if store.is_empty() {
            return Err(MigrateError::ConnectionError(format!(
                "no store configured for the {} environment",
                environment
            )));
        }

        let confirmation = match &env_config.confirmation_token {
            Some(token) => ConfirmationPolicy::TypedToken(token.clone()),
            None => ConfirmationPolicy::NotRequired,
        };

        Ok(RunConfiguration {
            environment,
            store,
            confirmation,
            backup: BackupPolicy {
                directory: self.backup.directory.clone(),
                prefix: self.backup.prefix.clone(),
                skip: skip_backup,
            },
        })
    }
}

/// What the operator must type before any stage runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationPolicy {
    NotRequired,
    TypedToken(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPolicy {
    /// Directory name created next to the store.
    pub directory: String,
    /// File prefix; the plan name when absent.
    pub prefix: Option<String>,
    /// Operator override, only ever set outside production.
    pub skip: bool,
}

/// Everything a single run needs to know about where and how it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfiguration {
    pub environment: Environment,
    pub store: String,
    pub confirmation: ConfirmationPolicy,
    pub backup: BackupPolicy,
}

impl RunConfiguration {
    /// Development defaults against an explicit store.
    pub fn development(store: &str) -> Self {
        RunConfiguration {
            environment: Environment::Development,
            store: store.to_owned(),
            confirmation: ConfirmationPolicy::NotRequired,
            backup: BackupPolicy {
                directory: BackupConfig::BACKUP_DIRECTORY.to_owned(),
                prefix: None,
                skip: false,
            },
        }
    }

    pub fn production(store: &str, token: &str) -> Self {
        RunConfiguration {
            environment: Environment::Production,
            confirmation: ConfirmationPolicy::TypedToken(token.to_owned()),
            ..Self::development(store)
        }
    }
}
