mod backup;
mod cli;
mod config;
mod database;
mod domain;
mod error;
mod migration;
mod plan;
mod prompt;
mod schema;
#[cfg(test)]
mod test_support;
mod utils;

use clap::Parser;
use cli::Cli;
use config::Config;
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};
use log::{debug, error};

fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    };

    // Keep the handle alive for the life of the process
    let _logger = match setup_logging(&config) {
        Ok(handle) => Some(handle),
        Err(err) => {
            eprintln!("Logging is disabled: {}", err);
            None
        }
    };
    debug!("Command-line args: {:?}", std::env::args_os().collect::<Vec<_>>());

    let code = match cli.handle_command_line(&config) {
        Ok(code) => code,
        Err(err) => {
            error!("{:?}", err);
            eprintln!("{}", err);
            1
        }
    };

    std::process::exit(code);
}

fn setup_logging(config: &Config) -> Result<LoggerHandle, flexi_logger::FlexiLoggerError> {
    Logger::try_with_str(config.logging.log_spec())?
        .log_to_file(
            FileSpec::default()
                .directory(&config.logging.directory)
                .basename("safemigrate"),
        )
        .rotate(
            Criterion::Size(10 * 1024 * 1024),
            Naming::Timestamps,
            Cleanup::KeepLogFiles(10),
        )
        .duplicate_to_stderr(Duplicate::Error)
        .format_for_files(flexi_logger::detailed_format)
        .start()
}
