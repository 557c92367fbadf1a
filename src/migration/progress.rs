use log::{error, info, warn};
use serde::Serialize;

/// One line of the operator-facing narrative of a run.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum MigrationMessage {
    /// A progress line from a stage.
    Progress { message: String },
    /// Something the operator should look at; the run continues.
    Warning { message: String },
    /// A stage failed.
    Error { message: String },
    /// The run reached `Done`.
    Complete,
    /// The run ended in `Failed`.
    Failed { message: String },
}

/// Narrative reporter for a run. Every message goes to the log; when `echo`
/// is set it is also printed for the operator watching the run.
pub struct MigrationProgress {
    echo: bool,
    history: Vec<MigrationMessage>,
}

impl MigrationProgress {
    pub fn new(echo: bool) -> Self {
        Self {
            echo,
            history: Vec::new(),
        }
    }

    /// Send a progress line.
    pub fn send(&mut self, msg: &str) {
        info!("{}", msg);
        if self.echo {
            println!("{}", msg);
        }
        self.record(MigrationMessage::Progress {
            message: msg.to_string(),
        });
    }

    pub fn send_warning(&mut self, msg: &str) {
        warn!("{}", msg);
        if self.echo {
            println!("  ⚠ {}", msg);
        }
        self.record(MigrationMessage::Warning {
            message: msg.to_string(),
        });
    }

    pub fn send_error(&mut self, msg: &str) {
        error!("{}", msg);
        if self.echo {
            println!("  ✗ {}", msg);
        }
        self.record(MigrationMessage::Error {
            message: msg.to_string(),
        });
    }

    /// Send the completion signal.
    pub fn send_complete(&mut self) {
        info!("Migration completed successfully");
        if self.echo {
            println!("\nMIGRATION COMPLETED SUCCESSFULLY");
        }
        self.record(MigrationMessage::Complete);
    }

    /// Send the failure signal.
    pub fn send_failed(&mut self, msg: &str) {
        error!("Migration failed: {}", msg);
        if self.echo {
            println!("\nMIGRATION FAILED: {}", msg);
        }
        self.record(MigrationMessage::Failed {
            message: msg.to_string(),
        });
    }

    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.history.iter().filter_map(|m| match m {
            MigrationMessage::Warning { message } => Some(message.as_str()),
            _ => None,
        })
    }

    pub fn into_history(self) -> Vec<MigrationMessage> {
        self.history
    }

    fn record(&mut self, msg: MigrationMessage) {
        self.history.push(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_keeps_order_and_kinds() {
        let mut progress = MigrationProgress::new(false);
        progress.send("[1/7] Connecting");
        progress.send_warning("backup skipped");
        progress.send_complete();

        assert_eq!(progress.history.len(), 3);
        assert_eq!(progress.warnings().collect::<Vec<_>>(), vec!["backup skipped"]);
        assert_eq!(progress.history[2], MigrationMessage::Complete);

        let history = progress.into_history();
        assert_eq!(
            history[0],
            MigrationMessage::Progress {
                message: "[1/7] Connecting".into()
            }
        );
    }

    #[test]
    fn test_message_serializes_with_type_tag() {
        let msg = MigrationMessage::Warning {
            message: "index failed".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"Warning","message":"index failed"}"#);
    }
}
