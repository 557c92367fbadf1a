use dialoguer::Input;

use crate::error::MigrateError;

/// Operator interaction during a run. The runner only ever asks two kinds of
/// question, so tests can answer them without a terminal.
pub trait OperatorPrompt {
    /// Ask the operator to type `token`. `Ok(true)` only on an exact match.
    fn confirm_token(&mut self, message: &str, token: &str) -> Result<bool, MigrateError>;

    /// Ask a yes/no question. Anything other than a typed `yes` is a no.
    fn confirm(&mut self, message: &str) -> Result<bool, MigrateError>;
}

pub struct TerminalPrompt;

impl TerminalPrompt {
    fn read_line(message: &str) -> Result<String, MigrateError> {
        Input::<String>::new()
            .with_prompt(message)
            .allow_empty(true)
            .interact_text()
            .map(|answer| answer.trim().to_owned())
            .map_err(|e| MigrateError::Error(format!("could not read operator input: {}", e)))
    }
}

impl OperatorPrompt for TerminalPrompt {
    fn confirm_token(&mut self, message: &str, token: &str) -> Result<bool, MigrateError> {
        Ok(Self::read_line(message)? == token)
    }

    fn confirm(&mut self, message: &str) -> Result<bool, MigrateError> {
        Ok(Self::read_line(&format!("{} (yes/no)", message))?.eq_ignore_ascii_case("yes"))
    }
}

/// Answers questions from a fixed script and records what was asked.
#[cfg(test)]
pub struct ScriptedPrompt {
    answers: std::collections::VecDeque<String>,
    pub asked: Vec<String>,
}

#[cfg(test)]
impl ScriptedPrompt {
    pub fn new(answers: &[&str]) -> Self {
        ScriptedPrompt {
            answers: answers.iter().map(|a| a.to_string()).collect(),
            asked: Vec::new(),
        }
    }

    fn next(&mut self, message: &str) -> Result<String, MigrateError> {
        self.asked.push(message.to_owned());
        // An exhausted script behaves like a closed terminal
        self.answers
            .pop_front()
            .ok_or_else(|| MigrateError::Error("no scripted answer".into()))
    }
}

#[cfg(test)]
impl OperatorPrompt for ScriptedPrompt {
    fn confirm_token(&mut self, message: &str, token: &str) -> Result<bool, MigrateError> {
        Ok(self.next(message)?.trim() == token)
    }

    fn confirm(&mut self, message: &str) -> Result<bool, MigrateError> {
        Ok(self.next(message)?.trim().eq_ignore_ascii_case("yes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_prompt_matches_token_exactly() {
        let mut prompt = ScriptedPrompt::new(&["migrate", " MIGRATE "]);
        assert!(!prompt.confirm_token("Type MIGRATE", "MIGRATE").unwrap());
        assert!(prompt.confirm_token("Type MIGRATE", "MIGRATE").unwrap());
        assert!(prompt.confirm_token("Type MIGRATE", "MIGRATE").is_err());
        assert_eq!(prompt.asked.len(), 3);
    }

    #[test]
    fn test_scripted_confirm_needs_yes() {
        let mut prompt = ScriptedPrompt::new(&["y", "YES"]);
        assert!(!prompt.confirm("Continue?").unwrap());
        assert!(prompt.confirm("Continue?").unwrap());
    }
}
