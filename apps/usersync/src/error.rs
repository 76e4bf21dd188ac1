//! CLI error types and exit codes

use thiserror::Error;
use usersync_engine::SyncError;

/// Exit codes for the CLI
/// - 0: Success
/// - 1: General error
/// - 2: Configuration error
/// - 3: Run aborted by a safety limit
pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Run aborted: {0}")]
    Aborted(String),

    #[error("Remove list error: {0}")]
    RemoveList(String),

    #[error("{failed} dashboard actions failed")]
    ActionsFailed { failed: usize },

    #[error("I/O error: {0}")]
    Io(String),
}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) => 2,
            CliError::Sync(e) if e.is_config_error() => 2,
            CliError::Aborted(_) => 3,
            CliError::Sync(_)
            | CliError::RemoveList(_)
            | CliError::ActionsFailed { .. }
            | CliError::Io(_) => 1,
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        CliError::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::Config("bad".into()).exit_code(), 2);
        assert_eq!(
            CliError::Sync(SyncError::configuration("bad")).exit_code(),
            2
        );
        assert_eq!(
            CliError::Sync(SyncError::IncompleteSnapshot { side: "directory" }).exit_code(),
            2
        );
        assert_eq!(CliError::Sync(SyncError::connector("down")).exit_code(), 1);
        assert_eq!(CliError::Aborted("limit".into()).exit_code(), 3);
        assert_eq!(CliError::ActionsFailed { failed: 2 }.exit_code(), 1);
    }
}
