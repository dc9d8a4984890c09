use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepchainError {
    // Input errors
    #[error("Invalid step: {step}. Must be 1-{total}.")]
    InvalidStep { step: String, total: u32 },

    #[error("Run {run_id} belongs to a different scenario.")]
    ScenarioMismatch { run_id: String },

    #[error("Run {run_id} does not contain step {step}.")]
    StepNotInRun { run_id: String, step: u32 },

    #[error("Missing {0} query parameter")]
    MissingParameter(String),

    #[error("Invalid scenario: {0}. Use one of: chained, sequential, race.")]
    UnknownScenario(String),

    // Run store errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run already exists: {0}")]
    DuplicateId(String),

    #[error("Database error: {0}")]
    Database(String),

    // Execution errors
    #[error("Aborted")]
    Aborted,

    #[error("Step execution failed: {0}")]
    Executor(String),

    #[error("Step {step} dispatch failed{}: {message}", http_suffix(.status))]
    Dispatch {
        step: u32,
        status: Option<u16>,
        message: String,
    },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn http_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (HTTP {})", code),
        None => String::new(),
    }
}

impl StepchainError {
    /// Caller mistakes: reported synchronously, never persisted.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidStep { .. }
                | Self::ScenarioMismatch { .. }
                | Self::StepNotInRun { .. }
                | Self::MissingParameter(_)
                | Self::UnknownScenario(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StepchainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_error_classification() {
        assert!(StepchainError::InvalidStep {
            step: "9".into(),
            total: 4
        }
        .is_input_error());
        assert!(StepchainError::UnknownScenario("batch".into()).is_input_error());
        assert!(!StepchainError::RunNotFound("r1".into()).is_input_error());
        assert!(!StepchainError::Aborted.is_input_error());
    }

    #[test]
    fn test_dispatch_message_includes_status() {
        let err = StepchainError::Dispatch {
            step: 3,
            status: Some(502),
            message: "bad gateway".into(),
        };
        assert_eq!(err.to_string(), "Step 3 dispatch failed (HTTP 502): bad gateway");

        let err = StepchainError::Dispatch {
            step: 3,
            status: None,
            message: "connection refused".into(),
        };
        assert_eq!(err.to_string(), "Step 3 dispatch failed: connection refused");
    }

    #[test]
    fn test_invalid_step_message() {
        let err = StepchainError::InvalidStep {
            step: "abc".into(),
            total: 4,
        };
        assert_eq!(err.to_string(), "Invalid step: abc. Must be 1-4.");
    }
}
