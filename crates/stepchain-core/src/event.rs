use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::RunId;

/// One lifecycle transition of a streamed multi-step run.
///
/// Serialized as one JSON object per line with a `type` discriminator.
/// Timings are milliseconds since the stream started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        timestamp: u64,
    },
    Start {
        run_id: RunId,
        step: u32,
        duration_ms: u64,
        timestamp: u64,
    },
    Complete {
        run_id: RunId,
        step: u32,
        duration_ms: u64,
        timestamp: u64,
    },
    RaceTimeout {
        run_id: RunId,
        completed_steps: Vec<u32>,
        failed_step: u32,
        elapsed: u64,
        message: String,
    },
    Timeout {
        run_id: RunId,
        completed_steps: Vec<u32>,
        failed_step: u32,
        elapsed: u64,
        message: String,
    },
    ManualStop {
        run_id: RunId,
        completed_steps: Vec<u32>,
        step: Option<u32>,
        elapsed: u64,
        message: String,
    },
    Error {
        run_id: RunId,
        completed_steps: Vec<u32>,
        elapsed: u64,
        message: String,
    },
    Done {
        run_id: RunId,
        completed_steps: Vec<u32>,
        timestamp: u64,
    },
}

impl RunEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::Start { .. } => "start",
            Self::Complete { .. } => "complete",
            Self::RaceTimeout { .. } => "race_timeout",
            Self::Timeout { .. } => "timeout",
            Self::ManualStop { .. } => "manual_stop",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }

    /// No event follows a terminal one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RaceTimeout { .. }
                | Self::Timeout { .. }
                | Self::ManualStop { .. }
                | Self::Error { .. }
                | Self::Done { .. }
        )
    }

    /// Newline-terminated JSON record.
    pub fn to_ndjson_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
