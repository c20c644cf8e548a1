use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Step;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The model chose DONE.
    Done,
    /// The loop budget ran out; a forced summary was produced.
    BudgetExhausted,
    /// The gateway failed twice in a row for one step.
    Failed,
    /// An external abort signal stopped the run.
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Done => "done",
            RunStatus::BudgetExhausted => "budget_exhausted",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// What one CoTAS run produced, returned to the caller once the loop has
/// reached a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Persisted record of a run (`cotas_log.json` in the session directory).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLog {
    pub goal: String,
    pub steps: Vec<Step>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RunLog {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            steps: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
            completed: false,
            reason: None,
        }
    }

    pub fn finish(&mut self, completed: bool, reason: Option<String>) {
        self.end_time = Some(Utc::now());
        self.completed = completed;
        self.reason = reason;
    }
}
