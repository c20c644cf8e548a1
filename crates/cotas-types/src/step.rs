use serde::{Deserialize, Serialize};

/// Structured interpretation of one model response within a loop
/// iteration. Produced only by the defensive parser; a response that does
/// not carry the expected fields becomes `Unparseable` rather than being
/// coerced into a guessed action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Think {
        content: String,
    },
    Search {
        query: String,
    },
    Act {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rationale: Option<String>,
    },
    Evaluation {
        verdict: String,
        text: String,
    },
    Done {
        summary: String,
    },
    Unparseable {
        reason: String,
    },
}

impl Decision {
    pub fn tag(&self) -> &'static str {
        match self {
            Decision::Think { .. } => "THINK",
            Decision::Search { .. } => "SEARCH",
            Decision::Act { .. } => "ACT",
            Decision::Evaluation { .. } => "EVALUATION",
            Decision::Done { .. } => "DONE",
            Decision::Unparseable { .. } => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The interpreter could not be started or the scratch script could
    /// not be written.
    Spawn,
    /// The process ran but exited non-zero (includes uncaught exceptions
    /// inside the executed code).
    NonZeroExit,
}

/// Outcome of running one ACT decision's code in the sandbox. Output is
/// hard-capped at [`MAX_OUTPUT_CHARS`] characters with
/// [`TRUNCATION_MARKER`] appended when the raw output exceeded the cap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success {
        stdout: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value_repr: Option<String>,
    },
    Failure {
        kind: FailureKind,
        message: String,
    },
    Timeout,
}

/// Hard cap on captured sandbox output, in characters.
pub const MAX_OUTPUT_CHARS: usize = 50_000;

/// Appended to capped output so a consumer can tell truncation from a
/// short result.
pub const TRUNCATION_MARKER: &str = "...<truncated>";

/// One loop iteration: ordinal index (1-based within a run), the decision
/// the model produced, and the execution result when the decision was ACT.
/// Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub index: u32,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionResult>,
}

impl Step {
    pub fn new(index: u32, decision: Decision) -> Self {
        Self {
            index,
            decision,
            execution: None,
        }
    }
}
