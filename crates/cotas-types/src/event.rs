use serde::{Deserialize, Serialize};

/// Discriminant carried by every step event. `Final` is the forced
/// budget-exhaustion summary; `Done` is a model-chosen completion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Step,
    Think,
    Search,
    Act,
    Insight,
    Evaluation,
    Final,
    Done,
    Error,
}

/// One progress event pushed from the orchestrator to consumers.
/// Multi-line payloads are a single logical event: the first line is a
/// header, the remainder is detail a renderer may collapse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEvent {
    pub kind: EventKind,
    pub step: u32,
    pub payload: String,
}

impl StepEvent {
    pub fn new(kind: EventKind, step: u32, payload: impl Into<String>) -> Self {
        Self {
            kind,
            step,
            payload: payload.into(),
        }
    }
}
