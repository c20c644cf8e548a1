use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub dtype: String,
}

/// Metadata extracted from an uploaded dataset by the ingestion layer.
/// The orchestrator only reads this; it never parses dataset files itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetMeta {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<ColumnMeta>,
    pub row_count: u64,
    #[serde(default)]
    pub sample_rows: Vec<Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    User,
    Think,
    Search,
    Act,
    Insight,
    Evaluation,
    Error,
    Done,
}

impl TurnKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnKind::User => "user",
            TurnKind::Think => "think",
            TurnKind::Search => "search",
            TurnKind::Act => "act",
            TurnKind::Insight => "insight",
            TurnKind::Evaluation => "evaluation",
            TurnKind::Error => "error",
            TurnKind::Done => "done",
        }
    }
}

/// One turn of the session transcript. Entries are append-only; the store
/// never rewrites an existing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    pub kind: TurnKind,
    pub payload: String,
}

impl TranscriptEntry {
    pub fn new(kind: TurnKind, payload: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            step: None,
            kind,
            payload: payload.into(),
        }
    }

    pub fn for_step(step: u32, kind: TurnKind, payload: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            step: Some(step),
            kind,
            payload: payload.into(),
        }
    }
}

/// Everything the orchestrator knows about a session: dataset metadata
/// plus the ordered transcript of prior turns.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Context {
    pub session_id: String,
    #[serde(default)]
    pub datasets: Vec<DatasetMeta>,
    #[serde(default)]
    pub history: Vec<TranscriptEntry>,
}
