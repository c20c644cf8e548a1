use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionTime {
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// One isolated analysis workspace. Owns a working directory with
/// `datasets/`, `scripts/` and `results/` subdirectories plus the
/// append-only context file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: Option<String>,
    pub directory: String,
    pub time: SessionTime,
}

impl Session {
    pub fn new(title: Option<String>, directory: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title,
            directory,
            time: SessionTime {
                created: now,
                updated: now,
            },
        }
    }
}
