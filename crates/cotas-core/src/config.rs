use std::path::Path;

use serde::{Deserialize, Serialize};

use cotas_providers::AppConfig;

/// Engine-level tunables. Every field has a default so a missing or
/// partial config file still yields a usable engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Decision steps a run may take before the forced summary kicks in.
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,
    /// Upper bound on a single gateway round trip.
    #[serde(default = "default_gateway_timeout_secs")]
    pub gateway_timeout_secs: u64,
    /// Wall-clock cap for one sandboxed execution.
    #[serde(default = "default_sandbox_timeout_secs")]
    pub sandbox_timeout_secs: u64,
    /// Character budget for the rendered transcript inside a decision
    /// prompt. Oldest entries are dropped first once it is exceeded.
    #[serde(default = "default_history_budget_chars")]
    pub history_budget_chars: usize,
    #[serde(default)]
    pub providers: AppConfig,
}

fn default_max_loops() -> u32 {
    15
}

fn default_gateway_timeout_secs() -> u64 {
    60
}

fn default_sandbox_timeout_secs() -> u64 {
    30
}

fn default_history_budget_chars() -> usize {
    32_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_loops: default_max_loops(),
            gateway_timeout_secs: default_gateway_timeout_secs(),
            sandbox_timeout_secs: default_sandbox_timeout_secs(),
            history_budget_chars: default_history_budget_chars(),
            providers: AppConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file; a missing file falls back to defaults so
    /// first runs need no setup.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => {
                let config = serde_json::from_str(&raw)?;
                Ok(config)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig::load(&dir.path().join("nope.json"))
            .await
            .expect("load");
        assert_eq!(config.max_loops, 15);
        assert_eq!(config.sandbox_timeout_secs, 30);
    }

    #[tokio::test]
    async fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.json");
        tokio::fs::write(&path, r#"{"max_loops": 4}"#)
            .await
            .expect("write");
        let config = EngineConfig::load(&path).await.expect("load");
        assert_eq!(config.max_loops, 4);
        assert_eq!(config.gateway_timeout_secs, 60);
    }

    #[tokio::test]
    async fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.json");
        tokio::fs::write(&path, "{not json").await.expect("write");
        assert!(EngineConfig::load(&path).await.is_err());
    }
}
