use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use cotas_core::{
    CancellationRegistry, ContextStore, CotasLoop, EngineConfig, EventBus, RunRequest,
};
use cotas_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use cotas_providers::ProviderRegistry;
use cotas_sandbox::{Sandbox, SandboxConfig};
use cotas_types::{DatasetMeta, EventKind};
use cotas_wire::{encode_frame, token_for};

const SUPPORTED_PROVIDER_IDS: [&str; 7] = [
    "gemini",
    "openai",
    "openrouter",
    "ollama",
    "groq",
    "mistral",
    "together",
];

#[derive(Parser, Debug)]
#[command(name = "cotas-engine")]
#[command(about = "Autonomous chain-of-thought data analysis engine")]
struct Cli {
    /// Directory holding sessions, config and logs.
    #[arg(long, global = true, env = "COTAS_STATE_DIR")]
    state_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an analysis session and print its id.
    NewSession {
        #[arg(long, default_value = "")]
        title: String,
    },
    /// List known sessions, newest first.
    Sessions,
    /// Attach dataset metadata (a JSON file) to a session.
    RegisterDataset {
        session: String,
        /// Path to a metadata JSON file, or `-` for stdin.
        #[arg(long)]
        file: String,
    },
    /// Print the transcript of a session.
    Transcript { session: String },
    /// Run the analysis loop for a goal, streaming progress to stdout.
    Run {
        goal: String,
        /// Session to run in; a fresh one is created when omitted.
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        max_loops: Option<u32>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let state_dir = resolve_state_dir(cli.state_dir);

    match cli.command {
        Command::NewSession { title } => {
            let store = open_store(&state_dir).await?;
            let session = store.create_session(&title).await?;
            println!("{}", session.id);
        }
        Command::Sessions => {
            let store = open_store(&state_dir).await?;
            for session in store.list_sessions().await {
                println!(
                    "{}  {}  {}",
                    session.id,
                    session.time.created.format("%Y-%m-%d %H:%M"),
                    session.title.as_deref().unwrap_or("(untitled)")
                );
            }
        }
        Command::RegisterDataset { session, file } => {
            let store = open_store(&state_dir).await?;
            let meta: DatasetMeta = serde_json::from_str(&read_input(&file)?)
                .context("parsing dataset metadata")?;
            let name = meta.name.clone();
            store.register_dataset(&session, meta).await?;
            println!("registered dataset `{name}` for session {session}");
        }
        Command::Transcript { session } => {
            let store = open_store(&state_dir).await?;
            let context = store.read(&session).await?;
            for entry in &context.history {
                let step = entry
                    .step
                    .map(|s| format!("step {s}"))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "[{}][{}][{}] {}",
                    entry.timestamp.format("%H:%M:%S"),
                    step,
                    entry.kind.as_str(),
                    entry.payload
                );
            }
        }
        Command::Run {
            goal,
            session,
            max_loops,
            provider,
            model,
            api_key,
            config,
        } => {
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, log_info) = init_process_logging(ProcessKind::Engine, &logs_dir, 14)?;
            info!("engine logging initialized: {:?}", log_info);
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "logging_initialized",
                    component: "engine.main",
                    session_id: None,
                    run_id: None,
                    step: None,
                    provider_id: None,
                    status: Some("ok"),
                    error_code: None,
                    detail: None,
                },
            );

            let provider = normalize_and_validate_provider(provider)?;
            let config_path = config
                .map(PathBuf::from)
                .unwrap_or_else(|| state_dir.join("config.json"));
            let mut engine_config = EngineConfig::load(&config_path).await?;
            apply_cli_overrides(&mut engine_config, provider.as_deref(), api_key);

            let store = open_store(&state_dir).await?;
            let session_id = match session {
                Some(id) => {
                    if store.get_session(&id).await.is_none() {
                        anyhow::bail!("unknown session {id}");
                    }
                    id
                }
                None => store.create_session(&goal).await?.id,
            };

            let engine = build_engine(store, &engine_config);
            let mut events = engine.events().subscribe();
            let printer = tokio::spawn(async move {
                let mut last_step = 0u32;
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            if event.step != last_step {
                                last_step = event.step;
                                println!("{} {}", token_for(EventKind::Step), event.step);
                            }
                            println!("{}", encode_frame(&event));
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });

            let outcome = engine
                .run(RunRequest {
                    session_id: session_id.clone(),
                    goal,
                    max_loops,
                    provider_id: provider,
                    model_id: model,
                })
                .await?;

            // let the printer flush the tail of the stream
            tokio::time::sleep(Duration::from_millis(50)).await;
            printer.abort();

            println!();
            println!("session: {session_id}");
            println!("status: {}", outcome.status.as_str());
            if let Some(summary) = &outcome.summary {
                println!("{summary}");
            }
        }
    }

    Ok(())
}

async fn open_store(state_dir: &Path) -> anyhow::Result<Arc<ContextStore>> {
    Ok(Arc::new(
        ContextStore::new(state_dir.join("sessions")).await?,
    ))
}

fn build_engine(store: Arc<ContextStore>, config: &EngineConfig) -> CotasLoop {
    let sandbox = Sandbox::new(SandboxConfig {
        timeout: Duration::from_secs(config.sandbox_timeout_secs),
        ..SandboxConfig::default()
    });
    CotasLoop::new(
        store,
        EventBus::new(),
        ProviderRegistry::new(config.providers.clone()),
        sandbox,
        CancellationRegistry::new(),
        config,
    )
}

/// Fold `--provider` and `--api-key` into the loaded provider config, the
/// key landing under the selected provider (gemini when none is given).
fn apply_cli_overrides(config: &mut EngineConfig, provider: Option<&str>, api_key: Option<String>) {
    if let Some(provider) = provider {
        config.providers.default_provider = Some(provider.to_string());
    }
    if let Some(key) = api_key {
        let target = provider.unwrap_or("gemini").to_string();
        config
            .providers
            .providers
            .entry(target)
            .or_default()
            .api_key = Some(key);
    }
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        SUPPORTED_PROVIDER_IDS.join(", ")
    );
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".cotas")
}

fn read_input(input: &str) -> anyhow::Result<String> {
    if input.trim() == "-" {
        use std::io::Read;
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }
    Ok(std::fs::read_to_string(input)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_validation_accepts_known_values_case_insensitive() {
        let provider =
            normalize_and_validate_provider(Some(" Gemini ".to_string())).expect("provider");
        assert_eq!(provider.as_deref(), Some("gemini"));
    }

    #[test]
    fn provider_validation_rejects_unknown_value() {
        let err = normalize_and_validate_provider(Some("gemeni".to_string())).unwrap_err();
        assert!(err.to_string().contains("unsupported provider `gemeni`"));
    }

    #[test]
    fn cli_overrides_target_selected_provider() {
        let mut config = EngineConfig::default();
        apply_cli_overrides(&mut config, Some("openai"), Some("sk-test".to_string()));
        assert_eq!(config.providers.default_provider.as_deref(), Some("openai"));
        assert_eq!(
            config.providers.providers["openai"].api_key.as_deref(),
            Some("sk-test")
        );
    }

    #[test]
    fn cli_overrides_default_the_key_to_gemini() {
        let mut config = EngineConfig::default();
        apply_cli_overrides(&mut config, None, Some("g-key".to_string()));
        assert!(config.providers.default_provider.is_none());
        assert_eq!(
            config.providers.providers["gemini"].api_key.as_deref(),
            Some("g-key")
        );
    }

    #[test]
    fn state_dir_falls_back_to_local_default() {
        assert_eq!(resolve_state_dir(None), PathBuf::from(".cotas"));
        assert_eq!(
            resolve_state_dir(Some("/tmp/x".to_string())),
            PathBuf::from("/tmp/x")
        );
    }
}
