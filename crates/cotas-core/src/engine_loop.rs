use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tracing::Level;
use uuid::Uuid;

use cotas_observability::{emit_event, ObservabilityEvent, ProcessKind};
use cotas_providers::ProviderRegistry;
use cotas_sandbox::Sandbox;
use cotas_types::{
    Decision, EventKind, ExecutionResult, RunLog, RunOutcome, RunStatus, Step, StepEvent,
    TranscriptEntry, TurnKind,
};

use crate::cancellation::CancellationRegistry;
use crate::config::EngineConfig;
use crate::context::ContextStore;
use crate::decision::parse_decision;
use crate::event_bus::EventBus;
use crate::prompt::{
    build_corrective_prompt, build_decision_prompt, build_insight_prompt, build_summary_prompt,
    search_transcript,
};

const RUN_LOG_FILE: &str = "cotas_log.json";
const FINAL_INSIGHT_FILE: &str = "final_insight.txt";
/// Generated code larger than this is clipped before being archived under
/// `scripts/`; the sandbox still executes the full code.
const MAX_SCRIPT_BYTES: usize = 1_000_000;

/// Parameters of one run. `max_loops`, provider and model fall back to
/// the engine configuration when unset.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub session_id: String,
    pub goal: String,
    pub max_loops: Option<u32>,
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
}

/// The think/search/act/evaluate loop. One instance serves all sessions;
/// each session runs at most one loop at a time.
pub struct CotasLoop {
    store: Arc<ContextStore>,
    events: EventBus,
    providers: ProviderRegistry,
    sandbox: Sandbox,
    cancellations: CancellationRegistry,
    active: ActiveRuns,
    gateway_timeout: Duration,
    history_budget: usize,
    default_max_loops: u32,
}

impl CotasLoop {
    pub fn new(
        store: Arc<ContextStore>,
        events: EventBus,
        providers: ProviderRegistry,
        sandbox: Sandbox,
        cancellations: CancellationRegistry,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            events,
            providers,
            sandbox,
            cancellations,
            active: ActiveRuns::default(),
            gateway_timeout: Duration::from_secs(config.gateway_timeout_secs),
            history_budget: config.history_budget_chars,
            default_max_loops: config.max_loops,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    /// Drive one run to a terminal state. Returns an error immediately
    /// when another run is already active for the session; context store
    /// failures also surface as errors since the transcript can no longer
    /// be trusted. Everything else ends in a [`RunOutcome`].
    pub async fn run(&self, request: RunRequest) -> anyhow::Result<RunOutcome> {
        let Some(_slot) = self.active.try_acquire(&request.session_id) else {
            anyhow::bail!(
                "a run is already active for session {}",
                request.session_id
            );
        };
        let cancel = self.cancellations.create(&request.session_id).await;
        let result = self.run_inner(&request, cancel).await;
        self.cancellations.remove(&request.session_id).await;
        result
    }

    async fn run_inner(
        &self,
        request: &RunRequest,
        cancel: tokio_util::sync::CancellationToken,
    ) -> anyhow::Result<RunOutcome> {
        let session_id = request.session_id.as_str();
        if self.store.get_session(session_id).await.is_none() {
            anyhow::bail!("unknown session {session_id}");
        }
        let working_dir = self.store.session_dir(session_id);
        let max_loops = request.max_loops.unwrap_or(self.default_max_loops).max(1);
        let run_id = Uuid::new_v4().to_string();

        let mut log = RunLog::new(&request.goal);
        let mut last_output: Option<String> = None;

        self.record(
            session_id,
            TranscriptEntry::new(TurnKind::User, format!("Analysis goal: {}", request.goal)),
            0,
        )
        .await?;
        self.observe(
            Level::INFO,
            "run_started",
            session_id,
            &run_id,
            None,
            None,
            None,
        );

        let mut step: u32 = 0;
        while step < max_loops {
            step += 1;
            if cancel.is_cancelled() {
                return self.finish_cancelled(session_id, &run_id, log, step).await;
            }

            let context = self.load_context(session_id, step).await?;
            let prompt = build_decision_prompt(
                &request.goal,
                &context,
                last_output.as_deref(),
                step,
                max_loops,
                self.history_budget,
            );

            let decision = match self.decide(request, &prompt, step, &cancel).await {
                Ok(decision) => decision,
                Err(reason) => {
                    if cancel.is_cancelled() {
                        return self.finish_cancelled(session_id, &run_id, log, step).await;
                    }
                    return self
                        .finish_failed(session_id, &run_id, log, step, reason)
                        .await;
                }
            };

            match decision {
                Decision::Think { content } => {
                    self.record(
                        session_id,
                        TranscriptEntry::for_step(step, TurnKind::Think, &content),
                        step,
                    )
                    .await?;
                    self.publish(EventKind::Think, step, &content);
                    log.steps.push(Step::new(
                        step,
                        Decision::Think {
                            content: content.clone(),
                        },
                    ));
                    last_output = Some(content);
                }

                Decision::Evaluation { verdict, text } => {
                    let payload = format!("{verdict}: {text}");
                    self.record(
                        session_id,
                        TranscriptEntry::for_step(step, TurnKind::Evaluation, &payload),
                        step,
                    )
                    .await?;
                    self.publish(EventKind::Evaluation, step, &payload);
                    log.steps.push(Step::new(
                        step,
                        Decision::Evaluation {
                            verdict,
                            text: text.clone(),
                        },
                    ));
                    last_output = Some(text);
                }

                Decision::Search { query } => {
                    let found = search_transcript(&context.history, &query);
                    self.record(
                        session_id,
                        TranscriptEntry::for_step(
                            step,
                            TurnKind::Search,
                            format!("query: {query}\n{found}"),
                        ),
                        step,
                    )
                    .await?;
                    self.publish(EventKind::Search, step, format!("{query}\n{found}"));
                    log.steps.push(Step::new(
                        step,
                        Decision::Search {
                            query: query.clone(),
                        },
                    ));
                    last_output = Some(found);
                }

                Decision::Act { code, rationale } => {
                    let header = rationale
                        .clone()
                        .unwrap_or_else(|| "executing generated code".to_string());
                    self.publish(EventKind::Act, step, &header);
                    self.record(
                        session_id,
                        TranscriptEntry::for_step(step, TurnKind::Act, &code),
                        step,
                    )
                    .await?;
                    self.store
                        .write_artifact(
                            session_id,
                            &format!("scripts/act_{step:03}.py"),
                            &cap_script(&code),
                        )
                        .await?;

                    let execution = self
                        .sandbox
                        .execute_with_cancel(&code, &working_dir, cancel.clone())
                        .await;
                    self.store
                        .write_artifact(
                            session_id,
                            &format!("results/act_{step:03}.txt"),
                            &render_execution(&execution, self.sandbox.timeout()),
                        )
                        .await?;

                    let cancelled_mid_act =
                        matches!(execution, ExecutionResult::Timeout) && cancel.is_cancelled();

                    match &execution {
                        ExecutionResult::Success { stdout, .. } => {
                            let insight = self
                                .synthesize_insight(request, &code, stdout, &cancel)
                                .await;
                            self.record(
                                session_id,
                                TranscriptEntry::for_step(step, TurnKind::Insight, &insight),
                                step,
                            )
                            .await?;
                            self.publish(EventKind::Insight, step, &insight);
                            self.observe(
                                Level::INFO,
                                "act_succeeded",
                                session_id,
                                &run_id,
                                Some(step),
                                None,
                                None,
                            );
                            last_output = Some(insight);
                        }
                        ExecutionResult::Failure { message, .. } => {
                            self.record(
                                session_id,
                                TranscriptEntry::for_step(step, TurnKind::Error, message),
                                step,
                            )
                            .await?;
                            self.publish(
                                EventKind::Error,
                                step,
                                format!("execution failed\n{message}"),
                            );
                            self.observe(
                                Level::WARN,
                                "act_failed",
                                session_id,
                                &run_id,
                                Some(step),
                                Some("execution_failure"),
                                Some(message),
                            );
                            last_output = Some(message.clone());
                        }
                        ExecutionResult::Timeout if cancelled_mid_act => {}
                        ExecutionResult::Timeout => {
                            let message = format!(
                                "execution timed out after {}s",
                                self.sandbox.timeout().as_secs()
                            );
                            self.record(
                                session_id,
                                TranscriptEntry::for_step(step, TurnKind::Error, &message),
                                step,
                            )
                            .await?;
                            self.publish(EventKind::Error, step, &message);
                            self.observe(
                                Level::WARN,
                                "act_timed_out",
                                session_id,
                                &run_id,
                                Some(step),
                                Some("execution_timeout"),
                                None,
                            );
                            last_output = Some(message);
                        }
                    }

                    log.steps.push(Step {
                        index: step,
                        decision: Decision::Act { code, rationale },
                        execution: Some(execution),
                    });

                    if cancelled_mid_act {
                        return self.finish_cancelled(session_id, &run_id, log, step).await;
                    }
                }

                Decision::Done { summary } => {
                    self.record(
                        session_id,
                        TranscriptEntry::for_step(step, TurnKind::Done, &summary),
                        step,
                    )
                    .await?;
                    self.store
                        .write_artifact(session_id, FINAL_INSIGHT_FILE, &summary)
                        .await?;
                    self.publish(EventKind::Done, step, &summary);
                    log.steps.push(Step::new(
                        step,
                        Decision::Done {
                            summary: summary.clone(),
                        },
                    ));
                    log.finish(true, None);
                    self.persist_log(session_id, &log).await?;
                    self.observe(
                        Level::INFO,
                        "run_completed",
                        session_id,
                        &run_id,
                        Some(step),
                        None,
                        None,
                    );
                    return Ok(RunOutcome {
                        status: RunStatus::Done,
                        steps: log.steps,
                        summary: Some(summary),
                    });
                }

                // The gateway never hands an unparseable decision to the
                // dispatcher; if it somehow does, fail the run loudly.
                Decision::Unparseable { reason } => {
                    return self
                        .finish_failed(session_id, &run_id, log, step, reason)
                        .await;
                }
            }
        }

        // Budget exhausted: force a summary as a synthetic extra step.
        let summary = self
            .forced_summary(request, session_id, last_output.as_deref(), &cancel)
            .await;
        let final_step = max_loops + 1;
        self.record(
            session_id,
            TranscriptEntry::for_step(final_step, TurnKind::Done, &summary),
            final_step,
        )
        .await?;
        self.store
            .write_artifact(session_id, FINAL_INSIGHT_FILE, &summary)
            .await?;
        self.publish(
            EventKind::Final,
            final_step,
            format!("loop budget exhausted after {max_loops} steps\n{summary}"),
        );
        log.steps.push(Step::new(
            final_step,
            Decision::Done {
                summary: summary.clone(),
            },
        ));
        log.finish(false, Some("max loops reached".to_string()));
        self.persist_log(session_id, &log).await?;
        self.observe(
            Level::INFO,
            "run_budget_exhausted",
            session_id,
            &run_id,
            Some(final_step),
            None,
            None,
        );
        Ok(RunOutcome {
            status: RunStatus::BudgetExhausted,
            steps: log.steps,
            summary: Some(summary),
        })
    }

    /// One gateway round trip with a single corrective retry. `Err` means
    /// both attempts failed and carries the second reason.
    async fn decide(
        &self,
        request: &RunRequest,
        prompt: &str,
        step: u32,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<Decision, String> {
        let first = self
            .providers
            .complete_bounded(
                request.provider_id.as_deref(),
                prompt,
                request.model_id.as_deref(),
                self.gateway_timeout,
                cancel.clone(),
            )
            .await;

        let reason = match first {
            Ok(raw) => match parse_decision(&raw) {
                Decision::Unparseable { reason } => reason,
                decision => return Ok(decision),
            },
            Err(err) => format!("{err:#}"),
        };

        self.publish(
            EventKind::Error,
            step,
            format!("retrying after gateway problem\n{reason}"),
        );
        self.observe(
            Level::WARN,
            "gateway_retry",
            &request.session_id,
            "",
            Some(step),
            Some("gateway_degraded"),
            Some(&reason),
        );

        let retry_prompt = build_corrective_prompt(prompt, &reason);
        match self
            .providers
            .complete_bounded(
                request.provider_id.as_deref(),
                &retry_prompt,
                request.model_id.as_deref(),
                self.gateway_timeout,
                cancel.clone(),
            )
            .await
        {
            Ok(raw) => match parse_decision(&raw) {
                Decision::Unparseable { reason } => Err(reason),
                decision => Ok(decision),
            },
            Err(err) => Err(format!("{err:#}")),
        }
    }

    async fn synthesize_insight(
        &self,
        request: &RunRequest,
        code: &str,
        stdout: &str,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> String {
        let prompt = build_insight_prompt(code, stdout);
        match self
            .providers
            .complete_bounded(
                request.provider_id.as_deref(),
                &prompt,
                request.model_id.as_deref(),
                self.gateway_timeout,
                cancel.clone(),
            )
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            _ => {
                if stdout.trim().is_empty() {
                    "execution succeeded with no output".to_string()
                } else {
                    format!("execution output:\n{}", stdout.trim())
                }
            }
        }
    }

    async fn forced_summary(
        &self,
        request: &RunRequest,
        session_id: &str,
        last_output: Option<&str>,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> String {
        let context = self.store.read(session_id).await.unwrap_or_default();
        let prompt = build_summary_prompt(&request.goal, &context, last_output);
        match self
            .providers
            .complete_bounded(
                request.provider_id.as_deref(),
                &prompt,
                request.model_id.as_deref(),
                self.gateway_timeout,
                cancel.clone(),
            )
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            _ => last_output
                .map(str::to_string)
                .unwrap_or_else(|| {
                    "No summary available; the run ended without a final insight.".to_string()
                }),
        }
    }

    async fn finish_failed(
        &self,
        session_id: &str,
        run_id: &str,
        mut log: RunLog,
        step: u32,
        reason: String,
    ) -> anyhow::Result<RunOutcome> {
        self.record(
            session_id,
            TranscriptEntry::for_step(step, TurnKind::Error, &reason),
            step,
        )
        .await?;
        self.publish(
            EventKind::Error,
            step,
            format!("model gateway failed twice\n{reason}"),
        );
        log.steps.push(Step::new(
            step,
            Decision::Unparseable {
                reason: reason.clone(),
            },
        ));
        log.finish(false, Some("gateway failure".to_string()));
        self.persist_log(session_id, &log).await?;
        self.observe(
            Level::ERROR,
            "run_failed",
            session_id,
            run_id,
            Some(step),
            Some("gateway_failure"),
            Some(&reason),
        );
        Ok(RunOutcome {
            status: RunStatus::Failed,
            steps: log.steps,
            summary: None,
        })
    }

    async fn finish_cancelled(
        &self,
        session_id: &str,
        run_id: &str,
        mut log: RunLog,
        step: u32,
    ) -> anyhow::Result<RunOutcome> {
        self.record(
            session_id,
            TranscriptEntry::for_step(step, TurnKind::Error, "run cancelled"),
            step,
        )
        .await?;
        self.publish(EventKind::Error, step, "run cancelled");
        log.finish(false, Some("cancelled".to_string()));
        self.persist_log(session_id, &log).await?;
        self.observe(
            Level::WARN,
            "run_cancelled",
            session_id,
            run_id,
            Some(step),
            None,
            None,
        );
        Ok(RunOutcome {
            status: RunStatus::Cancelled,
            steps: log.steps,
            summary: None,
        })
    }

    async fn load_context(
        &self,
        session_id: &str,
        step: u32,
    ) -> anyhow::Result<cotas_types::Context> {
        match self.store.read(session_id).await {
            Ok(context) => Ok(context),
            Err(err) => {
                self.publish(
                    EventKind::Error,
                    step,
                    format!("context store failure\n{err:#}"),
                );
                Err(err)
            }
        }
    }

    /// Append a transcript turn. A store failure is fatal to the run; it
    /// is surfaced on the event stream before propagating.
    async fn record(
        &self,
        session_id: &str,
        entry: TranscriptEntry,
        step: u32,
    ) -> anyhow::Result<()> {
        if let Err(err) = self.store.append(session_id, entry).await {
            self.publish(
                EventKind::Error,
                step,
                format!("context store failure\n{err:#}"),
            );
            self.observe(
                Level::ERROR,
                "context_store_failure",
                session_id,
                "",
                Some(step),
                Some("store_failure"),
                None,
            );
            return Err(err);
        }
        Ok(())
    }

    async fn persist_log(&self, session_id: &str, log: &RunLog) -> anyhow::Result<()> {
        let rendered = serde_json::to_string_pretty(log)?;
        self.store
            .write_artifact(session_id, RUN_LOG_FILE, &rendered)
            .await?;
        Ok(())
    }

    fn publish(&self, kind: EventKind, step: u32, payload: impl Into<String>) {
        self.events.publish(StepEvent::new(kind, step, payload));
    }

    #[allow(clippy::too_many_arguments)]
    fn observe(
        &self,
        level: Level,
        event: &str,
        session_id: &str,
        run_id: &str,
        step: Option<u32>,
        error_code: Option<&str>,
        detail: Option<&str>,
    ) {
        emit_event(
            level,
            ProcessKind::Engine,
            ObservabilityEvent {
                event,
                component: "engine_loop",
                session_id: Some(session_id),
                run_id: (!run_id.is_empty()).then_some(run_id),
                step,
                provider_id: None,
                status: None,
                error_code,
                detail,
            },
        );
    }
}

fn render_execution(execution: &ExecutionResult, timeout: Duration) -> String {
    match execution {
        ExecutionResult::Success { stdout, .. } => stdout.clone(),
        ExecutionResult::Failure { message, .. } => format!("[failure] {message}"),
        ExecutionResult::Timeout => format!("[timeout after {}s]", timeout.as_secs()),
    }
}

fn cap_script(code: &str) -> String {
    if code.len() <= MAX_SCRIPT_BYTES {
        return code.to_string();
    }
    let mut end = MAX_SCRIPT_BYTES;
    while !code.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n# clipped before archiving", &code[..end])
}

/// At most one live run per session, enforced with a drop guard so every
/// exit path releases the slot.
#[derive(Clone, Default)]
struct ActiveRuns {
    inner: Arc<StdMutex<HashSet<String>>>,
}

impl ActiveRuns {
    fn try_acquire(&self, session_id: &str) -> Option<RunSlot> {
        let mut active = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if active.insert(session_id.to_string()) {
            Some(RunSlot {
                inner: self.inner.clone(),
                session_id: session_id.to_string(),
            })
        } else {
            None
        }
    }
}

struct RunSlot {
    inner: Arc<StdMutex<HashSet<String>>>,
    session_id: String,
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.session_id);
    }
}
