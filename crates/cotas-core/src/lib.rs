//! Orchestration core: the CoTAS decision loop, the append-only context
//! store, per-session cancellation and the step-event stream.

pub mod cancellation;
pub mod config;
pub mod context;
pub mod decision;
pub mod engine_loop;
pub mod event_bus;
pub mod prompt;

pub use cancellation::CancellationRegistry;
pub use config::EngineConfig;
pub use context::ContextStore;
pub use decision::parse_decision;
pub use engine_loop::{CotasLoop, RunRequest};
pub use event_bus::{EventBus, EVENT_BUS_CAPACITY};
