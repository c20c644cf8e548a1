pub mod context;
pub mod event;
pub mod provider;
pub mod run;
pub mod session;
pub mod step;

pub use context::*;
pub use event::*;
pub use provider::*;
pub use run::*;
pub use session::*;
pub use step::*;
