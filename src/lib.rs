pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod session;
pub mod state;
pub mod util;
pub mod workflow;

pub use config::Config;
pub use error::{Error, Result};
pub use orchestration::{Coordinator, RunOutcome, RunReport, SessionConfig};
pub use session::{SessionId, SessionRegistry, SessionState, TeamSession};
