//! The frontend session: per-client protocol state machine.

pub mod core;
pub mod protocol;
pub mod startup;

pub use self::core::{FrontendSession, SessionPhase, Transport};
