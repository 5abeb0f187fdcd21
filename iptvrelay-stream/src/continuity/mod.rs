//! Live-Continuity Controller.
//!
//! Live channels must look endless to the receiver even though providers
//! close connections, stall, or feed a transcoder that falls over. The
//! [`Supervisor`] owns a session's upstream connection and transcoder, turns
//! those events into restart triggers, and spends a decaying
//! [`RestartBudget`] on them. Catch-up sessions get no such grace.

mod budget;
mod supervisor;

pub use budget::{RestartBudget, RestartDecision};
pub(crate) use supervisor::{Supervisor, SupervisorOptions};
