//! syncagent - metrics-shipping agent with remote configuration sync
//!
//! The agent gathers system metrics and ships them to a control server. Every
//! delivery doubles as a poll: the server may answer with a new managed
//! configuration section or announce a new agent binary, which the agent
//! validates, installs and restarts into without an operator present.

pub mod agent;
pub mod config;
pub mod inputs;
pub mod metrics;
pub mod pipeline;
pub mod status;
pub mod sync;
