//! Guildhall: engine composition root.
//!
//! [`engine::GuildEngine`] wires the consequence engine, quest lifecycle
//! and relationship evaluator to the host's collaborators, loads guild state
//! on first use and flushes dirty state on a cadence and at shutdown.

pub mod engine;
pub mod error;
pub mod telemetry;
