//! Guildhall: quest lifecycle.
//!
//! Quest templates, per-character quest logs, the AI generation and
//! moderation path, and the compensating operations that undo lifecycle
//! mutations when a caller's downstream step fails.

pub mod application;
pub mod domain;
