//! Guildhall Core: shared tenancy and collaborator abstractions.
//!
//! This crate defines the fundamental types every guild-scoped manager
//! depends on: identifiers, the per-guild cache with its dirty set, the
//! tenant isolation guard, and the ports through which the engine reaches
//! persistence, content generation, validation and notification services.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod guild;
pub mod isolation;
pub mod localized;
pub mod persistence;
pub mod ports;
