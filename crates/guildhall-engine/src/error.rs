//! Errors raised while assembling the engine.

use guildhall_core::config::ConfigError;
use guildhall_core::error::DomainError;
use thiserror::Error;

/// Why a [`crate::engine::GuildEngine`] could not be built.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The configuration is inconsistent.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An extension could not be registered.
    #[error(transparent)]
    Domain(#[from] DomainError),
}
