//! Domain error types.

use thiserror::Error;

use crate::guild::GuildId;

/// Top-level domain error type.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DomainError {
    /// A write touched an entity owned by a different guild.
    #[error("tenant violation on {entity}: expected guild {expected}, found guild {found}")]
    TenantViolation {
        /// The guild the unit of work is scoped to.
        expected: GuildId,
        /// The guild the entity declares.
        found: GuildId,
        /// Human-readable description of the offending entity.
        entity: String,
    },

    /// A character, quest, template or other entity was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// The kind of entity that was looked up.
        kind: &'static str,
        /// The identifier that failed to resolve.
        id: String,
    },

    /// A validation error in domain logic.
    #[error("validation error: {0}")]
    Validation(String),

    /// A status transition that the state machine does not allow.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Status before the attempted transition.
        from: String,
        /// Requested status.
        to: String,
    },

    /// A persistence, generation, validation or notification service failed.
    #[error("collaborator failure: {0}")]
    Collaborator(String),
}

impl DomainError {
    /// Shorthand for a `NotFound` error.
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Returns `true` for errors that must abort the whole unit of work.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TenantViolation { .. })
    }

    /// Returns `true` for errors raised by an external collaborator, which
    /// are the only errors worth retrying.
    #[must_use]
    pub fn is_collaborator(&self) -> bool {
        matches!(self, Self::Collaborator(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_violation_is_fatal() {
        let err = DomainError::TenantViolation {
            expected: GuildId(1),
            found: GuildId(2),
            entity: "quest log for c-1".to_owned(),
        };
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "tenant violation on quest log for c-1: expected guild 1, found guild 2"
        );
    }

    #[test]
    fn test_not_found_formats_kind_and_id() {
        let err = DomainError::not_found("character", "c-9");
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "character not found: c-9");
    }

    #[test]
    fn test_only_collaborator_errors_are_retryable() {
        assert!(DomainError::Collaborator("timeout".into()).is_collaborator());
        assert!(!DomainError::Validation("bad".into()).is_collaborator());
    }
}
