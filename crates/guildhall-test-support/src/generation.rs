//! Test generation and validation doubles.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use guildhall_core::error::DomainError;
use guildhall_core::guild::GuildId;
use guildhall_core::ports::{
    ContentGenerator, ExistingIdSets, StructuredValidator, ValidationOutcome, ValidationStatus,
};

/// A generator that returns the same payload for every concept and records
/// the concepts it was asked for.
#[derive(Debug)]
pub struct ScriptedGenerator {
    payload: serde_json::Value,
    concepts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    /// Creates a generator that always returns `payload`.
    #[must_use]
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            concepts: Mutex::new(Vec::new()),
        }
    }

    /// Concepts received so far.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn concepts(&self) -> Vec<String> {
        self.concepts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        _guild: GuildId,
        concept: &str,
        _hints: &BTreeMap<String, String>,
    ) -> Result<serde_json::Value, DomainError> {
        self.concepts.lock().unwrap().push(concept.to_owned());
        Ok(self.payload.clone())
    }
}

/// A generator whose upstream model is unavailable.
#[derive(Debug)]
pub struct FailingGenerator;

#[async_trait]
impl ContentGenerator for FailingGenerator {
    async fn generate(
        &self,
        _guild: GuildId,
        _concept: &str,
        _hints: &BTreeMap<String, String>,
    ) -> Result<serde_json::Value, DomainError> {
        Err(DomainError::Collaborator("model endpoint unavailable".into()))
    }
}

/// A validator with a scripted verdict.
#[derive(Debug)]
pub struct ScriptedValidator {
    status: ValidationStatus,
    errors: Vec<String>,
    requires_moderation: bool,
    shapes: Mutex<Vec<String>>,
}

impl ScriptedValidator {
    /// Accepts every payload unchanged and asks for moderation.
    #[must_use]
    pub fn accepting() -> Self {
        Self {
            status: ValidationStatus::Valid,
            errors: Vec::new(),
            requires_moderation: true,
            shapes: Mutex::new(Vec::new()),
        }
    }

    /// Rejects every payload with `errors`.
    #[must_use]
    pub fn rejecting(errors: Vec<String>) -> Self {
        Self {
            status: ValidationStatus::Invalid,
            errors,
            requires_moderation: false,
            shapes: Mutex::new(Vec::new()),
        }
    }

    /// Expected shapes received so far.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn shapes(&self) -> Vec<String> {
        self.shapes.lock().unwrap().clone()
    }
}

#[async_trait]
impl StructuredValidator for ScriptedValidator {
    async fn validate(
        &self,
        payload: &serde_json::Value,
        expected_shape: &str,
        _existing_ids: &ExistingIdSets,
    ) -> Result<ValidationOutcome, DomainError> {
        self.shapes.lock().unwrap().push(expected_shape.to_owned());
        Ok(ValidationOutcome {
            status: self.status,
            validated_data: self.status.is_success().then(|| payload.clone()),
            errors: self.errors.clone(),
            requires_moderation: self.requires_moderation,
        })
    }
}
