//! Name → handler registries for extension actions and custom functions.
//!
//! Both registries are filled while the engine is built and are read-only
//! afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use guildhall_core::error::DomainError;
use guildhall_core::guild::{EntityRef, GuildId};

use crate::domain::instruction::{ActionKind, ConsequenceInstruction};

/// What a handler knows about the dispatch it runs in.
#[derive(Debug, Clone, Copy)]
pub struct HandlerContext<'a> {
    /// The guild being dispatched in.
    pub guild: GuildId,
    /// What triggered the dispatch.
    pub source_id: &'a str,
    /// Resolved targets (explicit targets, or the dispatch target).
    pub targets: &'a [EntityRef],
}

/// Handler for an extension action kind.
#[async_trait]
pub trait ConsequenceHandler: Send + Sync {
    /// Applies `instruction` and returns an audit detail value.
    async fn handle(
        &self,
        context: HandlerContext<'_>,
        instruction: &ConsequenceInstruction,
    ) -> Result<serde_json::Value, DomainError>;
}

/// A function callable through the `custom` action kind.
#[async_trait]
pub trait CustomFunction: Send + Sync {
    /// Runs the function with `args` and returns an audit detail value.
    async fn call(
        &self,
        context: HandlerContext<'_>,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value, DomainError>;
}

/// Registry of extension action handlers.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ConsequenceHandler>>,
}

impl HandlerRegistry {
    /// Registers `handler` for action tag `name`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the name collides with a
    /// built-in action or an earlier registration.
    pub fn register(
        &mut self,
        name: &str,
        handler: Arc<dyn ConsequenceHandler>,
    ) -> Result<(), DomainError> {
        if !matches!(ActionKind::from(name), ActionKind::Extension(_)) {
            return Err(DomainError::Validation(format!(
                "{name} is a built-in action and cannot be overridden"
            )));
        }
        if self.handlers.contains_key(name) {
            return Err(DomainError::Validation(format!(
                "handler {name} is already registered"
            )));
        }
        self.handlers.insert(name.to_owned(), handler);
        Ok(())
    }

    /// Looks up the handler for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ConsequenceHandler>> {
        self.handlers.get(name)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("HandlerRegistry").field("handlers", &names).finish()
    }
}

/// Registry of custom functions.
#[derive(Default, Clone)]
pub struct CustomFunctionRegistry {
    functions: HashMap<String, Arc<dyn CustomFunction>>,
}

impl CustomFunctionRegistry {
    /// Registers `function` under `name`, replacing any earlier one.
    pub fn register(&mut self, name: &str, function: Arc<dyn CustomFunction>) {
        self.functions.insert(name.to_owned(), function);
    }

    /// Looks up the function registered as `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn CustomFunction>> {
        self.functions.get(name)
    }
}

impl std::fmt::Debug for CustomFunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("CustomFunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl ConsequenceHandler for Noop {
        async fn handle(
            &self,
            _context: HandlerContext<'_>,
            _instruction: &ConsequenceInstruction,
        ) -> Result<serde_json::Value, DomainError> {
            Ok(serde_json::Value::Null)
        }
    }

    #[test]
    fn test_builtin_names_cannot_be_registered() {
        let mut registry = HandlerRegistry::default();

        let result = registry.register("add_item", Arc::new(Noop));

        assert!(result.is_err());
        assert!(registry.get("add_item").is_none());
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = HandlerRegistry::default();
        registry.register("summon_storm", Arc::new(Noop)).unwrap();

        assert!(registry.register("summon_storm", Arc::new(Noop)).is_err());
        assert!(registry.get("summon_storm").is_some());
    }
}
