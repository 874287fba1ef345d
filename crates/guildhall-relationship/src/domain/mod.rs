//! Relationship domain types.

pub mod expression;
pub mod record;
pub mod rules;
