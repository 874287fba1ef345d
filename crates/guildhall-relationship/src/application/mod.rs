//! Rule evaluation and relationship queries.

pub mod evaluator;
pub mod query_handlers;
