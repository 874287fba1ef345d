//! Application services for the quest lifecycle.

pub mod lifecycle;
pub mod query_handlers;
pub mod revert;
