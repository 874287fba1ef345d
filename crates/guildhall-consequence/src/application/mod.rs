//! Application services for consequence dispatch.

pub mod engine;
pub mod registry;
