//! Domain types for consequence dispatch.

pub mod instruction;
pub mod report;
