//! Guildhall: relationships between entities.
//!
//! Symmetric, bounded relationship records, the rule language that turns
//! game events into strength changes, and the gateway through which the
//! consequence engine reaches both.

pub mod application;
pub mod domain;
