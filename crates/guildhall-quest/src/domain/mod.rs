//! Domain types for the quest lifecycle.

pub mod instance;
pub mod moderation;
pub mod template;
