//! Guildhall: consequence dispatch.
//!
//! Turns data-only consequence instructions (what should change) into calls
//! on the subsystems that own the affected state (stats, inventory,
//! locations, relationships, quests). A failing instruction never stops the
//! ones after it.

pub mod application;
pub mod domain;
