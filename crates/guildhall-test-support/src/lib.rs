//! Shared test doubles and utilities for the Guildhall engine.

mod clock;
mod generation;
mod notifier;
mod persistence;
mod world;

pub use clock::{FixedClock, fixed_clock};
pub use generation::{FailingGenerator, ScriptedGenerator, ScriptedValidator};
pub use notifier::{Notification, RecordingNotifier};
pub use persistence::{FailingPersistence, InMemoryPersistence};
pub use world::{RecordingWorld, WorldCall};
