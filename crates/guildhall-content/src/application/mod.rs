//! Content pack installation.

pub mod installer;
