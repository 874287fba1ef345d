//! Content pack documents.

pub mod pack;
