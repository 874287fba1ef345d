//! Guildhall: content authoring.
//!
//! Content packs are YAML documents bundling quest templates and
//! relationship rules. A pack is parsed, validated as a whole, fingerprinted
//! with a SHA-256 version hash, and installed into a guild.

pub mod application;
pub mod domain;
