//! Reliquary - schema-evolving record persistence
//!
//! This library crate exposes the binary's config loading and the player
//! entity for integration testing.

pub mod config;
pub mod player;
