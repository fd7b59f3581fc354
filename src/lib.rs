//! deej-bridge
//!
//! Keeps an Arduino slider box and per-application OS volumes in sync.

pub mod arduino;
pub mod cli;
pub mod config;
pub mod foreground;
pub mod keys;
pub mod paths;
pub mod protocol;
pub mod resolver;
pub mod sync;
pub mod volume;
