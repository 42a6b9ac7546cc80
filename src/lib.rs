//! # GuildTunes
//!
//! Per-guild music playback orchestration for Discord: a player per guild,
//! a queue with shuffle and repeat, transport over either an in-process
//! songbird engine or a pool of remote audio nodes, pending search
//! selections and tier-based admission limits.

pub mod audio;
pub mod cache;
pub mod config;
pub mod error;
pub mod nodes;
pub mod orchestrator;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{PlaybackError, PlaybackResult, SelectionError};
pub use orchestrator::Orchestrator;
