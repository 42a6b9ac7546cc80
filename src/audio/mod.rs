//! # Audio Module
//!
//! Per-guild playback orchestration for GuildTunes.
//!
//! ## Architecture
//!
//! ### [`registry`] - Player Registry
//! - Exactly one [`player::GuildPlayer`] per guild, created lazily
//! - Receives transport events and routes them to the owning player
//!
//! ### [`player`] - Guild Player
//! - Playback state machine (`NotConnected`, `Connecting`, `Playing`, `Paused`, `Idle`, `Destroyed`)
//! - Vote skipping, volume, seeking and node-loss recovery
//!
//! ### [`queue`] - Track Queue
//! - Upcoming tracks, the current track and a bounded history
//! - Shuffle and repeat modes
//!
//! ### [`facade`] - Connection Facade
//! - Local (songbird) or remote (audio node) transport, chosen once at startup
//!
//! ### [`limits`] - Admission Limits
//! - Tier-based caps on queue length and track duration

pub mod events;
pub mod facade;
pub mod limits;
pub mod local;
pub mod player;
pub mod queue;
pub mod registry;
pub mod track;
