//! # Cache Module
//!
//! Short-lived per-member state. Today that is the pending search selection:
//! the handful of results a user was shown in a guild and is expected to pick
//! from by number.
//!
//! ## Configuration
//!
//! ```env
//! SELECTION_TTL_SECS=60       # How long a prompt stays answerable
//! SELECTION_SWEEP_SECS=10     # How often expired prompts are swept
//! ```

pub mod selection;

pub use selection::{parse_selection, SearchSelection, SearchSelectionCache, SelectionPrompt};
