//! Common utility helpers
//!
//! - **[`serde`]**: Serialization helpers for durations in config files

pub mod serde;

pub use self::serde::{duration_millis, duration_secs, option_duration_millis};
