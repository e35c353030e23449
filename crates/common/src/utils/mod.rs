//! Small helpers shared by the resilience and job modules
//!
//! - **[`macros`]**: label conversions for config-facing enums
//! - **[`serde`]**: duration encodings used by configs and snapshots

#[macro_use]
pub mod macros;
pub mod serde;

pub use self::serde::{duration_millis, option_duration_millis};
