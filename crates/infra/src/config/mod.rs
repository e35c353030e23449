//! Configuration loading and management
//!
//! This module provides utilities for loading service configuration
//! from environment variables and files.

pub mod loader;
pub mod types;

// Re-export commonly used items
pub use loader::{load, load_from_env, load_from_file, candidate_config_paths};
pub use types::{BackendKind, BreakerConfig, QueueConfig, StackConfig};
