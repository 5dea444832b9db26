//! garden-core - plugin resolution and git-backed versioning for Garden

pub mod config;
pub mod error;
pub mod plugins;
pub mod vcs;

pub use config::Config;
pub use error::{GardenError, Result};
pub use plugins::PluginRegistry;
pub use vcs::{GitHandler, VcsHandler};
