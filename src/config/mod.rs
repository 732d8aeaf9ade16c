//! Configuration for finguard
//!
//! - path resolution (`FINGUARD_DATA_DIR` or the platform data directory)
//! - persisted settings
//! - environment-provided root secrets

pub mod paths;
pub mod secrets;
pub mod settings;

pub use paths::FinguardPaths;
pub use secrets::Secrets;
pub use settings::{KeySettings, RedactionSettings, Settings};
