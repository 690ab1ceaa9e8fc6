//! The herald service: configuration, runtime wiring and maintenance jobs.

pub mod config;
pub mod controller;
pub mod jobs;

pub use config::{HeraldConfig, find_config_file};
pub use controller::{Engine, SHUTDOWN_BROADCAST};
