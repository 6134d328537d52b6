//! # AutoWeave Core
//!
//! Shared foundations for the AutoWeave orchestration host: the unified
//! error type and the configuration tree with security-level presets.

pub mod config;
pub mod error;

pub use config::{
    AppConfig, ChannelCaps, EnforcerCaps, MonitoringConfig, PluginDirConfig, QueueDefaults,
    SecurityConfig, SecurityLevel, ShutdownConfig, StreamConfig, WorkerScalingConfig,
};
pub use error::{Error, Result, ValidationError, ValidationErrors};
