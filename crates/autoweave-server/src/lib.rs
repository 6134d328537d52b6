//! # AutoWeave Server
//!
//! Wires the host together: component construction, queue-to-plugin
//! dispatch, the plugin-to-host inbound pump, lifecycle orchestration, and
//! the health rollup. The `autoweave` binary lives in `main.rs`.

pub mod dispatch;
pub mod lifecycle;
pub mod state;

pub use dispatch::{spawn_inbound_pump, PluginJobDispatcher};
pub use lifecycle::{ComponentHealth, HealthReport, LifecycleController};
pub use state::AppState;
