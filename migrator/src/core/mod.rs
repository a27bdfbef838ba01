//! Core application infrastructure

pub mod cli;
pub mod config;
pub mod constants;
pub mod exit;
pub mod shutdown;

pub use crate::app::CoreApp;
pub use cli::{CliConfig, Commands};
pub use config::{ConfigError, ConnectionConfig, ConnectionSide, ProtectionConfig};
pub use exit::ExitStatus;
pub use shutdown::ShutdownService;
