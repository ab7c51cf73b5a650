//! Core configuration and utilities for tokensync.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{
    Config, DEFAULT_AUTHORITY_HOST, DEFAULT_CLIENT_ID, DEFAULT_INTERACTIVE_TIMEOUT_SECS,
    DEFAULT_LOG_LEVEL, DEFAULT_TENANT,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, LogFormat};
pub use paths::Paths;
