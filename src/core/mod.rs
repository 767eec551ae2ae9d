/*!
 * Core Module
 * Shared types, errors, limits and configuration
 */

pub mod config;
pub mod errors;
pub mod limits;
pub mod types;

pub use config::{ConfigError, GpuConfig, KernelConfig, ShutdownMode};
pub use errors::{ErrorKind, KernelError, ResultCode};
pub use types::*;
