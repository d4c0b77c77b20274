//! proxy-boost - proxy lifecycle and dispatch pipeline
//!
//! Fetches public proxies, validates them and dispatches repeated requests to
//! a set of targets through them.
//!
//! ## Features
//!
//! - HTTP, HTTPS, SOCKS4 and SOCKS5 proxy support
//! - Per-proxy reuse cooldown and failure-based retirement
//! - Bounded validation and dispatch worker pools
//! - Text list, local file and dated archive proxy feeds
//! - Two-stage shutdown (graceful drain, then hard abort)

pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod progress;
pub mod proxy;
pub mod shutdown;

pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorConfig, RunReport};
pub use error::{BoostError, Result};
