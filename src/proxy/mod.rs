//! Proxy lifecycle
//!
//! This module provides:
//! - The registry owning every proxy's state and cooldown
//! - Candidate feeds and the source that merges them
//! - Probes and the validation pool
//! - Tunnels and HTTP clients routed through a proxy

pub mod probe;
pub mod registry;
pub mod source;
pub mod transport;
pub mod validation;

pub use probe::{HttpProbe, Probe, ProbeMode, ProbeOutcome, TunnelProbe};
pub use registry::{ProxyLease, ProxyRegistry, RegistryConfig};
pub use source::{ArchiveFeed, FetchReport, FileFeed, ProxyFeed, ProxySource, StaticFeed, UrlFeed};
pub use transport::ProxyTransport;
pub use validation::{ValidationConfig, ValidationPool, ValidationStats};
