//! Work dispatch
//!
//! - Work board with per-item reservations
//! - Dispatcher trait and the HTTP implementation
//! - Bounded dispatch worker pool

pub mod board;
pub mod client;
pub mod pool;

pub use board::{Reservation, WorkBoard};
pub use client::{DispatchOutcome, Dispatcher, HttpDispatcher, TARGET_PLACEHOLDER};
pub use pool::{DispatchConfig, DispatchPool, DispatchStep};
