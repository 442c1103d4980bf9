//! Rust client for the nvent flow runtime.
//!
//! `NventClient` drives the HTTP API (start, list, cancel, restart,
//! triggers, webhook awaits); `FlowSocket` follows one run's event feed
//! over WebSocket with automatic reconnect.

pub mod client;
pub mod config;
pub mod error;
pub mod socket;

pub use client::NventClient;
pub use config::{ClientConfig, ReconnectConfig, RetryConfig};
pub use error::{NventError, NventResult};
pub use socket::{FlowSocket, SocketEvent};
