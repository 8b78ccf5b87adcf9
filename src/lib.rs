//! dept-call - Department call signaling and WebRTC session coordination
//!
//! Headless core of a hospital "department call" feature:
//! - WebSocket signaling with registration and bounded reconnect
//! - Presence registry grouped by department
//! - One-call-at-a-time session state machine
//! - WebRTC audio peer connections negotiated over the signaling channel

pub mod call;
pub mod client;
pub mod config;
pub mod presence;
pub mod signaling;

pub use call::{CallError, CallEvent, CallState, EndReason};
pub use client::{CallClient, ClientError, ClientEvent};
pub use config::{ClientConfig, Identity, ReconnectPolicy};
pub use presence::{PresenceRegistry, PresenceSnapshot};

/// Default log filter when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "dept_call=debug,webrtc=warn";

/// Installs the global `tracing` subscriber
///
/// Honours `RUST_LOG`; otherwise logs this crate at debug and WebRTC at warn.
/// Calling it twice is harmless.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
