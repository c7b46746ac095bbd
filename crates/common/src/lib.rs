//! Common types and utilities for the webhook tunnel system
//!
//! This crate provides the wire protocol, error taxonomy and shared helpers
//! used by both the tunnel server (public ingress) and the agent CLI that
//! replays forwarded requests against a local HTTP service.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod utils;

// Re-export commonly used types for convenience
pub use error::{Result, TunnelError};
pub use protocol::{ClientMessage, ServerMessage};
pub use utils::{
    current_timestamp_millis, current_timestamp_secs, decode_body, encode_body,
    generate_endpoint_name, generate_request_id, headers_to_map, map_to_headers,
};
