//! Reverse tunnel: a single authenticated outbound WebSocket from the server
//! to the public gateway, carrying many logical streams via yamux.

pub mod client;
pub mod wsconn;

pub use client::TunnelClient;
pub use wsconn::WsConn;

/// Pre-shared secret header authenticating the tunnel endpoint.
pub const GATEWAY_SECRET_HEADER: &str = "X-Gateway-Secret";
