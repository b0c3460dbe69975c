//! WebSocket Relay
//!
//! This module contains the real-time relay between a browser client and its
//! upstream live session. It is structured into submodules:
//!
//! - `protocol`: Defines the JSON-based message format for client-server communication.
//! - `client`: The outbound half of a client connection, shared by both pumps.
//! - `relay`: The inbound and outbound pumps and the duplex relay that runs them.
//! - `session`: Manages the WebSocket connection lifecycle, from handshake to teardown.

pub mod client;
pub mod protocol;
pub mod relay;
pub mod session;
#[cfg(test)]
pub(crate) mod testing;

pub use session::ws_handler;
