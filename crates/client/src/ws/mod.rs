//! WebSocket connection to the chat server.
//!
//! - [`connection`]: connection state, backoff configuration and the command handle
//! - [`controller`]: the reconnect state machine
//! - [`native`]: the tokio-tungstenite driver that runs it

pub mod connection;
pub mod controller;
pub mod native;

pub use connection::{CommandSink, ConnectionState, ReconnectConfig, WsHandle};
pub use controller::ReconnectController;
pub use native::{ConnectionEvent, UrlBuilder, WsConnection};
