//! Non-blocking network plumbing for connectors: a threaded resolve/connect
//! socket with an optional rustls layer, the WebSocket client codec and the
//! HTTP/1.1 message helpers.

pub mod http;
pub mod socket;
pub mod tls;
pub mod websocket;

pub use socket::{Socket, SocketError, SocketState, TlsMode};
pub use tls::{TlsError, TlsSession};
