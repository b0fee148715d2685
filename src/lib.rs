//! BLIP: a bidirectional, multiplexed request/response messaging protocol
//! layered over a reliable binary message transport.
//!
//! This crate implements the core framing codec and per-connection
//! multiplexer — encoding and decoding the wire format,
//! and scheduling an unbounded set of in-flight messages fairly over one
//! transport. The transport itself (WebSocket handshake, TLS, accept loop)
//! is out of scope; callers provide one by implementing [`transport::Transport`].
//!
//! ```rust,no_run
//! use blip_core::builder::ConnectionBuilder;
//! use blip_core::connection::Connection;
//! use blip_core::message::Message;
//! use blip_core::transport::ConnectionListener;
//! use std::sync::Arc;
//!
//! struct EchoListener;
//! impl ConnectionListener for EchoListener {
//!     fn on_request(&self, _conn: &Connection, msg: Message) {
//!         if let Ok(reply) = msg.new_response() {
//!             let _ = reply.send();
//!         }
//!     }
//!     fn on_response(&self, _conn: &Connection, _msg: Message) {}
//!     fn on_error(&self, _conn: &Connection, _msg: Message) {}
//! }
//!
//! # async fn doc<T: blip_core::transport::Transport>(transport: T) {
//! let conn = ConnectionBuilder::client(transport, Arc::new(EchoListener));
//! let request = conn.new_request();
//! request.set_property("Profile", "echo").unwrap();
//! let _pending_reply = request.send();
//! # }
//! ```

pub mod builder;
pub mod codec;
pub mod connection;
pub mod dictionary;
pub mod error;
pub mod flow_control;
pub mod frame;
pub mod message;
pub mod properties;
pub mod transport;
pub mod varint;

#[cfg(test)]
mod tests;

pub use error::{BlipError, CallError};
pub use message::{Message, MessageError};

/// Boxed-error convenience alias for application/doc-example code that
/// doesn't need to match on a specific variant. Internal code always uses
/// the concrete [`BlipError`]/[`CallError`] enums instead.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for top-level BLIP operations.
pub type Result<T> = std::result::Result<T, Error>;
