// ABOUTME: The boundary the multiplexer is built against — the binary-transport contract it
// ABOUTME: consumes, and the listener contract it exposes to applications

use crate::message::Message;
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::sync::Arc;

/// One inbound unit delivered by the transport.
///
/// BLIP requires reliable, ordered binary delivery; a text frame is a fatal
/// protocol error, which is why it is represented rather than silently
/// dropped.
#[derive(Debug)]
pub enum TransportMessage {
    Binary(Bytes),
    Text(String),
}

/// The write half of a transport: the only thing the connection's worker
/// ever touches directly, so its send side is never shared across tasks.
pub trait TransportWriter: Send + 'static {
    fn send(&mut self, frame: Bytes) -> impl Future<Output = io::Result<()>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// The read half of a transport, driven by its own task so a large in-flight
/// write can never stall delivery of inbound frames.
pub trait TransportReader: Send + 'static {
    /// Resolves to `Ok(None)` on a clean transport close.
    fn recv(&mut self) -> impl Future<Output = io::Result<Option<TransportMessage>>> + Send;
}

/// The WebSocket-binary-frame contract the core relies on. TLS, the
/// handshake, and WS-layer fragmentation are all out of scope; an
/// implementation need only offer reliable ordered binary delivery, split
/// into independent read/write halves the way a WebSocket library splits a
/// socket into its reader and writer.
///
/// Native `impl Future` return types and associated types, not boxed `dyn`
/// traits: `Connection::open` stays generic over the transport, so a caller
/// pays no allocation or dynamic dispatch cost to plug in their own socket
/// type.
pub trait Transport: Send + 'static {
    type Reader: TransportReader;
    type Writer: TransportWriter;

    fn split(self) -> (Self::Reader, Self::Writer);
}

/// Invoked on message completion.
pub trait ConnectionListener: Send + Sync {
    /// A complete incoming request (type MSG).
    fn on_request(&self, conn: &crate::connection::Connection, msg: Message);

    /// A complete incoming reply (type RPY) whose request carried no
    /// explicit [`ReplyListener`].
    fn on_response(&self, conn: &crate::connection::Connection, msg: Message);

    /// A complete incoming error reply (type ERR).
    fn on_error(&self, conn: &crate::connection::Connection, msg: Message);
}

/// Attached to a single outgoing request; fires once when that request's
/// reply completes, ahead of the connection listener's `on_response`/
/// `on_error`.
pub trait ReplyListener: Send + Sync {
    fn on_completed(&self, msg: Message);
}

/// For accepting-side applications: notified as connections come and go.
pub trait ServerListener: Send + Sync {
    fn connection_opened(&self, conn: &crate::connection::Connection);
    fn connection_closed(&self, conn: &crate::connection::Connection);
}

/// A [`ReplyListener`] built from a closure, for callers who don't want to
/// name a type.
pub struct FnReplyListener<F: Fn(Message) + Send + Sync>(F);

impl<F: Fn(Message) + Send + Sync> FnReplyListener<F> {
    pub fn new(f: F) -> Arc<Self> {
        Arc::new(Self(f))
    }
}

impl<F: Fn(Message) + Send + Sync> ReplyListener for FnReplyListener<F> {
    fn on_completed(&self, msg: Message) {
        (self.0)(msg)
    }
}
