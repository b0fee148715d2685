//! Cross-cutting integration tests: the round-trip laws and concrete
//! end-to-end scenarios, exercised against a real [`crate::connection::Connection`]
//! driven over an in-memory duplex transport rather than unit-testing a
//! single module in isolation.

use crate::builder::ConnectionBuilder;
use crate::codec::MessageEncoder;
use crate::connection::{Connection, ConnectionState};
use crate::frame::{self, MessageType, NOREPLY};
use crate::message::Message;
use crate::properties::Properties;
use crate::transport::{ConnectionListener, ReplyListener, Transport, TransportMessage, TransportReader, TransportWriter};
use bytes::Bytes;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

/// A transport over an in-memory duplex byte stream. Frames are delimited
/// with a 4-byte big-endian length prefix — the one fact the core relies on
/// the real WebSocket layer for is reliable ordered delivery of binary
/// messages, and this is the simplest framing that provides it.
struct DuplexTransport(DuplexStream);

struct DuplexReader(ReadHalf<DuplexStream>);
struct DuplexWriter(WriteHalf<DuplexStream>);

impl TransportReader for DuplexReader {
    async fn recv(&mut self) -> io::Result<Option<TransportMessage>> {
        let mut len_buf = [0u8; 4];
        match self.0.read_exact(&mut len_buf).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        self.0.read_exact(&mut payload).await?;
        Ok(Some(TransportMessage::Binary(Bytes::from(payload))))
    }
}

impl TransportWriter for DuplexWriter {
    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        self.0.write_all(&(frame.len() as u32).to_be_bytes()).await?;
        self.0.write_all(&frame).await?;
        self.0.flush().await
    }
    async fn close(&mut self) {
        let _ = self.0.shutdown().await;
    }
}

impl Transport for DuplexTransport {
    type Reader = DuplexReader;
    type Writer = DuplexWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (r, w) = tokio::io::split(self.0);
        (DuplexReader(r), DuplexWriter(w))
    }
}

/// The bare half of the duplex the test itself drives, standing in for "the
/// peer" without going through another `Connection` — lets a test assert on
/// exactly the bytes that crossed the wire.
struct PeerHalf(DuplexStream);

impl PeerHalf {
    async fn send_frame(&mut self, frame: Bytes) {
        self.0.write_all(&(frame.len() as u32).to_be_bytes()).await.unwrap();
        self.0.write_all(&frame).await.unwrap();
        self.0.flush().await.unwrap();
    }

    async fn recv_frame(&mut self) -> Option<Bytes> {
        let mut len_buf = [0u8; 4];
        if self.0.read_exact(&mut len_buf).await.is_err() {
            return None;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        self.0.read_exact(&mut payload).await.unwrap();
        Some(Bytes::from(payload))
    }
}

fn connected_pair() -> (DuplexTransport, PeerHalf) {
    let (a, b) = tokio::io::duplex(1024 * 1024);
    (DuplexTransport(a), PeerHalf(b))
}

#[derive(Default)]
struct RecordingListener {
    requests: Mutex<Vec<Message>>,
    responses: Mutex<Vec<Message>>,
    errors: Mutex<Vec<Message>>,
}

impl ConnectionListener for RecordingListener {
    fn on_request(&self, _conn: &Connection, msg: Message) {
        self.requests.lock().unwrap().push(msg);
    }
    fn on_response(&self, _conn: &Connection, msg: Message) {
        self.responses.lock().unwrap().push(msg);
    }
    fn on_error(&self, _conn: &Connection, msg: Message) {
        self.errors.lock().unwrap().push(msg);
    }
}

struct ChannelReplyListener(mpsc::UnboundedSender<Message>);
impl ReplyListener for ChannelReplyListener {
    fn on_completed(&self, msg: Message) {
        let _ = self.0.send(msg);
    }
}

async fn wait_until<F: Fn() -> bool>(f: F) {
    for _ in 0..200 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}

/// The reply listener attached to the placeholder fires before
/// the connection listener's `on_response`, and the placeholder carries the
/// assembled reply content.
#[tokio::test]
async fn reply_listener_fires_before_connection_listener_on_response() {
    let (transport, mut peer) = connected_pair();
    let listener = Arc::new(RecordingListener::default());
    let conn = ConnectionBuilder::client(transport, listener.clone());

    let request = conn.new_request();
    request.set_property("Profile", "echo").unwrap();
    let placeholder = request.send().unwrap().expect("a non-NOREPLY request yields a placeholder");

    let (tx, mut rx) = mpsc::unbounded_channel();
    placeholder.set_reply_listener(Arc::new(ChannelReplyListener(tx)));

    // Act as the peer: read the request frame off the wire, then answer it.
    let req_frame = peer.recv_frame().await.expect("request frame");
    let mut cursor = std::io::Cursor::new(req_frame.as_ref());
    let (number, _flags) = frame::read_frame_prefix(&mut cursor).unwrap();
    assert_eq!(number, 1);

    let mut reply_props = Properties::new();
    reply_props.set("Content-Type", "application/json");
    let mut encoder = MessageEncoder::new(number, MessageType::Rpy as u8, &reply_props, Bytes::from_static(b"{}")).unwrap();
    let reply_frame = encoder.next_frame(0x8000).unwrap();
    peer.send_frame(reply_frame).await;

    let completed = rx.recv().await.expect("reply listener should fire");
    assert_eq!(completed.get_property("Content-Type"), Some("application/json".to_string()));
    assert_eq!(completed.body(), Bytes::from_static(b"{}"));

    wait_until(|| !listener.responses.lock().unwrap().is_empty()).await;
    assert_eq!(listener.responses.lock().unwrap().len(), 1);
}

/// A NOREPLY request yields no placeholder, and the peer's unsolicited RPY
/// for that number is simply dropped, never reaching the connection listener.
#[tokio::test]
async fn noreply_request_yields_no_placeholder() {
    let (transport, _peer) = connected_pair();
    let listener = Arc::new(RecordingListener::default());
    let conn = ConnectionBuilder::client(transport, listener);

    let request = conn.new_request();
    request.set_no_reply(true).unwrap();
    let placeholder = request.send().unwrap();
    assert!(placeholder.is_none());
}

/// Frames from two concurrent inbound messages arriving
/// interleaved as A1, B1, A2, A3 are reassembled independently; B completes
/// after B1, A only after A3, each exactly once.
#[tokio::test]
async fn interleaved_inbound_frames_reassemble_independently() {
    let (transport, mut peer) = connected_pair();
    let listener = Arc::new(RecordingListener::default());
    let _conn = ConnectionBuilder::client(transport, listener.clone());

    let mut props_a = Properties::new();
    props_a.set("Profile", "bulk");
    let body_a = Bytes::from(vec![0xAAu8; 20]);
    let mut encoder_a = MessageEncoder::new(10, MessageType::Msg as u8, &props_a, body_a.clone()).unwrap();

    let mut props_b = Properties::new();
    props_b.set("Profile", "small");
    let body_b = Bytes::from_static(b"hi");
    let mut encoder_b = MessageEncoder::new(11, MessageType::Msg as u8, &props_b, body_b.clone()).unwrap();

    let a1 = encoder_a.next_frame(8).unwrap();
    let b1 = encoder_b.next_frame(0x8000).unwrap();
    let a2 = encoder_a.next_frame(8).unwrap();
    let a3 = encoder_a.next_frame(8).unwrap();
    assert!(encoder_a.next_frame(8).is_none());
    assert!(encoder_b.next_frame(0x8000).is_none());

    peer.send_frame(a1).await;
    peer.send_frame(b1).await;
    peer.send_frame(a2).await;
    peer.send_frame(a3).await;

    wait_until(|| listener.requests.lock().unwrap().len() == 2).await;

    let requests = listener.requests.lock().unwrap();
    // B completes (and is dispatched) strictly before A, since it finishes
    // on its first frame while A needs all three.
    assert_eq!(requests[0].number(), 11);
    assert_eq!(requests[0].body(), body_b);
    assert_eq!(requests[1].number(), 10);
    assert_eq!(requests[1].body(), body_a);
}

/// A malformed varint is a fatal decode error. The connection
/// closes and any pending reply completes with `ConnectionClosed`.
#[tokio::test]
async fn malformed_varint_closes_the_connection_and_fails_pending_replies() {
    let (transport, mut peer) = connected_pair();
    let listener = Arc::new(RecordingListener::default());
    let conn = ConnectionBuilder::client(transport, listener);

    let request = conn.new_request();
    let placeholder = request.send().unwrap().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    placeholder.set_reply_listener(Arc::new(ChannelReplyListener(tx)));

    // Drain the request frame so the peer's next write is read as a fresh
    // inbound frame rather than appended to it.
    let _ = peer.recv_frame().await;

    peer.send_frame(Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF])).await;

    let completed = rx.recv().await.expect("pending reply completes on fatal close");
    assert_eq!(completed.message_type(), MessageType::Err);
    assert_eq!(completed.get_property("Error-Domain"), Some("BLIP".to_string()));

    wait_until(|| conn.state() == ConnectionState::Closed).await;
}

/// A request message built with `setNoReply` round-trips its flag over the
/// wire so the receiving side can see NOREPLY was set (even though no
/// placeholder reply exists on the sender).
#[tokio::test]
async fn no_reply_flag_is_visible_to_the_receiving_side() {
    let (transport, mut peer) = connected_pair();
    let listener = Arc::new(RecordingListener::default());
    let conn = ConnectionBuilder::client(transport, listener);

    let request = conn.new_request();
    request.set_no_reply(true).unwrap();
    request.send().unwrap();

    let frame = peer.recv_frame().await.unwrap();
    let mut cursor = std::io::Cursor::new(frame.as_ref());
    let (_, flags) = frame::read_frame_prefix(&mut cursor).unwrap();
    assert_ne!(flags & NOREPLY, 0);
}

/// Each dictionary-eligible property name/value is encoded as exactly two
/// bytes on the wire, end to end through a real request.
#[tokio::test]
async fn dictionary_properties_are_two_bytes_on_the_wire() {
    let (transport, mut peer) = connected_pair();
    let listener = Arc::new(RecordingListener::default());
    let conn = ConnectionBuilder::client(transport, listener);

    let request = conn.new_request();
    request.set_property("Profile", "application/json").unwrap();
    request.send().unwrap();

    let frame = peer.recv_frame().await.unwrap();
    let mut cursor = std::io::Cursor::new(frame.as_ref());
    let (_, _flags) = frame::read_frame_prefix(&mut cursor).unwrap();
    let _ = crate::varint::read_varint(&mut cursor).unwrap(); // propertiesLength
    let rest = &frame[cursor.position() as usize..];
    // "Profile" -> index 1, "application/json" -> index 5, each 2 bytes.
    assert_eq!(rest, &[0x01, 0x00, 0x05, 0x00]);
}
