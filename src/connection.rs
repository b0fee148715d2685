// ABOUTME: The per-connection multiplexer — urgency-aware outgoing scheduler, incoming
// ABOUTME: reassembly tables, reply binding, and the Open/Closing/Closed lifecycle

use crate::codec::{MessageDecoder, MessageEncoder};
use crate::error::{BlipError, CallError};
use crate::flow_control::{FlowControlConfig, ReceiveAccumulator, SendWindow};
use crate::frame::{self, MessageType};
use crate::message::Message;
use crate::properties::Properties;
use crate::transport::{ConnectionListener, Transport, TransportMessage, TransportReader, TransportWriter};
use crate::varint::{read_varint, write_varint};
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, instrument, warn};

/// The default bound on a single outgoing frame's payload.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

enum Command {
    Send(Message, Option<Message>),
    Close,
    Inbound(TransportMessage),
}

pub(crate) struct Shared {
    pub(crate) id: u64,
    next_number: AtomicU32,
    cmd_tx: mpsc::UnboundedSender<Command>,
    state: watch::Sender<ConnectionState>,
}

/// A non-owning, cloneable handle to one BLIP session over one transport.
///
/// Cheap to clone (an `Arc` underneath); the expensive state — reassembly
/// tables, the outgoing queue — lives only inside the worker task, never
/// behind this handle, so cloning never contends a lock.
#[derive(Clone)]
pub struct Connection(Arc<Shared>);

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.0.id)
            .field("state", &*self.0.state.borrow())
            .finish()
    }
}

fn next_connection_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

impl Connection {
    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self(shared)
    }

    /// Spawn the worker task that owns `transport` and drives this
    /// connection until it closes.
    pub fn open<T: Transport>(transport: T, listener: Arc<dyn ConnectionListener>) -> Connection {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Open);
        let shared = Arc::new(Shared {
            id: next_connection_id(),
            next_number: AtomicU32::new(1),
            cmd_tx: cmd_tx.clone(),
            state: state_tx,
        });

        let (reader, writer) = transport.split();
        tokio::spawn(reader_loop(reader, cmd_tx));
        tokio::spawn(run_worker(shared.clone(), writer, listener, cmd_rx));
        Connection(shared)
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.0.state.borrow()
    }

    /// Allocate a new, mutable outgoing request. Numbers are
    /// drawn from this connection's own monotonic counter; replies reuse
    /// their request's number instead of drawing a new one.
    pub fn new_request(&self) -> Message {
        let number = self.0.next_number.fetch_add(1, Ordering::Relaxed);
        Message::new_outgoing(
            self.0.id,
            Arc::downgrade(&self.0),
            number,
            MessageType::Msg as u8,
            Properties::new(),
            Bytes::new(),
        )
    }

    /// Enqueue `msg` for sending. Returns the placeholder reply (populated
    /// as RPY/ERR frames arrive), or `None` if `msg` is not a request or is
    /// flagged NOREPLY.
    pub fn send_message(&self, msg: Message) -> crate::Result<Option<Message>> {
        if msg.connection_id() != self.0.id {
            return Err(CallError::WrongOwner.into());
        }

        let placeholder = if msg.message_type() == MessageType::Msg && !msg.is_no_reply() {
            Some(Message::new_placeholder(self.0.id, Arc::downgrade(&self.0), msg.number()))
        } else {
            None
        };

        self.0
            .cmd_tx
            .send(Command::Send(msg, placeholder.clone()))
            .map_err(|_| BlipError::ConnectionClosed { cause: None })?;

        Ok(placeholder)
    }

    /// Request a graceful close. The worker drains any in-flight frames,
    /// then completes all pending replies with an ERR message.
    pub fn close(&self) {
        let _ = self.0.cmd_tx.send(Command::Close);
    }
}

async fn reader_loop<R: TransportReader>(mut reader: R, cmd_tx: mpsc::UnboundedSender<Command>) {
    loop {
        match reader.recv().await {
            Ok(Some(msg)) => {
                if cmd_tx.send(Command::Inbound(msg)).is_err() {
                    return;
                }
            }
            Ok(None) => {
                let _ = cmd_tx.send(Command::Close);
                return;
            }
            Err(_) => {
                let _ = cmd_tx.send(Command::Close);
                return;
            }
        }
    }
}

struct OutgoingSlot {
    message: Message,
    encoder: MessageEncoder,
    send_window: SendWindow,
}

#[derive(Default)]
struct ReassemblyTables {
    in_requests: HashMap<u32, MessageDecoder>,
    completed_requests: HashSet<u32>,
    request_receive_accumulators: HashMap<u32, ReceiveAccumulator>,
    in_reply_decoders: HashMap<u32, MessageDecoder>,
    pending_replies: HashMap<u32, Message>,
    reply_receive_accumulators: HashMap<u32, ReceiveAccumulator>,
}

struct Worker<W: TransportWriter> {
    shared: Arc<Shared>,
    writer: W,
    listener: Arc<dyn ConnectionListener>,
    out_queue: Vec<OutgoingSlot>,
    tables: ReassemblyTables,
    pass_order: VecDeque<usize>,
}

#[instrument(skip_all, fields(connection_id = shared.id))]
async fn run_worker<W: TransportWriter>(
    shared: Arc<Shared>,
    writer: W,
    listener: Arc<dyn ConnectionListener>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut worker = Worker {
        shared,
        writer,
        listener,
        out_queue: Vec::new(),
        tables: ReassemblyTables::default(),
        pass_order: VecDeque::new(),
    };

    let mut closing = false;
    let mut fatal_cause: Option<BlipError> = None;

    'outer: loop {
        if closing && worker.out_queue.is_empty() {
            break;
        }

        // Drain every command already queued before deciding what to send.
        // A caller that enqueues several messages back-to-back (e.g. a
        // non-urgent message followed immediately by an urgent one) needs
        // all of them visible in out_queue before a pass is built from it —
        // otherwise the first-enqueued message gets a one-frame head start
        // on the very first pass, and an urgent message added right after it
        // fails to preempt that frame.
        loop {
            match cmd_rx.try_recv() {
                Ok(cmd) => {
                    if let Err(e) = worker.handle_command(cmd, &mut closing).await {
                        fatal_cause = Some(e);
                        closing = true;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    closing = true;
                    break;
                }
            }
        }

        if closing && worker.out_queue.is_empty() {
            break;
        }

        if worker.out_queue.is_empty() {
            worker.pass_order.clear();
            match cmd_rx.recv().await {
                Some(cmd) => {
                    if let Err(e) = worker.handle_command(cmd, &mut closing).await {
                        fatal_cause = Some(e);
                        closing = true;
                    }
                }
                None => break 'outer,
            }
            continue;
        }

        if worker.pass_order.is_empty() {
            worker.pass_order = build_pass_order(&worker.out_queue);
            if worker.pass_order.is_empty() {
                worker.out_queue.retain(|slot| !slot.encoder.is_finished());
                continue;
            }
        }

        match worker.send_next_pass_frame().await {
            Ok(true) => {}
            Ok(false) => {
                // Every slot left in this pass is blocked on its send
                // window; nothing can be sent until an inbound ACK reopens
                // one or a new message is enqueued. Block on the command
                // channel instead of re-spinning — a peer that never emits
                // ACKMSG/ACKRPY (permitted by design) must not pin the CPU
                // or starve the reader task that would deliver one.
                match cmd_rx.recv().await {
                    Some(cmd) => {
                        if let Err(e) = worker.handle_command(cmd, &mut closing).await {
                            fatal_cause = Some(e);
                            closing = true;
                        }
                    }
                    None => break 'outer,
                }
            }
            Err(e) => {
                fatal_cause = Some(e);
                closing = true;
            }
        }
    }

    worker.shutdown(fatal_cause).await;
}

fn remaining_len(cursor: &Cursor<&[u8]>) -> u32 {
    (cursor.get_ref().len() as u64 - cursor.position()) as u32
}

impl<W: TransportWriter> Worker<W> {
    async fn handle_command(&mut self, cmd: Command, closing: &mut bool) -> Result<(), BlipError> {
        match cmd {
            Command::Send(message, placeholder) => {
                let flags = message.flags();
                let encoder = MessageEncoder::new(message.number(), flags, &message.properties(), message.body())?;
                if let Some(placeholder) = placeholder {
                    self.tables.pending_replies.insert(message.number(), placeholder);
                }
                self.out_queue.push(OutgoingSlot {
                    message,
                    encoder,
                    send_window: SendWindow::new(FlowControlConfig::default()),
                });
                Ok(())
            }
            Command::Close => {
                *closing = true;
                Ok(())
            }
            Command::Inbound(TransportMessage::Text(_)) => Err(BlipError::TextMessageReceived),
            Command::Inbound(TransportMessage::Binary(bytes)) => self.handle_inbound_frame(bytes).await,
        }
    }

    async fn handle_inbound_frame(&mut self, bytes: Bytes) -> Result<(), BlipError> {
        if bytes.is_empty() {
            return Err(BlipError::EmptyFrame);
        }
        let mut cursor = Cursor::new(bytes.as_ref());
        let (number, flags) = frame::read_frame_prefix(&mut cursor)?;
        let message_type = MessageType::from_flags(flags)?;

        match message_type {
            MessageType::Msg => self.handle_incoming_request_frame(number, flags, &mut cursor).await,
            MessageType::Rpy | MessageType::Err => self.handle_incoming_reply_frame(number, flags, &mut cursor).await,
            MessageType::AckMsg | MessageType::AckRpy => self.handle_ack_frame(number, &mut cursor),
        }
    }

    async fn handle_incoming_request_frame(
        &mut self,
        number: u32,
        flags: u8,
        cursor: &mut Cursor<&[u8]>,
    ) -> Result<(), BlipError> {
        let received = remaining_len(cursor);

        if let Some(decoder) = self.tables.in_requests.get_mut(&number) {
            decoder.read_next_frame(flags, cursor)?;
        } else {
            if self.tables.completed_requests.contains(&number) {
                return Err(BlipError::DuplicateMessageNumber(number));
            }
            let mut decoder = MessageDecoder::new();
            decoder.read_first_frame(flags, cursor)?;
            self.tables.in_requests.insert(number, decoder);
        }

        if let Some(ack) = self
            .tables
            .request_receive_accumulators
            .entry(number)
            .or_insert_with(|| ReceiveAccumulator::new(FlowControlConfig::default()))
            .on_received(received)
        {
            self.send_ack(number, MessageType::AckMsg, ack).await?;
        }

        let decoder = self.tables.in_requests.get(&number).expect("just inserted or present");
        if decoder.is_complete() {
            let decoder = self.tables.in_requests.remove(&number).expect("checked complete above");
            self.tables.completed_requests.insert(number);
            self.tables.request_receive_accumulators.remove(&number);
            let decoder_flags = decoder.flags();
            let (properties, body) = decoder.finish()?;
            let msg = Message::new_incoming(self.shared.id, Arc::downgrade(&self.shared), number, decoder_flags, properties, body);
            self.listener.on_request(&Connection::from_shared(self.shared.clone()), msg);
        }
        Ok(())
    }

    async fn handle_incoming_reply_frame(
        &mut self,
        number: u32,
        flags: u8,
        cursor: &mut Cursor<&[u8]>,
    ) -> Result<(), BlipError> {
        let Some(placeholder) = self.tables.pending_replies.get(&number).cloned() else {
            debug!(number, "dropping reply for unknown or already-resolved request");
            return Ok(());
        };

        let received = remaining_len(cursor);
        let already_started = self.tables.in_reply_decoders.contains_key(&number);
        let decoder = self.tables.in_reply_decoders.entry(number).or_insert_with(MessageDecoder::new);
        if already_started {
            decoder.read_next_frame(flags, cursor)?;
        } else {
            decoder.read_first_frame(flags, cursor)?;
        }

        if let Some(ack) = self
            .tables
            .reply_receive_accumulators
            .entry(number)
            .or_insert_with(|| ReceiveAccumulator::new(FlowControlConfig::default()))
            .on_received(received)
        {
            self.send_ack(number, MessageType::AckRpy, ack).await?;
        }

        let decoder = self.tables.in_reply_decoders.get(&number).expect("just inserted or present");
        if decoder.is_complete() {
            let decoder = self.tables.in_reply_decoders.remove(&number).expect("checked complete above");
            self.tables.pending_replies.remove(&number);
            self.tables.reply_receive_accumulators.remove(&number);
            let decoder_flags = decoder.flags();
            let (properties, body) = decoder.finish()?;
            placeholder.populate_placeholder(decoder_flags, properties, body);

            let conn = Connection::from_shared(self.shared.clone());
            if let Some(reply_listener) = placeholder.take_reply_listener() {
                reply_listener.on_completed(placeholder.clone());
            }
            if placeholder.message_type() == MessageType::Err {
                self.listener.on_error(&conn, placeholder);
            } else {
                self.listener.on_response(&conn, placeholder);
            }
        }
        let _ = flags;
        Ok(())
    }

    fn handle_ack_frame(&mut self, number: u32, cursor: &mut Cursor<&[u8]>) -> Result<(), BlipError> {
        let acked = read_varint(cursor)?;
        if let Some(slot) = self.out_queue.iter_mut().find(|slot| slot.message.number() == number) {
            slot.send_window.on_acked(acked);
        }
        Ok(())
    }

    async fn send_ack(&mut self, number: u32, ack_type: MessageType, byte_count: u32) -> Result<(), BlipError> {
        let mut buf = BytesMut::new();
        frame::write_frame_prefix(&mut buf, number, ack_type as u8);
        write_varint(&mut buf, byte_count);
        self.writer.send(buf.freeze()).await.map_err(BlipError::TransportError)
    }

    /// Sends the next frame in the current pass. Returns `Ok(true)` once a
    /// frame has actually been written to the transport, or `Ok(false)` if
    /// the rest of the pass was drained without finding one ready to send —
    /// every remaining slot is either finished or window-blocked. Callers
    /// must treat `Ok(false)` as a suspension point (block on the command
    /// channel) rather than re-polling: nothing changes until an inbound ACK
    /// or a new enqueue arrives.
    async fn send_next_pass_frame(&mut self) -> Result<bool, BlipError> {
        while let Some(idx) = self.pass_order.pop_front() {
            let Some(slot) = self.out_queue.get_mut(idx) else { continue };
            if slot.encoder.is_finished() {
                continue;
            }
            let available = slot.send_window.available();
            if available == 0 {
                // Window exhausted; retried on the next scheduling pass once
                // an ACKMSG/ACKRPY opens it back up.
                continue;
            }
            let max_len = (DEFAULT_MAX_FRAME_SIZE as u32).min(available) as usize;
            match slot.encoder.next_frame(max_len) {
                Some(frame) => {
                    let len = frame.len() as u32;
                    self.writer.send(frame).await.map_err(BlipError::TransportError)?;
                    slot.send_window.on_sent(len);
                    return Ok(true);
                }
                None => continue,
            }
        }
        self.out_queue.retain(|slot| !slot.encoder.is_finished());
        Ok(false)
    }

    async fn shutdown(&mut self, cause: Option<BlipError>) {
        let _ = self.shared.state.send(ConnectionState::Closing);
        if let Some(ref cause) = cause {
            warn!(error = %cause, "connection closing after fatal error");
        }

        let mut closed_properties = Properties::new();
        closed_properties.set("Error-Domain", "BLIP");
        closed_properties.set("Error-Code", "1");
        for (_, placeholder) in self.tables.pending_replies.drain() {
            placeholder.populate_placeholder(MessageType::Err as u8, closed_properties.clone(), Bytes::new());
            if let Some(listener) = placeholder.take_reply_listener() {
                listener.on_completed(placeholder.clone());
            }
        }
        self.tables.in_requests.clear();
        self.tables.in_reply_decoders.clear();
        self.writer.close().await;
        let _ = self.shared.state.send(ConnectionState::Closed);
    }
}

/// Build one scheduler pass: urgent messages first, then non-urgent, each in
/// insertion order. Finished slots are skipped.
fn build_pass_order(queue: &[OutgoingSlot]) -> VecDeque<usize> {
    let mut urgent = Vec::new();
    let mut normal = Vec::new();
    for (idx, slot) in queue.iter().enumerate() {
        if slot.encoder.is_finished() {
            continue;
        }
        if slot.message.is_urgent() {
            urgent.push(idx);
        } else {
            normal.push(idx);
        }
    }
    urgent.into_iter().chain(normal).collect()
}
