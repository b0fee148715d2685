// ABOUTME: The Message object — properties, body, flags, numbering, and the mutable-until-sent
// ABOUTME: lifecycle gate shared by every Message regardless of direction

use crate::connection::{self, Connection};
use crate::error::{BlipError, CallError};
use crate::frame::{FlagsExt, MessageType, COMPRESSED, NOREPLY, URGENT};
use crate::properties::{self, Properties};
use crate::transport::ReplyListener;
use bytes::Bytes;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, Weak};

/// Parsed `Error-Code`/`Error-Domain` properties of an ERR message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageError {
    pub code: i32,
    pub domain: Option<String>,
}

struct Inner {
    number: u32,
    connection_id: u64,
    connection: Weak<connection::Shared>,
    is_mine: bool,
    mutable: AtomicBool,
    flags: AtomicU8,
    properties: Mutex<Properties>,
    body: Mutex<Bytes>,
    reply_listener: Mutex<Option<Arc<dyn ReplyListener>>>,
    /// Guards against calling `new_response` twice on the same request.
    response_created: AtomicBool,
}

/// A logical BLIP message: a set of properties plus an opaque body.
///
/// Mutable only while [`is_mutable`](Message::is_mutable) is true; frozen
/// forever once handed to [`send`](Message::send). Cloning a `Message`
/// clones the handle, not the data — all clones observe the same underlying
/// state, matching a "shared, then frozen" lifecycle.
#[derive(Clone)]
pub struct Message(Arc<Inner>);

impl Message {
    pub(crate) fn new_outgoing(
        connection_id: u64,
        connection: Weak<connection::Shared>,
        number: u32,
        flags: u8,
        properties: Properties,
        body: Bytes,
    ) -> Self {
        Self(Arc::new(Inner {
            number,
            connection_id,
            connection,
            is_mine: true,
            mutable: AtomicBool::new(true),
            flags: AtomicU8::new(flags),
            properties: Mutex::new(properties),
            body: Mutex::new(body),
            reply_listener: Mutex::new(None),
            response_created: AtomicBool::new(false),
        }))
    }

    /// A placeholder reply, returned by `send()`, not yet populated. Its
    /// `isMutable` is false from birth: the caller's only legal action on it
    /// before completion is attaching a [`ReplyListener`].
    pub(crate) fn new_placeholder(connection_id: u64, connection: Weak<connection::Shared>, number: u32) -> Self {
        Self(Arc::new(Inner {
            number,
            connection_id,
            connection,
            is_mine: true,
            mutable: AtomicBool::new(false),
            flags: AtomicU8::new(0),
            properties: Mutex::new(Properties::new()),
            body: Mutex::new(Bytes::new()),
            reply_listener: Mutex::new(None),
            response_created: AtomicBool::new(false),
        }))
    }

    pub(crate) fn new_incoming(
        connection_id: u64,
        connection: Weak<connection::Shared>,
        number: u32,
        flags: u8,
        properties: Properties,
        body: Bytes,
    ) -> Self {
        Self(Arc::new(Inner {
            number,
            connection_id,
            connection,
            is_mine: false,
            mutable: AtomicBool::new(false),
            flags: AtomicU8::new(flags),
            properties: Mutex::new(properties),
            body: Mutex::new(body),
            reply_listener: Mutex::new(None),
            response_created: AtomicBool::new(false),
        }))
    }

    /// Populate a previously-returned placeholder once its reply frames have
    /// fully arrived. Used only by the connection's receive path.
    pub(crate) fn populate_placeholder(&self, flags: u8, properties: Properties, body: Bytes) {
        self.0.flags.store(flags, AtomicOrdering::Release);
        *self.0.properties.lock().unwrap() = properties;
        *self.0.body.lock().unwrap() = body;
    }

    pub(crate) fn take_reply_listener(&self) -> Option<Arc<dyn ReplyListener>> {
        self.0.reply_listener.lock().unwrap().take()
    }

    pub(crate) fn connection_id(&self) -> u64 {
        self.0.connection_id
    }

    pub fn number(&self) -> u32 {
        self.0.number
    }

    pub fn flags(&self) -> u8 {
        self.0.flags.load(AtomicOrdering::Acquire)
    }

    pub fn is_mine(&self) -> bool {
        self.0.is_mine
    }

    pub fn is_mutable(&self) -> bool {
        self.0.mutable.load(AtomicOrdering::Acquire)
    }

    pub fn is_urgent(&self) -> bool {
        self.flags().is_urgent()
    }

    pub fn is_no_reply(&self) -> bool {
        self.flags().is_no_reply()
    }

    pub fn is_compressed(&self) -> bool {
        self.flags().is_compressed()
    }

    pub fn message_type(&self) -> MessageType {
        MessageType::from_flags(self.flags())
            .expect("a Message's flags are validated at construction/decode time")
    }

    pub fn properties(&self) -> Properties {
        self.0.properties.lock().unwrap().clone()
    }

    pub fn get_property(&self, key: &str) -> Option<String> {
        self.0.properties.lock().unwrap().get(key).map(str::to_owned)
    }

    pub fn body(&self) -> Bytes {
        self.0.body.lock().unwrap().clone()
    }

    fn ensure_mutable(&self) -> Result<(), CallError> {
        if self.is_mutable() {
            Ok(())
        } else {
            Err(CallError::Immutable)
        }
    }

    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) -> Result<(), CallError> {
        self.ensure_mutable()?;
        let key = key.into();
        let value = value.into();
        if !properties::is_wire_safe(&key) || !properties::is_wire_safe(&value) {
            return Err(CallError::BadProperty);
        }
        self.0.properties.lock().unwrap().set(key, value);
        Ok(())
    }

    pub fn remove_property(&self, key: &str) -> Result<(), CallError> {
        self.ensure_mutable()?;
        self.0.properties.lock().unwrap().remove(key);
        Ok(())
    }

    pub fn clear_properties(&self) -> Result<(), CallError> {
        self.ensure_mutable()?;
        self.0.properties.lock().unwrap().clear();
        Ok(())
    }

    /// Overwrites this message's properties with every key/value in `other`.
    pub fn copy_properties(&self, other: &Properties) -> Result<(), CallError> {
        self.ensure_mutable()?;
        let mut props = self.0.properties.lock().unwrap();
        for (k, v) in other.iter() {
            props.set(k, v);
        }
        Ok(())
    }

    pub fn set_body(&self, body: Bytes) -> Result<(), CallError> {
        self.ensure_mutable()?;
        *self.0.body.lock().unwrap() = body;
        Ok(())
    }

    fn set_flag(&self, bit: u8, value: bool) -> Result<(), CallError> {
        self.ensure_mutable()?;
        self.0
            .flags
            .fetch_update(AtomicOrdering::AcqRel, AtomicOrdering::Acquire, |f| {
                Some(if value { f | bit } else { f & !bit })
            })
            .ok();
        Ok(())
    }

    pub fn set_urgent(&self, urgent: bool) -> Result<(), CallError> {
        self.set_flag(URGENT, urgent)
    }

    pub fn set_no_reply(&self, no_reply: bool) -> Result<(), CallError> {
        self.set_flag(NOREPLY, no_reply)
    }

    /// Marks the message for per-message gzip compression. Fails with
    /// [`CallError::CompressionUnsupported`] only if the implementation has
    /// been built without compression support; this one supports it.
    pub fn set_compressed(&self, compressed: bool) -> Result<(), CallError> {
        self.set_flag(COMPRESSED, compressed)
    }

    /// Attach a listener invoked once when this message's reply completes.
    /// Meaningful only on a placeholder returned by [`send`](Message::send).
    pub fn set_reply_listener(&self, listener: Arc<dyn ReplyListener>) {
        *self.0.reply_listener.lock().unwrap() = Some(listener);
    }

    /// Create a mutable RPY-type response to this incoming request.
    ///
    /// Fails with [`CallError::CannotReply`] if this message is not a
    /// request, is flagged NOREPLY, or a response has already been created.
    pub fn new_response(&self) -> Result<Message, CallError> {
        if self.is_mine || self.message_type() != MessageType::Msg || self.is_no_reply() {
            return Err(CallError::CannotReply);
        }
        if self
            .0
            .response_created
            .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_err()
        {
            return Err(CallError::CannotReply);
        }
        Ok(Message::new_outgoing(
            self.0.connection_id,
            self.0.connection.clone(),
            self.0.number,
            MessageType::Rpy as u8,
            Properties::new(),
            Bytes::new(),
        ))
    }

    /// Send this message on its owning connection. Returns the placeholder
    /// reply (see [`Connection::send_message`]), or `None` if none is
    /// expected.
    ///
    /// Fails with [`CallError::NotMine`] if this message was not created
    /// locally, or with `BlipError::ConnectionClosed` if the owning
    /// connection has already been dropped.
    pub fn send(&self) -> crate::Result<Option<Message>> {
        if !self.0.is_mine {
            return Err(CallError::NotMine.into());
        }
        let shared = self
            .0
            .connection
            .upgrade()
            .ok_or(BlipError::ConnectionClosed { cause: None })?;
        self.0.mutable.store(false, AtomicOrdering::Release);
        Connection::from_shared(shared).send_message(self.clone())
    }

    /// Valid only when [`message_type`](Message::message_type) is `Err`.
    /// Returns `None` for any other message type.
    pub fn to_error(&self) -> Option<Result<MessageError, BlipError>> {
        if self.message_type() != MessageType::Err {
            return None;
        }
        let code_str = self.get_property("Error-Code")?;
        Some(
            code_str
                .parse::<i32>()
                .map(|code| MessageError {
                    code,
                    domain: self.get_property("Error-Domain"),
                })
                .map_err(|_| BlipError::BadErrorCode(code_str)),
        )
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.0.connection_id == other.0.connection_id && self.0.number == other.0.number
    }
}

impl Eq for Message {}

impl Hash for Message {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.connection_id.hash(state);
        self.0.number.hash(state);
    }
}

impl PartialOrd for Message {
    /// `None` when the messages belong to different connections: ordering
    /// across connections is left undefined, resolved here as "incomparable"
    /// rather than "equal".
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.0.connection_id != other.0.connection_id {
            return None;
        }
        Some(self.0.number.cmp(&other.0.number))
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("number", &self.0.number)
            .field("connection_id", &self.0.connection_id)
            .field("flags", &self.flags())
            .field("is_mine", &self.0.is_mine)
            .field("is_mutable", &self.is_mutable())
            .finish()
    }
}
