// ABOUTME: BLIP frame header parsing and writing — messageNumber, flags, and message type bits
// ABOUTME: One transport binary message IS one BLIP frame

use crate::error::BlipError;
use crate::varint::{read_varint, write_varint};
use bytes::BytesMut;
use num_enum::TryFromPrimitive;
use std::io::Cursor;

/// Set on every frame but the last of a message; more frames will follow.
pub const MORECOMING: u8 = 0x40;
/// Body (and, if COMPRESSED, the property block) is gzip-compressed.
pub const COMPRESSED: u8 = 0x08;
/// Requests preferential scheduling.
pub const URGENT: u8 = 0x10;
/// Request flag: no reply is expected or will be sent.
pub const NOREPLY: u8 = 0x20;
/// Reserved for metadata messages.
pub const META: u8 = 0x80;

const TYPE_MASK: u8 = 0x07;

/// The low 3 bits of a frame's flags: what kind of message this is.
#[derive(TryFromPrimitive, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Msg = 0,
    Rpy = 1,
    Err = 2,
    AckMsg = 4,
    AckRpy = 5,
}

impl MessageType {
    pub fn from_flags(flags: u8) -> Result<Self, BlipError> {
        let bits = flags & TYPE_MASK;
        Self::try_from(bits).map_err(|_| BlipError::UnknownType(bits))
    }

    pub fn is_ack(self) -> bool {
        matches!(self, MessageType::AckMsg | MessageType::AckRpy)
    }

    pub fn is_reply(self) -> bool {
        matches!(self, MessageType::Rpy | MessageType::Err)
    }
}

/// Flag-bit accessors, usable on any raw flags byte.
pub trait FlagsExt: Copy {
    fn bits(self) -> u8;

    fn has(self, bit: u8) -> bool {
        self.bits() & bit != 0
    }

    fn message_type(self) -> Result<MessageType, BlipError> {
        MessageType::from_flags(self.bits())
    }

    fn is_more_coming(self) -> bool {
        self.has(MORECOMING)
    }

    fn is_compressed(self) -> bool {
        self.has(COMPRESSED)
    }

    fn is_urgent(self) -> bool {
        self.has(URGENT)
    }

    fn is_no_reply(self) -> bool {
        self.has(NOREPLY)
    }
}

impl FlagsExt for u8 {
    fn bits(self) -> u8 {
        self
    }
}

/// Flag bits other than MORECOMING; these must be identical in every frame
/// of a message and are treated as authoritative from the first frame.
pub fn non_morecoming_bits(flags: u8) -> u8 {
    flags & !MORECOMING
}

/// Write the leading `messageNumber, flags` varint pair shared by every frame.
pub fn write_frame_prefix(buf: &mut BytesMut, number: u32, flags: u8) {
    write_varint(buf, number);
    write_varint(buf, flags as u32);
}

/// Read the leading `messageNumber, flags` varint pair. Only the low 8 bits
/// of the flags varint are meaningful.
pub fn read_frame_prefix(cursor: &mut Cursor<&[u8]>) -> Result<(u32, u8), BlipError> {
    let number = read_varint(cursor)?;
    let flags_raw = read_varint(cursor)?;
    Ok((number, (flags_raw & 0xFF) as u8))
}
