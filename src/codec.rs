// ABOUTME: Per-message streaming encoder/decoder — turns a Message's properties+body into a
// ABOUTME: sequence of frames (and back), including the optional per-message gzip stream

use crate::error::BlipError;
use crate::frame::{self, FlagsExt, COMPRESSED, MORECOMING};
use crate::properties::{self, Properties};
use crate::varint::{read_varint, write_varint};
use bytes::{Bytes, BytesMut};
use std::io::{Cursor, Read, Write};

fn compress(data: &[u8]) -> Result<Bytes, BlipError> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(Bytes::from(encoder.finish()?))
}

fn decompress(data: &[u8]) -> Result<Bytes, BlipError> {
    use flate2::read::GzDecoder;

    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(Bytes::from(out))
}

/// Streaming per-message encoder. Emits one frame per call to [`next_frame`]
/// until the message is fully sent.
///
/// [`next_frame`]: MessageEncoder::next_frame
pub struct MessageEncoder {
    number: u32,
    /// Authoritative flag bits, MORECOMING always cleared here; added back
    /// per-frame depending on how much of `payload` remains.
    flags: u8,
    compressed: bool,
    properties_block: Bytes,
    /// Bytes that follow the (number, flags, propertiesLength) header on the
    /// first frame and the (number, flags) header on every later one. When
    /// `compressed`, this is the gzip stream of `properties_block || body`
    /// and `properties_block` is never written inline. Otherwise it is the
    /// raw body and `properties_block` is written inline on frame one.
    payload: Bytes,
    cursor: Option<usize>,
    finished: bool,
}

impl MessageEncoder {
    pub fn new(number: u32, flags: u8, properties: &Properties, body: Bytes) -> Result<Self, BlipError> {
        let properties_block = properties::encode_block(properties).freeze();
        let compressed = flags.is_compressed();
        let payload = if compressed {
            let mut concat = BytesMut::with_capacity(properties_block.len() + body.len());
            concat.extend_from_slice(&properties_block);
            concat.extend_from_slice(&body);
            compress(&concat)?
        } else {
            body
        };
        Ok(Self {
            number,
            flags: frame::non_morecoming_bits(flags),
            compressed,
            properties_block,
            payload,
            cursor: None,
            finished: false,
        })
    }

    fn properties_inline(&self) -> bool {
        !self.compressed
    }

    /// Returns the next frame carrying up to `max_len` bytes of payload
    /// (body, or body-plus-property-block if compressed), or `None` once the
    /// message has been fully emitted. `max_len` bounds the payload chunk
    /// only; the frame header and, on the first frame, the inline property
    /// block ride on top of it.
    pub fn next_frame(&mut self, max_len: usize) -> Option<Bytes> {
        if self.finished {
            return None;
        }

        let mut buf = BytesMut::new();
        match self.cursor {
            None => {
                let take = max_len.min(self.payload.len());
                let more = take < self.payload.len();
                let flags_out = if more { self.flags | MORECOMING } else { self.flags };

                write_varint(&mut buf, self.number);
                write_varint(&mut buf, flags_out as u32);
                write_varint(&mut buf, self.properties_block.len() as u32);
                if self.properties_inline() {
                    buf.extend_from_slice(&self.properties_block);
                }
                buf.extend_from_slice(&self.payload[..take]);

                if more {
                    self.cursor = Some(take);
                } else {
                    self.finished = true;
                }
            }
            Some(pos) => {
                let remaining = self.payload.len() - pos;
                let take = max_len.min(remaining);
                let more = pos + take < self.payload.len();
                let flags_out = if more { self.flags | MORECOMING } else { self.flags };

                write_varint(&mut buf, self.number);
                write_varint(&mut buf, flags_out as u32);
                buf.extend_from_slice(&self.payload[pos..pos + take]);

                if more {
                    self.cursor = Some(pos + take);
                } else {
                    self.finished = true;
                }
            }
        }
        Some(buf.freeze())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Streaming per-message decoder. Fed frame-by-frame via
/// [`read_first_frame`]/[`read_next_frame`]; call [`finish`] once
/// [`is_complete`] reports true.
///
/// [`read_first_frame`]: MessageDecoder::read_first_frame
/// [`read_next_frame`]: MessageDecoder::read_next_frame
/// [`finish`]: MessageDecoder::finish
/// [`is_complete`]: MessageDecoder::is_complete
pub struct MessageDecoder {
    flags: u8,
    properties_length: usize,
    buffer: BytesMut,
    header_seen: bool,
    complete: bool,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self {
            flags: 0,
            properties_length: 0,
            buffer: BytesMut::new(),
            header_seen: false,
            complete: false,
        }
    }

    /// Ingest the first frame of a message. `cursor` is positioned right
    /// after `number` and `flags` have already been read off the frame.
    pub fn read_first_frame(&mut self, flags: u8, cursor: &mut Cursor<&[u8]>) -> Result<(), BlipError> {
        let properties_length = read_varint(cursor)? as usize;
        self.flags = frame::non_morecoming_bits(flags);
        self.properties_length = properties_length;
        self.buffer.extend_from_slice(remaining(cursor));
        self.header_seen = true;
        if !flags.is_more_coming() {
            self.complete = true;
        }
        Ok(())
    }

    /// Ingest a continuation frame. `cursor` is positioned right after
    /// `number` and `flags` have already been read off the frame.
    pub fn read_next_frame(&mut self, flags: u8, cursor: &mut Cursor<&[u8]>) -> Result<(), BlipError> {
        debug_assert!(self.header_seen, "continuation frame before first frame");
        self.buffer.extend_from_slice(remaining(cursor));
        if !flags.is_more_coming() {
            self.complete = true;
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The authoritative flag bits recorded from the first frame (MORECOMING
    /// always cleared). Valid once the first frame has been read.
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Consume the decoder once complete, producing the assembled properties
    /// and body.
    pub fn finish(self) -> Result<(Properties, Bytes), BlipError> {
        debug_assert!(self.complete, "finish() called before message was complete");
        let raw = if self.flags.is_compressed() {
            decompress(&self.buffer)?
        } else {
            self.buffer.freeze()
        };
        if raw.len() < self.properties_length {
            return Err(BlipError::BadProperties(
                "propertiesLength exceeds decoded message content",
            ));
        }
        let body = raw.slice(self.properties_length..);
        let properties = properties::decode_block(&raw[..self.properties_length])?;
        Ok((properties, body))
    }
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn remaining<'a>(cursor: &mut Cursor<&'a [u8]>) -> &'a [u8] {
    use bytes::Buf;
    let bytes = &cursor.get_ref()[cursor.position() as usize..];
    cursor.advance(bytes.len());
    bytes
}
