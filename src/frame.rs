/// ESPHome native API plaintext frame codec.
///
/// Frame format (self-delimiting, back-to-back on the TCP stream):
/// ```text
/// ┌──────────┬──────────────────┬──────────────────┬─────────────────┐
/// │ Byte 0   │ varint           │ varint           │ payload_len B   │
/// │ 0x00     │ payload_len      │ type id          │ protobuf body   │
/// └──────────┴──────────────────┴──────────────────┴─────────────────┘
/// ```
///
/// Any other marker byte means the device speaks the encrypted transport,
/// which the bridge does not support.
use bytes::{ Buf, BytesMut };
use prost::encoding::{ decode_varint, encode_varint };
use thiserror::Error;

use crate::proto::{ ApiMessage, Registry };

/// Leading byte of every plaintext frame.
pub const PLAINTEXT_MARKER: u8 = 0x00;

/// Largest body the reader will buffer for. Device frames are a few KiB at most.
pub const MAX_PAYLOAD_LEN: usize = 1 << 20;

/// A u64 varint never needs more than ten bytes.
const MAX_VARINT_LEN: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Encode was asked for a name the registry does not know.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    /// The stream does not start with the plaintext marker.
    #[error("unsupported frame marker 0x{0:02x} (encrypted transport?)")]
    UnsupportedFrame(u8),
    /// A header varint runs past ten bytes or overflows u64.
    #[error("malformed frame header varint")]
    MalformedHeader,
    /// The declared body length exceeds `MAX_PAYLOAD_LEN`.
    #[error("frame payload of {0} bytes exceeds limit")]
    PayloadTooLarge(u64),
}

/// One decoded frame.
///
/// `name`/`message` are `None` for ids missing from the registry; `message`
/// alone is `None` when the body fails to parse. The raw `payload` is always
/// kept.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub name: Option<&'static str>,
    pub id: u32,
    pub message: Option<ApiMessage>,
    pub payload: Vec<u8>,
    pub bytes_consumed: usize,
}

// ═══════════════════════════════════════════════════════════════════════
//  Encode
// ═══════════════════════════════════════════════════════════════════════

/// Frame a pre-serialized body under the registered `name`.
pub fn encode_named(name: &str, body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let entry = Registry::global()
        .by_name(name)
        .ok_or_else(|| ProtocolError::UnknownMessageType(name.to_string()))?;

    // marker + two varints (≤ 10 B each) + body
    let mut buf = Vec::with_capacity(1 + 20 + body.len());
    buf.push(PLAINTEXT_MARKER);
    encode_varint(body.len() as u64, &mut buf);
    encode_varint(entry.id as u64, &mut buf);
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Frame a typed message.
pub fn encode(message: &ApiMessage) -> Result<Vec<u8>, ProtocolError> {
    encode_named(message.name(), &message.encode_body())
}

// ═══════════════════════════════════════════════════════════════════════
//  Decode
// ═══════════════════════════════════════════════════════════════════════

/// Decode the frame at the head of `buf`.
///
/// Returns `None` when `buf` is empty, does not start with the plaintext
/// marker, or does not yet hold the whole frame. Never consumes anything;
/// callers drop `bytes_consumed` from the head themselves.
pub fn decode(buf: &[u8]) -> Option<DecodedFrame> {
    if buf.first() != Some(&PLAINTEXT_MARKER) {
        return None;
    }

    let mut cursor = &buf[1..];
    let payload_len = usize::try_from(decode_varint(&mut cursor).ok()?).ok()?;
    let raw_id = decode_varint(&mut cursor).ok()?;
    if cursor.len() < payload_len {
        return None;
    }

    let header_len = buf.len() - cursor.len();
    let payload = cursor[..payload_len].to_vec();
    // Out-of-range ids can never be registered; report them as unknown.
    let id = u32::try_from(raw_id).unwrap_or(u32::MAX);
    let entry = Registry::global().by_id(id);

    Some(DecodedFrame {
        name: entry.map(|e| e.name),
        id,
        message: entry.and_then(|e| e.decode(&payload)),
        payload,
        bytes_consumed: header_len + payload_len,
    })
}

// ═══════════════════════════════════════════════════════════════════════
//  Buffered reader
// ═══════════════════════════════════════════════════════════════════════

/// Carries partial frames across socket reads.
///
/// Bytes are appended at the tail (usually straight from `read_buf`) and
/// complete frames are drained from the head; whatever is left over stays
/// for the next read.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        FrameReader { buf: BytesMut::with_capacity(4096) }
    }

    /// Tail buffer for direct socket reads.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Pop the next complete frame, if any.
    pub fn next_frame(&mut self) -> Result<Option<DecodedFrame>, ProtocolError> {
        match self.buf.first() {
            None => {
                return Ok(None);
            }
            Some(&marker) if marker != PLAINTEXT_MARKER => {
                return Err(ProtocolError::UnsupportedFrame(marker));
            }
            Some(_) => {}
        }

        if !self.header_is_sane()? {
            return Ok(None);
        }

        match decode(&self.buf) {
            Some(frame) => {
                self.buf.advance(frame.bytes_consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Validate the two header varints that are already buffered.
    ///
    /// `Ok(false)` means the header is still incomplete. Garbage that could
    /// never become a valid header is an error, so the carry buffer cannot
    /// wait on it forever.
    fn header_is_sane(&self) -> Result<bool, ProtocolError> {
        let mut cursor = &self.buf[1..];
        let Some(payload_len) = header_varint(&mut cursor)? else {
            return Ok(false);
        };
        if payload_len > MAX_PAYLOAD_LEN as u64 {
            return Err(ProtocolError::PayloadTooLarge(payload_len));
        }
        Ok(header_varint(&mut cursor)?.is_some())
    }
}

#[cfg(test)]
impl FrameReader {
    fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Read one varint off the head of `cursor`, or `None` while it is still
/// missing bytes.
fn header_varint(cursor: &mut &[u8]) -> Result<Option<u64>, ProtocolError> {
    let window = &cursor[..cursor.len().min(MAX_VARINT_LEN)];
    match window.iter().position(|b| b & 0x80 == 0) {
        Some(last) => {
            let mut bytes = &window[..=last];
            let value = decode_varint(&mut bytes).map_err(|_| ProtocolError::MalformedHeader)?;
            *cursor = &cursor[last + 1..];
            Ok(Some(value))
        }
        None if window.len() == MAX_VARINT_LEN => Err(ProtocolError::MalformedHeader),
        None => Ok(None),
    }
}
