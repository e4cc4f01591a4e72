//! Wire format for the framed transport.
//!
//! Wire format: all multi-byte integers are big-endian.
//! Strings are length-prefixed (u16 len + UTF-8).
//! Frame format: len:u32 | type:u8 | payload (len counts the payload only)
//!
//! Client -> service: HELLO, ADD*, then INPUT_END or ABORT.
//! Service -> client: PROGRESS / RESULT in any order, FATAL on failure.

use crate::error::{IngestError, Result};
use crate::streaming::channel::{
    InboundMessage, MessageKind, OutboundMessage, ProgressReply, ResultReply,
};
use crate::streaming::entry::Mtime;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Current wire protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum frame size (64MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

const HEADER_LEN: usize = 5;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    Add = 0x02,
    InputEnd = 0x03,
    Abort = 0x04,
    Progress = 0x05,
    Result = 0x06,
    Fatal = 0x07,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::Add),
            0x03 => Some(Self::InputEnd),
            0x04 => Some(Self::Abort),
            0x05 => Some(Self::Progress),
            0x06 => Some(Self::Result),
            0x07 => Some(Self::Fatal),
            _ => None,
        }
    }
}

// =============================================================================
// Add Flags
// =============================================================================

bitflags::bitflags! {
    /// Presence of the optional ADD fields. A cleared bit means the field is
    /// omitted from the payload, which is distinct from a zero value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AddFlags: u8 {
        const DIR = 1 << 0;
        const HAS_MODE = 1 << 1;
        const HAS_MTIME = 1 << 2;
        const HAS_CONTENT = 1 << 3;
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn begin_frame(msg_type: MessageType, payload_len: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_len);
    buf.put_u32(payload_len as u32);
    buf.put_u8(msg_type as u8);
    buf
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_string(payload: &mut Bytes, what: &str) -> Result<String> {
    if payload.remaining() < 2 {
        return Err(IngestError::protocol(format!("{} length truncated", what)));
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        return Err(IngestError::protocol(format!(
            "{} truncated: expected {} bytes, got {}",
            what,
            len,
            payload.remaining()
        )));
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .map_err(|_| IngestError::protocol(format!("Invalid UTF-8 in {}", what)))
}

fn need(payload: &Bytes, n: usize, what: &str) -> Result<()> {
    if payload.remaining() < n {
        return Err(IngestError::protocol(format!("{} payload too short", what)));
    }
    Ok(())
}

fn check_string_len(s: &str, what: &str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(IngestError::protocol(format!(
            "{} too long: {} bytes",
            what,
            s.len()
        )));
    }
    Ok(())
}

// =============================================================================
// HELLO (0x01)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub version: u16,
}

impl Hello {
    pub fn new() -> Self {
        Self {
            version: PROTOCOL_VERSION,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = begin_frame(MessageType::Hello, 2);
        buf.put_u16(self.version);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        need(&payload, 2, "Hello")?;
        Ok(Self {
            version: payload.get_u16(),
        })
    }
}

impl Default for Hello {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// ADD (0x02)
// =============================================================================

pub fn encode_add(msg: &OutboundMessage) -> Result<Bytes> {
    check_string_len(&msg.path, "Add path")?;

    let mut flags = AddFlags::empty();
    let mut payload_len = 8 + 1 + 2 + msg.path.len();
    if msg.kind == MessageKind::Directory {
        flags |= AddFlags::DIR;
    }
    if msg.mode.is_some() {
        flags |= AddFlags::HAS_MODE;
        payload_len += 4;
    }
    if msg.mtime.is_some() {
        flags |= AddFlags::HAS_MTIME;
        payload_len += 8 + 4;
    }
    if let Some(content) = &msg.content {
        flags |= AddFlags::HAS_CONTENT;
        payload_len += 4 + content.len();
    }
    if payload_len > MAX_FRAME_SIZE as usize {
        return Err(IngestError::protocol(format!(
            "Add frame for {} exceeds maximum size ({} bytes)",
            msg.path, payload_len
        )));
    }

    let mut buf = begin_frame(MessageType::Add, payload_len);
    buf.put_u64(msg.index);
    buf.put_u8(flags.bits());
    put_string(&mut buf, &msg.path);
    if let Some(mode) = msg.mode {
        buf.put_u32(mode);
    }
    if let Some(mtime) = msg.mtime {
        buf.put_i64(mtime.secs);
        buf.put_u32(mtime.nsecs);
    }
    if let Some(content) = &msg.content {
        buf.put_u32(content.len() as u32);
        buf.put_slice(content);
    }
    Ok(buf.freeze())
}

pub fn decode_add(mut payload: Bytes) -> Result<OutboundMessage> {
    need(&payload, 9, "Add")?;
    let index = payload.get_u64();
    let flags = AddFlags::from_bits_truncate(payload.get_u8());
    let path = get_string(&mut payload, "Add path")?;

    let mode = if flags.contains(AddFlags::HAS_MODE) {
        need(&payload, 4, "Add mode")?;
        Some(payload.get_u32())
    } else {
        None
    };
    let mtime = if flags.contains(AddFlags::HAS_MTIME) {
        need(&payload, 12, "Add mtime")?;
        Some(Mtime::new(payload.get_i64(), payload.get_u32()))
    } else {
        None
    };
    let content = if flags.contains(AddFlags::HAS_CONTENT) {
        need(&payload, 4, "Add content")?;
        let len = payload.get_u32() as usize;
        need(&payload, len, "Add content")?;
        Some(payload.copy_to_bytes(len))
    } else {
        None
    };

    let kind = if flags.contains(AddFlags::DIR) {
        MessageKind::Directory
    } else {
        MessageKind::File
    };
    if kind == MessageKind::Directory && content.is_some() {
        return Err(IngestError::protocol(format!(
            "Directory {} carries content",
            path
        )));
    }

    Ok(OutboundMessage {
        index,
        kind,
        path,
        mode,
        mtime,
        content,
    })
}

// =============================================================================
// INPUT_END (0x03) / ABORT (0x04) / FATAL (0x07)
// =============================================================================

pub fn encode_input_end() -> Bytes {
    begin_frame(MessageType::InputEnd, 0).freeze()
}

/// Reason text frame (ABORT from the client, FATAL from the service)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reason {
    pub message: String,
}

impl Reason {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn encode(&self, msg_type: MessageType) -> Bytes {
        // Reasons are informational; clip rather than fail
        let mut end = self.message.len().min(u16::MAX as usize);
        while !self.message.is_char_boundary(end) {
            end -= 1;
        }
        let text = &self.message[..end];
        let mut buf = begin_frame(msg_type, 2 + text.len());
        put_string(&mut buf, text);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        Ok(Self {
            message: get_string(&mut payload, "Reason")?,
        })
    }
}

// =============================================================================
// PROGRESS (0x05)
// =============================================================================

pub fn encode_progress(progress: &ProgressReply) -> Result<Bytes> {
    check_string_len(&progress.path, "Progress path")?;
    let mut buf = begin_frame(MessageType::Progress, 8 + 2 + progress.path.len());
    buf.put_u64(progress.bytes);
    put_string(&mut buf, &progress.path);
    Ok(buf.freeze())
}

pub fn decode_progress(mut payload: Bytes) -> Result<ProgressReply> {
    need(&payload, 8, "Progress")?;
    let bytes = payload.get_u64();
    let path = get_string(&mut payload, "Progress path")?;
    Ok(ProgressReply { bytes, path })
}

// =============================================================================
// RESULT (0x06)
// =============================================================================

pub fn encode_result(result: &ResultReply) -> Result<Bytes> {
    check_string_len(&result.path, "Result path")?;
    check_string_len(&result.cid, "Result cid")?;
    let payload_len = 2 + result.path.len() + 2 + result.cid.len() + 4 + 8 + 4 + 8;
    let mut buf = begin_frame(MessageType::Result, payload_len);
    put_string(&mut buf, &result.path);
    put_string(&mut buf, &result.cid);
    buf.put_u32(result.mode);
    buf.put_i64(result.mtime);
    buf.put_u32(result.mtime_nsecs);
    buf.put_u64(result.size);
    Ok(buf.freeze())
}

pub fn decode_result(mut payload: Bytes) -> Result<ResultReply> {
    let path = get_string(&mut payload, "Result path")?;
    let cid = get_string(&mut payload, "Result cid")?;
    need(&payload, 24, "Result")?;
    Ok(ResultReply {
        path,
        cid,
        mode: payload.get_u32(),
        mtime: payload.get_i64(),
        mtime_nsecs: payload.get_u32(),
        size: payload.get_u64(),
    })
}

/// Decode a service frame into an inbound message.
/// FATAL becomes a transport error; client-only frames are rejected.
pub fn decode_inbound(msg_type: MessageType, payload: Bytes) -> Result<InboundMessage> {
    match msg_type {
        MessageType::Progress => decode_progress(payload).map(InboundMessage::Progress),
        MessageType::Result => decode_result(payload).map(InboundMessage::Result),
        MessageType::Fatal => {
            let reason = Reason::decode(payload)?;
            Err(IngestError::Transport(format!(
                "Remote fatal error: {}",
                reason.message
            )))
        }
        other => Err(IngestError::protocol(format!(
            "Unexpected message from service: {:?}",
            other
        ))),
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Read a single frame from the stream.
/// Returns `None` on a clean EOF at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<(MessageType, Bytes)>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = r
            .read(&mut len_buf[filled..])
            .await
            .map_err(|e| IngestError::Transport(format!("Failed to read frame length: {}", e)))?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(IngestError::transport("Connection closed mid-frame"));
        }
        filled += n;
    }
    let len = u32::from_be_bytes(len_buf);

    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        return Err(IngestError::protocol(format!(
            "Frame size {} exceeds maximum allowed size {}",
            len, MAX_FRAME_SIZE
        )));
    }

    let msg_type = r
        .read_u8()
        .await
        .map_err(|e| IngestError::Transport(format!("Failed to read message type: {}", e)))?;
    let msg_type = MessageType::from_u8(msg_type)
        .ok_or_else(|| IngestError::protocol(format!("Unknown message type 0x{:02x}", msg_type)))?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .map_err(|e| IngestError::Transport(format!("Failed to read frame payload: {}", e)))?;

    Ok(Some((msg_type, Bytes::from(payload))))
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame)
        .await
        .map_err(|e| IngestError::Transport(format!("Failed to write frame: {}", e)))
}

/// Split an encoded frame into its type and payload.
pub fn split_frame(frame: &Bytes) -> Result<(MessageType, Bytes)> {
    if frame.len() < HEADER_LEN {
        return Err(IngestError::protocol("Frame shorter than header"));
    }
    let msg_type = MessageType::from_u8(frame[4])
        .ok_or_else(|| IngestError::protocol(format!("Unknown message type 0x{:02x}", frame[4])))?;
    Ok((msg_type, frame.slice(HEADER_LEN..)))
}

// =============================================================================
// Tests
// =============================================================================
