//! Client message model and wire framing
//!
//! Frame layout (big-endian):
//!
//! ```text
//! len:u32 | cmd:u8 | subcmd:u8 | uid_len:u8 uid | sid_len:u8 sid |
//! rid_len:u8 rid | body_len:u32 body | ext_len:u16 ext
//! ```
//!
//! `len` counts every byte after itself.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Length prefix size
const LEN_PREFIX: usize = 4;

/// Smallest possible frame payload: cmd, subcmd, three u8 lengths, u32 body
/// length, u16 ext length.
const MIN_PAYLOAD: usize = 1 + 1 + 3 + 4 + 2;

/// Protocol commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cmd {
    Ping,
    Enter,
    Leave,
    Pub,
    Msgs,
    Err,
    /// Any byte the gateway does not understand
    Other(u8),
}

impl Cmd {
    pub const fn code(self) -> u8 {
        match self {
            Cmd::Ping => 1,
            Cmd::Enter => 2,
            Cmd::Leave => 3,
            Cmd::Pub => 4,
            Cmd::Msgs => 5,
            Cmd::Err => 0xff,
            Cmd::Other(code) => code,
        }
    }
}

impl From<u8> for Cmd {
    fn from(code: u8) -> Self {
        match code {
            1 => Cmd::Ping,
            2 => Cmd::Enter,
            3 => Cmd::Leave,
            4 => Cmd::Pub,
            5 => Cmd::Msgs,
            0xff => Cmd::Err,
            other => Cmd::Other(other),
        }
    }
}

/// A decoded client request or a gateway reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub cmd: Cmd,
    pub subcmd: u8,
    pub uid: String,
    pub sid: String,
    pub rid: String,
    pub body: String,
    pub ext: String,
}

impl Message {
    pub fn new(cmd: Cmd) -> Self {
        Self {
            cmd,
            subcmd: 0,
            uid: String::new(),
            sid: String::new(),
            rid: String::new(),
            body: String::new(),
            ext: String::new(),
        }
    }

    /// Copy of this message tagged with another command
    pub fn reply_with_cmd(&self, cmd: Cmd) -> Self {
        Self {
            cmd,
            ..self.clone()
        }
    }

    /// Copy of this message carrying another body
    pub fn reply_with_body(&self, body: String) -> Self {
        Self {
            body,
            ..self.clone()
        }
    }

    /// Copy of this message addressed to another subcommand
    pub fn with_subcmd(&self, subcmd: u8) -> Self {
        Self {
            subcmd,
            ..self.clone()
        }
    }
}

/// Length-prefixed codec for [`Message`]
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_frame_len: usize,
}

impl MessageCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        if len < MIN_PAYLOAD {
            return Err(ProtocolError::Truncated);
        }

        if src.len() < LEN_PREFIX + len {
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        let mut frame = src.split_to(len);

        let cmd = Cmd::from(frame.get_u8());
        let subcmd = frame.get_u8();
        let uid = take_string(&mut frame, Width::U8, "uid")?;
        let sid = take_string(&mut frame, Width::U8, "sid")?;
        let rid = take_string(&mut frame, Width::U8, "rid")?;
        let body = take_string(&mut frame, Width::U32, "body")?;
        let ext = take_string(&mut frame, Width::U16, "ext")?;

        if frame.has_remaining() {
            return Err(ProtocolError::TrailingBytes(frame.remaining()));
        }

        Ok(Some(Message {
            cmd,
            subcmd,
            uid,
            sid,
            rid,
            body,
            ext,
        }))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        check_len("uid", &msg.uid, u8::MAX as usize)?;
        check_len("sid", &msg.sid, u8::MAX as usize)?;
        check_len("rid", &msg.rid, u8::MAX as usize)?;
        check_len("body", &msg.body, u32::MAX as usize)?;
        check_len("ext", &msg.ext, u16::MAX as usize)?;

        let len = MIN_PAYLOAD
            + msg.uid.len()
            + msg.sid.len()
            + msg.rid.len()
            + msg.body.len()
            + msg.ext.len();
        let prefix = u32::try_from(len).map_err(|_| ProtocolError::FieldTooLong("frame"))?;

        dst.reserve(LEN_PREFIX + len);
        dst.put_u32(prefix);
        dst.put_u8(msg.cmd.code());
        dst.put_u8(msg.subcmd);
        dst.put_u8(msg.uid.len() as u8);
        dst.put_slice(msg.uid.as_bytes());
        dst.put_u8(msg.sid.len() as u8);
        dst.put_slice(msg.sid.as_bytes());
        dst.put_u8(msg.rid.len() as u8);
        dst.put_slice(msg.rid.as_bytes());
        dst.put_u32(msg.body.len() as u32);
        dst.put_slice(msg.body.as_bytes());
        dst.put_u16(msg.ext.len() as u16);
        dst.put_slice(msg.ext.as_bytes());
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Width {
    U8,
    U16,
    U32,
}

fn take_string(
    frame: &mut BytesMut,
    width: Width,
    field: &'static str,
) -> Result<String, ProtocolError> {
    let needed = match width {
        Width::U8 => 1,
        Width::U16 => 2,
        Width::U32 => 4,
    };
    if frame.remaining() < needed {
        return Err(ProtocolError::Truncated);
    }
    let len = match width {
        Width::U8 => frame.get_u8() as usize,
        Width::U16 => frame.get_u16() as usize,
        Width::U32 => frame.get_u32() as usize,
    };
    if frame.remaining() < len {
        return Err(ProtocolError::Truncated);
    }
    let raw = frame.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(field))
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ProtocolError> {
    if value.len() > max {
        return Err(ProtocolError::FieldTooLong(field));
    }
    Ok(())
}

/// Framing errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("truncated frame")]
    Truncated,
    #[error("{0} trailing bytes after frame fields")]
    TrailingBytes(usize),
    #[error("field {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("field {0} is too long to encode")]
    FieldTooLong(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
