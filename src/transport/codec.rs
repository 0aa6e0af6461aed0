//! Frame codec for byte-stream transports.
//!
//! ```text
//! +----------------+------------+----------------------+
//! | len: u32 (LE)  | kind: u16  | body (MessagePack)   |
//! +----------------+------------+----------------------+
//! ```
//!
//! `len` counts the kind and the body. `kind` is the rpc.capnp union ordinal,
//! so a peer speaking a newer dialect produces [`Message::Unknown`] rather
//! than a decode failure, and the engine can answer with `Unimplemented`.

use crate::error::TransportError;
use crate::message::Message;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{Read, Write};

/// Default upper bound on a frame, in bytes.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const HEADER_LEN: usize = 4;
const KIND_LEN: usize = 2;

fn body<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    Ok(rmp_serde::to_vec(value)?)
}

fn parse<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TransportError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Encodes a message into `(kind, body)`.
pub fn encode_body(msg: &Message) -> Result<(u16, Vec<u8>), TransportError> {
    let bytes = match msg {
        Message::Unimplemented(inner) => {
            let (code, inner_body) = encode_body(inner)?;
            body(&(code, inner_body))?
        }
        Message::Abort(exc) => body(exc)?,
        Message::Bootstrap(b) => body(b)?,
        Message::Call(c) => body(c)?,
        Message::Return(r) => body(r)?,
        Message::Finish(f) => body(f)?,
        Message::Release(r) => body(r)?,
        Message::Disembargo(d) => body(d)?,
        Message::Unknown(_) => Vec::new(),
    };
    Ok((msg.code(), bytes))
}

/// Decodes a message from its kind and body.
///
/// An `Unimplemented` echo is decoded one level deep; an echo of an echo
/// carries nothing the engine acts on and decodes as `Unknown(0)`.
pub fn decode_body(kind: u16, bytes: &[u8]) -> Result<Message, TransportError> {
    if kind != 0 {
        return decode_plain(kind, bytes);
    }
    let (code, inner): (u16, Vec<u8>) = parse(bytes)?;
    let echoed = if code == 0 {
        Message::Unknown(0)
    } else {
        decode_plain(code, &inner)?
    };
    Ok(Message::Unimplemented(Box::new(echoed)))
}

fn decode_plain(kind: u16, bytes: &[u8]) -> Result<Message, TransportError> {
    Ok(match kind {
        1 => Message::Abort(parse(bytes)?),
        2 => Message::Call(parse(bytes)?),
        3 => Message::Return(parse(bytes)?),
        4 => Message::Finish(parse(bytes)?),
        6 => Message::Release(parse(bytes)?),
        8 => Message::Bootstrap(parse(bytes)?),
        13 => Message::Disembargo(parse(bytes)?),
        other => Message::Unknown(other),
    })
}

/// Writes one frame.
pub fn write_frame<W: Write>(w: &mut W, msg: &Message) -> Result<(), TransportError> {
    let (kind, bytes) = encode_body(msg)?;
    let len = u32::try_from(KIND_LEN + bytes.len()).map_err(|_| TransportError::FrameTooLarge {
        len: KIND_LEN + bytes.len(),
        max: u32::MAX as usize,
    })?;
    let mut frame = Vec::with_capacity(HEADER_LEN + len as usize);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&kind.to_le_bytes());
    frame.extend_from_slice(&bytes);
    w.write_all(&frame)?;
    w.flush()?;
    Ok(())
}

/// Reads one frame. A clean EOF before the header maps to
/// [`TransportError::Closed`].
pub fn read_frame<R: Read>(r: &mut R, max_len: usize) -> Result<Message, TransportError> {
    let mut header = [0u8; HEADER_LEN];
    if let Err(err) = r.read_exact(&mut header) {
        return Err(if err.kind() == std::io::ErrorKind::UnexpectedEof {
            TransportError::Closed
        } else {
            err.into()
        });
    }
    let len = u32::from_le_bytes(header) as usize;
    if len > max_len {
        return Err(TransportError::FrameTooLarge { len, max: max_len });
    }
    if len < KIND_LEN {
        return Err(TransportError::Truncated(len));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    let kind = u16::from_le_bytes([buf[0], buf[1]]);
    decode_body(kind, &buf[KIND_LEN..])
}
