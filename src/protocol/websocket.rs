//! RFC 6455 frame headers.

use super::SplitOutcome;
use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

const FIN: u8 = 0x80;
const RSV_MASK: u8 = 0x70;
const OPCODE_MASK: u8 = 0x0f;
const MASKED: u8 = 0x80;
const LEN_MASK: u8 = 0x7f;

const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: u64 = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xa => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xa,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
}

impl FrameHeader {
    pub fn new(opcode: Opcode, payload_len: u64) -> Self {
        Self {
            fin: true,
            opcode,
            mask: None,
            payload_len,
        }
    }

    pub fn masked(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Encoded size of this header.
    pub fn header_len(&self) -> usize {
        let extended = match self.payload_len {
            0..=125 => 0,
            126..=0xffff => 2,
            _ => 8,
        };
        let mask = if self.mask.is_some() { 4 } else { 0 };
        2 + extended + mask
    }

    /// Parse a header from the front of `buf`.
    ///
    /// `Ok(None)` means more bytes are needed; the `usize` is the header length.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first = buf[0];
        let second = buf[1];

        if first & RSV_MASK != 0 {
            return Err(Error::Protocol("websocket frame uses reserved bits".into()));
        }

        let opcode = Opcode::from_u8(first & OPCODE_MASK).ok_or_else(|| {
            Error::Protocol(format!("unknown websocket opcode {:#x}", first & OPCODE_MASK))
        })?;
        let fin = first & FIN != 0;

        let mut offset = 2;
        let payload_len = match second & LEN_MASK {
            LEN_16 => {
                if buf.len() < offset + 2 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
                offset += 2;
                len
            }
            LEN_64 => {
                if buf.len() < offset + 8 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[2..10]);
                let len = u64::from_be_bytes(raw);
                if len & (1 << 63) != 0 {
                    return Err(Error::Protocol(
                        "websocket payload length has the high bit set".into(),
                    ));
                }
                offset += 8;
                len
            }
            len => len as u64,
        };

        if opcode.is_control() {
            if !fin {
                return Err(Error::Protocol("fragmented websocket control frame".into()));
            }
            if payload_len > MAX_CONTROL_PAYLOAD {
                return Err(Error::Protocol(format!(
                    "websocket control frame of {} bytes",
                    payload_len
                )));
            }
        }

        let mask = if second & MASKED != 0 {
            if buf.len() < offset + 4 {
                return Ok(None);
            }
            let mut key = [0u8; 4];
            key.copy_from_slice(&buf[offset..offset + 4]);
            offset += 4;
            Some(key)
        } else {
            None
        };

        Ok(Some((
            Self {
                fin,
                opcode,
                mask,
                payload_len,
            },
            offset,
        )))
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let mut first = self.opcode.as_u8();
        if self.fin {
            first |= FIN;
        }
        dst.put_u8(first);

        let mask_bit = if self.mask.is_some() { MASKED } else { 0 };
        match self.payload_len {
            len @ 0..=125 => dst.put_u8(mask_bit | len as u8),
            len @ 126..=0xffff => {
                dst.put_u8(mask_bit | LEN_16);
                dst.put_u16(len as u16);
            }
            len => {
                dst.put_u8(mask_bit | LEN_64);
                dst.put_u64(len);
            }
        }

        if let Some(mask) = self.mask {
            dst.put_slice(&mask);
        }
    }
}

/// XOR `data` with the masking key, starting at key offset 0.
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Build a complete single frame. The payload is masked when `mask` is set.
pub fn encode_frame(opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>) -> Bytes {
    let header = FrameHeader {
        fin: true,
        opcode,
        mask,
        payload_len: payload.len() as u64,
    };

    let mut frame = BytesMut::with_capacity(header.header_len() + payload.len());
    header.encode(&mut frame);
    let start = frame.len();
    frame.put_slice(payload);
    if let Some(mask) = mask {
        apply_mask(&mut frame[start..], mask);
    }
    frame.freeze()
}

/// Frame length of the websocket frame at the front of `buf`.
pub fn frame_len(buf: &[u8]) -> SplitOutcome {
    match FrameHeader::parse(buf) {
        Ok(None) => SplitOutcome::NeedMoreData,
        Err(_) => SplitOutcome::Invalid,
        Ok(Some((header, header_len))) => {
            let total = match usize::try_from(header.payload_len)
                .ok()
                .and_then(|len| len.checked_add(header_len))
            {
                Some(total) => total,
                None => return SplitOutcome::Invalid,
            };

            if buf.len() < total {
                SplitOutcome::NeedMoreData
            } else {
                SplitOutcome::Complete(total)
            }
        }
    }
}
