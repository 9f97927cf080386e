//! Fixed-header framing: `0x80 0x80 <u32 big-endian length> 0x80 <payload>`.

use super::{MessageSplitter, SplitOutcome};
use crate::error::{Error, Result};
use crate::network::IoSession;
use bytes::{BufMut, Bytes, BytesMut};

pub const MAGIC: u8 = 0x80;
pub const HEADER_LEN: usize = 7;

/// Positions of the magic byte inside the header.
const MAGIC_OFFSETS: [usize; 3] = [0, 1, 6];

/// Build one frame around `payload`. Payloads must fit the 32-bit length field.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    let len = length_field(payload.len())?;
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_u8(MAGIC);
    frame.put_u8(MAGIC);
    frame.put_u32(len);
    frame.put_u8(MAGIC);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

fn length_field(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        Error::Filter(format!("payload of {} bytes exceeds a fixed-header frame", len))
    })
}

/// Inspect the header at the front of `buf`.
///
/// Returns the total frame length once the header is complete. Magic bytes are
/// checked as soon as they are buffered, so garbage is rejected early.
pub fn frame_len(buf: &[u8]) -> SplitOutcome {
    for &offset in &MAGIC_OFFSETS {
        if let Some(&byte) = buf.get(offset) {
            if byte != MAGIC {
                return SplitOutcome::Invalid;
            }
        }
    }

    if buf.len() < HEADER_LEN {
        return SplitOutcome::NeedMoreData;
    }

    let len = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
    let total = HEADER_LEN + len;
    if buf.len() < total {
        SplitOutcome::NeedMoreData
    } else {
        SplitOutcome::Complete(total)
    }
}

/// Splitter for [`encode_frame`] frames; pair it with [`crate::filter::ByteFilter`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedHeaderSplitter;

impl MessageSplitter for FixedHeaderSplitter {
    fn can_split(&self, _session: &IoSession, view: &[u8]) -> SplitOutcome {
        frame_len(view)
    }
}
