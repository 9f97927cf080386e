//! HTTP/1.x message framing, switching to websocket frames after an upgrade.

use super::{websocket, MessageSplitter, SplitOutcome};
use crate::network::IoSession;
use memchr::memmem;

const CRLF: &[u8] = b"\r\n";
const HEAD_END: &[u8] = b"\r\n\r\n";

/// Splits HTTP requests and responses, or websocket frames once
/// [`IoSession::mark_upgraded`] has been called for the session.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpMessageSplitter;

impl MessageSplitter for HttpMessageSplitter {
    fn can_split(&self, session: &IoSession, view: &[u8]) -> SplitOutcome {
        if session.is_upgraded() {
            websocket::frame_len(view)
        } else {
            http_message_len(view)
        }
    }
}

/// Length of the HTTP message at the front of `buf`, body included.
pub fn http_message_len(buf: &[u8]) -> SplitOutcome {
    if let Some(line_end) = memmem::find(buf, CRLF) {
        if !is_start_line(&buf[..line_end]) {
            return SplitOutcome::Invalid;
        }
    }

    let head_len = match memmem::find(buf, HEAD_END) {
        Some(index) => index + HEAD_END.len(),
        None => return SplitOutcome::NeedMoreData,
    };

    let body = match BodyKind::from_head(&buf[..head_len - HEAD_END.len()]) {
        Some(body) => body,
        None => return SplitOutcome::Invalid,
    };

    match body {
        BodyKind::None => SplitOutcome::Complete(head_len),
        BodyKind::Length(len) => match head_len.checked_add(len) {
            Some(total) if buf.len() >= total => SplitOutcome::Complete(total),
            Some(_) => SplitOutcome::NeedMoreData,
            None => SplitOutcome::Invalid,
        },
        BodyKind::Chunked => chunked_len(buf, head_len),
    }
}

/// A request line (`METHOD SP target SP HTTP/x.y`) or a status line (`HTTP/x.y SP ...`).
fn is_start_line(line: &[u8]) -> bool {
    if line.starts_with(b"HTTP/") {
        return line.iter().position(|&b| b == b' ').is_some_and(|sp| is_version(&line[..sp]));
    }

    let mut parts = line.split(|&b| b == b' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };

    !method.is_empty()
        && method.iter().all(|b| b.is_ascii_uppercase())
        && !target.is_empty()
        && is_version(version)
}

fn is_version(token: &[u8]) -> bool {
    match token.strip_prefix(b"HTTP/") {
        Some([major, b'.', minor]) => major.is_ascii_digit() && minor.is_ascii_digit(),
        _ => false,
    }
}

enum BodyKind {
    None,
    Length(usize),
    Chunked,
}

impl BodyKind {
    /// `None` when the headers carry an unparsable length.
    fn from_head(head: &[u8]) -> Option<Self> {
        let mut kind = BodyKind::None;
        for line in head.split(|&b| b == b'\n').skip(1) {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            let Some(colon) = line.iter().position(|&b| b == b':') else {
                continue;
            };
            let name = &line[..colon];
            let value = line[colon + 1..].trim_ascii();

            if name.eq_ignore_ascii_case(b"transfer-encoding") {
                if value
                    .split(|&b| b == b',')
                    .any(|coding| coding.trim_ascii().eq_ignore_ascii_case(b"chunked"))
                {
                    return Some(BodyKind::Chunked);
                }
            } else if name.eq_ignore_ascii_case(b"content-length") {
                let len = std::str::from_utf8(value).ok()?.parse::<usize>().ok()?;
                kind = BodyKind::Length(len);
            }
        }
        Some(kind)
    }
}

/// Walk chunk by chunk from `start` until the zero-size chunk and its trailers.
fn chunked_len(buf: &[u8], start: usize) -> SplitOutcome {
    let mut pos = start;
    loop {
        let Some(line_len) = memmem::find(&buf[pos..], CRLF) else {
            return SplitOutcome::NeedMoreData;
        };

        let size_field = &buf[pos..pos + line_len];
        let size_field = match size_field.iter().position(|&b| b == b';') {
            Some(ext) => &size_field[..ext],
            None => size_field,
        };
        let size = match std::str::from_utf8(size_field.trim_ascii())
            .ok()
            .and_then(|s| usize::from_str_radix(s, 16).ok())
        {
            Some(size) => size,
            None => return SplitOutcome::Invalid,
        };

        pos += line_len + CRLF.len();

        if size == 0 {
            // Trailer section ends with an empty line.
            if buf[pos..].starts_with(CRLF) {
                return SplitOutcome::Complete(pos + CRLF.len());
            }
            return match memmem::find(&buf[pos..], HEAD_END) {
                Some(index) => SplitOutcome::Complete(pos + index + HEAD_END.len()),
                None => SplitOutcome::NeedMoreData,
            };
        }

        // Sizes near usize::MAX would overflow the end offset.
        let Some(chunk_end) = pos
            .checked_add(size)
            .and_then(|end| end.checked_add(CRLF.len()))
        else {
            return SplitOutcome::Invalid;
        };
        if buf.len() < chunk_end {
            return SplitOutcome::NeedMoreData;
        }
        let data_end = chunk_end - CRLF.len();
        if &buf[data_end..data_end + CRLF.len()] != CRLF {
            return SplitOutcome::Invalid;
        }
        pos = chunk_end;
    }
}
