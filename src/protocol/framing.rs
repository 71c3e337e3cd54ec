//! Message boundary detection over a byte buffer.
//!
//! The codec parses whole messages, so these helpers decide how many
//! buffered bytes belong to the next complete message before any parsing
//! happens.

use crate::protocol::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use crate::util::{ProxyError, Result};

pub const HEAD_SEPARATOR: &[u8] = b"\r\n\r\n";
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Offset just past the blank line ending the message head
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_SEPARATOR.len())
        .position(|window| window == HEAD_SEPARATOR)
        .map(|pos| pos + HEAD_SEPARATOR.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyLength {
    None,
    Fixed(usize),
    Chunked,
}

/// How much of the buffer the next response occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFrame {
    Incomplete,
    Complete(usize),
    /// No length information: the body runs until the peer closes.
    UntilClose,
}

/// Length of the first complete request in `buf`, if any
pub fn request_frame_len(buf: &[u8]) -> Result<Option<usize>> {
    let Some(head_end) = head_end_checked(buf)? else {
        return Ok(None);
    };
    let length = body_length(&buf[..head_end])?;
    frame_len(buf, head_end, length.unwrap_or(BodyLength::None))
}

/// Length of the first complete response in `buf`.
///
/// `bodyless` is set when the matching request was a HEAD request.
pub fn response_frame_len(buf: &[u8], bodyless: bool) -> Result<ResponseFrame> {
    let Some(head_end) = head_end_checked(buf)? else {
        return Ok(ResponseFrame::Incomplete);
    };
    let head = &buf[..head_end];
    let length = if bodyless || status_is_bodyless(head) {
        Some(BodyLength::None)
    } else {
        body_length(head)?
    };
    match length {
        Some(length) => Ok(match frame_len(buf, head_end, length)? {
            Some(len) => ResponseFrame::Complete(len),
            None => ResponseFrame::Incomplete,
        }),
        None => Ok(ResponseFrame::UntilClose),
    }
}

fn head_end_checked(buf: &[u8]) -> Result<Option<usize>> {
    match find_head_end(buf) {
        Some(end) if end > MAX_HEAD_SIZE => Err(too_large()),
        Some(end) => Ok(Some(end)),
        None if buf.len() > MAX_HEAD_SIZE => Err(too_large()),
        None => Ok(None),
    }
}

fn too_large() -> ProxyError {
    ProxyError::Parse(format!("message head exceeds {} bytes", MAX_HEAD_SIZE))
}

fn offset(base: usize, len: usize, what: &str) -> Result<usize> {
    base.checked_add(len)
        .ok_or_else(|| ProxyError::Parse(format!("{} of {} bytes is out of range", what, len)))
}

fn frame_len(buf: &[u8], head_end: usize, length: BodyLength) -> Result<Option<usize>> {
    match length {
        BodyLength::None => Ok(Some(head_end)),
        BodyLength::Fixed(n) => {
            let total = offset(head_end, n, "Content-Length")?;
            Ok((buf.len() >= total).then_some(total))
        }
        BodyLength::Chunked => match chunked_len(&buf[head_end..])? {
            Some(n) => offset(head_end, n, "chunked body").map(Some),
            None => Ok(None),
        },
    }
}

fn status_is_bodyless(head: &[u8]) -> bool {
    let line_end = head.iter().position(|b| *b == b'\r').unwrap_or(head.len());
    let code = head[..line_end]
        .split(|b| *b == b' ')
        .nth(1)
        .and_then(|c| std::str::from_utf8(c).ok())
        .and_then(|c| c.parse::<u16>().ok());
    matches!(code, Some(100..=199 | 204 | 304))
}

/// Body length declared by the head; `None` when it declares nothing
fn body_length(head: &[u8]) -> Result<Option<BodyLength>> {
    let text = String::from_utf8_lossy(head);
    let mut content_length: Option<usize> = None;
    let mut chunked = false;
    for line in text.split("\r\n").skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case(CONTENT_LENGTH) {
            let n: usize = value
                .parse()
                .map_err(|_| ProxyError::Parse(format!("invalid Content-Length '{}'", value)))?;
            if content_length.is_some_and(|previous| previous != n) {
                return Err(ProxyError::Parse("conflicting Content-Length headers".into()));
            }
            content_length = Some(n);
        } else if name.eq_ignore_ascii_case(TRANSFER_ENCODING) {
            chunked = value
                .rsplit(',')
                .next()
                .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"));
        }
    }
    Ok(if chunked {
        Some(BodyLength::Chunked)
    } else {
        content_length.map(BodyLength::Fixed)
    })
}

/// Length of a complete chunked body, trailers included
fn chunked_len(body: &[u8]) -> Result<Option<usize>> {
    let mut pos = 0;
    loop {
        let Some(line_len) = find_crlf(&body[pos..]) else {
            return Ok(None);
        };
        let line = String::from_utf8_lossy(&body[pos..pos + line_len]);
        let size_text = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| ProxyError::Parse(format!("invalid chunk size '{}'", size_text)))?;
        pos += line_len + 2;

        if size == 0 {
            // Trailer section ends with an empty line.
            loop {
                let Some(trailer_len) = find_crlf(&body[pos..]) else {
                    return Ok(None);
                };
                pos += trailer_len + 2;
                if trailer_len == 0 {
                    return Ok(Some(pos));
                }
            }
        }

        let data_end = offset(pos, size, "chunk")?;
        let chunk_end = offset(data_end, 2, "chunk")?;
        if body.len() < chunk_end {
            return Ok(None);
        }
        if &body[data_end..chunk_end] != b"\r\n" {
            return Err(ProxyError::Parse("chunk is not terminated by CRLF".into()));
        }
        pos = chunk_end;
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_without_body() {
        let buf = b"GET / HTTP/1.1\r\nHost: a\r\n\r\nGET /next";
        assert_eq!(request_frame_len(buf).unwrap(), Some(27));
    }

    #[test]
    fn test_request_waits_for_content_length() {
        let partial = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nab";
        assert_eq!(request_frame_len(partial).unwrap(), None);
        let full = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nabcde";
        assert_eq!(request_frame_len(full).unwrap(), Some(full.len()));
    }

    #[test]
    fn test_incomplete_head() {
        assert_eq!(request_frame_len(b"GET / HTTP/1.1\r\nHost").unwrap(), None);
        assert_eq!(response_frame_len(b"HTTP/1.1 200", false).unwrap(), ResponseFrame::Incomplete);
    }

    #[test]
    fn test_oversized_head_is_rejected() {
        let buf = vec![b'a'; MAX_HEAD_SIZE + 1];
        assert!(request_frame_len(&buf).is_err());
    }

    #[test]
    fn test_chunked_response() {
        let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        let body = b"4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\n\r\n";
        let mut buf = head.to_vec();
        buf.extend_from_slice(&body[..body.len() - 2]);
        assert_eq!(response_frame_len(&buf, false).unwrap(), ResponseFrame::Incomplete);
        buf.extend_from_slice(b"\r\n");
        assert_eq!(
            response_frame_len(&buf, false).unwrap(),
            ResponseFrame::Complete(head.len() + body.len())
        );
    }

    #[test]
    fn test_chunked_with_trailers() {
        let buf = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n0\r\nX-Trailer: 1\r\n\r\n";
        assert_eq!(response_frame_len(buf, false).unwrap(), ResponseFrame::Complete(buf.len()));
    }

    #[test]
    fn test_bodyless_responses() {
        let buf = b"HTTP/1.1 304 Not Modified\r\nContent-Length: 10\r\n\r\n";
        assert_eq!(response_frame_len(buf, false).unwrap(), ResponseFrame::Complete(buf.len()));
        let buf = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n";
        assert_eq!(response_frame_len(buf, true).unwrap(), ResponseFrame::Complete(buf.len()));
    }

    #[test]
    fn test_response_until_close() {
        let buf = b"HTTP/1.1 200 OK\r\n\r\npartial body";
        assert_eq!(response_frame_len(buf, false).unwrap(), ResponseFrame::UntilClose);
    }

    #[test]
    fn test_huge_content_length_is_rejected() {
        let buf = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 18446744073709551615\r\n\r\nab";
        assert!(matches!(request_frame_len(buf), Err(ProxyError::Parse(_))));
    }

    #[test]
    fn test_huge_chunk_size_is_rejected() {
        let buf = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nab";
        assert!(matches!(response_frame_len(buf, false), Err(ProxyError::Parse(_))));

        let request = b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\nfffffffffffffffe\r\n";
        assert!(matches!(request_frame_len(request), Err(ProxyError::Parse(_))));
    }

    #[test]
    fn test_conflicting_content_length() {
        let buf = b"POST / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\nab";
        assert!(request_frame_len(buf).is_err());
    }
}
