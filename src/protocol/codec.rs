use crate::protocol::authority::UriAuthority;
use crate::protocol::content_type::{ContentType, DEFAULT_CHARSET};
use crate::protocol::framing::{self, HEAD_SEPARATOR, ResponseFrame};
use crate::protocol::header::{CONTENT_TYPE, HOST, Header, HeaderRegistry, Headers};
use crate::protocol::message::{HTTP_1_1, HttpRequest, HttpResponse, Method};
use crate::protocol::registry::ProtocolRegistry;
use crate::protocol::status::HttpStatus;
use crate::util::{ProxyError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tokio_util::codec::Decoder;

/// Wire codec for one HTTP protocol version
pub trait HttpCodec: Send + Sync {
    /// Version token, e.g. `HTTP/1.1`
    fn version(&self) -> &str;

    /// Whether `bytes` hold a message head this codec understands
    fn is_compatible(&self, bytes: &[u8]) -> bool;

    fn parse_request(&self, bytes: &[u8]) -> Result<HttpRequest>;

    fn parse_response(&self, bytes: &[u8]) -> Result<HttpResponse>;

    fn parse_header(&self, line: &str) -> Result<Header>;

    fn serialize_request(&self, request: &HttpRequest) -> Result<Bytes>;

    fn serialize_response(&self, response: &HttpResponse) -> Result<Bytes>;
}

/// HTTP/1.1 codec
pub struct Http11Codec {
    headers: Arc<HeaderRegistry>,
}

impl Default for Http11Codec {
    fn default() -> Self {
        Self::new(Arc::new(HeaderRegistry::default()))
    }
}

impl Http11Codec {
    pub fn new(headers: Arc<HeaderRegistry>) -> Self {
        Self { headers }
    }

    pub fn header_registry(&self) -> &HeaderRegistry {
        &self.headers
    }

    /// Split raw bytes into (start line, header lines, body)
    fn split_message<'a>(&self, bytes: &'a [u8]) -> Result<(&'a str, Vec<&'a str>, Option<Bytes>)> {
        let head_end = framing::find_head_end(bytes)
            .ok_or_else(|| ProxyError::Parse("missing blank line after headers".into()))?;
        let head = std::str::from_utf8(&bytes[..head_end - HEAD_SEPARATOR.len()])
            .map_err(|e| ProxyError::Parse(format!("message head is not valid UTF-8: {}", e)))?;
        let mut lines = head.split("\r\n");
        let start_line = lines.next().unwrap_or_default();
        let header_lines = lines.collect();
        let body = &bytes[head_end..];
        let body = (!body.is_empty()).then(|| Bytes::copy_from_slice(body));
        Ok((start_line, header_lines, body))
    }

    fn parse_headers(&self, lines: &[&str]) -> Result<Headers> {
        lines.iter().map(|line| self.parse_header(line)).collect()
    }

    fn charset_of(headers: &Headers) -> Result<String> {
        match headers.first_value(CONTENT_TYPE) {
            Some(value) => Ok(ContentType::parse(value)?
                .charset()
                .unwrap_or(DEFAULT_CHARSET)
                .to_string()),
            None => Ok(DEFAULT_CHARSET.to_string()),
        }
    }

    fn write_headers_and_body(out: &mut BytesMut, headers: &Headers, body: Option<&Bytes>) {
        for header in headers {
            out.put_slice(header.name().as_bytes());
            out.put_slice(b": ");
            out.put_slice(header.value().as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
        if let Some(body) = body {
            out.put_slice(body);
        }
    }
}

impl HttpCodec for Http11Codec {
    fn version(&self) -> &str {
        HTTP_1_1
    }

    fn is_compatible(&self, bytes: &[u8]) -> bool {
        if framing::find_head_end(bytes).is_none() {
            return false;
        }
        let line_end = bytes.windows(2).position(|w| w == b"\r\n").unwrap_or(0);
        let Ok(start_line) = std::str::from_utf8(&bytes[..line_end]) else {
            return false;
        };
        let tokens: Vec<&str> = start_line.split(' ').collect();
        let request_shape = tokens.len() == 3 && tokens[2] == HTTP_1_1;
        let response_shape = tokens.len() >= 2 && tokens[0] == HTTP_1_1;
        request_shape || response_shape
    }

    fn parse_request(&self, bytes: &[u8]) -> Result<HttpRequest> {
        let (start_line, header_lines, body) = self.split_message(bytes)?;
        let tokens: Vec<&str> = start_line.split(' ').collect();
        let &[method, target, version] = tokens.as_slice() else {
            return Err(ProxyError::Parse(format!("malformed request line '{}'", start_line)));
        };
        if version != HTTP_1_1 {
            return Err(ProxyError::Parse(format!("unsupported version '{}'", version)));
        }
        let method: Method = method.parse()?;
        let headers = self.parse_headers(&header_lines)?;

        let host_count = headers.count(HOST);
        if host_count > 1 {
            return Err(ProxyError::Parse("multiple Host headers".into()));
        }

        let (authority, path) = if target.starts_with('/') || target == "*" {
            let host = headers
                .first_value(HOST)
                .ok_or_else(|| ProxyError::Parse("missing Host header".into()))?;
            (UriAuthority::parse(host)?, target.to_string())
        } else if let Some(scheme_end) = target.find("://") {
            let after_scheme = &target[scheme_end + 3..];
            let path = match after_scheme.find('/') {
                Some(idx) => after_scheme[idx..].to_string(),
                None => "/".to_string(),
            };
            (UriAuthority::parse(target)?, path)
        } else {
            // authority-form, only meaningful for CONNECT
            (UriAuthority::parse(target)?, String::new())
        };

        let charset = Self::charset_of(&headers)?;
        Ok(HttpRequest::from_parts(
            version,
            method,
            Some(authority),
            path,
            charset,
            headers,
            body,
        ))
    }

    fn parse_response(&self, bytes: &[u8]) -> Result<HttpResponse> {
        let (start_line, header_lines, body) = self.split_message(bytes)?;
        let mut parts = start_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if version != HTTP_1_1 {
            return Err(ProxyError::Parse(format!("malformed status line '{}'", start_line)));
        }
        let code: u16 = parts
            .next()
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| ProxyError::Parse(format!("malformed status line '{}'", start_line)))?;
        let reason = parts.next().unwrap_or_default();
        let status = HttpStatus::with_reason(code, reason)?;
        let headers = self.parse_headers(&header_lines)?;
        let charset = Self::charset_of(&headers)?;
        Ok(HttpResponse::from_parts(version, status, charset, headers, body))
    }

    fn parse_header(&self, line: &str) -> Result<Header> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::Parse(format!("malformed header line '{}'", line)))?;
        let value = value.trim();
        self.headers.validate(name, value)?;
        Header::new(name, value)
    }

    fn serialize_request(&self, request: &HttpRequest) -> Result<Bytes> {
        match request.headers().count(HOST) {
            1 => {}
            0 => return Err(ProxyError::Protocol("request has no Host header".into())),
            _ => return Err(ProxyError::Protocol("request has multiple Host headers".into())),
        }
        let target = match request.authority() {
            Some(authority) if !request.path().is_empty() => {
                format!("http://{}{}", authority.host_header(), request.path())
            }
            Some(authority) => format!("{}:{}", authority.host(), authority.port()),
            None => request.path().to_string(),
        };
        let mut out = BytesMut::with_capacity(256);
        out.put_slice(format!("{} {} {}\r\n", request.method(), target, request.version()).as_bytes());
        Self::write_headers_and_body(&mut out, request.headers(), request.body());
        Ok(out.freeze())
    }

    fn serialize_response(&self, response: &HttpResponse) -> Result<Bytes> {
        let status = response.status();
        for required in status.required_headers() {
            if !response.headers().contains(required) {
                return Err(ProxyError::Protocol(format!(
                    "status {} requires a {} header",
                    status.code(),
                    required
                )));
            }
        }
        let mut out = BytesMut::with_capacity(256);
        out.put_slice(
            format!("{} {} {}\r\n", response.version(), status.code(), status.reason()).as_bytes(),
        );
        Self::write_headers_and_body(&mut out, response.headers(), response.body());
        Ok(out.freeze())
    }
}

/// Splits a client byte stream into parsed requests
pub struct RequestDecoder {
    registry: Arc<ProtocolRegistry>,
}

impl RequestDecoder {
    pub fn new(registry: Arc<ProtocolRegistry>) -> Self {
        Self { registry }
    }
}

impl Decoder for RequestDecoder {
    type Item = HttpRequest;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let Some(len) = framing::request_frame_len(src)? else {
            return Ok(None);
        };
        let frame = src.split_to(len);
        let codec = self.registry.select(&frame)?;
        tracing::trace!("[Codec] decoded {} byte request ({})", len, codec.version());
        codec.parse_request(&frame).map(Some)
    }
}

/// Splits a destination byte stream into parsed responses.
///
/// Callers flag HEAD requests with [`ResponseDecoder::expect_bodyless`]
/// before decoding the matching response.
pub struct ResponseDecoder {
    registry: Arc<ProtocolRegistry>,
    bodyless: bool,
}

impl ResponseDecoder {
    pub fn new(registry: Arc<ProtocolRegistry>) -> Self {
        Self {
            registry,
            bodyless: false,
        }
    }

    pub fn expect_bodyless(&mut self, bodyless: bool) {
        self.bodyless = bodyless;
    }

    fn parse(&self, frame: &[u8]) -> Result<HttpResponse> {
        let codec = self.registry.select(frame)?;
        codec.parse_response(frame)
    }
}

impl Decoder for ResponseDecoder {
    type Item = HttpResponse;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match framing::response_frame_len(src, self.bodyless)? {
            ResponseFrame::Complete(len) => {
                let frame = src.split_to(len);
                self.parse(&frame).map(Some)
            }
            ResponseFrame::Incomplete | ResponseFrame::UntilClose => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.is_empty() {
            return Ok(None);
        }
        match framing::response_frame_len(src, self.bodyless)? {
            ResponseFrame::Complete(len) => {
                let frame = src.split_to(len);
                self.parse(&frame).map(Some)
            }
            ResponseFrame::UntilClose => {
                let frame = src.split();
                self.parse(&frame).map(Some)
            }
            ResponseFrame::Incomplete => Err(ProxyError::Interrupted(
                "connection closed in the middle of a response".into(),
            )),
        }
    }
}
