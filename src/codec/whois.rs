//! WHOIS-over-HTTP request shaping and response framing
//!
//! Outbound requests are plain HTTP/1.1 with the `Host` header (and request
//! path) rewritten for the current target. Inbound bytes are framed into one
//! complete response per HTTP rules: Content-Length, chunked transfer coding,
//! or header-only.

use std::borrow::Cow;

use bytes::{Bytes, BytesMut};

use super::{CodecError, DecodeResult};

/// For each top level domain we probe `prefix.tld`.
pub const HOST_PREFIX: &str = "whois.nic.";

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 1 << 20;

/// WHOIS host for a target, e.g. `whois.nic.dev` for target `dev`.
pub fn probe_host(target: &str) -> String {
    format!("{HOST_PREFIX}{target}")
}

/// Build the outbound request for `host`.
pub fn build_request(host: &str, path: &str) -> Bytes {
    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         User-Agent: registry-prober\r\n\
         Accept: */*\r\n\
         Connection: close\r\n\
         \r\n"
    );
    Bytes::from(request)
}

/// A complete HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Whether this response redirects the probe to another location.
    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }

    /// The redirect target, when present.
    pub fn location(&self) -> Option<&str> {
        self.header("location")
    }
}

/// Decode at most one complete response from `buf`.
///
/// Nothing is consumed until status line, headers, and body have all
/// arrived, so delivery chunking does not matter.
pub fn decode(buf: &mut BytesMut) -> DecodeResult<HttpResponse> {
    let Some(header_end) = find_subsequence(buf, b"\r\n\r\n") else {
        if buf.len() > MAX_HEADER_BYTES {
            return Err(CodecError::MessageTooLarge(buf.len()));
        }
        return Ok(None);
    };
    let body_start = header_end + 4;

    let head = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| CodecError::MalformedHeader("non-ASCII header block".into()))?;

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let (status, reason) = parse_status_line(status_line)?;

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CodecError::MalformedHeader(line.to_string()))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let chunked = headers
        .iter()
        .any(|(name, value)| {
            name.eq_ignore_ascii_case("transfer-encoding")
                && value.to_ascii_lowercase().contains("chunked")
        });

    let (body, consumed) = if chunked {
        match decode_chunked_body(&buf[body_start..])? {
            Some((body, used)) => (body, body_start + used),
            None => return Ok(None),
        }
    } else if let Some(length) = content_length(&headers)? {
        if length > MAX_BODY_BYTES {
            return Err(CodecError::MessageTooLarge(length));
        }
        if buf.len() < body_start + length {
            return Ok(None);
        }
        (buf[body_start..body_start + length].to_vec(), body_start + length)
    } else {
        // No framing headers: the response ends with its header block.
        (Vec::new(), body_start)
    };

    let _ = buf.split_to(consumed);

    Ok(Some(HttpResponse {
        status,
        reason,
        headers,
        body,
    }))
}

fn parse_status_line(line: &str) -> Result<(u16, String), CodecError> {
    let malformed = || CodecError::MalformedStatusLine(line.to_string());

    let mut parts = line.splitn(3, ' ');
    let version = parts.next().ok_or_else(malformed)?;
    if !version.starts_with("HTTP/1.") {
        return Err(malformed());
    }

    let status: u16 = parts
        .next()
        .and_then(|code| code.parse().ok())
        .filter(|code| (100..=599).contains(code))
        .ok_or_else(malformed)?;
    let reason = parts.next().unwrap_or_default().to_string();

    Ok((status, reason))
}

fn content_length(headers: &[(String, String)]) -> Result<Option<usize>, CodecError> {
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length") {
            let length = value
                .parse()
                .map_err(|_| CodecError::MalformedHeader(format!("Content-Length: {value}")))?;
            return Ok(Some(length));
        }
    }
    Ok(None)
}

/// Parse a chunked body from `data`, returning the body bytes and how many
/// input bytes they spanned, or `None` if the terminating chunk has not
/// arrived yet.
fn decode_chunked_body(data: &[u8]) -> Result<Option<(Vec<u8>, usize)>, CodecError> {
    let mut body = Vec::new();
    let mut cursor = 0;

    loop {
        let Some(line_end) = find_subsequence(&data[cursor..], b"\r\n") else {
            return incomplete(data.len());
        };
        let size_line = std::str::from_utf8(&data[cursor..cursor + line_end])
            .map_err(|_| CodecError::MalformedChunk("non-ASCII chunk size".into()))?;

        // chunk extensions after ';' are ignored
        let size_token = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_token, 16)
            .map_err(|_| CodecError::MalformedChunk(format!("bad chunk size {size_token:?}")))?;

        cursor += line_end + 2;

        if size == 0 {
            // last chunk; trailers are not expected from probed servers
            if data.len() < cursor + 2 {
                return incomplete(data.len());
            }
            if &data[cursor..cursor + 2] != b"\r\n" {
                return Err(CodecError::MalformedChunk("missing final CRLF".into()));
            }
            return Ok(Some((body, cursor + 2)));
        }

        if body.len() + size > MAX_BODY_BYTES {
            return Err(CodecError::MessageTooLarge(body.len() + size));
        }
        if data.len() < cursor + size + 2 {
            return incomplete(data.len());
        }

        body.extend_from_slice(&data[cursor..cursor + size]);
        if &data[cursor + size..cursor + size + 2] != b"\r\n" {
            return Err(CodecError::MalformedChunk("chunk not CRLF-terminated".into()));
        }
        cursor += size + 2;
    }
}

fn incomplete(buffered: usize) -> Result<Option<(Vec<u8>, usize)>, CodecError> {
    if buffered > MAX_BODY_BYTES + MAX_HEADER_BYTES {
        return Err(CodecError::MessageTooLarge(buffered));
    }
    Ok(None)
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
