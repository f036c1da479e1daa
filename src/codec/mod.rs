//! Protocol codecs
//!
//! Bit-exact encoding and incremental decoding for the two probed wire
//! protocols. Decoders work over a [`BytesMut`] accumulation buffer and only
//! consume bytes once a complete message is available, so they are
//! independent of how the transport chunks its delivery.

pub mod epp;
pub mod whois;

use std::fmt;

use bytes::BytesMut;

use crate::Protocol;

/// Result type alias for decode operations
pub type DecodeResult<T> = Result<Option<T>, CodecError>;

/// Errors raised while framing or parsing a protocol message.
///
/// Every variant is classified as a PROTOCOL_ERROR by the orchestrator.
#[derive(Debug)]
pub enum CodecError {
    /// EPP frame header declared a length smaller than the header itself
    BadFrameLength(u32),

    /// EPP frame body is not valid UTF-8
    InvalidUtf8(std::str::Utf8Error),

    /// HTTP status line could not be parsed
    MalformedStatusLine(String),

    /// HTTP header line could not be parsed
    MalformedHeader(String),

    /// Chunked transfer coding violation
    MalformedChunk(String),

    /// A sane size limit was exceeded before a full message arrived
    MessageTooLarge(usize),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::BadFrameLength(len) => {
                write!(f, "declared EPP frame length {} is shorter than the header", len)
            }
            CodecError::InvalidUtf8(err) => write!(f, "frame body is not valid UTF-8: {}", err),
            CodecError::MalformedStatusLine(line) => {
                write!(f, "malformed HTTP status line: {:?}", line)
            }
            CodecError::MalformedHeader(line) => write!(f, "malformed HTTP header: {:?}", line),
            CodecError::MalformedChunk(msg) => write!(f, "malformed chunked body: {}", msg),
            CodecError::MessageTooLarge(size) => {
                write!(f, "message exceeds size limit ({} bytes buffered)", size)
            }
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::InvalidUtf8(err) => Some(err),
            _ => None,
        }
    }
}

/// A complete inbound message, parsed per the protocol's framing rules.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Epp(epp::EppReply),
    Http(whois::HttpResponse),
}

/// Decode at most one complete message from `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. Consumed bytes are removed
/// from the buffer only when a full message was framed.
pub fn decode(protocol: Protocol, buf: &mut BytesMut) -> DecodeResult<InboundMessage> {
    match protocol {
        Protocol::Epp => Ok(epp::decode(buf)?.map(InboundMessage::Epp)),
        Protocol::Whois => Ok(whois::decode(buf)?.map(InboundMessage::Http)),
    }
}
