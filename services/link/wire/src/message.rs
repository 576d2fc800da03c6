//! Request and response messages: an envelope plus an HTTP-like text body.
//!
//! Body layout:
//!
//! ```text
//! REQUEST <target>\r\n        or   RESPONSE <status>\r\n
//! name: value\r\n             (zero or more header lines)
//! \r\n
//! <opaque content>
//! ```

use crate::header::{Envelope, Flags, PeerId, ENVELOPE_SIZE};
use crate::headers::{has_line_break, parse_header_line, Headers, DESTINATION_ID, SOURCE_ID};
use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};

const REQUEST_START: &str = "REQUEST ";
const RESPONSE_START: &str = "RESPONSE ";
const CRLF: &[u8] = b"\r\n";

/// Well-known status codes
pub mod status {
    /// Success
    pub const OK: u16 = 200;
    /// Unroutable request path or unknown destination peer
    pub const NOT_FOUND: u16 = 404;
    /// The responder failed to handle the request
    pub const INTERNAL_ERROR: u16 = 500;
}

/// A request for a target path on another peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Binary envelope
    pub envelope: Envelope,
    /// Target path, e.g. `/scene/load`
    pub target: String,
    /// Header lines
    pub headers: Headers,
    /// Opaque content
    pub content: Bytes,
    finalized: bool,
}

impl Request {
    /// Create a request to `destination` for `target`
    pub fn new(destination: PeerId, target: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            envelope: Envelope::new(PeerId::UNASSIGNED, destination),
            target: target.into(),
            headers: Headers::new(),
            content: content.into(),
            finalized: false,
        }
    }

    /// Add a header line; pairs that are not a valid header line are skipped
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    /// Set the request status code
    pub fn with_status(mut self, status_code: u16) -> Self {
        self.envelope.status_code = status_code;
        self
    }

    /// Sending peer
    pub fn source(&self) -> PeerId {
        self.envelope.source
    }

    /// Receiving peer
    pub fn destination(&self) -> PeerId {
        self.envelope.destination
    }

    /// Whether the message has been stamped for sending
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_slice(REQUEST_START.as_bytes());
        buf.put_slice(self.target.as_bytes());
        buf.put_slice(CRLF);
        encode_headers(&self.headers, buf);
        buf.put_slice(&self.content);
    }

    fn parse_body(envelope: Envelope, body: Bytes) -> Result<Self, WireError> {
        let (start, headers, content) = split_body(body)?;
        let target = start
            .strip_prefix(REQUEST_START)
            .ok_or(WireError::Malformed("request start line"))?;

        Ok(Self {
            envelope,
            target: target.to_string(),
            headers,
            content,
            finalized: true,
        })
    }
}

/// A response answering exactly one prior request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Binary envelope
    pub envelope: Envelope,
    /// Header lines
    pub headers: Headers,
    /// Opaque content
    pub content: Bytes,
    finalized: bool,
}

impl Response {
    /// Create a response to `destination`
    pub fn new(destination: PeerId, status_code: u16, content: impl Into<Bytes>) -> Self {
        let mut envelope = Envelope::new(PeerId::UNASSIGNED, destination);
        envelope.status_code = status_code;
        envelope.flags |= Flags::RESPONSE;
        Self {
            envelope,
            headers: Headers::new(),
            content: content.into(),
            finalized: false,
        }
    }

    /// Create the response to `request`, echoing its message ID
    pub fn reply_to(request: &Request, status_code: u16, content: impl Into<Bytes>) -> Self {
        let mut response = Self::new(request.source(), status_code, content);
        response.envelope.message_id = request.envelope.message_id;
        response
    }

    /// Add a header line; pairs that are not a valid header line are skipped
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    /// Response status code
    pub fn status_code(&self) -> u16 {
        self.envelope.status_code
    }

    /// Sending peer
    pub fn source(&self) -> PeerId {
        self.envelope.source
    }

    /// Receiving peer
    pub fn destination(&self) -> PeerId {
        self.envelope.destination
    }

    /// Whether the message has been stamped for sending
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_slice(RESPONSE_START.as_bytes());
        buf.put_slice(self.envelope.status_code.to_string().as_bytes());
        buf.put_slice(CRLF);
        encode_headers(&self.headers, buf);
        buf.put_slice(&self.content);
    }

    fn parse_body(envelope: Envelope, body: Bytes) -> Result<Self, WireError> {
        let (start, headers, content) = split_body(body)?;
        start
            .strip_prefix(RESPONSE_START)
            .and_then(|code| code.trim().parse::<u16>().ok())
            .ok_or(WireError::Malformed("response start line"))?;

        Ok(Self {
            envelope,
            headers,
            content,
            finalized: true,
        })
    }
}

/// Either variant, as produced by the stream decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Request variant
    Request(Request),
    /// Response variant
    Response(Response),
}

impl Message {
    /// Binary envelope
    pub fn envelope(&self) -> &Envelope {
        match self {
            Message::Request(request) => &request.envelope,
            Message::Response(response) => &response.envelope,
        }
    }

    /// Mutable binary envelope
    pub fn envelope_mut(&mut self) -> &mut Envelope {
        match self {
            Message::Request(request) => &mut request.envelope,
            Message::Response(response) => &mut response.envelope,
        }
    }

    fn headers_mut(&mut self) -> &mut Headers {
        match self {
            Message::Request(request) => &mut request.headers,
            Message::Response(response) => &mut response.headers,
        }
    }

    fn finalized_mut(&mut self) -> &mut bool {
        match self {
            Message::Request(request) => &mut request.finalized,
            Message::Response(response) => &mut response.finalized,
        }
    }

    /// Whether the message has been stamped for sending
    pub fn is_finalized(&self) -> bool {
        match self {
            Message::Request(request) => request.finalized,
            Message::Response(response) => response.finalized,
        }
    }

    /// Stamp the message for sending. Happens exactly once per message.
    ///
    /// Sets the source, optionally a fresh message ID, mirrors the envelope
    /// addressing into the `sourceID`/`destinationID` header lines and records
    /// the body length. Targets or header lines that would break the line
    /// structure of the body are rejected.
    pub fn finalize(&mut self, source: PeerId, message_id: Option<u32>) -> Result<(), WireError> {
        if self.is_finalized() {
            return Err(WireError::AlreadyFinalized);
        }
        self.check_lines()?;

        let is_response = matches!(self, Message::Response(_));
        let destination = self.envelope().destination;
        let headers = self.headers_mut();
        headers.set(SOURCE_ID, source.to_string());
        headers.set(DESTINATION_ID, destination.to_string());
        let body_len = self.encode_body().len();

        let envelope = self.envelope_mut();
        envelope.set_content_length(body_len)?;
        envelope.source = source;
        if let Some(id) = message_id {
            envelope.message_id = id;
        }
        envelope.flags.set(Flags::RESPONSE, is_response);

        *self.finalized_mut() = true;
        Ok(())
    }

    fn check_lines(&self) -> Result<(), WireError> {
        let headers = match self {
            Message::Request(request) => {
                if has_line_break(&request.target) {
                    return Err(WireError::Malformed("line break in target"));
                }
                &request.headers
            }
            Message::Response(response) => &response.headers,
        };
        if headers.iter().all(|line| line.is_valid()) {
            Ok(())
        } else {
            Err(WireError::Malformed("invalid header line"))
        }
    }

    fn encode_body(&self) -> BytesMut {
        let mut body = BytesMut::new();
        match self {
            Message::Request(request) => request.encode_body(&mut body),
            Message::Response(response) => response.encode_body(&mut body),
        }
        body
    }

    /// Serialize envelope and body into one contiguous buffer.
    ///
    /// Fails only for bodies too large for the 32-bit length field.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let body = self.encode_body();
        let mut envelope = *self.envelope();
        envelope.set_content_length(body.len())?;

        let mut buf = BytesMut::with_capacity(ENVELOPE_SIZE + body.len());
        envelope.encode(&mut buf);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Build a message from a parsed envelope and its complete body
    pub fn decode(envelope: Envelope, body: Bytes) -> Result<Self, WireError> {
        if envelope.is_response() {
            Response::parse_body(envelope, body).map(Message::Response)
        } else {
            Request::parse_body(envelope, body).map(Message::Request)
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

fn encode_headers(headers: &Headers, buf: &mut BytesMut) {
    for line in headers.iter() {
        buf.put_slice(line.name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(line.value.as_bytes());
        buf.put_slice(CRLF);
    }
    buf.put_slice(CRLF);
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(CRLF.len()).position(|window| window == CRLF)
}

fn next_line(body: &mut Bytes) -> Result<String, WireError> {
    let end = find_crlf(body).ok_or(WireError::Malformed("unterminated line"))?;
    let line = body.split_to(end);
    let _ = body.split_to(CRLF.len());
    String::from_utf8(line.to_vec()).map_err(|_| WireError::Malformed("line is not utf-8"))
}

/// Split a body into its start line, header lines and remaining content
fn split_body(mut body: Bytes) -> Result<(String, Headers, Bytes), WireError> {
    let start = next_line(&mut body)?;
    let mut headers = Headers::new();
    loop {
        let line = next_line(&mut body)?;
        if line.is_empty() {
            break;
        }
        headers.push(parse_header_line(&line).ok_or(WireError::Malformed("header line"))?);
    }

    Ok((start, headers, body))
}
