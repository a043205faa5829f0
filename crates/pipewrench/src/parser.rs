//! Incremental HTTP/1.x tokenizer.
//!
//! Buffers the head section of each message until the blank-line terminator,
//! parses it with `httparse`, and emits structural events. Body bytes are
//! framed (content-length, chunked, or read-to-end-of-stream) and handed out
//! as they arrive without being buffered here. Event slices are valid only
//! until the next `advance` call; consumers copy out what they keep.
//!
//! Request vs response framing is auto-detected from the start line. The
//! tokenizer stops consuming at each message boundary and reinitializes
//! itself for the next message.

/// Upper bound on an accumulated head section.
const MAX_HEAD: usize = 64 * 1024;
/// Upper bound on a chunk-size or trailer line.
const MAX_LINE: usize = 1024;
/// Header fields handed to httparse per message.
const MAX_HEADERS: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed HTTP head: {0}")]
    Malformed(#[from] httparse::Error),
    #[error("head section ended unexpectedly")]
    TruncatedHead,
    #[error("head section exceeds {MAX_HEAD} bytes")]
    HeadTooLarge,
    #[error("invalid Content-Length header")]
    InvalidContentLength,
    #[error("invalid chunked framing")]
    InvalidChunk,
    #[error("connection upgrades are not supported")]
    UpgradeUnsupported,
    #[error("stream ended mid-message")]
    UnexpectedEof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

/// Start-line facts available once the head section has been parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    pub kind: MessageKind,
    pub method: Option<String>,
    pub status: Option<u16>,
    pub version_minor: u8,
}

/// Structural events emitted as bytes arrive.
///
/// Borrowed slices point into the tokenizer's head buffer or the caller's
/// input window and are invalidated by the next `advance` call.
#[derive(Debug, PartialEq, Eq)]
pub enum Event<'a> {
    /// Request target from the start line.
    Url(&'a [u8]),
    /// Reason phrase from a response status line.
    Status(&'a [u8]),
    HeaderField(&'a [u8]),
    HeaderValue(&'a [u8]),
    HeadersComplete(Head),
    BodyChunk(&'a [u8]),
    MessageComplete,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Head,
    FixedBody { remaining: u64 },
    EofBody,
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
}

enum Framing {
    None,
    Length(u64),
    Chunked,
    ToEof,
}

pub struct Tokenizer {
    state: State,
    head: Vec<u8>,
    line: Vec<u8>,
    pending_reset: bool,
}

impl Tokenizer {
    pub fn new() -> Self {
        Self {
            state: State::Head,
            head: Vec::new(),
            line: Vec::new(),
            pending_reset: false,
        }
    }

    /// Consumes bytes from `input` and returns how many were consumed plus
    /// the events they produced. Stops at the first message boundary; the
    /// caller re-invokes with the rest of its window. A zero-length input
    /// finalizes the stream: it completes an end-of-stream-framed body, is a
    /// no-op between messages, and is an error mid-message.
    pub fn advance<'a>(
        &'a mut self,
        input: &'a [u8],
    ) -> Result<(usize, Vec<Event<'a>>), ParseError> {
        if self.pending_reset {
            self.head.clear();
            self.line.clear();
            self.pending_reset = false;
        }

        let mut events = Vec::new();

        if input.is_empty() {
            self.finalize(&mut events)?;
            return Ok((0, events));
        }

        let mut consumed = 0;

        // The head section is handled before the body loop, so all head
        // buffer mutation is finished before any event borrows it.
        if matches!(self.state, State::Head) {
            let before = self.head.len();
            self.head.extend_from_slice(input);
            let Some(end) = find_head_end(&self.head, before.saturating_sub(3)) else {
                if self.head.len() > MAX_HEAD {
                    return Err(ParseError::HeadTooLarge);
                }
                return Ok((input.len(), events));
            };
            // Bytes past the blank line belong to the body; leave them
            // unconsumed in the caller's window.
            let overshoot = self.head.len() - end;
            consumed = input.len() - overshoot;
            self.head.truncate(end);

            let (head, framing) = parse_head(&self.head, &mut events)?;
            tracing::debug!(?head, "Parsed message head");
            events.push(Event::HeadersComplete(head));
            match framing {
                Framing::None | Framing::Length(0) => {
                    events.push(Event::MessageComplete);
                    self.state = State::Head;
                    self.pending_reset = true;
                    return Ok((consumed, events));
                }
                Framing::Length(n) => self.state = State::FixedBody { remaining: n },
                Framing::Chunked => self.state = State::ChunkSize,
                Framing::ToEof => self.state = State::EofBody,
            }
        }

        while consumed < input.len() {
            match self.state {
                // Transitions back to Head always return at the message
                // boundary, so this arm is never reached mid-call.
                State::Head => break,
                State::FixedBody { remaining } => {
                    let avail = input.len() - consumed;
                    let take = remaining.min(avail as u64) as usize;
                    events.push(Event::BodyChunk(&input[consumed..consumed + take]));
                    consumed += take;
                    let remaining = remaining - take as u64;
                    if remaining == 0 {
                        events.push(Event::MessageComplete);
                        self.state = State::Head;
                        self.pending_reset = true;
                        return Ok((consumed, events));
                    }
                    self.state = State::FixedBody { remaining };
                }
                State::EofBody => {
                    events.push(Event::BodyChunk(&input[consumed..]));
                    consumed = input.len();
                }
                State::ChunkSize => {
                    if take_line(&mut self.line, input, &mut consumed)? {
                        let size = parse_chunk_size(&self.line)?;
                        self.line.clear();
                        self.state = if size == 0 {
                            State::Trailers
                        } else {
                            State::ChunkData { remaining: size }
                        };
                    }
                }
                State::ChunkData { remaining } => {
                    let avail = input.len() - consumed;
                    let take = remaining.min(avail as u64) as usize;
                    if take > 0 {
                        events.push(Event::BodyChunk(&input[consumed..consumed + take]));
                        consumed += take;
                    }
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        State::ChunkDataEnd
                    } else {
                        State::ChunkData { remaining }
                    };
                }
                State::ChunkDataEnd => {
                    if take_line(&mut self.line, input, &mut consumed)? {
                        if !(self.line.is_empty() || self.line == b"\r") {
                            return Err(ParseError::InvalidChunk);
                        }
                        self.line.clear();
                        self.state = State::ChunkSize;
                    }
                }
                State::Trailers => {
                    if take_line(&mut self.line, input, &mut consumed)? {
                        let blank = self.line.is_empty() || self.line == b"\r";
                        self.line.clear();
                        if blank {
                            events.push(Event::MessageComplete);
                            self.state = State::Head;
                            self.pending_reset = true;
                            return Ok((consumed, events));
                        }
                        // Trailer fields are consumed and dropped.
                    }
                }
            }
        }

        Ok((consumed, events))
    }

    fn finalize<'e>(&mut self, events: &mut Vec<Event<'e>>) -> Result<(), ParseError> {
        match self.state {
            State::Head if self.head.is_empty() => Ok(()),
            State::EofBody => {
                events.push(Event::MessageComplete);
                self.state = State::Head;
                self.pending_reset = true;
                Ok(())
            }
            _ => Err(ParseError::UnexpectedEof),
        }
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Finds the end of the head section (the byte after the blank line),
/// scanning from `from`. Accepts CRLF and bare-LF line endings.
fn find_head_end(buf: &[u8], from: usize) -> Option<usize> {
    for i in from..buf.len() {
        if buf[i] != b'\n' {
            continue;
        }
        let rest = &buf[i + 1..];
        if rest.starts_with(b"\n") {
            return Some(i + 2);
        }
        if rest.starts_with(b"\r\n") {
            return Some(i + 3);
        }
    }
    None
}

/// Appends bytes up to (excluding) the next `\n` into `line`, consuming the
/// terminator. Returns true once the line is complete.
fn take_line(line: &mut Vec<u8>, input: &[u8], consumed: &mut usize) -> Result<bool, ParseError> {
    while *consumed < input.len() {
        let byte = input[*consumed];
        *consumed += 1;
        if byte == b'\n' {
            return Ok(true);
        }
        if line.len() >= MAX_LINE {
            return Err(ParseError::InvalidChunk);
        }
        line.push(byte);
    }
    Ok(false)
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let size_part = line.split(|&b| b == b';').next().unwrap_or(b"");
    let text = std::str::from_utf8(size_part)
        .map_err(|_| ParseError::InvalidChunk)?
        .trim();
    if text.is_empty() {
        return Err(ParseError::InvalidChunk);
    }
    u64::from_str_radix(text, 16).map_err(|_| ParseError::InvalidChunk)
}

struct HeaderFacts {
    content_length: Option<u64>,
    chunked: bool,
    upgrade: bool,
}

/// Parses a complete head section, pushing start-line and header events,
/// and returns the start-line facts plus the body framing that follows.
fn parse_head<'b>(
    raw: &'b [u8],
    events: &mut Vec<Event<'b>>,
) -> Result<(Head, Framing), ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];

    if raw.starts_with(b"HTTP/") {
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(raw)? {
            httparse::Status::Complete(_) => {}
            httparse::Status::Partial => return Err(ParseError::TruncatedHead),
        }
        let status = response.code.ok_or(ParseError::TruncatedHead)?;
        let version_minor = response.version.ok_or(ParseError::TruncatedHead)?;
        events.push(Event::Status(response.reason.unwrap_or("").as_bytes()));
        let facts = scan_headers(response.headers, events)?;
        if facts.upgrade || status == 101 {
            return Err(ParseError::UpgradeUnsupported);
        }
        let head = Head {
            kind: MessageKind::Response,
            method: None,
            status: Some(status),
            version_minor,
        };
        let framing = if (100..200).contains(&status) || status == 204 || status == 304 {
            Framing::None
        } else if facts.chunked {
            Framing::Chunked
        } else if let Some(n) = facts.content_length {
            Framing::Length(n)
        } else {
            Framing::ToEof
        };
        Ok((head, framing))
    } else {
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(raw)? {
            httparse::Status::Complete(_) => {}
            httparse::Status::Partial => return Err(ParseError::TruncatedHead),
        }
        let method = request.method.ok_or(ParseError::TruncatedHead)?;
        let path = request.path.ok_or(ParseError::TruncatedHead)?;
        let version_minor = request.version.ok_or(ParseError::TruncatedHead)?;
        events.push(Event::Url(path.as_bytes()));
        let facts = scan_headers(request.headers, events)?;
        if facts.upgrade || method.eq_ignore_ascii_case("CONNECT") {
            return Err(ParseError::UpgradeUnsupported);
        }
        let head = Head {
            kind: MessageKind::Request,
            method: Some(method.to_string()),
            status: None,
            version_minor,
        };
        let framing = if facts.chunked {
            Framing::Chunked
        } else if let Some(n) = facts.content_length {
            Framing::Length(n)
        } else {
            Framing::None
        };
        Ok((head, framing))
    }
}

fn scan_headers<'b>(
    headers: &[httparse::Header<'b>],
    events: &mut Vec<Event<'b>>,
) -> Result<HeaderFacts, ParseError> {
    let mut facts = HeaderFacts {
        content_length: None,
        chunked: false,
        upgrade: false,
    };
    for header in headers {
        events.push(Event::HeaderField(header.name.as_bytes()));
        events.push(Event::HeaderValue(header.value));

        if header.name.eq_ignore_ascii_case("content-length") {
            // First occurrence wins; later duplicates pass through untouched.
            if facts.content_length.is_none() {
                let text = std::str::from_utf8(header.value)
                    .map_err(|_| ParseError::InvalidContentLength)?;
                let n = text
                    .trim()
                    .parse()
                    .map_err(|_| ParseError::InvalidContentLength)?;
                facts.content_length = Some(n);
            }
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            if contains_token(header.value, "chunked") {
                facts.chunked = true;
            }
        } else if header.name.eq_ignore_ascii_case("upgrade") {
            facts.upgrade = true;
        } else if header.name.eq_ignore_ascii_case("connection")
            && contains_token(header.value, "upgrade")
        {
            facts.upgrade = true;
        }
    }
    Ok(facts)
}

fn contains_token(value: &[u8], token: &str) -> bool {
    let Ok(text) = std::str::from_utf8(value) else {
        return false;
    };
    text.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
}
