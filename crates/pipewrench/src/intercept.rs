//! Message interception orchestrator.
//!
//! Consumes tokenizer events for one HTTP stream. Each message's head is
//! held back while its body is routed through the filter subprocess; once
//! the filter's output has been fully drained the head is emitted with a
//! recomputed `Content-Length`, followed by the filtered body, and the
//! subprocess is replaced for the next message. Messages whose
//! `Content-Type` does not match the configured pattern bypass the filter
//! and are re-emitted byte-identically.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::buffer::StreamBuffer;
use crate::channel::{ChannelState, PipeChannel, SpawnError};
use crate::parser::{Event, Head, MessageKind};
use crate::stream::PipelineError;

/// Bound on a retained start-line token (request target or reason phrase).
const START_LINE_MAX: usize = 2048;
/// Read size while draining the filter's output.
const DRAIN_CHUNK: usize = 8 * 1024;

/// `Content-Type` values are matched case-insensitively.
const CONTENT_TYPE_MATCH: glob::MatchOptions = glob::MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
pub struct InterceptConfig {
    command: String,
    content_type: Option<glob::Pattern>,
    drain_timeout: Option<Duration>,
}

impl InterceptConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            content_type: None,
            drain_timeout: None,
        }
    }

    /// Only messages whose `Content-Type` matches `pattern` are filtered;
    /// everything else passes through untouched.
    pub fn with_content_type(mut self, pattern: &str) -> Result<Self, glob::PatternError> {
        self.content_type = Some(glob::Pattern::new(pattern)?);
        Ok(self)
    }

    /// Bounds the per-message drain of the filter's output. A filter that
    /// stays silent past the deadline is killed and the stream fails.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }
}

/// State accumulated between events of a single message.
struct MessageContext {
    start_token: String,
    start_line: String,
    headers: StreamBuffer,
    body: StreamBuffer,
    splice_offset: Option<usize>,
    expect_content_type: bool,
    content_type_matched: Option<bool>,
    forward: bool,
    headers_flushed: bool,
}

impl MessageContext {
    fn new() -> Self {
        Self {
            start_token: String::new(),
            start_line: String::new(),
            headers: StreamBuffer::new(),
            body: StreamBuffer::new(),
            splice_offset: None,
            expect_content_type: false,
            content_type_matched: None,
            forward: true,
            headers_flushed: false,
        }
    }

    /// Reinitializes for the next message. Buffer storage is kept.
    fn reset(&mut self) {
        self.start_token.clear();
        self.start_line.clear();
        self.headers.clear();
        self.body.clear();
        self.splice_offset = None;
        self.expect_content_type = false;
        self.content_type_matched = None;
        self.forward = true;
        self.headers_flushed = false;
    }
}

/// Drives one HTTP stream's messages through the filter subprocess.
pub struct Interceptor<W> {
    out: W,
    channel: PipeChannel,
    content_type: Option<glob::Pattern>,
    drain_timeout: Option<Duration>,
    ctx: MessageContext,
}

impl<W: AsyncWrite + Unpin> Interceptor<W> {
    /// Spawns the first filter process up front so a bad command line fails
    /// before any input is consumed.
    pub fn new(out: W, config: InterceptConfig) -> Result<Self, SpawnError> {
        let mut channel = PipeChannel::new(config.command);
        channel.open_bidirectional()?;
        Ok(Self {
            out,
            channel,
            content_type: config.content_type,
            drain_timeout: config.drain_timeout,
            ctx: MessageContext::new(),
        })
    }

    pub async fn handle(&mut self, event: Event<'_>) -> Result<(), PipelineError> {
        match event {
            Event::Url(token) | Event::Status(token) => self.record_start_token(token),
            Event::HeaderField(name) => self.record_header_field(name),
            Event::HeaderValue(value) => self.record_header_value(value),
            Event::HeadersComplete(head) => self.finish_head(&head),
            Event::BodyChunk(chunk) => return self.handle_body_chunk(chunk).await,
            Event::MessageComplete => return self.complete_message().await,
        }
        Ok(())
    }

    fn record_start_token(&mut self, token: &[u8]) {
        let mut token = String::from_utf8_lossy(token).into_owned();
        if token.len() > START_LINE_MAX {
            let mut cut = START_LINE_MAX;
            while !token.is_char_boundary(cut) {
                cut -= 1;
            }
            token.truncate(cut);
            tracing::warn!(
                limit = START_LINE_MAX,
                "Start-line token exceeded limit and was truncated"
            );
        }
        self.ctx.start_token = token;
    }

    fn record_header_field(&mut self, name: &[u8]) {
        // First Content-Length field wins the splice slot; duplicates pass
        // through like any other header.
        if self.ctx.splice_offset.is_none() && name.eq_ignore_ascii_case(b"content-length") {
            self.ctx.splice_offset = Some(self.ctx.headers.len());
        }
        self.ctx.expect_content_type = name.eq_ignore_ascii_case(b"content-type");
        self.ctx.headers.append(name);
        self.ctx.headers.append(b": ");
    }

    fn record_header_value(&mut self, value: &[u8]) {
        if self.ctx.expect_content_type {
            self.ctx.expect_content_type = false;
            if let Some(pattern) = &self.content_type {
                let text = String::from_utf8_lossy(value);
                let matched = pattern.matches_with(text.trim(), CONTENT_TYPE_MATCH);
                self.ctx.content_type_matched = Some(matched);
            }
        }
        self.ctx.headers.append(value);
        self.ctx.headers.append(b"\r\n");
    }

    fn finish_head(&mut self, head: &Head) {
        self.ctx.start_line = match head.kind {
            MessageKind::Request => format!(
                "{} {} HTTP/1.{}\r\n",
                head.method.as_deref().unwrap_or("GET"),
                self.ctx.start_token,
                head.version_minor,
            ),
            MessageKind::Response => format!(
                "HTTP/1.{} {} {}\r\n",
                head.version_minor,
                head.status.unwrap_or(200),
                self.ctx.start_token,
            ),
        };
        self.ctx.headers.append(b"\r\n");

        // A configured pattern with no Content-Type header means bypass.
        self.ctx.forward = match (&self.content_type, self.ctx.content_type_matched) {
            (None, _) => true,
            (Some(_), Some(matched)) => matched,
            (Some(_), None) => false,
        };
        tracing::debug!(forward = self.ctx.forward, "Message head complete");
    }

    async fn handle_body_chunk(&mut self, chunk: &[u8]) -> Result<(), PipelineError> {
        if self.ctx.forward {
            self.channel.writer().write_all(chunk).await?;
        } else {
            self.flush_head_verbatim().await?;
            self.out.write_all(chunk).await?;
        }
        Ok(())
    }

    /// Emits the held-back start line and headers exactly as they arrived.
    /// Used on the bypass path, where nothing about the message changes.
    async fn flush_head_verbatim(&mut self) -> Result<(), PipelineError> {
        if self.ctx.headers_flushed {
            return Ok(());
        }
        self.out.write_all(self.ctx.start_line.as_bytes()).await?;
        self.ctx.headers.write_all(&mut self.out).await?;
        self.ctx.headers_flushed = true;
        Ok(())
    }

    async fn complete_message(&mut self) -> Result<(), PipelineError> {
        if self.ctx.forward {
            self.complete_forwarded().await?;
        } else {
            // A body-less message never flushed its head on a body chunk.
            self.flush_head_verbatim().await?;
            self.out.flush().await?;
        }
        self.ctx.reset();
        Ok(())
    }

    async fn complete_forwarded(&mut self) -> Result<(), PipelineError> {
        self.channel.send_end_of_input();
        self.drain_filter_output().await?;
        let body_length = self.ctx.body.len();
        tracing::debug!(body_length, "Drained filter output");

        self.out.write_all(self.ctx.start_line.as_bytes()).await?;
        if let Some(offset) = self.ctx.splice_offset {
            // Everything before the stale Content-Length field, then the
            // recomputed field, then the rest with the stale line dropped.
            self.ctx.headers.write_first_n(&mut self.out, offset).await?;
            let field = format!("Content-Length: {body_length}\r\n");
            self.out.write_all(field.as_bytes()).await?;
            let stale_line = self
                .ctx
                .headers
                .as_slice()
                .iter()
                .position(|&b| b == b'\n')
                .map(|i| i + 1)
                .unwrap_or(self.ctx.headers.len());
            self.ctx.headers.skip_first(stale_line);
        }
        self.ctx.headers.write_all(&mut self.out).await?;
        self.ctx.body.write_all(&mut self.out).await?;
        self.out.flush().await?;

        self.channel.reset().await?;
        Ok(())
    }

    async fn drain_filter_output(&mut self) -> Result<(), PipelineError> {
        let mut chunk = [0u8; DRAIN_CHUNK];
        loop {
            let read = match self.drain_timeout {
                Some(limit) => {
                    match tokio::time::timeout(limit, self.channel.reader().read(&mut chunk)).await
                    {
                        Ok(result) => result?,
                        Err(_) => {
                            self.channel.kill().await?;
                            return Err(PipelineError::DrainTimeout);
                        }
                    }
                }
                None => self.channel.reader().read(&mut chunk).await?,
            };
            if read == 0 {
                return Ok(());
            }
            self.ctx.body.append(&chunk[..read]);
        }
    }

    /// Flushes the output and reaps the filter process. Called once the
    /// input stream is exhausted.
    pub async fn finish(&mut self) -> Result<(), PipelineError> {
        self.out.flush().await?;
        if self.channel.state() != ChannelState::Closed {
            self.channel.close().await?;
        }
        Ok(())
    }

    /// Best-effort teardown after a failed stream: flush what was already
    /// written, then kill and reap the filter process. Kill rather than
    /// close, so a filter ignoring end-of-input cannot hang the error path.
    pub async fn abort(&mut self) {
        let _ = self.out.flush().await;
        if self.channel.state() != ChannelState::Closed {
            if let Err(e) = self.channel.kill().await {
                tracing::warn!(error = %e, "Failed to reap filter process after stream failure");
            }
        }
    }

    /// Read-only view of the filter channel, for lifecycle checks.
    pub fn channel(&self) -> &PipeChannel {
        &self.channel
    }

    pub fn into_output(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::MessageKind;
    use std::io::Cursor;

    fn request_head(method: &str) -> Head {
        Head {
            kind: MessageKind::Request,
            method: Some(method.to_string()),
            status: None,
            version_minor: 1,
        }
    }

    async fn run_events(
        config: InterceptConfig,
        events: Vec<Event<'_>>,
    ) -> Result<Vec<u8>, PipelineError> {
        let mut interceptor = Interceptor::new(Cursor::new(Vec::new()), config)?;
        for event in events {
            interceptor.handle(event).await?;
        }
        interceptor.finish().await?;
        Ok(interceptor.into_output().into_inner())
    }

    #[tokio::test]
    async fn forwarded_message_gets_a_recomputed_content_length() {
        // tr strips both l's, shrinking the body from 5 to 3 bytes.
        let output = run_events(
            InterceptConfig::new("tr -d l"),
            vec![
                Event::Url(b"/x"),
                Event::HeaderField(b"Content-Length"),
                Event::HeaderValue(b"5"),
                Event::HeaderField(b"Host"),
                Event::HeaderValue(b"example"),
                Event::HeadersComplete(request_head("POST")),
                Event::BodyChunk(b"hello"),
                Event::MessageComplete,
            ],
        )
        .await
        .unwrap();
        assert_eq!(
            output,
            b"POST /x HTTP/1.1\r\nContent-Length: 3\r\nHost: example\r\n\r\nheo"
        );
    }

    #[tokio::test]
    async fn non_matching_content_type_bypasses_byte_identically() {
        let output = run_events(
            InterceptConfig::new("tr -d l")
                .with_content_type("image/*")
                .unwrap(),
            vec![
                Event::Url(b"/x"),
                Event::HeaderField(b"Content-Type"),
                Event::HeaderValue(b"text/plain"),
                Event::HeaderField(b"Content-Length"),
                Event::HeaderValue(b"5"),
                Event::HeadersComplete(request_head("POST")),
                Event::BodyChunk(b"hello"),
                Event::MessageComplete,
            ],
        )
        .await
        .unwrap();
        assert_eq!(
            output,
            b"POST /x HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello"
        );
    }

    #[tokio::test]
    async fn matching_content_type_is_case_insensitive() {
        let output = run_events(
            InterceptConfig::new("tr a-z A-Z")
                .with_content_type("text/*")
                .unwrap(),
            vec![
                Event::Url(b"/x"),
                Event::HeaderField(b"Content-Type"),
                Event::HeaderValue(b"TEXT/Plain"),
                Event::HeaderField(b"Content-Length"),
                Event::HeaderValue(b"2"),
                Event::HeadersComplete(request_head("POST")),
                Event::BodyChunk(b"hi"),
                Event::MessageComplete,
            ],
        )
        .await
        .unwrap();
        assert_eq!(
            output,
            b"POST /x HTTP/1.1\r\nContent-Type: TEXT/Plain\r\nContent-Length: 2\r\n\r\nHI"
        );
    }

    #[tokio::test]
    async fn pattern_with_no_content_type_header_bypasses() {
        let output = run_events(
            InterceptConfig::new("tr -d l")
                .with_content_type("text/*")
                .unwrap(),
            vec![
                Event::Url(b"/x"),
                Event::HeaderField(b"Content-Length"),
                Event::HeaderValue(b"5"),
                Event::HeadersComplete(request_head("POST")),
                Event::BodyChunk(b"hello"),
                Event::MessageComplete,
            ],
        )
        .await
        .unwrap();
        assert_eq!(output, b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");
    }

    #[tokio::test]
    async fn body_less_bypassed_message_is_not_swallowed() {
        let output = run_events(
            InterceptConfig::new("cat").with_content_type("image/*").unwrap(),
            vec![
                Event::Url(b"/health"),
                Event::HeaderField(b"Host"),
                Event::HeaderValue(b"example"),
                Event::HeadersComplete(request_head("GET")),
                Event::MessageComplete,
            ],
        )
        .await
        .unwrap();
        assert_eq!(output, b"GET /health HTTP/1.1\r\nHost: example\r\n\r\n");
    }

    #[tokio::test]
    async fn forwarding_without_content_length_inserts_nothing() {
        let output = run_events(
            InterceptConfig::new("cat"),
            vec![
                Event::Status(b"OK"),
                Event::HeaderField(b"Content-Type"),
                Event::HeaderValue(b"text/plain"),
                Event::HeadersComplete(Head {
                    kind: MessageKind::Response,
                    method: None,
                    status: Some(200),
                    version_minor: 1,
                }),
                Event::BodyChunk(b"streamed"),
                Event::MessageComplete,
            ],
        )
        .await
        .unwrap();
        assert_eq!(
            output,
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nstreamed"
        );
    }

    #[tokio::test]
    async fn consecutive_messages_each_get_a_fresh_filter() {
        let mut interceptor =
            Interceptor::new(Cursor::new(Vec::new()), InterceptConfig::new("cat")).unwrap();
        let events = |body: &'static [u8], len: &'static [u8]| {
            vec![
                Event::Url(b"/m"),
                Event::HeaderField(b"Content-Length"),
                Event::HeaderValue(len),
                Event::HeadersComplete(request_head("POST")),
                Event::BodyChunk(body),
                Event::MessageComplete,
            ]
        };
        for event in events(b"one", b"3") {
            interceptor.handle(event).await.unwrap();
        }
        let first_pid = interceptor.channel.child_id().unwrap();
        for event in events(b"four", b"4") {
            interceptor.handle(event).await.unwrap();
        }
        let second_pid = interceptor.channel.child_id().unwrap();
        assert_ne!(first_pid, second_pid);

        interceptor.finish().await.unwrap();
        let output = interceptor.into_output().into_inner();
        assert_eq!(
            output,
            b"POST /m HTTP/1.1\r\nContent-Length: 3\r\n\r\none\
              POST /m HTTP/1.1\r\nContent-Length: 4\r\n\r\nfour"
        );
    }

    #[tokio::test]
    async fn silent_filter_trips_the_drain_timeout() {
        let err = run_events(
            InterceptConfig::new("sleep 30").with_drain_timeout(Duration::from_millis(50)),
            vec![
                Event::Url(b"/x"),
                Event::HeaderField(b"Content-Length"),
                Event::HeaderValue(b"0"),
                Event::HeadersComplete(request_head("POST")),
                Event::MessageComplete,
            ],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::DrainTimeout));
    }
}
