//! Server-Sent-Events frame decoder for the chat streaming endpoint.
//!
//! Wire format: UTF-8 text, events separated by a blank line (`\n\n`), each
//! event made of `key: value` lines. The payload of a `data:` line is JSON
//! (`{"token": ...}`, `{"error": ...}`, `{"event": "done"}`) or the literal
//! `[DONE]`.
//!
//! [`FrameDecoder`] is the synchronous core: feed it byte chunks of any size
//! and pull typed events. [`EventStream`] drives it from an HTTP body with
//! cancellation and an idle timeout.

use serde::Deserialize;
use std::fmt::Display;
use std::time::Duration;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::StreamFailure;

/// Literal data payload that terminates a stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Event separator.
pub const FRAME_SEPARATOR: &str = "\n\n";

/// One decoded protocol event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A piece of assistant text to append.
    Token(String),
    /// The stream failed; no further events follow.
    Error(StreamFailure),
    /// The server finished the response; no further events follow.
    Done,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Token(_))
    }
}

#[derive(Debug, Deserialize)]
struct FramePayload {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    event: Option<String>,
}

/// Decode the text of one complete event (without its trailing blank line).
///
/// `Ok(None)` means the event carried nothing actionable (comments, no data
/// line, empty token). `Err` means the JSON payload was malformed.
pub fn parse_frame(frame: &str) -> Result<Option<StreamEvent>, serde_json::Error> {
    let mut data: Vec<&str> = Vec::new();
    for line in frame.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data.is_empty() {
        return Ok(None);
    }

    let payload = data.join("\n");
    if payload.trim() == DONE_SENTINEL {
        return Ok(Some(StreamEvent::Done));
    }

    let parsed: FramePayload = serde_json::from_str(&payload)?;
    if let Some(err) = parsed.error.filter(|v| !v.is_null()) {
        let text = match err {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        return Ok(Some(StreamEvent::Error(StreamFailure::Server(text))));
    }
    if let Some(token) = parsed.token.filter(|t| !t.is_empty()) {
        return Ok(Some(StreamEvent::Token(token)));
    }
    if parsed.event.as_deref() == Some("done") {
        return Ok(Some(StreamEvent::Done));
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// FrameDecoder
// ---------------------------------------------------------------------------

/// Incremental, chunk-boundary-safe frame decoder.
///
/// Bytes of a multi-byte character split across chunks are held back until
/// the rest arrives. Once a terminal event (`Done` or `Error`) has been
/// returned the decoder yields nothing more.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Undecoded tail of an incomplete UTF-8 sequence.
    pending: Vec<u8>,
    /// Decoded text not yet split into frames.
    buffer: String,
    finished: bool,
    skipped: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a terminal event has been yielded.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of malformed frames skipped so far.
    pub fn skipped_frames(&self) -> usize {
        self.skipped
    }

    /// Append one chunk of the response body.
    pub fn push(&mut self, chunk: &[u8]) {
        if self.finished {
            return;
        }
        self.pending.extend_from_slice(chunk);

        let mut start = 0;
        while start < self.pending.len() {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    start = self.pending.len();
                }
                Err(e) => {
                    let valid = start + e.valid_up_to();
                    self.buffer
                        .push_str(&String::from_utf8_lossy(&self.pending[start..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            start = valid + bad;
                        }
                        None => {
                            // Incomplete sequence at the end: wait for more bytes.
                            start = valid;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);
    }

    /// Pull the next event out of the buffered text, if a complete one exists.
    pub fn next_event(&mut self) -> Option<StreamEvent> {
        while !self.finished {
            let end = self.buffer.find(FRAME_SEPARATOR)?;
            let frame = self.buffer[..end].to_string();
            self.buffer.drain(..end + FRAME_SEPARATOR.len());

            match parse_frame(&frame) {
                Ok(Some(event)) => {
                    if event.is_terminal() {
                        self.finished = true;
                        self.buffer.clear();
                        self.pending.clear();
                    }
                    return Some(event);
                }
                Ok(None) => continue,
                Err(e) => {
                    self.skipped += 1;
                    warn!(error = %e, frame = %frame, "skipping malformed stream frame");
                }
            }
        }
        None
    }

    /// Signal end of body. Any incomplete trailing frame is discarded.
    pub fn finish(&mut self) {
        if !self.pending.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending).into_owned();
            self.buffer.push_str(&tail);
            self.pending.clear();
        }
        if !self.buffer.trim().is_empty() {
            debug!(bytes = self.buffer.len(), "discarding incomplete trailing frame");
        }
        self.buffer.clear();
    }
}

// ---------------------------------------------------------------------------
// EventStream
// ---------------------------------------------------------------------------

/// Outcome of waiting for one body chunk.
enum Read<B> {
    Chunk(B),
    Failed(String),
    End,
    Idle(Duration),
    Cancelled,
}

async fn next_chunk<S, B, E>(body: &mut S, idle: Option<Duration>) -> Read<B>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    E: Display,
{
    let item = match idle {
        Some(limit) => match tokio::time::timeout(limit, body.next()).await {
            Ok(item) => item,
            Err(_) => return Read::Idle(limit),
        },
        None => body.next().await,
    };
    match item {
        Some(Ok(chunk)) => Read::Chunk(chunk),
        Some(Err(e)) => Read::Failed(e.to_string()),
        None => Read::End,
    }
}

/// Lazy, single-pass event sequence over one streaming response body.
///
/// `next()` returns `None` when the stream is over: after a terminal event,
/// at end of body, or after cancellation (check [`EventStream::was_cancelled`]).
/// Cancellation stops the sequence silently; events already returned are not
/// affected.
pub struct EventStream<S> {
    body: S,
    decoder: FrameDecoder,
    cancel: CancellationToken,
    idle_timeout: Option<Duration>,
    cancelled: bool,
    ended: bool,
}

impl<S, B, E> EventStream<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    pub fn new(body: S, cancel: CancellationToken) -> Self {
        Self {
            body,
            decoder: FrameDecoder::new(),
            cancel,
            idle_timeout: None,
            cancelled: false,
            ended: false,
        }
    }

    /// Fail the stream if no chunk arrives within `limit`.
    pub fn with_idle_timeout(mut self, limit: Duration) -> Self {
        self.idle_timeout = Some(limit);
        self
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn decoder(&self) -> &FrameDecoder {
        &self.decoder
    }

    pub async fn next(&mut self) -> Option<StreamEvent> {
        loop {
            if self.cancelled || self.cancel.is_cancelled() {
                self.cancelled = true;
                return None;
            }
            if let Some(event) = self.decoder.next_event() {
                return Some(event);
            }
            if self.ended || self.decoder.is_finished() {
                return None;
            }

            let idle = self.idle_timeout;
            let read = {
                let body = &mut self.body;
                let cancel = &self.cancel;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Read::Cancelled,
                    r = next_chunk(body, idle) => r,
                }
            };

            match read {
                Read::Chunk(chunk) => self.decoder.push(chunk.as_ref()),
                Read::End => {
                    self.decoder.finish();
                    self.ended = true;
                }
                Read::Failed(detail) => {
                    self.ended = true;
                    return Some(StreamEvent::Error(StreamFailure::ConnectionLost(detail)));
                }
                Read::Idle(limit) => {
                    self.ended = true;
                    return Some(StreamEvent::Error(StreamFailure::IdleTimeout(limit)));
                }
                Read::Cancelled => {
                    debug!("stream read cancelled");
                    self.cancelled = true;
                    return None;
                }
            }
        }
    }

    /// Adapt into a `Stream` of events.
    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> {
        futures_util::stream::unfold(self, |mut events| async move {
            events.next().await.map(|event| (event, events))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn decode_chunks(chunks: &[&[u8]]) -> Vec<StreamEvent> {
        let mut d = FrameDecoder::new();
        let mut out = Vec::new();
        for c in chunks {
            d.push(c);
            while let Some(ev) = d.next_event() {
                out.push(ev);
            }
        }
        d.finish();
        out
    }

    fn token(s: &str) -> StreamEvent {
        StreamEvent::Token(s.to_string())
    }

    #[rstest]
    #[case("data: {\"token\":\"Hi\"}", Some(StreamEvent::Token("Hi".into())))]
    #[case("data: [DONE]", Some(StreamEvent::Done))]
    #[case("data:  [DONE] ", Some(StreamEvent::Done))]
    #[case("data: {\"event\":\"done\"}", Some(StreamEvent::Done))]
    #[case("data: {\"error\":\"rate limited\"}", Some(StreamEvent::Error(StreamFailure::Server("rate limited".into()))))]
    #[case("data: {\"error\":{\"code\":429}}", Some(StreamEvent::Error(StreamFailure::Server("{\"code\":429}".into()))))]
    #[case("data: {\"token\":\"\"}", None)]
    #[case("data: {\"token\":\" \"}", Some(StreamEvent::Token(" ".into())))]
    #[case(": keep-alive", None)]
    #[case("event: message", None)]
    #[case("data:{\"token\":\"x\"}", Some(StreamEvent::Token("x".into())))]
    #[case("data: {\"token\":\"x\"}\r", Some(StreamEvent::Token("x".into())))]
    #[case("data: {}", None)]
    fn test_parse_frame(#[case] frame: &str, #[case] expected: Option<StreamEvent>) {
        assert_eq!(parse_frame(frame).expect("well-formed"), expected);
    }

    #[test]
    fn test_parse_frame_multiline_data_joined() {
        let frame = "data: {\"token\":\ndata: \"ab\"}";
        assert_eq!(parse_frame(frame).unwrap(), Some(token("ab")));
    }

    #[test]
    fn test_parse_frame_malformed_json_errors() {
        assert!(parse_frame("data: {not json").is_err());
        assert!(parse_frame("data: 42").is_err());
    }

    #[test]
    fn test_decoder_ordered_tokens_then_done() {
        let body = b"data: {\"token\":\"A\"}\n\ndata: {\"token\":\"B\"}\n\ndata: {\"token\":\"C\"}\n\ndata: [DONE]\n\n";
        assert_eq!(
            decode_chunks(&[body]),
            vec![token("A"), token("B"), token("C"), StreamEvent::Done]
        );
    }

    #[test]
    fn test_decoder_handles_frame_split_across_chunks() {
        let events = decode_chunks(&[b"data: {\"tok", b"en\":\"Hi\"}\n", b"\ndata: [DO", b"NE]\n\n"]);
        assert_eq!(events, vec![token("Hi"), StreamEvent::Done]);
    }

    #[test]
    fn test_decoder_multibyte_split() {
        let body = "data: {\"token\":\"héllo 🚀\"}\n\n".as_bytes();
        let chunks: Vec<&[u8]> = body.chunks(1).collect();
        assert_eq!(decode_chunks(&chunks), vec![token("héllo 🚀")]);
    }

    #[test]
    fn test_decoder_skips_malformed_frame_and_continues() {
        let body = b"data: {\"token\":\"A\"}\n\ndata: {oops\n\ndata: {\"token\":\"B\"}\n\n";
        let mut d = FrameDecoder::new();
        d.push(body);
        assert_eq!(d.next_event(), Some(token("A")));
        assert_eq!(d.next_event(), Some(token("B")));
        assert_eq!(d.next_event(), None);
        assert_eq!(d.skipped_frames(), 1);
    }

    #[test]
    fn test_decoder_stops_after_done() {
        let events = decode_chunks(&[b"data: [DONE]\n\ndata: {\"token\":\"late\"}\n\n"]);
        assert_eq!(events, vec![StreamEvent::Done]);
    }

    #[test]
    fn test_decoder_stops_after_error() {
        let events = decode_chunks(&[b"data: {\"error\":\"boom\"}\n\ndata: {\"token\":\"late\"}\n\n"]);
        assert_eq!(events, vec![StreamEvent::Error(StreamFailure::Server("boom".into()))]);
    }

    #[test]
    fn test_decoder_discards_incomplete_trailing_frame() {
        let events = decode_chunks(&[b"data: {\"token\":\"A\"}\n\ndata: {\"token\":\"B\"}"]);
        assert_eq!(events, vec![token("A")]);
    }

    #[test]
    fn test_decoder_replaces_invalid_utf8() {
        let mut d = FrameDecoder::new();
        d.push(b"data: {\"token\":\"a\xffb\"}\n\n");
        assert_eq!(d.next_event(), Some(token("a\u{FFFD}b")));
    }

    fn body_of(chunks: Vec<&'static [u8]>) -> impl Stream<Item = Result<&'static [u8], std::io::Error>> + Unpin {
        tokio_stream::iter(chunks.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn test_event_stream_end_of_body_without_done() {
        let mut events = EventStream::new(
            body_of(vec![b"data: {\"token\":\"A\"}\n\n"]),
            CancellationToken::new(),
        );
        assert_eq!(events.next().await, Some(token("A")));
        assert_eq!(events.next().await, None);
        assert!(!events.was_cancelled());
    }

    #[tokio::test]
    async fn test_event_stream_read_failure_is_connection_lost() {
        let body = tokio_stream::iter(vec![
            Ok(b"data: {\"token\":\"A\"}\n\n".as_slice()),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ]);
        let mut events = EventStream::new(body, CancellationToken::new());
        assert_eq!(events.next().await, Some(token("A")));
        assert!(matches!(
            events.next().await,
            Some(StreamEvent::Error(StreamFailure::ConnectionLost(_)))
        ));
        assert_eq!(events.next().await, None);
    }

    #[tokio::test]
    async fn test_event_stream_cancel_is_silent() {
        let cancel = CancellationToken::new();
        let body = body_of(vec![b"data: {\"token\":\"A\"}\n\n"]).chain(tokio_stream::pending());
        let mut events = EventStream::new(body, cancel.clone());
        assert_eq!(events.next().await, Some(token("A")));
        cancel.cancel();
        assert_eq!(events.next().await, None);
        assert!(events.was_cancelled());
    }

    #[tokio::test]
    async fn test_event_stream_idle_timeout() {
        let body = tokio_stream::pending::<Result<&'static [u8], std::io::Error>>();
        let limit = Duration::from_millis(50);
        let mut events = EventStream::new(body, CancellationToken::new()).with_idle_timeout(limit);
        assert_eq!(
            events.next().await,
            Some(StreamEvent::Error(StreamFailure::IdleTimeout(limit)))
        );
        assert_eq!(events.next().await, None);
    }

    #[tokio::test]
    async fn test_into_stream_collects() {
        let events: Vec<_> = EventStream::new(
            body_of(vec![b"data: {\"token\":\"x\"}\n\ndata: [DONE]\n\n"]),
            CancellationToken::new(),
        )
        .into_stream()
        .collect()
        .await;
        assert_eq!(events, vec![token("x"), StreamEvent::Done]);
    }
}
