//! Stream chunk parsing for the upstream chat API.
//!
//! The upstream response body is a server-sent-events stream:
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hel"}}]}
//!
//! data: {"choices":[{"delta":{"content":"lo"}}]}
//!
//! : keep-alive
//! data: [DONE]
//! ```
//!
//! [`lines_from_bytes`] turns the raw body into lines regardless of how the
//! transport split them, and [`decode_events`] turns those lines into a lazy,
//! finite sequence of [`StreamEvent`]s that always ends with exactly one
//! [`StreamEvent::Done`] unless the upstream reports an error.
//!
//! Lines that do not conform (blank, comment, foreign SSE fields, unparsable
//! JSON) are logged and skipped. They never end the stream.

use crate::aggregator::ToolCallFragment;
use crate::types::ChatChunk;
use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::time::Duration;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;

/// Lines of an upstream response body, without trailing newlines.
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Decoded events of one upstream turn.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// One decoded event of the upstream stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A fragment of assistant text
    ContentDelta(String),
    /// Partial tool calls carried by a single chunk
    ToolCallDelta(Vec<ToolCallFragment>),
    /// End of the turn
    Done,
}

/// Stateful line decoder.
///
/// Some providers only send the call id on the first fragment of a call and
/// identify later fragments by their `index`. The parser remembers the last id
/// seen per index and stamps it onto id-less fragments, so downstream
/// accumulation can key on id alone.
#[derive(Debug, Default)]
pub struct StreamChunkParser {
    ids_by_index: HashMap<u32, String>,
}

impl StreamChunkParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one line.
    ///
    /// Returns zero or more events. A chunk carrying an `error` object becomes
    /// [`Error::Upstream`]; every other non-conforming line yields nothing.
    pub fn parse_line(&mut self, line: &str) -> Result<Vec<StreamEvent>> {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            return Ok(Vec::new());
        }

        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            if line.starts_with(':') {
                log::trace!("Skipping SSE comment: {}", line);
            } else {
                log::debug!("Skipping non-data line: {}", line);
            }
            return Ok(Vec::new());
        };

        let payload = payload.trim();
        if payload == DONE_SENTINEL {
            return Ok(vec![StreamEvent::Done]);
        }

        let chunk: ChatChunk = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                log::warn!("Skipping unparsable stream chunk ({}): {}", e, payload);
                return Ok(Vec::new());
            }
        };

        if let Some(error) = chunk.error {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(Error::upstream(message));
        }

        let mut events = Vec::new();
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                events.push(StreamEvent::ContentDelta(content));
            }

            let Some(deltas) = choice.delta.tool_calls else {
                continue;
            };

            let fragments: Vec<ToolCallFragment> = deltas
                .into_iter()
                .map(|delta| {
                    let index = delta.index.unwrap_or(0);
                    let id = match delta.id.filter(|id| !id.is_empty()) {
                        Some(id) => {
                            self.ids_by_index.insert(index, id.clone());
                            id
                        }
                        None => self.ids_by_index.get(&index).cloned().unwrap_or_default(),
                    };
                    let (name, arguments) = delta
                        .function
                        .map(|f| (f.name.unwrap_or_default(), f.arguments.unwrap_or_default()))
                        .unwrap_or_default();
                    ToolCallFragment { id, name, arguments }
                })
                .collect();

            if !fragments.is_empty() {
                events.push(StreamEvent::ToolCallDelta(fragments));
            }
        }

        Ok(events)
    }
}

/// Longest upstream line kept; longer lines are dropped.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Newline framing for the upstream body.
///
/// Unlike a strict UTF-8 line codec, a bad line never fails the stream:
/// invalid UTF-8 is decoded lossily and lines over the length limit are
/// discarded up to the next newline.
#[derive(Debug)]
pub struct SseLineCodec {
    max_length: usize,
    next_index: usize,
    discarding: bool,
}

impl Default for SseLineCodec {
    fn default() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }
}

impl SseLineCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(1),
            next_index: 0,
            discarding: false,
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    match std::str::from_utf8(raw) {
        Ok(line) => line.to_string(),
        Err(e) => {
            log::warn!("Upstream line is not valid UTF-8 ({}), decoding lossily", e);
            String::from_utf8_lossy(raw).into_owned()
        }
    }
}

impl Decoder for SseLineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> std::io::Result<Option<String>> {
        loop {
            let read_to = buf.len().min(self.max_length.saturating_add(1));
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| offset + self.next_index);

            match (self.discarding, newline) {
                (true, Some(end)) => {
                    buf.advance(end + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(end)) => {
                    self.next_index = 0;
                    let line = buf.split_to(end + 1);
                    return Ok(Some(decode_line(&line[..end])));
                }
                (false, None) if buf.len() > self.max_length => {
                    log::warn!(
                        "Dropping upstream line longer than {} bytes",
                        self.max_length
                    );
                    self.discarding = true;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> std::io::Result<Option<String>> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if self.discarding || buf.is_empty() {
            self.discarding = false;
            buf.clear();
            return Ok(None);
        }
        let line = buf.split_to(buf.len());
        Ok(Some(decode_line(&line)))
    }
}

/// Split a chunked byte stream into lines.
///
/// Lines may span any number of transport chunks. A final line without a
/// trailing newline is still yielded. Only transport failures end the stream.
pub fn lines_from_bytes<S, B, E>(body: S) -> LineStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: Buf + Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
{
    let reader = StreamReader::new(body.map_err(std::io::Error::other));
    let lines = FramedRead::new(reader, SseLineCodec::new())
        .map_err(|e| Error::upstream(format!("response stream interrupted: {}", e)));
    Box::pin(lines)
}

/// Fail a line stream that goes quiet for longer than `idle`.
///
/// The stream ends with one upstream error after the stall.
pub fn with_idle_timeout(lines: LineStream, idle: Duration) -> LineStream {
    Box::pin(stream::unfold(Some(lines), move |state| async move {
        let mut lines = state?;
        match tokio::time::timeout(idle, lines.next()).await {
            Ok(Some(item)) => Some((item, Some(lines))),
            Ok(None) => None,
            Err(_) => {
                log::warn!("Upstream stream stalled for {:?}", idle);
                Some((
                    Err(Error::upstream(format!("no data from upstream for {:?}", idle))),
                    None,
                ))
            }
        }
    }))
}

struct DecodeState {
    lines: LineStream,
    parser: StreamChunkParser,
    pending: VecDeque<StreamEvent>,
    finished: bool,
}

/// Decode a line stream into [`StreamEvent`]s.
///
/// The output ends right after the first `Done`. If the transport closes
/// without a `[DONE]` sentinel, a `Done` is synthesized so every successful
/// turn ends the same way. Errors end the stream without a `Done`.
pub fn decode_events<S>(lines: S) -> EventStream
where
    S: Stream<Item = Result<String>> + Send + 'static,
{
    let state = DecodeState {
        lines: Box::pin(lines),
        parser: StreamChunkParser::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }

            match state.lines.next().await {
                Some(Ok(line)) => match state.parser.parse_line(&line) {
                    Ok(events) => {
                        for event in events {
                            let done = event == StreamEvent::Done;
                            state.pending.push_back(event);
                            if done {
                                state.finished = true;
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                },
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(e), state));
                }
                None => {
                    log::warn!("Upstream stream ended without [DONE]");
                    state.finished = true;
                    state.pending.push_back(StreamEvent::Done);
                }
            }
        }
    }))
}
