//! Line protocol of the push stream
//!
//! ```text
//! event: chat          <- type of the next data line
//! id: m42              <- resumption cursor
//! retry: 5000          <- next reconnect delay, in ms
//! data: {"text":"hi"}  <- payload (JSON, or a raw string)
//! ```

use crate::traits::*;
use serde_json::Value;
use std::time::Duration;

/// Splits a byte stream into lines, carrying partial lines across chunks
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed
    ///
    /// Lines are split on `\n`; a trailing `\r` is removed. Bytes after the
    /// last newline stay buffered for the next chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let mut line = &self.pending[start..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            lines.push(String::from_utf8_lossy(line).into_owned());
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// Bytes waiting for their newline
    pub fn remainder(&self) -> &[u8] {
        &self.pending
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// One meaningful line of the stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamLine {
    Data(String),
    Event(String),
    Id(String),
    Retry(Duration),
}

/// Recognise a protocol line; anything else (comments, blanks, unknown
/// fields, malformed retry values) yields `None`
pub fn parse_line(line: &str) -> Option<StreamLine> {
    if let Some(data) = line.strip_prefix("data: ") {
        Some(StreamLine::Data(data.to_string()))
    } else if let Some(event) = line.strip_prefix("event: ") {
        Some(StreamLine::Event(event.trim().to_string()))
    } else if let Some(id) = line.strip_prefix("id: ") {
        Some(StreamLine::Id(id.trim().to_string()))
    } else if let Some(retry) = line.strip_prefix("retry: ") {
        retry
            .trim()
            .parse::<u64>()
            .ok()
            .map(|ms| StreamLine::Retry(Duration::from_millis(ms)))
    } else {
        None
    }
}

/// What a line means to the adapter
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Message(Message),
    Id(String),
    Retry(Duration),
}

/// Stateful parser applying `event:` lines to the following `data:` line
#[derive(Debug, Default)]
pub struct StreamParser {
    pending_event: Option<String>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, line: &str) -> Option<StreamItem> {
        match parse_line(line)? {
            StreamLine::Event(event) => {
                self.pending_event = Some(event);
                None
            }
            StreamLine::Id(id) => Some(StreamItem::Id(id)),
            StreamLine::Retry(delay) => Some(StreamItem::Retry(delay)),
            StreamLine::Data(data) => {
                let event = self.pending_event.take();
                Some(StreamItem::Message(decode_data(&data, event)))
            }
        }
    }

    pub fn reset(&mut self) {
        self.pending_event = None;
    }
}

/// JSON payloads keep their own fields; a preceding `event:` fills in a
/// missing type. Raw strings become the `data` of a typed message.
fn decode_data(data: &str, event: Option<String>) -> Message {
    let parsed = serde_json::from_str::<Value>(data)
        .ok()
        .and_then(|value| Message::from_value(value).ok());

    match parsed {
        Some(mut message) => {
            if let Some(event) = event {
                if message.kind.is_none() || message.kind.as_deref() == Some("message") {
                    message.kind = Some(event);
                }
            }
            message
        }
        None => Message::new(
            event.unwrap_or_else(|| "message".to_string()),
            Value::String(data.to_string()),
        ),
    }
}
