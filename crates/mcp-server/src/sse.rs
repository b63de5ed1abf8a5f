//! Server-Sent Events (SSE) encoding and decoding.
//!
//! Pure, no-I/O SSE implementation for the streaming transport.
//!
//! ## SSE Format
//!
//! SSE messages consist of fields separated by newlines:
//! ```text
//! id: event-123
//! event: message
//! data: {"jsonrpc": "2.0", ...}
//!
//! ```
//!
//! Messages are terminated by a blank line (two newlines).

/// A Server-Sent Event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseEvent {
    /// Event ID for `Last-Event-ID` resumption.
    pub id: Option<String>,
    /// Event type (defaults to "message" if not specified).
    pub event: Option<String>,
    /// Event data (can be multiline).
    pub data: String,
    /// Retry interval in milliseconds (optional).
    pub retry: Option<u32>,
}

impl SseEvent {
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            id: None,
            event: None,
            data: data.into(),
            retry: None,
        }
    }

    pub fn with_id(id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            event: None,
            data: data.into(),
            retry: None,
        }
    }

    pub fn builder() -> SseEventBuilder {
        SseEventBuilder::new()
    }
}

#[derive(Default)]
pub struct SseEventBuilder {
    id: Option<String>,
    event: Option<String>,
    data: Option<String>,
    retry: Option<u32>,
}

impl SseEventBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn retry(mut self, retry_ms: u32) -> Self {
        self.retry = Some(retry_ms);
        self
    }

    /// # Panics
    /// Panics if data was never set.
    pub fn build(self) -> SseEvent {
        SseEvent {
            id: self.id,
            event: self.event,
            data: self.data.expect("SseEvent requires data"),
            retry: self.retry,
        }
    }

    pub fn try_build(self) -> Option<SseEvent> {
        Some(SseEvent {
            id: self.id,
            event: self.event,
            data: self.data?,
            retry: self.retry,
        })
    }
}

/// SSE encoder for converting events to wire format.
pub struct SseEncoder;

impl SseEncoder {
    pub fn encode(event: &SseEvent) -> Vec<u8> {
        let mut output = String::new();

        if let Some(ref id) = event.id {
            output.push_str("id: ");
            output.push_str(id);
            output.push('\n');
        }

        if let Some(ref event_type) = event.event {
            output.push_str("event: ");
            output.push_str(event_type);
            output.push('\n');
        }

        if let Some(retry) = event.retry {
            output.push_str("retry: ");
            output.push_str(&retry.to_string());
            output.push('\n');
        }

        for line in event.data.lines() {
            output.push_str("data: ");
            output.push_str(line);
            output.push('\n');
        }

        output.push('\n');
        output.into_bytes()
    }

    pub fn encode_string(event: &SseEvent) -> String {
        String::from_utf8(Self::encode(event)).expect("SSE encoding produces valid UTF-8")
    }

    /// Encode a comment (used for keepalive pings).
    pub fn encode_comment(comment: &str) -> Vec<u8> {
        let mut output = String::new();
        for line in comment.lines() {
            output.push_str(": ");
            output.push_str(line);
            output.push('\n');
        }
        output.push('\n');
        output.into_bytes()
    }

    pub fn encode_keepalive() -> Vec<u8> {
        b":\n\n".to_vec()
    }
}

/// SSE parser for decoding events from wire format.
pub struct SseParser {
    buffer: String,
    current_id: Option<String>,
    current_event: Option<String>,
    current_data: Vec<String>,
    current_retry: Option<u32>,
}

impl SseParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            current_id: None,
            current_event: None,
            current_data: Vec::new(),
            current_retry: None,
        }
    }

    /// Feed data to the parser and extract any complete events.
    pub fn feed(&mut self, data: &[u8]) -> Vec<SseEvent> {
        if let Ok(s) = std::str::from_utf8(data) {
            self.buffer.push_str(s);
        } else {
            return vec![];
        }

        let mut events = Vec::new();

        while let Some(newline_pos) = self.buffer.find('\n') {
            let line = self.buffer[..newline_pos].to_string();
            self.buffer = self.buffer[newline_pos + 1..].to_string();

            if line.is_empty() {
                if let Some(event) = self.emit_event() {
                    events.push(event);
                }
            } else if line.starts_with(':') {
                // comment, ignored
            } else if let Some(colon_pos) = line.find(':') {
                let field = &line[..colon_pos];
                let value = line[colon_pos + 1..].trim_start();

                match field {
                    "id" => self.current_id = Some(value.to_string()),
                    "event" => self.current_event = Some(value.to_string()),
                    "data" => self.current_data.push(value.to_string()),
                    "retry" => {
                        if let Ok(ms) = value.parse() {
                            self.current_retry = Some(ms);
                        }
                    }
                    _ => {}
                }
            } else {
                match line.as_str() {
                    "id" => self.current_id = Some(String::new()),
                    "event" => self.current_event = Some(String::new()),
                    "data" => self.current_data.push(String::new()),
                    _ => {}
                }
            }
        }

        events
    }

    fn emit_event(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() {
            self.current_id = None;
            self.current_event = None;
            self.current_retry = None;
            return None;
        }

        let data = self.current_data.join("\n");
        let event = SseEvent {
            id: self.current_id.take(),
            event: self.current_event.take(),
            data,
            retry: self.current_retry.take(),
        };
        self.current_data.clear();
        Some(event)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.current_id = None;
        self.current_event = None;
        self.current_data.clear();
        self.current_retry = None;
    }

    /// The last event id seen, for `Last-Event-ID` reconnection.
    pub fn last_event_id(&self) -> Option<&str> {
        self.current_id.as_deref()
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a resumption event id: `{sequence}-{low bits of a nanosecond
/// timestamp}`, unique enough within a single process's SSE stream.
pub fn generate_event_id(sequence: u64) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    format!("{sequence}-{:x}", timestamp & 0xFFFF_FFFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_event_has_no_id_or_type() {
        let event = SseEvent::message("Hello, world!");
        assert_eq!(event.data, "Hello, world!");
        assert!(event.id.is_none());
        assert!(event.event.is_none());
    }

    #[test]
    fn builder_sets_every_field() {
        let event = SseEvent::builder()
            .id("evt-1")
            .event("notification")
            .data(r#"{"type": "test"}"#)
            .retry(3000)
            .build();

        assert_eq!(event.id, Some("evt-1".to_string()));
        assert_eq!(event.event, Some("notification".to_string()));
        assert_eq!(event.retry, Some(3000));
    }

    #[test]
    fn encodes_simple_message() {
        let event = SseEvent::message("hello");
        assert_eq!(SseEncoder::encode_string(&event), "data: hello\n\n");
    }

    #[test]
    fn encodes_full_event() {
        let event = SseEvent::builder()
            .id("evt-1")
            .event("update")
            .data("line1\nline2")
            .retry(5000)
            .build();

        let encoded = SseEncoder::encode_string(&event);
        assert_eq!(
            encoded,
            "id: evt-1\nevent: update\nretry: 5000\ndata: line1\ndata: line2\n\n"
        );
    }

    #[test]
    fn encodes_keepalive_comment() {
        assert_eq!(SseEncoder::encode_keepalive(), b":\n\n");
    }

    #[test]
    fn parses_multiline_data() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: line1\ndata: line2\ndata: line3\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line1\nline2\nline3");
    }

    #[test]
    fn parses_across_incremental_feeds() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"id: 1\n").is_empty());
        assert!(parser.feed(b"data: partial\n").is_empty());
        let events = parser.feed(b"\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, Some("1".to_string()));
        assert_eq!(events[0].data, "partial");
    }

    #[test]
    fn parser_ignores_comment_lines() {
        let mut parser = SseParser::new();
        let events = parser.feed(b": this is a comment\ndata: actual data\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "actual data");
    }

    #[test]
    fn round_trips_through_encode_and_parse() {
        let original = SseEvent::builder()
            .id("round-trip-1")
            .event("test")
            .data("multiline\ndata\nhere")
            .retry(1000)
            .build();
        let encoded = SseEncoder::encode(&original);
        let mut parser = SseParser::new();
        let events = parser.feed(&encoded);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], original);
    }

    #[test]
    fn event_ids_are_distinct_across_sequence_numbers() {
        let id1 = generate_event_id(1);
        let id2 = generate_event_id(2);
        assert!(id1.starts_with("1-"));
        assert!(id2.starts_with("2-"));
        assert_ne!(id1, id2);
    }
}
