//! Server-Sent Events (SSE) parsing.
//!
//! Bytes from the network go through three stages:
//! [`LineDecoder`] splits chunks into lines, [`BlockAssembler`] groups lines into
//! blank-line-terminated blocks, and [`EventParser`] turns one block into an [`Event`].

#[cfg(feature = "json")]
use crate::error::StreamError;
use bytes::BytesMut;

/// Default name of the field carrying the event payload.
pub const DEFAULT_DATA_FIELD: &str = "data";

/// Field carrying the event id (resumption token).
pub const ID_FIELD: &str = "id";

/// One parsed event block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "json", derive(serde::Serialize, serde::Deserialize))]
pub struct Event {
    /// Value of the `id` field, if the block had one.
    pub id: Option<String>,
    /// Value of the data field, or empty if the block had none.
    pub data: String,
}

impl Event {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            id: None,
            data: data.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    /// The id, if present and not blank.
    pub fn resumption_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.trim().is_empty())
    }

    /// Decode the data payload as JSON.
    #[cfg(feature = "json")]
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, StreamError> {
        serde_json::from_str(&self.data).map_err(|e| StreamError::Protocol(e.to_string()))
    }
}

/// Turns an event block into an [`Event`].
///
/// The first line whose field name matches wins; unknown fields and comment
/// lines (leading `:`) are skipped. Parsing never fails: a block with no
/// recognizable fields yields an event with empty data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventParser {
    data_field: String,
}

impl Default for EventParser {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_FIELD)
    }
}

impl EventParser {
    pub fn new(data_field: impl Into<String>) -> Self {
        Self {
            data_field: data_field.into(),
        }
    }

    pub fn data_field(&self) -> &str {
        &self.data_field
    }

    pub fn parse<S: AsRef<str>>(&self, block: &[S]) -> Event {
        let mut id = None;
        let mut data = None;

        for line in block {
            let line = line.as_ref();
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = split_field(line);
            if data.is_none() && field == self.data_field {
                data = Some(value.to_string());
            }
            if id.is_none() && field == ID_FIELD {
                id = Some(value.to_string());
            }
            if data.is_some() && id.is_some() {
                break;
            }
        }

        Event {
            id,
            data: data.unwrap_or_default(),
        }
    }
}

/// Split `field: value` at the first colon. A line without a colon is a field
/// with an empty value.
fn split_field(line: &str) -> (&str, &str) {
    match line.split_once(':') {
        Some((field, value)) => (field.trim(), value.trim()),
        None => (line.trim(), ""),
    }
}

/// Splits a byte stream into lines.
///
/// Lines end at `\n`; a trailing `\r` is dropped. Invalid UTF-8 is replaced
/// rather than rejected.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: BytesMut,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the network.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete line, if one is buffered.
    pub fn next_line(&mut self) -> Option<String> {
        let end = self.buffer.iter().position(|b| *b == b'\n')?;
        let line = self.buffer.split_to(end + 1);
        Some(decode_line(&line[..end]))
    }

    /// Flush a final line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = self.buffer.split();
        Some(decode_line(&rest))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Groups lines into event blocks.
///
/// Blank (or whitespace-only) lines end a block; runs of blank lines never
/// produce empty blocks.
#[derive(Debug, Default)]
pub struct BlockAssembler {
    lines: Vec<String>,
}

impl BlockAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns a block when the line completes one.
    pub fn push(&mut self, line: String) -> Option<Vec<String>> {
        if line.trim().is_empty() {
            return self.take();
        }
        self.lines.push(line);
        None
    }

    /// Flush the pending block at end of stream.
    pub fn finish(&mut self) -> Option<Vec<String>> {
        self.take()
    }

    fn take(&mut self) -> Option<Vec<String>> {
        if self.lines.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.lines))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id_and_data() {
        let event = EventParser::default().parse(&["id: 42", "data: hello"]);
        assert_eq!(event, Event::new("hello").with_id("42"));
    }

    #[test]
    fn test_first_data_line_wins() {
        let event = EventParser::default().parse(&["data: a", "data: b"]);
        assert_eq!(event.data, "a");
        assert_eq!(event.id, None);
    }

    #[test]
    fn test_value_after_first_colon() {
        let event = EventParser::default().parse(&[r#"data: {"url":"http://x"}"#]);
        assert_eq!(event.data, r#"{"url":"http://x"}"#);
    }

    #[test]
    fn test_unknown_fields_and_comments_ignored() {
        let event = EventParser::default().parse(&[
            ": keep-alive",
            "event: update",
            "retry: 3000",
            "data:payload",
            "id:7",
        ]);
        assert_eq!(event, Event::new("payload").with_id("7"));
    }

    #[test]
    fn test_field_name_must_match_exactly() {
        let event = EventParser::default().parse(&["database: x", "idle: y"]);
        assert_eq!(event, Event::default());
    }

    #[test]
    fn test_missing_data_is_empty() {
        let event = EventParser::default().parse(&["id: 9"]);
        assert_eq!(event.data, "");
        assert_eq!(event.id(), Some("9"));
    }

    #[test]
    fn test_malformed_block_yields_empty_event() {
        let event = EventParser::default().parse(&["garbage", "data"]);
        assert_eq!(event, Event::new(""));
    }

    #[test]
    fn test_custom_data_field() {
        let parser = EventParser::new("payload");
        let event = parser.parse(&["data: ignored", "payload: used"]);
        assert_eq!(event.data, "used");
    }

    #[test]
    fn test_blank_id_is_not_a_resumption_id() {
        let event = EventParser::default().parse(&["id:   ", "data: x"]);
        assert_eq!(event.id(), Some(""));
        assert_eq!(event.resumption_id(), None);
    }

    #[test]
    fn test_line_decoder_across_chunks() {
        let mut decoder = LineDecoder::new();
        decoder.push(b"id: 1\r\nda");
        assert_eq!(decoder.next_line().as_deref(), Some("id: 1"));
        assert_eq!(decoder.next_line(), None);

        decoder.push(b"ta: hel");
        decoder.push(b"lo\n\n");
        assert_eq!(decoder.next_line().as_deref(), Some("data: hello"));
        assert_eq!(decoder.next_line().as_deref(), Some(""));
        assert_eq!(decoder.next_line(), None);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_line_decoder_flushes_tail() {
        let mut decoder = LineDecoder::new();
        decoder.push(b"data: tail");
        assert_eq!(decoder.next_line(), None);
        assert_eq!(decoder.finish().as_deref(), Some("data: tail"));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_line_decoder_lossy_utf8() {
        let mut decoder = LineDecoder::new();
        decoder.push(b"data: \xff\n");
        assert_eq!(decoder.next_line().as_deref(), Some("data: \u{fffd}"));
    }

    #[test]
    fn test_block_assembler() {
        let mut blocks = BlockAssembler::new();
        assert_eq!(blocks.push("".into()), None);
        assert_eq!(blocks.push("id:1".into()), None);
        assert_eq!(blocks.push("data:a".into()), None);
        assert_eq!(
            blocks.push("  ".into()),
            Some(vec!["id:1".to_string(), "data:a".to_string()])
        );
        assert_eq!(blocks.push("".into()), None);
        assert_eq!(blocks.push("data:b".into()), None);
        assert_eq!(blocks.finish(), Some(vec!["data:b".to_string()]));
        assert_eq!(blocks.finish(), None);
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_event_json() {
        #[derive(serde::Deserialize)]
        struct Tick {
            n: u32,
        }

        let tick: Tick = Event::new(r#"{"n": 5}"#).json().unwrap();
        assert_eq!(tick.n, 5);
        assert!(Event::new("not json").json::<Tick>().is_err());
    }
}
