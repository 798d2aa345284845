// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Incremental SSE event parser.
//
// Feed raw upstream bytes in, get complete events out. The parser
// never waits for more than one event worth of input: every complete
// line is processed as soon as its newline arrives, and an event is
// emitted at the blank line that terminates it. A partial event left
// in the buffer when the upstream closes is discarded.

use super::types::SseEvent;

#[derive(Debug, Default)]
pub struct SseParser {
    // Raw bytes buffered until a newline; lines are decoded whole so a
    // multibyte character split across reads survives.
    buffer: Vec<u8>,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk of bytes, returning every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            self.process_line(&line, &mut events);
        }
        events
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        // Blank line: dispatch the accumulated event, if it has data.
        if line.is_empty() {
            if !self.data_lines.is_empty() {
                events.push(SseEvent {
                    event: self.event.take(),
                    data: self.data_lines.join("\n"),
                });
            } else {
                self.event = None;
            }
            self.data_lines.clear();
            return;
        }

        // Comment lines.
        if line.starts_with(':') {
            return;
        }

        if let Some(value) = line.strip_prefix("event:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            self.event = (!value.is_empty()).then(|| value.to_string());
            return;
        }

        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            self.data_lines.push(value.to_string());
        }
        // Unknown fields are ignored, per the SSE spec.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_str(parser: &mut SseParser, s: &str) -> Vec<SseEvent> {
        parser.push(s.as_bytes())
    }

    #[test]
    fn single_event_terminated_by_blank_line() {
        let mut parser = SseParser::new();
        let events = push_str(&mut parser, "data: {\"x\":1}\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: None,
                data: "{\"x\":1}".to_string()
            }]
        );
    }

    #[test]
    fn crlf_line_endings_are_accepted() {
        let mut parser = SseParser::new();
        let events = push_str(&mut parser, "data: hello\r\n\r\n");
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn event_type_line_is_captured() {
        let mut parser = SseParser::new();
        let events = push_str(&mut parser, "event: update\ndata: payload\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: Some("update".to_string()),
                data: "payload".to_string()
            }]
        );
    }

    #[test]
    fn multiple_data_lines_join_with_newlines() {
        let mut parser = SseParser::new();
        let events = push_str(&mut parser, "data: one\ndata: two\n\n");
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn comment_lines_are_ignored() {
        let mut parser = SseParser::new();
        let events = push_str(&mut parser, ": ping\n\ndata: real\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "real");
    }

    #[test]
    fn events_split_across_arbitrary_chunks() {
        let mut parser = SseParser::new();
        let wire = "data: {\"a\":1}\n\ndata: {\"b\":2}\n\n";
        let mut events = Vec::new();
        // One byte at a time: the parser must be purely incremental.
        for byte in wire.as_bytes() {
            events.extend(parser.push(&[*byte]));
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[1].data, "{\"b\":2}");
    }

    #[test]
    fn multibyte_utf8_split_across_chunks_survives() {
        let mut parser = SseParser::new();
        let wire = "data: 你好\n\n".as_bytes();
        let mut events = Vec::new();
        // Split inside the first multibyte character.
        events.extend(parser.push(&wire[..7]));
        events.extend(parser.push(&wire[7..]));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "你好");
    }

    #[test]
    fn partial_event_at_close_is_discarded() {
        let mut parser = SseParser::new();
        let events = push_str(&mut parser, "data: complete\n\ndata: partial");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "complete");
        // No flush API: dropping the parser discards the tail.
    }

    #[test]
    fn data_without_space_after_colon() {
        let mut parser = SseParser::new();
        let events = push_str(&mut parser, "data:tight\n\n");
        assert_eq!(events[0].data, "tight");
    }

    #[test]
    fn event_only_record_without_data_is_not_dispatched() {
        let mut parser = SseParser::new();
        let events = push_str(&mut parser, "event: noop\n\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        // The stale event type does not leak into the next record.
        assert_eq!(events[0].event, None);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn consecutive_blank_lines_do_not_emit_empty_events() {
        let mut parser = SseParser::new();
        let events = push_str(&mut parser, "\n\n\ndata: x\n\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }
}
