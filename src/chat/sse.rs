//! Incremental parser for Server-Sent Event streams.

/// Accumulates raw bytes and yields the `data:` payloads of complete,
/// blank-line-delimited event blocks. Partial blocks stay buffered until the
/// next read completes them, so events split across network reads are
/// reassembled correctly.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next read from the wire; returns every event payload that is
    /// now complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some((end, delim_len)) = find_block_end(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + delim_len).collect();
            let text = String::from_utf8_lossy(&block);
            for line in text.lines() {
                if let Some(data) = line.strip_prefix("data:") {
                    events.push(data.trim_start().to_string());
                }
            }
        }
        events
    }

    /// Payloads of any unterminated block left in the buffer. Servers that
    /// close the connection without a trailing blank line still get their
    /// last event delivered.
    pub fn finish(&mut self) -> Vec<String> {
        let remainder = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&remainder);
        text.lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| data.trim_start().to_string())
            .collect()
    }
}

/// Find the first block delimiter (`\n\n` or `\r\n\r\n`), returning the
/// offset of the delimiter and its length.
fn find_block_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n");
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n");

    match (lf, crlf) {
        (Some(a), Some(b)) if b < a => Some((b, 4)),
        (Some(a), _) => Some((a, 2)),
        (None, Some(b)) => Some((b, 4)),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_complete_event() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: {\"text\":\"hi\"}\n\n");
        assert_eq!(events, vec!["{\"text\":\"hi\"}"]);
    }

    #[test]
    fn event_split_across_reads() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: hel").is_empty());
        assert!(parser.feed(b"lo wor").is_empty());
        let events = parser.feed(b"ld\n\ndata: next\n\n");
        assert_eq!(events, vec!["hello world", "next"]);
    }

    #[test]
    fn crlf_delimiters_are_handled() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: one\r\n\r\ndata: two\r\n\r\n");
        assert_eq!(events, vec!["one", "two"]);
    }

    #[test]
    fn multiple_data_lines_in_one_block() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: first\ndata: second\n\n");
        assert_eq!(events, vec!["first", "second"]);
    }

    #[test]
    fn non_data_lines_are_ignored() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"event: message\nid: 3\ndata: payload\n\n");
        assert_eq!(events, vec!["payload"]);
    }

    #[test]
    fn done_sentinel_passes_through() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: [DONE]\n\n");
        assert_eq!(events, vec!["[DONE]"]);
    }

    #[test]
    fn finish_flushes_unterminated_block() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: trailing").is_empty());
        assert_eq!(parser.finish(), vec!["trailing"]);
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn payload_without_space_after_colon() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data:tight\n\n");
        assert_eq!(events, vec!["tight"]);
    }
}
