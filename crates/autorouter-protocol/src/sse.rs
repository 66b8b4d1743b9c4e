use bytes::Bytes;

/// One dispatched server-sent event: optional `event:` name plus joined
/// `data:` lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE parser for the streaming tee.
///
/// The tee forwards raw bytes to the client untouched; this parser only
/// mirrors them to locate the trailing usage block, so it tolerates partial
/// chunks, CRLF line endings and comment lines.
#[derive(Debug, Default)]
pub struct SseFrameParser {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseFrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &Bytes) -> Vec<SseFrame> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.feed_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn feed_str(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            self.take_line(line, &mut frames);
        }

        frames
    }

    /// Flushes whatever a truncated stream left behind.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            let line = line.trim_end_matches('\r').to_string();
            self.take_line(&line, &mut frames);
        }
        self.dispatch(&mut frames);
        frames
    }

    fn take_line(&mut self, line: &str, frames: &mut Vec<SseFrame>) {
        if line.is_empty() {
            self.dispatch(frames);
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => {
                self.event = (!value.is_empty()).then(|| value.to_string());
            }
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self, frames: &mut Vec<SseFrame>) {
        if self.event.is_none() && self.data.is_empty() {
            return;
        }
        frames.push(SseFrame {
            event: self.event.take(),
            data: self.data.join("\n"),
        });
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_on_blank_line() {
        let mut parser = SseFrameParser::new();
        let frames = parser.feed_str("data: {\"a\":1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"a\":1}");
        assert_eq!(frames[0].event, None);
    }

    #[test]
    fn named_events_carry_their_name() {
        let mut parser = SseFrameParser::new();
        let frames = parser.feed_str("event: message_stop\ndata: {}\n\n");
        assert_eq!(frames[0].event.as_deref(), Some("message_stop"));
    }

    #[test]
    fn partial_chunks_accumulate() {
        let mut parser = SseFrameParser::new();
        assert!(parser.feed_str("data: {\"usa").is_empty());
        assert!(parser.feed_str("ge\":1}").is_empty());
        let frames = parser.feed_str("\n\n");
        assert_eq!(frames[0].data, "{\"usage\":1}");
    }

    #[test]
    fn multi_data_lines_join_with_newline() {
        let mut parser = SseFrameParser::new();
        let frames = parser.feed_str("data: a\ndata: b\n\n");
        assert_eq!(frames[0].data, "a\nb");
    }

    #[test]
    fn comments_and_crlf_are_tolerated() {
        let mut parser = SseFrameParser::new();
        let frames = parser.feed_str(": keep-alive\r\ndata: x\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "x");
    }

    #[test]
    fn finish_flushes_a_truncated_frame() {
        let mut parser = SseFrameParser::new();
        assert!(parser.feed_str("data: tail").is_empty());
        let frames = parser.finish();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "tail");
    }
}
