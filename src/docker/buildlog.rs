//! Image build log parser
//!
//! The engine streams `/build` output as newline-separated JSON
//! objects, several per transfer chunk. Each `{"stream": text}` line
//! is forwarded verbatim to the log sink, and every `Successfully
//! built <id>` line records an image id candidate; a multi-stage build
//! reports several, and the last one is the result.

use crate::error::{KilnError, KilnResult};
use std::io::Write;

pub struct BuildLogParser<'a> {
    sink: &'a mut dyn Write,
    pending: String,
    image: Option<String>,
}

impl<'a> BuildLogParser<'a> {
    pub fn new(sink: &'a mut dyn Write) -> Self {
        Self {
            sink,
            pending: String::new(),
            image: None,
        }
    }

    /// Feed one raw response chunk
    pub fn feed(&mut self, chunk: &[u8]) -> KilnResult<()> {
        self.pending.push_str(&String::from_utf8_lossy(chunk));
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            self.handle_line(line.trim_end_matches(['\r', '\n']))?;
        }
        Ok(())
    }

    fn handle_line(&mut self, line: &str) -> KilnResult<()> {
        if line.is_empty() {
            return Ok(());
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
            // interleaved non-JSON noise is not ours to interpret
            return Ok(());
        };
        let Some(text) = value.get("stream").and_then(|v| v.as_str()) else {
            return Ok(());
        };

        self.sink
            .write_all(text.as_bytes())
            .map_err(|e| KilnError::io("writing build log", e))?;

        for logline in text.lines() {
            if let Some(rest) = logline.trim().strip_prefix("Successfully built ") {
                if let Some(id) = rest.split_whitespace().next() {
                    self.image = Some(id.to_string());
                }
            }
        }
        Ok(())
    }

    /// Flush any trailing partial line and return the resulting image
    /// id; a log that never reported one is fatal.
    pub fn finish(mut self) -> KilnResult<String> {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.handle_line(line.trim_end_matches(['\r', '\n']))?;
        }
        self.image.ok_or(KilnError::ImageIdMissing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_successfully_built_line_wins() {
        let mut sink = Vec::new();
        let mut parser = BuildLogParser::new(&mut sink);
        parser
            .feed(b"{\"stream\":\"Successfully built aaa\\n\"}\n")
            .unwrap();
        parser
            .feed(b"{\"stream\":\"Step 2/2 : RUN make\\n\"}\n")
            .unwrap();
        parser
            .feed(b"{\"stream\":\"Successfully built bbb\\n\"}\n")
            .unwrap();
        assert_eq!(parser.finish().unwrap(), "bbb");
    }

    #[test]
    fn stream_text_is_forwarded_verbatim() {
        let mut sink = Vec::new();
        let mut parser = BuildLogParser::new(&mut sink);
        parser
            .feed(b"{\"stream\":\"Step 1/3 : FROM ubuntu\\n\"}\r\n{\"stream\":\" ---> abc\\n\"}\n")
            .unwrap();
        parser.feed(b"{\"stream\":\"Successfully built abc\\n\"}\n").unwrap();
        parser.finish().unwrap();
        assert_eq!(
            String::from_utf8(sink).unwrap(),
            "Step 1/3 : FROM ubuntu\n ---> abc\nSuccessfully built abc\n"
        );
    }

    #[test]
    fn json_objects_split_across_chunks() {
        let mut sink = Vec::new();
        let mut parser = BuildLogParser::new(&mut sink);
        parser.feed(b"{\"stream\":\"Successfully bui").unwrap();
        parser.feed(b"lt cafe1234\\n\"}\n").unwrap();
        assert_eq!(parser.finish().unwrap(), "cafe1234");
    }

    #[test]
    fn trailing_line_without_newline_still_counts() {
        let mut sink = Vec::new();
        let mut parser = BuildLogParser::new(&mut sink);
        parser
            .feed(b"{\"stream\":\"Successfully built feed42\\n\"}")
            .unwrap();
        assert_eq!(parser.finish().unwrap(), "feed42");
    }

    #[test]
    fn missing_image_id_is_fatal() {
        let mut sink = Vec::new();
        let mut parser = BuildLogParser::new(&mut sink);
        parser
            .feed(b"{\"stream\":\"Step 1/1 : FROM scratch\\n\"}\n")
            .unwrap();
        let err = parser.finish().unwrap_err();
        assert!(matches!(err, KilnError::ImageIdMissing));
    }

    #[test]
    fn non_stream_lines_are_ignored() {
        let mut sink = Vec::new();
        let mut parser = BuildLogParser::new(&mut sink);
        parser.feed(b"{\"status\":\"Downloading\"}\n").unwrap();
        parser.feed(b"not json at all\n").unwrap();
        parser
            .feed(b"{\"stream\":\"Successfully built 0a1b\\n\"}\n")
            .unwrap();
        assert_eq!(parser.finish().unwrap(), "0a1b");
        assert_eq!(String::from_utf8(sink).unwrap(), "Successfully built 0a1b\n");
    }
}
