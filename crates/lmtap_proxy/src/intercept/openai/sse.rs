/// Reassembles the line framing of a Server-Sent-Events stream.
///
/// HTTP chunk boundaries carry no meaning for SSE, so a `data: {…}` frame
/// may arrive split across chunks. Bytes are buffered until a newline
/// completes a line; the accumulated result is therefore independent of how
/// the stream was chunked on the wire.
#[derive(Debug, Default)]
pub(crate) struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    /// Feeds one chunk and returns every line it completed, trimmed.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            lines.push(String::from_utf8_lossy(&line).trim().to_string());
        }
        lines
    }

    /// Drains whatever is left after the final chunk, for streams that do
    /// not end with a newline.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        (!line.is_empty()).then_some(line)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_whole_lines_pass_through() {
        let mut fixture = SseLineBuffer::default();

        let actual = fixture.push(b"data: one\n\ndata: two\n");

        assert_eq!(actual, vec!["data: one", "", "data: two"]);
        assert_eq!(fixture.finish(), None);
    }

    #[test]
    fn test_split_frame_is_reassembled() {
        let mut fixture = SseLineBuffer::default();

        assert!(fixture.push(b"data: {\"choi").is_empty());
        let actual = fixture.push(b"ces\":[]}\n");

        assert_eq!(actual, vec![r#"data: {"choices":[]}"#]);
    }

    #[test]
    fn test_any_chunking_yields_the_same_lines() {
        let stream = b"data: alpha\ndata: beta\n\ndata: [DONE]\n";

        for window in [1, 2, 3, 5, 7, stream.len()] {
            let mut fixture = SseLineBuffer::default();
            let mut lines = Vec::new();
            for chunk in stream.chunks(window) {
                lines.extend(fixture.push(chunk));
            }
            assert_eq!(
                lines,
                vec!["data: alpha", "data: beta", "", "data: [DONE]"],
                "chunk window {window}"
            );
        }
    }

    #[test]
    fn test_finish_flushes_trailing_line() {
        let mut fixture = SseLineBuffer::default();

        assert!(fixture.push(b"data: tail").is_empty());

        assert_eq!(fixture.finish(), Some("data: tail".to_string()));
        assert_eq!(fixture.finish(), None);
    }

    #[test]
    fn test_carriage_returns_are_trimmed() {
        let mut fixture = SseLineBuffer::default();

        let actual = fixture.push(b"data: one\r\n");

        assert_eq!(actual, vec!["data: one"]);
    }
}
