use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Chunks may split a frame (or a CRLF pair) anywhere; bytes are buffered
/// until a blank line closes the frame.
#[derive(Default)]
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some((idx, delim_len)) = find_frame_delimiter(&self.buf) {
            let frame_bytes: Vec<u8> = self.buf.drain(..idx + delim_len).take(idx).collect();
            if let Some(frame) = parse_sse_frame(&frame_bytes) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn find_frame_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if i + 3 < buf.len() && &buf[i..i + 4] == b"\r\n\r\n" {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}

fn parse_sse_frame(bytes: &[u8]) -> Option<SseFrame> {
    if bytes.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(bytes);
    let mut event: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();
    for raw_line in text.split('\n') {
        let line = raw_line.trim_end_matches('\r');
        // ":" lines are keepalives/comments.
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start());
        } else {
            debug!(line, "ignoring unrecognized event-stream line");
        }
    }
    if data_lines.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_partial_chunk_boundaries() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push_chunk(b"event: task_progress\nda").is_empty());
        assert!(decoder.push_chunk(b"ta: {\"step_index\":1}\n").is_empty());
        let frames = decoder.push_chunk(b"\nevent: task_completed\ndata: {}\n\n");
        assert_eq!(
            frames,
            vec![
                SseFrame {
                    event: Some("task_progress".into()),
                    data: "{\"step_index\":1}".into(),
                },
                SseFrame {
                    event: Some("task_completed".into()),
                    data: "{}".into(),
                },
            ]
        );
    }

    #[test]
    fn joins_multiple_data_lines_with_newline() {
        let mut decoder = SseDecoder::default();
        let frames = decoder.push_chunk(b"event: x\ndata: {\"a\":\ndata: 1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"a\":\n1}");
    }

    #[test]
    fn skips_keepalives_and_unknown_lines() {
        let mut decoder = SseDecoder::default();
        let frames = decoder.push_chunk(b": keepalive\n\nid: 7\nretry: 10\nevent: y\ndata: {}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("y"));
    }

    #[test]
    fn frame_without_data_is_dropped() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push_chunk(b"event: lonely\n\n").is_empty());
    }

    #[test]
    fn accepts_crlf_delimiters_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push_chunk(b"event: z\r\ndata: {}\r\n\r").is_empty());
        let frames = decoder.push_chunk(b"\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("z"));
        assert_eq!(frames[0].data, "{}");
    }
}
