//! Incremental line splitter for upstream reply bodies.
//!
//! Bytes arrive in arbitrary boundaries: a chunk may end mid-line or even
//! mid-code-point. The splitter decodes UTF-8 incrementally, keeps an
//! incomplete trailing sequence as raw bytes until the next chunk completes
//! it, and yields only complete, trimmed, non-empty lines.
use memchr::memchr_iter;

/// Default cap for one unterminated line.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Transport-level framing fault. Unlike a malformed event line, these are
/// not recoverable: the byte stream itself can no longer be trusted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("upstream sent invalid UTF-8 at byte offset {offset}")]
    InvalidUtf8 { offset: u64 },
    #[error("upstream stream ended inside a UTF-8 sequence ({pending} bytes pending)")]
    TruncatedUtf8 { pending: usize },
    #[error("upstream line exceeds {limit} bytes without a line terminator")]
    LineTooLong { limit: usize },
}

/// Per-request line splitter state.
#[derive(Debug)]
pub struct FrameSplitter {
    /// Bytes of an incomplete UTF-8 sequence at the end of the last chunk.
    remainder: Vec<u8>,
    /// Decoded text after the last line terminator.
    tail: String,
    /// Bytes successfully decoded so far, for error offsets.
    decoded: u64,
    max_line_bytes: usize,
}

impl FrameSplitter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    #[must_use]
    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            remainder: Vec::new(),
            tail: String::new(),
            decoded: 0,
            max_line_bytes,
        }
    }

    /// Feed one raw chunk and return the complete lines it finished.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] when the chunk contains bytes that can never
    /// form valid UTF-8 or the unterminated tail outgrows the line limit.
    pub fn feed(&mut self, raw: &[u8]) -> Result<Vec<String>, FrameError> {
        let mut out = Vec::new();
        self.feed_into(raw, &mut out)?;
        Ok(out)
    }

    /// Feed one raw chunk and append complete lines into a caller-provided buffer.
    ///
    /// # Errors
    ///
    /// See [`FrameSplitter::feed`].
    pub fn feed_into(&mut self, raw: &[u8], out: &mut Vec<String>) -> Result<(), FrameError> {
        if self.remainder.is_empty() {
            let valid_up_to = self.decode_prefix(raw, out)?;
            self.remainder.extend_from_slice(&raw[valid_up_to..]);
        } else {
            let mut pending = std::mem::take(&mut self.remainder);
            pending.extend_from_slice(raw);
            let valid_up_to = self.decode_prefix(&pending, out)?;
            pending.drain(..valid_up_to);
            self.remainder = pending;
        }

        if self.tail.len() > self.max_line_bytes {
            return Err(FrameError::LineTooLong {
                limit: self.max_line_bytes,
            });
        }
        Ok(())
    }

    /// Split the longest valid UTF-8 prefix of `bytes` into lines and return
    /// its length. Lines before an invalid sequence are still delivered.
    fn decode_prefix(&mut self, bytes: &[u8], out: &mut Vec<String>) -> Result<usize, FrameError> {
        match std::str::from_utf8(bytes) {
            Ok(text) => {
                self.decoded += bytes.len() as u64;
                self.push_text(text, out);
                Ok(bytes.len())
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                // Safety: valid_up_to is guaranteed to be a valid UTF-8 boundary.
                let text = unsafe { std::str::from_utf8_unchecked(&bytes[..valid_up_to]) };
                self.decoded += valid_up_to as u64;
                self.push_text(text, out);
                if e.error_len().is_some() {
                    return Err(FrameError::InvalidUtf8 {
                        offset: self.decoded,
                    });
                }
                Ok(valid_up_to)
            }
        }
    }

    /// Take whatever is left once the upstream body has ended.
    ///
    /// Returns the trimmed tail when it holds anything but whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TruncatedUtf8`] when the body stopped inside a
    /// multi-byte sequence.
    pub fn finish(&mut self) -> Result<Option<String>, FrameError> {
        if !self.remainder.is_empty() {
            let pending = self.remainder.len();
            self.remainder.clear();
            self.tail.clear();
            return Err(FrameError::TruncatedUtf8 { pending });
        }
        let tail = std::mem::take(&mut self.tail);
        let trimmed = tail.trim();
        if trimmed.is_empty() {
            Ok(None)
        } else if trimmed.len() == tail.len() {
            Ok(Some(tail))
        } else {
            Ok(Some(trimmed.to_owned()))
        }
    }

    /// Bytes held back across chunk boundaries (undecoded plus unterminated).
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.remainder.len() + self.tail.len()
    }

    fn push_text(&mut self, text: &str, out: &mut Vec<String>) {
        let mut line_start = 0usize;
        for line_end in memchr_iter(b'\n', text.as_bytes()) {
            let segment = &text[line_start..line_end];
            if self.tail.is_empty() {
                push_line(segment, out);
            } else {
                self.tail.push_str(segment);
                let line = std::mem::take(&mut self.tail);
                push_line(&line, out);
            }
            line_start = line_end + 1;
        }
        self.tail.push_str(&text[line_start..]);
    }
}

impl Default for FrameSplitter {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn push_line(line: &str, out: &mut Vec<String>) {
    let trimmed = line.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_all<T: AsRef<[u8]>>(chunks: &[T]) -> Vec<String> {
        let mut splitter = FrameSplitter::new();
        let mut lines = Vec::new();
        for chunk in chunks {
            splitter.feed_into(chunk.as_ref(), &mut lines).unwrap();
        }
        if let Some(tail) = splitter.finish().unwrap() {
            lines.push(tail);
        }
        lines
    }

    #[test]
    fn test_split_complete_lines() {
        let lines = split_all(&[b"data: a\ndata: b\n"]);
        assert_eq!(lines, vec!["data: a", "data: b"]);
    }

    #[test]
    fn test_debug_shows_buffered_tail() {
        let mut splitter = FrameSplitter::new();
        splitter.feed(b"data: par").unwrap();
        let rendered = format!("{splitter:?}");
        assert!(rendered.starts_with("FrameSplitter"));
        assert!(rendered.contains("data: par"));
    }

    #[test]
    fn test_partial_line_is_buffered() {
        let mut splitter = FrameSplitter::new();
        assert!(splitter.feed(b"data: hel").unwrap().is_empty());
        assert_eq!(splitter.buffered_len(), 9);
        let lines = splitter.feed(b"lo\n").unwrap();
        assert_eq!(lines, vec!["data: hello"]);
        assert_eq!(splitter.buffered_len(), 0);
    }

    #[test]
    fn test_empty_and_whitespace_lines_discarded() {
        let lines = split_all(&[b"\n\n  \t \ndata: x\n\n"]);
        assert_eq!(lines, vec!["data: x"]);
    }

    #[test]
    fn test_crlf_is_trimmed() {
        let lines = split_all(&[b"data: a\r\n\r\ndata: b\r\n"]);
        assert_eq!(lines, vec!["data: a", "data: b"]);
    }

    #[test]
    fn test_finish_flushes_non_whitespace_tail() {
        let mut splitter = FrameSplitter::new();
        assert!(splitter.feed(b"data: one\n  {\"tail\":1}  ").unwrap().len() == 1);
        assert_eq!(splitter.finish().unwrap().as_deref(), Some("{\"tail\":1}"));
        assert_eq!(splitter.finish().unwrap(), None);
    }

    #[test]
    fn test_finish_ignores_whitespace_tail() {
        let mut splitter = FrameSplitter::new();
        splitter.feed(b"data: one\n   ").unwrap();
        assert_eq!(splitter.finish().unwrap(), None);
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        let text = "data: héllo wörld 你好 🎉\n";
        let bytes = text.as_bytes();
        for split in 1..bytes.len() {
            let lines = split_all(&[&bytes[..split], &bytes[split..]]);
            assert_eq!(lines, vec!["data: héllo wörld 你好 🎉"], "split at {split}");
        }
    }

    #[test]
    fn test_single_byte_chunks() {
        let text = "data: 🎉🎉\ndata: ok\n";
        let chunks: Vec<&[u8]> = text.as_bytes().chunks(1).collect();
        let lines = split_all(&chunks);
        assert_eq!(lines, vec!["data: 🎉🎉", "data: ok"]);
    }

    #[test]
    fn test_invalid_utf8_is_an_error() {
        let mut splitter = FrameSplitter::new();
        splitter.feed(b"data: ok\n").unwrap();
        let err = splitter.feed(b"ab\xFFcd").unwrap_err();
        assert_eq!(err, FrameError::InvalidUtf8 { offset: 11 });
    }

    #[test]
    fn test_lines_before_invalid_byte_are_delivered() {
        let mut splitter = FrameSplitter::new();
        let mut lines = Vec::new();
        let err = splitter
            .feed_into(b"data: a\ndata: b\n\xC0\n", &mut lines)
            .unwrap_err();
        assert_eq!(lines, vec!["data: a", "data: b"]);
        assert_eq!(err, FrameError::InvalidUtf8 { offset: 16 });
    }

    #[test]
    fn test_invalid_continuation_after_remainder() {
        let mut splitter = FrameSplitter::new();
        // First two bytes of a three-byte sequence, then an ASCII byte.
        splitter.feed(b"x\xE4\xBD").unwrap();
        let err = splitter.feed(b"a").unwrap_err();
        assert!(matches!(err, FrameError::InvalidUtf8 { offset: 1 }));
    }

    #[test]
    fn test_truncated_utf8_at_end() {
        let mut splitter = FrameSplitter::new();
        splitter.feed(b"data: \xF0\x9F").unwrap();
        assert_eq!(
            splitter.finish().unwrap_err(),
            FrameError::TruncatedUtf8 { pending: 2 }
        );
    }

    #[test]
    fn test_line_too_long() {
        let mut splitter = FrameSplitter::with_max_line_bytes(8);
        splitter.feed(b"12345678").unwrap();
        let err = splitter.feed(b"9").unwrap_err();
        assert_eq!(err, FrameError::LineTooLong { limit: 8 });
    }

    #[test]
    fn test_long_lines_with_terminators_are_fine() {
        let mut splitter = FrameSplitter::with_max_line_bytes(8);
        let lines = splitter.feed(b"0123456789abcdef\n").unwrap();
        assert_eq!(lines, vec!["0123456789abcdef"]);
    }
}
