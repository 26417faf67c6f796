use std::io::{self, Write};

pub(crate) const MAX_CAPTURED_OUTPUT_BYTES: usize = 256 * 1024;
const TRUNCATION_MARKER: &str = "...[truncated]";

/// Write sink that accepts unlimited input but retains at most `limit`
/// bytes. Every write acknowledges its full length so the child process
/// never stalls on a full pipe.
pub(crate) struct CappedBuffer {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CappedBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            truncated: false,
        }
    }

    /// Retained bytes as a string, with the truncation marker appended when
    /// anything was dropped.
    pub(crate) fn render(&self) -> String {
        let content = String::from_utf8_lossy(&self.buf);
        if !self.truncated {
            return content.into_owned();
        }
        if content.is_empty() {
            return TRUNCATION_MARKER.to_string();
        }
        format!("{content}\n{TRUNCATION_MARKER}")
    }
}

impl Write for CappedBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.limit == 0 {
            self.truncated = self.truncated || !data.is_empty();
            return Ok(data.len());
        }

        let remaining = self.limit.saturating_sub(self.buf.len());
        if remaining == 0 {
            self.truncated = self.truncated || !data.is_empty();
            return Ok(data.len());
        }

        if data.len() > remaining {
            self.buf.extend_from_slice(&data[..remaining]);
            self.truncated = true;
            return Ok(data.len());
        }

        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_output_below_limit() {
        let mut buf = CappedBuffer::new(MAX_CAPTURED_OUTPUT_BYTES);
        let input = "a".repeat(MAX_CAPTURED_OUTPUT_BYTES);
        assert_eq!(buf.write(input.as_bytes()).unwrap(), input.len());

        let rendered = buf.render();
        assert_eq!(rendered, input);
        assert!(!rendered.contains(TRUNCATION_MARKER));
    }

    #[test]
    fn truncates_and_appends_marker() {
        let mut buf = CappedBuffer::new(MAX_CAPTURED_OUTPUT_BYTES);
        let input = "b".repeat(MAX_CAPTURED_OUTPUT_BYTES + 1024);
        assert_eq!(buf.write(input.as_bytes()).unwrap(), input.len());

        let rendered = buf.render();
        assert!(rendered.ends_with(TRUNCATION_MARKER));
        assert!(rendered.len() <= MAX_CAPTURED_OUTPUT_BYTES + TRUNCATION_MARKER.len() + 1);
    }

    #[test]
    fn zero_limit_always_truncates() {
        let mut buf = CappedBuffer::new(0);
        assert_eq!(buf.write(b"abc").unwrap(), 3);
        assert_eq!(buf.render(), TRUNCATION_MARKER);
    }

    #[test]
    fn writes_past_the_limit_still_ack_full_length() {
        let mut buf = CappedBuffer::new(4);
        assert_eq!(buf.write(b"abcd").unwrap(), 4);
        assert_eq!(buf.write(b"efgh").unwrap(), 4);
        assert_eq!(buf.render(), format!("abcd\n{TRUNCATION_MARKER}"));
    }

    #[test]
    fn empty_write_at_capacity_does_not_mark_truncation() {
        let mut buf = CappedBuffer::new(4);
        buf.write(b"abcd").unwrap();
        buf.write(b"").unwrap();
        assert_eq!(buf.render(), "abcd");
    }

    #[test]
    fn split_writes_accumulate_until_capacity() {
        let mut buf = CappedBuffer::new(6);
        buf.write(b"abc").unwrap();
        buf.write(b"defgh").unwrap();
        assert_eq!(buf.render(), format!("abcdef\n{TRUNCATION_MARKER}"));
    }
}
