// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

/// Bytes of unterminated output kept before it is emitted as a line anyway.
pub const MAX_PENDING: usize = 1024 * 1024;

/// Splits a byte stream into lines, regardless of how reads are chunked.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.pending.extend_from_slice(&rest[..pos]);
            lines.push(self.take_line());
            rest = &rest[pos + 1..];
        }
        self.pending.extend_from_slice(rest);
        if self.pending.len() >= MAX_PENDING {
            lines.push(self.take_line());
        }
        lines
    }

    /// Flush what remains after end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_across_chunks() {
        let mut buf = LineBuffer::new();
        assert!(buf.feed(b"hel").is_empty());
        assert_eq!(buf.feed(b"lo\nwor"), vec!["hello"]);
        assert_eq!(buf.feed(b"ld\r\nbye\n\n"), vec!["world", "bye", ""]);
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn test_finish_flushes_tail() {
        let mut buf = LineBuffer::new();
        assert!(buf.feed(b"no newline").is_empty());
        assert_eq!(buf.finish().as_deref(), Some("no newline"));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn test_long_line_is_capped() {
        let mut buf = LineBuffer::new();
        let big = vec![b'x'; MAX_PENDING + 10];
        let lines = buf.feed(&big);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), MAX_PENDING + 10);
        assert_eq!(buf.finish(), None);
    }
}
