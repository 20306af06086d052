//! Line framing over a byte stream
//!
//! TCP hands us arbitrary chunks; a read may end mid-line or carry several
//! lines at once. [`LineBuffer`] keeps the unterminated tail between reads
//! and yields only complete lines, so one call to [`read_burst`] returns
//! exactly the lines that became complete during that read.

use crate::error::{Error, Result};
use std::io::{ErrorKind, Read};

/// Lines longer than this are rejected (DoS protection)
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Size of the scratch buffer used for a single socket read
pub const READ_CHUNK: usize = 4096;

/// Accumulates bytes and splits them into complete lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    /// Inside an over-long line; bytes are dropped up to the next `\n`
    discarding: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received after the last complete line
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Append `bytes` and return every line completed by them
    ///
    /// Lines are returned without their `\n` / `\r\n` terminator. Invalid
    /// UTF-8 is replaced rather than rejected; the grammar is ASCII anyway.
    /// If the unterminated tail grows past [`MAX_LINE_LEN`] it is discarded
    /// and a protocol error is returned, after the complete lines. The rest
    /// of that line is dropped as it arrives, so it yields one error only.
    pub fn push(&mut self, mut bytes: &[u8]) -> (Vec<String>, Option<Error>) {
        if self.discarding {
            match bytes.iter().position(|&b| b == b'\n') {
                Some(end) => {
                    self.discarding = false;
                    bytes = &bytes[end + 1..];
                }
                None => return (Vec::new(), None),
            }
        }
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let mut line = &self.pending[start..end];
            if let [head @ .., b'\r'] = line {
                line = head;
            }
            lines.push(String::from_utf8_lossy(line).into_owned());
            start = end + 1;
        }
        self.pending.drain(..start);

        let overflow = if self.pending.len() > MAX_LINE_LEN {
            let len = self.pending.len();
            self.pending.clear();
            self.discarding = true;
            Some(Error::Protocol(format!(
                "line exceeds {} bytes ({} buffered), discarded",
                MAX_LINE_LEN, len
            )))
        } else {
            None
        };

        (lines, overflow)
    }
}

/// Result of one bounded read
#[derive(Debug)]
pub enum Burst {
    /// Lines completed by this read (may be empty if the read ended mid-line)
    Lines(Vec<String>),
    /// Like `Lines`, but an over-long partial line was discarded after them
    Overflow(Vec<String>),
    /// Read timed out with nothing new
    Idle,
}

/// Perform one read and frame the result
///
/// Timeouts map to [`Burst::Idle`]. End of stream maps to an
/// `UnexpectedEof` I/O error so callers can treat it as a disconnect.
/// An over-long line is reported as [`Burst::Overflow`]; the reader stays
/// usable afterwards.
pub fn read_burst<R: Read>(reader: &mut R, buffer: &mut LineBuffer) -> Result<Burst> {
    let mut chunk = [0u8; READ_CHUNK];
    let n = match reader.read(&mut chunk) {
        Ok(0) => {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "no more data, peer closed the connection",
            )));
        }
        Ok(n) => n,
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
            return Ok(Burst::Idle);
        }
        Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(Burst::Idle),
        Err(e) => return Err(Error::Io(e)),
    };

    let (lines, overflow) = buffer.push(&chunk[..n]);
    match overflow {
        Some(err) => {
            log::debug!("{}", err);
            Ok(Burst::Overflow(lines))
        }
        None => Ok(Burst::Lines(lines)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_split_crlf_and_lf() {
        let mut buf = LineBuffer::new();
        let (lines, err) = buf.push(b"eeg\r\nstatus\nwat");
        assert!(err.is_none());
        assert_eq!(lines, vec!["eeg", "status"]);
        assert_eq!(buf.pending_len(), 3);

        let (lines, _) = buf.push(b"ch 0\r\n");
        assert_eq!(lines, vec!["watch 0"]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn test_empty_lines_are_kept() {
        let mut buf = LineBuffer::new();
        let (lines, _) = buf.push(b"200 OK\r\n\r\n");
        assert_eq!(lines, vec!["200 OK", ""]);
    }

    #[test]
    fn test_overflow_discards_tail() {
        let mut buf = LineBuffer::new();
        let big = vec![b'x'; MAX_LINE_LEN + 1];
        let (lines, err) = buf.push(&big);
        assert!(lines.is_empty());
        assert!(matches!(err, Some(Error::Protocol(_))));
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn test_overlong_line_reported_once() {
        let mut buf = LineBuffer::new();
        let mut data = vec![b'x'; 70_000];
        data.extend_from_slice(b"\r\nrole\r\n");

        let mut lines = Vec::new();
        let mut errors = 0;
        for chunk in data.chunks(READ_CHUNK) {
            let (complete, err) = buf.push(chunk);
            lines.extend(complete);
            errors += usize::from(err.is_some());
        }
        assert_eq!(errors, 1);
        assert_eq!(lines, vec!["role"]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn test_discarding_ends_at_newline_in_later_push() {
        let mut buf = LineBuffer::new();
        let (_, err) = buf.push(&vec![b'x'; MAX_LINE_LEN + 1]);
        assert!(err.is_some());

        let (lines, err) = buf.push(b"xxxx");
        assert!(lines.is_empty() && err.is_none());
        let (lines, err) = buf.push(b"xx\nstatus\r\nwat");
        assert!(err.is_none());
        assert_eq!(lines, vec!["status"]);
        assert_eq!(buf.pending_len(), 3);
    }

    #[test]
    fn test_read_burst_eof() {
        let mut reader = Cursor::new(Vec::<u8>::new());
        let mut buf = LineBuffer::new();
        let err = read_burst(&mut reader, &mut buf).unwrap_err();
        assert!(err.is_disconnect());
    }

    #[test]
    fn test_read_burst_overflow_keeps_complete_lines() {
        let mut data = b"status\r\n".to_vec();
        data.extend(vec![b'x'; MAX_LINE_LEN + 1]);
        let mut reader = Cursor::new(data);
        let mut buf = LineBuffer::new();
        let mut seen = Vec::new();
        let mut overflowed = false;
        // The scratch buffer is smaller than the payload, so several reads
        while !overflowed {
            match read_burst(&mut reader, &mut buf).unwrap() {
                Burst::Lines(lines) => seen.extend(lines),
                Burst::Overflow(lines) => {
                    seen.extend(lines);
                    overflowed = true;
                }
                Burst::Idle => panic!("cursor never times out"),
            }
        }
        assert_eq!(seen, vec!["status"]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn test_read_burst_lines() {
        let mut reader = Cursor::new(b"! 0 1 10.5\r\n! 1 1 11\r\n".to_vec());
        let mut buf = LineBuffer::new();
        match read_burst(&mut reader, &mut buf).unwrap() {
            Burst::Lines(lines) => assert_eq!(lines, vec!["! 0 1 10.5", "! 1 1 11"]),
            other => panic!("expected lines, got {:?}", other),
        }
    }
}
