//! Newline-delimited record framing for the event stream.

use crate::error::{ProtocolError, ProtocolResult};

/// Default upper bound on a single record, in bytes.
pub const DEFAULT_MAX_RECORD_LEN: usize = 1024 * 1024;

/// Splits an arbitrary byte stream into text records.
///
/// Records end at `\n` (an optional preceding `\r` is stripped). Blank lines
/// and lines starting with `:` are keep-alives and produce nothing. A record
/// longer than the limit is reported once and discarded up to its newline.
#[derive(Debug)]
pub struct RecordFramer {
    buf: Vec<u8>,
    max_len: usize,
    discarding: bool,
}

impl Default for RecordFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordFramer {
    /// Creates a framer with [`DEFAULT_MAX_RECORD_LEN`].
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_RECORD_LEN)
    }

    /// Creates a framer with a custom record size limit.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_len,
            discarding: false,
        }
    }

    /// Bytes buffered for the record in progress.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feeds a chunk, returning every record it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ProtocolResult<String>> {
        let mut out = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (line, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                self.discarding = false;
                self.buf.clear();
                continue;
            }
            if self.buf.len() + line.len() > self.max_len {
                out.push(Err(ProtocolError::RecordTooLarge {
                    len: self.buf.len() + line.len(),
                    max: self.max_len,
                }));
                self.buf.clear();
                continue;
            }
            self.buf.extend_from_slice(line);
            let record = std::mem::take(&mut self.buf);
            if let Some(result) = Self::finish_record(record) {
                out.push(result);
            }
        }

        if !self.discarding {
            if self.buf.len() + rest.len() > self.max_len {
                out.push(Err(ProtocolError::RecordTooLarge {
                    len: self.buf.len() + rest.len(),
                    max: self.max_len,
                }));
                self.buf.clear();
                self.discarding = true;
            } else {
                self.buf.extend_from_slice(rest);
            }
        }
        out
    }

    /// Flushes a final unterminated record when the stream ends.
    pub fn finish(&mut self) -> Option<ProtocolResult<String>> {
        let record = std::mem::take(&mut self.buf);
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        Self::finish_record(record)
    }

    fn finish_record(mut record: Vec<u8>) -> Option<ProtocolResult<String>> {
        if record.last() == Some(&b'\r') {
            record.pop();
        }
        let text = match String::from_utf8(record) {
            Ok(text) => text,
            Err(_) => return Some(Err(ProtocolError::InvalidUtf8)),
        };
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed.starts_with(':') {
            return None;
        }
        Some(Ok(trimmed.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn records(framer: &mut RecordFramer, chunk: &[u8]) -> Vec<String> {
        framer
            .push(chunk)
            .into_iter()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn splits_on_newlines_across_chunks() {
        let mut framer = RecordFramer::new();
        assert!(records(&mut framer, b"{\"type\":").is_empty());
        assert_eq!(
            records(&mut framer, b"\"heartbeat\"}\n{\"a\":1}\r\n{\"b\""),
            vec![r#"{"type":"heartbeat"}"#, r#"{"a":1}"#]
        );
        assert_eq!(framer.buffered(), 4);
        assert_eq!(framer.finish().unwrap().unwrap(), r#"{"b""#);
        assert!(framer.finish().is_none());
    }

    #[test]
    fn keepalives_are_ignored() {
        let mut framer = RecordFramer::new();
        assert!(records(&mut framer, b"\n\r\n: ping\n   \n").is_empty());
    }

    #[test]
    fn invalid_utf8_is_reported() {
        let mut framer = RecordFramer::new();
        let out = framer.push(b"\xff\xfe\n{}\n");
        assert!(matches!(out[0], Err(ProtocolError::InvalidUtf8)));
        assert_eq!(out[1].as_ref().unwrap(), "{}");
    }

    #[test]
    fn oversized_records_are_skipped_once() {
        let mut framer = RecordFramer::with_max_len(8);
        let out = framer.push(b"0123456789");
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(ProtocolError::RecordTooLarge { .. })));

        // The rest of the oversized line is swallowed silently.
        let out = framer.push(b"abcdef\n{}\n");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref().unwrap(), "{}");

        let out = framer.push(b"0123456789\nok\n");
        assert!(out[0].is_err());
        assert_eq!(out[1].as_ref().unwrap(), "ok");
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_records(
            lines in proptest::collection::vec("[a-z0-9{}\":]{1,20}", 0..10),
            cut in 1usize..7,
        ) {
            let stream: String = lines.iter().map(|l| format!("{l}\n")).collect();
            let expected: Vec<String> = lines
                .iter()
                .filter(|l| !l.starts_with(':'))
                .cloned()
                .collect();

            let mut framer = RecordFramer::new();
            let mut got = Vec::new();
            for chunk in stream.as_bytes().chunks(cut) {
                got.extend(framer.push(chunk).into_iter().map(|r| r.unwrap()));
            }
            prop_assert!(framer.finish().is_none());
            prop_assert_eq!(got, expected);
        }
    }
}
