//! Incremental line framing over an unframed byte stream.

use bytes::{Bytes, BytesMut};

/// One unit of output from [`LineFramer::feed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete record with its line terminator stripped.
    Record(Bytes),
    /// A record longer than the configured limit; its bytes were dropped.
    Oversized {
        /// Length of the dropped record, excluding the terminator.
        len: usize,
    },
}

/// Splits arbitrary byte chunks into newline-terminated records.
///
/// Any trailing fragment without a terminator is retained and prefixed onto
/// the next chunk, so the output depends only on the concatenated input and
/// never on where the chunk boundaries fall. Records consisting only of
/// whitespace (for example heartbeat newlines) are not emitted.
///
/// Without a limit the internal buffer grows with the longest record seen.
/// With [`LineFramer::with_max_record_len`], a record that grows past the
/// limit is discarded up to its terminator and reported as
/// [`Frame::Oversized`].
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: BytesMut,
    max_record_len: Option<usize>,
    /// Bytes dropped so far from an oversized record still being received.
    discarding: Option<usize>,
}

impl LineFramer {
    /// Creates a framer with no record size limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a framer that drops records longer than `limit` bytes.
    pub fn with_max_record_len(limit: usize) -> Self {
        Self {
            max_record_len: Some(limit),
            ..Self::default()
        }
    }

    /// Feeds one chunk and returns every record it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut rest = chunk;

        loop {
            if let Some(discarded) = self.discarding {
                match find_newline(rest) {
                    Some(pos) => {
                        frames.push(Frame::Oversized {
                            len: discarded + pos,
                        });
                        self.discarding = None;
                        rest = &rest[pos + 1..];
                        continue;
                    }
                    None => {
                        self.discarding = Some(discarded + rest.len());
                        break;
                    }
                }
            }

            match find_newline(rest) {
                Some(pos) => {
                    self.buffer.extend_from_slice(&rest[..pos]);
                    rest = &rest[pos + 1..];
                    let line = self.buffer.split().freeze();
                    self.push_line(line, &mut frames);
                }
                None => {
                    self.buffer.extend_from_slice(rest);
                    if self.exceeds_limit(self.buffer.len()) {
                        self.discarding = Some(self.buffer.len());
                        self.buffer.clear();
                    }
                    break;
                }
            }
        }

        frames
    }

    /// Number of buffered bytes belonging to an incomplete record.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Takes the incomplete trailing fragment, if any.
    ///
    /// Called when the stream ends; the fragment is never a complete record.
    pub fn take_remainder(&mut self) -> Option<Bytes> {
        self.discarding = None;
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer.split().freeze())
        }
    }

    fn exceeds_limit(&self, len: usize) -> bool {
        self.max_record_len.is_some_and(|limit| len > limit)
    }

    fn push_line(&self, line: Bytes, frames: &mut Vec<Frame>) {
        if self.exceeds_limit(line.len()) {
            frames.push(Frame::Oversized { len: line.len() });
            return;
        }

        let end = if line.last() == Some(&b'\r') {
            line.len() - 1
        } else {
            line.len()
        };
        let record = line.slice(..end);
        if record.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        frames.push(Frame::Record(record));
    }
}

fn find_newline(bytes: &[u8]) -> Option<usize> {
    bytes.iter().position(|&b| b == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn records(frames: Vec<Frame>) -> Vec<String> {
        frames
            .into_iter()
            .map(|frame| match frame {
                Frame::Record(bytes) => String::from_utf8(bytes.to_vec()).unwrap(),
                Frame::Oversized { len } => format!("<oversized {len}>"),
            })
            .collect()
    }

    #[test]
    fn splits_complete_lines() {
        let mut framer = LineFramer::new();
        let out = records(framer.feed(b"{\"a\":1}\n{\"b\":2}\n"));
        assert_eq!(out, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(framer.pending_len(), 0);
    }

    #[test]
    fn retains_partial_record_across_chunks() {
        let mut framer = LineFramer::new();
        assert!(framer.feed(b"{\"seq\":").is_empty());
        assert_eq!(framer.pending_len(), 7);
        let out = records(framer.feed(b"1}\n{\"se"));
        assert_eq!(out, vec!["{\"seq\":1}"]);
        let out = records(framer.feed(b"q\":2}\n"));
        assert_eq!(out, vec!["{\"seq\":2}"]);
    }

    #[test]
    fn skips_heartbeat_and_blank_lines() {
        let mut framer = LineFramer::new();
        let out = records(framer.feed(b"\n\n  \n{\"x\":1}\r\n\r\n"));
        assert_eq!(out, vec!["{\"x\":1}"]);
    }

    #[test]
    fn strips_carriage_return_split_from_newline() {
        let mut framer = LineFramer::new();
        assert!(framer.feed(b"abc\r").is_empty());
        assert_eq!(records(framer.feed(b"\n")), vec!["abc"]);
    }

    #[test]
    fn remainder_is_returned_once() {
        let mut framer = LineFramer::new();
        framer.feed(b"done\npartial");
        assert_eq!(framer.take_remainder().unwrap(), Bytes::from_static(b"partial"));
        assert!(framer.take_remainder().is_none());
    }

    #[test]
    fn oversized_record_is_dropped_up_to_terminator() {
        let mut framer = LineFramer::with_max_record_len(8);
        let mut out = records(framer.feed(b"short\n0123456"));
        out.extend(records(framer.feed(b"789abc")));
        assert_eq!(framer.pending_len(), 0);
        out.extend(records(framer.feed(b"def\nok\n")));
        assert_eq!(out, vec!["short", "<oversized 16>", "ok"]);
    }

    #[test]
    fn oversized_record_in_single_chunk() {
        let mut framer = LineFramer::with_max_record_len(4);
        let out = records(framer.feed(b"toolong\nfine\n"));
        assert_eq!(out, vec!["<oversized 7>", "fine"]);
    }

    fn frame_all(input: &[u8], cuts: &[usize], limit: Option<usize>) -> Vec<Frame> {
        let mut framer = match limit {
            Some(limit) => LineFramer::with_max_record_len(limit),
            None => LineFramer::new(),
        };
        let mut frames = Vec::new();
        let mut start = 0;
        for &cut in cuts {
            let cut = cut.min(input.len()).max(start);
            frames.extend(framer.feed(&input[start..cut]));
            start = cut;
        }
        frames.extend(framer.feed(&input[start..]));
        frames
    }

    proptest! {
        #[test]
        fn chunk_boundaries_do_not_change_output(
            lines in prop::collection::vec("[a-z{}:\" \r]{0,24}", 0..12),
            mut cuts in prop::collection::vec(0usize..400, 0..10),
            limit in prop::option::of(4usize..32),
        ) {
            let mut input = lines.join("\n");
            input.push('\n');
            cuts.sort_unstable();

            let whole = frame_all(input.as_bytes(), &[], limit);
            let split = frame_all(input.as_bytes(), &cuts, limit);
            prop_assert_eq!(whole, split);
        }
    }
}
