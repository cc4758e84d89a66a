//! Log Demultiplexing
//!
//! Every line captured by the execution protocol is written to `output.log`
//! preceded by a 3-byte stream-origin prefix. This module removes those
//! prefixes (combined output), splits the log back into its stdout and stderr
//! streams, and does the same incrementally for logs that are still growing.
//!
//! Output that itself contains a prefix sequence cannot be told apart from a
//! real marker and is stripped as well.

/// Prefix written before each line captured from the command's stdout
pub const STDOUT_PREFIX: [u8; 3] = [0x01, 0x01, 0x01];

/// Prefix written before each line captured from the command's stderr
pub const STDERR_PREFIX: [u8; 3] = [0x02, 0x02, 0x02];

const PREFIX_LEN: usize = STDOUT_PREFIX.len();

/// Which logical stream a captured line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn prefix(self) -> &'static [u8; 3] {
        match self {
            LogStream::Stdout => &STDOUT_PREFIX,
            LogStream::Stderr => &STDERR_PREFIX,
        }
    }
}

/// Log content split back into its two streams
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DemuxedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

fn prefix_at(buf: &[u8]) -> Option<LogStream> {
    if buf.starts_with(&STDOUT_PREFIX) {
        Some(LogStream::Stdout)
    } else if buf.starts_with(&STDERR_PREFIX) {
        Some(LogStream::Stderr)
    } else {
        None
    }
}

/// True when `tail` is shorter than a prefix but could still grow into one
fn is_partial_prefix(tail: &[u8]) -> bool {
    !tail.is_empty()
        && tail.len() < PREFIX_LEN
        && (STDOUT_PREFIX.starts_with(tail) || STDERR_PREFIX.starts_with(tail))
}

/// Remove every stream-origin prefix from a complete log
pub fn strip_prefixes(log: &[u8]) -> Vec<u8> {
    let mut demuxer = LogDemuxer::new();
    let mut out = demuxer.push(log);
    out.extend(demuxer.finish());
    out
}

/// Split a complete log into stdout and stderr.
///
/// Bytes appearing before the first prefix are attributed to stdout.
pub fn split_streams(log: &[u8]) -> DemuxedOutput {
    let mut output = DemuxedOutput::default();
    let mut current = LogStream::Stdout;
    let mut i = 0;

    while i < log.len() {
        if let Some(stream) = log.get(i..).and_then(prefix_at) {
            current = stream;
            i += PREFIX_LEN;
            continue;
        }

        let byte = log[i];
        match current {
            LogStream::Stdout => output.stdout.push(byte),
            LogStream::Stderr => output.stderr.push(byte),
        }
        i += 1;
    }

    output
}

/// Build one log line tagged with the given stream's prefix, terminated by a newline
pub fn tag_line(stream: LogStream, line: &[u8]) -> Vec<u8> {
    let mut tagged = Vec::with_capacity(PREFIX_LEN + line.len() + 1);
    tagged.extend_from_slice(stream.prefix());
    tagged.extend_from_slice(line);
    if !line.ends_with(b"\n") {
        tagged.push(b'\n');
    }
    tagged
}

/// Incremental prefix stripper for a log that arrives in arbitrary chunks.
///
/// A prefix split across two chunks is held back until it can be decided.
/// The residual never exceeds two bytes.
#[derive(Debug, Default)]
pub struct LogDemuxer {
    residual: Vec<u8>,
}

impl LogDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk, returning the bytes that are safe to emit
    pub fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut buf = std::mem::take(&mut self.residual);
        buf.extend_from_slice(chunk);

        let mut out = Vec::with_capacity(buf.len());
        let mut i = 0;

        while i < buf.len() {
            let rest = &buf[i..];
            if prefix_at(rest).is_some() {
                i += PREFIX_LEN;
                continue;
            }
            if is_partial_prefix(rest) {
                self.residual = rest.to_vec();
                return out;
            }
            out.push(buf[i]);
            i += 1;
        }

        out
    }

    /// End of stream: whatever is still held back was never a full prefix
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.residual)
    }

    pub fn pending(&self) -> usize {
        self.residual.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_log() -> Vec<u8> {
        let mut log = Vec::new();
        log.extend(tag_line(LogStream::Stdout, b"hello"));
        log.extend(tag_line(LogStream::Stderr, b"warning: disk almost full"));
        log.extend(tag_line(LogStream::Stdout, b"done \x01 with \x02\x02 bytes"));
        log
    }

    fn stream_in_chunks(log: &[u8], sizes: &[usize]) -> Vec<u8> {
        let mut demuxer = LogDemuxer::new();
        let mut out = Vec::new();
        let mut offset = 0;
        let mut size_idx = 0;

        while offset < log.len() {
            let size = sizes[size_idx % sizes.len()].max(1);
            let end = (offset + size).min(log.len());
            out.extend(demuxer.push(&log[offset..end]));
            offset = end;
            size_idx += 1;
        }

        out.extend(demuxer.finish());
        out
    }

    #[test]
    fn test_strip_prefixes_removes_both_streams() {
        let stripped = strip_prefixes(&sample_log());
        assert_eq!(
            stripped,
            b"hello\nwarning: disk almost full\ndone \x01 with \x02\x02 bytes\n".to_vec()
        );
    }

    #[test]
    fn test_retagging_reproduces_original_log() {
        let original = sample_log();
        let stripped = strip_prefixes(&original);
        let lines: Vec<&[u8]> = stripped.split_inclusive(|b| *b == b'\n').collect();
        assert_eq!(lines.len(), 3);

        let streams = [LogStream::Stdout, LogStream::Stderr, LogStream::Stdout];
        let mut rebuilt = Vec::new();
        for (line, stream) in lines.iter().zip(streams) {
            rebuilt.extend_from_slice(stream.prefix());
            rebuilt.extend_from_slice(line);
        }

        assert_eq!(rebuilt, original);
    }

    #[test]
    fn test_every_two_way_split_matches_whole_file() {
        let log = sample_log();
        let expected = strip_prefixes(&log);

        for cut in 0..=log.len() {
            let mut demuxer = LogDemuxer::new();
            let mut out = demuxer.push(&log[..cut]);
            out.extend(demuxer.push(&log[cut..]));
            out.extend(demuxer.finish());
            assert_eq!(out, expected, "split at byte {cut}");
        }
    }

    #[test]
    fn test_varied_chunk_sizes_match_whole_file() {
        let log = sample_log();
        let expected = strip_prefixes(&log);

        for sizes in [
            vec![1],
            vec![2],
            vec![3],
            vec![4, 1],
            vec![7, 2, 5],
            vec![1, 1, 2, 64],
        ] {
            assert_eq!(stream_in_chunks(&log, &sizes), expected, "sizes {sizes:?}");
        }
    }

    #[test]
    fn test_prefix_split_across_chunks_is_held_back() {
        let mut demuxer = LogDemuxer::new();

        assert_eq!(demuxer.push(b"ab\x01\x01"), b"ab".to_vec());
        assert_eq!(demuxer.pending(), 2);

        assert_eq!(demuxer.push(b"\x01cd"), b"cd".to_vec());
        assert_eq!(demuxer.pending(), 0);
    }

    #[test]
    fn test_non_prefix_tail_is_flushed_immediately() {
        let mut demuxer = LogDemuxer::new();

        assert_eq!(demuxer.push(b"ab\x01\x02"), b"ab\x01\x02".to_vec());
        assert_eq!(demuxer.pending(), 0);
    }

    #[test]
    fn test_incomplete_prefix_is_flushed_on_finish() {
        let mut demuxer = LogDemuxer::new();

        assert_eq!(demuxer.push(b"tail\x02\x02"), b"tail".to_vec());
        assert_eq!(demuxer.finish(), b"\x02\x02".to_vec());
        assert_eq!(strip_prefixes(b"tail\x02\x02"), b"tail\x02\x02".to_vec());
    }

    #[test]
    fn test_split_streams_separates_stdout_and_stderr() {
        let output = split_streams(&sample_log());

        assert_eq!(
            output.stdout,
            b"hello\ndone \x01 with \x02\x02 bytes\n".to_vec()
        );
        assert_eq!(output.stderr, b"warning: disk almost full\n".to_vec());
    }

    #[test]
    fn test_split_streams_untagged_bytes_go_to_stdout() {
        let mut log = b"untagged\n".to_vec();
        log.extend(tag_line(LogStream::Stderr, b"err"));

        let output = split_streams(&log);
        assert_eq!(output.stdout, b"untagged\n".to_vec());
        assert_eq!(output.stderr, b"err\n".to_vec());
    }

    #[test]
    fn test_tag_line_keeps_existing_newline() {
        assert_eq!(tag_line(LogStream::Stdout, b"Ada\n"), b"\x01\x01\x01Ada\n".to_vec());
        assert_eq!(tag_line(LogStream::Stderr, b"Ada"), b"\x02\x02\x02Ada\n".to_vec());
    }
}
