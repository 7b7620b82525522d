//! Bounded capture of child-process output.
//!
//! The cap is enforced at the write-call boundary: once a stream has
//! produced its budget, further bytes are read and discarded so the child
//! never blocks on a full pipe, but nothing more is buffered.

use std::io::{Read, Write};
use std::thread::{self, JoinHandle};

/// Per-stream capture budget for stdout and stderr.
pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Appended to a stream that exceeded its budget.
pub const TRUNCATION_NOTICE: &str = "\n... output truncated (64 KB limit) ...";

/// Writer that stops accepting bytes after `limit`, silently discarding the
/// rest.
#[derive(Debug)]
pub struct CappedWriter {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CappedWriter {
    pub fn new(limit: usize) -> Self {
        CappedWriter {
            buf: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_captured(self) -> CapturedOutput {
        CapturedOutput {
            text: String::from_utf8_lossy(&self.buf).into_owned(),
            truncated: self.truncated,
        }
    }
}

impl Write for CappedWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        if self.truncated {
            return Ok(data.len());
        }

        let remaining = self.limit.saturating_sub(self.buf.len());
        if remaining == 0 {
            self.truncated = true;
            return Ok(data.len());
        }

        if data.len() > remaining {
            self.truncated = true;
            self.buf.extend_from_slice(&data[..remaining]);
        } else {
            self.buf.extend_from_slice(data);
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// One fully drained stream.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    pub text: String,
    pub truncated: bool,
}

impl CapturedOutput {
    /// Render the stream for the result payload, appending the truncation
    /// notice when the cap was hit.
    pub fn into_bounded_string(self) -> String {
        if self.truncated {
            let mut text = self.text;
            text.push_str(TRUNCATION_NOTICE);
            text
        } else {
            self.text
        }
    }
}

/// Drain `reader` to EOF on a dedicated thread, keeping at most `limit`
/// bytes. The thread must run concurrently with the child so a chatty
/// program cannot deadlock on a full pipe.
pub fn capture_stream<R>(reader: R, limit: usize) -> JoinHandle<CapturedOutput>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = reader;
        let mut sink = CappedWriter::new(limit);
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    // CappedWriter::write never fails.
                    let _ = sink.write(&chunk[..n]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        sink.into_captured()
    })
}

/// Join a capture thread, degrading to empty output if it panicked.
pub fn join_capture(handle: JoinHandle<CapturedOutput>) -> CapturedOutput {
    match handle.join() {
        Ok(captured) => captured,
        Err(_) => {
            log::warn!("output capture thread panicked; stream reported empty");
            CapturedOutput::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_below_limit_pass_through() {
        let mut writer = CappedWriter::new(16);
        writer.write_all(b"hello").unwrap();
        let captured = writer.into_captured();
        assert_eq!(captured.text, "hello");
        assert!(!captured.truncated);
    }

    #[test]
    fn write_at_exact_limit_is_not_truncated() {
        let mut writer = CappedWriter::new(5);
        writer.write_all(b"hello").unwrap();
        let captured = writer.into_captured();
        assert_eq!(captured.text, "hello");
        assert!(!captured.truncated);
    }

    #[test]
    fn write_crossing_the_limit_keeps_the_prefix() {
        let mut writer = CappedWriter::new(4);
        writer.write_all(b"hello").unwrap();
        let captured = writer.into_captured();
        assert_eq!(captured.text, "hell");
        assert!(captured.truncated);
    }

    #[test]
    fn bytes_after_truncation_are_discarded_without_error() {
        let mut writer = CappedWriter::new(4);
        writer.write_all(b"hello").unwrap();
        writer.write_all(b"world").unwrap();
        writer.write_all(b"again").unwrap();
        let captured = writer.into_captured();
        assert_eq!(captured.text.len(), 4);
    }

    #[test]
    fn bounded_even_for_multi_mebibyte_streams() {
        let mut writer = CappedWriter::new(MAX_OUTPUT_BYTES);
        let chunk = vec![b'x'; 8192];
        // 10 MiB total, far beyond the cap.
        for _ in 0..1280 {
            writer.write_all(&chunk).unwrap();
        }
        let rendered = writer.into_captured().into_bounded_string();
        assert!(rendered.len() <= MAX_OUTPUT_BYTES + TRUNCATION_NOTICE.len());
        assert!(rendered.ends_with(TRUNCATION_NOTICE));
    }

    #[test]
    fn capture_stream_drains_to_eof() {
        let data = vec![b'a'; 100_000];
        let handle = capture_stream(std::io::Cursor::new(data), MAX_OUTPUT_BYTES);
        let captured = join_capture(handle);
        assert_eq!(captured.text.len(), MAX_OUTPUT_BYTES);
        assert!(captured.truncated);
    }

    #[test]
    fn untruncated_stream_has_no_notice() {
        let handle = capture_stream(std::io::Cursor::new(b"done\n".to_vec()), MAX_OUTPUT_BYTES);
        let rendered = join_capture(handle).into_bounded_string();
        assert_eq!(rendered, "done\n");
    }
}
