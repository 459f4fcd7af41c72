//! Incremental UTF-8 decoding of PTY output.
//!
//! PTY reads split multi-byte characters at arbitrary points, so an
//! incomplete trailing sequence is held back until the next chunk. Invalid
//! bytes become U+FFFD; decoding never fails.

use tracing::debug;

/// Longest possible incomplete UTF-8 prefix.
const MAX_PENDING: usize = 3;

/// Stateful decoder for a single byte stream.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
    replaced: u64,
}

impl Utf8StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a chunk, returning all complete text.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(chunk);

        let mut out = String::with_capacity(input.len());
        let mut rest = input.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    // `valid_up_to` marks an already verified prefix.
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            self.replace(&tail[..bad]);
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[bad..];
                        }
                        None => {
                            // Incomplete sequence at the end of the chunk.
                            if tail.len() <= MAX_PENDING {
                                self.pending.extend_from_slice(tail);
                            } else {
                                self.replace(tail);
                                out.push(char::REPLACEMENT_CHARACTER);
                            }
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush held-back bytes at end of stream.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let pending = std::mem::take(&mut self.pending);
        self.replace(&pending);
        char::REPLACEMENT_CHARACTER.to_string()
    }

    /// Number of invalid sequences replaced so far.
    pub fn replaced(&self) -> u64 {
        self.replaced
    }

    fn replace(&mut self, bytes: &[u8]) {
        self.replaced += 1;
        debug!(bytes = ?bytes, "replaced invalid UTF-8 in PTY output");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ascii() {
        let mut d = Utf8StreamDecoder::new();
        assert_eq!(d.decode(b"hello\r\n"), "hello\r\n");
        assert_eq!(d.replaced(), 0);
    }

    #[test]
    fn split_multibyte_sequence() {
        let bytes = "héllo ✓".as_bytes();
        let mut d = Utf8StreamDecoder::new();
        // Split inside the 3-byte check mark.
        let cut = bytes.len() - 1;
        let first = d.decode(&bytes[..cut]);
        let second = d.decode(&bytes[cut..]);
        assert_eq!(format!("{first}{second}"), "héllo ✓");
        assert_eq!(d.replaced(), 0);
    }

    #[test]
    fn byte_at_a_time() {
        let text = "añ€𝄞";
        let mut d = Utf8StreamDecoder::new();
        let mut out = String::new();
        for b in text.as_bytes() {
            out.push_str(&d.decode(std::slice::from_ref(b)));
        }
        assert_eq!(out, text);
    }

    #[test]
    fn invalid_bytes_replaced() {
        let mut d = Utf8StreamDecoder::new();
        assert_eq!(d.decode(b"ok\xffgo\xfe"), "ok\u{FFFD}go\u{FFFD}");
        assert_eq!(d.replaced(), 2);
    }

    #[test]
    fn truncated_sequence_flushed_on_finish() {
        let mut d = Utf8StreamDecoder::new();
        assert_eq!(d.decode(b"x\xe2\x9c"), "x");
        assert_eq!(d.finish(), "\u{FFFD}");
        assert_eq!(d.finish(), "");
    }
}
