//! Incremental `multipart/x-mixed-replace` splitter

use tracing::{debug, warn};

const HEADER_END: &[u8] = b"\r\n\r\n";
/// Headers longer than this without a terminator are treated as garbage
const MAX_HEADER_BYTES: usize = 4096;

/// Splits an unbounded byte stream into part payloads.
///
/// Every part starts with the boundary token, carries a `Content-Length`
/// header and is followed by exactly that many payload bytes. Only complete
/// payloads are ever returned.
pub struct MultipartParser {
    boundary: Vec<u8>,
    buffer: Vec<u8>,
    max_part_bytes: usize,
    malformed_parts: u64,
}

impl MultipartParser {
    pub fn new(boundary: impl AsRef<[u8]>, max_part_bytes: usize) -> Self {
        Self {
            boundary: boundary.as_ref().to_vec(),
            buffer: Vec::with_capacity(64 * 1024),
            max_part_bytes,
            malformed_parts: 0,
        }
    }

    /// Append bytes and return every payload completed by them, oldest first
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut parts = Vec::new();
        let blen = self.boundary.len();

        loop {
            let Some(bidx) = find(&self.buffer, &self.boundary, 0) else {
                // A boundary split across chunks fits in the retained tail
                let keep = 2 * blen;
                if self.buffer.len() > keep {
                    let drain_len = self.buffer.len() - keep;
                    self.buffer.drain(..drain_len);
                }
                break;
            };

            let header_start = bidx + blen;
            let Some(h_end) = find(&self.buffer, HEADER_END, header_start) else {
                if self.buffer.len() - header_start > MAX_HEADER_BYTES {
                    warn!("Multipart headers exceed {} bytes, resyncing", MAX_HEADER_BYTES);
                    self.malformed_parts += 1;
                    self.buffer.drain(..header_start);
                    continue;
                }
                break;
            };

            let payload_start = h_end + HEADER_END.len();
            let Some(length) = content_length(&self.buffer[header_start..h_end]) else {
                debug!("Multipart part without Content-Length, resyncing");
                self.malformed_parts += 1;
                self.buffer.drain(..payload_start);
                continue;
            };

            if length > self.max_part_bytes {
                warn!(
                    "Multipart part declares {} bytes (max {}), resyncing",
                    length, self.max_part_bytes
                );
                self.malformed_parts += 1;
                self.buffer.drain(..payload_start);
                continue;
            }

            if self.buffer.len() < payload_start + length {
                break;
            }

            let payload = self.buffer[payload_start..payload_start + length].to_vec();
            self.buffer.drain(..payload_start + length);
            parts.push(payload);
        }

        parts
    }

    /// Parts dropped for missing or oversized length headers
    pub fn malformed_parts(&self) -> u64 {
        self.malformed_parts
    }

    /// Bytes currently held while waiting for more input
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() || haystack.len() - from < needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

fn content_length(headers: &[u8]) -> Option<usize> {
    let text = String::from_utf8_lossy(headers);
    text.split("\r\n").find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse::<usize>().ok()
        } else {
            None
        }
    })
}
