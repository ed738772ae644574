//! Bounded history log for one session.
//!
//! Every byte the child writes is appended here so that channels attaching
//! mid-stream can be brought up to date with a single replay. The log never
//! grows past its configured limit: the oldest bytes are discarded first.

use bytes::{Bytes, BytesMut};

/// Default history limit in bytes.
pub const DEFAULT_HISTORY_LIMIT: usize = 500_000;

/// Append-only byte log with a hard upper bound.
#[derive(Debug)]
pub struct SessionBuffer {
    data: BytesMut,
    limit: usize,
    /// Total bytes ever appended, including trimmed ones.
    appended: u64,
}

impl SessionBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(limit.min(64 * 1024)),
            limit,
            appended: 0,
        }
    }

    /// Append a chunk, trimming from the front until `len() <= limit`.
    ///
    /// When a trim lands inside a UTF-8 sequence the cut is moved forward to
    /// the next character boundary, so a replay never starts with a torn
    /// character. Moving forward only ever shortens the log.
    pub fn append(&mut self, chunk: &[u8]) {
        self.appended += chunk.len() as u64;
        if self.limit == 0 {
            return;
        }

        // A chunk larger than the whole log only contributes its tail.
        let chunk = if chunk.len() > self.limit {
            &chunk[chunk.len() - self.limit..]
        } else {
            chunk
        };

        let overflow = (self.data.len() + chunk.len()).saturating_sub(self.limit);
        if overflow > 0 {
            if overflow >= self.data.len() {
                self.data.clear();
            } else {
                let _ = self.data.split_to(overflow);
            }
        }
        self.data.extend_from_slice(chunk);

        let skip = leading_continuation_bytes(&self.data);
        if skip > 0 && overflow > 0 {
            let _ = self.data.split_to(skip);
        }
    }

    /// A copy of the current history, verbatim.
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Total number of bytes appended over the buffer's lifetime.
    pub fn total_appended(&self) -> u64 {
        self.appended
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// Number of UTF-8 continuation bytes (`0b10xx_xxxx`) at the start of `data`,
/// capped at 3 (the longest possible tail of a torn character).
fn leading_continuation_bytes(data: &[u8]) -> usize {
    data.iter()
        .take(3)
        .take_while(|b| (**b & 0xC0) == 0x80)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_within_limit_keeps_everything() {
        let mut buf = SessionBuffer::new(16);
        buf.append(b"hello ");
        buf.append(b"world");
        assert_eq!(buf.snapshot(), Bytes::from_static(b"hello world"));
        assert_eq!(buf.len(), 11);
    }

    #[test]
    fn append_trims_oldest_first() {
        let mut buf = SessionBuffer::new(8);
        buf.append(b"abcdef");
        buf.append(b"ghij");
        assert_eq!(buf.snapshot(), Bytes::from_static(b"cdefghij"));
    }

    #[test]
    fn oversized_chunk_keeps_tail() {
        let mut buf = SessionBuffer::new(4);
        buf.append(b"0123456789");
        assert_eq!(buf.snapshot(), Bytes::from_static(b"6789"));
        assert_eq!(buf.total_appended(), 10);
    }

    #[test]
    fn length_never_exceeds_limit() {
        let mut buf = SessionBuffer::new(100);
        for i in 0..500usize {
            let chunk = vec![b'x'; (i * 7) % 43 + 1];
            buf.append(&chunk);
            assert!(buf.len() <= buf.limit(), "len {} > limit", buf.len());
        }
    }

    #[test]
    fn trim_does_not_start_inside_a_character() {
        let mut buf = SessionBuffer::new(5);
        // "é" is two bytes (0xC3 0xA9).
        buf.append("aé".as_bytes());
        buf.append(b"bc");
        // Exactly at limit: nothing trimmed.
        assert_eq!(buf.snapshot(), Bytes::from("aébc"));
        buf.append(b"d");
        // Dropping one byte ("a") leaves a valid start.
        assert_eq!(buf.snapshot(), Bytes::from("ébcd"));
        buf.append(b"e");
        // Dropping one more would tear "é"; the continuation byte goes too.
        assert_eq!(buf.snapshot(), Bytes::from("bcde"));
        assert!(std::str::from_utf8(&buf.snapshot()).is_ok());
    }

    #[test]
    fn zero_limit_stores_nothing() {
        let mut buf = SessionBuffer::new(0);
        buf.append(b"anything");
        assert!(buf.is_empty());
        assert_eq!(buf.total_appended(), 8);
    }

    #[test]
    fn clear_empties_the_log() {
        let mut buf = SessionBuffer::new(DEFAULT_HISTORY_LIMIT);
        buf.append(b"data");
        buf.clear();
        assert!(buf.is_empty());
    }
}
