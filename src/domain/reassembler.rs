//! Frame Reassembler
//!
//! Turns an ordered stream of notification payloads into text. Payload
//! sizes are decided by the radio, so neither a UTF-8 character nor the
//! end-of-stream sentinel is guaranteed to sit inside a single fragment.
//!
//! ```text
//! fragment bytes ──► FragmentDecoder ──► text ──► FrameReassembler ──► Framing
//!                    (carries split          (cumulative buffer,
//!                     code points)            sentinel search)
//! ```

/// Marker terminating a CSV transfer
pub const CSV_END_SENTINEL: &str = "__CSV_END__";

/// Output of decoding one fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub text: String,
    /// Number of malformed sequences replaced with U+FFFD
    pub replaced: usize,
}

/// Incremental UTF-8 decoder.
///
/// A multi-byte character cut by a fragment boundary is held back and
/// completed by the next fragment instead of being reported as malformed.
#[derive(Debug, Default)]
pub struct FragmentDecoder {
    pending: Vec<u8>,
}

impl FragmentDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, fragment: &[u8]) -> Decoded {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(fragment);

        let mut text = String::with_capacity(bytes.len());
        let mut replaced = 0;
        let mut rest = bytes.as_slice();

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, invalid) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            replaced += 1;
                            rest = &invalid[len..];
                        }
                        None => {
                            // Truncated sequence at the end, at most 3 bytes
                            self.pending = invalid.to_vec();
                            break;
                        }
                    }
                }
            }
        }

        Decoded { text, replaced }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

/// Append-only accumulator for an in-progress CSV capture
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    text: String,
}

impl ReassemblyBuffer {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    fn clear(&mut self) -> usize {
        let discarded = self.text.len();
        self.text.clear();
        discarded
    }
}

/// Result of feeding one decoded fragment into the reassembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// No sentinel yet
    Pending {
        fragment_len: usize,
        buffered_len: usize,
    },
    /// Sentinel seen; everything before its first occurrence
    Complete(String),
}

#[derive(Debug)]
pub struct FrameReassembler {
    sentinel: String,
    buffer: ReassemblyBuffer,
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new(CSV_END_SENTINEL)
    }
}

impl FrameReassembler {
    /// An empty sentinel would match immediately, so it is replaced by the default one
    pub fn new(sentinel: impl Into<String>) -> Self {
        let mut sentinel = sentinel.into();
        if sentinel.is_empty() {
            sentinel = CSV_END_SENTINEL.to_string();
        }
        Self {
            sentinel,
            buffer: ReassemblyBuffer::default(),
        }
    }

    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }

    pub fn buffer(&self) -> &ReassemblyBuffer {
        &self.buffer
    }

    /// Drop whatever was buffered, returning its length in bytes
    pub fn reset(&mut self) -> usize {
        self.buffer.clear()
    }

    /// Append a fragment and look for the sentinel in the cumulative buffer.
    ///
    /// The buffer never holds a complete sentinel between calls, so the
    /// search only has to start `sentinel.len() - 1` bytes before the old
    /// end to catch one that straddles the boundary.
    pub fn push(&mut self, fragment: &str) -> Framing {
        let text = &mut self.buffer.text;
        let resume = text.len().saturating_sub(self.sentinel.len() - 1);
        let start = floor_char_boundary(text, resume);
        text.push_str(fragment);

        match text[start..].find(self.sentinel.as_str()) {
            Some(offset) => {
                let mut csv = std::mem::take(text);
                csv.truncate(start + offset);
                Framing::Complete(csv)
            }
            None => Framing::Pending {
                fragment_len: fragment.len(),
                buffered_len: text.len(),
            },
        }
    }
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}
