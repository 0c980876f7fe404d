//! Length-prefixed framing: `[len: u32 big-endian][payload: len bytes]`.

use thiserror::Error;

/// Width of the length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default upper bound on a single frame payload (1 MiB)
pub const DEFAULT_MAX_FRAME_LEN: u32 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: u32 },
}

/// Encode one frame
pub fn encode_frame(payload: &[u8], max_len: u32) -> Result<Vec<u8>, FrameError> {
    if payload.len() > max_len as usize {
        return Err(FrameError::TooLarge { len: payload.len(), max: max_len });
    }
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Incremental frame decoder.
///
/// Bytes may arrive in arbitrary chunks: a chunk can end inside the prefix,
/// inside a payload, or carry several frames at once.
#[derive(Debug)]
pub struct FrameDecoder {
    max_len: u32,
    prefix: [u8; LENGTH_PREFIX_LEN],
    prefix_filled: usize,
    payload: Vec<u8>,
    expected: Option<usize>,
}

impl FrameDecoder {
    pub fn new(max_len: u32) -> Self {
        Self {
            max_len,
            prefix: [0; LENGTH_PREFIX_LEN],
            prefix_filled: 0,
            payload: Vec::new(),
            expected: None,
        }
    }

    /// Feed a chunk, returning every frame it completed in arrival order.
    /// A prefix above the limit is rejected before any payload is buffered.
    pub fn decode(&mut self, mut chunk: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        let mut frames = Vec::new();

        while !chunk.is_empty() || self.expected == Some(self.payload.len()) {
            let expected = match self.expected {
                Some(expected) => expected,
                None => {
                    let take = (LENGTH_PREFIX_LEN - self.prefix_filled).min(chunk.len());
                    self.prefix[self.prefix_filled..self.prefix_filled + take]
                        .copy_from_slice(&chunk[..take]);
                    self.prefix_filled += take;
                    chunk = &chunk[take..];

                    if self.prefix_filled < LENGTH_PREFIX_LEN {
                        break;
                    }

                    let len = u32::from_be_bytes(self.prefix) as usize;
                    if len > self.max_len as usize {
                        return Err(FrameError::TooLarge { len, max: self.max_len });
                    }
                    self.prefix_filled = 0;
                    self.payload = Vec::with_capacity(len);
                    self.expected = Some(len);
                    len
                }
            };

            let take = (expected - self.payload.len()).min(chunk.len());
            self.payload.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];

            if self.payload.len() == expected {
                frames.push(std::mem::take(&mut self.payload));
                self.expected = None;
            }
        }

        Ok(frames)
    }

    /// Whether a frame is partially buffered
    pub fn has_partial(&self) -> bool {
        self.prefix_filled > 0 || self.expected.is_some()
    }
}
