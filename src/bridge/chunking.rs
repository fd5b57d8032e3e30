//! Frame splitting for the side channel's single-frame limit
//!
//! A message longer than the limit goes out as continuation frames of
//! `'+'` followed by `limit - 1` payload bytes, then one final frame with the
//! remaining bytes and no prefix. The receiver concatenates continuation data
//! until it sees an unprefixed frame.

/// Marker byte opening a continuation frame
pub const CONTINUATION: u8 = b'+';

/// Split `payload` into frames of at most `limit` bytes
///
/// Every returned frame is non-empty unless `payload` is empty, in which
/// case no frames are produced.
#[must_use]
pub fn split_frames(payload: &[u8], limit: usize) -> Vec<Vec<u8>> {
    if payload.is_empty() {
        return Vec::new();
    }
    if payload.len() <= limit || limit < 2 {
        return vec![payload.to_vec()];
    }

    let data_per_frame = limit - 1;
    let mut frames = Vec::with_capacity(payload.len() / data_per_frame + 1);
    let mut rest = payload;

    while rest.len() > limit {
        let (head, tail) = rest.split_at(data_per_frame);
        let mut frame = Vec::with_capacity(limit);
        frame.push(CONTINUATION);
        frame.extend_from_slice(head);
        frames.push(frame);
        rest = tail;
    }
    frames.push(rest.to_vec());
    frames
}

/// Receiver-side reassembly of split messages
#[derive(Debug, Default, Clone)]
pub struct Reassembler {
    buf: Vec<u8>,
}

impl Reassembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame; returns the complete message on its final frame
    pub fn push(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        if let Some((&CONTINUATION, data)) = frame.split_first() {
            self.buf.extend_from_slice(data);
            return None;
        }

        let mut message = std::mem::take(&mut self.buf);
        message.extend_from_slice(frame);
        Some(message)
    }

    /// Whether continuation data is waiting for its final frame
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.buf.is_empty()
    }
}
