//! Video frames and the size-1 overwrite buffer that holds them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

/// An immutable decoded image.
///
/// Pixel data is row-major, `channels` bytes per pixel. `Bytes` keeps clones cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub data: Bytes,
}

impl Frame {
    pub fn new(width: u32, height: u32, channels: u8, data: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            channels,
            data: data.into(),
        }
    }

    /// Expected length of `data` for the declared geometry.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }

    pub fn is_well_formed(&self) -> bool {
        self.data.len() == self.expected_len()
    }
}

#[derive(Default)]
struct SlotState {
    frame: Option<Arc<Frame>>,
    fresh: bool,
}

/// Latest-frame buffer for one stream.
///
/// Writers overwrite; the single consumer takes each frame at most once.
#[derive(Default)]
pub struct FrameSlot {
    state: Mutex<SlotState>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    // Frame state stays consistent across a panicking writer: every update is
    // a plain field assignment.
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the buffered frame and mark it unread.
    pub fn store(&self, frame: Arc<Frame>) {
        let mut state = self.lock();
        state.frame = Some(frame);
        state.fresh = true;
    }

    /// Return the buffered frame if it has not been taken yet.
    pub fn take_fresh(&self) -> Option<Arc<Frame>> {
        let mut state = self.lock();
        if !state.fresh {
            return None;
        }
        state.fresh = false;
        state.frame.clone()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.frame = None;
        state.fresh = false;
    }
}
