//! Display frame selection.
//!
//! A result frame stays on screen for a hold window after it arrives; after
//! that the display falls back to the camera passthrough. While the bridge is
//! not ready (no binding, readiness reset, workload stopped) only camera
//! frames are shown and any held result is forgotten.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::FrameBridge;
use super::frame::Frame;

pub const DEFAULT_HOLD: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct FrameSelector {
    hold: Duration,
    last_result: Option<(Arc<Frame>, Instant)>,
    last_camera: Option<Arc<Frame>>,
}

impl Default for FrameSelector {
    fn default() -> Self {
        Self::new(DEFAULT_HOLD)
    }
}

impl FrameSelector {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            last_result: None,
            last_camera: None,
        }
    }

    /// Poll the bridge once and return the frame to display.
    pub fn select(&mut self, bridge: &FrameBridge) -> Option<Arc<Frame>> {
        self.select_at(
            Instant::now(),
            bridge.is_ready(),
            bridge.get_image(),
            bridge.get_camera_stream(),
        )
    }

    /// Pick between freshly polled frames as of `now`.
    pub fn select_at(
        &mut self,
        now: Instant,
        ready: bool,
        result: Option<Arc<Frame>>,
        camera: Option<Arc<Frame>>,
    ) -> Option<Arc<Frame>> {
        if let Some(camera) = camera {
            self.last_camera = Some(camera);
        }

        if !ready {
            self.reset();
            return self.last_camera.clone();
        }

        if let Some(result) = result {
            self.last_result = Some((Arc::clone(&result), now));
            return Some(result);
        }

        if let Some((frame, received)) = &self.last_result
            && now.saturating_duration_since(*received) < self.hold
        {
            return Some(Arc::clone(frame));
        }

        self.last_camera.clone()
    }

    /// Forget the held result, e.g. when the workload changes.
    pub fn reset(&mut self) {
        self.last_result = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{marked_frame, marker_of};

    fn marker(frame: Option<Arc<Frame>>) -> Option<u8> {
        frame.map(|f| marker_of(&f))
    }

    #[test]
    fn camera_shown_until_first_result() {
        let mut selector = FrameSelector::default();
        let t0 = Instant::now();

        assert_eq!(selector.select_at(t0, true, None, None), None);
        assert_eq!(
            marker(selector.select_at(t0, true, None, Some(marked_frame(1)))),
            Some(1)
        );
        // Camera frame is reused when nothing new arrives.
        assert_eq!(marker(selector.select_at(t0, true, None, None)), Some(1));
    }

    #[test]
    fn result_held_for_window_then_camera() {
        let mut selector = FrameSelector::new(Duration::from_secs(5));
        let t0 = Instant::now();

        assert_eq!(
            marker(selector.select_at(t0, true, Some(marked_frame(7)), Some(marked_frame(1)))),
            Some(7)
        );
        assert_eq!(
            marker(selector.select_at(
                t0 + Duration::from_secs(4),
                true,
                None,
                Some(marked_frame(2))
            )),
            Some(7)
        );
        assert_eq!(
            marker(selector.select_at(t0 + Duration::from_secs(5), true, None, None)),
            Some(2)
        );
    }

    #[test]
    fn not_ready_drops_held_result() {
        let mut selector = FrameSelector::default();
        let t0 = Instant::now();
        selector.select_at(t0, true, Some(marked_frame(7)), Some(marked_frame(1)));

        assert_eq!(marker(selector.select_at(t0, false, None, None)), Some(1));
        // The held result does not come back once readiness returns.
        assert_eq!(marker(selector.select_at(t0, true, None, None)), Some(1));
    }

    #[test]
    fn result_ignored_while_not_ready() {
        let mut selector = FrameSelector::default();
        let t0 = Instant::now();

        assert_eq!(
            marker(selector.select_at(t0, false, Some(marked_frame(7)), Some(marked_frame(1)))),
            Some(1)
        );
    }

    #[test]
    fn reset_drops_held_result() {
        let mut selector = FrameSelector::default();
        let t0 = Instant::now();
        selector.select_at(t0, true, Some(marked_frame(7)), Some(marked_frame(1)));

        selector.reset();

        assert_eq!(marker(selector.select_at(t0, true, None, None)), Some(1));
    }
}
