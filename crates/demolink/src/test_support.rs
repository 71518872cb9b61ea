//! Shared helpers for async tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bridge::frame::Frame;
use crate::bus::Payload;
use crate::context::BusContext;

/// Poll `check` until it holds, failing the test after ~2s.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Give the event loops a moment to drain pending deliveries.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

/// Subscribe on `channel` and collect every payload received.
pub fn record(ctx: &BusContext, channel: &str) -> Arc<Mutex<Vec<Payload>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    ctx.client()
        .subscribe(channel, move |payload| sink.lock().unwrap().push(payload))
        .unwrap();
    seen
}

pub fn texts(seen: &Arc<Mutex<Vec<Payload>>>) -> Vec<String> {
    seen.lock()
        .unwrap()
        .iter()
        .filter_map(|p| match p {
            Payload::Text(t) => Some(t.clone()),
            _ => None,
        })
        .collect()
}

/// A 1x1 RGB frame whose pixel bytes are all `marker`.
pub fn marked_frame(marker: u8) -> Arc<Frame> {
    Arc::new(Frame::new(1, 1, 3, vec![marker; 3]))
}

pub fn marker_of(frame: &Frame) -> u8 {
    frame.data[0]
}
