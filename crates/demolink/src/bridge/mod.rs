//! Consumer-side bridge between the UI and the bus.
//!
//! # Architecture
//!
//! - **protocol**: control/negotiation strings and outbound command payloads
//! - **frame**: immutable frames and the latest-frame slots the UI polls
//! - **queue**: outbound command FIFO drained by a worker task
//! - **selector**: picks result or camera frame for display
//!
//! Subscription handlers run on the bus event loop and only swap state under
//! short locks. All publishing happens on the drain task.
//!
//! ```text
//! Disconnected --negotiation--> Bound{ready: false} --containerReady--> Bound{ready: true}
//!      ^                              |  ^                                   |
//!      +-------- containerStopped ----+  +------- new negotiation -----------+
//! ```

pub mod frame;
pub mod protocol;
pub mod queue;
mod selector;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusClient, BusError, Payload, Subscription};
use crate::config::BridgeConfig;
use crate::context::BusContext;
use crate::status::BridgeState;

use frame::{Frame, FrameSlot};
use protocol::{ChannelPair, CommandPayload, ControlCommand, expect_text};
use queue::{CommandQueue, Destination, OutboundCommand};

pub use selector::{DEFAULT_HOLD, FrameSelector};

/// Current result-channel subscription.
struct Binding {
    pair: ChannelPair,
    subscription: Subscription,
    generation: u64,
}

struct BridgeShared {
    config: BridgeConfig,
    client: BusClient,
    queue: CommandQueue,
    camera: FrameSlot,
    result: FrameSlot,
    binding: Mutex<Option<Binding>>,
    generation: AtomicU64,
    ready: AtomicBool,
    ready_count: AtomicU64,
}

impl BridgeShared {
    fn binding(&self) -> MutexGuard<'_, Option<Binding>> {
        self.binding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_camera(&self, payload: Payload) {
        if let Some(frame) = image_payload(&self.config.channels.camera, payload) {
            self.camera.store(frame);
        }
    }

    fn on_negotiation(self: &Arc<Self>, payload: Payload) {
        let pair = match expect_text(&payload).and_then(|text| text.parse::<ChannelPair>()) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "Rejecting channel negotiation, keeping current binding");
                return;
            }
        };

        let mut binding = self.binding();

        if let Some(current) = binding.as_ref()
            && current.pair == pair
        {
            tracing::debug!(channels = %pair, "Channels re-announced, binding unchanged");
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(self);
        let subscription = match self.client.subscribe(&pair.result, move |payload| {
            on_result(&weak, generation, payload)
        }) {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::error!(channel = %pair.result, error = %e, "Failed to subscribe to result channel");
                return;
            }
        };

        // Readiness belongs to a binding; the new workload must announce again.
        self.ready.store(false, Ordering::SeqCst);
        self.result.clear();
        if let Some(previous) = binding.take() {
            self.client.unsubscribe(&previous.subscription);
            tracing::info!(from = %previous.pair, to = %pair, "Rebinding workload channels");
        } else {
            tracing::info!(channels = %pair, "Binding workload channels");
        }

        *binding = Some(Binding {
            pair,
            subscription,
            generation,
        });
    }

    fn on_ready(&self, payload: Payload) {
        let count = self.ready_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.ready.store(true, Ordering::SeqCst);
        tracing::info!(count, kind = payload.kind(), "Workload ready");
    }

    fn on_stopped(&self, payload: Payload) {
        let tag = expect_text(&payload).unwrap_or("<unknown>").to_string();
        let mut binding = self.binding();
        if let Some(previous) = binding.take() {
            self.client.unsubscribe(&previous.subscription);
            tracing::info!(%tag, channels = %previous.pair, "Workload stopped, dropping binding");
        } else {
            tracing::debug!(%tag, "Workload stopped while disconnected");
        }
        self.result.clear();
        self.ready.store(false, Ordering::SeqCst);
    }

    fn resolve(&self, destination: &Destination) -> Option<String> {
        match destination {
            Destination::Supervisor => Some(self.config.channels.commands_in.clone()),
            Destination::Workload => self.binding().as_ref().map(|b| b.pair.command.clone()),
            Destination::Channel(name) => Some(name.clone()),
        }
    }

    async fn send(&self, command: OutboundCommand) {
        let Some(channel) = self.resolve(&command.destination) else {
            tracing::warn!(payload = ?command.payload, "No workload bound, dropping command");
            return;
        };

        tracing::debug!(%channel, payload = ?command.payload, "Sending command");
        if let Err(e) = self.client.publish(&channel, command.payload.into()).await {
            tracing::warn!(%channel, error = %e, "Failed to send command");
        }
    }
}

fn on_result(shared: &Weak<BridgeShared>, generation: u64, payload: Payload) {
    let Some(shared) = shared.upgrade() else {
        return;
    };

    // Held while storing so a concurrent rebind or termination cannot
    // interleave between the check and the write.
    let binding = shared.binding();
    let Some(current) = binding.as_ref().filter(|b| b.generation == generation) else {
        tracing::trace!(generation, "Discarding frame from superseded binding");
        return;
    };

    if !shared.ready.load(Ordering::SeqCst) {
        tracing::trace!(channel = %current.pair.result, "Workload not ready, dropping frame");
        return;
    }

    if let Some(frame) = image_payload(&current.pair.result, payload) {
        shared.result.store(frame);
    }
}

fn image_payload(channel: &str, payload: Payload) -> Option<Arc<Frame>> {
    match payload {
        Payload::Image(frame) if frame.is_well_formed() => Some(frame),
        Payload::Image(frame) => {
            tracing::warn!(
                %channel,
                width = frame.width,
                height = frame.height,
                len = frame.data.len(),
                "Dropping malformed frame"
            );
            None
        }
        other => {
            tracing::warn!(%channel, kind = other.kind(), "Expected an image payload");
            None
        }
    }
}

/// Consumer endpoint polled by the render loop.
pub struct FrameBridge {
    shared: Arc<BridgeShared>,
    subscriptions: Vec<Subscription>,
    cancel: CancellationToken,
    drainer: Option<JoinHandle<()>>,
}

impl FrameBridge {
    /// Subscribe to the well-known channels and start the drain task.
    pub fn start(ctx: &BusContext, config: BridgeConfig) -> Result<Self, BusError> {
        let client = ctx.client();
        let shared = Arc::new(BridgeShared {
            config,
            client: client.clone(),
            queue: CommandQueue::new(),
            camera: FrameSlot::new(),
            result: FrameSlot::new(),
            binding: Mutex::new(None),
            generation: AtomicU64::new(0),
            ready: AtomicBool::new(false),
            ready_count: AtomicU64::new(0),
        });

        let channels = shared.config.channels.clone();
        let mut subscriptions = Vec::with_capacity(4);

        let weak = Arc::downgrade(&shared);
        subscriptions.push(client.subscribe(&channels.camera, move |payload| {
            if let Some(shared) = weak.upgrade() {
                shared.on_camera(payload);
            }
        })?);

        let weak = Arc::downgrade(&shared);
        subscriptions.push(client.subscribe(&channels.commands_out, move |payload| {
            if let Some(shared) = weak.upgrade() {
                shared.on_negotiation(payload);
            }
        })?);

        let weak = Arc::downgrade(&shared);
        subscriptions.push(client.subscribe(&channels.ready, move |payload| {
            if let Some(shared) = weak.upgrade() {
                shared.on_ready(payload);
            }
        })?);

        let weak = Arc::downgrade(&shared);
        subscriptions.push(client.subscribe(&channels.stopped, move |payload| {
            if let Some(shared) = weak.upgrade() {
                shared.on_stopped(payload);
            }
        })?);

        let cancel = CancellationToken::new();
        let drainer = tokio::spawn(run_drain_loop(Arc::clone(&shared), cancel.clone()));

        tracing::info!(camera = %channels.camera, "Frame bridge started");
        Ok(Self {
            shared,
            subscriptions,
            cancel,
            drainer: Some(drainer),
        })
    }

    /// Enqueue a command; the drain task sends one entry per tick.
    pub fn append_command(&self, destination: Destination, payload: impl Into<CommandPayload>) {
        self.shared.queue.push(OutboundCommand {
            destination,
            payload: payload.into(),
        });
    }

    pub fn pending_commands(&self) -> usize {
        self.shared.queue.len()
    }

    /// Latest unread result frame.
    pub fn get_image(&self) -> Option<Arc<Frame>> {
        self.shared.result.take_fresh()
    }

    /// Latest unread camera frame.
    pub fn get_camera_stream(&self) -> Option<Arc<Frame>> {
        self.shared.camera.take_fresh()
    }

    pub fn clear_image(&self) {
        self.shared.result.clear();
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Number of readiness messages received so far.
    pub fn ready_count(&self) -> u64 {
        self.shared.ready_count.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> BridgeState {
        match self.shared.binding().as_ref() {
            Some(_) => BridgeState::Bound {
                ready: self.shared.ready.load(Ordering::SeqCst),
            },
            None => BridgeState::Disconnected,
        }
    }

    pub fn channels(&self) -> Option<ChannelPair> {
        self.shared.binding().as_ref().map(|b| b.pair.clone())
    }

    pub fn command_channel(&self) -> Option<String> {
        self.shared
            .binding()
            .as_ref()
            .map(|b| b.pair.command.clone())
    }

    pub fn request_start(&self, tag: &str) {
        self.append_command(Destination::Supervisor, ControlCommand::start(tag));
    }

    pub fn request_stop(&self, tag: &str) {
        self.append_command(Destination::Supervisor, ControlCommand::stop(tag));
    }

    /// Stop `from` (if any), start `to`, and forget the old workload's frames.
    pub fn switch_workload(&self, from: Option<&str>, to: &str) {
        if let Some(from) = from {
            self.request_stop(from);
        }
        self.request_start(to);
        self.reset_readiness();
        self.clear_image();
    }

    /// Send an integer opcode to the bound workload.
    pub fn send_opcode(&self, opcode: i64) {
        self.append_command(Destination::Workload, opcode);
    }

    pub fn reset_readiness(&self) {
        self.shared.ready.store(false, Ordering::SeqCst);
    }

    /// Stop the drain task and drop every subscription.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(drainer) = self.drainer.take()
            && let Err(e) = drainer.await
        {
            tracing::error!(error = %e, "Bridge drain task failed");
        }
        self.release();

        if !self.shared.queue.is_empty() {
            tracing::warn!(
                dropped = self.shared.queue.len(),
                "Bridge stopped with unsent commands"
            );
        }
        tracing::info!("Frame bridge stopped");
    }

    fn release(&mut self) {
        let client = &self.shared.client;
        for subscription in self.subscriptions.drain(..) {
            tracing::trace!(channel = subscription.channel(), "Releasing subscription");
            client.unsubscribe(&subscription);
        }
        if let Some(binding) = self.shared.binding().take() {
            client.unsubscribe(&binding.subscription);
        }
    }
}

impl Drop for FrameBridge {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.release();
    }
}

async fn run_drain_loop(shared: Arc<BridgeShared>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.drain_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Some(command) = shared.queue.pop() {
            shared.send(command).await;
        }
    }

    tracing::debug!("Bridge drain loop exiting");
}
