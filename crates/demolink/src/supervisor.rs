//! Workload supervisor - keeps at most one demo container running.
//!
//! Separates message intake from container lifecycle:
//! - The bus handler only overwrites a single pending-command slot (last write wins)
//! - A poll task takes that slot and talks to the engine outside the lock,
//!   so a slow `docker run` never delays message delivery
//! - Engine failures are logged and never leave a stale active slot

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{ControlCommand, ControlOp, expect_text};
use crate::bus::{BusClient, BusError, Payload, Publisher, Subscription};
use crate::config::SupervisorConfig;
use crate::context::BusContext;
use crate::engine::{BindMount, ContainerEngine, InstanceHandle, LaunchSpec, find_image};
use crate::status::{SupervisorSnapshot, WorkloadStatus};

/// The occupant of the single workload slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadDescriptor {
    pub image_tag: String,
    pub instance: InstanceHandle,
    pub status: WorkloadStatus,
    pub started_at: DateTime<Utc>,
}

struct SupervisorCore {
    engine: Arc<dyn ContainerEngine>,
    config: SupervisorConfig,
    pending: StdMutex<Option<String>>,
    active: tokio::sync::Mutex<Option<WorkloadDescriptor>>,
    negotiation: Publisher,
    stopped: Publisher,
}

impl SupervisorCore {
    fn submit(&self, raw: String) {
        tracing::info!(command = %raw, "Got control command");
        let previous = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(raw);
        if let Some(previous) = previous {
            tracing::debug!(superseded = %previous, "Unconsumed control command superseded");
        }
    }

    fn take_pending(&self) -> Option<String> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn handle(&self, raw: &str) {
        let command = match raw.parse::<ControlCommand>() {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(command = %raw, error = %e, "Dropping malformed control command");
                return;
            }
        };

        match command.op {
            ControlOp::Start => self.start_workload(&command.tag).await,
            ControlOp::Stop => self.stop_workload(&command.tag).await,
        }
    }

    async fn start_workload(&self, tag: &str) {
        let images = match self.engine.list_images().await {
            Ok(images) => images,
            Err(e) => {
                tracing::error!(%tag, error = %e, "Failed to list images, dropping start");
                return;
            }
        };

        let Some(image) = find_image(&images, tag) else {
            tracing::warn!(%tag, "No image with matching tag, dropping start");
            return;
        };

        let mut active = self.active.lock().await;

        if active.as_ref().is_some_and(|w| w.image_tag == tag) {
            tracing::info!(%tag, "Workload already active, republishing channels");
            drop(active);
            self.announce_channels().await;
            return;
        }

        if let Some(previous) = active.take() {
            self.terminate(previous).await;
        }

        let pair = &self.config.negotiated;
        let spec = LaunchSpec {
            image_id: image.id.clone(),
            args: vec![pair.result.clone(), pair.command.clone()],
            accelerator: Some(self.config.accelerator.clone()),
            auto_remove: true,
            mounts: vec![BindMount::shared(&self.config.transport_endpoint)],
        };

        tracing::info!(%tag, image = %image.id, "Launching workload");
        match self.engine.run(&spec).await {
            Ok(instance) => {
                tracing::info!(%tag, %instance, "Workload running");
                *active = Some(WorkloadDescriptor {
                    image_tag: tag.to_string(),
                    instance,
                    status: WorkloadStatus::Running,
                    started_at: Utc::now(),
                });
                drop(active);
                self.announce_channels().await;
            }
            Err(e) => {
                tracing::error!(%tag, error = %e, "Failed to launch workload");
            }
        }
    }

    async fn stop_workload(&self, tag: &str) {
        let mut active = self.active.lock().await;
        let Some(workload) = active.take() else {
            tracing::debug!(%tag, "No active workload, ignoring stop");
            return;
        };

        if workload.image_tag != tag {
            tracing::debug!(
                requested = %tag,
                active = %workload.image_tag,
                "Stop names a different tag, stopping the active workload"
            );
        }
        self.terminate(workload).await;
    }

    /// Stop an instance already removed from the slot and tell consumers.
    async fn terminate(&self, workload: WorkloadDescriptor) {
        tracing::info!(tag = %workload.image_tag, instance = %workload.instance, "Stopping workload");
        if let Err(e) = self.engine.stop(&workload.instance).await {
            tracing::error!(
                tag = %workload.image_tag,
                instance = %workload.instance,
                error = %e,
                "Failed to stop workload, clearing slot anyway"
            );
        }

        if let Err(e) = self.stopped.send(Payload::Text(workload.image_tag)).await {
            tracing::warn!(
                channel = %self.stopped.channel(),
                error = %e,
                "Failed to publish termination notice"
            );
        }
    }

    async fn announce_channels(&self) {
        let pair = self.config.negotiated.to_string();
        tracing::debug!(channels = %pair, "Publishing negotiated channels");
        if let Err(e) = self.negotiation.send(Payload::Text(pair)).await {
            tracing::error!(
                channel = %self.negotiation.channel(),
                error = %e,
                "Failed to publish negotiated channels"
            );
        }
    }
}

/// Supervisor bound to a bus context and a container engine.
pub struct WorkloadSupervisor {
    core: Arc<SupervisorCore>,
    client: BusClient,
    subscription: Option<Subscription>,
    cancel: CancellationToken,
    poller: Option<JoinHandle<()>>,
}

impl WorkloadSupervisor {
    /// Subscribe to the control channel and start the poll task.
    pub fn start(
        ctx: &BusContext,
        engine: Arc<dyn ContainerEngine>,
        config: SupervisorConfig,
    ) -> Result<Self, BusError> {
        let client = ctx.client();
        let core = Arc::new(SupervisorCore {
            engine,
            negotiation: client.publisher(config.channels.commands_out.clone()),
            stopped: client.publisher(config.channels.stopped.clone()),
            pending: StdMutex::new(None),
            active: tokio::sync::Mutex::new(None),
            config,
        });

        let intake = Arc::clone(&core);
        let subscription =
            client.subscribe(&core.config.channels.commands_in, move |payload| {
                match expect_text(&payload) {
                    Ok(text) => intake.submit(text.to_string()),
                    Err(e) => tracing::warn!(error = %e, "Ignoring control message"),
                }
            })?;

        let cancel = CancellationToken::new();
        let poller = tokio::spawn(run_poll_loop(Arc::clone(&core), cancel.clone()));

        tracing::info!(
            channel = %subscription.channel(),
            subscription = %subscription.id(),
            "Workload supervisor listening"
        );

        Ok(Self {
            core,
            client,
            subscription: Some(subscription),
            cancel,
            poller: Some(poller),
        })
    }

    /// Place a raw command in the pending slot, as if it arrived on the bus.
    pub fn submit(&self, raw: impl Into<String>) {
        self.core.submit(raw.into());
    }

    /// Execute a raw `"<op> <tag>"` command immediately.
    pub async fn handle(&self, raw: &str) {
        self.core.handle(raw).await;
    }

    pub async fn active(&self) -> Option<WorkloadDescriptor> {
        self.core.active.lock().await.clone()
    }

    pub async fn snapshot(&self) -> SupervisorSnapshot {
        let active = self.core.active.lock().await;
        SupervisorSnapshot {
            status: active
                .as_ref()
                .map(|w| w.status)
                .unwrap_or(WorkloadStatus::Idle),
            image_tag: active.as_ref().map(|w| w.image_tag.clone()),
            instance: active.as_ref().map(|w| w.instance.to_string()),
            started_at: active.as_ref().map(|w| w.started_at),
            channels: self.core.config.negotiated.clone(),
        }
    }

    /// Stop polling, then stop any active workload.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(poller) = self.poller.take()
            && let Err(e) = poller.await
        {
            tracing::error!(error = %e, "Supervisor poll task failed");
        }

        if let Some(subscription) = self.subscription.take() {
            self.client.unsubscribe(&subscription);
        }

        if let Some(workload) = self.core.active.lock().await.take() {
            self.core.terminate(workload).await;
        }
        tracing::info!("Workload supervisor stopped");
    }

    /// Run until SIGINT/SIGTERM, then shut down.
    pub async fn run_until_signal(self) -> anyhow::Result<()> {
        let waited = crate::shutdown::wait_for_signal().await;
        self.shutdown().await;
        waited
    }
}

impl Drop for WorkloadSupervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(subscription) = self.subscription.take() {
            self.client.unsubscribe(&subscription);
        }
    }
}

async fn run_poll_loop(core: Arc<SupervisorCore>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(core.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Some(raw) = core.take_pending() {
            core.handle(&raw).await;
        }
    }

    tracing::debug!("Supervisor poll loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::ChannelPair;
    use crate::bus::LocalTransport;
    use crate::engine::fake::FakeEngine;
    use crate::test_support::{eventually, record, settle, texts};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Harness {
        supervisor: WorkloadSupervisor,
        engine: Arc<FakeEngine>,
        transport: Arc<LocalTransport>,
        consumer: BusContext,
        announced: Arc<StdMutex<Vec<Payload>>>,
        stopped: Arc<StdMutex<Vec<Payload>>>,
        ctx: BusContext,
    }

    fn harness(tags: &[&str], poll: Duration) -> Harness {
        let transport = Arc::new(LocalTransport::new());
        let ctx = BusContext::connect(transport.clone()).unwrap();
        let consumer = BusContext::connect(transport.clone()).unwrap();
        let announced = record(&consumer, "commandsOut");
        let stopped = record(&consumer, "containerStopped");

        let engine = Arc::new(FakeEngine::with_tags(tags));
        let config = SupervisorConfig::new().with_poll_interval(poll);
        let supervisor = WorkloadSupervisor::start(&ctx, engine.clone(), config).unwrap();

        Harness {
            supervisor,
            engine,
            transport,
            consumer,
            announced,
            stopped,
            ctx,
        }
    }

    impl Harness {
        async fn finish(self) {
            self.supervisor.shutdown().await;
            self.consumer.shutdown().await;
            self.ctx.shutdown().await;
        }
    }

    #[tokio::test]
    async fn start_launches_and_announces_channels() {
        let h = harness(&["tagX"], Duration::from_millis(5));

        h.consumer
            .client()
            .publish("commandsIn", Payload::Text("1 tagX".to_string()))
            .await
            .unwrap();

        eventually("channel announcement", || !texts(&h.announced).is_empty()).await;

        let active = h.supervisor.active().await.expect("slot should be occupied");
        assert_eq!(active.image_tag, "tagX");
        assert_eq!(active.status, WorkloadStatus::Running);

        let announced = texts(&h.announced);
        let pair: ChannelPair = announced[0].parse().unwrap();
        assert!(!pair.result.is_empty());
        assert!(!pair.command.is_empty());
        assert_ne!(pair.result, pair.command);

        let launches = h.engine.launches.lock().unwrap().clone();
        assert_eq!(launches.len(), 1);
        let spec = &launches[0];
        assert_eq!(spec.image_id, "sha256:0000");
        assert_eq!(spec.args, vec![pair.result.clone(), pair.command.clone()]);
        assert!(spec.auto_remove);
        assert_eq!(spec.accelerator.as_ref().map(|a| a.count), Some(1));
        assert_eq!(spec.mounts, vec![BindMount::shared("/tmp/echo.sock")]);

        h.finish().await;
    }

    #[tokio::test]
    async fn restart_of_active_tag_only_republishes() {
        let h = harness(&["tagX"], Duration::from_millis(5));

        h.supervisor.handle("1 tagX").await;
        h.supervisor.handle("1 tagX").await;

        eventually("two announcements", || texts(&h.announced).len() == 2).await;
        let announced = texts(&h.announced);
        assert_eq!(announced[0], announced[1]);
        assert_eq!(h.engine.launch_count(), 1);
        assert_eq!(h.engine.stop_count(), 0);

        h.finish().await;
    }

    #[tokio::test]
    async fn stop_clears_slot_even_when_engine_fails() {
        let h = harness(&["tagX"], Duration::from_millis(5));

        h.supervisor.handle("1 tagX").await;
        assert!(h.supervisor.active().await.is_some());

        h.engine.fail_stop.store(true, Ordering::SeqCst);
        h.supervisor.handle("-1 tagX").await;

        assert!(h.supervisor.active().await.is_none());
        assert_eq!(h.engine.stop_count(), 1);

        h.finish().await;
    }

    #[tokio::test]
    async fn stop_when_idle_is_a_noop() {
        let h = harness(&["tagX"], Duration::from_millis(5));

        h.supervisor.handle("-1 tagX").await;

        assert!(h.supervisor.active().await.is_none());
        assert_eq!(h.engine.stop_count(), 0);
        settle().await;
        assert!(texts(&h.stopped).is_empty());

        h.finish().await;
    }

    #[tokio::test]
    async fn unknown_tag_is_dropped() {
        let h = harness(&["tagX"], Duration::from_millis(5));

        h.supervisor.handle("1 missing").await;
        settle().await;

        assert!(h.supervisor.active().await.is_none());
        assert_eq!(h.engine.launch_count(), 0);
        assert!(texts(&h.announced).is_empty());

        h.finish().await;
    }

    #[tokio::test]
    async fn malformed_command_is_dropped() {
        let h = harness(&["tagX"], Duration::from_millis(5));

        h.supervisor.handle("start tagX").await;
        h.supervisor.handle("1").await;
        settle().await;

        assert_eq!(h.engine.launch_count(), 0);
        assert!(texts(&h.announced).is_empty());

        h.finish().await;
    }

    #[tokio::test]
    async fn launch_failure_leaves_slot_empty() {
        let h = harness(&["tagX"], Duration::from_millis(5));
        h.engine.fail_run.store(true, Ordering::SeqCst);

        h.supervisor.handle("1 tagX").await;
        settle().await;

        assert!(h.supervisor.active().await.is_none());
        assert_eq!(h.engine.launch_count(), 1);
        assert!(texts(&h.announced).is_empty());

        h.finish().await;
    }

    #[tokio::test]
    async fn starting_another_tag_replaces_active_workload() {
        let h = harness(&["tagA", "tagB"], Duration::from_millis(5));

        h.supervisor.handle("1 tagA").await;
        h.supervisor.handle("1 tagB").await;

        let active = h.supervisor.active().await.unwrap();
        assert_eq!(active.image_tag, "tagB");
        assert_eq!(
            *h.engine.stops.lock().unwrap(),
            vec![InstanceHandle::new("ctr-0")]
        );

        eventually("termination notice", || texts(&h.stopped) == vec!["tagA"]).await;

        h.finish().await;
    }

    #[tokio::test]
    async fn newer_pending_command_supersedes_older() {
        let h = harness(&["tagA", "tagB"], Duration::from_millis(20));

        // No await between the two submissions: the poll task cannot run in between.
        h.supervisor.submit("1 tagA");
        h.supervisor.submit("1 tagB");

        eventually("launch", || h.engine.launch_count() == 1).await;
        settle().await;

        assert_eq!(h.engine.launch_count(), 1);
        assert_eq!(h.supervisor.active().await.unwrap().image_tag, "tagB");

        h.finish().await;
    }

    #[tokio::test]
    async fn submit_keeps_only_the_latest_command() {
        let h = harness(&["tagA"], Duration::from_secs(3600));

        h.supervisor.submit("1 a");
        h.supervisor.submit("-1 a");
        h.supervisor.submit("1 b");

        assert_eq!(h.supervisor.core.take_pending().as_deref(), Some("1 b"));
        assert_eq!(h.supervisor.core.take_pending(), None);

        h.finish().await;
    }

    #[tokio::test]
    async fn slot_never_holds_more_than_one_workload() {
        let h = harness(&["a", "b", "c"], Duration::from_millis(5));

        let sequence = [
            "1 a", "1 b", "-1 b", "-1 b", "1 c", "1 c", "1 a", "-1 x", "1 b", "1 missing",
        ];
        for raw in sequence {
            h.supervisor.handle(raw).await;

            let launched = h.engine.launch_count();
            let stopped = h.engine.stop_count();
            assert!(launched - stopped <= 1, "after {raw}: {launched} launched, {stopped} stopped");
            let occupied = usize::from(h.supervisor.active().await.is_some());
            assert_eq!(launched - stopped, occupied, "after {raw}");
        }

        h.finish().await;
    }

    #[tokio::test]
    async fn shutdown_stops_active_workload() {
        let h = harness(&["tagX"], Duration::from_millis(5));
        h.supervisor.handle("1 tagX").await;

        let engine = Arc::clone(&h.engine);
        let transport = Arc::clone(&h.transport);
        let stopped = Arc::clone(&h.stopped);
        h.supervisor.shutdown().await;

        assert_eq!(engine.stop_count(), 1);
        assert_eq!(transport.subscriber_count("commandsIn"), 0);
        eventually("termination notice", || texts(&stopped) == vec!["tagX"]).await;

        h.consumer.shutdown().await;
        h.ctx.shutdown().await;
    }

    #[tokio::test]
    async fn snapshot_reflects_slot() {
        let h = harness(&["tagX"], Duration::from_millis(5));

        let idle = h.supervisor.snapshot().await;
        assert_eq!(idle.status, WorkloadStatus::Idle);
        assert!(idle.image_tag.is_none());

        h.supervisor.handle("1 tagX").await;
        let running = h.supervisor.snapshot().await;
        assert_eq!(running.status, WorkloadStatus::Running);
        assert_eq!(running.image_tag.as_deref(), Some("tagX"));
        assert_eq!(running.instance.as_deref(), Some("ctr-0"));
        assert!(running.started_at.is_some());

        h.finish().await;
    }
}
