//! Per-process bus context.
//!
//! Constructed once at startup and passed by reference to the supervisor and
//! bridge. Failing to build it is the only fatal error in the crate.

use std::sync::Arc;

use crate::bus::{BusClient, BusError, EventLoop, Transport};

pub struct BusContext {
    event_loop: EventLoop,
}

impl BusContext {
    /// Start the delivery loop for this process on the current tokio runtime.
    pub fn connect(transport: Arc<dyn Transport>) -> Result<Self, BusError> {
        let event_loop = EventLoop::spawn(transport)?;
        tracing::info!("demolink {} bus context ready", crate::VERSION);
        Ok(Self { event_loop })
    }

    pub fn client(&self) -> BusClient {
        self.event_loop.client()
    }

    /// Tear down the delivery loop. Supervisors and bridges built on this
    /// context must be shut down first.
    pub async fn shutdown(self) {
        self.event_loop.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::time::Duration;

    use crate::bridge::FrameBridge;
    use crate::bus::{LocalTransport, Payload};
    use crate::config::{BridgeConfig, SupervisorConfig};
    use crate::engine::fake::FakeEngine;
    use crate::status::{BridgeState, WorkloadStatus};
    use crate::supervisor::WorkloadSupervisor;
    use crate::test_support::{eventually, marked_frame, marker_of, record};

    #[test]
    fn connect_requires_a_runtime() {
        let transport = Arc::new(LocalTransport::new());
        assert!(matches!(
            BusContext::connect(transport),
            Err(BusError::NoRuntime)
        ));
    }

    // Supervisor, UI and workload as three bus participants.
    #[tokio::test]
    async fn ui_drives_a_workload_end_to_end() {
        let transport = Arc::new(LocalTransport::new());
        let supervisor_ctx = BusContext::connect(transport.clone()).unwrap();
        let ui_ctx = BusContext::connect(transport.clone()).unwrap();
        let workload_ctx = BusContext::connect(transport.clone()).unwrap();

        let engine = Arc::new(FakeEngine::with_tags(&["polyp"]));
        let supervisor = WorkloadSupervisor::start(
            &supervisor_ctx,
            engine.clone(),
            SupervisorConfig::new().with_poll_interval(Duration::from_millis(5)),
        )
        .unwrap();
        let bridge = FrameBridge::start(
            &ui_ctx,
            BridgeConfig::new().with_drain_interval(Duration::from_millis(2)),
        )
        .unwrap();
        let opcodes = record(&workload_ctx, "inContainer1");

        bridge.request_start("polyp");
        eventually("binding", || {
            bridge.command_channel().as_deref() == Some("inContainer1")
        })
        .await;
        assert_eq!(engine.launch_count(), 1);

        let workload = workload_ctx.client();
        workload
            .publish("containerReady", Payload::Int(1))
            .await
            .unwrap();
        eventually("readiness", || bridge.is_ready()).await;

        workload
            .publish("outContainer1", Payload::Image(marked_frame(4)))
            .await
            .unwrap();
        let received = RefCell::new(None);
        eventually("result frame", || {
            if let Some(frame) = bridge.get_image() {
                *received.borrow_mut() = Some(marker_of(&frame));
            }
            received.borrow().is_some()
        })
        .await;
        assert_eq!(*received.borrow(), Some(4));

        bridge.send_opcode(1);
        eventually("opcode", || !opcodes.lock().unwrap().is_empty()).await;
        assert_eq!(*opcodes.lock().unwrap(), vec![Payload::Int(1)]);

        bridge.request_stop("polyp");
        eventually("disconnect", || bridge.state() == BridgeState::Disconnected).await;
        assert_eq!(engine.stop_count(), 1);
        assert_eq!(supervisor.snapshot().await.status, WorkloadStatus::Idle);

        bridge.shutdown().await;
        supervisor.shutdown().await;
        workload_ctx.shutdown().await;
        ui_ctx.shutdown().await;
        supervisor_ctx.shutdown().await;
    }
}
