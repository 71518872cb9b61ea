//! In-process transport.
//!
//! Every [`BusClient`](super::BusClient) sharing one `LocalTransport` behaves
//! like a separate process attached to the same broker.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{BusError, Delivery, DeliverySink, Payload, SubscriptionId, Transport};

struct Route {
    channel: String,
    sink: DeliverySink,
}

#[derive(Default)]
pub struct LocalTransport {
    routes: DashMap<SubscriptionId, Route>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.routes
            .iter()
            .filter(|route| route.channel == channel)
            .count()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn attach(
        &self,
        channel: &str,
        subscription: SubscriptionId,
        sink: DeliverySink,
    ) -> Result<(), BusError> {
        tracing::trace!(%channel, %subscription, "Attaching local route");
        self.routes.insert(
            subscription,
            Route {
                channel: channel.to_string(),
                sink,
            },
        );
        Ok(())
    }

    fn detach(&self, subscription: SubscriptionId) {
        if self.routes.remove(&subscription).is_some() {
            tracing::trace!(%subscription, "Detached local route");
        }
    }

    async fn publish(&self, channel: &str, payload: Payload) -> Result<(), BusError> {
        // Collect first so no shard lock is held while sending.
        let targets: Vec<(SubscriptionId, DeliverySink)> = self
            .routes
            .iter()
            .filter(|route| route.channel == channel)
            .map(|route| (*route.key(), route.sink.clone()))
            .collect();

        if targets.is_empty() {
            tracing::trace!(%channel, kind = payload.kind(), "No subscribers for publish");
        }

        let mut closed = Vec::new();
        for (subscription, sink) in targets {
            let delivery = Delivery {
                subscription,
                channel: channel.to_string(),
                payload: payload.clone(),
            };
            if sink.send(delivery).is_err() {
                closed.push(subscription);
            }
        }

        for subscription in closed {
            tracing::debug!(%channel, %subscription, "Dropping route to closed event loop");
            self.routes.remove(&subscription);
        }

        Ok(())
    }
}
