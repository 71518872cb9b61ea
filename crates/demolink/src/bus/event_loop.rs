//! Per-process delivery loop and the client handle used to subscribe/publish.
//!
//! All handlers registered through one [`BusClient`] run on a single task,
//! strictly one after another. Handlers must only swap shared state under
//! short locks; any I/O belongs on a worker task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{BusError, Delivery, DeliverySink, Payload, SubscriptionId, Transport};

type Handler = Arc<dyn Fn(Payload) + Send + Sync>;

struct Registered {
    channel: String,
    handler: Handler,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    handlers: DashMap<SubscriptionId, Registered>,
    sink: DeliverySink,
    closed: AtomicBool,
}

/// Handle to an active subscription, returned by [`BusClient::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: SubscriptionId,
    channel: String,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

/// Publishing handle bound to one channel name.
#[derive(Clone)]
pub struct Publisher {
    channel: String,
    transport: Arc<dyn Transport>,
}

impl Publisher {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn send(&self, payload: Payload) -> Result<(), BusError> {
        tracing::trace!(channel = %self.channel, kind = payload.kind(), "Publishing");
        self.transport.publish(&self.channel, payload).await
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Cloneable client for one event loop.
#[derive(Clone)]
pub struct BusClient {
    inner: Arc<ClientInner>,
}

impl BusClient {
    /// Register `handler` for `channel`.
    ///
    /// The handler is installed before the transport route so that nothing
    /// published after this call returns can be missed.
    pub fn subscribe<F>(&self, channel: &str, handler: F) -> Result<Subscription, BusError>
    where
        F: Fn(Payload) + Send + Sync + 'static,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let id = SubscriptionId::new();
        self.inner.handlers.insert(
            id,
            Registered {
                channel: channel.to_string(),
                handler: Arc::new(handler),
            },
        );

        if let Err(e) = self
            .inner
            .transport
            .attach(channel, id, self.inner.sink.clone())
        {
            self.inner.handlers.remove(&id);
            return Err(e);
        }

        tracing::debug!(%channel, subscription = %id, "Subscribed");
        Ok(Subscription {
            id,
            channel: channel.to_string(),
        })
    }

    /// Detach and forget a subscription.
    ///
    /// Deliveries already queued for it are discarded by the event loop.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.inner.transport.detach(subscription.id);
        if self.inner.handlers.remove(&subscription.id).is_some() {
            tracing::debug!(
                channel = %subscription.channel,
                subscription = %subscription.id,
                "Unsubscribed"
            );
        }
    }

    pub fn is_subscribed(&self, subscription: &Subscription) -> bool {
        self.inner.handlers.contains_key(&subscription.id)
    }

    pub fn publisher(&self, channel: impl Into<String>) -> Publisher {
        Publisher {
            channel: channel.into(),
            transport: Arc::clone(&self.inner.transport),
        }
    }

    pub async fn publish(&self, channel: &str, payload: Payload) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        self.inner.transport.publish(channel, payload).await
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let ids: Vec<SubscriptionId> = self.inner.handlers.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.inner.transport.detach(id);
            if let Some((_, registered)) = self.inner.handlers.remove(&id) {
                tracing::trace!(channel = %registered.channel, subscription = %id, "Dropped on close");
            }
        }
    }
}

/// The delivery loop task plus its client.
pub struct EventLoop {
    client: BusClient,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl EventLoop {
    /// Spawn the delivery loop on the current tokio runtime.
    pub fn spawn(transport: Arc<dyn Transport>) -> Result<Self, BusError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BusError::NoRuntime)?;

        let (sink, rx) = mpsc::unbounded_channel();
        let client = BusClient {
            inner: Arc::new(ClientInner {
                transport,
                handlers: DashMap::new(),
                sink,
                closed: AtomicBool::new(false),
            }),
        };

        let cancel = CancellationToken::new();
        let task = runtime.spawn(run_dispatch(client.clone(), rx, cancel.clone()));

        tracing::debug!("Event loop started");
        Ok(Self {
            client,
            cancel,
            task,
        })
    }

    pub fn client(&self) -> BusClient {
        self.client.clone()
    }

    /// Stop dispatching, drop every subscription and join the loop task.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.client.close();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Event loop task failed");
        }
        tracing::debug!("Event loop stopped");
    }
}

async fn run_dispatch(
    client: BusClient,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    cancel: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            delivery = rx.recv() => match delivery {
                Some(d) => d,
                None => break,
            },
        };

        // Clone the handler out so the map is not borrowed while it runs;
        // handlers are allowed to subscribe and unsubscribe.
        let handler = client
            .inner
            .handlers
            .get(&delivery.subscription)
            .map(|registered| Arc::clone(&registered.handler));

        match handler {
            Some(handler) => handler(delivery.payload),
            None => {
                tracing::trace!(
                    channel = %delivery.channel,
                    subscription = %delivery.subscription,
                    "Discarding delivery for detached subscription"
                );
            }
        }
    }
}
