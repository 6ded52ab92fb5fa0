// Route table and response dispatch
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::message::Message;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouteError {
    #[error("no route configured for platform '{0}'")]
    NotConfigured(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("destination {0} is unavailable")]
    Unavailable(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Where responses for one platform are sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub platform: String,
    pub endpoint: String,
}

/// platform -> destination, fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, Destination>,
}

impl RouteTable {
    pub fn new(routes: impl IntoIterator<Item = (String, String)>) -> Self {
        let routes = routes
            .into_iter()
            .map(|(platform, endpoint)| {
                let dest = Destination {
                    platform: platform.clone(),
                    endpoint,
                };
                (platform, dest)
            })
            .collect();
        Self { routes }
    }

    pub fn from_config(cfg: &RelayConfig) -> Self {
        Self::new(cfg.routes.clone())
    }

    pub fn destination_for(&self, platform: &str) -> Result<&Destination, RouteError> {
        self.routes
            .get(platform)
            .ok_or_else(|| RouteError::NotConfigured(platform.to_string()))
    }

    pub fn platforms(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(|k| k.as_str())
    }
}

/// Terminal status carried by the end-of-stream marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Completed,
    Failed,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Completed => "completed",
            StreamStatus::Failed => "failed",
        }
    }
}

/// One unit handed to a destination.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Original message forwarded unchanged
    Text(Arc<Message>),
    /// Complete synthesized audio
    Audio {
        message: Arc<Message>,
        text: String,
        audio: Bytes,
    },
    /// One chunk of a streamed response, `seq` starting at 0
    Chunk {
        message: Arc<Message>,
        text: String,
        seq: u64,
        data: Bytes,
    },
    /// End of a streamed response
    EndOfStream {
        message: Arc<Message>,
        text: String,
        status: StreamStatus,
        chunks: u64,
    },
}

impl Outbound {
    pub fn message(&self) -> &Arc<Message> {
        match self {
            Outbound::Text(message)
            | Outbound::Audio { message, .. }
            | Outbound::Chunk { message, .. }
            | Outbound::EndOfStream { message, .. } => message,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message().id
    }

    /// Whether nothing else follows this item for its message in a
    /// successful invocation.
    pub fn is_last(&self) -> bool {
        !matches!(self, Outbound::Chunk { .. })
    }

    /// Package into the adapter wire format.
    pub fn into_wire(self) -> Message {
        match self {
            Outbound::Text(message) => Arc::unwrap_or_clone(message),
            Outbound::Audio {
                message,
                text,
                audio,
            } => message.voice_reply(&audio, &text),
            Outbound::Chunk {
                message, text, data, ..
            } => message.voice_stream_reply(&data, &text),
            Outbound::EndOfStream {
                message,
                text,
                status,
                chunks,
            } => message.voice_stream_end(status.as_str(), chunks, &text),
        }
    }
}

/// Hands finished responses to the transport of a destination.
///
/// Returning `Ok` means the item was accepted for transmission, not that the
/// destination acknowledged it.
#[async_trait]
pub trait RouteDispatcher: Send + Sync {
    async fn dispatch(&self, destination: &Destination, item: Outbound)
        -> Result<(), DispatchError>;

    /// Flush whatever was accepted but not yet sent.
    async fn shutdown(&self) {}
}

/// Performs the actual network send of one packaged message.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, destination: &Destination, message: Message) -> Result<(), DispatchError>;
}

// Queue entry of a destination's forwarding task
enum Queued {
    Deliver(Outbound),
    // Forget the delivery failure of a message; its remaining items are ahead in the queue
    Retire(String),
}

// (endpoint, message id) -> error of the first failed delivery
type FailedDeliveries = DashMap<(String, String), String>;

struct DestinationQueue {
    tx: mpsc::Sender<Queued>,
    task: JoinHandle<()>,
}

/// Dispatcher with one bounded queue and one forwarding task per destination.
///
/// Items for a destination are sent sequentially, so per-message chunk order is
/// kept. A full queue blocks `dispatch`, propagating backpressure to the pipeline.
///
/// When the transport fails to deliver a non-final item of a message, the
/// remaining queued items of that message are discarded and the next
/// `dispatch` for it returns `DispatchError::Unavailable`, so a streaming
/// invocation stops instead of feeding a dead route.
pub struct ChannelDispatcher<T: Transport> {
    transport: Arc<T>,
    capacity: usize,
    // endpoint -> queue
    queues: DashMap<String, DestinationQueue>,
    failed: Arc<FailedDeliveries>,
}

impl<T: Transport> ChannelDispatcher<T> {
    pub fn new(transport: T, capacity: usize) -> Self {
        Self {
            transport: Arc::new(transport),
            capacity: capacity.max(1),
            queues: DashMap::new(),
            failed: Arc::new(DashMap::new()),
        }
    }

    fn queue_for(&self, destination: &Destination) -> mpsc::Sender<Queued> {
        self.queues
            .entry(destination.endpoint.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.capacity);
                info!(target: "dispatch", platform = %destination.platform, endpoint = %destination.endpoint, "Starting destination queue");
                let task = tokio::spawn(forward(
                    Arc::clone(&self.transport),
                    destination.clone(),
                    Arc::clone(&self.failed),
                    rx,
                ));
                DestinationQueue { tx, task }
            })
            .value()
            .tx
            .clone()
    }
}

#[async_trait]
impl<T: Transport> RouteDispatcher for ChannelDispatcher<T> {
    async fn dispatch(
        &self,
        destination: &Destination,
        item: Outbound,
    ) -> Result<(), DispatchError> {
        let tx = self.queue_for(destination);
        let key = (destination.endpoint.clone(), item.message_id().to_string());

        let failure = self.failed.get(&key).map(|e| e.value().clone());
        if let Some(error) = failure {
            debug!(target: "dispatch", message_id = %key.1, endpoint = %key.0, error = %error, "Refusing item of a failed delivery");
            if tx.send(Queued::Retire(key.1.clone())).await.is_err() {
                self.failed.remove(&key);
            }
            return Err(DispatchError::Unavailable(destination.endpoint.clone()));
        }

        if tx.send(Queued::Deliver(item)).await.is_err() {
            // Forwarding task is gone; forget the dead queue so a later call restarts it
            self.queues.remove(&destination.endpoint);
            return Err(DispatchError::Unavailable(destination.endpoint.clone()));
        }
        Ok(())
    }

    /// Close every queue and wait until the forwarding tasks have delivered
    /// what was already accepted.
    async fn shutdown(&self) {
        let endpoints: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        for endpoint in endpoints {
            let Some((_, queue)) = self.queues.remove(&endpoint) else {
                continue;
            };
            let DestinationQueue { tx, task } = queue;
            drop(tx);
            if let Err(e) = task.await {
                warn!(target: "dispatch", endpoint = %endpoint, error = %e, "Forwarding task ended abnormally");
            }
        }
        info!(target: "dispatch", "Dispatcher drained");
    }
}

async fn forward<T: Transport>(
    transport: Arc<T>,
    destination: Destination,
    failed: Arc<FailedDeliveries>,
    mut rx: mpsc::Receiver<Queued>,
) {
    while let Some(queued) = rx.recv().await {
        let item = match queued {
            Queued::Deliver(item) => item,
            Queued::Retire(id) => {
                failed.remove(&(destination.endpoint.clone(), id));
                continue;
            }
        };

        let key = (destination.endpoint.clone(), item.message_id().to_string());
        let last = item.is_last();
        if failed.contains_key(&key) {
            debug!(target: "dispatch", message_id = %key.1, endpoint = %key.0, "Discarding item of a failed delivery");
            if last {
                failed.remove(&key);
            }
            continue;
        }

        match transport.send(&destination, item.into_wire()).await {
            Ok(()) => debug!(target: "dispatch", message_id = %key.1, endpoint = %key.0, "Delivered"),
            Err(e) => {
                warn!(target: "dispatch", message_id = %key.1, endpoint = %key.0, error = %e, "Delivery failed");
                if !last {
                    failed.insert(key, e.to_string());
                }
            }
        }
    }
    debug!(target: "dispatch", endpoint = %destination.endpoint, "Destination queue closed");
}
