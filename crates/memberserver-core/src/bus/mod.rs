//! ============================================================================
//! Message Bus - Device Publish/Subscribe Transport
//! ============================================================================
//! Door controllers talk to the server over topic-addressed messages
//! (`<resource>/send`, `<resource>/result`, ...). The server only depends on
//! the [`MessageBus`] capability:
//! - LocalBus: in-process routing, for single-host deployments and tests
//! - WsBus: WebSocket relay client
//!
//! Both route inbound messages through a [`TopicRouter`], which runs every
//! delivery as its own tracked task so one slow or panicking handler never
//! blocks the others.
//! ============================================================================

mod ws;

pub use ws::WsBus;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

/// A message received on or published to a topic
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Bus not connected")]
    NotConnected,

    #[error("Bus is shut down")]
    Closed,

    #[error("Bus transport error: {0}")]
    Transport(String),

    #[error("Invalid bus payload: {0}")]
    Encode(String),
}

/// Receives messages for the topics it was subscribed to
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: BusMessage);
}

/// Publish/subscribe capability. Publishing is fire-and-forget and delivery
/// is asynchronous.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn connect(&self) -> Result<(), BusError>;
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;
    async fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> Result<(), BusError>;
    /// Stop accepting messages and wait for in-flight deliveries
    async fn shutdown(&self);
}

// ============================================================================
// Topic Router
// ============================================================================

/// Exact-match topic routing table shared by the bus implementations
pub struct TopicRouter {
    routes: DashMap<String, Vec<Arc<dyn MessageHandler>>>,
    deliveries: TaskTracker,
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicRouter {
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
            deliveries: TaskTracker::new(),
        }
    }

    pub fn add(&self, topic: &str, handler: Arc<dyn MessageHandler>) {
        self.routes.entry(topic.to_string()).or_default().push(handler);
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.routes.iter().map(|e| e.key().clone()).collect();
        topics.sort();
        topics
    }

    /// Spawn one delivery per handler registered for the message's topic.
    /// Returns the number of deliveries started.
    pub fn dispatch(&self, message: BusMessage) -> usize {
        let handlers = match self.routes.get(&message.topic) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!("No subscribers for topic {}", message.topic);
                return 0;
            }
        };

        for handler in &handlers {
            let handler = Arc::clone(handler);
            let message = message.clone();
            self.deliveries.spawn(async move {
                let topic = message.topic.clone();
                let result = AssertUnwindSafe(handler.handle(message)).catch_unwind().await;
                if let Err(panic_info) = result {
                    error!(
                        topic = %topic,
                        panic = %panic_message(panic_info),
                        "Message handler panicked"
                    );
                }
            });
        }

        handlers.len()
    }

    /// Wait for every delivery started so far
    pub async fn drain(&self) {
        self.deliveries.close();
        self.deliveries.wait().await;
        self.deliveries.reopen();
    }

    pub fn in_flight(&self) -> usize {
        self.deliveries.len()
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(panic_info: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

// ============================================================================
// Local Bus
// ============================================================================

/// In-process bus. Anything published is routed straight to local subscribers.
pub struct LocalBus {
    router: TopicRouter,
    closed: AtomicBool,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self {
            router: TopicRouter::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Wait until every message published so far has been handled
    pub async fn drain(&self) {
        self.router.drain().await;
    }

    pub fn topics(&self) -> Vec<String> {
        self.router.topics()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn connect(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        debug!("Local bus ready");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        self.router.dispatch(BusMessage::new(topic, payload));
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        debug!("Subscribed to {}", topic);
        self.router.add(topic, handler);
        Ok(())
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.router.deliveries.close();
        self.router.deliveries.wait().await;
    }
}
