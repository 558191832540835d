//! ============================================================================
//! WebSocket Bus - Relay Client
//! ============================================================================
//! Connects to a topic relay over WebSocket. Frames are JSON:
//!   {"op":"subscribe","topic":"frontdoor/send"}
//!   {"op":"publish","topic":"frontdoor/send","payload":"..."}
//! Subscriptions are replayed every time the session (re)connects. The first
//! connection must succeed; later disconnects reconnect with backoff.
//! ============================================================================

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{BusError, BusMessage, MessageBus, MessageHandler, TopicRouter};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const INITIAL_RECONNECT_DELAY_SECS: u64 = 1;
const MAX_RECONNECT_DELAY_SECS: u64 = 60;
const PING_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Frame {
    Subscribe { topic: String },
    Publish { topic: String, payload: String },
}

pub struct WsBus {
    url: String,
    router: Arc<TopicRouter>,
    outbound_tx: mpsc::UnboundedSender<Frame>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl WsBus {
    pub fn new(url: impl Into<String>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            url: url.into(),
            router: Arc::new(TopicRouter::new()),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            connected: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn queue(&self, frame: Frame) -> Result<(), BusError> {
        self.outbound_tx.send(frame).map_err(|_| BusError::Closed)
    }
}

async fn open(url: &str) -> Result<WsStream, BusError> {
    let (ws, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| BusError::Transport(format!("Failed to connect to {}: {}", url, e)))?;
    Ok(ws)
}

/// Drive one connected session until disconnect or shutdown.
/// Returns `false` when shutdown was requested.
async fn run_session(
    ws: WsStream,
    router: &TopicRouter,
    outbound: &mut mpsc::UnboundedReceiver<Frame>,
    shutdown: &CancellationToken,
) -> bool {
    let (mut sink, mut stream) = ws.split();

    for topic in router.topics() {
        let frame = Frame::Subscribe { topic };
        if let Err(e) = send_frame(&mut sink, &frame).await {
            warn!("Failed to replay subscription: {}", e);
            return true;
        }
    }

    let mut ping = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
    ping.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink.close().await;
                return false;
            }

            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    warn!("Bus ping failed, disconnecting");
                    return true;
                }
            }

            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    return false;
                };
                if let Err(e) = send_frame(&mut sink, &frame).await {
                    warn!("Bus send failed, disconnecting: {}", e);
                    return true;
                }
            }

            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<Frame>(&text) {
                        Ok(Frame::Publish { topic, payload }) => {
                            router.dispatch(BusMessage::new(topic, payload.into_bytes()));
                        }
                        Ok(Frame::Subscribe { topic }) => {
                            debug!("Ignoring subscribe frame from relay for {}", topic);
                        }
                        Err(e) => warn!("Undecodable relay frame: {}", e),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Bus relay closed the connection");
                        return true;
                    }
                    Some(Err(e)) => {
                        warn!("Bus relay error: {}", e);
                        return true;
                    }
                    None => {
                        info!("Bus relay stream ended");
                        return true;
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), BusError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(frame).map_err(|e| BusError::Encode(e.to_string()))?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| BusError::Transport(e.to_string()))
}

#[async_trait]
impl MessageBus for WsBus {
    async fn connect(&self) -> Result<(), BusError> {
        let mut slot = self.outbound_rx.lock().await;
        if slot.is_none() {
            return Err(BusError::Transport("Bus already connected".to_string()));
        }

        let first = open(&self.url).await?;
        let Some(mut outbound) = slot.take() else {
            return Err(BusError::Transport("Bus already connected".to_string()));
        };
        drop(slot);
        info!("Connected to bus relay at {}", self.url);
        self.connected.store(true, Ordering::SeqCst);

        let url = self.url.clone();
        let router = Arc::clone(&self.router);
        let connected = Arc::clone(&self.connected);
        let shutdown = self.shutdown.clone();

        self.tasks.spawn(async move {
            let mut session = Some(first);
            let mut reconnect_delay = Duration::from_secs(INITIAL_RECONNECT_DELAY_SECS);

            loop {
                if let Some(ws) = session.take() {
                    connected.store(true, Ordering::SeqCst);
                    reconnect_delay = Duration::from_secs(INITIAL_RECONNECT_DELAY_SECS);
                    let keep_going = run_session(ws, &router, &mut outbound, &shutdown).await;
                    connected.store(false, Ordering::SeqCst);
                    if !keep_going {
                        break;
                    }
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_delay) => {},
                }

                match open(&url).await {
                    Ok(ws) => {
                        info!("Reconnected to bus relay");
                        session = Some(ws);
                    }
                    Err(e) => {
                        warn!(delay_secs = reconnect_delay.as_secs(), "{}", e);
                        reconnect_delay = (reconnect_delay * 2)
                            .min(Duration::from_secs(MAX_RECONNECT_DELAY_SECS));
                    }
                }
            }

            debug!("Bus relay session loop stopped");
        });

        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        let payload = String::from_utf8(payload).map_err(|e| BusError::Encode(e.to_string()))?;
        self.queue(Frame::Publish {
            topic: topic.to_string(),
            payload,
        })
    }

    async fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> Result<(), BusError> {
        if self.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }
        self.router.add(topic, handler);
        // Before connect the subscription goes out with the replay instead
        if self.is_connected() {
            self.queue(Frame::Subscribe {
                topic: topic.to_string(),
            })?;
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.router.drain().await;
        info!("Bus relay client stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(10);

    struct Forward(mpsc::UnboundedSender<BusMessage>);

    #[async_trait]
    impl MessageHandler for Forward {
        async fn handle(&self, message: BusMessage) {
            let _ = self.0.send(message);
        }
    }

    /// Next text frame from the client, skipping pings
    async fn next_frame(ws: &mut WebSocketStream<TcpStream>) -> Frame {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("relay connection ended: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_relay_session_replays_routes_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Frame>();

        let relay = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            seen_tx.send(next_frame(&mut ws).await).unwrap();

            let inbound = Frame::Publish {
                topic: "door/send".to_string(),
                payload: r#"{"uid":"f3ec6234"}"#.to_string(),
            };
            ws.send(Message::Text(serde_json::to_string(&inbound).unwrap()))
                .await
                .unwrap();
            seen_tx.send(next_frame(&mut ws).await).unwrap();

            // Drop the session; the client has to come back on its own
            ws.close(None).await.unwrap();
            drop(ws);

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            seen_tx.send(next_frame(&mut ws).await).unwrap();
            ws
        });

        let bus = WsBus::new(url);
        let (delivered_tx, mut delivered_rx) = mpsc::unbounded_channel();
        bus.subscribe("door/send", Arc::new(Forward(delivered_tx)))
            .await
            .unwrap();
        bus.connect().await.unwrap();

        let replayed = timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap();
        assert_eq!(
            replayed,
            Frame::Subscribe {
                topic: "door/send".to_string()
            }
        );

        let delivered = timeout(WAIT, delivered_rx.recv()).await.unwrap().unwrap();
        assert_eq!(delivered.topic, "door/send");
        assert_eq!(delivered.payload, br#"{"uid":"f3ec6234"}"#.to_vec());

        bus.publish("door/result", br#"{"name":"door","hash":"abc"}"#.to_vec())
            .await
            .unwrap();
        let published = timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap();
        assert_eq!(
            published,
            Frame::Publish {
                topic: "door/result".to_string(),
                payload: r#"{"name":"door","hash":"abc"}"#.to_string(),
            }
        );

        let replayed_again = timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap();
        assert_eq!(
            replayed_again,
            Frame::Subscribe {
                topic: "door/send".to_string()
            }
        );

        timeout(WAIT, bus.shutdown()).await.unwrap();
        assert!(!bus.is_connected());
        assert!(matches!(
            bus.publish("door/result", b"{}".to_vec()).await,
            Err(BusError::Closed)
        ));
        let _ = relay.await;
    }

    #[test]
    fn test_frame_wire_format() {
        let frame = Frame::Subscribe {
            topic: "frontdoor/send".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            serde_json::json!({"op": "subscribe", "topic": "frontdoor/send"})
        );

        let raw = r#"{"op":"publish","topic":"frontdoor/sync","payload":"{\"door\":\"frontdoor\"}"}"#;
        let parsed: Frame = serde_json::from_str(raw).unwrap();
        assert_eq!(
            parsed,
            Frame::Publish {
                topic: "frontdoor/sync".to_string(),
                payload: r#"{"door":"frontdoor"}"#.to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_publish_before_connect_fails() {
        let bus = WsBus::new("ws://127.0.0.1:9");
        assert!(matches!(
            bus.publish("door/send", b"{}".to_vec()).await,
            Err(BusError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        // Nothing listens on the discard port
        let bus = WsBus::new("ws://127.0.0.1:9");
        assert!(matches!(bus.connect().await, Err(BusError::Transport(_))));
    }
}
