//! Transport client - one WebSocket channel per room with reconnect backoff

use crate::backoff::ReconnectPolicy;
use crate::dispatch::{HandlerRegistry, SubscriptionId, Topic};
use crate::error::TransportError;
use futures_util::{SinkExt, StreamExt};
use huddle_core::RoomId;
use huddle_protocol::{Codec, Message};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};
use url::Url;

/// Transport client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Relay address, e.g. `ws://localhost:7070/collab`
    pub base_url: String,
    pub reconnect: ReconnectPolicy,
}

impl TransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Channel address for a room
    pub fn room_url(&self, room: &RoomId) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.base_url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
        }
        url.query_pairs_mut().append_pair("room", room.as_str());
        Ok(url)
    }
}

/// Identity announced with `join`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub user_id: String,
    pub user_name: String,
}

impl Credential {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    /// Reconnect attempts ran out; the client stays disconnected
    Exhausted,
}

/// Observable state of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub state: ConnectionState,
    pub reconnect_attempt: u32,
    /// How many times the channel has opened; tells reopenings apart even
    /// when intermediate states were not observed
    pub opened: u64,
}

impl Connection {
    fn new(state: ConnectionState, reconnect_attempt: u32, opened: u64) -> Self {
        Self {
            state,
            reconnect_attempt,
            opened,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }
}

enum Outgoing {
    Frame(String),
    Close,
}

enum Ended {
    Lost,
    Shutdown,
}

struct Channel {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    shutdown: watch::Sender<bool>,
    credential: Credential,
    task: JoinHandle<()>,
}

/// Client side of one room channel
pub struct TransportClient {
    config: TransportConfig,
    codec: Codec,
    handlers: Arc<HandlerRegistry>,
    status: Arc<watch::Sender<Connection>>,
    channel: Mutex<Option<Channel>>,
}

impl TransportClient {
    pub fn new(config: TransportConfig) -> Self {
        let (status, _) = watch::channel(Connection::new(ConnectionState::Closed, 0, 0));
        Self {
            config,
            codec: Codec::new(),
            handlers: Arc::new(HandlerRegistry::new()),
            status: Arc::new(status),
            channel: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Open the channel for `room`. Connection happens in the background;
    /// watch [`TransportClient::watch`] for the `Open` state.
    pub fn connect(&self, room: &RoomId, credential: Credential) -> Result<(), TransportError> {
        let url = self.config.room_url(room)?;

        let mut channel = self.channel.lock();
        if let Some(old) = channel.take() {
            let _ = old.shutdown.send(true);
        }

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let opened = self.status.borrow().opened;
        self.status
            .send_replace(Connection::new(ConnectionState::Connecting, 0, opened));

        let worker = Worker {
            url,
            join: Message::Join {
                user_id: credential.user_id.clone(),
                user_name: credential.user_name.clone(),
            },
            policy: self.config.reconnect.clone(),
            codec: self.codec.clone(),
            handlers: self.handlers.clone(),
            status: self.status.clone(),
            opened,
            outgoing: outgoing_rx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(worker.run());

        *channel = Some(Channel {
            outgoing: outgoing_tx,
            shutdown: shutdown_tx,
            credential,
            task,
        });

        Ok(())
    }

    /// Send a message. When the channel is not open the message is dropped.
    pub fn send(&self, message: &Message) -> Result<(), TransportError> {
        if !self.status.borrow().is_open() {
            warn!(kind = %message.kind(), "Dropping message, channel not open");
            return Err(TransportError::Unavailable);
        }

        let text = self.codec.encode(message)?;
        let channel = self.channel.lock();
        let sender = channel.as_ref().ok_or(TransportError::Unavailable)?;
        sender
            .outgoing
            .send(Outgoing::Frame(text))
            .map_err(|_| TransportError::Unavailable)
    }

    /// Subscribe to one message kind, or to every message with [`Topic::All`]
    pub fn on<F>(&self, topic: impl Into<Topic>, handler: F) -> SubscriptionId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.handlers.on(topic, handler)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.handlers.off(id)
    }

    /// Current connection state
    pub fn connection(&self) -> Connection {
        *self.status.borrow()
    }

    /// Receiver notified on every connection state change
    pub fn watch(&self) -> watch::Receiver<Connection> {
        self.status.subscribe()
    }

    /// Announce `leave`, unsubscribe every handler and close the channel.
    ///
    /// Handlers are gone when this returns; the close handshake finishes in
    /// the background.
    pub fn disconnect(&self) {
        self.handlers.clear();

        let Some(channel) = self.channel.lock().take() else {
            return;
        };

        if self.status.borrow().is_open() {
            let leave = Message::Leave {
                user_id: channel.credential.user_id.clone(),
            };
            match self.codec.encode(&leave) {
                Ok(text) => {
                    let _ = channel.outgoing.send(Outgoing::Frame(text));
                }
                Err(e) => warn!(error = %e, "Failed to encode leave"),
            }
        }
        let _ = channel.outgoing.send(Outgoing::Close);
        let _ = channel.shutdown.send(true);
        drop(channel.task);

        let opened = self.status.borrow().opened;
        self.status
            .send_replace(Connection::new(ConnectionState::Closed, 0, opened));
        info!("Transport disconnected");
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.get_mut().take() {
            let _ = channel.outgoing.send(Outgoing::Close);
            let _ = channel.shutdown.send(true);
        }
    }
}

/// Background task owning the socket
struct Worker {
    url: Url,
    join: Message,
    policy: ReconnectPolicy,
    codec: Codec,
    handlers: Arc<HandlerRegistry>,
    status: Arc<watch::Sender<Connection>>,
    opened: u64,
    outgoing: mpsc::UnboundedReceiver<Outgoing>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                return;
            }
            self.publish(ConnectionState::Connecting, attempt);

            let connected = tokio::select! {
                result = connect_async(self.url.as_str()) => result,
                _ = self.shutdown.changed() => return,
            };

            match connected {
                Ok((stream, _)) => {
                    info!(url = %self.url, "Channel open");
                    attempt = 0;
                    if let Ended::Shutdown = self.pump(stream).await {
                        return;
                    }
                    info!(url = %self.url, "Channel lost");
                }
                Err(e) => {
                    warn!(url = %self.url, attempt, error = %e, "Connect failed");
                }
            }

            // Messages queued for the lost socket are stale
            while let Ok(outgoing) = self.outgoing.try_recv() {
                if let Outgoing::Close = outgoing {
                    return;
                }
            }

            attempt += 1;
            let Some(delay) = self.policy.delay_for(attempt) else {
                let attempts = attempt - 1;
                warn!(
                    error = %TransportError::ReconnectExhausted { attempts },
                    "Giving up on relay"
                );
                self.publish(ConnectionState::Exhausted, attempts);
                return;
            };

            self.publish(ConnectionState::Closed, attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => return,
            }
        }
    }

    async fn pump<S>(&mut self, stream: tokio_tungstenite::WebSocketStream<S>) -> Ended
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut write, mut read) = stream.split();

        let join = match self.codec.encode(&self.join) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to encode join");
                return Ended::Shutdown;
            }
        };
        if let Err(e) = write.send(WsMessage::Text(join.into())).await {
            warn!(error = %e, "Failed to announce join");
            return Ended::Lost;
        }
        self.opened += 1;
        self.publish(ConnectionState::Open, 0);

        loop {
            tokio::select! {
                biased;

                outgoing = self.outgoing.recv() => {
                    match outgoing {
                        Some(Outgoing::Frame(text)) => {
                            if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                                warn!(error = %e, "WebSocket write error");
                                return Ended::Lost;
                            }
                        }
                        Some(Outgoing::Close) | None => {
                            let _ = write.send(WsMessage::Close(None)).await;
                            return Ended::Shutdown;
                        }
                    }
                }

                frame = read.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => self.deliver(text.as_str()),
                        Some(Ok(WsMessage::Ping(data))) => {
                            if write.send(WsMessage::Pong(data)).await.is_err() {
                                return Ended::Lost;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => return Ended::Lost,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "WebSocket read error");
                            return Ended::Lost;
                        }
                    }
                }

                _ = self.shutdown.changed() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ended::Shutdown;
                }
            }
        }
    }

    fn deliver(&self, text: &str) {
        match self.codec.decode(text) {
            Ok(message) => {
                let delivered = self.handlers.dispatch(&message);
                debug!(kind = %message.kind(), delivered, "Dispatched message");
            }
            Err(e) => warn!(error = %e, "Dropping malformed message"),
        }
    }

    fn publish(&self, state: ConnectionState, reconnect_attempt: u32) {
        self.status
            .send_replace(Connection::new(state, reconnect_attempt, self.opened));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayServer;
    use huddle_core::RoomManager;
    use huddle_protocol::MessageKind;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn start_relay() -> SocketAddr {
        let (addr, _task) = RelayServer::new(Arc::new(RoomManager::new()))
            .bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        addr
    }

    fn client_for(addr: SocketAddr) -> TransportClient {
        TransportClient::new(
            TransportConfig::new(format!("ws://{}/collab", addr))
                .with_reconnect(ReconnectPolicy::new(20, 200, 3)),
        )
    }

    async fn wait_for(client: &TransportClient, state: ConnectionState) -> Connection {
        let mut rx = client.watch();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = *rx.borrow_and_update();
                if current.state == state {
                    return current;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap()
    }

    fn room() -> RoomId {
        RoomId::new("room-1").unwrap()
    }

    #[test]
    fn test_room_url() {
        let config = TransportConfig::new("ws://localhost:7070/collab");
        let url = config.room_url(&RoomId::new("project:1").unwrap()).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:7070/collab?room=project%3A1");

        assert!(TransportConfig::new("http://x").room_url(&room()).is_err());
        assert!(TransportConfig::new("not a url").room_url(&room()).is_err());
    }

    #[tokio::test]
    async fn test_send_before_open_is_dropped() {
        let client = client_for("127.0.0.1:9".parse().unwrap());
        assert!(matches!(
            client.send(&Message::SyncRequest),
            Err(TransportError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn test_messages_reach_other_client() {
        let addr = start_relay().await;
        let alice = client_for(addr);
        let bob = client_for(addr);

        let (tx, mut rx) = mpsc::unbounded_channel();
        bob.on(MessageKind::Update, move |msg| {
            let _ = tx.send(msg.clone());
        });

        alice.connect(&room(), Credential::new("a", "Alice")).unwrap();
        bob.connect(&room(), Credential::new("b", "Bob")).unwrap();
        assert_eq!(wait_for(&alice, ConnectionState::Open).await.opened, 1);
        wait_for(&bob, ConnectionState::Open).await;

        let doc = huddle_core::Document::new(room(), 1);
        let update = doc.apply_local_change("hi").unwrap().unwrap();
        alice.send(&Message::update(&update).unwrap()).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, Message::update(&update).unwrap());
    }

    #[tokio::test]
    async fn test_disconnect_announces_leave() {
        let addr = start_relay().await;
        let alice = client_for(addr);
        let bob = client_for(addr);

        let (tx, mut rx) = mpsc::unbounded_channel();
        bob.on(MessageKind::UserLeft, move |msg| {
            let _ = tx.send(msg.clone());
        });

        bob.connect(&room(), Credential::new("b", "Bob")).unwrap();
        wait_for(&bob, ConnectionState::Open).await;
        alice.connect(&room(), Credential::new("a", "Alice")).unwrap();
        wait_for(&alice, ConnectionState::Open).await;

        alice.disconnect();
        assert_eq!(alice.connection().state, ConnectionState::Closed);

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, Message::UserLeft { user_id: "a".into() });
    }

    #[tokio::test]
    async fn test_disconnect_clears_handlers() {
        let client = client_for("127.0.0.1:9".parse().unwrap());
        client.on(Topic::All, |_| {});
        client.disconnect();
        assert!(client.handlers.is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_exhausted() {
        // Reserve a port, then free it so every connect is refused
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client_for(addr);
        let mut rx = client.watch();
        client.connect(&room(), Credential::new("a", "Alice")).unwrap();

        let mut attempts_seen = Vec::new();
        let last = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = *rx.borrow_and_update();
                if current.state == ConnectionState::Closed {
                    attempts_seen.push(current.reconnect_attempt);
                }
                if current.state == ConnectionState::Exhausted {
                    return current;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        assert_eq!(last.reconnect_attempt, 3);
        assert!(attempts_seen.windows(2).all(|w| w[0] < w[1]));
        assert!(client.send(&Message::SyncRequest).is_err());
    }

    #[tokio::test]
    async fn test_malformed_frames_do_not_stop_dispatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // Swallow the join
            let _ = ws.next().await;
            ws.send(WsMessage::Text("garbage".to_string().into())).await.unwrap();
            ws.send(WsMessage::Text(r#"{"type":"nope"}"#.to_string().into()))
                .await
                .unwrap();
            ws.send(WsMessage::Text(r#"{"type":"sync","data":[]}"#.to_string().into()))
                .await
                .unwrap();
            // Keep the socket open until the client is done
            let _ = ws.next().await;
        });

        let client = client_for(addr);
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.on(Topic::All, move |msg| {
            let _ = tx.send(msg.kind());
        });
        client.connect(&room(), Credential::new("a", "Alice")).unwrap();

        let kind = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kind, MessageKind::Sync);
        assert!(client.connection().is_open());
    }
}
