//! Reference relay server for Huddle rooms

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use huddle_core::{RoomId, RoomManager};
use huddle_protocol::Codec;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use crate::handler::RelayHandler;

/// WebSocket relay: one channel per client, rooms selected by the `room`
/// query parameter
#[derive(Clone)]
pub struct RelayServer {
    manager: Arc<RoomManager>,
}

impl RelayServer {
    pub fn new(manager: Arc<RoomManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<RoomManager> {
        &self.manager
    }

    /// Bind and serve forever
    pub async fn run(&self, addr: SocketAddr) -> Result<(), TransportError> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %addr, "Huddle relay listening");
        self.serve(listener).await
    }

    /// Bind and serve in a background task, returning the bound address
    pub async fn bind(self, addr: SocketAddr) -> Result<(SocketAddr, JoinHandle<()>), TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, "Huddle relay listening");

        let task = tokio::spawn(async move {
            if let Err(e) = self.serve(listener).await {
                error!(error = %e, "Relay stopped");
            }
        });
        Ok((local, task))
    }

    /// Accept connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<(), TransportError> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let manager = self.manager.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, manager).await {
                            warn!(client = %peer_addr, error = %e, "Relay connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_connection(stream: TcpStream, manager: Arc<RoomManager>) -> Result<(), TransportError> {
        let mut requested: Option<RoomId> = None;
        let ws_stream = accept_hdr_async(stream, |req: &Request, resp: Response| {
            match room_from_query(req.uri().query()) {
                Some(room) => {
                    requested = Some(room);
                    Ok(resp)
                }
                None => Err(bad_request("missing or invalid room parameter")),
            }
        })
        .await?;

        let Some(room_id) = requested else {
            return Ok(());
        };

        let conn = manager.next_connection_id();
        let (room, mut room_rx) = manager.join(room_id, conn);
        let mut handler = RelayHandler::new(conn, room.clone());
        let codec = Codec::new();
        let (mut write, mut read) = ws_stream.split();

        info!(room = %room.id(), conn, "Client connected");

        let result: Result<(), TransportError> = async {
            loop {
                tokio::select! {
                    frame = read.next() => {
                        match frame {
                            Some(Ok(WsMessage::Text(text))) => {
                                for reply in handler.process(text.as_str()) {
                                    let text = codec.encode(&reply)?;
                                    write.send(WsMessage::Text(text.into())).await?;
                                }
                            }
                            Some(Ok(WsMessage::Ping(data))) => {
                                write.send(WsMessage::Pong(data)).await?;
                            }
                            Some(Ok(WsMessage::Close(_))) | None => {
                                info!(room = %room.id(), conn, "Client disconnected");
                                return Ok(());
                            }
                            Some(Ok(_)) => {
                                // Binary frames are not part of the protocol
                            }
                            Some(Err(e)) => return Err(e.into()),
                        }
                    }

                    envelope = room_rx.recv() => {
                        match envelope {
                            Ok(envelope) => {
                                if let Some(payload) = handler.deliver(&envelope) {
                                    write.send(WsMessage::Text(payload.to_string().into())).await?;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                for reply in handler.on_lagged(missed) {
                                    let text = codec.encode(&reply)?;
                                    write.send(WsMessage::Text(text.into())).await?;
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => return Ok(()),
                        }
                    }
                }
            }
        }
        .await;

        handler.cleanup();
        if manager.release(room.id()) {
            debug!(room = %room.id(), "Last member left");
        }
        result
    }
}

fn room_from_query(query: Option<&str>) -> Option<RoomId> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == "room")
        .and_then(|(_, value)| RoomId::new(value.into_owned()).ok())
}

fn bad_request(reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn start() -> (SocketAddr, Arc<RoomManager>) {
        let manager = Arc::new(RoomManager::new());
        let (addr, _task) = RelayServer::new(manager.clone())
            .bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        (addr, manager)
    }

    #[test]
    fn test_room_from_query() {
        assert_eq!(
            room_from_query(Some("room=project%3A7&x=1")),
            Some(RoomId::new("project:7").unwrap())
        );
        assert_eq!(room_from_query(Some("room=bad/room")), None);
        assert_eq!(room_from_query(Some("other=1")), None);
        assert_eq!(room_from_query(None), None);
    }

    #[tokio::test]
    async fn test_rejects_missing_room() {
        let (addr, _) = start().await;
        let result = tokio_tungstenite::connect_async(format!("ws://{}/", addr)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_room_reclaimed_after_last_client() {
        let (addr, manager) = start().await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/?room=r1", addr))
            .await
            .unwrap();
        ws.send(WsMessage::Text(r#"{"type":"sync-request"}"#.to_string().into()))
            .await
            .unwrap();
        let reply = ws.next().await.unwrap().unwrap();
        assert!(reply.to_text().unwrap().contains(r#""type":"sync""#));
        assert_eq!(manager.stats().room_count, 1);

        ws.close(None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.stats().room_count > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
