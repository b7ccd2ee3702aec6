//! WebSocket client for the ledger server.
//!
//! Requests go out through a writer task; every frame the server sends back
//! (direct replies, room broadcasts, errors) is surfaced as a [`SyncEvent`]
//! on the channel returned by [`SyncClient::take_event_rx`].

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use ledger_core::{Action, ActionDescriptor, GameState};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{ClientRequest, MessageType, ProtocolError, ServerEvent, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// A server event, direct or broadcast
    Event {
        room: String,
        clock: u64,
        event: ServerEvent,
    },
    Pong,
}

/// The sync client.
pub struct SyncClient {
    /// Envelope identity; the server assigns its own connection id
    peer_id: Uuid,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
    server_url: String,
}

impl SyncClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            peer_id: Uuid::new_v4(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Connecting to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel, close the socket when
        // the channel is dropped.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let sync_msg = match SyncMessage::decode(&data) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Dropping undecodable server frame: {e}");
                                continue;
                            }
                        };
                        let event = match sync_msg.msg_type {
                            MessageType::Event => match sync_msg.server_event() {
                                Ok(event) => SyncEvent::Event {
                                    room: sync_msg.room,
                                    clock: sync_msg.clock,
                                    event,
                                },
                                Err(e) => {
                                    log::warn!("Dropping malformed server event: {e}");
                                    continue;
                                }
                            },
                            MessageType::Pong => SyncEvent::Pong,
                            _ => continue,
                        };
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Send one request.
    pub async fn send(&self, request: &ClientRequest) -> Result<(), ProtocolError> {
        let room = request.room().unwrap_or_default();
        let encoded = SyncMessage::request(self.peer_id, room, request)?.encode()?;
        self.send_raw(encoded).await
    }

    /// Send already-encoded bytes as a binary frame.
    pub async fn send_raw(&self, bytes: Vec<u8>) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(bytes)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn create_room(&self) -> Result<(), ProtocolError> {
        self.send(&ClientRequest::CreateRoom).await
    }

    pub async fn fetch_state(&self, room: &str) -> Result<(), ProtocolError> {
        self.send(&ClientRequest::FetchState { room: room.into() })
            .await
    }

    pub async fn join(&self, room: &str, name: &str) -> Result<(), ProtocolError> {
        self.send(&ClientRequest::Join {
            room: room.into(),
            name: name.into(),
        })
        .await
    }

    pub async fn heartbeat(&self, room: &str) -> Result<(), ProtocolError> {
        self.send(&ClientRequest::Heartbeat { room: room.into() })
            .await
    }

    pub async fn submit_state(
        &self,
        room: &str,
        state: GameState,
        action: Option<ActionDescriptor>,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientRequest::SubmitState {
            room: room.into(),
            state,
            action,
        })
        .await
    }

    pub async fn submit_action(
        &self,
        room: &str,
        action: Action,
        description: Option<String>,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientRequest::SubmitAction {
            room: room.into(),
            action,
            description,
        })
        .await
    }

    pub async fn undo(&self, room: &str) -> Result<(), ProtocolError> {
        self.send(&ClientRequest::Undo { room: room.into() }).await
    }

    pub async fn redo(&self, room: &str) -> Result<(), ProtocolError> {
        self.send(&ClientRequest::Redo { room: room.into() }).await
    }

    pub async fn request_approval(
        &self,
        room: &str,
        action: ActionDescriptor,
        approval_id: Option<String>,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientRequest::RequestApproval {
            room: room.into(),
            action,
            approval_id,
        })
        .await
    }

    pub async fn vote(&self, approval_id: &str, approve: bool) -> Result<(), ProtocolError> {
        self.send(&ClientRequest::Vote {
            approval_id: approval_id.into(),
            approve,
            voter_name: None,
        })
        .await
    }

    pub async fn propose_trade(&self, room: &str, to: &str, trade: Value) -> Result<(), ProtocolError> {
        self.send(&ClientRequest::ProposeTrade {
            room: room.into(),
            to: to.into(),
            trade,
        })
        .await
    }

    pub async fn accept_trade(&self, room: &str, to: &str, trade: Value) -> Result<(), ProtocolError> {
        self.send(&ClientRequest::AcceptTrade {
            room: room.into(),
            to: to.into(),
            trade,
        })
        .await
    }

    pub async fn reject_trade(&self, room: &str, to: &str, trade: Value) -> Result<(), ProtocolError> {
        self.send(&ClientRequest::RejectTrade {
            room: room.into(),
            to: to.into(),
            trade,
        })
        .await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let encoded = SyncMessage::ping(self.peer_id).encode()?;
        self.send_raw(encoded).await
    }

    /// Drop the outgoing channel; the writer task closes the socket.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
