//! WebSocket server routing client requests into rooms.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── RoomHandle ── sequencer task ── Room
//!            ├── SyncServer ── RoomManager                                │
//! Client B ──┘        ▲             └── RoomHandle ── ...                 │
//!                     │                                                   ▼
//!                     └──────────── BroadcastGroup (room frames) ◄────────┘
//! ```
//!
//! Each accepted socket gets a fresh connection id and a [`Session`]. The
//! connection loop selects between inbound frames and the joined room's
//! broadcast receiver. Lifecycle answers and errors go straight back on the
//! socket; everything a room mutation produces arrives through the room's
//! broadcast, so the requester sees the same frames in the same order as
//! everyone else.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::Outbound;
use crate::config::ServerConfig;
use crate::error::RoomError;
use crate::protocol::{ClientRequest, MessageType, ServerEvent, SyncMessage};
use crate::registry::RoomManager;
use crate::room::TradeKind;
use crate::sequencer::RoomHandle;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub dropped_frames: u64,
    pub active_rooms: usize,
}

/// Per-connection routing state.
pub struct Session {
    connection_id: Uuid,
    room: Option<RoomHandle>,
    rx: Option<broadcast::Receiver<Arc<Outbound>>>,
}

impl Session {
    pub fn new(connection_id: Uuid) -> Self {
        Self {
            connection_id,
            room: None,
            rx: None,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// The room this connection last joined.
    pub fn room(&self) -> Option<&RoomHandle> {
        self.room.as_ref()
    }

    fn is_member_of(&self, code: &str) -> bool {
        self.room
            .as_ref()
            .is_some_and(|h| h.code().as_str().eq_ignore_ascii_case(code))
    }
}

/// An event for the requester alone.
#[derive(Debug)]
pub struct DirectReply {
    pub room: String,
    pub clock: u64,
    pub event: ServerEvent,
}

impl DirectReply {
    fn new(room: impl Into<String>, clock: u64, event: ServerEvent) -> Self {
        Self {
            room: room.into(),
            clock,
            event,
        }
    }

    fn error(err: &RoomError) -> Self {
        Self::new(
            String::new(),
            0,
            ServerEvent::Error {
                code: err.code(),
                message: err.to_string(),
            },
        )
    }

    fn encode(&self) -> Result<Vec<u8>, crate::protocol::ProtocolError> {
        SyncMessage::event(self.room.as_str(), self.clock, &self.event)?.encode()
    }
}

/// Execute one request on behalf of `session`.
///
/// `Ok(None)` means the outcome reaches the requester through the room
/// broadcast.
pub async fn handle_request(
    rooms: &RoomManager,
    session: &mut Session,
    request: ClientRequest,
) -> Result<Option<DirectReply>, RoomError> {
    let conn = session.connection_id;
    match request {
        ClientRequest::CreateRoom => {
            let handle = rooms.create().await;
            let room = handle.code().to_string();
            Ok(Some(DirectReply::new(
                room.clone(),
                0,
                ServerEvent::RoomCreated { room },
            )))
        }

        ClientRequest::RoomSummary { room } => {
            let summary = rooms.summary(&room).await?;
            Ok(Some(DirectReply::new(
                summary.room.clone(),
                summary.version,
                ServerEvent::RoomSummary(summary),
            )))
        }

        ClientRequest::FetchState { room } => {
            let snapshot = rooms.full_state(&room).await?;
            Ok(Some(DirectReply::new(
                snapshot.room.clone(),
                snapshot.version,
                ServerEvent::RoomState(snapshot),
            )))
        }

        ClientRequest::ResetRoom { room } => {
            let version = rooms.reset(&room).await?;
            // Members already got the reset through the broadcast.
            if session.is_member_of(&room) {
                return Ok(None);
            }
            let room = room.to_ascii_uppercase();
            Ok(Some(DirectReply::new(
                room.clone(),
                version,
                ServerEvent::RoomReset { room },
            )))
        }

        ClientRequest::DeleteRoom { room } => {
            rooms.delete(&room).await?;
            if session.is_member_of(&room) {
                session.room = None;
                return Ok(None);
            }
            let room = room.to_ascii_uppercase();
            Ok(Some(DirectReply::new(
                room.clone(),
                0,
                ServerEvent::RoomDeleted { room },
            )))
        }

        ClientRequest::Join { room, name } => {
            let handle = rooms.get(&room).await?;
            if let Some(previous) = &session.room {
                if previous.code() != handle.code() {
                    // Best effort: the old room may already be gone.
                    let _ = previous.disconnect(conn).await;
                    session.room = None;
                    session.rx = None;
                }
            }
            // Subscribe first so the joiner sees its own join events.
            let previous_rx = session.rx.replace(handle.subscribe());
            match handle.join(conn, name).await {
                Ok(_) => {
                    session.room = Some(handle);
                    Ok(None)
                }
                Err(e) => {
                    session.rx = previous_rx;
                    Err(e)
                }
            }
        }

        ClientRequest::Heartbeat { room } => {
            rooms.get(&room).await?.heartbeat(conn).await?;
            Ok(None)
        }

        ClientRequest::SubmitState {
            room,
            state,
            action,
        } => {
            rooms
                .get(&room)
                .await?
                .submit_state(conn, state, action)
                .await?;
            Ok(None)
        }

        ClientRequest::SubmitAction {
            room,
            action,
            description,
        } => {
            rooms
                .get(&room)
                .await?
                .submit_action(conn, action, description)
                .await?;
            Ok(None)
        }

        ClientRequest::Undo { room } => {
            rooms.get(&room).await?.undo(conn).await?;
            Ok(None)
        }

        ClientRequest::Redo { room } => {
            rooms.get(&room).await?.redo(conn).await?;
            Ok(None)
        }

        ClientRequest::RequestApproval {
            room,
            action,
            approval_id,
        } => {
            rooms
                .get(&room)
                .await?
                .request_approval(conn, action, approval_id)
                .await?;
            Ok(None)
        }

        ClientRequest::Vote {
            approval_id,
            approve,
            voter_name,
        } => {
            let handle = session
                .room
                .clone()
                .ok_or_else(|| RoomError::NotJoined("any room".to_string()))?;
            log::debug!(
                "Vote on {approval_id} from {} ({conn}): {}",
                voter_name.as_deref().unwrap_or("anonymous"),
                if approve { "approve" } else { "reject" }
            );
            handle.vote(conn, approval_id, approve).await?;
            Ok(None)
        }

        ClientRequest::ProposeTrade { room, to, trade } => {
            rooms
                .get(&room)
                .await?
                .trade(conn, TradeKind::Propose, to, trade)
                .await?;
            Ok(None)
        }

        ClientRequest::AcceptTrade { room, to, trade } => {
            rooms
                .get(&room)
                .await?
                .trade(conn, TradeKind::Accept, to, trade)
                .await?;
            Ok(None)
        }

        ClientRequest::RejectTrade { room, to, trade } => {
            rooms
                .get(&room)
                .await?
                .trade(conn, TradeKind::Reject, to, trade)
                .await?;
            Ok(None)
        }
    }
}

/// Full room state for a connection whose receiver skipped frames.
pub async fn resync_reply(room: &RoomHandle) -> Result<DirectReply, RoomError> {
    let snapshot = room.snapshot().await?;
    Ok(DirectReply::new(
        snapshot.room.clone(),
        snapshot.version,
        ServerEvent::RoomState(snapshot),
    ))
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.room.clone()));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind, start the retention sweep and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Ledger server listening on {}", self.config.bind_addr);

        let sweeper = self.rooms.spawn_retention(self.config.sweep_interval);
        let result = self.accept_loop(listener).await;
        sweeper.abort();
        result
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let mut session = Session::new(Uuid::new_v4());
        let conn = session.connection_id;
        log::info!("WebSocket connection {conn} established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += data.len() as u64;
                                }

                                let sync_msg = match SyncMessage::decode(&data) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        log::warn!("Dropping undecodable frame from {addr}: {e}");
                                        continue;
                                    }
                                };

                                match sync_msg.msg_type {
                                    MessageType::Request => {
                                        let request = match sync_msg.client_request() {
                                            Ok(r) => r,
                                            Err(e) => {
                                                log::warn!("Dropping malformed request from {conn}: {e}");
                                                continue;
                                            }
                                        };
                                        log::debug!("Request from {conn}: {request:?}");

                                        let reply = match handle_request(&rooms, &mut session, request).await {
                                            Ok(reply) => reply,
                                            Err(e) => {
                                                log::debug!("Request from {conn} failed: {e}");
                                                Some(DirectReply::error(&e))
                                            }
                                        };
                                        if let Some(reply) = reply {
                                            ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                        }
                                    }

                                    MessageType::Ping => {
                                        let pong = SyncMessage::pong(conn).encode()?;
                                        ws_sender.send(Message::Binary(pong.into())).await?;
                                    }

                                    other => {
                                        log::debug!("Unhandled message type from {conn}: {other:?}");
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection {conn} closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    frame = async {
                        match session.rx {
                            Some(ref mut rx) => rx.recv().await,
                            // Not in a room yet: wait forever.
                            None => std::future::pending().await,
                        }
                    } => {
                        match frame {
                            Ok(frame) => {
                                if frame.is_for(conn) {
                                    ws_sender.send(Message::Binary(frame.bytes.clone().into())).await?;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Connection {conn} lagged by {n} frames, resending room state");
                                stats.write().await.dropped_frames += n;
                                if let Some(room) = &session.room {
                                    room.broadcast().record_dropped(n);
                                    match resync_reply(room).await {
                                        Ok(reply) => {
                                            ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                        }
                                        Err(e) => log::debug!("Resync of {conn} failed: {e}"),
                                    }
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                session.rx = None;
                            }
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        // Cleanup: the participant stays in the room, marked offline.
        if let Some(room) = session.room.take() {
            if let Err(e) = room.disconnect(conn).await {
                log::debug!("Disconnect of {conn} from room {}: {e}", room.code());
            }
        }
        stats.write().await.active_connections -= 1;

        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.rooms.room_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoomConfig;
    use ledger_core::{Action, ActionDescriptor, Direction, Money};
    use serde_json::json;

    use crate::error::ErrorCode;

    fn created_code(reply: Option<DirectReply>) -> String {
        match reply.map(|r| r.event) {
            Some(ServerEvent::RoomCreated { room }) => room,
            other => panic!("expected room_created, got {other:?}"),
        }
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::new(ServerConfig::new("0.0.0.0:8080"));
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_join_then_act() {
        let rooms = RoomManager::new(RoomConfig::default());
        let mut session = Session::new(Uuid::new_v4());

        let code = created_code(
            handle_request(&rooms, &mut session, ClientRequest::CreateRoom)
                .await
                .unwrap(),
        );

        let reply = handle_request(
            &rooms,
            &mut session,
            ClientRequest::Join {
                room: code.clone(),
                name: "Alice".into(),
            },
        )
        .await
        .unwrap();
        assert!(reply.is_none());
        assert!(session.is_member_of(&code));

        handle_request(
            &rooms,
            &mut session,
            ClientRequest::SubmitAction {
                room: code.clone(),
                action: Action::AdjustMoney {
                    player: 1,
                    direction: Direction::Debit,
                    amounts: Money::from_counts([("50", 1)]),
                },
                description: None,
            },
        )
        .await
        .unwrap();

        let reply = handle_request(&rooms, &mut session, ClientRequest::FetchState { room: code })
            .await
            .unwrap();
        match reply.map(|r| r.event) {
            Some(ServerEvent::RoomState(snapshot)) => {
                assert_eq!(snapshot.state.player(1).unwrap().money.count("50"), 1);
                assert_eq!(snapshot.action_log.len(), 1);
            }
            other => panic!("expected room_state, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_vote_requires_joined_room() {
        let rooms = RoomManager::new(RoomConfig::default());
        let mut session = Session::new(Uuid::new_v4());

        let err = handle_request(
            &rooms,
            &mut session,
            ClientRequest::Vote {
                approval_id: "a1".into(),
                approve: true,
                voter_name: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotJoined);
    }

    #[tokio::test]
    async fn test_vote_routed_to_joined_room() {
        let rooms = RoomManager::new(RoomConfig::default());
        let mut alice = Session::new(Uuid::new_v4());
        let mut bob = Session::new(Uuid::new_v4());
        let code = created_code(
            handle_request(&rooms, &mut alice, ClientRequest::CreateRoom)
                .await
                .unwrap(),
        );
        for (session, name) in [(&mut alice, "Alice"), (&mut bob, "Bob")] {
            handle_request(
                &rooms,
                session,
                ClientRequest::Join {
                    room: code.clone(),
                    name: name.into(),
                },
            )
            .await
            .unwrap();
        }

        handle_request(
            &rooms,
            &mut alice,
            ClientRequest::RequestApproval {
                room: code.clone(),
                action: ActionDescriptor::new("bonus", "Alice asks for 100")
                    .with_data(json!({ "amount": 100 })),
                approval_id: Some("a1".into()),
            },
        )
        .await
        .unwrap();

        handle_request(
            &rooms,
            &mut bob,
            ClientRequest::Vote {
                approval_id: "a1".into(),
                approve: true,
                voter_name: Some("Bob".into()),
            },
        )
        .await
        .unwrap();

        // Resolved and removed: a second vote finds nothing.
        let err = handle_request(
            &rooms,
            &mut bob,
            ClientRequest::Vote {
                approval_id: "a1".into(),
                approve: true,
                voter_name: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err, RoomError::UnknownApproval("a1".into()));
    }

    #[tokio::test]
    async fn test_lifecycle_replies_for_non_members() {
        let rooms = RoomManager::new(RoomConfig::default());
        let mut admin = Session::new(Uuid::new_v4());
        let code = created_code(
            handle_request(&rooms, &mut admin, ClientRequest::CreateRoom)
                .await
                .unwrap(),
        );

        let reply = handle_request(&rooms, &mut admin, ClientRequest::ResetRoom { room: code.clone() })
            .await
            .unwrap();
        assert!(matches!(reply.map(|r| r.event), Some(ServerEvent::RoomReset { .. })));

        let reply = handle_request(&rooms, &mut admin, ClientRequest::DeleteRoom { room: code.clone() })
            .await
            .unwrap();
        assert!(matches!(reply.map(|r| r.event), Some(ServerEvent::RoomDeleted { .. })));

        let err = handle_request(&rooms, &mut admin, ClientRequest::RoomSummary { room: code })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RoomNotFound);
    }

    #[tokio::test]
    async fn test_lagging_receiver_gets_latest_state() {
        let rooms = RoomManager::new(RoomConfig {
            broadcast_capacity: 2,
            ..RoomConfig::default()
        });
        let mut alice = Session::new(Uuid::new_v4());
        let code = created_code(
            handle_request(&rooms, &mut alice, ClientRequest::CreateRoom)
                .await
                .unwrap(),
        );
        handle_request(
            &rooms,
            &mut alice,
            ClientRequest::Join {
                room: code.clone(),
                name: "Alice".into(),
            },
        )
        .await
        .unwrap();

        for _ in 0..5 {
            handle_request(
                &rooms,
                &mut alice,
                ClientRequest::SubmitAction {
                    room: code.clone(),
                    action: Action::AdjustMoney {
                        player: 1,
                        direction: Direction::Credit,
                        amounts: Money::from_counts([("1", 1)]),
                    },
                    description: None,
                },
            )
            .await
            .unwrap();
        }

        let rx = alice.rx.as_mut().unwrap();
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));

        let reply = resync_reply(alice.room().unwrap()).await.unwrap();
        assert_eq!(reply.room, code);
        let msg = SyncMessage::decode(&reply.encode().unwrap()).unwrap();
        match msg.server_event().unwrap() {
            ServerEvent::RoomState(snapshot) => {
                assert_eq!(snapshot.state.player(1).unwrap().money.count("1"), 10);
                assert_eq!(snapshot.action_log.len(), 5);
                assert_eq!(msg.clock, snapshot.version);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_error_reply_shape() {
        let reply = DirectReply::error(&RoomError::UnknownPlayer(3));
        let msg = SyncMessage::decode(&reply.encode().unwrap()).unwrap();
        match msg.server_event().unwrap() {
            ServerEvent::Error { code, message } => {
                assert_eq!(code, ErrorCode::UnknownPlayer);
                assert_eq!(message, "unknown player: 3");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
