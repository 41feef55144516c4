//! Room registry and per-participant state.
//!
//! The registry is the single source of truth for room membership. All
//! mutations of one room happen under that room's mutex, which is what gives
//! fan-out its ordering guarantee: events are enqueued on every recipient's
//! outbound channel in the order the room serializer saw them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use huddle_shared::constants::{MAX_NICKNAME_LEN, MAX_ROOM_PARTICIPANTS};
use huddle_shared::protocol::{ChatRecord, FileMeta, ParticipantInfo, ServerEvent};
use huddle_shared::types::{ConnectionId, RoomCode};

/// Why a join was refused. Display strings are client-facing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("Room not found")]
    RoomNotFound,

    #[error("Room is full")]
    RoomFull,

    #[error("Nickname already taken")]
    NicknameTaken,

    #[error("Invalid nickname")]
    InvalidNickname,
}

/// What a successful join returns: the canonical code, the full roster in
/// join order (including the joiner), and whether the joiner is host.
#[derive(Debug, Clone)]
pub struct RoomView {
    pub room_id: RoomCode,
    pub participants: Vec<ParticipantInfo>,
    pub is_host: bool,
}

/// A participant whose outbound queue overflowed. The connection is dropped
/// from its room through the normal leave path rather than blocking senders.
#[derive(Debug, Clone)]
pub struct Eviction {
    pub room: RoomCode,
    pub connection: ConnectionId,
}

struct Participant {
    id: ConnectionId,
    nickname: String,
    muted: bool,
    hand_raised: bool,
    video_enabled: bool,
    screen_sharing: bool,
    joined_at: DateTime<Utc>,
    /// Join order within the room; host transfer picks the smallest.
    seq: u64,
    outbound: mpsc::Sender<ServerEvent>,
}

impl Participant {
    fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            socket_id: self.id,
            nickname: self.nickname.clone(),
            is_muted: self.muted,
            is_video_enabled: self.video_enabled,
            is_hand_raised: self.hand_raised,
            is_screen_sharing: self.screen_sharing,
            joined_at: self.joined_at,
        }
    }
}

struct Room {
    code: RoomCode,
    host: Option<ConnectionId>,
    participants: HashMap<ConnectionId, Participant>,
    next_seq: u64,
    chat: Vec<ChatRecord>,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

impl Room {
    fn new(code: RoomCode) -> Self {
        Self {
            code,
            host: None,
            participants: HashMap::new(),
            next_seq: 0,
            chat: Vec::new(),
            created_at: Utc::now(),
        }
    }

    fn roster(&self) -> Vec<ParticipantInfo> {
        let mut participants: Vec<&Participant> = self.participants.values().collect();
        participants.sort_by_key(|p| p.seq);
        participants.iter().map(|p| p.info()).collect()
    }

    fn earliest(&self) -> Option<ConnectionId> {
        self.participants
            .values()
            .min_by_key(|p| p.seq)
            .map(|p| p.id)
    }

    /// Enqueue `event` on every participant's outbound channel except `skip`.
    /// Never blocks: a full queue marks that participant for eviction.
    fn broadcast(
        &self,
        event: &ServerEvent,
        skip: Option<ConnectionId>,
        evictions: &mpsc::UnboundedSender<Eviction>,
    ) {
        for participant in self.participants.values() {
            if Some(participant.id) == skip {
                continue;
            }
            self.deliver(participant, event.clone(), evictions);
        }
    }

    fn send_to(
        &self,
        to: ConnectionId,
        event: ServerEvent,
        evictions: &mpsc::UnboundedSender<Eviction>,
    ) {
        // The recipient may have just left; absence is a silent drop.
        if let Some(participant) = self.participants.get(&to) {
            self.deliver(participant, event, evictions);
        }
    }

    fn deliver(
        &self,
        participant: &Participant,
        event: ServerEvent,
        evictions: &mpsc::UnboundedSender<Eviction>,
    ) {
        match participant.outbound.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    room = %self.code,
                    peer = %participant.id,
                    "Outbound queue full, scheduling eviction"
                );
                let _ = evictions.send(Eviction {
                    room: self.code.clone(),
                    connection: participant.id,
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Connection is tearing down; its own cleanup handles removal.
                debug!(room = %self.code, peer = %participant.id, "Dropped event for closing connection");
            }
        }
    }
}

/// Authoritative map from room code to room. Cheap to clone; all clones share
/// state. Instantiable per test with no process-wide singletons.
#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    rooms: RwLock<HashMap<RoomCode, Arc<Mutex<Room>>>>,
    evictions: mpsc::UnboundedSender<Eviction>,
}

impl RoomRegistry {
    /// Returns the registry plus the receiver of eviction requests. The
    /// caller is expected to drain it and route each entry through
    /// [`RoomRegistry::leave`] and upload cleanup.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Eviction>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Self {
            inner: Arc::new(RegistryInner {
                rooms: RwLock::new(HashMap::new()),
                evictions: tx,
            }),
        };
        (registry, rx)
    }

    /// Mint a fresh code and register an empty room under it.
    pub async fn mint(&self) -> RoomCode {
        let mut rooms = self.inner.rooms.write().await;
        loop {
            let code = RoomCode::mint();
            if rooms.contains_key(&code) {
                continue;
            }
            rooms.insert(code.clone(), Arc::new(Mutex::new(Room::new(code.clone()))));
            info!(room = %code, "Minted room");
            return code;
        }
    }

    pub async fn exists(&self, code: &RoomCode) -> bool {
        self.inner.rooms.read().await.contains_key(code)
    }

    pub async fn participant_count(&self, code: &RoomCode) -> Option<usize> {
        let handle = self.room(code).await?;
        let room = handle.lock().await;
        Some(room.participants.len())
    }

    #[allow(dead_code)]
    pub async fn host_of(&self, code: &RoomCode) -> Option<ConnectionId> {
        let handle = self.room(code).await?;
        let room = handle.lock().await;
        room.host
    }

    #[allow(dead_code)]
    pub async fn screen_sharer(&self, code: &RoomCode) -> Option<ConnectionId> {
        let handle = self.room(code).await?;
        let room = handle.lock().await;
        room.participants
            .values()
            .find(|p| p.screen_sharing)
            .map(|p| p.id)
    }

    /// Atomic join. The first participant becomes host. Joining again with
    /// the same connection id is a no-op that returns the current view.
    pub async fn join(
        &self,
        code: &RoomCode,
        conn: ConnectionId,
        nickname: &str,
        outbound: mpsc::Sender<ServerEvent>,
    ) -> Result<RoomView, JoinError> {
        let handle = self.room(code).await.ok_or(JoinError::RoomNotFound)?;
        let mut room = handle.lock().await;

        if room.participants.contains_key(&conn) {
            return Ok(RoomView {
                room_id: room.code.clone(),
                participants: room.roster(),
                is_host: room.host == Some(conn),
            });
        }

        if room.participants.len() >= MAX_ROOM_PARTICIPANTS {
            return Err(JoinError::RoomFull);
        }
        if !nickname_is_valid(nickname) {
            return Err(JoinError::InvalidNickname);
        }
        if room.participants.values().any(|p| p.nickname == nickname) {
            return Err(JoinError::NicknameTaken);
        }

        let seq = room.next_seq;
        room.next_seq += 1;
        let participant = Participant {
            id: conn,
            nickname: nickname.to_string(),
            muted: false,
            hand_raised: false,
            video_enabled: true,
            screen_sharing: false,
            joined_at: Utc::now(),
            seq,
            outbound,
        };
        let info = participant.info();

        if room.host.is_none() {
            room.host = Some(conn);
        }
        room.participants.insert(conn, participant);

        room.broadcast(
            &ServerEvent::UserJoined(info),
            Some(conn),
            &self.inner.evictions,
        );

        info!(
            room = %code,
            peer = %conn,
            nickname = %nickname,
            participants = room.participants.len(),
            "Participant joined"
        );

        Ok(RoomView {
            room_id: room.code.clone(),
            participants: room.roster(),
            is_host: room.host == Some(conn),
        })
    }

    /// Remove a participant, broadcast `user-left`, transfer the host role to
    /// the earliest-joined survivor, and destroy the room once empty.
    /// Returns false if the connection was not a member.
    pub async fn leave(&self, code: &RoomCode, conn: ConnectionId) -> bool {
        let Some(handle) = self.room(code).await else {
            return false;
        };

        let emptied = {
            let mut room = handle.lock().await;
            let Some(removed) = room.participants.remove(&conn) else {
                return false;
            };

            if room.host == Some(conn) {
                room.host = room.earliest();
                if let Some(new_host) = room.host {
                    info!(room = %code, peer = %new_host, "Host transferred");
                }
            }

            room.broadcast(
                &ServerEvent::UserLeft {
                    socket_id: conn,
                    nickname: removed.nickname.clone(),
                },
                None,
                &self.inner.evictions,
            );

            info!(
                room = %code,
                peer = %conn,
                nickname = %removed.nickname,
                participants = room.participants.len(),
                "Participant left"
            );

            room.participants.is_empty()
        };

        if emptied {
            // Re-check under the map write lock; a join may have raced in
            // between releasing the room mutex and taking the write lock.
            let mut rooms = self.inner.rooms.write().await;
            if let Some(h) = rooms.get(code) {
                if h.lock().await.participants.is_empty() {
                    rooms.remove(code);
                    info!(room = %code, "Destroyed empty room");
                }
            }
        }

        true
    }

    /// Set the mute flag and notify everyone else in the room. Unknown rooms
    /// or non-members are a silent drop.
    pub async fn set_muted(&self, code: &RoomCode, conn: ConnectionId, is_muted: bool) {
        let Some(handle) = self.room(code).await else {
            return;
        };
        let mut room = handle.lock().await;
        let Some(participant) = room.participants.get_mut(&conn) else {
            return;
        };
        participant.muted = is_muted;
        room.broadcast(
            &ServerEvent::UserMuteChanged {
                socket_id: conn,
                is_muted,
            },
            Some(conn),
            &self.inner.evictions,
        );
    }

    pub async fn set_hand_raised(&self, code: &RoomCode, conn: ConnectionId, is_hand_raised: bool) {
        let Some(handle) = self.room(code).await else {
            return;
        };
        let mut room = handle.lock().await;
        let Some(participant) = room.participants.get_mut(&conn) else {
            return;
        };
        participant.hand_raised = is_hand_raised;
        let nickname = participant.nickname.clone();
        room.broadcast(
            &ServerEvent::UserHandRaised {
                socket_id: conn,
                is_hand_raised,
                nickname,
            },
            Some(conn),
            &self.inner.evictions,
        );
    }

    pub async fn set_video_enabled(
        &self,
        code: &RoomCode,
        conn: ConnectionId,
        is_video_enabled: bool,
    ) {
        let Some(handle) = self.room(code).await else {
            return;
        };
        let mut room = handle.lock().await;
        let Some(participant) = room.participants.get_mut(&conn) else {
            return;
        };
        participant.video_enabled = is_video_enabled;
        room.broadcast(
            &ServerEvent::UserVideoChanged {
                socket_id: conn,
                is_video_enabled,
            },
            Some(conn),
            &self.inner.evictions,
        );
    }

    /// Mark the sender as the room's single screen sharer. Any previous
    /// sharer's flag is cleared in the same critical section, so a new start
    /// supersedes an existing one without negotiation.
    pub async fn start_screen_share(&self, code: &RoomCode, conn: ConnectionId, user_name: &str) {
        let Some(handle) = self.room(code).await else {
            return;
        };
        let mut room = handle.lock().await;
        if !room.participants.contains_key(&conn) {
            return;
        }
        for participant in room.participants.values_mut() {
            participant.screen_sharing = participant.id == conn;
        }
        room.broadcast(
            &ServerEvent::ScreenShareStart {
                user_id: conn,
                user_name: user_name.to_string(),
            },
            Some(conn),
            &self.inner.evictions,
        );
        info!(room = %code, peer = %conn, "Screen share started");
    }

    pub async fn stop_screen_share(&self, code: &RoomCode, conn: ConnectionId) {
        let Some(handle) = self.room(code).await else {
            return;
        };
        let mut room = handle.lock().await;
        let Some(participant) = room.participants.get_mut(&conn) else {
            return;
        };
        participant.screen_sharing = false;
        room.broadcast(
            &ServerEvent::ScreenShareStop { user_id: conn },
            Some(conn),
            &self.inner.evictions,
        );
        info!(room = %code, peer = %conn, "Screen share stopped");
    }

    /// Append a chat record and echo it to every participant, sender
    /// included. Empty messages with no attachment are ignored.
    pub async fn append_chat(
        &self,
        code: &RoomCode,
        conn: ConnectionId,
        message: String,
        file: Option<FileMeta>,
    ) {
        if message.is_empty() && file.is_none() {
            return;
        }
        let Some(handle) = self.room(code).await else {
            return;
        };
        let mut room = handle.lock().await;
        let Some(participant) = room.participants.get(&conn) else {
            return;
        };

        let record = ChatRecord {
            id: Uuid::new_v4(),
            socket_id: conn,
            nickname: participant.nickname.clone(),
            message,
            file,
            timestamp: Utc::now(),
        };
        room.chat.push(record.clone());
        room.broadcast(
            &ServerEvent::ChatMessage(record),
            None,
            &self.inner.evictions,
        );
    }

    /// Relay an already-built signaling event from `from` to `to`. The sender
    /// must be a member of the room; the recipient need not be (it may have
    /// just left), in which case the event is dropped silently.
    pub async fn relay(
        &self,
        code: &RoomCode,
        from: ConnectionId,
        to: ConnectionId,
        event: ServerEvent,
    ) {
        let Some(handle) = self.room(code).await else {
            return;
        };
        let room = handle.lock().await;
        if !room.participants.contains_key(&from) {
            debug!(room = %code, peer = %from, "Dropping signal from non-member");
            return;
        }
        room.send_to(to, event, &self.inner.evictions);
    }

    async fn room(&self, code: &RoomCode) -> Option<Arc<Mutex<Room>>> {
        self.inner.rooms.read().await.get(code).cloned()
    }
}

fn nickname_is_valid(nickname: &str) -> bool {
    let len = nickname.chars().count();
    (1..=MAX_NICKNAME_LEN).contains(&len) && nickname.chars().all(|c| !c.is_control())
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_shared::constants::OUTBOUND_QUEUE_CAPACITY;

    fn outbound() -> (mpsc::Sender<ServerEvent>, mpsc::Receiver<ServerEvent>) {
        mpsc::channel(OUTBOUND_QUEUE_CAPACITY)
    }

    async fn minted() -> (RoomRegistry, mpsc::UnboundedReceiver<Eviction>, RoomCode) {
        let (registry, evictions) = RoomRegistry::new();
        let code = registry.mint().await;
        (registry, evictions, code)
    }

    #[tokio::test]
    async fn test_first_joiner_is_host() {
        let (registry, _ev, code) = minted().await;
        let alice = ConnectionId::new();
        let (tx, _rx) = outbound();

        let view = registry.join(&code, alice, "alice", tx).await.unwrap();
        assert!(view.is_host);
        assert_eq!(view.participants.len(), 1);
        assert_eq!(view.participants[0].nickname, "alice");

        let bob = ConnectionId::new();
        let (tx, _rx) = outbound();
        let view = registry.join(&code, bob, "bob", tx).await.unwrap();
        assert!(!view.is_host);
        assert_eq!(view.participants.len(), 2);
        // Roster is in join order.
        assert_eq!(view.participants[0].nickname, "alice");
        assert_eq!(view.participants[1].nickname, "bob");
    }

    #[tokio::test]
    async fn test_join_unknown_room() {
        let (registry, _ev) = RoomRegistry::new();
        let (tx, _rx) = outbound();
        let err = registry
            .join(&RoomCode::folded("NOPENOPE"), ConnectionId::new(), "x", tx)
            .await
            .unwrap_err();
        assert_eq!(err, JoinError::RoomNotFound);
    }

    #[tokio::test]
    async fn test_lookup_is_case_insensitive() {
        let (registry, _ev, code) = minted().await;
        let lower = RoomCode::folded(&code.as_str().to_ascii_lowercase());
        assert!(registry.exists(&lower).await);
    }

    #[tokio::test]
    async fn test_room_capacity() {
        let (registry, _ev, code) = minted().await;
        let mut receivers = Vec::new();
        for i in 0..MAX_ROOM_PARTICIPANTS {
            let (tx, rx) = outbound();
            receivers.push(rx);
            registry
                .join(&code, ConnectionId::new(), &format!("user{i}"), tx)
                .await
                .unwrap();
        }

        let (tx, _rx) = outbound();
        let err = registry
            .join(&code, ConnectionId::new(), "straggler", tx)
            .await
            .unwrap_err();
        assert_eq!(err, JoinError::RoomFull);
        assert_eq!(registry.participant_count(&code).await, Some(10));
    }

    #[tokio::test]
    async fn test_nickname_must_be_unique() {
        let (registry, _ev, code) = minted().await;
        let (tx, _rx) = outbound();
        registry
            .join(&code, ConnectionId::new(), "alice", tx)
            .await
            .unwrap();

        let (tx, _rx) = outbound();
        let err = registry
            .join(&code, ConnectionId::new(), "alice", tx)
            .await
            .unwrap_err();
        assert_eq!(err, JoinError::NicknameTaken);
        assert_eq!(registry.participant_count(&code).await, Some(1));
    }

    #[tokio::test]
    async fn test_nickname_validation() {
        let (registry, _ev, code) = minted().await;
        let (tx, _rx) = outbound();
        let err = registry
            .join(&code, ConnectionId::new(), "", tx)
            .await
            .unwrap_err();
        assert_eq!(err, JoinError::InvalidNickname);

        let (tx, _rx) = outbound();
        let err = registry
            .join(&code, ConnectionId::new(), &"x".repeat(41), tx)
            .await
            .unwrap_err();
        assert_eq!(err, JoinError::InvalidNickname);
    }

    #[tokio::test]
    async fn test_rejoin_is_idempotent() {
        let (registry, _ev, code) = minted().await;
        let alice = ConnectionId::new();
        let (tx, _rx) = outbound();
        registry.join(&code, alice, "alice", tx).await.unwrap();

        let (tx, _rx) = outbound();
        let view = registry.join(&code, alice, "alice", tx).await.unwrap();
        assert!(view.is_host);
        assert_eq!(view.participants.len(), 1);
        assert_eq!(registry.participant_count(&code).await, Some(1));
    }

    #[tokio::test]
    async fn test_host_transfer_follows_join_order() {
        let (registry, _ev, code) = minted().await;
        let (alice, bob, carol) = (ConnectionId::new(), ConnectionId::new(), ConnectionId::new());
        let mut receivers = Vec::new();
        for (conn, name) in [(alice, "alice"), (bob, "bob"), (carol, "carol")] {
            let (tx, rx) = outbound();
            receivers.push(rx);
            registry.join(&code, conn, name, tx).await.unwrap();
        }
        assert_eq!(registry.host_of(&code).await, Some(alice));

        registry.leave(&code, alice).await;
        assert_eq!(registry.host_of(&code).await, Some(bob));

        registry.leave(&code, bob).await;
        assert_eq!(registry.host_of(&code).await, Some(carol));
    }

    #[tokio::test]
    async fn test_empty_room_is_destroyed() {
        let (registry, _ev, code) = minted().await;
        let alice = ConnectionId::new();
        let (tx, _rx) = outbound();
        registry.join(&code, alice, "alice", tx).await.unwrap();

        assert!(registry.leave(&code, alice).await);
        assert!(!registry.exists(&code).await);
        assert_eq!(registry.participant_count(&code).await, None);
    }

    #[tokio::test]
    async fn test_join_broadcasts_to_existing_members() {
        let (registry, _ev, code) = minted().await;
        let alice = ConnectionId::new();
        let (tx, mut alice_rx) = outbound();
        registry.join(&code, alice, "alice", tx).await.unwrap();

        let bob = ConnectionId::new();
        let (tx, mut bob_rx) = outbound();
        registry.join(&code, bob, "bob", tx).await.unwrap();

        match alice_rx.try_recv().unwrap() {
            ServerEvent::UserJoined(info) => {
                assert_eq!(info.socket_id, bob);
                assert_eq!(info.nickname, "bob");
                assert!(info.is_video_enabled);
            }
            other => panic!("expected user-joined, got {other:?}"),
        }
        // The joiner itself gets no user-joined echo.
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_chat_echo_includes_sender() {
        let (registry, _ev, code) = minted().await;
        let alice = ConnectionId::new();
        let (tx, mut alice_rx) = outbound();
        registry.join(&code, alice, "alice", tx).await.unwrap();

        let bob = ConnectionId::new();
        let (tx, mut bob_rx) = outbound();
        registry.join(&code, bob, "bob", tx).await.unwrap();
        let _ = alice_rx.try_recv(); // drain bob's user-joined

        registry
            .append_chat(&code, alice, "hi".into(), None)
            .await;

        for rx in [&mut alice_rx, &mut bob_rx] {
            match rx.try_recv().unwrap() {
                ServerEvent::ChatMessage(record) => {
                    assert_eq!(record.message, "hi");
                    assert_eq!(record.socket_id, alice);
                    assert_eq!(record.nickname, "alice");
                }
                other => panic!("expected chat-message, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_empty_chat_with_no_file_is_ignored() {
        let (registry, _ev, code) = minted().await;
        let alice = ConnectionId::new();
        let (tx, mut alice_rx) = outbound();
        registry.join(&code, alice, "alice", tx).await.unwrap();

        registry.append_chat(&code, alice, String::new(), None).await;
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_mute_notification_skips_origin() {
        let (registry, _ev, code) = minted().await;
        let alice = ConnectionId::new();
        let (tx, mut alice_rx) = outbound();
        registry.join(&code, alice, "alice", tx).await.unwrap();

        let bob = ConnectionId::new();
        let (tx, mut bob_rx) = outbound();
        registry.join(&code, bob, "bob", tx).await.unwrap();
        let _ = alice_rx.try_recv();

        registry.set_muted(&code, alice, true).await;
        assert!(alice_rx.try_recv().is_err());
        match bob_rx.try_recv().unwrap() {
            ServerEvent::UserMuteChanged {
                socket_id,
                is_muted,
            } => {
                assert_eq!(socket_id, alice);
                assert!(is_muted);
            }
            other => panic!("expected user-mute-changed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hand_raise_carries_nickname() {
        let (registry, _ev, code) = minted().await;
        let alice = ConnectionId::new();
        let (tx, mut alice_rx) = outbound();
        registry.join(&code, alice, "alice", tx).await.unwrap();

        let bob = ConnectionId::new();
        let (tx, _bob_rx) = outbound();
        registry.join(&code, bob, "bob", tx).await.unwrap();
        let _ = alice_rx.try_recv();

        registry.set_hand_raised(&code, bob, true).await;
        match alice_rx.try_recv().unwrap() {
            ServerEvent::UserHandRaised {
                socket_id,
                is_hand_raised,
                nickname,
            } => {
                assert_eq!(socket_id, bob);
                assert!(is_hand_raised);
                assert_eq!(nickname, "bob");
            }
            other => panic!("expected user-hand-raised, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_screen_share_has_single_sharer() {
        let (registry, _ev, code) = minted().await;
        let alice = ConnectionId::new();
        let (tx, mut alice_rx) = outbound();
        registry.join(&code, alice, "alice", tx).await.unwrap();

        let bob = ConnectionId::new();
        let (tx, mut bob_rx) = outbound();
        registry.join(&code, bob, "bob", tx).await.unwrap();
        let _ = alice_rx.try_recv();

        registry.start_screen_share(&code, alice, "alice").await;
        assert_eq!(registry.screen_sharer(&code).await, Some(alice));
        assert!(matches!(
            bob_rx.try_recv().unwrap(),
            ServerEvent::ScreenShareStart { user_id, .. } if user_id == alice
        ));

        // A second start supersedes the first without negotiation.
        registry.start_screen_share(&code, bob, "bob").await;
        assert_eq!(registry.screen_sharer(&code).await, Some(bob));
        assert!(matches!(
            alice_rx.try_recv().unwrap(),
            ServerEvent::ScreenShareStart { user_id, .. } if user_id == bob
        ));

        registry.stop_screen_share(&code, bob).await;
        assert_eq!(registry.screen_sharer(&code).await, None);
    }

    #[tokio::test]
    async fn test_relay_reaches_only_target() {
        let (registry, _ev, code) = minted().await;
        let alice = ConnectionId::new();
        let (tx, mut alice_rx) = outbound();
        registry.join(&code, alice, "alice", tx).await.unwrap();

        let bob = ConnectionId::new();
        let (tx, mut bob_rx) = outbound();
        registry.join(&code, bob, "bob", tx).await.unwrap();
        let _ = alice_rx.try_recv();

        let event = ServerEvent::Offer {
            offer: serde_json::json!({"type": "offer", "sdp": "v=0"}),
            from: alice,
        };
        registry.relay(&code, alice, bob, event).await;

        assert!(matches!(
            bob_rx.try_recv().unwrap(),
            ServerEvent::Offer { from, .. } if from == alice
        ));
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_relay_from_non_member_is_dropped() {
        let (registry, _ev, code) = minted().await;
        let alice = ConnectionId::new();
        let (tx, mut alice_rx) = outbound();
        registry.join(&code, alice, "alice", tx).await.unwrap();

        let stranger = ConnectionId::new();
        let event = ServerEvent::Offer {
            offer: serde_json::json!({}),
            from: stranger,
        };
        registry.relay(&code, stranger, alice, event).await;
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_relay_to_departed_recipient_is_silent() {
        let (registry, _ev, code) = minted().await;
        let alice = ConnectionId::new();
        let (tx, _rx) = outbound();
        registry.join(&code, alice, "alice", tx).await.unwrap();

        let gone = ConnectionId::new();
        let event = ServerEvent::Answer {
            answer: serde_json::json!({}),
            from: alice,
        };
        // Must not panic or error.
        registry.relay(&code, alice, gone, event).await;
    }

    #[tokio::test]
    async fn test_slow_consumer_is_scheduled_for_eviction() {
        let (registry, mut evictions, code) = minted().await;
        let slow = ConnectionId::new();
        // Capacity 1: the first broadcast fills the queue, the second
        // overflows it.
        let (tx, _slow_rx) = mpsc::channel(1);
        registry.join(&code, slow, "slow", tx).await.unwrap();

        let bob = ConnectionId::new();
        let (tx, _rx) = outbound();
        registry.join(&code, bob, "bob", tx).await.unwrap();
        registry.set_muted(&code, bob, true).await;

        let eviction = evictions.try_recv().unwrap();
        assert_eq!(eviction.connection, slow);
        assert_eq!(eviction.room, code);
    }

    #[tokio::test]
    async fn test_toggle_is_idempotent_on_state() {
        let (registry, _ev, code) = minted().await;
        let alice = ConnectionId::new();
        let (tx, _rx) = outbound();
        registry.join(&code, alice, "alice", tx).await.unwrap();

        registry.set_muted(&code, alice, true).await;
        registry.set_muted(&code, alice, true).await;

        let bob = ConnectionId::new();
        let (tx, _rx) = outbound();
        let view = registry.join(&code, bob, "bob", tx).await.unwrap();
        let alice_info = view
            .participants
            .iter()
            .find(|p| p.socket_id == alice)
            .unwrap();
        assert!(alice_info.is_muted);
    }
}
