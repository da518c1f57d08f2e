//! Chat server state
//!
//! Everything shared across connections lives here and is created once
//! at startup: the room handles, the client registry, the name guard and
//! the bad word dictionary. The server also runs the disconnect loop that
//! retires clients whose session has closed, and answers the read-only
//! queries (trending phrases per room, per-user session stats).

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::client::ClientAgent;
use crate::config::Config;
use crate::error::AppError;
use crate::registry::ClientRegistry;
use crate::room::{Room, RoomHandle, RoomSnapshot};
use crate::session::{Packet, Session, SessionLinks};
use crate::trie::{BadWordTrie, NameTrie};
use crate::types::{RoomId, SessionId};

/// Capacity of the disconnect notification mailbox
pub const OFFLINE_MAILBOX_SIZE: usize = 4096;

/// Wall-clock format used on the wire
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Session stats for one online user
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionStats {
    #[serde(rename = "userName")]
    pub user_name: String,
    #[serde(rename = "loginTime")]
    pub login_time: String,
    #[serde(rename = "onlineTime")]
    pub online_time: String,
    #[serde(rename = "roomID")]
    pub room_id: i64,
}

/// Process-wide chat state
pub struct ChatServer {
    config: Config,
    rooms: Vec<RoomHandle>,
    registry: ClientRegistry,
    names: NameTrie,
    badwords: BadWordTrie,
    links: SessionLinks,
}

impl ChatServer {
    /// Create the rooms and start the room loops and the disconnect loop
    pub fn start(
        config: Config,
        badwords: BadWordTrie,
        shutdown: CancellationToken,
        tracker: TaskTracker,
    ) -> Arc<Self> {
        let rooms = (1..=config.rooms.max(1))
            .map(|id| {
                let room = Room::new(RoomId(id), config.backlog, config.hot_retention());
                RoomHandle::spawn(room, shutdown.clone(), &tracker)
            })
            .collect::<Vec<_>>();

        let (offline_tx, offline_rx) = mpsc::channel(OFFLINE_MAILBOX_SIZE);
        let server = Arc::new(Self {
            config,
            rooms,
            registry: ClientRegistry::new(),
            names: NameTrie::new(),
            badwords,
            links: SessionLinks {
                offline_tx,
                shutdown: shutdown.clone(),
                tracker: tracker.clone(),
            },
        });

        tracker.spawn(Arc::clone(&server).run_offline_loop(offline_rx, shutdown));
        info!("ChatServer started with {} rooms", server.rooms.len());

        server
    }

    /// Open a session for an upgraded connection and register its agent
    pub fn attach<S>(
        &self,
        ws: WebSocketStream<S>,
        peer: String,
    ) -> (Arc<ClientAgent>, mpsc::Receiver<Packet>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (session, inbound) =
            Session::open(ws, peer, self.config.session_config(), &self.links, None);
        let agent = Arc::new(ClientAgent::new(session));
        self.registry.add(Arc::clone(&agent));
        (agent, inbound)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn names(&self) -> &NameTrie {
        &self.names
    }

    pub fn badwords(&self) -> &BadWordTrie {
        &self.badwords
    }

    /// Process shutdown signal
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.links.shutdown
    }

    /// Task group every connection task is spawned on
    pub fn tracker(&self) -> &TaskTracker {
        &self.links.tracker
    }

    /// Look up a room by its wire id
    pub fn room(&self, id: i64) -> Option<&RoomHandle> {
        let index = usize::try_from(id).ok()?.checked_sub(1)?;
        self.rooms.get(index)
    }

    /// Pick a room for a newly logged in client
    pub fn random_room(&self) -> &RoomHandle {
        let index = rand::thread_rng().gen_range(0..self.rooms.len());
        &self.rooms[index]
    }

    pub fn rooms(&self) -> &[RoomHandle] {
        &self.rooms
    }

    /// Top `k` trending phrases of a room
    pub async fn popular(&self, room_id: i64, k: usize) -> Result<Vec<String>, AppError> {
        let room = self.room(room_id).ok_or(AppError::RoomNotFound(room_id))?;
        room.top_k(k).await
    }

    /// Session stats of an online user
    pub fn stats(&self, user_name: &str) -> Result<SessionStats, AppError> {
        let agent = Some(user_name)
            .filter(|name| !name.is_empty())
            .and_then(|name| self.registry.find_by_name(name))
            .ok_or_else(|| AppError::PlayerNotFound(user_name.to_string()))?;

        let session = &agent.session;
        Ok(SessionStats {
            user_name: agent.display_name().to_string(),
            login_time: session.online_at().format(TIME_FORMAT).to_string(),
            online_time: format_duration(session.online_duration()),
            room_id: agent.room_state().to_raw(),
        })
    }

    pub async fn room_snapshot(&self, room_id: i64) -> Result<RoomSnapshot, AppError> {
        let room = self.room(room_id).ok_or(AppError::RoomNotFound(room_id))?;
        room.snapshot().await
    }

    async fn run_offline_loop(
        self: Arc<Self>,
        mut offline_rx: mpsc::Receiver<SessionId>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                id = offline_rx.recv() => match id {
                    Some(id) => self.handle_offline(id).await,
                    None => break,
                },
            }
        }
        debug!("Disconnect loop stopped");
    }

    /// Take a closed session out of its room and out of the registry
    async fn handle_offline(&self, id: SessionId) {
        let Some(agent) = self.registry.get(id) else {
            return;
        };

        if let Some(room) = agent.room_state().room().and_then(|r| self.room(r.get())) {
            let _ = room.unregister(&agent).await;
        }
        self.registry.remove(id);

        info!(
            "Client {} '{}' offline, {} clients online",
            id,
            agent.display_name(),
            self.registry.len()
        );
    }
}

/// Render a duration as `1h2m3s`, `2m3s` or `3s`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, secs % 3600 / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::ws_pair;

    fn start(rooms: u32) -> Arc<ChatServer> {
        let config = Config {
            rooms,
            ..Config::default()
        };
        ChatServer::start(
            config,
            BadWordTrie::new(),
            CancellationToken::new(),
            TaskTracker::new(),
        )
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h2m5s");
    }

    #[tokio::test]
    async fn test_room_lookup() {
        let server = start(4);
        assert_eq!(server.rooms().len(), 4);
        assert_eq!(server.room(1).map(|r| r.id()), Some(RoomId(1)));
        assert_eq!(server.room(4).map(|r| r.id()), Some(RoomId(4)));
        assert!(server.room(0).is_none());
        assert!(server.room(5).is_none());
        assert!(server.room(-1).is_none());

        for _ in 0..20 {
            let id = server.random_room().id();
            assert!((1..=4).contains(&id.0));
        }
    }

    #[tokio::test]
    async fn test_queries_for_unknown_targets() {
        let server = start(2);
        assert!(matches!(
            server.popular(9, 3).await,
            Err(AppError::RoomNotFound(9))
        ));
        assert!(matches!(
            server.stats("nobody"),
            Err(AppError::PlayerNotFound(_))
        ));
        assert!(server.popular(1, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats_ignores_clients_without_name() {
        let server = start(1);
        let (server_ws, _client) = ws_pair(4096).await;
        let (agent, _inbound) = server.attach(server_ws, "test".to_string());
        assert_eq!(agent.display_name(), "");

        assert!(matches!(
            server.stats(""),
            Err(AppError::PlayerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_tasks() {
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let server = ChatServer::start(
            Config::default(),
            BadWordTrie::new(),
            shutdown.clone(),
            tracker.clone(),
        );

        shutdown.cancel();
        tracker.close();
        tokio::time::timeout(Duration::from_secs(2), tracker.wait())
            .await
            .unwrap();
        assert!(server.popular(1, 1).await.is_err());
    }
}
