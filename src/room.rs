//! Room hub
//!
//! Each chat room is an actor: one task owns the member set, the recent
//! message buffer and the trending-phrase index, and processes commands
//! from its mailbox one at a time. Nothing else touches that state, so
//! no locks are needed and every register, unregister and broadcast in a
//! room is totally ordered.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Local;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::client::ClientAgent;
use crate::error::AppError;
use crate::hotword::HotWords;
use crate::types::{RoomId, RoomState, SessionId};

/// Mailbox capacity of a room
pub const ROOM_MAILBOX_SIZE: usize = 1024;

/// Hot-word sweep period, aligned to wall-clock minutes
const SWEEP_INTERVAL_SECS: i64 = 60;

/// A chat line ready for fan-out
#[derive(Debug, Clone)]
pub struct ChatLine {
    /// Text fed to the trending index
    pub text: String,
    /// Encoded broadcast envelope
    pub frame: Message,
}

/// Commands processed by a room loop
#[derive(Debug)]
pub enum RoomCommand {
    /// Add a member. `greeting` and then the recent messages are queued to
    /// the member before it starts receiving broadcasts.
    Register {
        agent: Arc<ClientAgent>,
        greeting: Option<Message>,
    },
    /// Remove a member (no-op if absent)
    Unregister { id: SessionId },
    /// Record and fan out a chat line
    Broadcast(ChatLine),
    /// Trending phrases, most frequent first
    TopK {
        k: usize,
        reply: oneshot::Sender<Vec<String>>,
    },
    /// Current membership and buffer state
    Snapshot { reply: oneshot::Sender<RoomSnapshot> },
}

/// Point-in-time view of a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub id: RoomId,
    /// Member session ids, ascending
    pub members: Vec<SessionId>,
    pub recent: usize,
}

/// Ring buffer of the last broadcast frames
#[derive(Debug)]
pub struct RecentMessages {
    capacity: usize,
    frames: VecDeque<Message>,
}

impl RecentMessages {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            frames: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a frame, evicting the oldest one when full
    pub fn push(&mut self, frame: Message) {
        if self.capacity == 0 {
            return;
        }
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Oldest first
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.frames.iter()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// State owned by one room loop
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    members: HashMap<SessionId, Weak<ClientAgent>>,
    recent: RecentMessages,
    hot: HotWords,
    retention: Duration,
}

impl Room {
    pub fn new(id: RoomId, backlog: usize, retention: Duration) -> Self {
        Self {
            id,
            members: HashMap::new(),
            recent: RecentMessages::new(backlog),
            hot: HotWords::new(),
            retention,
        }
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    /// Run the room loop until shutdown or until every handle is dropped.
    ///
    /// Commands still queued at shutdown are dropped.
    pub async fn run(mut self, mut mailbox: mpsc::Receiver<RoomCommand>, shutdown: CancellationToken) {
        info!("Room {} started", self.id);

        let now = Local::now().timestamp();
        let first = SWEEP_INTERVAL_SECS - now.rem_euclid(SWEEP_INTERVAL_SECS);
        let mut sweep = interval_at(
            Instant::now() + Duration::from_secs(first as u64),
            Duration::from_secs(SWEEP_INTERVAL_SECS as u64),
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sweep.tick() => self.sweep(Local::now().timestamp()),
                cmd = mailbox.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
            }
        }

        info!("Room {} stopped", self.id);
    }

    /// Process a single command
    pub async fn handle_command(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Register { agent, greeting } => {
                self.handle_register(agent, greeting).await;
            }
            RoomCommand::Unregister { id } => {
                self.handle_unregister(id);
            }
            RoomCommand::Broadcast(line) => {
                self.handle_broadcast(line).await;
            }
            RoomCommand::TopK { k, reply } => {
                let _ = reply.send(self.hot.top_k(k));
            }
            RoomCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn handle_register(&mut self, agent: Arc<ClientAgent>, greeting: Option<Message>) {
        if let Some(greeting) = greeting {
            agent.send(greeting).await;
            for frame in self.recent.iter() {
                agent.send(frame.clone()).await;
            }
        }

        self.members.insert(agent.id(), Arc::downgrade(&agent));
        debug!(
            "Client {} joined room {} ({} members)",
            agent.id(),
            self.id,
            self.members.len()
        );
    }

    fn handle_unregister(&mut self, id: SessionId) {
        if self.members.remove(&id).is_some() {
            debug!(
                "Client {} left room {} ({} members)",
                id,
                self.id,
                self.members.len()
            );
        }
    }

    async fn handle_broadcast(&mut self, line: ChatLine) {
        self.recent.push(line.frame.clone());
        if !line.text.is_empty() {
            self.hot.insert(&line.text, Local::now().timestamp());
        }

        let mut gone = Vec::new();
        for (id, member) in &self.members {
            let Some(agent) = member.upgrade() else {
                gone.push(*id);
                continue;
            };
            if agent.room_state() == RoomState::InRoom(self.id) {
                agent.send(line.frame.clone()).await;
            }
        }

        for id in gone {
            self.members.remove(&id);
        }
    }

    /// Expire hot-word records older than the retention window
    pub fn sweep(&mut self, now: i64) {
        let cutoff = now - self.retention.as_secs() as i64;
        self.hot.evict_older_than(cutoff);
        debug!("Room {} swept hot words older than {}", self.id, cutoff);
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        let mut members: Vec<SessionId> = self.members.keys().copied().collect();
        members.sort();
        RoomSnapshot {
            id: self.id,
            members,
            recent: self.recent.len(),
        }
    }
}

/// Cloneable sender side of a room's mailbox
#[derive(Debug, Clone)]
pub struct RoomHandle {
    id: RoomId,
    mailbox: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    /// Start the room loop on the tracker
    pub fn spawn(room: Room, shutdown: CancellationToken, tracker: &TaskTracker) -> Self {
        let (tx, rx) = mpsc::channel(ROOM_MAILBOX_SIZE);
        let id = room.id();
        tracker.spawn(room.run(rx, shutdown));
        Self { id, mailbox: tx }
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    async fn send(&self, cmd: RoomCommand) -> Result<(), AppError> {
        self.mailbox.send(cmd).await.map_err(|_| AppError::ChannelSend)
    }

    pub async fn register(
        &self,
        agent: Arc<ClientAgent>,
        greeting: Option<Message>,
    ) -> Result<(), AppError> {
        self.send(RoomCommand::Register { agent, greeting }).await
    }

    pub async fn unregister(&self, agent: &ClientAgent) -> Result<(), AppError> {
        self.send(RoomCommand::Unregister { id: agent.id() }).await
    }

    pub async fn broadcast(&self, line: ChatLine) -> Result<(), AppError> {
        self.send(RoomCommand::Broadcast(line)).await
    }

    pub async fn top_k(&self, k: usize) -> Result<Vec<String>, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::TopK { k, reply }).await?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }

    pub async fn snapshot(&self) -> Result<RoomSnapshot, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }
}
