//! Runtime configuration
//!
//! Command line options for the server process plus the per-connection
//! transport parameters handed to every session.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Inbound mailbox capacity per session
pub const INBOUND_CAPACITY: usize = 30;

/// Outbound mailbox capacity per session
pub const OUTBOUND_CAPACITY: usize = 256;

/// Largest accepted inbound message in bytes
pub const MAX_MESSAGE_SIZE: usize = 512;

/// Process mode. Rate limiting is disabled in debug mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RunMode {
    Debug,
    Release,
}

/// Server configuration
#[derive(Debug, Clone, Parser)]
#[command(name = "room_chat", about = "Multi-room WebSocket chat server")]
pub struct Config {
    /// Address to listen on
    #[arg(long, default_value = DEFAULT_ADDR)]
    pub addr: String,

    /// Number of chat rooms created at startup
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u32).range(1..))]
    pub rooms: u32,

    /// Recent messages replayed to clients joining a room
    #[arg(long, default_value_t = 20)]
    pub backlog: usize,

    /// Runtime mode
    #[arg(long, value_enum, default_value_t = RunMode::Release)]
    pub mode: RunMode,

    /// Bad word list, one word per line
    #[arg(long)]
    pub badwords: Option<PathBuf>,

    /// How long a chat line counts towards trending phrases
    #[arg(long, default_value_t = 600)]
    pub hot_retention_secs: u64,

    /// Listener bind attempts before giving up
    #[arg(long, default_value_t = 5)]
    pub bind_retries: u32,

    /// Pause between bind attempts
    #[arg(long, default_value_t = 3)]
    pub bind_backoff_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            rooms: 4,
            backlog: 20,
            mode: RunMode::Release,
            badwords: None,
            hot_retention_secs: 600,
            bind_retries: 5,
            bind_backoff_secs: 3,
        }
    }
}

impl Config {
    pub fn is_debug(&self) -> bool {
        self.mode == RunMode::Debug
    }

    pub fn hot_retention(&self) -> Duration {
        Duration::from_secs(self.hot_retention_secs)
    }

    pub fn bind_backoff(&self) -> Duration {
        Duration::from_secs(self.bind_backoff_secs)
    }

    /// Transport parameters for a freshly upgraded connection
    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::default();
        if self.is_debug() {
            config.rate_limit = None;
        }
        config
    }
}

/// Inbound frame-rate limit over a rolling window
#[derive(Debug, Clone)]
pub struct RateLimit {
    /// Frames allowed per interval
    pub limit: u32,
    pub interval: Duration,
    /// Frame sent before the session is closed for exceeding the limit
    pub close_frame: Message,
}

impl RateLimit {
    pub fn new(limit: u32, interval: Duration) -> Self {
        Self {
            limit,
            interval,
            close_frame: Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "messages are sent too frequently".into(),
            })),
        }
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::new(36, Duration::from_secs(3))
    }
}

/// Per-session transport parameters
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub ping_period: Duration,
    /// Extra attempts for a write that failed with a transient error
    pub max_send_retries: u32,
    /// Close the session instead of waiting when the outbound mailbox is full
    pub drop_on_full: bool,
    /// Delay between a direct close frame and the actual close
    pub close_grace: Duration,
    pub rate_limit: Option<RateLimit>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let read_timeout = Duration::from_secs(30);
        Self {
            inbound_capacity: INBOUND_CAPACITY,
            outbound_capacity: OUTBOUND_CAPACITY,
            read_timeout,
            write_timeout: Duration::from_secs(30),
            ping_period: read_timeout * 9 / 10,
            max_send_retries: 3,
            drop_on_full: true,
            close_grace: Duration::from_secs(1),
            rate_limit: Some(RateLimit::default()),
        }
    }
}
