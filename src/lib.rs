//! Multi-room WebSocket Chat Server Library
//!
//! A WebSocket chat backend built with tokio-tungstenite. Clients log in
//! with a unique name, land in a random room, chat with everyone in that
//! room and may switch rooms at any time.
//!
//! # Features
//! - Unique user names, reserved at login
//! - Fixed set of numbered rooms created at startup
//! - Recent-message backlog replayed on join
//! - Bad word masking
//! - Trending phrases per room over a sliding time window
//! - Per-session rate limiting, heartbeats and deadlines
//!
//! # Architecture
//! - Each room is a task that owns its members and serializes every
//!   join, leave and broadcast through its mailbox
//! - Each connection has a `Session` with a read loop and a write loop
//!   plus a handler task dispatching its requests in order
//! - `ChatServer` holds the shared state and retires closed sessions
//!
//! # Example
//! ```ignore
//! use tokio::net::TcpListener;
//! use tokio_util::sync::CancellationToken;
//! use tokio_util::task::TaskTracker;
//! use room_chat::{handle_connection, BadWordTrie, ChatServer, Config};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     let server = ChatServer::start(
//!         Config::default(),
//!         BadWordTrie::new(),
//!         CancellationToken::new(),
//!         TaskTracker::new(),
//!     );
//!
//!     while let Ok((stream, _)) = listener.accept().await {
//!         tokio::spawn(handle_connection(stream, server.clone()));
//!     }
//! }
//! ```

pub mod atomic;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod hotword;
pub mod message;
pub mod registry;
pub mod room;
pub mod server;
pub mod session;
pub mod trie;
pub mod types;

// Re-export main types for convenience
pub use client::ClientAgent;
pub use config::{Config, RunMode, SessionConfig};
pub use error::{AppError, ErrorCode, HandlerError};
pub use handler::handle_connection;
pub use hotword::HotWords;
pub use message::{MessageType, Request, Response};
pub use room::{Room, RoomHandle};
pub use server::{ChatServer, SessionStats};
pub use session::Session;
pub use trie::{BadWordTrie, NameTrie};
pub use types::{RoomId, RoomState, SessionId};
