//! WebSocket connection handler
//!
//! Handles individual client connections: WebSocket handshake, request
//! decoding and dispatch. Business failures become an error ack sent
//! back to the client; only an unparsable payload or a non-text frame
//! closes the connection.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HandshakeRequest, Response as HandshakeResponse,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::client::ClientAgent;
use crate::config::MAX_MESSAGE_SIZE;
use crate::error::{AppError, HandlerError};
use crate::message::{
    ChatData, ChatNotify, LoginData, MessageType, Notify, Request, Response, RoomJoined,
    SwitchData,
};
use crate::room::ChatLine;
use crate::server::{ChatServer, TIME_FORMAT};
use crate::session::Packet;
use crate::types::RoomState;

/// Path clients upgrade on
pub const CHAT_PATH: &str = "/chat";

/// Handle a new TCP connection
///
/// Performs the WebSocket handshake and serves the client until its
/// session closes. The handshake gets the same deadline as a read.
pub async fn handle_connection(stream: TcpStream, server: Arc<ChatServer>) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    let deadline = server.config().session_config().read_timeout;
    let Some(ws_stream) = upgrade(stream, &server, deadline).await? else {
        debug!("Shutdown before handshake with {} completed", peer_addr);
        return Ok(());
    };

    serve_socket(server, ws_stream, peer_addr).await;
    Ok(())
}

/// Run the upgrade handshake under `deadline`
///
/// Returns `None` if the server shuts down first.
async fn upgrade<S>(
    stream: S,
    server: &ChatServer,
    deadline: Duration,
) -> Result<Option<WebSocketStream<S>>, AppError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_MESSAGE_SIZE);

    let handshake =
        tokio_tungstenite::accept_hdr_async_with_config(stream, route_upgrade, Some(config));

    tokio::select! {
        _ = server.shutdown_token().cancelled() => Ok(None),
        result = timeout(deadline, handshake) => match result {
            Ok(ws_stream) => Ok(Some(ws_stream?)),
            Err(_) => Err(AppError::HandshakeTimeout(deadline)),
        },
    }
}

/// Only the chat path may be upgraded
fn route_upgrade(
    request: &HandshakeRequest,
    response: HandshakeResponse,
) -> Result<HandshakeResponse, ErrorResponse> {
    if request.uri().path() == CHAT_PATH {
        return Ok(response);
    }

    let mut rejection = ErrorResponse::new(Some("not found".to_string()));
    *rejection.status_mut() = StatusCode::NOT_FOUND;
    Err(rejection)
}

/// Serve an already upgraded connection until its session closes
pub async fn serve_socket<S>(server: Arc<ChatServer>, ws: WebSocketStream<S>, peer: String)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (agent, inbound) = server.attach(ws, peer);
    info!(
        "Client {} connected from {}",
        agent.id(),
        agent.session.peer()
    );

    serve_client(&server, &agent, inbound).await;
    debug!("Dispatch loop ended for {}", agent.id());
}

/// Dispatch inbound packets one at a time
async fn serve_client(
    server: &ChatServer,
    agent: &Arc<ClientAgent>,
    mut inbound: mpsc::Receiver<Packet>,
) {
    loop {
        tokio::select! {
            _ = agent.session.closed() => break,
            packet = inbound.recv() => match packet {
                Some(packet) => handle_packet(server, agent, packet).await,
                None => break,
            },
        }
    }
}

async fn handle_packet(server: &ChatServer, agent: &Arc<ClientAgent>, packet: Packet) {
    if agent.session.is_closed() {
        return;
    }

    match packet.message {
        Message::Text(text) => process_text(server, agent, &text).await,
        other => {
            warn!(
                "Unsupported frame from client {}: {:?}",
                agent.id(),
                other
            );
            agent
                .session
                .send_direct_and_close(close_frame(CloseCode::Unsupported, ""));
        }
    }
}

/// Decode one text frame, run it and answer failures with an error ack
pub async fn process_text(server: &ChatServer, agent: &Arc<ClientAgent>, text: &str) {
    let request = match Request::parse(text) {
        Ok(request) => request,
        Err(e) => {
            warn!("Invalid payload from client {}: {}", agent.id(), e);
            agent
                .session
                .send_direct_and_close(close_frame(CloseCode::Invalid, "parse payload err"));
            return;
        }
    };

    debug!("Request from {}: {}", agent.id(), text);

    let ack = request.kind.saturating_add(1);
    if let Err(e) = catch_panics(dispatch(server, agent, &request)).await {
        debug!("Request {} from {} failed: {}", request.kind, agent.id(), e);
        match Response::error(ack, &e).to_message() {
            Ok(msg) => {
                agent.send(msg).await;
            }
            Err(e) => error!("Failed to serialize error ack: {}", e),
        }
    }
}

/// Run a handler future, turning a panic into an internal error
pub(crate) async fn catch_panics<F>(fut: F) -> Result<(), HandlerError>
where
    F: Future<Output = Result<(), HandlerError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("Handler panicked: {}", reason);
            Err(HandlerError::Internal(reason))
        }
    }
}

async fn dispatch(
    server: &ChatServer,
    agent: &Arc<ClientAgent>,
    request: &Request,
) -> Result<(), HandlerError> {
    match MessageType::from_code(request.kind) {
        Some(MessageType::LoginReq) => handle_login(server, agent, request).await,
        Some(MessageType::RoomSwitchReq) => handle_switch_room(server, agent, request).await,
        Some(MessageType::RoomChatReq) => handle_chat(server, agent, request).await,
        _ => Err(HandlerError::UnsupportedType(request.kind)),
    }
}

/// Handle login: claim a room, reserve the name, then join it
async fn handle_login(
    server: &ChatServer,
    agent: &Arc<ClientAgent>,
    request: &Request,
) -> Result<(), HandlerError> {
    match agent.room_state() {
        RoomState::Offline => return Err(HandlerError::LoggedOut),
        RoomState::InRoom(_) => return Err(HandlerError::AlreadyInRoom),
        RoomState::Lobby => {}
    }

    let LoginData { user_name } = request.payload()?;
    if user_name.is_empty() {
        return Err(HandlerError::NameRequired);
    }

    // Names are only reserved by a client that was still in the lobby
    let room = server.random_room();
    let joined = RoomState::InRoom(room.id());
    agent
        .state
        .compare_exchange(RoomState::Lobby, joined)
        .map_err(|_| HandlerError::LoggedOut)?;

    if !server.names().reserve(&user_name) {
        let _ = agent.state.compare_exchange(joined, RoomState::Lobby);
        return Err(HandlerError::NameRepeated);
    }
    agent.set_username(user_name.clone());

    info!(
        "Client {} logged in as '{}', room {}",
        agent.id(),
        user_name,
        room.id()
    );

    let ack = joined_ack(MessageType::LoginAck, agent, room.id())?;
    room.register(Arc::clone(agent), Some(ack))
        .await
        .map_err(|_| HandlerError::RoomClosed(room.id()))
}

/// Handle room switch: leave the current room and join the requested one
async fn handle_switch_room(
    server: &ChatServer,
    agent: &Arc<ClientAgent>,
    request: &Request,
) -> Result<(), HandlerError> {
    let current = agent.room_state();
    let old = current
        .room()
        .and_then(|id| server.room(id.get()))
        .ok_or(HandlerError::NotLoggedIn)?;

    let SwitchData { room } = request.payload()?;
    let new = server.room(room).ok_or(HandlerError::RoomNotFound)?;
    if new.id() == old.id() {
        return Ok(());
    }

    agent
        .state
        .compare_exchange(current, RoomState::InRoom(new.id()))
        .map_err(|_| HandlerError::LoggedOut)?;
    old.unregister(agent)
        .await
        .map_err(|_| HandlerError::RoomClosed(old.id()))?;

    info!(
        "Client {} switched from room {} to room {}",
        agent.id(),
        old.id(),
        new.id()
    );

    let ack = joined_ack(MessageType::RoomSwitchAck, agent, new.id())?;
    new.register(Arc::clone(agent), Some(ack))
        .await
        .map_err(|_| HandlerError::RoomClosed(new.id()))
}

/// Handle chat: mask, stamp and hand the line to the room for fan-out
async fn handle_chat(
    server: &ChatServer,
    agent: &Arc<ClientAgent>,
    request: &Request,
) -> Result<(), HandlerError> {
    let room = agent
        .room_state()
        .room()
        .and_then(|id| server.room(id.get()))
        .ok_or(HandlerError::NotInRoom)?;

    let ChatData { message } = request.payload()?;
    let message = server.badwords().replace(&message);

    let notify = Notify::chat(ChatNotify {
        message: message.clone(),
        user_name: agent.display_name().to_string(),
        send_time: Local::now().format(TIME_FORMAT).to_string(),
    });
    let frame = notify
        .to_message()
        .map_err(|e| HandlerError::Internal(e.to_string()))?;

    room.broadcast(ChatLine {
        text: message,
        frame,
    })
    .await
    .map_err(|_| HandlerError::RoomClosed(room.id()))
}

fn joined_ack(
    kind: MessageType,
    agent: &ClientAgent,
    room_id: crate::types::RoomId,
) -> Result<Message, HandlerError> {
    let data = RoomJoined {
        room_id,
        user_name: agent.display_name().to_string(),
    };
    Response::ok(kind.code(), &data)
        .and_then(|resp| resp.to_message())
        .map_err(|e| HandlerError::Internal(e.to_string()))
}

fn close_frame(code: CloseCode, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}
