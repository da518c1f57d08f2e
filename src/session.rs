//! Session transport
//!
//! Owns one upgraded WebSocket connection and runs its two loops:
//! - the read loop applies the read deadline and the inbound rate limit,
//!   then pushes frames onto the bounded inbound mailbox
//! - the write loop drains the outbound mailbox, sends keep-alive pings
//!   and runs the teardown once the close signal fires
//!
//! The close signal is a `CancellationToken` derived from the process
//! shutdown token, so closing is idempotent and process shutdown closes
//! every session.

use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Local};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::WriteError;
use crate::types::SessionId;

type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
type WsSource = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// Inbound filter. Returning true consumes the packet instead of queueing it.
pub type PacketFilter = Box<dyn Fn(&Packet) -> bool + Send + Sync>;

/// One frame read from the connection
#[derive(Debug, Clone)]
pub struct Packet {
    pub message: Message,
    pub received_at: Instant,
}

/// Process-wide collaborators every session is wired to
#[derive(Clone)]
pub struct SessionLinks {
    /// Receives the session id once the session has torn down
    pub offline_tx: mpsc::Sender<SessionId>,
    /// Process shutdown; parent of every session's close signal
    pub shutdown: CancellationToken,
    /// Task group shutdown waits on
    pub tracker: TaskTracker,
}

/// One physical connection and its outbound side
pub struct Session {
    id: SessionId,
    peer: String,
    config: SessionConfig,
    outbound: mpsc::Sender<Message>,
    writer: Mutex<WsSink>,
    closed: CancellationToken,
    tracker: TaskTracker,
    online_at: DateTime<Local>,
    offline_at: OnceLock<DateTime<Local>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Take ownership of an upgraded connection and start both loops.
    ///
    /// Returns the session handle and the inbound mailbox.
    pub fn open<S>(
        ws: WebSocketStream<S>,
        peer: String,
        config: SessionConfig,
        links: &SessionLinks,
        filter: Option<PacketFilter>,
    ) -> (Arc<Session>, mpsc::Receiver<Packet>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = ws.split();
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity);

        let session = Arc::new(Session {
            id: SessionId::next(),
            peer,
            config,
            outbound: outbound_tx,
            writer: Mutex::new(Box::pin(sink)),
            closed: links.shutdown.child_token(),
            tracker: links.tracker.clone(),
            online_at: Local::now(),
            offline_at: OnceLock::new(),
        });

        debug!("Session {} opened for {}", session.id, session.peer);

        links
            .tracker
            .spawn(Arc::clone(&session).read_loop(Box::pin(source), inbound_tx, filter));
        links
            .tracker
            .spawn(Arc::clone(&session).write_loop(outbound_rx, links.offline_tx.clone()));

        (session, inbound_rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Remote address of the connection
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn online_at(&self) -> DateTime<Local> {
        self.online_at
    }

    /// Set once, when the teardown runs
    pub fn offline_at(&self) -> Option<DateTime<Local>> {
        self.offline_at.get().copied()
    }

    /// Time since the connection was upgraded
    pub fn online_duration(&self) -> Duration {
        let end = self.offline_at().unwrap_or_else(Local::now);
        (end - self.online_at).to_std().unwrap_or_default()
    }

    /// Trigger the close signal. Safe to call any number of times.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session is closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Queue a frame on the outbound mailbox.
    ///
    /// In drop mode a full mailbox closes the session; otherwise this
    /// waits for room or for the session to close.
    pub async fn enqueue_send(&self, message: Message) -> bool {
        if self.is_closed() {
            return false;
        }

        if self.config.drop_on_full {
            match self.outbound.try_send(message) {
                Ok(()) => {
                    self.warn_backlog();
                    true
                }
                Err(TrySendError::Full(_)) => {
                    error!(
                        "Session {} sender overflow, closing (remote {})",
                        self.id, self.peer
                    );
                    self.close();
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        } else {
            tokio::select! {
                _ = self.closed.cancelled() => false,
                sent = self.outbound.send(message) => {
                    if sent.is_ok() {
                        self.warn_backlog();
                    }
                    sent.is_ok()
                }
            }
        }
    }

    /// Write a frame immediately, bypassing the outbound mailbox.
    ///
    /// A write that still fails after the retry budget closes the session.
    pub async fn send_direct(&self, message: Message) -> bool {
        if self.is_closed() {
            return false;
        }

        match self.perform_send(message).await {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    "Error writing to session {} (remote {}): {}",
                    self.id, self.peer, e
                );
                self.close();
                false
            }
        }
    }

    /// Write a control frame now and close the session shortly after
    pub fn send_direct_and_close(self: &Arc<Self>, message: Message) {
        let session = Arc::clone(self);
        self.tracker.spawn(async move {
            if session.send_direct(message).await {
                tokio::time::sleep(session.config.close_grace).await;
            }
            session.close();
        });
    }

    fn warn_backlog(&self) {
        let capacity = self.outbound.max_capacity();
        let waiting = capacity - self.outbound.capacity();
        if waiting > capacity / 2 && waiting % 20 == 0 {
            warn!(
                "Session {} send queue {}/{} (remote {})",
                self.id, waiting, capacity, self.peer
            );
        }
    }

    /// One physical write under the write deadline.
    ///
    /// The frame is fed once; only the flush is retried, so a retry never
    /// duplicates a frame on the wire.
    async fn perform_send(&self, message: Message) -> Result<(), WriteError> {
        let deadline = self.config.write_timeout;
        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(WriteError::Closed);
        }

        timeout(deadline, writer.feed(message))
            .await
            .map_err(|_| WriteError::Timeout(deadline))??;

        let mut retries = 0;
        loop {
            let flushed = match timeout(deadline, writer.flush()).await {
                Ok(result) => result.map_err(WriteError::from),
                Err(_) => Err(WriteError::Timeout(deadline)),
            };

            match flushed {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && retries < self.config.max_send_retries => {
                    retries += 1;
                    warn!(
                        "Session {} write failed ({}), retry {}/{}",
                        self.id, e, retries, self.config.max_send_retries
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        mut source: WsSource,
        inbound: mpsc::Sender<Packet>,
        filter: Option<PacketFilter>,
    ) {
        let mut rpm_start = Instant::now();
        let mut rpm_count: u32 = 0;

        loop {
            let next = tokio::select! {
                _ = self.closed.cancelled() => break,
                next = timeout(self.config.read_timeout, source.next()) => next,
            };

            let message = match next {
                Err(_) => {
                    debug!("Session {} read deadline exceeded", self.id);
                    break;
                }
                Ok(None) => {
                    debug!("Session {} stream ended", self.id);
                    break;
                }
                Ok(Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed))) => break,
                Ok(Some(Err(e))) => {
                    warn!("Session {} read error: {}", self.id, e);
                    break;
                }
                Ok(Some(Ok(message))) => message,
            };

            let message = match message {
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(frame) => {
                    debug!("Session {} sent close frame: {:?}", self.id, frame);
                    break;
                }
                Message::Text(text) => Message::Text(normalize(&text)),
                other => other,
            };

            if let Some(rate) = &self.config.rate_limit {
                rpm_count += 1;
                if rpm_count > rate.limit {
                    let now = Instant::now();
                    if now.duration_since(rpm_start) < rate.interval {
                        error!(
                            "Session {} rate too high, {}/{:?} (remote {})",
                            self.id, rpm_count, rate.interval, self.peer
                        );
                        self.send_direct(rate.close_frame.clone()).await;
                        break;
                    }
                    rpm_count = 0;
                    rpm_start = now;
                }
            }

            let packet = Packet {
                message,
                received_at: Instant::now(),
            };

            if filter.as_ref().is_some_and(|consume| consume(&packet)) {
                continue;
            }

            tokio::select! {
                _ = self.closed.cancelled() => break,
                sent = inbound.send(packet) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }

        self.close();
        debug!("Read loop ended for session {}", self.id);
    }

    async fn write_loop(
        self: Arc<Self>,
        mut outbound: mpsc::Receiver<Message>,
        offline_tx: mpsc::Sender<SessionId>,
    ) {
        let period = self.config.ping_period;
        let mut ping = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = self.closed.cancelled() => break,
                _ = ping.tick() => {
                    self.send_direct(Message::Ping(Vec::new())).await;
                }
                Some(message) = outbound.recv() => {
                    self.send_direct(message).await;
                }
            }
        }

        self.teardown(offline_tx).await;
    }

    async fn teardown(&self, offline_tx: mpsc::Sender<SessionId>) {
        let _ = self.offline_at.set(Local::now());

        if offline_tx.send(self.id).await.is_err() {
            debug!("Offline mailbox gone, session {} not reported", self.id);
        }

        let mut writer = self.writer.lock().await;
        let _ = timeout(self.config.write_timeout, writer.close()).await;

        info!(
            "Session {} closed (remote {}, online {:?})",
            self.id,
            self.peer,
            self.online_duration()
        );
    }
}

/// Collapse newlines into spaces and trim
fn normalize(text: &str) -> String {
    text.replace('\n', " ").trim().to_string()
}


#[cfg(test)]
mod tests {
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::task::{Context, Poll};

    use tokio::io::{DuplexStream, ReadBuf};
    use tokio_tungstenite::tungstenite::protocol::Role;

    use super::testing::*;
    use super::*;
    use crate::config::RateLimit;

    fn quiet_config() -> SessionConfig {
        SessionConfig {
            rate_limit: None,
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_inbound_frames_are_queued_normalized() {
        let test = TestLinks::new();
        let (_session, mut inbound, mut client) = open_session(quiet_config(), &test.links).await;

        client
            .send(Message::Text("  hello\nworld  ".to_string()))
            .await
            .unwrap();

        let packet = timeout(Duration::from_secs(2), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.message, Message::Text("hello world".to_string()));
    }

    #[tokio::test]
    async fn test_outbound_frames_keep_order() {
        let test = TestLinks::new();
        let (session, _inbound, mut client) = open_session(quiet_config(), &test.links).await;

        for i in 0..3 {
            assert!(session.enqueue_send(Message::Text(format!("m{i}"))).await);
        }

        for i in 0..3 {
            assert_eq!(next_text(&mut client).await, Some(format!("m{i}")));
        }
    }

    #[tokio::test]
    async fn test_filter_consumes_packets() {
        let test = TestLinks::new();
        let (server, mut client) = ws_pair(4096).await;
        let filter: PacketFilter =
            Box::new(|packet| matches!(&packet.message, Message::Text(t) if t == "drop"));
        let (_session, mut inbound) = Session::open(
            server,
            "test".to_string(),
            quiet_config(),
            &test.links,
            Some(filter),
        );

        client.send(Message::Text("drop".to_string())).await.unwrap();
        client.send(Message::Text("keep".to_string())).await.unwrap();

        let packet = timeout(Duration::from_secs(2), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.message, Message::Text("keep".to_string()));
    }

    #[tokio::test]
    async fn test_full_mailbox_closes_session_in_drop_mode() {
        let test = TestLinks::new();
        let config = SessionConfig {
            outbound_capacity: 4,
            ..quiet_config()
        };
        let (server, _client) = ws_pair(64).await;
        let (session, _inbound) =
            Session::open(server, "test".to_string(), config, &test.links, None);

        // The write loop cannot run until this task yields, so the mailbox
        // fills after exactly four frames.
        for i in 0..4 {
            assert!(session.enqueue_send(Message::Text(format!("frame {i}"))).await);
        }
        assert!(!session.enqueue_send(Message::Text("overflow".to_string())).await);
        assert!(session.is_closed());
        assert!(!session.enqueue_send(Message::Text("late".to_string())).await);
    }

    #[tokio::test]
    async fn test_blocking_mode_returns_false_once_closed() {
        let test = TestLinks::new();
        let config = SessionConfig {
            drop_on_full: false,
            ..quiet_config()
        };
        let (session, _inbound, _client) = open_session(config, &test.links).await;

        assert!(session.enqueue_send(Message::Text("a".to_string())).await);
        session.close();
        assert!(!session.enqueue_send(Message::Text("b".to_string())).await);
    }

    #[tokio::test]
    async fn test_rate_limit_sends_close_frame() {
        let test = TestLinks::new();
        let config = SessionConfig {
            rate_limit: Some(RateLimit::new(3, Duration::from_secs(10))),
            ..SessionConfig::default()
        };
        let (session, _inbound, mut client) = open_session(config, &test.links).await;

        for i in 0..5 {
            let _ = client.send(Message::Text(format!("spam {i}"))).await;
        }

        let close = loop {
            match timeout(Duration::from_secs(2), client.next()).await {
                Ok(Some(Ok(Message::Close(frame)))) => break frame,
                Ok(Some(Ok(_))) => continue,
                other => panic!("expected close frame, got {:?}", other),
            }
        };
        let frame = close.expect("close frame carries a reason");
        assert_eq!(frame.code, CloseCode::Normal);
        assert_eq!(frame.reason, "messages are sent too frequently");

        timeout(Duration::from_secs(2), session.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_deadline_closes_session() {
        let test = TestLinks::new();
        let config = SessionConfig {
            read_timeout: Duration::from_millis(50),
            ..quiet_config()
        };
        let (session, _inbound, _client) = open_session(config, &test.links).await;

        timeout(Duration::from_secs(2), session.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_with_single_teardown() {
        let mut test = TestLinks::new();
        let (session, _inbound, _client) = open_session(quiet_config(), &test.links).await;

        session.close();
        session.close();

        let id = timeout(Duration::from_secs(2), test.offline_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, session.id());

        test.links.tracker.close();
        timeout(Duration::from_secs(2), test.links.tracker.wait())
            .await
            .unwrap();
        assert!(test.offline_rx.try_recv().is_err());
        assert!(session.offline_at().is_some());
    }

    #[tokio::test]
    async fn test_process_shutdown_closes_session() {
        let test = TestLinks::new();
        let (session, _inbound, _client) = open_session(quiet_config(), &test.links).await;

        test.links.shutdown.cancel();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_send_direct_and_close() {
        let test = TestLinks::new();
        let config = SessionConfig {
            close_grace: Duration::from_millis(10),
            ..quiet_config()
        };
        let (session, _inbound, mut client) = open_session(config, &test.links).await;

        session.send_direct_and_close(Message::Text("bye".to_string()));

        assert_eq!(next_text(&mut client).await.as_deref(), Some("bye"));
        timeout(Duration::from_secs(2), session.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_grace_task_is_tracked() {
        let test = TestLinks::new();
        let config = SessionConfig {
            close_grace: Duration::from_millis(50),
            ..quiet_config()
        };
        let (session, _inbound, _client) = open_session(config, &test.links).await;
        let running = test.links.tracker.len();

        session.send_direct_and_close(Message::Text("bye".to_string()));
        assert_eq!(test.links.tracker.len(), running + 1);

        test.links.tracker.close();
        timeout(Duration::from_secs(2), test.links.tracker.wait())
            .await
            .unwrap();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_write_after_close_is_rejected() {
        let test = TestLinks::new();
        let (session, _inbound, _client) = open_session(quiet_config(), &test.links).await;

        session.close();
        let err = session
            .perform_send(Message::Text("late".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::Closed));
        assert!(!session.send_direct(Message::Text("late".to_string())).await);
    }

    /// Duplex pipe whose flush fails with a timeout a set number of times
    struct FlakyFlush {
        inner: DuplexStream,
        failures: Arc<AtomicU32>,
    }

    impl AsyncRead for FlakyFlush {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for FlakyFlush {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            let left = this.failures.load(Ordering::SeqCst);
            if left > 0 {
                this.failures.store(left - 1, Ordering::SeqCst);
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::TimedOut)));
            }
            Pin::new(&mut this.inner).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
        }
    }

    async fn open_flaky(
        failures: u32,
        links: &SessionLinks,
    ) -> (
        Arc<Session>,
        mpsc::Receiver<Packet>,
        WebSocketStream<DuplexStream>,
        Arc<AtomicU32>,
    ) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let failures = Arc::new(AtomicU32::new(failures));
        let flaky = FlakyFlush {
            inner: server_io,
            failures: Arc::clone(&failures),
        };
        let server = WebSocketStream::from_raw_socket(flaky, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let config = SessionConfig {
            max_send_retries: 3,
            ..quiet_config()
        };
        let (session, inbound) = Session::open(server, "test".to_string(), config, links, None);
        (session, inbound, client, failures)
    }

    #[tokio::test]
    async fn test_transient_flush_errors_are_retried() {
        let test = TestLinks::new();
        let (session, _inbound, mut client, failures) = open_flaky(3, &test.links).await;

        assert!(session.send_direct(Message::Text("once".to_string())).await);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
        assert!(!session.is_closed());

        // Retrying the flush must not write the frame twice
        assert!(session.send_direct(Message::Text("twice".to_string())).await);
        assert_eq!(next_text(&mut client).await.as_deref(), Some("once"));
        assert_eq!(next_text(&mut client).await.as_deref(), Some("twice"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_close_session() {
        let test = TestLinks::new();
        let (session, _inbound, _client, _failures) = open_flaky(4, &test.links).await;

        assert!(!session.send_direct(Message::Text("lost".to_string())).await);
        assert!(session.is_closed());
    }
}
