//! Client side of a relay connection.
//!
//! A [`Session`] owns one TCP connection split into halves. The foreground
//! uses the write half for [`Session::identify`] and
//! [`Session::send_message`]; the read half moves into a single background
//! task started by [`Session::spawn_receiver`], which reports incoming
//! messages over a channel.
//!
//! ```text
//! user input ──► Session (write half) ──frames──► Relay
//! display ◄── SessionEvent channel ◄── receiver task (read half) ◄──frames── Relay
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;

use crate::relay::framing::{self, FrameError};

/// Client session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The relay could not be reached.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Address that was dialed.
        addr: String,
        /// Underlying transport error.
        #[source]
        source: io::Error,
    },

    /// The relay closed the connection before the handshake (no free slot).
    #[error("relay has no free slot")]
    SlotsExhausted,

    /// A message was sent before [`Session::identify`] succeeded.
    #[error("session is not identified")]
    NotIdentified,

    /// [`Session::identify`] was called a second time.
    #[error("session is already identified as {0}")]
    AlreadyIdentified(String),

    /// Display names must not be empty.
    #[error("display name is empty")]
    EmptyName,

    /// The session went offline.
    #[error("session is offline")]
    Offline,

    /// [`Session::spawn_receiver`] was already called.
    #[error("receiver already running")]
    ReceiverRunning,

    /// Frame encoding failed.
    #[error(transparent)]
    Frame(FrameError),

    /// Transport error on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<FrameError> for SessionError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => Self::Io(e),
            other => Self::Frame(other),
        }
    }
}

/// Event delivered by the session's receiver task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A message relayed from another user.
    Message {
        /// Sender's display name.
        name: String,
        /// Message text.
        body: String,
    },
    /// The connection ended. Sent exactly once, last.
    Closed,
}

/// One client connection to a relay.
#[derive(Debug)]
pub struct Session {
    /// Relay address.
    peer: SocketAddr,
    /// Write half, used by the foreground.
    writer: OwnedWriteHalf,
    /// Read half until the receiver task takes it.
    reader: Option<OwnedReadHalf>,
    /// Display name once identified.
    name: Option<String>,
    /// Cleared by `go_offline`, by a refused write, or when the receiver
    /// sees the connection end.
    online: Arc<AtomicBool>,
    /// Set once `go_offline` was called.
    left: bool,
    /// Receiver task handle (for cleanup).
    receiver: Option<JoinHandle<()>>,
}

impl Session {
    /// Connect to a relay at `address` (`host:port`).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Connect`] if the TCP connection fails.
    pub async fn connect(address: &str) -> Result<Self, SessionError> {
        let connect_err = |source| SessionError::Connect {
            addr: address.to_string(),
            source,
        };
        let stream = TcpStream::connect(address).await.map_err(connect_err)?;
        let peer = stream.peer_addr().map_err(connect_err)?;
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[Session] set_nodelay failed: {e}");
        }
        log::info!("[Session] Connected to {peer}");
        Ok(Self::from_stream(stream, peer))
    }

    fn from_stream(stream: TcpStream, peer: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            peer,
            writer,
            reader: Some(reader),
            name: None,
            online: Arc::new(AtomicBool::new(true)),
            left: false,
            receiver: None,
        }
    }

    /// Relay address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Display name, once identified.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// True until the session goes offline.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Send the identity frame.
    ///
    /// The relay does not acknowledge. A relay without a free slot closes
    /// the connection right after accepting it. If the receiver already saw
    /// that close, or the write is refused, this returns
    /// [`SessionError::SlotsExhausted`]. Otherwise the rejection shows up as
    /// [`SessionEvent::Closed`] on the receiver and as
    /// [`SessionError::Offline`] from the next [`Session::send_message`].
    pub async fn identify(&mut self, display_name: &str) -> Result<(), SessionError> {
        if let Some(name) = &self.name {
            return Err(SessionError::AlreadyIdentified(name.clone()));
        }
        if display_name.is_empty() {
            return Err(SessionError::EmptyName);
        }
        if self.left {
            return Err(SessionError::Offline);
        }
        if !self.is_online() {
            // The only close the relay performs before a handshake.
            return Err(SessionError::SlotsExhausted);
        }

        match framing::write_frame(&mut self.writer, display_name.as_bytes()).await {
            Ok(()) => {}
            Err(FrameError::Io(e)) if is_refusal(&e) => {
                log::warn!("[Session] Relay at {} refused the connection", self.peer);
                self.online.store(false, Ordering::SeqCst);
                return Err(SessionError::SlotsExhausted);
            }
            Err(e) => return Err(e.into()),
        }

        log::info!("[Session] Identified as {display_name}");
        self.name = Some(display_name.to_string());
        Ok(())
    }

    /// Send one message body.
    ///
    /// A write refused because the relay hung up marks the session offline
    /// and returns [`SessionError::Offline`].
    pub async fn send_message(&mut self, body: &str) -> Result<(), SessionError> {
        if self.name.is_none() {
            return Err(SessionError::NotIdentified);
        }
        if !self.is_online() {
            return Err(SessionError::Offline);
        }
        match framing::write_frame(&mut self.writer, body.as_bytes()).await {
            Ok(()) => Ok(()),
            Err(FrameError::Io(e)) if is_refusal(&e) => {
                log::info!("[Session] Relay at {} closed the connection", self.peer);
                self.online.store(false, Ordering::SeqCst);
                Err(SessionError::Offline)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Start the background receiver.
    ///
    /// Returns a channel of [`SessionEvent`]s; the last one is always
    /// [`SessionEvent::Closed`]. The session is marked offline when the
    /// connection ends.
    pub fn spawn_receiver(&mut self) -> Result<UnboundedReceiver<SessionEvent>, SessionError> {
        let reader = self.reader.take().ok_or(SessionError::ReceiverRunning)?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let online = Arc::clone(&self.online);
        let closed_tx = event_tx.clone();

        self.receiver = Some(tokio::spawn(async move {
            receive_loop(
                reader,
                |name, body| {
                    let _ = event_tx.send(SessionEvent::Message { name, body });
                },
                || {
                    online.store(false, Ordering::SeqCst);
                    let _ = closed_tx.send(SessionEvent::Closed);
                },
            )
            .await;
        }));

        Ok(event_rx)
    }

    /// Leave the chat: close the write side and mark the session offline.
    ///
    /// The relay sees end-of-stream and announces the departure. A running
    /// receiver delivers [`SessionEvent::Closed`] once the relay hangs up.
    pub async fn go_offline(&mut self) -> Result<(), SessionError> {
        if self.left {
            return Ok(());
        }
        self.left = true;
        self.online.store(false, Ordering::SeqCst);
        log::info!("[Session] Going offline");
        match self.writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(handle) = self.receiver.take() {
            handle.abort();
        }
    }
}

/// Read `name`, `body` frame pairs until the connection ends.
///
/// Calls `on_message` for each pair and `on_closed` exactly once at the end,
/// whether the peer closed cleanly or the stream failed.
pub async fn receive_loop<R, M, C>(mut reader: R, mut on_message: M, on_closed: C)
where
    R: AsyncRead + Unpin,
    M: FnMut(String, String),
    C: FnOnce(),
{
    loop {
        match framing::read_message(&mut reader).await {
            Ok((name, body)) => on_message(
                String::from_utf8_lossy(&name).into_owned(),
                String::from_utf8_lossy(&body).into_owned(),
            ),
            Err(e) if e.is_graceful() => {
                log::info!("[Session] Relay closed the connection");
                break;
            }
            Err(e) => {
                log::warn!("[Session] Receive failed: {e}");
                break;
            }
        }
    }
    on_closed();
}

/// Write errors that mean the relay already hung up on us.
fn is_refusal(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(2);

    /// Helper: a connected session plus the relay-side end of its socket.
    async fn setup() -> (Session, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let session = Session::connect(&addr.to_string()).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        (session, server_side)
    }

    async fn next_event(rx: &mut UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("Timed out waiting for session event")
            .expect("Event channel closed")
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = Session::connect(&addr).await.unwrap_err();
        assert!(matches!(err, SessionError::Connect { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_identify_sends_name_frame() {
        let (mut session, mut server) = setup().await;
        session.identify("alice").await.unwrap();
        assert_eq!(session.name(), Some("alice"));

        let mut wire = [0u8; 15];
        tokio::time::timeout(WAIT, server.read_exact(&mut wire))
            .await
            .expect("Timed out")
            .unwrap();
        assert_eq!(&wire, b"5         alice");
    }

    #[tokio::test]
    async fn test_identify_preconditions() {
        let (mut session, _server) = setup().await;
        assert!(matches!(session.identify("").await, Err(SessionError::EmptyName)));

        session.identify("alice").await.unwrap();
        match session.identify("bob").await {
            Err(SessionError::AlreadyIdentified(name)) => assert_eq!(name, "alice"),
            other => panic!("Expected AlreadyIdentified, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_requires_identify() {
        let (mut session, _server) = setup().await;
        assert!(matches!(
            session.send_message("hi").await,
            Err(SessionError::NotIdentified)
        ));
    }

    #[tokio::test]
    async fn test_send_message_writes_body_frame() {
        let (mut session, mut server) = setup().await;
        session.identify("alice").await.unwrap();
        session.send_message("hi there").await.unwrap();

        let name = framing::read_frame(&mut server).await.unwrap();
        let body = framing::read_frame(&mut server).await.unwrap();
        assert_eq!(name, b"alice");
        assert_eq!(body, b"hi there");
    }

    #[tokio::test]
    async fn test_receiver_delivers_messages_then_closed() {
        let (mut session, mut server) = setup().await;
        let mut rx = session.spawn_receiver().unwrap();
        assert!(matches!(session.spawn_receiver(), Err(SessionError::ReceiverRunning)));

        server
            .write_all(&framing::encode_message(b"bob", b"hello").unwrap())
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            SessionEvent::Message {
                name: "bob".to_string(),
                body: "hello".to_string(),
            }
        );
        assert!(session.is_online());

        drop(server);
        assert_eq!(next_event(&mut rx).await, SessionEvent::Closed);
        assert!(!session.is_online());
        assert!(rx.recv().await.is_none(), "Closed must be the last event");
    }

    #[tokio::test]
    async fn test_receive_loop_closes_once_on_garbage() {
        let (mut client, mut server) = tokio::io::duplex(64);
        server.write_all(&framing::encode(b"carol").unwrap()).await.unwrap();
        server.write_all(b"bogus-head").await.unwrap();

        let mut messages = Vec::new();
        let mut closed = 0;
        receive_loop(&mut client, |name, body| messages.push((name, body)), || closed += 1).await;

        assert!(messages.is_empty());
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn test_receive_loop_handles_split_writes() {
        let (client, mut server) = tokio::io::duplex(4);
        let writer = tokio::spawn(async move {
            let encoded = framing::encode_message(b"dave", b"a longer body").unwrap();
            server.write_all(&encoded).await.unwrap();
        });

        let mut messages = Vec::new();
        let mut closed = false;
        receive_loop(client, |name, body| messages.push((name, body)), || closed = true).await;
        writer.await.unwrap();

        assert_eq!(messages, [("dave".to_string(), "a longer body".to_string())]);
        assert!(closed);
    }

    #[tokio::test]
    async fn test_go_offline_closes_write_side() {
        let (mut session, mut server) = setup().await;
        session.identify("alice").await.unwrap();
        let _ = framing::read_frame(&mut server).await.unwrap();

        session.go_offline().await.unwrap();
        assert!(!session.is_online());
        session.go_offline().await.unwrap();

        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(WAIT, server.read(&mut buf)).await.expect("Timed out");
        assert!(matches!(read, Ok(0)), "Expected EOF, got: {read:?}");

        assert!(matches!(session.send_message("late").await, Err(SessionError::Offline)));
    }

    #[tokio::test]
    async fn test_identify_after_relay_hangup_is_slots_exhausted() {
        let (mut session, server) = setup().await;
        let mut rx = session.spawn_receiver().unwrap();

        // A relay with no free slot closes right after accept.
        drop(server);
        assert_eq!(next_event(&mut rx).await, SessionEvent::Closed);

        assert!(matches!(
            session.identify("carol").await,
            Err(SessionError::SlotsExhausted)
        ));
        assert_eq!(session.name(), None);
    }

    #[tokio::test]
    async fn test_send_after_relay_hangup_goes_offline() {
        let (mut session, mut server) = setup().await;
        session.identify("carol").await.unwrap();
        let _ = framing::read_frame(&mut server).await.unwrap();
        drop(server);

        // The first write after the close can still be accepted locally; the
        // peer's reset makes a later one fail.
        let mut outcome = None;
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            match session.send_message("x").await {
                Ok(()) => {}
                Err(e) => {
                    outcome = Some(e);
                    break;
                }
            }
        }
        assert!(matches!(outcome, Some(SessionError::Offline)), "{outcome:?}");
        assert!(!session.is_online());
        assert!(matches!(session.send_message("y").await, Err(SessionError::Offline)));
    }

    #[test]
    fn test_frame_error_conversion() {
        let io_err = FrameError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(matches!(SessionError::from(io_err), SessionError::Io(_)));
        assert!(matches!(
            SessionError::from(FrameError::FrameTooLarge(1)),
            SessionError::Frame(FrameError::FrameTooLarge(1))
        ));
        assert!(is_refusal(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_refusal(&io::Error::from(io::ErrorKind::TimedOut)));
    }
}
