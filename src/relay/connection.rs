//! Per-connection state for relay clients (relay side).
//!
//! Each accepted TCP connection gets a [`ConnectionHandle`] that owns a read
//! task and a write task. The read task performs the handshake, decodes
//! frames and reports them to the relay loop as [`ConnectionEvent`]s; the
//! write task drains a bounded queue of pre-encoded frames into the socket.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedSender};
use tokio::task::JoinHandle;

use super::events::{CloseReason, ConnectionEvent};
use super::framing::{self, FrameError};

/// Opaque connection identity, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next identity from a process-wide monotonic counter.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn:{:x}", self.0)
    }
}

/// Read-side limits applied to every connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    /// How long a new connection may take to send its identity frame.
    pub handshake_timeout: Duration,
    /// Largest payload accepted in a single frame.
    pub max_payload: u64,
    /// Outgoing frames buffered before the client counts as stalled.
    pub write_queue_frames: usize,
}

/// Why an outgoing frame was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The client is not draining its socket and the queue is full.
    #[error("write queue full")]
    Full,
    /// The write task has exited.
    #[error("writer closed")]
    Closed,
}

/// Relay-side handle for a single client connection.
///
/// Dropping the handle leaves the tasks running; call
/// [`ConnectionHandle::disconnect`] to tear the connection down.
pub struct ConnectionHandle {
    /// Identity of this connection.
    id: ConnectionId,
    /// Remote address, for logging.
    peer: SocketAddr,
    /// Sender for outgoing pre-encoded frames.
    frame_tx: Sender<Vec<u8>>,
    /// Handle to the read task (for cleanup).
    read_handle: JoinHandle<()>,
    /// Handle to the write task (for cleanup).
    write_handle: JoinHandle<()>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    /// Take ownership of an accepted stream and spawn its read/write tasks.
    ///
    /// - Read task: handshake frame, then body frames → [`ConnectionEvent`]s
    /// - Write task: encoded frames from the queue → socket
    pub(crate) fn spawn(
        id: ConnectionId,
        stream: TcpStream,
        peer: SocketAddr,
        limits: ConnectionLimits,
        event_tx: UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(limits.write_queue_frames.max(1));

        let read_handle = tokio::spawn(Self::read_loop(id, read_half, limits, event_tx));
        let write_handle = tokio::spawn(Self::write_loop(id, write_half, frame_rx));

        Self {
            id,
            peer,
            frame_tx,
            read_handle,
            write_handle,
        }
    }

    /// Connection identity.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address of the peer.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue pre-encoded bytes (one or more whole frames) without waiting.
    pub fn send_raw(&self, encoded: Vec<u8>) -> Result<(), QueueError> {
        self.frame_tx.try_send(encoded).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    /// Disconnect this client, aborting read/write tasks.
    ///
    /// Both socket halves are dropped with their tasks, which closes the
    /// connection.
    pub fn disconnect(self) {
        self.read_handle.abort();
        self.write_handle.abort();
    }

    /// Read loop: identity frame under a timeout, then one event per body frame.
    async fn read_loop(
        id: ConnectionId,
        mut reader: OwnedReadHalf,
        limits: ConnectionLimits,
        event_tx: UnboundedSender<ConnectionEvent>,
    ) {
        let handshake = tokio::time::timeout(
            limits.handshake_timeout,
            framing::read_frame_limited(&mut reader, limits.max_payload),
        )
        .await;

        let name = match handshake {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                log_read_failure(id, "handshake", &e);
                let _ = event_tx.send(ConnectionEvent::Closed {
                    conn_id: id,
                    reason: e.into(),
                });
                return;
            }
            Err(_elapsed) => {
                log::warn!(
                    "[Conn] {} sent no identity within {:?}, dropping",
                    id,
                    limits.handshake_timeout
                );
                let _ = event_tx.send(ConnectionEvent::Closed {
                    conn_id: id,
                    reason: CloseReason::HandshakeTimeout,
                });
                return;
            }
        };

        if event_tx
            .send(ConnectionEvent::Identified { conn_id: id, name })
            .is_err()
        {
            return; // Relay loop gone
        }

        loop {
            match framing::read_frame_limited(&mut reader, limits.max_payload).await {
                Ok(body) => {
                    if event_tx
                        .send(ConnectionEvent::Message { conn_id: id, body })
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    log_read_failure(id, "read", &e);
                    let _ = event_tx.send(ConnectionEvent::Closed {
                        conn_id: id,
                        reason: e.into(),
                    });
                    return;
                }
            }
        }
    }

    /// Write loop: receives encoded frames and writes them to the socket.
    async fn write_loop(
        id: ConnectionId,
        mut writer: OwnedWriteHalf,
        mut frame_rx: Receiver<Vec<u8>>,
    ) {
        while let Some(data) = frame_rx.recv().await {
            if let Err(e) = writer.write_all(&data).await {
                log::error!("[Conn] Write error for {}: {e}", id);
                break;
            }
        }
    }
}

/// Log a reader failure at the level its kind deserves.
fn log_read_failure(id: ConnectionId, stage: &str, err: &FrameError) {
    if err.is_graceful() {
        log::info!("[Conn] {} disconnected during {stage}", id);
    } else if err.is_protocol_violation() {
        log::warn!("[Conn] Protocol violation from {} during {stage}: {err}", id);
    } else {
        log::error!("[Conn] Transport error on {} during {stage}: {err}", id);
    }
}
