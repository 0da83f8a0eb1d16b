//! TCP relay server: accept loop, admission control and message dispatch.
//!
//! [`RelayServer::start`] binds the listener and spawns one loop task. The
//! loop waits on three sources at once: the listener, the shared
//! [`ConnectionEvent`] channel fed by every connection's reader task, and
//! the shutdown token. Each wake is handled to completion before the next,
//! so the [`Registry`] is mutated from this task only.
//!
//! ```text
//!  TcpListener ──accept──┐
//!                        ▼
//!  reader tasks ──► RelayLoop (owns Registry) ──► RelayEvent channel ──► display
//!                        │
//!                        └──► ConnectionHandle::send_raw ──► writer tasks
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connection::{ConnectionHandle, ConnectionId, ConnectionLimits, QueueError};
use super::events::{CloseReason, ConnectionEvent, RelayEvent};
use super::framing;
use super::registry::{ConnectionRecord, Registry, RegistryError};
use crate::config::RelayConfig;
use crate::constants::ACCEPT_RETRY_DELAY;

/// Entry point for running a relay.
#[derive(Debug)]
pub struct RelayServer;

/// Control handle for a running relay.
#[derive(Debug)]
pub struct RelayHandle {
    /// Address the listener is bound to.
    local_addr: SocketAddr,
    /// Cancels the relay loop.
    shutdown: CancellationToken,
    /// Delivered chat messages, shared with the loop.
    message_count: Arc<AtomicU64>,
    /// Handle to the loop task.
    loop_handle: JoinHandle<()>,
}

impl RelayServer {
    /// Bind `config.host:config.port` and spawn the relay loop.
    ///
    /// Returns the control handle and the receiver of [`RelayEvent`]s for
    /// the display layer. Dropping the receiver is allowed; events are then
    /// discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the listener
    /// cannot be bound.
    pub async fn start(
        config: &RelayConfig,
    ) -> Result<(RelayHandle, UnboundedReceiver<RelayEvent>)> {
        config.validate()?;

        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .with_context(|| format!("Failed to bind relay listener on {}", config.address()))?;
        let local_addr = listener.local_addr()?;
        log::info!(
            "[Relay] Listening on {} ({} slots, handshake timeout {:?})",
            local_addr,
            config.slots,
            config.handshake_timeout()
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let message_count = Arc::new(AtomicU64::new(0));

        let relay_loop = RelayLoop {
            listener,
            registry: Registry::new(config.slots),
            connections: HashMap::new(),
            conn_tx,
            conn_rx,
            event_tx,
            message_count: Arc::clone(&message_count),
            limits: ConnectionLimits {
                handshake_timeout: config.handshake_timeout(),
                max_payload: config.max_payload,
                write_queue_frames: config.write_queue_frames,
            },
            forward_to_peers: config.forward_to_peers,
        };
        let loop_handle = tokio::spawn(relay_loop.run(shutdown.clone()));

        Ok((
            RelayHandle {
                local_addr,
                shutdown,
                message_count,
                loop_handle,
            },
            event_rx,
        ))
    }
}

impl RelayHandle {
    /// Address the relay is listening on (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of chat messages delivered so far.
    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    /// Request shutdown: closes the listener and every connection.
    ///
    /// Idempotent. Use [`RelayHandle::join`] to wait for completion.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// True once shutdown was requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait for the relay loop to finish and return the final message count.
    pub async fn join(self) -> u64 {
        if let Err(e) = self.loop_handle.await {
            log::error!("[Relay] Loop task failed: {e}");
        }
        self.message_count.load(Ordering::Relaxed)
    }
}

/// State owned by the relay loop task.
struct RelayLoop {
    listener: TcpListener,
    registry: Registry,
    /// Live connections, `Connecting` and `Active`.
    connections: HashMap<ConnectionId, ConnectionHandle>,
    /// Cloned into every new connection's reader task.
    conn_tx: UnboundedSender<ConnectionEvent>,
    conn_rx: UnboundedReceiver<ConnectionEvent>,
    event_tx: UnboundedSender<RelayEvent>,
    message_count: Arc<AtomicU64>,
    limits: ConnectionLimits,
    forward_to_peers: bool,
}

impl RelayLoop {
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.handle_accept(stream, peer),
                    Err(e) => {
                        log::error!("[Relay] Accept error: {e}");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
                Some(event) = self.conn_rx.recv() => self.handle_connection_event(event),
            }
        }

        log::info!("[Relay] Shutting down, closing {} connection(s)", self.connections.len());
        self.close_all();
        log::info!(
            "[Relay] Stopped after {} message(s)",
            self.message_count.load(Ordering::Relaxed)
        );
    }

    /// Admit or refuse a freshly accepted connection.
    fn handle_accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        let id = ConnectionId::next();
        let slot = match self.registry.reserve(id) {
            Ok(slot) => slot,
            Err(RegistryError::SlotsExhausted) => {
                log::info!("[Relay] No free slot, connection from {peer} refused");
                drop(stream);
                return;
            }
            Err(e) => {
                log::error!("[Relay] Reservation failed for {peer}: {e}");
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[Relay] set_nodelay failed for {peer}: {e}");
        }
        log::info!("[Relay] {id} connected from {peer}, slot {slot} reserved");

        let handle = ConnectionHandle::spawn(id, stream, peer, self.limits, self.conn_tx.clone());
        self.connections.insert(id, handle);
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Identified { conn_id, name } => self.handle_identified(conn_id, &name),
            ConnectionEvent::Message { conn_id, body } => self.handle_message(conn_id, &body),
            ConnectionEvent::Closed { conn_id, reason } => {
                log::debug!("[Relay] {conn_id} closed: {reason:?}");
                self.close_connection(conn_id, &reason);
            }
        }
    }

    /// `Connecting` → `Active`.
    fn handle_identified(&mut self, conn_id: ConnectionId, name: &[u8]) {
        if !self.connections.contains_key(&conn_id) {
            return; // Already torn down
        }
        match self.registry.register(conn_id, name) {
            Ok(record) => {
                log::info!(
                    "[Relay] {conn_id} identified as {} in slot {}",
                    record.label(),
                    record.slot
                );
                self.emit(RelayEvent::Text {
                    message: format!("{} is now online!", record.label()),
                    slot: record.slot,
                });
                self.emit_presence();
            }
            Err(e) => {
                log::warn!("[Relay] Could not register {conn_id}: {e}");
                self.close_connection(conn_id, &CloseReason::PeerClosed);
            }
        }
    }

    /// Count, echo to the sender's slot and forward to peers.
    fn handle_message(&mut self, conn_id: ConnectionId, body: &[u8]) {
        let Some(sender) = self.registry.record_for(conn_id).cloned() else {
            log::warn!("[Relay] Message from unregistered {conn_id} ignored");
            return;
        };

        self.message_count.fetch_add(1, Ordering::Relaxed);
        let text = String::from_utf8_lossy(body);
        log::debug!("[Relay] {} sent {} byte(s)", sender.label(), body.len());
        self.emit(RelayEvent::Text {
            message: format!("from {}: {}", sender.name, text),
            slot: sender.slot,
        });

        if self.forward_to_peers {
            self.forward(&sender, body);
        }
    }

    /// Send `name`, `body` frames to every other registered connection.
    ///
    /// Peers whose write queue is full are disconnected.
    fn forward(&mut self, sender: &ConnectionRecord, body: &[u8]) {
        let encoded = match framing::encode_message(sender.name.as_bytes(), body) {
            Ok(encoded) => encoded,
            Err(e) => {
                log::warn!("[Relay] Cannot forward message from {}: {e}", sender.label());
                return;
            }
        };
        let mut stalled = Vec::new();
        for peer in self.registry.all_connections().filter(|r| r.id != sender.id) {
            let Some(handle) = self.connections.get(&peer.id) else {
                continue;
            };
            match handle.send_raw(encoded.clone()) {
                Ok(()) => {}
                Err(QueueError::Full) => stalled.push(peer.id),
                Err(QueueError::Closed) => {
                    log::debug!("[Relay] Writer for {} already gone", peer.label());
                }
            }
        }
        for id in stalled {
            self.close_connection(id, &CloseReason::Stalled);
        }
    }

    /// `*` → `Closed`. Safe to call repeatedly for the same connection.
    fn close_connection(&mut self, conn_id: ConnectionId, reason: &CloseReason) {
        let Some(handle) = self.connections.remove(&conn_id) else {
            return; // Already closed
        };
        let peer = handle.peer();
        handle.disconnect();

        if self.registry.release(conn_id) {
            log::info!("[Relay] {conn_id} from {peer} left before identifying ({reason:?})");
            return;
        }
        let Some(record) = self.registry.unregister(conn_id) else {
            return;
        };

        match reason {
            CloseReason::Error(e) => {
                log::warn!("[Relay] {} ({peer}) dropped: {e}", record.label());
            }
            CloseReason::Stalled => {
                log::warn!("[Relay] {} ({peer}) stopped reading, dropped", record.label());
            }
            CloseReason::PeerClosed | CloseReason::HandshakeTimeout => {
                log::info!("[Relay] {} ({peer}) went offline", record.label());
            }
        }
        self.emit(RelayEvent::Text {
            message: format!("{} went offline", record.label()),
            slot: record.slot,
        });
        self.emit_presence();
    }

    /// Administrative teardown of every live connection.
    fn close_all(&mut self) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.close_connection(id, &CloseReason::PeerClosed);
        }
    }

    fn emit_presence(&self) {
        self.emit(RelayEvent::Presence {
            users: self.registry.snapshot_presence(),
        });
    }

    fn emit(&self, event: RelayEvent) {
        // No display attached is fine.
        let _ = self.event_tx.send(event);
    }
}
