//! Event types flowing into and out of the relay loop.
//!
//! Per-connection reader tasks send [`ConnectionEvent`]s through a single
//! `mpsc::UnboundedSender`. The relay loop is the only receiver, so every
//! registry mutation happens on one task.
//!
//! The loop publishes [`RelayEvent`]s to whatever display layer consumes
//! the relay (the `serve` command prints them).

use super::connection::ConnectionId;
use super::framing::FrameError;
use super::registry::Slot;

/// Event published by the relay for display layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// A line of text for the display pane bound to `slot`.
    Text {
        /// Human-readable line, e.g. `"from alice: hi"`.
        message: String,
        /// Routing slot the line belongs to.
        slot: Slot,
    },

    /// The set of online users changed.
    Presence {
        /// `"name#token"` labels in registration order.
        users: Vec<String>,
    },
}

/// Why a connection's reader stopped.
#[derive(Debug)]
pub enum CloseReason {
    /// The peer closed its end cleanly.
    PeerClosed,
    /// No identity frame arrived within the handshake timeout.
    HandshakeTimeout,
    /// The client stopped reading and its write queue filled up.
    Stalled,
    /// Frame decode or transport failure.
    Error(FrameError),
}

impl From<FrameError> for CloseReason {
    fn from(err: FrameError) -> Self {
        if err.is_graceful() {
            Self::PeerClosed
        } else {
            Self::Error(err)
        }
    }
}

/// Event from a connection's reader task delivered to the relay loop.
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    /// The handshake frame (display name) arrived.
    Identified {
        /// Connection that completed its handshake.
        conn_id: ConnectionId,
        /// Raw display-name bytes.
        name: Vec<u8>,
    },

    /// One message body from an identified connection.
    Message {
        /// Sending connection.
        conn_id: ConnectionId,
        /// Raw body bytes.
        body: Vec<u8>,
    },

    /// The reader stopped; the connection is gone.
    Closed {
        /// Connection that closed.
        conn_id: ConnectionId,
        /// What ended it.
        reason: CloseReason,
    },
}
