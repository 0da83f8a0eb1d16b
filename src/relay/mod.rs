//! TCP chat relay (server side).
//!
//! Accepts chat clients, admits at most `slots` of them at a time, and
//! turns their framed traffic into display events.
//!
//! # Architecture
//!
//! ```text
//! Relay Process                                   Client Process (chatrelay chat)
//! ┌──────────────────────────┐                    ┌──────────────────┐
//! │ RelayServer              │                    │ Session          │
//! │  TcpListener             │◄──────────────────►│  TcpStream       │
//! │  ConnectionHandle        │   frames over TCP  │  identify/send   │
//! │  per connection          │                    │  receiver task   │
//! └────────────┬─────────────┘                    └──────────────────┘
//!              │ ConnectionEvent
//!              ▼
//!    RelayLoop (owns Registry) ──► RelayEvent ──► display
//! ```
//!
//! # Wire Protocol
//!
//! Each frame is a 10-byte ASCII decimal length, left-justified and
//! space-padded, followed by that many payload bytes. A client's first frame
//! is its display name; every later frame is one message body.
//!
//! See [`framing`] for the codec.

pub mod connection;
pub mod events;
pub mod framing;
pub mod registry;
pub mod server;

pub use connection::{ConnectionHandle, ConnectionId, ConnectionLimits, QueueError};
pub use events::{CloseReason, RelayEvent};
pub use framing::FrameError;
pub use registry::{ConnectionRecord, Registry, RegistryError, Slot};
pub use server::{RelayHandle, RelayServer};
