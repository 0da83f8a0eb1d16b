//! chatrelay - real-time TCP chat relay.
//!
//! A relay process accepts chat clients over TCP, admits at most a fixed
//! number of them (one per routing slot), and turns their length-prefixed
//! frames into display events. Clients connect with a [`Session`], identify
//! with a display name, and exchange short text messages.
//!
//! # Modules
//!
//! - [`relay`] - Frame codec, connection handles, registry and relay loop
//! - [`session`] - Client side of a relay connection
//! - [`config`] - Layered configuration loading
//! - [`constants`] - Defaults and tuning values

pub mod config;
pub mod constants;
pub mod relay;
pub mod session;

// Re-export commonly used types
pub use config::{ConfigLayer, RelayConfig};
pub use relay::{RelayEvent, RelayHandle, RelayServer, Slot};
pub use session::{Session, SessionError, SessionEvent};
