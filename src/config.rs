//! Configuration loading.
//!
//! The relay and the chat client read the same settings. Sources are
//! layered, later layers winning:
//!
//! 1. Config file: `--config PATH`, else `config.txt` in the working
//!    directory if present. A `.json` file may set any field; any other
//!    file uses the two-line text format (host on line 1, port on line 2).
//! 2. Environment: `CHATRELAY_HOST`, `CHATRELAY_PORT`, `CHATRELAY_SLOTS`,
//!    `CHATRELAY_HANDSHAKE_TIMEOUT`.
//! 3. Command-line flags.
//!
//! Host and port have no defaults. Missing or malformed values are fatal
//! startup errors.

use std::path::Path;
use std::time::Duration;
use std::{env, fs};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CONFIG_FILE, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_PAYLOAD, DEFAULT_SLOTS,
    DEFAULT_WRITE_QUEUE_FRAMES, ENV_HANDSHAKE_TIMEOUT, ENV_HOST, ENV_PORT, ENV_SLOTS, MAX_SLOTS,
};
use crate::relay::framing::MAX_PAYLOAD_LEN;

/// Effective configuration for the relay and its clients.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RelayConfig {
    /// Host or IP address to listen on (relay) or connect to (client).
    pub host: String,
    /// TCP port. `0` lets the OS pick one (relay only).
    pub port: u16,
    /// Number of routing slots, i.e. maximum concurrent sessions.
    pub slots: usize,
    /// Seconds a new connection may take to send its identity frame.
    pub handshake_timeout_secs: u64,
    /// Largest frame payload the relay accepts, in bytes.
    pub max_payload: u64,
    /// Forward each chat message to the other connected clients.
    pub forward_to_peers: bool,
    /// Frames queued per client before a client that stopped reading is
    /// disconnected.
    pub write_queue_frames: usize,
}

/// One partial source of configuration values.
#[derive(Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigLayer {
    /// Host override.
    pub host: Option<String>,
    /// Port override.
    pub port: Option<u16>,
    /// Slot count override.
    pub slots: Option<usize>,
    /// Handshake timeout override (seconds).
    pub handshake_timeout_secs: Option<u64>,
    /// Payload cap override.
    pub max_payload: Option<u64>,
    /// Peer forwarding override.
    pub forward_to_peers: Option<bool>,
    /// Write queue depth override.
    pub write_queue_frames: Option<usize>,
}

impl ConfigLayer {
    /// Read a config file. `.json` files are parsed as JSON, anything else
    /// as the two-line text format.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid JSON config: {}", path.display()))
        } else {
            Self::parse_text(&content)
                .with_context(|| format!("Invalid config file: {}", path.display()))
        }
    }

    /// Parse the two-line text format: host, then port.
    pub fn parse_text(content: &str) -> Result<Self> {
        let mut lines = content.lines().map(str::trim);
        let (Some(host), Some(port)) = (lines.next(), lines.next()) else {
            bail!("config file does not contain enough data (expected host and port lines)");
        };
        if host.is_empty() {
            bail!("host line is empty");
        }
        let port = port
            .parse::<u16>()
            .with_context(|| format!("port number is not a valid integer: {port:?}"))?;
        Ok(Self {
            host: Some(host.to_string()),
            port: Some(port),
            ..Self::default()
        })
    }

    /// Read the `CHATRELAY_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build a layer from a variable lookup. Set-but-malformed values are
    /// errors, not silently ignored.
    fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Result<Option<T>>
        where
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            lookup(key)
                .map(|raw| {
                    raw.trim()
                        .parse::<T>()
                        .with_context(|| format!("{key} is not valid: {raw:?}"))
                })
                .transpose()
        }

        Ok(Self {
            host: lookup(ENV_HOST)
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty()),
            port: parsed(&lookup, ENV_PORT)?,
            slots: parsed(&lookup, ENV_SLOTS)?,
            handshake_timeout_secs: parsed(&lookup, ENV_HANDSHAKE_TIMEOUT)?,
            ..Self::default()
        })
    }

    /// Overlay `over` on top of `self`; values set in `over` win.
    pub fn merge(self, over: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            host: over.host.or(self.host),
            port: over.port.or(self.port),
            slots: over.slots.or(self.slots),
            handshake_timeout_secs: over.handshake_timeout_secs.or(self.handshake_timeout_secs),
            max_payload: over.max_payload.or(self.max_payload),
            forward_to_peers: over.forward_to_peers.or(self.forward_to_peers),
            write_queue_frames: over.write_queue_frames.or(self.write_queue_frames),
        }
    }
}

impl RelayConfig {
    /// Load the effective configuration: file, then environment, then `cli`.
    pub fn load(path: Option<&Path>, cli: ConfigLayer) -> Result<Self> {
        let file_layer = match path {
            Some(path) => ConfigLayer::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    ConfigLayer::from_file(default_path)?
                } else {
                    ConfigLayer::default()
                }
            }
        };
        Self::from_layer(file_layer.merge(ConfigLayer::from_env()?).merge(cli))
    }

    /// Resolve a merged layer, applying defaults and validation.
    pub fn from_layer(layer: ConfigLayer) -> Result<Self> {
        let config = Self {
            host: layer
                .host
                .context("no host configured (config file, CHATRELAY_HOST or --host)")?,
            port: layer
                .port
                .context("no port configured (config file, CHATRELAY_PORT or --port)")?,
            slots: layer.slots.unwrap_or(DEFAULT_SLOTS),
            handshake_timeout_secs: layer
                .handshake_timeout_secs
                .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT.as_secs()),
            max_payload: layer.max_payload.unwrap_or(DEFAULT_MAX_PAYLOAD),
            forward_to_peers: layer.forward_to_peers.unwrap_or(true),
            write_queue_frames: layer.write_queue_frames.unwrap_or(DEFAULT_WRITE_QUEUE_FRAMES),
        };
        config.validate()?;
        Ok(config)
    }

    /// Configuration for a relay on `host:port` with every other value at
    /// its default.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            slots: DEFAULT_SLOTS,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT.as_secs(),
            max_payload: DEFAULT_MAX_PAYLOAD,
            forward_to_peers: true,
            write_queue_frames: DEFAULT_WRITE_QUEUE_FRAMES,
        }
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            bail!("host must not be empty");
        }
        if self.slots == 0 || self.slots > MAX_SLOTS {
            bail!("slots must be between 1 and {MAX_SLOTS}");
        }
        if self.handshake_timeout_secs == 0 {
            bail!("handshake_timeout_secs must be at least 1");
        }
        if self.max_payload > MAX_PAYLOAD_LEN {
            bail!("max_payload must not exceed {MAX_PAYLOAD_LEN}");
        }
        if self.write_queue_frames == 0 {
            bail!("write_queue_frames must be at least 1");
        }
        Ok(())
    }

    /// Handshake timeout as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// `host:port` for display.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
