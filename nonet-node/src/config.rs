//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nonet_core::{PeerId, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_PORT};

use crate::connection::{ConnectionOptions, WriteFailurePolicy};

/// Node configuration. File: ~/.config/nonet/config.toml or /etc/nonet/config.toml.
/// Env overrides: NONET_PORT, NONET_USERNAME, NONET_CONNECT_TIMEOUT_MS,
/// NONET_HANDSHAKE_TIMEOUT_MS, NONET_READ_TIMEOUT_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Session TCP port (default 8888).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Local username, in both roles. Random `User<n>` when unset.
    #[serde(default)]
    pub username: Option<PeerId>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Unset: reads never time out.
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    #[serde(default)]
    pub on_write_failure: WriteFailurePolicy,
    /// Send outgoing text as "<username>: <text>".
    #[serde(default = "default_prefix_sender")]
    pub prefix_sender: bool,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}
fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_MS
}
fn default_prefix_sender() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            username: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            read_timeout_ms: None,
            on_write_failure: WriteFailurePolicy::default(),
            prefix_sender: default_prefix_sender(),
        }
    }
}

impl Config {
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            read_timeout: self.read_timeout_ms.map(Duration::from_millis),
            on_write_failure: self.on_write_failure,
        }
    }

    /// Configured username, or a fresh `User<n>`.
    pub fn local_id(&self) -> PeerId {
        self.username.clone().unwrap_or_else(PeerId::generate)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(p) = var("NONET_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.port = p;
        }
        if let Some(name) = var("NONET_USERNAME").and_then(|s| PeerId::new(&s).ok()) {
            self.username = Some(name);
        }
        if let Some(ms) = var("NONET_CONNECT_TIMEOUT_MS").and_then(|s| s.parse::<u64>().ok()) {
            self.connect_timeout_ms = ms;
        }
        if let Some(ms) = var("NONET_HANDSHAKE_TIMEOUT_MS").and_then(|s| s.parse::<u64>().ok()) {
            self.handshake_timeout_ms = ms;
        }
        if let Some(ms) = var("NONET_READ_TIMEOUT_MS").and_then(|s| s.parse::<u64>().ok()) {
            self.read_timeout_ms = Some(ms);
        }
    }
}

/// Load config: defaults, then the config file (explicit path, or the first standard
/// path that exists), then env vars.
pub fn load(explicit: Option<&Path>) -> Config {
    let paths = match explicit {
        Some(p) => vec![p.to_path_buf()],
        None => config_paths(),
    };
    let mut c = load_file(&paths).unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/nonet/config.toml"));
    }
    out.push(PathBuf::from("/etc/nonet/config.toml"));
    out
}

fn load_file(paths: &[PathBuf]) -> Option<Config> {
    let p = paths.iter().find(|p| p.exists())?;
    let s = match std::fs::read_to_string(p) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(path = %p.display(), error = %e, "cannot read config file; using defaults");
            return None;
        }
    };
    match toml::from_str::<Config>(&s) {
        Ok(c) => {
            tracing::debug!(path = %p.display(), "loaded config file");
            Some(c)
        }
        Err(e) => {
            tracing::warn!(path = %p.display(), error = %e, "invalid config file; using defaults");
            None
        }
    }
}
