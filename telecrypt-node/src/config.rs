//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use telecrypt_core::{CipherKind, FramingMode, LinkAddr, LinkConfig};

/// Node configuration. File: `--config`, else ~/.config/telecrypt/config.toml or
/// /etc/telecrypt/config.toml.
/// Env overrides: TELECRYPT_BIND, TELECRYPT_STORAGE_DIR, TELECRYPT_CIPHER, TELECRYPT_FRAMING.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UDP socket standing in for the radio (default 0.0.0.0:47100).
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// This node's link address.
    #[serde(default = "default_address")]
    pub address: LinkAddr,
    /// Directory for decrypted messages (default ./received).
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// File name prefix for decrypted messages.
    #[serde(default = "default_storage_prefix")]
    pub storage_prefix: String,
    /// Registered peers. The link refuses to send anywhere else.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub link: LinkConfig,
}

/// Maps a peer's link address to the socket its node listens on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    pub address: LinkAddr,
    pub socket: SocketAddr,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 47100))
}
fn default_address() -> LinkAddr {
    LinkAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01])
}
fn default_storage_dir() -> PathBuf {
    PathBuf::from("received")
}
fn default_storage_prefix() -> String {
    "telemetry_decrypted".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            address: default_address(),
            storage_dir: default_storage_dir(),
            storage_prefix: default_storage_prefix(),
            peers: Vec::new(),
            link: LinkConfig::default(),
        }
    }
}

impl Config {
    pub fn peer(&self, address: &LinkAddr) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| p.address == *address)
    }
}

/// Load config: default, then config file (explicit path or first one found), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => read_file(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    c.link.validate().context("invalid [link] section")?;
    Ok(c)
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let c = toml::from_str::<Config>(&s)
        .with_context(|| format!("parsing config {}", path.display()))?;
    tracing::debug!(path = %path.display(), "config loaded");
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/telecrypt/config.toml"));
    }
    out.push(PathBuf::from("/etc/telecrypt/config.toml"));
    out
}

/// Apply environment overrides. Unparseable values are logged and ignored.
fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("TELECRYPT_BIND") {
        match s.parse::<SocketAddr>() {
            Ok(a) => c.bind = a,
            Err(e) => tracing::warn!(value = %s, error = %e, "ignoring TELECRYPT_BIND"),
        }
    }
    if let Some(s) = var("TELECRYPT_STORAGE_DIR") {
        c.storage_dir = PathBuf::from(s);
    }
    if let Some(s) = var("TELECRYPT_CIPHER") {
        match s.parse::<CipherKind>() {
            Ok(k) => c.link.cipher = k,
            Err(e) => tracing::warn!(error = %e, "ignoring TELECRYPT_CIPHER"),
        }
    }
    if let Some(s) = var("TELECRYPT_FRAMING") {
        match s.parse::<FramingMode>() {
            Ok(f) => c.link.framing = f,
            Err(e) => tracing::warn!(error = %e, "ignoring TELECRYPT_FRAMING"),
        }
    }
}
