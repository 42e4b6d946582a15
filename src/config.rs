//! Configuration for a relay node: CLI arguments plus an optional JSON
//! configuration file.  CLI arguments take precedence over environment
//! variables; an absent config file means all defaults.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 3025;
pub const DEFAULT_BUFFER_MAX_SIZE: usize = 1000;
pub const DEFAULT_TTL_HOURS: u64 = 24;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_INTERVALS_MS: [u64; 3] = [1_000, 5_000, 15_000];
pub const DEFAULT_STATS_INTERVAL_MS: u64 = 3_600_000;
pub const DEFAULT_BUFFER_TICK_MS: u64 = 5_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_RETENTION_HOURS: u64 = 168;

/// Sender name stamped on every datagram this node emits.
pub const NODE_SENDER_NAME: &str = "synapse-relay";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    InvalidSignalCode(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "io error: {e}"),
            ConfigError::Parse(e) => write!(f, "config parse error: {e}"),
            ConfigError::InvalidSignalCode(s) => write!(f, "invalid signal code: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

/// Signal relay node for a small mesh of cooperating servers.
///
/// Accepts typed signals over UDP, fans them out to named target peers,
/// buffers signals for unreachable targets, and aggregates relay statistics.
#[derive(Parser, Debug)]
#[command(name = "synapse-relay", version, about)]
pub struct Cli {
    /// Path to the JSON configuration file [env: SYNAPSE_CONFIG]
    #[arg(long, short = 'c', env = "SYNAPSE_CONFIG")]
    pub config: Option<PathBuf>,

    /// UDP listen port, overrides the config file [env: SYNAPSE_PORT]
    #[arg(long, short = 'p', env = "SYNAPSE_PORT")]
    pub port: Option<u16>,

    /// Path to the SQLite database [env: SYNAPSE_DB] [default: synapse-relay.db]
    #[arg(long, short = 'd', env = "SYNAPSE_DB")]
    pub db: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Config file shape
// ---------------------------------------------------------------------------

/// Whitelists of accepted / emitted signal codes, as `"0xNN"` hex strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalLists {
    #[serde(default)]
    pub incoming: Vec<String>,
    #[serde(default)]
    pub outgoing: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_buffer_max_size")]
    pub max_size: usize,
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,
    #[serde(default = "default_retry_intervals")]
    pub retry_intervals_ms: Vec<u64>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_BUFFER_MAX_SIZE,
            ttl_hours: DEFAULT_TTL_HOURS,
            retry_intervals_ms: DEFAULT_RETRY_INTERVALS_MS.to_vec(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

fn default_buffer_max_size() -> usize {
    DEFAULT_BUFFER_MAX_SIZE
}
fn default_ttl_hours() -> u64 {
    DEFAULT_TTL_HOURS
}
fn default_retry_intervals() -> Vec<u64> {
    DEFAULT_RETRY_INTERVALS_MS.to_vec()
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_stats_interval() -> u64 {
    DEFAULT_STATS_INTERVAL_MS
}
fn default_buffer_tick() -> u64 {
    DEFAULT_BUFFER_TICK_MS
}
fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}
fn default_retention_hours() -> u64 {
    DEFAULT_RETENTION_HOURS
}

/// Node configuration, deserialized from the JSON config file.
///
/// Every field has a default so a missing file (or an empty object) yields a
/// runnable node listening on the default port with no peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Known peer names.  Advisory: the tumbler deliberately accepts
    /// datagrams from senders outside this list.
    #[serde(default)]
    pub peers: Vec<String>,
    /// Peer name to UDP port, resolved against 127.0.0.1 by default.
    #[serde(default)]
    pub peer_ports: HashMap<String, u16>,
    #[serde(default)]
    pub signals: SignalLists,
    #[serde(default, rename = "buffer_config")]
    pub buffer: BufferConfig,
    #[serde(default = "default_stats_interval")]
    pub stats_aggregation_interval_ms: u64,
    #[serde(default = "default_buffer_tick")]
    pub buffer_tick_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// History and stats older than this horizon are removed by the
    /// retention sweep, as are terminal buffer rows.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            peers: Vec::new(),
            peer_ports: HashMap::new(),
            signals: SignalLists::default(),
            buffer: BufferConfig::default(),
            stats_aggregation_interval_ms: DEFAULT_STATS_INTERVAL_MS,
            buffer_tick_ms: DEFAULT_BUFFER_TICK_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            retention_hours: DEFAULT_RETENTION_HOURS,
        }
    }
}

impl NodeConfig {
    /// Load the config from `path`, or all defaults when `path` is `None` or
    /// the file does not exist.
    pub fn load(path: Option<&PathBuf>) -> Result<Self, ConfigError> {
        match path {
            Some(p) if p.exists() => {
                let data = std::fs::read_to_string(p)?;
                Ok(serde_json::from_str(&data)?)
            }
            _ => Ok(NodeConfig::default()),
        }
    }

    /// Parse the incoming signal whitelist into numeric codes.
    pub fn incoming_codes(&self) -> Result<Vec<u16>, ConfigError> {
        self.signals.incoming.iter().map(|s| parse_code(s)).collect()
    }

    /// Parse the outgoing signal whitelist into numeric codes.
    pub fn outgoing_codes(&self) -> Result<Vec<u16>, ConfigError> {
        self.signals.outgoing.iter().map(|s| parse_code(s)).collect()
    }
}

/// Parse a signal code from either `"0xNN"` hex form or plain decimal.
pub fn parse_code(s: &str) -> Result<u16, ConfigError> {
    let trimmed = s.trim();
    let parsed = if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        trimmed.parse::<u16>()
    };
    parsed.map_err(|_| ConfigError::InvalidSignalCode(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_missing_file() {
        let config = NodeConfig::load(None).expect("defaults");
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.peer_ports.is_empty());
        assert_eq!(config.buffer.ttl_hours, DEFAULT_TTL_HOURS);
        assert_eq!(
            config.buffer.retry_intervals_ms,
            DEFAULT_RETRY_INTERVALS_MS.to_vec()
        );
        assert_eq!(config.stats_aggregation_interval_ms, DEFAULT_STATS_INTERVAL_MS);
    }

    #[test]
    fn parses_partial_config() {
        let json = r#"{
            "port": 4100,
            "peers": ["alpha", "beta"],
            "peer_ports": {"alpha": 4001, "beta": 4002},
            "signals": {"incoming": ["0x04", "0x50", "241"]},
            "buffer_config": {"ttl_hours": 1}
        }"#;
        let config: NodeConfig = serde_json::from_str(json).expect("parse");
        assert_eq!(config.port, 4100);
        assert_eq!(config.peer_ports["beta"], 4002);
        assert_eq!(config.incoming_codes().expect("codes"), vec![0x04, 0x50, 0xF1]);
        assert_eq!(config.buffer.ttl_hours, 1);
        // Unspecified buffer fields keep their defaults.
        assert_eq!(config.buffer.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn rejects_bad_signal_code() {
        assert!(parse_code("0xZZ").is_err());
        assert!(parse_code("").is_err());
        assert_eq!(parse_code("0x04").expect("hex"), 4);
        assert_eq!(parse_code("80").expect("dec"), 80);
    }
}
