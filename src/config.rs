//! Channel configuration.
//!
//! JSON-based configuration for the server core: protocol toggles, the
//! per-session update interval, executor pool sizing and the handshake
//! backlog bound.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::wire::{FEC_HEADER_SIZE_PLUS_2, SN_OFFSET};

/// Error types for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("Invalid listen address: {0}")]
    InvalidListenAddr(String),

    #[error("Executor count must be > 0")]
    InvalidExecutorCount,

    #[error("Handshake backlog must be > 0")]
    InvalidHandshakeBacklog,

    #[error("Update interval must be >= 1ms")]
    InvalidInterval,
}

/// FEC framing marker. Its presence shifts the sequence-number offset by
/// [`FEC_HEADER_SIZE_PLUS_2`]; the shard counts are consumed by the erasure
/// layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FecAdapt {
    pub data_shards: usize,
    pub parity_shards: usize,
}

impl FecAdapt {
    pub fn header_size_plus_2(&self) -> usize {
        FEC_HEADER_SIZE_PLUS_2
    }
}

/// Server channel configuration loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Listen address (e.g., "0.0.0.0:22102")
    pub listen_addr: String,

    /// Strip PROXY protocol v2 headers from inbound datagrams
    pub proxy_protocol_v2_enabled: bool,

    /// Prefer the conversation-id index when resolving data datagrams
    pub use_conv_channel: bool,

    /// Verify the CRC32 trailer on data segments (consumed by the engine;
    /// does not shift the sequence-number offset)
    pub crc32_check: bool,

    /// Optional FEC framing; shifts the sequence-number offset when present
    pub fec_adapt: Option<FecAdapt>,

    /// Per-session update tick interval (e.g., "40ms")
    #[serde(with = "duration_serde")]
    pub interval: Duration,

    /// Idle time before a session is closed (e.g., "2m")
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,

    /// Number of single-consumer executors in the pool
    pub executor_count: usize,

    /// Bound on pending half-open handshakes; the oldest is evicted first
    pub handshake_backlog: usize,

    /// Log level: "debug", "info", "warn", "error"
    pub log_level: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:22102".to_string(),
            proxy_protocol_v2_enabled: false,
            use_conv_channel: true,
            crc32_check: false,
            fec_adapt: None,
            interval: Duration::from_millis(40),
            idle_timeout: Duration::from_secs(120),
            executor_count: default_executor_count(),
            handshake_backlog: 10,
            log_level: "info".to_string(),
        }
    }
}

fn default_executor_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl ChannelConfig {
    /// Load configuration from a JSON file. A missing file yields the
    /// defaults; a file that exists must parse and validate.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let config: Self = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        // Stage then rename so a crash cannot leave a truncated file.
        let staged = path.with_extension("tmp");
        std::fs::write(&staged, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&staged, path)?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(self.listen_addr.clone()));
        }
        if self.executor_count == 0 {
            return Err(ConfigError::InvalidExecutorCount);
        }
        if self.handshake_backlog == 0 {
            return Err(ConfigError::InvalidHandshakeBacklog);
        }
        if self.interval < Duration::from_millis(1) {
            return Err(ConfigError::InvalidInterval);
        }
        match self.log_level.to_lowercase().as_str() {
            "debug" | "info" | "warn" | "error" => {}
            _ => return Err(ConfigError::InvalidLogLevel(self.log_level.clone())),
        }
        Ok(())
    }

    /// Offset of the segment sequence number inside a data datagram. FEC
    /// framing prepends its own header; the CRC32 trailer does not move it.
    pub fn sn_offset(&self) -> usize {
        match &self.fec_adapt {
            Some(fec) => SN_OFFSET + fec.header_size_plus_2(),
            None => SN_OFFSET,
        }
    }

    /// Get tracing::Level from the log_level string.
    pub fn log_level_as_tracing(&self) -> tracing::Level {
        match self.log_level.to_lowercase().as_str() {
            "debug" => tracing::Level::DEBUG,
            "info" => tracing::Level::INFO,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}

/// Duration fields are written as a number plus a unit: "40ms", "2s",
/// "1.5s", "2m".
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis();
        let text = if millis >= 1000 && millis % 1000 == 0 {
            format!("{}s", millis / 1000)
        } else {
            format!("{}ms", millis)
        };
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        parse_duration(&text).map_err(serde::de::Error::custom)
    }

    fn parse_duration(input: &str) -> Result<Duration, String> {
        let text = input.trim();
        let unit_start = text
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("duration {text:?} has no unit"))?;
        let (number, unit) = text.split_at(unit_start);
        let value: f64 = number
            .parse()
            .map_err(|_| format!("duration {text:?} has a malformed number"))?;
        let unit_ms = match unit.trim().to_ascii_lowercase().as_str() {
            "ms" => 1.0,
            "s" => 1_000.0,
            "m" => 60_000.0,
            other => return Err(format!("duration unit {other:?} is not one of ms, s, m")),
        };
        Ok(Duration::from_millis((value * unit_ms).round() as u64))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parses_all_units() {
            assert_eq!(parse_duration("40ms").unwrap(), Duration::from_millis(40));
            assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
            assert_eq!(parse_duration(" 2m ").unwrap(), Duration::from_secs(120));
        }

        #[test]
        fn rejects_garbage() {
            assert!(parse_duration("").is_err());
            assert!(parse_duration("ms").is_err());
            assert!(parse_duration("40").is_err());
            assert!(parse_duration("40h").is_err());
            assert!(parse_duration("4.0.0s").is_err());
        }
    }
}
