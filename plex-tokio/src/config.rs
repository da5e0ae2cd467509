//! Session configuration.

use std::time::Duration;

use plex_core::heartbeat::HeartbeatConfig;
use plex_core::{CodecKind, CoreConfig, DEFAULT_MAX_MISSED_BEATS, DEFAULT_WINDOW};
use serde::Deserialize;

/// Default byte-stream chunk size (16 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;
/// Default number of frames queued for the transport writer before the session waits.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 64;

/// Per-session settings. Usually embedded in a host's TOML file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Probe interval in milliseconds. Unset: never probe the peer.
    #[serde(default)]
    pub heartbeat_ms: Option<u64>,
    /// Unanswered probes tolerated before the peer is declared dead (may be fractional).
    #[serde(default = "default_max_missed_beats")]
    pub max_missed_beats: f64,
    /// Answer the peer's probes.
    #[serde(default = "default_respond_to_heartbeat")]
    pub respond_to_heartbeat: bool,
    /// Chunks accepted per inbound channel before credit is granted back.
    #[serde(default = "default_window")]
    pub window: u32,
    /// Maximum bytes per chunk when pumping byte streams.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    #[serde(default)]
    pub codec: CodecKind,
}

fn default_max_missed_beats() -> f64 {
    DEFAULT_MAX_MISSED_BEATS
}
fn default_respond_to_heartbeat() -> bool {
    true
}
fn default_window() -> u32 {
    DEFAULT_WINDOW
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_outbound_queue() -> usize {
    DEFAULT_OUTBOUND_QUEUE
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: None,
            max_missed_beats: default_max_missed_beats(),
            respond_to_heartbeat: default_respond_to_heartbeat(),
            window: default_window(),
            chunk_size: default_chunk_size(),
            outbound_queue: default_outbound_queue(),
            codec: CodecKind::default(),
        }
    }
}

impl SessionConfig {
    /// Probe the peer every `interval_ms`, declaring it dead after `max_missed_beats`.
    pub fn with_heartbeat(mut self, interval_ms: u64, max_missed_beats: f64) -> Self {
        self.heartbeat_ms = Some(interval_ms);
        self.max_missed_beats = max_missed_beats;
        self
    }

    pub fn with_window(mut self, window: u32) -> Self {
        self.window = window;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_codec(mut self, codec: CodecKind) -> Self {
        self.codec = codec;
        self
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }

    pub(crate) fn core(&self) -> CoreConfig {
        CoreConfig {
            window: self.window.max(1),
            heartbeat: HeartbeatConfig {
                interval_ms: self.heartbeat_ms.filter(|ms| *ms > 0),
                max_missed_beats: self.max_missed_beats,
                respond: self.respond_to_heartbeat,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let c: SessionConfig = toml::from_str("").unwrap();
        assert_eq!(c, SessionConfig::default());
        assert_eq!(c.heartbeat_interval(), None);
        assert_eq!(c.core().heartbeat.interval_ms, None);
    }

    #[test]
    fn fields_parse() {
        let c: SessionConfig = toml::from_str(
            r#"
            heartbeat_ms = 500
            max_missed_beats = 2.5
            respond_to_heartbeat = false
            window = 4
            codec = "json"
            "#,
        )
        .unwrap();
        assert_eq!(c.heartbeat_interval(), Some(Duration::from_millis(500)));
        assert_eq!(c.codec, CodecKind::Json);
        let core = c.core();
        assert_eq!(core.window, 4);
        assert_eq!(core.heartbeat.max_missed_beats, 2.5);
        assert!(!core.heartbeat.respond);
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<SessionConfig>("heartbeat = 1").is_err());
    }

    #[test]
    fn zero_interval_disables_probing() {
        let c = SessionConfig::default().with_heartbeat(0, 1.0);
        assert_eq!(c.heartbeat_interval(), None);
    }
}
