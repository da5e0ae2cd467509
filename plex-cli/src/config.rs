//! Load config from file and environment.

use plex_tokio::SessionConfig;
use serde::Deserialize;
use std::path::PathBuf;

/// Tool configuration. File: ~/.config/plex/config.toml or /etc/plex/config.toml.
/// Env overrides: PLEX_LISTEN, PLEX_HEARTBEAT_MS, PLEX_MAX_MISSED_BEATS, PLEX_WINDOW, PLEX_CODEC.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address `plex serve` binds when none is given (default 127.0.0.1:7070).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Settings for every session, served or dialed.
    #[serde(default)]
    pub session: SessionConfig,
}

fn default_listen() -> String {
    "127.0.0.1:7070".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            session: SessionConfig::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let c = load_file().unwrap_or_default();
    apply_env(c, |key| std::env::var(key).ok())
}

fn apply_env(mut c: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(s) = var("PLEX_LISTEN") {
        c.listen = s;
    }
    if let Some(s) = var("PLEX_HEARTBEAT_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.session.heartbeat_ms = Some(ms);
        }
    }
    if let Some(s) = var("PLEX_MAX_MISSED_BEATS") {
        if let Ok(n) = s.parse::<f64>() {
            c.session.max_missed_beats = n;
        }
    }
    if let Some(s) = var("PLEX_WINDOW") {
        if let Ok(w) = s.parse::<u32>() {
            c.session.window = w;
        }
    }
    if let Some(s) = var("PLEX_CODEC") {
        match s.parse() {
            Ok(codec) => c.session.codec = codec,
            Err(e) => tracing::warn!(value = %s, error = %e, "ignoring PLEX_CODEC"),
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/plex/config.toml"));
    }
    out.push(PathBuf::from("/etc/plex/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "bad config file"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config file"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use plex_tokio::CodecKind;

    #[test]
    fn nested_session_table() {
        let c: Config = toml::from_str(
            r#"
            listen = "0.0.0.0:9000"

            [session]
            heartbeat_ms = 250
            window = 8
            "#,
        )
        .unwrap();
        assert_eq!(c.listen, "0.0.0.0:9000");
        assert_eq!(c.session.heartbeat_ms, Some(250));
        assert_eq!(c.session.window, 8);
    }

    #[test]
    fn env_overrides_file_values() {
        let c = apply_env(Config::default(), |key| match key {
            "PLEX_HEARTBEAT_MS" => Some("500".into()),
            "PLEX_MAX_MISSED_BEATS" => Some("2.5".into()),
            "PLEX_CODEC" => Some("json".into()),
            "PLEX_WINDOW" => Some("not a number".into()),
            _ => None,
        });
        assert_eq!(c.session.heartbeat_ms, Some(500));
        assert_eq!(c.session.max_missed_beats, 2.5);
        assert_eq!(c.session.codec, CodecKind::Json);
        assert_eq!(c.session.window, SessionConfig::default().window);
        assert_eq!(c.listen, default_listen());
    }
}
