//! Runtime configuration.
//!
//! Settings come from an optional TOML file at `<data_dir>/config.toml`
//! (tables `[server]` and `[lockstep]`), with command-line flags taking
//! precedence. Missing fields fall back to the documented defaults.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ServerError;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_HTTP_PORT: u16 = 4433;
pub const DEFAULT_MAX_ROOM_NUMBER: u32 = 256;
/// Rooms with no clients and no activity for this long get swept.
pub const DEFAULT_IDLE_ROOM_TIMEOUT_SECS: u64 = 300;

/// Default frame interval 66 ms, roughly 15 ticks per second.
pub const DEFAULT_FRAME_INTERVAL_MS: u32 = 66;
/// Tolerate about 500 ms of straggler lag when running pessimistic.
pub const DEFAULT_MAX_DELAY_FRAMES: i32 = (500 / DEFAULT_FRAME_INTERVAL_MS) as i32;
pub const DEFAULT_MAX_CLIENTS_PER_ROOM: u16 = 8;
/// Negative selects optimistic lockstep: never wait for stragglers.
pub const DEFAULT_DETERMINISTIC_LOCKSTEP: i32 = -1;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub http_port: u16,
    /// Accepted for config-file compatibility; nothing listens on it.
    pub grpc_port: u16,
    pub max_room_number: u32,
    pub idle_room_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        ServerSection {
            host: DEFAULT_HOST.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            grpc_port: 0,
            max_room_number: DEFAULT_MAX_ROOM_NUMBER,
            idle_room_timeout_secs: DEFAULT_IDLE_ROOM_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockstepSection {
    /// Tick period in milliseconds.
    pub frame_interval: u32,
    /// Straggler tolerance in frames; only consulted in pessimistic mode.
    pub max_delay_frames: i32,
    /// Negative for optimistic lockstep; zero or positive enables the
    /// pessimistic delay gate.
    pub deterministic_lockstep: i32,
    pub max_clients_per_room: u16,
}

impl Default for LockstepSection {
    fn default() -> Self {
        LockstepSection {
            frame_interval: DEFAULT_FRAME_INTERVAL_MS,
            max_delay_frames: DEFAULT_MAX_DELAY_FRAMES,
            deterministic_lockstep: DEFAULT_DETERMINISTIC_LOCKSTEP,
            max_clients_per_room: DEFAULT_MAX_CLIENTS_PER_ROOM,
        }
    }
}

impl LockstepSection {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval.max(1) as u64)
    }

    /// The effective straggler bound for the tick gate: `None` in optimistic
    /// mode, `Some(frames)` in pessimistic mode.
    pub fn effective_max_delay(&self) -> Option<u32> {
        if self.deterministic_lockstep < 0 {
            None
        } else {
            Some(self.max_delay_frames.max(0) as u32)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub lockstep: LockstepSection,
}

impl Config {
    /// Loads `<data_dir>/config.toml` if present, otherwise returns the
    /// defaults. A malformed file is an error rather than a silent
    /// fallback.
    pub fn load(data_dir: &Path) -> Result<Config, ServerError> {
        let path = data_dir.join("config.toml");
        if !path.exists() {
            return Ok(Config::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        toml::from_str(&raw).map_err(|e| ServerError::Internal(format!("bad config file: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.server.http_port, 4433);
        assert_eq!(cfg.lockstep.frame_interval, 66);
        assert_eq!(cfg.lockstep.max_clients_per_room, 8);
        assert_eq!(cfg.lockstep.deterministic_lockstep, -1);
        assert_eq!(cfg.lockstep.max_delay_frames, 7);
    }

    #[test]
    fn optimistic_by_default() {
        let cfg = LockstepSection::default();
        assert_eq!(cfg.effective_max_delay(), None);
    }

    #[test]
    fn pessimistic_uses_max_delay_frames() {
        let cfg = LockstepSection {
            deterministic_lockstep: 1,
            max_delay_frames: 4,
            ..LockstepSection::default()
        };
        assert_eq!(cfg.effective_max_delay(), Some(4));
    }

    #[test]
    fn parses_partial_toml() {
        let cfg: Config = toml::from_str(
            r#"
            [server]
            host = "0.0.0.0"

            [lockstep]
            frame_interval = 50
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.server.http_port, 4433);
        assert_eq!(cfg.lockstep.frame_interval, 50);
        assert_eq!(cfg.lockstep.max_clients_per_room, 8);
    }
}
