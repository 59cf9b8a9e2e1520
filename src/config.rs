//! # Configuration Management
//!
//! Loads relay settings from layered sources using the `config` crate:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` in the working directory
//! - `RELAY_` environment variables, with `__` between path segments
//!   (e.g. `RELAY_SIDECAR__URL`, `RELAY_JITTER__INITIAL_BUFFER_MS`)
//! - Deployment shortcuts: `HOST`, `PORT`, `SIDECAR_WS_URL`,
//!   `SIDECAR_CONNECT_TIMEOUT`, `SIDECAR_MAX_RECONNECT_ATTEMPTS`,
//!   `SIDECAR_RECONNECT_DELAY` (seconds), `AUDIO_SAMPLE_RATE`, `AUDIO_CHANNELS`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment shortcuts
//! 2. `RELAY_` environment variables
//! 3. `config.toml`
//! 4. Defaults
//!
//! ## Units:
//! Durations are milliseconds in the config and get converted to samples or
//! `Duration`s when a session is built, so the same file works at any
//! sample rate.

use crate::audio::codec::{AudioFormat, TranscoderSettings};
use crate::audio::frame::PcmSpec;
use crate::audio::jitter::JitterSettings;
use crate::relay::session::RelaySettings;
use crate::relay::supervisor::SupervisorSettings;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub sidecar: SidecarConfig,
    pub audio: AudioConfig,
    pub jitter: JitterConfig,
    pub barge_in: BargeInConfig,
    pub transcoder: TranscoderConfig,
    pub performance: PerformanceConfig,
}

/// Where the HTTP/WebSocket server listens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// How to reach the speech sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SidecarMode {
    /// Real sidecar over WebSocket
    Websocket,
    /// In-process echo sidecar for local development
    Loopback,
}

/// Sidecar address and retry policy.
///
/// ## Fields:
/// - `connect_timeout_ms`: bound on a single connection attempt
/// - `max_reconnect_attempts`: attempts before the session degrades
/// - `reconnect_delay_ms`: pause between attempts (not after the last)
/// - `loopback_delay_ms`: echo delay when `mode = "loopback"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarConfig {
    pub mode: SidecarMode,
    pub url: String,
    pub connect_timeout_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub loopback_delay_ms: u64,
}

/// PCM layout on the sidecar side and the client's default format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u8,
    /// Used when the client does not pass `?format=`
    pub client_format: AudioFormat,
    /// Output block duration; the emit timer fires once per block
    pub block_ms: u64,
}

/// Jitter buffer thresholds in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JitterConfig {
    pub initial_buffer_ms: u64,
    pub partial_buffer_ms: u64,
    pub partial_increment_ms: u64,
    pub partial_ceiling_ms: u64,
    pub max_buffer_ms: u64,
    pub max_increment_ms: u64,
    pub max_ceiling_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BargeInConfig {
    /// Silence after the last client chunk before agent audio flows again
    pub quiet_window_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscoderConfig {
    pub ffmpeg_path: String,
    pub opus_bitrate: String,
}

/// Limits and channel sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    /// Capacity of every per-session channel, in chunks
    pub channel_capacity: usize,
    /// How long session tasks get to stop before they are aborted
    pub shutdown_grace_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            sidecar: SidecarConfig {
                mode: SidecarMode::Websocket,
                url: "ws://localhost:9000/v1/audio-stream".to_string(),
                connect_timeout_ms: 10_000,
                max_reconnect_attempts: 3,
                reconnect_delay_ms: 2_000,
                loopback_delay_ms: 100,
            },
            audio: AudioConfig {
                sample_rate: 16_000,
                channels: 1,
                client_format: AudioFormat::WebmOpus,
                block_ms: 20,
            },
            jitter: JitterConfig {
                initial_buffer_ms: 80,
                partial_buffer_ms: 10,
                partial_increment_ms: 5,
                partial_ceiling_ms: 80,
                max_buffer_ms: 10,
                max_increment_ms: 5,
                max_ceiling_ms: 80,
            },
            barge_in: BargeInConfig { quiet_window_ms: 100 },
            transcoder: TranscoderConfig {
                ffmpeg_path: "ffmpeg".to_string(),
                opus_bitrate: "24k".to_string(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 50,
                channel_capacity: 64,
                shutdown_grace_ms: 2_000,
            },
        }
    }
}

/// Deployment variables given in seconds, with the config key they override.
const SECONDS_OVERRIDES: [(&str, &str); 2] = [
    ("SIDECAR_CONNECT_TIMEOUT", "sidecar.connect_timeout_ms"),
    ("SIDECAR_RECONNECT_DELAY", "sidecar.reconnect_delay_ms"),
];

/// Deployment variables taken as-is.
const PLAIN_OVERRIDES: [(&str, &str); 6] = [
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("SIDECAR_WS_URL", "sidecar.url"),
    ("SIDECAR_MAX_RECONNECT_ATTEMPTS", "sidecar.max_reconnect_attempts"),
    ("AUDIO_SAMPLE_RATE", "audio.sample_rate"),
    ("AUDIO_CHANNELS", "audio.channels"),
];

impl AppConfig {
    /// Load configuration from every source in priority order.
    ///
    /// ## Rust Concepts:
    /// - **Builder pattern**: each `add_source` layers over the previous one
    /// - **?**: any malformed source aborts startup with a readable error
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("RELAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        for (var, key) in PLAIN_OVERRIDES {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(key, value)?;
            }
        }

        for (var, key) in SECONDS_OVERRIDES {
            if let Ok(value) = env::var(var) {
                let seconds: f64 = value
                    .trim()
                    .parse()
                    .map_err(|e| anyhow::anyhow!("{} must be a number of seconds: {}", var, e))?;
                settings = settings.set_override(key, (seconds * 1000.0).round() as i64)?;
            }
        }

        let config: AppConfig = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Check that the values can produce a working relay.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.sidecar.url.trim().is_empty() && self.sidecar.mode == SidecarMode::Websocket {
            return Err(anyhow::anyhow!("Sidecar url cannot be empty"));
        }

        if self.sidecar.max_reconnect_attempts == 0 {
            return Err(anyhow::anyhow!("Sidecar max_reconnect_attempts must be greater than 0"));
        }

        if self.sidecar.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Sidecar connect_timeout_ms must be greater than 0"));
        }

        if self.audio.sample_rate == 0 || self.audio.channels == 0 {
            return Err(anyhow::anyhow!("Audio sample_rate and channels must be greater than 0"));
        }

        if self.block_samples() == 0 {
            return Err(anyhow::anyhow!("Audio block_ms is too small for the sample rate"));
        }

        if self.jitter.partial_ceiling_ms < self.jitter.partial_buffer_ms {
            return Err(anyhow::anyhow!("Jitter partial_ceiling_ms cannot be below partial_buffer_ms"));
        }

        if self.jitter.max_ceiling_ms < self.jitter.max_buffer_ms {
            return Err(anyhow::anyhow!("Jitter max_ceiling_ms cannot be below max_buffer_ms"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.channel_capacity == 0 {
            return Err(anyhow::anyhow!("Channel capacity must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial JSON update, e.g. `{"jitter": {"initial_buffer_ms": 120}}`.
    ///
    /// ## Partial updates:
    /// The current config is serialized, the update is merged into it key by
    /// key, and the result is deserialized again. Unknown keys and wrong types
    /// are rejected, and the result must pass `validate`. Running sessions
    /// keep the settings they started with.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let patch: serde_json::Value = serde_json::from_str(json_str)?;
        if !patch.is_object() {
            return Err(anyhow::anyhow!("Configuration update must be a JSON object"));
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, &patch, "")?;

        let updated: AppConfig = serde_json::from_value(merged)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    pub fn pcm_spec(&self) -> PcmSpec {
        PcmSpec::new(self.audio.sample_rate, self.audio.channels)
    }

    pub fn block_samples(&self) -> usize {
        self.pcm_spec().samples_for_ms(self.audio.block_ms)
    }

    /// Jitter thresholds converted to samples at the configured rate.
    pub fn jitter_settings(&self) -> JitterSettings {
        let pcm = self.pcm_spec();
        let j = &self.jitter;
        JitterSettings {
            initial_buffer_samples: pcm.samples_for_ms(j.initial_buffer_ms),
            partial_buffer_samples: pcm.samples_for_ms(j.partial_buffer_ms),
            partial_increment: pcm.samples_for_ms(j.partial_increment_ms),
            partial_ceiling: pcm.samples_for_ms(j.partial_ceiling_ms),
            max_buffer_samples: pcm.samples_for_ms(j.max_buffer_ms),
            max_increment: pcm.samples_for_ms(j.max_increment_ms),
            max_ceiling: pcm.samples_for_ms(j.max_ceiling_ms),
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            url: self.sidecar.url.clone(),
            connect_timeout: Duration::from_millis(self.sidecar.connect_timeout_ms),
            max_attempts: self.sidecar.max_reconnect_attempts,
            reconnect_delay: Duration::from_millis(self.sidecar.reconnect_delay_ms),
        }
    }

    /// Everything one session needs, for a client speaking `client_format`.
    pub fn relay_settings(&self, client_format: AudioFormat) -> RelaySettings {
        RelaySettings {
            pcm: self.pcm_spec(),
            client_format,
            block_samples: self.block_samples(),
            block_duration: Duration::from_millis(self.audio.block_ms),
            jitter: self.jitter_settings(),
            quiet_window: Duration::from_millis(self.barge_in.quiet_window_ms),
            supervisor: self.supervisor_settings(),
            transcoder: TranscoderSettings {
                ffmpeg_path: self.transcoder.ffmpeg_path.clone(),
                opus_bitrate: self.transcoder.opus_bitrate.clone(),
                channel_capacity: self.performance.channel_capacity,
            },
            shutdown_grace: Duration::from_millis(self.performance.shutdown_grace_ms),
        }
    }
}

/// Merge `patch` into `target`, refusing keys `target` does not have.
fn merge_json(target: &mut serde_json::Value, patch: &serde_json::Value, path: &str) -> Result<()> {
    let (Some(target_map), Some(patch_map)) = (target.as_object_mut(), patch.as_object()) else {
        *target = patch.clone();
        return Ok(());
    };

    for (key, value) in patch_map {
        let key_path = if path.is_empty() { key.clone() } else { format!("{}.{}", path, key) };
        match target_map.get_mut(key) {
            Some(existing) if existing.is_object() && value.is_object() => {
                merge_json(existing, value, &key_path)?;
            }
            Some(existing) => *existing = value.clone(),
            None => return Err(anyhow::anyhow!("Unknown configuration key: {}", key_path)),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.sidecar.max_reconnect_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_jitter_defaults_in_samples() {
        let settings = AppConfig::default().jitter_settings();
        assert_eq!(settings, JitterSettings::default());
        assert_eq!(AppConfig::default().block_samples(), 320);
    }

    #[test]
    fn test_thresholds_follow_sample_rate() {
        let mut config = AppConfig::default();
        config.audio.sample_rate = 24_000;
        let settings = config.jitter_settings();
        assert_eq!(settings.initial_buffer_samples, 1920);
        assert_eq!(config.block_samples(), 480);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.sidecar.max_reconnect_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.jitter.max_ceiling_ms = 5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.block_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "jitter": {"initial_buffer_ms": 120}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.jitter.initial_buffer_ms, 120);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_config_update_rejects_bad_input() {
        let mut config = AppConfig::default();
        let original = config.clone();

        assert!(config.update_from_json(r#"{"sidecar": {"max_reconnect_attempts": 0}}"#).is_err());
        assert!(config.update_from_json(r#"{"sidecar": {"retries": 5}}"#).is_err());
        assert!(config.update_from_json(r#"{"audio": {"client_format": "mp3"}}"#).is_err());
        assert_eq!(config, original);

        assert!(config.update_from_json(r#"{"sidecar": {"mode": "loopback"}}"#).is_ok());
        assert_eq!(config.sidecar.mode, SidecarMode::Loopback);
    }

    #[test]
    fn test_relay_settings_conversion() {
        let config = AppConfig::default();
        let settings = config.relay_settings(AudioFormat::Pcm16);
        assert_eq!(settings.block_duration, Duration::from_millis(20));
        assert_eq!(settings.supervisor.reconnect_delay, Duration::from_secs(2));
        assert_eq!(settings.transcoder.channel_capacity, 64);
        assert_eq!(settings.quiet_window, Duration::from_millis(100));
    }
}
