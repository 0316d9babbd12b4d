//! TOML configuration for the diagnostics runner.
//!
//! Every section falls back to compiled-in defaults, so an empty file (or no
//! file at all) yields a working configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ice::TraversalMode;
use crate::probes::{ConnectivitySettings, QualitySettings, DEFAULT_REGIONS};

pub const CONFIG_ENV: &str = "PRECALL_CONFIG";
pub const LOCAL_CONFIG: &str = "precall.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub loopback: LoopbackConfig,
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub reachability: ReachabilityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl DiagnosticsConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded diagnostics configuration");
        Ok(config)
    }

    /// Try, in order: `explicit`, the `PRECALL_CONFIG` environment variable,
    /// `./precall.toml`, then compiled-in defaults. A source that fails to
    /// load is logged and skipped.
    pub fn load_or_default(explicit: Option<&Path>) -> Self {
        if let Some(path) = explicit {
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "config file could not be loaded, trying fallback");
                }
            }
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "PRECALL_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(path = %local.display(), error = %e, "local config could not be loaded, using defaults");
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    pub fn connectivity_settings(&self) -> ConnectivitySettings {
        ConnectivitySettings {
            modes: self.connectivity.modes.clone(),
            timeout: Duration::from_secs(self.connectivity.timeout_secs),
            flush_after: self.loopback.flush_after(),
            connection_timeout: self.loopback.connection_timeout(),
        }
    }

    pub fn quality_settings(&self) -> QualitySettings {
        QualitySettings {
            duration: Duration::from_secs(self.quality.duration_secs),
            sample_interval: Duration::from_millis(self.quality.sample_interval_ms.max(1)),
            rtt_window: (self.quality.rtt_window > 0).then_some(self.quality.rtt_window),
            flush_after: self.loopback.flush_after(),
            connection_timeout: self.loopback.connection_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// NAT-traversal credential service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            url: "https://prod-ks.pluot.blue/tt-150331.json".to_string(),
            timeout_secs: 10,
        }
    }
}

impl CredentialsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Loopback
// ---------------------------------------------------------------------------

/// Timers of each loopback pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Force-flush of buffered candidates when gathering never signals its end.
    pub flush_after_ms: u64,
    /// Upper bound on one connection attempt.
    pub connection_timeout_secs: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            flush_after_ms: 7_500,
            connection_timeout_secs: 15,
        }
    }
}

impl LoopbackConfig {
    pub fn flush_after(&self) -> Duration {
        Duration::from_millis(self.flush_after_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub modes: Vec<TraversalMode>,
    pub timeout_secs: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            modes: vec![TraversalMode::RelayOnly],
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub duration_secs: u64,
    pub sample_interval_ms: u64,
    /// Number of RTT samples kept for the max; 0 keeps all of them.
    pub rtt_window: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            duration_secs: 15,
            sample_interval_ms: 1_000,
            rtt_window: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReachabilityConfig {
    /// Base URL; the region name is appended as the last path segment.
    pub lookup_url: String,
    pub regions: Vec<String>,
    pub socket_timeout_secs: u64,
    pub grace_secs: u64,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            lookup_url: "https://gs.daily.co/rooms/check/test-rooms".to_string(),
            regions: DEFAULT_REGIONS.iter().map(|r| r.to_string()).collect(),
            socket_timeout_secs: 10,
            grace_secs: 15,
        }
    }
}

impl ReachabilityConfig {
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = DiagnosticsConfig::default();
        assert_eq!(cfg.credentials.timeout_secs, 10);
        assert_eq!(cfg.loopback.flush_after(), Duration::from_millis(7_500));
        assert_eq!(cfg.loopback.connection_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.connectivity.modes, vec![TraversalMode::RelayOnly]);
        assert_eq!(cfg.quality.duration_secs, 15);
        assert_eq!(cfg.reachability.regions.len(), 10);
        assert_eq!(cfg.reachability.grace(), Duration::from_secs(15));
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[credentials]
url = "https://turn.example.org/creds.json"
timeout_secs = 3

[loopback]
flush_after_ms = 2000
connection_timeout_secs = 5

[connectivity]
modes = ["all", "stun", "turn-udp", "turn-tcp", "turn-tls", "relay"]
timeout_secs = 20

[quality]
duration_secs = 30
sample_interval_ms = 500
rtt_window = 10

[reachability]
lookup_url = "https://gs.example.org/check"
regions = ["eu-west-2", "us-east-1"]
socket_timeout_secs = 4
grace_secs = 6

[logging]
level = "debug"
json = true
"#;
        let cfg: DiagnosticsConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.credentials.url, "https://turn.example.org/creds.json");
        assert_eq!(cfg.connectivity.modes.len(), 6);
        assert_eq!(cfg.connectivity.modes[1], TraversalMode::StunOnly);
        assert_eq!(cfg.reachability.regions, vec!["eu-west-2", "us-east-1"]);
        assert!(cfg.logging.json);

        let quality = cfg.quality_settings();
        assert_eq!(quality.duration, Duration::from_secs(30));
        assert_eq!(quality.sample_interval, Duration::from_millis(500));
        assert_eq!(quality.rtt_window, Some(10));
        assert_eq!(quality.connection_timeout, Duration::from_secs(5));

        let connectivity = cfg.connectivity_settings();
        assert_eq!(connectivity.timeout, Duration::from_secs(20));
        assert_eq!(connectivity.flush_after, Duration::from_millis(2000));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: DiagnosticsConfig = toml::from_str("[quality]\nduration_secs = 5\n").unwrap();
        assert_eq!(cfg.quality.duration_secs, 5);
        assert_eq!(cfg.quality.sample_interval_ms, 1_000);
        assert_eq!(cfg.quality_settings().rtt_window, None);
        assert_eq!(cfg.connectivity.timeout_secs, 30);
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let result = toml::from_str::<DiagnosticsConfig>("[connectivity]\nmodes = [\"carrier-pigeon\"]\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("precall.toml");
        std::fs::write(&path, "[reachability]\ngrace_secs = 2\n").unwrap();

        let cfg = DiagnosticsConfig::load(&path).unwrap();
        assert_eq!(cfg.reachability.grace_secs, 2);

        let cfg = DiagnosticsConfig::load_or_default(Some(path.as_path()));
        assert_eq!(cfg.reachability.grace_secs, 2);
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(DiagnosticsConfig::load(Path::new("/nonexistent/precall.toml")).is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let cfg = DiagnosticsConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let back: DiagnosticsConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.connectivity.modes, cfg.connectivity.modes);
        assert_eq!(back.reachability.regions, cfg.reachability.regions);
    }
}
