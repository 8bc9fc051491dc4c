//! Engine configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/tether/config.toml)
//! 3. Environment variables (TETHER_* prefix)
//!
//! Environment variables take precedence over config file values.
//! All tunables are immutable once an engine has been constructed from them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable prefix
const ENV_PREFIX: &str = "TETHER";

/// Well-known service endpoints probed by the health monitor
pub const DEFAULT_ENDPOINTS: &[&str] = &[
    "https://grpc.production.xmtp.network:443",
    "https://grpc.dev.xmtp.network:443",
];

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Tracing filter directive (e.g. "tether_core=debug")
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// Network health monitor tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Endpoints probed on every cycle
    pub endpoints: Vec<String>,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Probes slower than this are unhealthy even if they succeed
    pub max_healthy_latency_ms: u64,
    pub stability_poll_ms: u64,
    /// Round-trip time above which the network is not considered stable
    pub max_stable_rtt_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            endpoints: DEFAULT_ENDPOINTS.iter().map(|s| s.to_string()).collect(),
            probe_interval_ms: 30_000,
            probe_timeout_ms: 8_000,
            max_healthy_latency_ms: 10_000,
            stability_poll_ms: 1_000,
            max_stable_rtt_ms: 2_000,
        }
    }
}

impl HealthConfig {
    /// Config with no endpoints (endpoint health is then vacuously satisfied)
    pub fn without_endpoints() -> Self {
        Self {
            endpoints: Vec::new(),
            ..Self::default()
        }
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn max_healthy_latency(&self) -> Duration {
        Duration::from_millis(self.max_healthy_latency_ms)
    }

    pub fn stability_poll(&self) -> Duration {
        Duration::from_millis(self.stability_poll_ms)
    }
}

/// Stream lifecycle tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Stream-open timeout with no prior errors
    pub creation_timeout_ms: u64,
    /// Added to the open timeout per consecutive error
    pub creation_timeout_step_ms: u64,
    pub max_creation_timeout_ms: u64,
    /// Open attempts per start before the failure is surfaced
    pub creation_attempts: u32,
    /// Linear backoff unit between open attempts
    pub creation_retry_delay_ms: u64,
    pub race_cooldown_ms: u64,
    pub fatal_recovery_delay_ms: u64,
    pub restart_base_delay_ms: u64,
    pub restart_max_delay_ms: u64,
    /// Restarts allowed without a clean message before the stream gives up
    pub max_restarts: u32,
    /// Consecutive errors at which a restart becomes a full recreation
    pub recreate_threshold: u32,
    pub health_check_interval_ms: u64,
    pub stale_timeout_ms: u64,
    /// Bounded wait for network stability before a deferred or recreated start
    pub stability_timeout_ms: u64,
    /// Recent message ring buffer capacity
    pub buffer_size: usize,
    /// Hard cap on remembered message ids
    pub max_processed_ids: usize,
    /// Age after which a remembered message id is pruned
    pub processed_id_ttl_ms: u64,
    /// Maximum times a welcome/system message id is reprocessed
    pub max_special_retries: u32,
    /// Minimum gap between resyncs triggered by semantic errors
    pub special_error_cooldown_ms: u64,
    /// Consecutive decode/epoch failures before escalating to a stream error
    pub max_decode_failures: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            creation_timeout_ms: 30_000,
            creation_timeout_step_ms: 10_000,
            max_creation_timeout_ms: 60_000,
            creation_attempts: 3,
            creation_retry_delay_ms: 1_000,
            race_cooldown_ms: 5_000,
            fatal_recovery_delay_ms: 10_000,
            restart_base_delay_ms: 2_000,
            restart_max_delay_ms: 30_000,
            max_restarts: 5,
            recreate_threshold: 2,
            health_check_interval_ms: 30_000,
            stale_timeout_ms: 120_000,
            stability_timeout_ms: 30_000,
            buffer_size: 500,
            max_processed_ids: 5_000,
            processed_id_ttl_ms: 600_000,
            max_special_retries: 3,
            special_error_cooldown_ms: 5_000,
            max_decode_failures: 5,
        }
    }
}

impl StreamConfig {
    /// Stream-open timeout for the given error count (grows linearly, capped)
    pub fn creation_timeout(&self, consecutive_errors: u32) -> Duration {
        let ms = self
            .creation_timeout_ms
            .saturating_add(self.creation_timeout_step_ms.saturating_mul(consecutive_errors as u64))
            .min(self.max_creation_timeout_ms);
        Duration::from_millis(ms)
    }

    pub fn creation_retry_delay(&self) -> Duration {
        Duration::from_millis(self.creation_retry_delay_ms)
    }

    pub fn race_cooldown(&self) -> Duration {
        Duration::from_millis(self.race_cooldown_ms)
    }

    pub fn fatal_recovery_delay(&self) -> Duration {
        Duration::from_millis(self.fatal_recovery_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_timeout_ms)
    }

    pub fn stability_timeout(&self) -> Duration {
        Duration::from_millis(self.stability_timeout_ms)
    }

    pub fn processed_id_ttl(&self) -> Duration {
        Duration::from_millis(self.processed_id_ttl_ms)
    }

    pub fn special_error_cooldown(&self) -> Duration {
        Duration::from_millis(self.special_error_cooldown_ms)
    }
}

/// Conversation discovery tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Full passes over the strategy cascade before falling back
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Per-strategy timeout
    pub strategy_timeout_ms: u64,
    /// Conservative timeout used by the VM-stabilized strategy
    pub conservative_timeout_ms: u64,
    /// Hard timeout for the single discovery call in the fallback cascade
    pub fallback_timeout_ms: u64,
    /// Delay between sync and list in the delayed-sync strategy
    pub propagation_delay_ms: u64,
    /// Sync repetitions in the forced multi-sync strategy
    pub forced_sync_count: u32,
    /// Rounds in the deep multi-round strategy
    pub deep_sync_rounds: u32,
    /// Pause that lets the peer client's VM settle between calls
    pub vm_stabilization_delay_ms: u64,
    /// Delay between listing calls in the identity-scoped strategy
    pub inter_call_delay_ms: u64,
    /// Bounded wait for network stability before discovery
    pub stability_timeout_ms: u64,
    /// Non-forced calls within this window return the last result
    pub result_ttl_ms: u64,
    /// Periodic discovery interval in the engine; 0 disables it
    pub interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            strategy_timeout_ms: 15_000,
            conservative_timeout_ms: 30_000,
            fallback_timeout_ms: 10_000,
            propagation_delay_ms: 2_000,
            forced_sync_count: 3,
            deep_sync_rounds: 3,
            vm_stabilization_delay_ms: 1_000,
            inter_call_delay_ms: 500,
            stability_timeout_ms: 15_000,
            result_ttl_ms: 30_000,
            interval_ms: 0,
        }
    }
}

impl DiscoveryConfig {
    pub fn strategy_timeout(&self) -> Duration {
        Duration::from_millis(self.strategy_timeout_ms)
    }

    pub fn conservative_timeout(&self) -> Duration {
        Duration::from_millis(self.conservative_timeout_ms)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }

    pub fn propagation_delay(&self) -> Duration {
        Duration::from_millis(self.propagation_delay_ms)
    }

    pub fn vm_stabilization_delay(&self) -> Duration {
        Duration::from_millis(self.vm_stabilization_delay_ms)
    }

    pub fn inter_call_delay(&self) -> Duration {
        Duration::from_millis(self.inter_call_delay_ms)
    }

    pub fn stability_timeout(&self) -> Duration {
        Duration::from_millis(self.stability_timeout_ms)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_millis(self.result_ttl_ms)
    }

    pub fn interval(&self) -> Option<Duration> {
        (self.interval_ms > 0).then(|| Duration::from_millis(self.interval_ms))
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (TETHER_ENDPOINTS, TETHER_LOG, ...)
    /// 2. Config file (~/.config/tether/config.toml or TETHER_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, preferring an explicit path when given
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(p) => Self::load_from_path(p),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // TETHER_ENDPOINTS
        if let Ok(val) = std::env::var(format!("{}_ENDPOINTS", ENV_PREFIX)) {
            self.health.endpoints = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        // TETHER_LOG
        if let Ok(val) = std::env::var(format!("{}_LOG", ENV_PREFIX)) {
            self.log_filter = if val.is_empty() { None } else { Some(val) };
        }

        // TETHER_MAX_RESTARTS
        if let Ok(val) = std::env::var(format!("{}_MAX_RESTARTS", ENV_PREFIX)) {
            if let Ok(n) = val.parse() {
                self.stream.max_restarts = n;
            }
        }

        // TETHER_DISCOVERY_MAX_ATTEMPTS
        if let Ok(val) = std::env::var(format!("{}_DISCOVERY_MAX_ATTEMPTS", ENV_PREFIX)) {
            if let Ok(n) = val.parse() {
                self.discovery.max_attempts = n;
            }
        }
    }

    /// Reject tunables the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.stream.creation_attempts == 0 {
            bail!("stream.creation_attempts must be at least 1");
        }
        if self.stream.recreate_threshold == 0 {
            bail!("stream.recreate_threshold must be at least 1");
        }
        if self.stream.restart_base_delay_ms > self.stream.restart_max_delay_ms {
            bail!("stream.restart_base_delay_ms must not exceed stream.restart_max_delay_ms");
        }
        if self.stream.buffer_size == 0 || self.stream.max_processed_ids == 0 {
            bail!("stream.buffer_size and stream.max_processed_ids must be non-zero");
        }
        if self.discovery.max_attempts == 0 {
            bail!("discovery.max_attempts must be at least 1");
        }
        if self.discovery.base_delay_ms > self.discovery.max_delay_ms {
            bail!("discovery.base_delay_ms must not exceed discovery.max_delay_ms");
        }
        if self.health.stability_poll_ms == 0 {
            bail!("health.stability_poll_ms must be non-zero");
        }
        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with TETHER_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tether")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "TETHER_ENDPOINTS",
        "TETHER_LOG",
        "TETHER_MAX_RESTARTS",
        "TETHER_DISCOVERY_MAX_ATTEMPTS",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.health.endpoints.len(), DEFAULT_ENDPOINTS.len());
        assert_eq!(config.stream.max_restarts, 5);
        assert_eq!(config.stream.recreate_threshold, 2);
        assert_eq!(config.discovery.max_attempts, 5);
        assert!(config.discovery.interval().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_creation_timeout_scales_and_caps() {
        let stream = StreamConfig::default();
        assert_eq!(stream.creation_timeout(0), Duration::from_secs(30));
        assert_eq!(stream.creation_timeout(1), Duration::from_secs(40));
        assert_eq!(stream.creation_timeout(3), Duration::from_secs(60));
        assert_eq!(stream.creation_timeout(50), Duration::from_secs(60));
    }

    #[test]
    fn test_env_override_endpoints() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("TETHER_ENDPOINTS", "https://a.example, https://b.example,,");
        config.apply_env_overrides();

        assert_eq!(
            config.health.endpoints,
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
    }

    #[test]
    fn test_env_override_numbers() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("TETHER_MAX_RESTARTS", "9");
        env::set_var("TETHER_DISCOVERY_MAX_ATTEMPTS", "2");
        config.apply_env_overrides();
        assert_eq!(config.stream.max_restarts, 9);
        assert_eq!(config.discovery.max_attempts, 2);

        // Unparseable values are ignored
        env::set_var("TETHER_MAX_RESTARTS", "lots");
        config.apply_env_overrides();
        assert_eq!(config.stream.max_restarts, 9);
    }

    #[test]
    fn test_env_override_log() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("TETHER_LOG", "tether_core=trace");
        config.apply_env_overrides();
        assert_eq!(config.log_filter.as_deref(), Some("tether_core=trace"));

        // Empty string clears it
        env::set_var("TETHER_LOG", "");
        config.apply_env_overrides();
        assert!(config.log_filter.is_none());
    }

    #[test]
    fn test_load_from_str_partial() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            log_filter = "debug"

            [health]
            endpoints = ["https://node.example"]

            [stream]
            max_restarts = 8
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.log_filter.as_deref(), Some("debug"));
        assert_eq!(config.health.endpoints, vec!["https://node.example".to_string()]);
        assert_eq!(config.health.probe_timeout_ms, 8_000);
        assert_eq!(config.stream.max_restarts, 8);
        assert_eq!(config.stream.race_cooldown_ms, 5_000);
    }

    #[test]
    fn test_validate_rejects_bad_tunables() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            [discovery]
            max_attempts = 0
        "#;
        assert!(Config::load_from_str(toml).is_err());

        let toml = r#"
            [stream]
            restart_base_delay_ms = 60000
            restart_max_delay_ms = 1000
        "#;
        assert!(Config::load_from_str(toml).is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let _guard = EnvGuard::new(ENV_VARS);

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.health.endpoints = vec!["https://saved.example".to_string()];
        config.discovery.interval_ms = 45_000;
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.health.endpoints, config.health.endpoints);
        assert_eq!(loaded.discovery.interval(), Some(Duration::from_secs(45)));
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);

        let path = PathBuf::from("/nonexistent/tether/config.toml");
        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.stream.max_restarts, 5);
    }
}
