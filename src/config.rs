//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfigSpec {
    /// Quota and watermark configuration.
    pub quota: Option<QuotaSpec>,
    /// Checkpoint configuration.
    pub checkpoint: Option<CheckpointSpec>,
    /// Item eviction configuration.
    pub eviction: Option<EvictionSpec>,
    /// Durability configuration.
    pub durability: Option<DurabilitySpec>,
}

impl EngineConfigSpec {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `OXIBUCKET_CONFIG` env var (if set),
    /// then apply `OXIBUCKET__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let config_path = env::var("OXIBUCKET_CONFIG").ok();
        let mut config = match config_path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("OXIBUCKET__") {
                continue;
            }
            let path = key["OXIBUCKET__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["quota", "max_size"] => {
                    self.quota_mut().max_size = Some(parse_value(&key, &value)?);
                }
                ["quota", "mem_low_wat"] => {
                    self.quota_mut().mem_low_wat = Some(parse_value(&key, &value)?);
                }
                ["quota", "mem_high_wat"] => {
                    self.quota_mut().mem_high_wat = Some(parse_value(&key, &value)?);
                }
                ["quota", "max_vbuckets"] => {
                    self.quota_mut().max_vbuckets = Some(parse_value(&key, &value)?);
                }
                ["checkpoint", "chk_max_items"] => {
                    self.checkpoint_mut().chk_max_items = Some(parse_value(&key, &value)?);
                }
                ["checkpoint", "chk_period_secs"] => {
                    self.checkpoint_mut().chk_period_secs = Some(parse_value(&key, &value)?);
                }
                ["checkpoint", "chk_expel_enabled"] => {
                    self.checkpoint_mut().chk_expel_enabled = Some(parse_value(&key, &value)?);
                }
                ["checkpoint", "cursor_dropping_upper_mark"] => {
                    self.checkpoint_mut().cursor_dropping_upper_mark =
                        Some(parse_value(&key, &value)?);
                }
                ["checkpoint", "cursor_dropping_lower_mark"] => {
                    self.checkpoint_mut().cursor_dropping_lower_mark =
                        Some(parse_value(&key, &value)?);
                }
                ["checkpoint", "cursor_dropping_checkpoint_mem_upper_mark"] => {
                    self.checkpoint_mut().cursor_dropping_checkpoint_mem_upper_mark =
                        Some(parse_value(&key, &value)?);
                }
                ["checkpoint", "cursor_dropping_checkpoint_mem_lower_mark"] => {
                    self.checkpoint_mut().cursor_dropping_checkpoint_mem_lower_mark =
                        Some(parse_value(&key, &value)?);
                }
                ["eviction", "item_eviction_age_percentage"] => {
                    self.eviction_mut().item_eviction_age_percentage =
                        Some(parse_value(&key, &value)?);
                }
                ["eviction", "item_eviction_freq_counter_age_threshold"] => {
                    self.eviction_mut().item_eviction_freq_counter_age_threshold =
                        Some(parse_value(&key, &value)?);
                }
                ["eviction", "item_freq_decayer_percent"] => {
                    self.eviction_mut().item_freq_decayer_percent =
                        Some(parse_value(&key, &value)?);
                }
                ["eviction", "pager_active_vb_pcnt"] => {
                    self.eviction_mut().pager_active_vb_pcnt = Some(parse_value(&key, &value)?);
                }
                ["durability", "sync_write_timeout_ms"] => {
                    self.durability_mut().sync_write_timeout_ms = Some(parse_value(&key, &value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    /// Build a resolved [`EngineConfig`] using defaults plus overrides.
    pub fn resolve(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        if let Some(quota) = &self.quota {
            quota.apply_to(&mut config);
        }
        if let Some(checkpoint) = &self.checkpoint {
            checkpoint.apply_to(&mut config);
        }
        if let Some(eviction) = &self.eviction {
            eviction.apply_to(&mut config);
        }
        if let Some(durability) = &self.durability {
            durability.apply_to(&mut config);
        }
        config
    }

    fn quota_mut(&mut self) -> &mut QuotaSpec {
        self.quota.get_or_insert_with(QuotaSpec::default)
    }

    fn checkpoint_mut(&mut self) -> &mut CheckpointSpec {
        self.checkpoint.get_or_insert_with(CheckpointSpec::default)
    }

    fn eviction_mut(&mut self) -> &mut EvictionSpec {
        self.eviction.get_or_insert_with(EvictionSpec::default)
    }

    fn durability_mut(&mut self) -> &mut DurabilitySpec {
        self.durability.get_or_insert_with(DurabilitySpec::default)
    }
}

/// Quota and watermark overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuotaSpec {
    /// Bucket quota in bytes.
    pub max_size: Option<u64>,
    /// Low watermark as a fraction of the quota.
    pub mem_low_wat: Option<f64>,
    /// High watermark as a fraction of the quota.
    pub mem_high_wat: Option<f64>,
    /// Number of vbuckets the engine hosts.
    pub max_vbuckets: Option<usize>,
}

impl QuotaSpec {
    fn apply_to(&self, config: &mut EngineConfig) {
        if let Some(value) = self.max_size {
            config.max_size = value;
        }
        if let Some(value) = self.mem_low_wat {
            config.mem_low_wat = value.clamp(0.0, 1.0);
        }
        if let Some(value) = self.mem_high_wat {
            config.mem_high_wat = value.clamp(0.0, 1.0);
        }
        if let Some(value) = self.max_vbuckets {
            config.max_vbuckets = value.max(1);
        }
    }
}

/// Checkpoint and cursor-dropping overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckpointSpec {
    /// Maximum non-meta items in an open checkpoint before rollover.
    pub chk_max_items: Option<usize>,
    /// Maximum age of an open checkpoint before rollover, in seconds.
    pub chk_period_secs: Option<u64>,
    /// Whether expelling of cursor-passed items is enabled.
    pub chk_expel_enabled: Option<bool>,
    /// Total-memory mark (percent of quota) that triggers cursor dropping.
    pub cursor_dropping_upper_mark: Option<u8>,
    /// Total-memory mark (percent of quota) cursor dropping recovers down to.
    pub cursor_dropping_lower_mark: Option<u8>,
    /// Checkpoint-memory mark (percent of quota) that triggers recovery.
    pub cursor_dropping_checkpoint_mem_upper_mark: Option<u8>,
    /// Checkpoint-memory mark (percent of quota) recovery aims for.
    pub cursor_dropping_checkpoint_mem_lower_mark: Option<u8>,
}

impl CheckpointSpec {
    fn apply_to(&self, config: &mut EngineConfig) {
        if let Some(value) = self.chk_max_items {
            config.chk_max_items = value.max(2);
        }
        if let Some(value) = self.chk_period_secs {
            config.chk_period = Duration::from_secs(value);
        }
        if let Some(value) = self.chk_expel_enabled {
            config.chk_expel_enabled = value;
        }
        if let Some(value) = self.cursor_dropping_upper_mark {
            config.cursor_dropping_upper_mark = value.min(100);
        }
        if let Some(value) = self.cursor_dropping_lower_mark {
            config.cursor_dropping_lower_mark = value.min(100);
        }
        if let Some(value) = self.cursor_dropping_checkpoint_mem_upper_mark {
            config.cursor_dropping_checkpoint_mem_upper_mark = value.min(100);
        }
        if let Some(value) = self.cursor_dropping_checkpoint_mem_lower_mark {
            config.cursor_dropping_checkpoint_mem_lower_mark = value.min(100);
        }
    }
}

/// Item eviction overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EvictionSpec {
    /// Percentile of the age histogram used for the age threshold.
    pub item_eviction_age_percentage: Option<u8>,
    /// Frequency below which age is ignored when deciding eviction.
    pub item_eviction_freq_counter_age_threshold: Option<u8>,
    /// Percent by which the frequency decayer reduces counters.
    pub item_freq_decayer_percent: Option<u8>,
    /// Active-vbucket share of eviction work, as a percentage (50 = equal).
    pub pager_active_vb_pcnt: Option<u8>,
}

impl EvictionSpec {
    fn apply_to(&self, config: &mut EngineConfig) {
        if let Some(value) = self.item_eviction_age_percentage {
            config.item_eviction_age_percentage = value.min(100);
        }
        if let Some(value) = self.item_eviction_freq_counter_age_threshold {
            config.item_eviction_freq_counter_age_threshold = value;
        }
        if let Some(value) = self.item_freq_decayer_percent {
            config.item_freq_decayer_percent = value.min(100);
        }
        if let Some(value) = self.pager_active_vb_pcnt {
            config.pager_active_vb_pcnt = value.min(100);
        }
    }
}

/// Durability overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DurabilitySpec {
    /// Default sync-write timeout in milliseconds (0 disables the timeout).
    pub sync_write_timeout_ms: Option<u64>,
}

impl DurabilitySpec {
    fn apply_to(&self, config: &mut EngineConfig) {
        if let Some(value) = self.sync_write_timeout_ms {
            config.sync_write_timeout = if value == 0 {
                None
            } else {
                Some(Duration::from_millis(value))
            };
        }
    }
}

/// Resolved engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bucket quota in bytes.
    pub max_size: u64,
    /// Low watermark as a fraction of the quota.
    pub mem_low_wat: f64,
    /// High watermark as a fraction of the quota.
    pub mem_high_wat: f64,
    /// Number of vbuckets the engine hosts.
    pub max_vbuckets: usize,
    /// Maximum non-meta items in an open checkpoint before rollover.
    pub chk_max_items: usize,
    /// Maximum age of an open checkpoint before rollover.
    pub chk_period: Duration,
    /// Whether expelling of cursor-passed items is enabled.
    pub chk_expel_enabled: bool,
    /// Total-memory mark (percent of quota) that triggers cursor dropping.
    pub cursor_dropping_upper_mark: u8,
    /// Total-memory mark (percent of quota) cursor dropping recovers down to.
    pub cursor_dropping_lower_mark: u8,
    /// Checkpoint-memory mark (percent of quota) that triggers recovery.
    pub cursor_dropping_checkpoint_mem_upper_mark: u8,
    /// Checkpoint-memory mark (percent of quota) recovery aims for.
    pub cursor_dropping_checkpoint_mem_lower_mark: u8,
    /// Percentile of the age histogram used for the age threshold.
    pub item_eviction_age_percentage: u8,
    /// Frequency below which age is ignored when deciding eviction.
    pub item_eviction_freq_counter_age_threshold: u8,
    /// Percent by which the frequency decayer reduces counters.
    pub item_freq_decayer_percent: u8,
    /// Active-vbucket share of eviction work, as a percentage (50 = equal).
    pub pager_active_vb_pcnt: u8,
    /// Default sync-write timeout; `None` disables timeouts.
    pub sync_write_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_size: 256 * 1024 * 1024,
            mem_low_wat: 0.75,
            mem_high_wat: 0.85,
            max_vbuckets: 64,
            chk_max_items: 10_000,
            chk_period: Duration::from_secs(5),
            chk_expel_enabled: true,
            cursor_dropping_upper_mark: 95,
            cursor_dropping_lower_mark: 80,
            cursor_dropping_checkpoint_mem_upper_mark: 50,
            cursor_dropping_checkpoint_mem_lower_mark: 30,
            item_eviction_age_percentage: 30,
            item_eviction_freq_counter_age_threshold: 1,
            item_freq_decayer_percent: 50,
            pager_active_vb_pcnt: 40,
            sync_write_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl EngineConfig {
    /// Low watermark in bytes.
    pub fn mem_low_wat_bytes(&self) -> u64 {
        (self.max_size as f64 * self.mem_low_wat) as u64
    }

    /// High watermark in bytes.
    pub fn mem_high_wat_bytes(&self) -> u64 {
        (self.max_size as f64 * self.mem_high_wat) as u64
    }

    /// Cursor-dropping upper threshold in bytes.
    pub fn cursor_dropping_upper_bytes(&self) -> u64 {
        self.max_size * u64::from(self.cursor_dropping_upper_mark) / 100
    }

    /// Cursor-dropping lower threshold in bytes.
    pub fn cursor_dropping_lower_bytes(&self) -> u64 {
        self.max_size * u64::from(self.cursor_dropping_lower_mark) / 100
    }

    /// Checkpoint-memory upper threshold in bytes.
    pub fn checkpoint_mem_upper_bytes(&self) -> u64 {
        self.max_size * u64::from(self.cursor_dropping_checkpoint_mem_upper_mark) / 100
    }

    /// Checkpoint-memory lower threshold in bytes.
    pub fn checkpoint_mem_lower_bytes(&self) -> u64 {
        self.max_size * u64::from(self.cursor_dropping_checkpoint_mem_lower_mark) / 100
    }

    /// Active-vbucket eviction bias derived from `pager_active_vb_pcnt`.
    pub fn active_bias(&self) -> f64 {
        f64::from(self.pager_active_vb_pcnt) / 50.0
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_env_overrides_quota_and_checkpoint() {
        let _guard = ENV_LOCK.lock().unwrap();

        env::set_var("OXIBUCKET__quota__max_size", "1048576");
        env::set_var("OXIBUCKET__checkpoint__chk_max_items", "500");
        env::set_var("OXIBUCKET__checkpoint__chk_expel_enabled", "false");

        let mut config = EngineConfigSpec::default();
        config.apply_env_overrides().unwrap();

        env::remove_var("OXIBUCKET__quota__max_size");
        env::remove_var("OXIBUCKET__checkpoint__chk_max_items");
        env::remove_var("OXIBUCKET__checkpoint__chk_expel_enabled");

        let quota = config.quota.unwrap();
        assert_eq!(quota.max_size, Some(1048576));

        let checkpoint = config.checkpoint.unwrap();
        assert_eq!(checkpoint.chk_max_items, Some(500));
        assert_eq!(checkpoint.chk_expel_enabled, Some(false));
    }

    #[test]
    fn test_env_override_unknown_key() {
        let _guard = ENV_LOCK.lock().unwrap();

        env::set_var("OXIBUCKET__quota__bogus", "1");
        let mut config = EngineConfigSpec::default();
        let result = config.apply_env_overrides();
        env::remove_var("OXIBUCKET__quota__bogus");

        assert!(matches!(result, Err(ConfigError::UnknownKey(_))));
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "[quota]\nmax_size = 2097152\n\n\
             [checkpoint]\ncursor_dropping_upper_mark = 90\n\n\
             [eviction]\npager_active_vb_pcnt = 30\n\n\
             [durability]\nsync_write_timeout_ms = 1000\n"
        )
        .unwrap();

        let spec = EngineConfigSpec::load_from_path(file.path()).unwrap();
        let config = spec.resolve();
        assert_eq!(config.max_size, 2097152);
        assert_eq!(config.cursor_dropping_upper_mark, 90);
        assert_eq!(config.pager_active_vb_pcnt, 30);
        assert_eq!(config.sync_write_timeout, Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_resolve_defaults() {
        let config = EngineConfigSpec::default().resolve();
        assert!(config.chk_max_items > 0);
        assert!(config.cursor_dropping_upper_mark > config.cursor_dropping_lower_mark);
        assert!(config.mem_high_wat > config.mem_low_wat);
        assert!(config.chk_expel_enabled);
    }

    #[test]
    fn test_threshold_byte_helpers() {
        let config = EngineConfig {
            max_size: 1000,
            ..EngineConfig::default()
        };
        assert_eq!(config.cursor_dropping_upper_bytes(), 950);
        assert_eq!(config.cursor_dropping_lower_bytes(), 800);
        assert_eq!(config.checkpoint_mem_upper_bytes(), 500);
        assert_eq!(config.checkpoint_mem_lower_bytes(), 300);
        assert_eq!(config.mem_low_wat_bytes(), 750);
        assert_eq!(config.mem_high_wat_bytes(), 850);
    }

    #[test]
    fn test_sync_write_timeout_zero_disables() {
        let spec = DurabilitySpec {
            sync_write_timeout_ms: Some(0),
        };
        let mut config = EngineConfig::default();
        spec.apply_to(&mut config);
        assert_eq!(config.sync_write_timeout, None);
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let result = EngineConfigSpec::load_from_path("/nonexistent/config.toml");
        assert!(result.is_err());
    }
}
