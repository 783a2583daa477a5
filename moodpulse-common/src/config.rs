//! Configuration loading and root folder resolution
//!
//! Configuration is bootstrap-only: it is read once at process start and shared
//! immutably for the lifetime of the run. Every option has a built-in default, so a
//! missing TOML file is a warning, not a startup failure.
//!
//! # Root folder priority
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`MOODPULSE_ROOT`)
//! 3. `root_folder` key of the TOML config file
//! 4. OS-dependent compiled default (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming the root folder
pub const ROOT_ENV_VAR: &str = "MOODPULSE_ROOT";

/// Default config file name inside the root folder
pub const CONFIG_FILE_NAME: &str = "moodpulse.toml";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Root folder for the database (optional, see module docs for priority)
    pub root_folder: Option<PathBuf>,

    /// Database file name, relative to the root folder
    pub database_file: Option<String>,

    pub logging: LoggingConfig,
    pub resilience: ResilienceConfig,
    pub lifecycle: LifecycleConfig,
    pub scheduler: SchedulerConfig,
    pub pipeline: PipelineConfig,
    pub cache: CacheConfig,
    pub source: SourceConfig,
    pub classifier: ClassifierConfig,

    /// Entity registry override; empty means the built-in registry
    pub entities: Vec<EntityConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Circuit breaker and retry options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Consecutive failures that open a collaborator's circuit
    pub fail_max: u32,
    /// Seconds an open circuit waits before permitting a half-open probe
    pub reset_timeout_secs: u64,
    /// Tries per logical call (first attempt included)
    pub max_attempts: u32,
    /// First backoff delay between attempts
    pub backoff_initial_secs: u64,
    /// Backoff ceiling
    pub backoff_max_secs: u64,
    /// Deadline applied to each individual collaborator call
    pub stage_timeout_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            fail_max: 5,
            reset_timeout_secs: 60,
            max_attempts: 3,
            backoff_initial_secs: 4,
            backoff_max_secs: 10,
            stage_timeout_secs: 90,
        }
    }
}

impl ResilienceConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

/// Analysis capability lifecycle options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Unload the capability after this many idle seconds
    pub idle_timeout_secs: u64,
    /// How often the idle sweep runs
    pub sweep_interval_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 600,
            sweep_interval_secs: 60,
        }
    }
}

impl LifecycleConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Batch size tier: at least `min_urgent` urgent entities → `batch` entities per cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTier {
    pub min_urgent: usize,
    pub batch: usize,
}

/// Sleep tier: at least `min_urgent` urgent entities → sleep `secs` between cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalTier {
    pub min_urgent: usize,
    pub secs: u64,
}

/// Entity scheduler options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Priority score above which an entity counts as urgent
    pub urgent_score: f64,
    /// Every entity below this data need → the cycle is skipped
    pub data_need_low_water: f64,
    /// Batch positions reserved for the circular rotation pointer
    pub rotation_slots: usize,
    /// Batch size tiers, checked in order (descending `min_urgent`)
    pub urgent_thresholds: Vec<BatchTier>,
    /// Batch size when no tier matches
    pub maintenance_batch: usize,
    /// Sleep tiers, checked in order (descending `min_urgent`)
    pub interval_thresholds: Vec<IntervalTier>,
    /// Sleep when no tier matches, also used for skipped cycles
    pub idle_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            urgent_score: 15.0,
            data_need_low_water: 2.0,
            rotation_slots: 2,
            urgent_thresholds: vec![
                BatchTier { min_urgent: 11, batch: 10 },
                BatchTier { min_urgent: 6, batch: 6 },
                BatchTier { min_urgent: 1, batch: 3 },
            ],
            maintenance_batch: 2,
            interval_thresholds: vec![
                IntervalTier { min_urgent: 20, secs: 30 },
                IntervalTier { min_urgent: 10, secs: 60 },
                IntervalTier { min_urgent: 5, secs: 120 },
            ],
            idle_interval_secs: 600,
        }
    }
}

/// Pipeline options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Parallel fetch workers within the Fetching stage
    pub fetch_workers: usize,
    /// Most recent samples considered per entity during aggregation
    pub sample_limit: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_workers: 4,
            sample_limit: 1000,
        }
    }
}

/// Response cache options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_secs: u64,
    pub consensus_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            consensus_ttl_secs: 120,
        }
    }
}

/// Upstream content source options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Base URL of the content source; None disables fetching
    pub base_url: Option<String>,
    pub request_timeout_secs: u64,
    /// Minimum spacing between two requests to the source
    pub min_request_interval_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout_secs: 30,
            min_request_interval_ms: 1000,
        }
    }
}

/// Emotion classifier options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Lexicon file; None uses the built-in lexicon
    pub lexicon_path: Option<PathBuf>,
}

/// Registry override entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityConfig {
    pub id: String,
    #[serde(default = "default_importance")]
    pub importance: f64,
}

fn default_importance() -> f64 {
    2.0
}

impl TomlConfig {
    /// Validate option ranges and tier ordering
    pub fn validate(&self) -> Result<()> {
        let r = &self.resilience;
        if r.fail_max == 0 {
            return Err(Error::Config("resilience.fail_max must be at least 1".to_string()));
        }
        if r.max_attempts == 0 {
            return Err(Error::Config("resilience.max_attempts must be at least 1".to_string()));
        }
        if r.backoff_initial_secs > r.backoff_max_secs {
            return Err(Error::Config(format!(
                "resilience.backoff_initial_secs ({}) exceeds backoff_max_secs ({})",
                r.backoff_initial_secs, r.backoff_max_secs
            )));
        }
        if r.stage_timeout_secs == 0 {
            return Err(Error::Config("resilience.stage_timeout_secs must be positive".to_string()));
        }

        let s = &self.scheduler;
        if s.maintenance_batch == 0 {
            return Err(Error::Config("scheduler.maintenance_batch must be at least 1".to_string()));
        }
        if s.rotation_slots == 0 {
            return Err(Error::Config(
                "scheduler.rotation_slots must be at least 1 so every entity is revisited".to_string(),
            ));
        }
        if !s.urgent_score.is_finite() || s.urgent_score < 0.0 {
            return Err(Error::Config("scheduler.urgent_score must be a non-negative number".to_string()));
        }
        if !strictly_descending(s.urgent_thresholds.iter().map(|t| t.min_urgent)) {
            return Err(Error::Config(
                "scheduler.urgent_thresholds must be ordered by strictly descending min_urgent".to_string(),
            ));
        }
        if s.urgent_thresholds.iter().any(|t| t.batch == 0) {
            return Err(Error::Config("scheduler.urgent_thresholds batch sizes must be positive".to_string()));
        }
        if !strictly_descending(s.interval_thresholds.iter().map(|t| t.min_urgent)) {
            return Err(Error::Config(
                "scheduler.interval_thresholds must be ordered by strictly descending min_urgent".to_string(),
            ));
        }

        if self.pipeline.fetch_workers == 0 {
            return Err(Error::Config("pipeline.fetch_workers must be at least 1".to_string()));
        }
        if self.pipeline.sample_limit == 0 {
            return Err(Error::Config("pipeline.sample_limit must be at least 1".to_string()));
        }
        if self.lifecycle.sweep_interval_secs == 0 {
            return Err(Error::Config("lifecycle.sweep_interval_secs must be positive".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for entity in &self.entities {
            if entity.id.trim().is_empty() {
                return Err(Error::Config("entities: id must not be empty".to_string()));
            }
            if !(0.0..=10.0).contains(&entity.importance) {
                return Err(Error::Config(format!(
                    "entities: importance for '{}' must be within 0-10",
                    entity.id
                )));
            }
            if !seen.insert(entity.id.as_str()) {
                return Err(Error::Config(format!("entities: duplicate id '{}'", entity.id)));
            }
        }

        Ok(())
    }

    /// Database file name (default: moodpulse.db)
    pub fn database_file_name(&self) -> &str {
        self.database_file.as_deref().unwrap_or("moodpulse.db")
    }
}

fn strictly_descending(values: impl Iterator<Item = usize>) -> bool {
    let mut prev: Option<usize> = None;
    for v in values {
        if let Some(p) = prev {
            if v >= p {
                return false;
            }
        }
        prev = Some(v);
    }
    true
}

/// Load and validate a TOML config file
///
/// A missing file is not an error: a warning is logged and defaults are used.
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        warn!(
            "Config file not found at {}, using built-in defaults",
            path.display()
        );
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed ({}): {}", path.display(), e)))?;
    config.validate()?;

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Write a TOML config file (used to seed a default config)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    // Write to a sibling temp file first so readers never see a partial file
    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Resolves the root folder following the documented priority order
pub struct RootFolderResolver {
    cli_arg: Option<PathBuf>,
    toml_root: Option<PathBuf>,
}

impl RootFolderResolver {
    pub fn new(cli_arg: Option<PathBuf>) -> Self {
        Self {
            cli_arg,
            toml_root: None,
        }
    }

    /// Supply the `root_folder` key from an already-loaded TOML config
    pub fn with_toml_root(mut self, toml_root: Option<PathBuf>) -> Self {
        self.toml_root = toml_root;
        self
    }

    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = &self.cli_arg {
            return path.clone();
        }

        if let Ok(path) = std::env::var(ROOT_ENV_VAR) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }

        if let Some(path) = &self.toml_root {
            return path.clone();
        }

        default_root_folder()
    }
}

/// Get OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("moodpulse"))
        .unwrap_or_else(|| PathBuf::from("./moodpulse_data"))
}

/// Creates the root folder and derives file paths inside it
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    pub fn ensure_directory_exists(&self) -> Result<()> {
        if !self.root_folder.exists() {
            std::fs::create_dir_all(&self.root_folder)?;
            info!("Created root folder: {}", self.root_folder.display());
        }
        Ok(())
    }

    pub fn root_folder(&self) -> &Path {
        &self.root_folder
    }

    pub fn database_path(&self, config: &TomlConfig) -> PathBuf {
        self.root_folder.join(config.database_file_name())
    }

    pub fn config_path(&self) -> PathBuf {
        self.root_folder.join(CONFIG_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = TomlConfig::default();
        config.validate().unwrap();
        assert_eq!(config.resilience.fail_max, 5);
        assert_eq!(config.resilience.reset_timeout(), Duration::from_secs(60));
        assert_eq!(config.lifecycle.idle_timeout(), Duration::from_secs(600));
        assert_eq!(config.scheduler.maintenance_batch, 2);
        assert_eq!(config.database_file_name(), "moodpulse.db");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: TomlConfig = toml::from_str(
            r#"
            [resilience]
            fail_max = 2

            [[entities]]
            id = "Atlantis"
            "#,
        )
        .unwrap();

        assert_eq!(config.resilience.fail_max, 2);
        assert_eq!(config.resilience.max_attempts, 3);
        assert_eq!(config.entities.len(), 1);
        assert_eq!(config.entities[0].importance, 2.0);
        assert_eq!(config.scheduler.urgent_thresholds.len(), 3);
    }

    #[test]
    fn test_validate_rejects_unordered_tiers() {
        let mut config = TomlConfig::default();
        config.scheduler.interval_thresholds = vec![
            IntervalTier { min_urgent: 5, secs: 120 },
            IntervalTier { min_urgent: 10, secs: 60 },
        ];
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_fail_max() {
        let mut config = TomlConfig::default();
        config.resilience.fail_max = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_entities() {
        let mut config = TomlConfig::default();
        config.entities = vec![
            EntityConfig { id: "Chile".to_string(), importance: 3.0 },
            EntityConfig { id: "Chile".to_string(), importance: 4.0 },
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_toml_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.pipeline.fetch_workers, 4);
    }

    #[test]
    fn test_write_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);

        let mut config = TomlConfig::default();
        config.lifecycle.idle_timeout_secs = 42;
        write_toml_config(&config, &path).unwrap();

        let loaded = load_toml_config(&path).unwrap();
        assert_eq!(loaded.lifecycle.idle_timeout_secs, 42);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "resilience = [").unwrap();
        assert!(matches!(load_toml_config(&path), Err(Error::Config(_))));
    }

    #[test]
    #[serial]
    fn test_resolver_cli_wins_over_env() {
        std::env::set_var(ROOT_ENV_VAR, "/from/env");
        let resolver = RootFolderResolver::new(Some(PathBuf::from("/from/cli")));
        assert_eq!(resolver.resolve(), PathBuf::from("/from/cli"));
        std::env::remove_var(ROOT_ENV_VAR);
    }

    #[test]
    #[serial]
    fn test_resolver_env_wins_over_toml() {
        std::env::set_var(ROOT_ENV_VAR, "/from/env");
        let resolver = RootFolderResolver::new(None).with_toml_root(Some(PathBuf::from("/from/toml")));
        assert_eq!(resolver.resolve(), PathBuf::from("/from/env"));
        std::env::remove_var(ROOT_ENV_VAR);
    }

    #[test]
    #[serial]
    fn test_resolver_falls_back_to_default() {
        std::env::remove_var(ROOT_ENV_VAR);
        let resolver = RootFolderResolver::new(None);
        assert_eq!(resolver.resolve(), default_root_folder());
    }

    #[test]
    fn test_initializer_creates_directory() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("pulse");
        let initializer = RootFolderInitializer::new(root.clone());
        initializer.ensure_directory_exists().unwrap();
        assert!(root.is_dir());
        assert_eq!(
            initializer.database_path(&TomlConfig::default()),
            root.join("moodpulse.db")
        );
    }
}
