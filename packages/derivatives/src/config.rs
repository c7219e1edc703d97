use common::{RetryPolicy, StorageConfig};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::lifecycle::{LifecycleDirectives, TimingDirective};

/// Bounds on the retry loops used while persisting derivatives.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct PersistenceConfig {
    /// Attempts to resolve a duplicate (asset, key) insert by updating the
    /// existing row. Exhausting them is an error. Default: 3.
    #[serde(default = "default_unique_violation_attempts")]
    pub unique_violation_attempts: u32,
    /// Commits attempted when concurrent writers keep moving the asset's
    /// version. Default: 5.
    #[serde(default = "default_max_commit_attempts")]
    pub max_commit_attempts: u32,
    /// Base backoff between conflicting commits. Default: 10ms.
    #[serde(default = "default_conflict_base_delay_ms")]
    pub conflict_base_delay_ms: u64,
    /// Maximum backoff between conflicting commits. Default: 500ms.
    #[serde(default = "default_conflict_max_delay_ms")]
    pub conflict_max_delay_ms: u64,
}

fn default_unique_violation_attempts() -> u32 {
    3
}
fn default_max_commit_attempts() -> u32 {
    5
}
fn default_conflict_base_delay_ms() -> u64 {
    10
}
fn default_conflict_max_delay_ms() -> u64 {
    500
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            unique_violation_attempts: default_unique_violation_attempts(),
            max_commit_attempts: default_max_commit_attempts(),
            conflict_base_delay_ms: default_conflict_base_delay_ms(),
            conflict_max_delay_ms: default_conflict_max_delay_ms(),
        }
    }
}

impl PersistenceConfig {
    pub fn unique_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.unique_violation_attempts)
    }

    pub fn commit_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_commit_attempts)
            .with_backoff(self.conflict_base_delay_ms, self.conflict_max_delay_ms)
    }
}

/// Default timing for the lifecycle hooks.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleConfig {
    #[serde(default)]
    pub create_derivatives: TimingDirective,
    #[serde(default)]
    pub delete: TimingDirective,
}

impl LifecycleConfig {
    pub fn directives(&self) -> LifecycleDirectives {
        LifecycleDirectives {
            create_derivatives: self.create_derivatives,
            delete: self.delete,
        }
    }
}

/// Derivatives application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DerivativesAppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

impl DerivativesAppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var("DERIVATIVES_CONFIG")
            .unwrap_or_else(|_| "config/derivatives".to_string());

        let s = Config::builder()
            .set_default("storage.root", "./storage")?
            .set_default("storage.store_key", "store")?
            .set_default("storage.derivative_storage_key", "derivatives")?
            .set_default("storage.cache_key", "cache")?
            .set_default("persistence.unique_violation_attempts", 3_i64)?
            .set_default("persistence.max_commit_attempts", 5_i64)?
            .set_default("lifecycle.create_derivatives", "inline")?
            .set_default("lifecycle.delete", "inline")?
            .add_source(File::with_name(&config_path).required(false))
            .add_source(Environment::with_prefix("DERIVATIVES").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
