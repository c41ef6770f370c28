//! Engine configuration loading and validation

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::scope::Scope;

/// Complete engine configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub cache: CacheSection,

    #[serde(default)]
    pub hierarchy: HierarchySection,

    #[serde(default)]
    pub rate_limit: RateLimitSection,

    #[serde(default)]
    pub vault: VaultSection,

    #[serde(default)]
    pub audit: AuditSection,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineSection {
    #[serde(default)]
    pub environment: Environment,
    /// When false, resolution returns `fallback_scopes` (development only)
    #[serde(default = "default_true")]
    pub dynamic_rbac: bool,
    #[serde(default)]
    pub fallback_scopes: Vec<String>,
    #[serde(default = "default_resolution_timeout")]
    pub resolution_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HierarchySection {
    /// Bound for role and group parent chains
    #[serde(default = "default_inheritance_depth")]
    pub max_inheritance_depth: usize,
    /// Hop cap for tenant ancestry walks
    #[serde(default = "default_tenant_depth")]
    pub max_tenant_depth: usize,
}

/// Attempts allowed per window for one action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateLimitRule {
    pub max_attempts: u32,
    pub window_secs: u64,
}

impl RateLimitRule {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitSection {
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    #[serde(default = "default_window_secs")]
    pub default_window_secs: u64,
    /// Per-action overrides keyed by action name (e.g. `login`)
    #[serde(default)]
    pub overrides: HashMap<String, RateLimitRule>,
}

impl RateLimitSection {
    /// Rule applying to `action`, falling back to the defaults
    pub fn rule_for(&self, action: &str) -> RateLimitRule {
        self.overrides.get(action).copied().unwrap_or(RateLimitRule {
            max_attempts: self.default_max_attempts,
            window_secs: self.default_window_secs,
        })
    }
}

/// Names of the environment variables holding vault secrets
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VaultSection {
    #[serde(default = "default_master_key_env")]
    pub master_key_env: String,
    #[serde(default = "default_global_salt_env")]
    pub global_salt_env: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditSection {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,
    /// Monthly partitions provisioned ahead of the current month
    #[serde(default = "default_provisioned_months")]
    pub provisioned_months: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

// Default value functions
fn default_true() -> bool { true }
fn default_resolution_timeout() -> u64 { 2000 }
fn default_cache_ttl() -> u64 { 300 }
fn default_cache_capacity() -> usize { 10_000 }
fn default_inheritance_depth() -> usize { 50 }
fn default_tenant_depth() -> usize { 1000 }
fn default_max_attempts() -> u32 { 5 }
fn default_window_secs() -> u64 { 60 }
fn default_master_key_env() -> String { "TESSERA_MASTER_KEY".to_string() }
fn default_global_salt_env() -> String { "TESSERA_GLOBAL_SALT".to_string() }
fn default_queue_capacity() -> usize { 1024 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_backoff() -> u64 { 50 }
fn default_ack_timeout() -> u64 { 2000 }
fn default_provisioned_months() -> u32 { 12 }
fn default_log_level() -> String { "info".to_string() }

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            dynamic_rbac: default_true(),
            fallback_scopes: Vec::new(),
            resolution_timeout_ms: default_resolution_timeout(),
        }
    }
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
            capacity: default_cache_capacity(),
        }
    }
}

impl Default for HierarchySection {
    fn default() -> Self {
        Self {
            max_inheritance_depth: default_inheritance_depth(),
            max_tenant_depth: default_tenant_depth(),
        }
    }
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            default_max_attempts: default_max_attempts(),
            default_window_secs: default_window_secs(),
            overrides: HashMap::new(),
        }
    }
}

impl Default for VaultSection {
    fn default() -> Self {
        Self {
            master_key_env: default_master_key_env(),
            global_salt_env: default_global_salt_env(),
        }
    }
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
            ack_timeout_ms: default_ack_timeout(),
            provisioned_months: default_provisioned_months(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .context("Failed to read configuration file")?;

        Self::from_toml(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(contents)
            .context("Failed to parse configuration file")?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        // Validate engine
        if self.engine.environment == Environment::Production {
            if !self.engine.dynamic_rbac {
                anyhow::bail!("dynamic_rbac cannot be disabled in production");
            }
            if !self.engine.fallback_scopes.is_empty() {
                anyhow::bail!("fallback_scopes are not permitted in production");
            }
        }

        for scope in &self.engine.fallback_scopes {
            Scope::parse(scope)
                .with_context(|| format!("Invalid fallback scope '{}'", scope))?;
        }

        if self.engine.resolution_timeout_ms == 0 {
            anyhow::bail!("resolution_timeout_ms must be greater than zero");
        }

        // Validate cache
        if self.cache.ttl_secs == 0 {
            anyhow::bail!("Cache TTL must be greater than zero");
        }

        if self.cache.capacity == 0 {
            anyhow::bail!("Cache capacity must be greater than zero");
        }

        // Validate hierarchy bounds
        if self.hierarchy.max_inheritance_depth == 0 || self.hierarchy.max_inheritance_depth > 1000 {
            anyhow::bail!("max_inheritance_depth must be between 1 and 1000");
        }

        if self.hierarchy.max_tenant_depth == 0 || self.hierarchy.max_tenant_depth > 100_000 {
            anyhow::bail!("max_tenant_depth must be between 1 and 100000");
        }

        // Validate rate limits
        if self.rate_limit.default_max_attempts == 0 || self.rate_limit.default_window_secs == 0 {
            anyhow::bail!("Rate limit defaults must be greater than zero");
        }

        for (action, rule) in &self.rate_limit.overrides {
            if rule.max_attempts == 0 || rule.window_secs == 0 {
                anyhow::bail!("Rate limit override for '{}' must be greater than zero", action);
            }
        }

        // Validate audit
        if self.audit.queue_capacity == 0 {
            anyhow::bail!("Audit queue capacity must be greater than zero");
        }

        Ok(())
    }

    pub fn resolution_timeout(&self) -> Duration {
        Duration::from_millis(self.engine.resolution_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }
}
