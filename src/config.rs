use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AiError;
use crate::types::ProviderId;

/// Static configuration for one provider. Created at startup, immutable
/// afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    pub provider: ProviderId,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Declared requests-per-window quota, used until vendor headers
    /// report a live value.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    /// Lower is preferred.
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Relative weight for the weighted-random strategy.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Allowed model ids; empty means every model the vendor reports.
    #[serde(default)]
    pub models: Vec<String>,
}

impl ProviderSettings {
    pub fn new(provider: ProviderId, api_key: impl Into<String>) -> Self {
        Self {
            provider,
            api_key: api_key.into(),
            api_base: None,
            timeout_secs: default_timeout_secs(),
            rate_limit: default_rate_limit(),
            priority: default_priority(),
            enabled: true,
            weight: default_weight(),
            models: Vec::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_rate_limit() -> u32 {
    60
}

fn default_priority() -> u8 {
    10
}

fn default_enabled() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

/// How the router orders providers of equal priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoutingStrategy {
    /// Configured order; deterministic given the same inputs.
    #[default]
    Priority,
    RoundRobin,
    WeightedRandom,
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before allowing one trial request.
    pub recovery_timeout_secs: u64,
    /// Consecutive rate-limit outcomes that escalate to one breaker
    /// failure. Plain 429s never touch the failure counter.
    pub rate_limit_escalation_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            rate_limit_escalation_threshold: 3,
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

/// Root configuration for the orchestration layer.
///
/// An empty provider list is a valid (degraded) configuration: the
/// orchestrator starts and every request fails with a typed error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorConfig {
    pub providers: Vec<ProviderSettings>,
    pub strategy: RoutingStrategy,
    pub breaker: BreakerConfig,
}

impl OrchestratorConfig {
    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self, AiError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AiError::Parse(format!("failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| AiError::Parse(format!("failed to parse {}: {}", path.display(), e)))
    }
}
