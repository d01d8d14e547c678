use crate::calendar::BusinessCalendarConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Engine settings. Every field has a default so a partial YAML file is valid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on agenda steps per operation. Guards against runaway loops.
    pub max_traversal_steps: usize,
    /// Reject a start whose business key is already used by an active instance
    /// of the same process.
    pub reject_duplicate_business_keys: bool,
    /// Delay applied to repeat expressions that give no usable start.
    pub default_repeat_delay_ms: u64,
    pub business_calendar: Option<BusinessCalendarConfig>,
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_traversal_steps: 10_000,
            reject_duplicate_business_keys: true,
            default_repeat_delay_ms: 1_000,
            business_calendar: None,
            log_filter: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("Failed to parse engine config")?;
        Ok(config)
    }

    /// Load from a YAML file, then apply `PROCFLOW_*` environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let mut config = Self::from_yaml_str(&text)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (normally `std::env::var`).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("PROCFLOW_MAX_TRAVERSAL_STEPS") {
            self.max_traversal_steps = v
                .parse()
                .with_context(|| format!("PROCFLOW_MAX_TRAVERSAL_STEPS: invalid value '{v}'"))?;
        }
        if let Some(v) = lookup("PROCFLOW_REJECT_DUPLICATE_BUSINESS_KEYS") {
            self.reject_duplicate_business_keys = matches!(
                v.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Some(v) = lookup("PROCFLOW_LOG") {
            self.log_filter = v;
        }
        Ok(())
    }
}
