use crate::dispatch::DispatchTarget;
use crate::error::ValidationError;
use crate::gateway::parse_base_url;
use crate::log_debug;
use crate::logger;
use crate::providers::{ProviderRegistry, ProviderSettings};

use anyhow::{Context, Result, anyhow};
use dirs::{config_dir, data_dir};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the gateway base URL
pub const API_BASE_ENV: &str = "ASHER_API_BASE";

/// Gateway address used when nothing else is configured
pub const DEFAULT_API_BASE: &str = "http://localhost:8001";

/// Configuration for the comparison lab
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct LabConfig {
    /// Base URL of the provider gateway
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Upper bound for one provider request
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Where saved conversations, documents and preferences live
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
    /// Whether to let HTTP client crates through the log filter
    #[serde(default)]
    pub verbose_logging: bool,
    /// Per-provider request settings keyed by provider id
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_request_timeout_seconds() -> u64 {
    120
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            request_timeout_seconds: default_request_timeout_seconds(),
            storage_dir: None,
            verbose_logging: false,
            providers: HashMap::new(),
        }
    }
}

impl LabConfig {
    /// Load the personal configuration, falling back to defaults when absent
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = Self::load_from(&path)?;
        config.apply_api_base_override(std::env::var(API_BASE_ENV).ok())?;
        config.apply_logging();
        log_debug!("Configuration loaded: {:?}", config.redacted());
        Ok(config)
    }

    /// Load from an explicit path; a missing file yields the defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        parse_base_url(&config.api_base)?;
        Ok(config)
    }

    /// Save to the personal config file
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        self.save_to(&path)
    }

    /// Save to an explicit path. API key overrides are never written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(&self.redacted())?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        log_debug!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Copy with every API key override removed
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for settings in copy.providers.values_mut() {
            settings.api_key_override = None;
        }
        copy
    }

    /// Replace `api_base` with an override value, if one is set and non-blank
    pub fn apply_api_base_override(&mut self, value: Option<String>) -> Result<(), ValidationError> {
        if let Some(base) = value.filter(|v| !v.trim().is_empty()) {
            parse_base_url(&base)?;
            self.api_base = base.trim().to_string();
        }
        Ok(())
    }

    /// Turn on verbose logging when configured; an environment request is never turned off
    pub fn apply_logging(&self) {
        if self.verbose_logging {
            logger::set_verbose_logging(true);
        }
    }

    fn config_path() -> Result<PathBuf> {
        let mut path =
            config_dir().ok_or_else(|| anyhow!("Unable to determine config directory"))?;
        path.push("asher");
        path.push("config.toml");
        Ok(path)
    }

    /// Configured storage directory, or the platform data directory
    pub fn storage_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.storage_dir {
            return Ok(dir.clone());
        }
        let mut path = data_dir().ok_or_else(|| anyhow!("Unable to determine data directory"))?;
        path.push("asher");
        Ok(path)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Settings for one provider, or the defaults
    pub fn provider_settings(&self, provider_id: &str) -> ProviderSettings {
        self.providers.get(provider_id).cloned().unwrap_or_default()
    }

    /// One target per ticked panel, aimed at that panel's default provider.
    ///
    /// Providers whose settings are disabled are left out.
    pub fn dispatch_targets(
        &self,
        registry: &ProviderRegistry,
        panels: &[&str],
    ) -> Result<Vec<DispatchTarget>, ValidationError> {
        let mut targets = Vec::with_capacity(panels.len());
        for panel in panels {
            let provider = registry
                .default_for_panel(panel)
                .ok_or_else(|| ValidationError::UnknownProvider((*panel).to_string()))?;
            let settings = self.provider_settings(provider.id);
            if settings.enabled {
                targets.push(DispatchTarget::with_settings(provider.id, settings));
            } else {
                log_debug!("Skipping disabled provider {}", provider.id);
            }
        }
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LabConfig::default();
        assert_eq!(config.api_base, DEFAULT_API_BASE);
        assert_eq!(config.request_timeout(), Duration::from_secs(120));
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: LabConfig = toml::from_str(
            r#"
            request_timeout_seconds = 30

            [providers."grok-4"]
            temperature = 0.5
            "#,
        )
        .expect("parse");
        assert_eq!(config.api_base, DEFAULT_API_BASE);
        assert_eq!(config.request_timeout_seconds, 30);
        let grok = config.provider_settings("grok-4");
        assert_eq!(grok.temperature, Some(0.5));
        assert!(grok.enabled);
    }

    #[test]
    fn test_override_validates_url() {
        let mut config = LabConfig::default();
        config
            .apply_api_base_override(Some("https://lab.example.com".to_string()))
            .expect("valid url");
        assert_eq!(config.api_base, "https://lab.example.com");

        assert!(
            config
                .apply_api_base_override(Some("::nope".to_string()))
                .is_err()
        );
        config.apply_api_base_override(Some("  ".to_string())).expect("blank ignored");
        assert_eq!(config.api_base, "https://lab.example.com");
    }

    #[test]
    fn test_dispatch_targets_use_panel_defaults() {
        let mut config = LabConfig::default();
        config.providers.insert(
            "claude-sonnet-4.5".to_string(),
            ProviderSettings {
                temperature: Some(0.3),
                ..Default::default()
            },
        );

        let targets = config
            .dispatch_targets(&ProviderRegistry::builtin(), &["claude", "grok"])
            .expect("known panels");
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].provider_id, "claude-sonnet-4.5");
        assert_eq!(targets[0].settings.temperature, Some(0.3));
        assert_eq!(targets[1].provider_id, "grok-4");

        assert!(
            config
                .dispatch_targets(&ProviderRegistry::builtin(), &["mistral"])
                .is_err()
        );
    }

    #[test]
    fn test_disabled_provider_is_not_targeted() {
        let config: LabConfig = toml::from_str(
            r#"
            [providers."grok-4"]
            enabled = false
            "#,
        )
        .expect("parse");

        let targets = config
            .dispatch_targets(&ProviderRegistry::builtin(), &["openai", "grok"])
            .expect("known panels");
        let ids: Vec<&str> = targets.iter().map(|t| t.provider_id.as_str()).collect();
        assert_eq!(ids, vec!["openai-gpt4.1"]);

        let none = config
            .dispatch_targets(&ProviderRegistry::builtin(), &["grok"])
            .expect("known panel");
        assert!(none.is_empty());
    }
}
