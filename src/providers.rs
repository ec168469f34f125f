//! Provider catalog.
//!
//! Single source of truth for the providers the lab can address, the vendor
//! family each belongs to and the panel its messages render into.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;
use crate::gateway::ProviderStatus;
use crate::log_warn;

/// Default sampling temperature when a provider's settings leave it unset
pub const DEFAULT_TEMPERATURE: f32 = 1.0;

/// Vendor families (one panel each in the comparison grid)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderFamily {
    OpenAI,
    Claude,
    Gemini,
    Grok,
}

impl ProviderFamily {
    /// All families in panel order
    pub const ALL: &'static [ProviderFamily] = &[
        ProviderFamily::OpenAI,
        ProviderFamily::Claude,
        ProviderFamily::Gemini,
        ProviderFamily::Grok,
    ];

    /// Family name as used in ids, panel names and persisted settings
    pub const fn name(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Grok => "grok",
        }
    }
}

impl FromStr for ProviderFamily {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        // Vendor names are accepted as aliases
        let normalized = match lower.as_str() {
            "anthropic" => "claude",
            "google" => "gemini",
            "xai" => "grok",
            other => other,
        };

        Self::ALL
            .iter()
            .find(|f| f.name() == normalized)
            .copied()
            .ok_or_else(|| ValidationError::UnknownProvider(s.to_string()))
    }
}

impl fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Immutable descriptor of one addressable backend/model combination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Provider {
    pub id: &'static str,
    pub display_name: &'static str,
    pub family: ProviderFamily,
    /// Panel whose message list this provider renders into
    pub panel_group: &'static str,
    /// Vendor model identifier the gateway resolves this provider to
    pub model: &'static str,
}

const fn provider(
    id: &'static str,
    display_name: &'static str,
    family: ProviderFamily,
    model: &'static str,
) -> Provider {
    Provider {
        id,
        display_name,
        family,
        panel_group: family.name(),
        model,
    }
}

static BUILTIN_PROVIDERS: &[Provider] = &[
    provider("openai-gpt4.1", "OpenAI GPT-4.1", ProviderFamily::OpenAI, "gpt-4.1"),
    provider("openai-gpt4o", "OpenAI GPT-4o", ProviderFamily::OpenAI, "gpt-4o"),
    provider("openai-o3", "OpenAI o3", ProviderFamily::OpenAI, "o3"),
    provider("openai-o4-mini", "OpenAI o4-mini", ProviderFamily::OpenAI, "o4-mini"),
    provider(
        "claude-sonnet-4.5",
        "Claude Sonnet 4.5",
        ProviderFamily::Claude,
        "claude-sonnet-4-5-20250929",
    ),
    provider(
        "claude-opus-4.1",
        "Claude Opus 4.1",
        ProviderFamily::Claude,
        "claude-opus-4-1-20250805",
    ),
    provider(
        "claude-sonnet-4",
        "Claude Sonnet 4",
        ProviderFamily::Claude,
        "claude-sonnet-4-20250514",
    ),
    provider("gemini-2.5-flash", "Gemini 2.5 Flash", ProviderFamily::Gemini, "gemini-2.5-flash"),
    provider("gemini-2.5-pro", "Gemini 2.5 Pro", ProviderFamily::Gemini, "gemini-2.5-pro"),
    provider("grok-4", "xAI Grok 4", ProviderFamily::Grok, "grok-4"),
    provider("grok-3", "xAI Grok 3", ProviderFamily::Grok, "grok-3"),
];

/// Provider each panel sends to when its checkbox is ticked
const PANEL_DEFAULTS: &[(&str, &str)] = &[
    ("openai", "openai-gpt4.1"),
    ("claude", "claude-sonnet-4.5"),
    ("gemini", "gemini-2.5-flash"),
    ("grok", "grok-4"),
];

/// Static lookup over the provider table
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: &'static [Provider],
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProviderRegistry {
    /// The registry compiled into the lab
    pub fn builtin() -> Self {
        Self {
            providers: BUILTIN_PROVIDERS,
        }
    }

    /// All providers in catalog order
    pub fn list_providers(&self) -> &[Provider] {
        self.providers
    }

    /// Look up a provider by id
    pub fn resolve(&self, id: &str) -> Result<&Provider, ValidationError> {
        self.providers
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| ValidationError::UnknownProvider(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.resolve(id).is_ok()
    }

    /// Panel groups in first-seen catalog order
    pub fn panels(&self) -> Vec<&'static str> {
        let mut panels: Vec<&'static str> = Vec::new();
        for p in self.providers {
            if !panels.contains(&p.panel_group) {
                panels.push(p.panel_group);
            }
        }
        panels
    }

    pub fn providers_in_panel<'a>(&'a self, panel: &'a str) -> impl Iterator<Item = &'a Provider> {
        self.providers.iter().filter(move |p| p.panel_group == panel)
    }

    /// The provider a ticked panel dispatches to
    pub fn default_for_panel(&self, panel: &str) -> Option<&Provider> {
        PANEL_DEFAULTS
            .iter()
            .find(|(name, _)| *name == panel)
            .and_then(|(_, id)| self.resolve(id).ok())
    }

    /// Restrict gateway-reported availability to the providers this registry knows.
    ///
    /// Unknown ids are dropped with a warning; known providers the gateway did
    /// not report are considered unavailable.
    pub fn reconcile_availability(&self, statuses: &[ProviderStatus]) -> BTreeMap<String, bool> {
        let mut availability: BTreeMap<String, bool> = self
            .providers
            .iter()
            .map(|p| (p.id.to_string(), false))
            .collect();

        for status in statuses {
            match availability.get_mut(&status.id) {
                Some(slot) => *slot = status.available,
                None => log_warn!("Gateway reported unknown provider '{}', ignoring", status.id),
            }
        }

        availability
    }
}

/// Per-provider request settings passed into a dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Model override sent to the gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Sampling temperature (defaults to 1.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Key sent instead of the gateway's configured key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_override: Option<String>,
    /// Whether the provider's panel is ticked
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            model: None,
            temperature: None,
            api_key_override: None,
            enabled: true,
        }
    }
}

impl ProviderSettings {
    /// Temperature to send (configured or default)
    pub fn effective_temperature(&self) -> f32 {
        self.temperature.unwrap_or(DEFAULT_TEMPERATURE)
    }

    /// Model override, ignoring blank values
    pub fn effective_model(&self) -> Option<&str> {
        self.model.as_deref().filter(|m| !m.trim().is_empty())
    }

    /// Key override, ignoring blank values
    pub fn effective_api_key(&self) -> Option<&str> {
        self.api_key_override
            .as_deref()
            .filter(|k| !k.trim().is_empty())
    }
}
