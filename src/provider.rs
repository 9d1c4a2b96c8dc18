//! The Provider entity and platform-family tag (§3), plus the
//! model-gating helpers that live with them (§4.5).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// The tag used to index providers and route requests. Canonical
/// values are `claude`, `codex`, `gemini`; everything else is a
/// user-defined `custom:<toolId>` family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Platform {
    Claude,
    Codex,
    Gemini,
    Custom(String),
}

impl Platform {
    /// The storage key (and routing key) for this platform, e.g.
    /// `"claude"` or `"custom:my-tool"`.
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Default forwarded path for this platform's native protocol.
    pub fn default_forward_path(&self) -> &str {
        match self {
            Platform::Claude | Platform::Custom(_) => "/v1/messages",
            Platform::Codex => "/responses",
            Platform::Gemini => "/v1beta",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Claude => write!(f, "claude"),
            Platform::Codex => write!(f, "codex"),
            Platform::Gemini => write!(f, "gemini"),
            Platform::Custom(id) => write!(f, "custom:{id}"),
        }
    }
}

impl FromStr for Platform {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "claude" => Platform::Claude,
            "codex" => Platform::Codex,
            "gemini" => Platform::Gemini,
            other => match other.strip_prefix("custom:") {
                Some(id) => Platform::Custom(id.to_string()),
                None => Platform::Custom(other.to_string()),
            },
        })
    }
}

impl TryFrom<String> for Platform {
    type Error = std::convert::Infallible;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Platform::from_str(&value)
    }
}

impl From<Platform> for String {
    fn from(value: Platform) -> Self {
        value.to_string()
    }
}

/// How the relay authenticates itself to this provider's upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// `Authorization: Bearer <key>` (default).
    Bearer,
    /// `x-api-key: <key>`.
    XApiKey,
    /// An arbitrary header name carrying the key verbatim.
    Header(String),
}

impl Default for AuthType {
    fn default() -> Self {
        AuthType::Bearer
    }
}

/// Availability-monitor overrides for a single provider (§4.3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AvailabilityConfig {
    pub test_model: Option<String>,
    pub test_endpoint: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// A single upstream instance within a platform family (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: u64,
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub endpoint_override: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub supported_models: Vec<String>,
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    #[serde(default)]
    pub connectivity_auth_type: AuthType,
    #[serde(default)]
    pub availability_monitor_enabled: bool,
    #[serde(default)]
    pub connectivity_auto_blacklist: bool,
    #[serde(default)]
    pub availability: AvailabilityConfig,
}

fn default_true() -> bool {
    true
}

fn default_priority() -> u32 {
    1
}

impl Provider {
    /// Priority level, normalized: absent/≤0 is treated as 1 (§3).
    pub fn level(&self) -> u32 {
        if self.priority == 0 {
            1
        } else {
            self.priority
        }
    }

    /// Is this provider's static configuration usable at all
    /// (independent of the requested model)?
    pub fn is_config_valid(&self) -> bool {
        !self.base_url.is_empty()
            && !self.api_key.is_empty()
            && self.base_url.trim_end_matches('/') == self.base_url
    }

    /// Is this provider eligible for a request with model `m` (§3)?
    pub fn is_eligible_for(&self, model: &str) -> bool {
        self.enabled
            && self.is_config_valid()
            && (self.supported_models.is_empty()
                || self.supported_models.iter().any(|m2| m2 == model)
                || self.model_mapping.contains_key(model))
    }

    /// The effective (upstream) model name for a request model `m`.
    pub fn effective_model<'a>(&'a self, requested: &'a str) -> &'a str {
        self.model_mapping
            .get(requested)
            .map(|s| s.as_str())
            .unwrap_or(requested)
    }

    /// The effective endpoint path for a forwarded request (not for
    /// monitor probes, which use `availability.test_endpoint`
    /// directly): `endpoint_override` if set, else the platform
    /// default.
    pub fn effective_endpoint<'a>(&'a self, platform: &'a Platform) -> &'a str {
        self.endpoint_override
            .as_deref()
            .unwrap_or_else(|| platform.default_forward_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> Provider {
        Provider {
            id: 1,
            name: "primary".into(),
            base_url: "https://api.example.com".into(),
            api_key: "sk-test".into(),
            endpoint_override: None,
            enabled: true,
            priority: 1,
            supported_models: vec![],
            model_mapping: HashMap::new(),
            connectivity_auth_type: AuthType::Bearer,
            availability_monitor_enabled: false,
            connectivity_auto_blacklist: false,
            availability: AvailabilityConfig::default(),
        }
    }

    #[test]
    fn platform_round_trips_through_key() {
        assert_eq!(Platform::from_str("claude").unwrap().key(), "claude");
        assert_eq!(
            Platform::from_str("custom:my-tool").unwrap().key(),
            "custom:my-tool"
        );
    }

    #[test]
    fn zero_priority_normalizes_to_one() {
        let mut p = provider();
        p.priority = 0;
        assert_eq!(p.level(), 1);
    }

    #[test]
    fn empty_supported_models_means_anything_goes() {
        let p = provider();
        assert!(p.is_eligible_for("whatever"));
    }

    #[test]
    fn model_gate_rejects_unlisted_model_with_no_mapping() {
        let mut p = provider();
        p.supported_models = vec!["m1".into()];
        assert!(p.is_eligible_for("m1"));
        assert!(!p.is_eligible_for("m2"));
    }

    #[test]
    fn mapping_key_makes_a_model_eligible_even_if_not_in_supported_models() {
        let mut p = provider();
        p.supported_models = vec!["m1".into()];
        p.model_mapping.insert("m2".into(), "upstream-m2".into());
        assert!(p.is_eligible_for("m2"));
        assert_eq!(p.effective_model("m2"), "upstream-m2");
        assert_eq!(p.effective_model("m1"), "m1");
    }

    #[test]
    fn trailing_slash_base_url_is_not_config_valid() {
        let mut p = provider();
        p.base_url = "https://api.example.com/".into();
        assert!(!p.is_config_valid());
    }

    #[test]
    fn effective_endpoint_falls_back_to_platform_default() {
        let p = provider();
        assert_eq!(p.effective_endpoint(&Platform::Claude), "/v1/messages");
    }
}
