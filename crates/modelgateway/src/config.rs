//! The YAML configuration file model.
//!
//! The file is split into the same top-level sections the ecosystem has
//! standardized on (`model_list`, `router_settings`, ...). Keys are
//! snake_case on disk; `litellm_*` spellings are accepted as aliases so
//! existing configs load unchanged.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hooks::GuardrailConfig;
use crate::llm::cost::ModelInfo;
use crate::mcp::McpServerConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
	#[serde(default)]
	pub model_list: Vec<ModelEntry>,
	#[serde(default)]
	pub router_settings: RouterSettings,
	#[serde(default, alias = "litellm_settings")]
	pub gateway_settings: GatewaySettings,
	#[serde(default)]
	pub general_settings: GeneralSettings,
	#[serde(default)]
	pub guardrails: Vec<GuardrailConfig>,
	#[serde(default)]
	pub mcp_servers: Vec<McpServerConfig>,
	/// Merged into the process environment at load time, before credential
	/// resolution runs.
	#[serde(default)]
	pub environment_variables: HashMap<String, String>,
}

/// One deployment: a public `model_name` (the group alias) bound to a
/// concrete provider model plus credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelEntry {
	pub model_name: String,
	#[serde(alias = "litellm_params")]
	pub params: DeploymentParams,
	#[serde(default)]
	pub model_info: Option<ModelInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentParams {
	/// `provider/model` string; the registry owns parsing it.
	pub model: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub api_key: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub api_base: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub api_version: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub region: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub project: Option<String>,
	/// Requests-per-minute capacity for this deployment, consumed by the
	/// usage-based routing strategy and the dynamic rate limiter.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rpm: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tpm: Option<u64>,
	/// Guardrails attached at model level; they run before team-level and
	/// global guardrails for calls served by this deployment's group.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub guardrails: Vec<String>,
	/// Provider-specific parameters forwarded verbatim (e.g. deployment ids,
	/// guardrail identifiers).
	#[serde(flatten)]
	pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterSettings {
	#[serde(default)]
	pub routing_strategy: RoutingStrategy,
	#[serde(default = "default_num_retries")]
	pub num_retries: u32,
	/// Per-call deadline in seconds.
	#[serde(default = "default_request_timeout")]
	pub request_timeout: f64,
	/// Base cooldown applied to a deployment after a cooldown-class error,
	/// in seconds. Grows exponentially on consecutive cooldowns.
	#[serde(default = "default_cooldown_time")]
	pub cooldown_time: f64,
	/// Ordered fallback rules: `[{"gpt-4o": ["azure-gpt-4o", ...]}]`.
	#[serde(default)]
	pub fallbacks: Vec<HashMap<String, Vec<String>>>,
	/// Failures tolerated within the window before a deployment is cooled
	/// even when individual errors would not trigger cooldown.
	#[serde(default = "default_allowed_fails")]
	pub allowed_fails: u32,
}

impl Default for RouterSettings {
	fn default() -> Self {
		Self {
			routing_strategy: RoutingStrategy::default(),
			num_retries: default_num_retries(),
			request_timeout: default_request_timeout(),
			cooldown_time: default_cooldown_time(),
			fallbacks: Vec::new(),
			allowed_fails: default_allowed_fails(),
		}
	}
}

impl RouterSettings {
	/// Flatten the YAML fallback rules into a lookup map, first rule wins.
	pub fn fallback_map(&self) -> HashMap<String, Vec<String>> {
		let mut out = HashMap::new();
		for rule in &self.fallbacks {
			for (model, targets) in rule {
				out.entry(model.clone()).or_insert_with(|| targets.clone());
			}
		}
		out
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingStrategy {
	#[default]
	#[serde(rename = "simple-shuffle")]
	SimpleShuffle,
	#[serde(rename = "least-busy")]
	LeastBusy,
	#[serde(rename = "usage-based-routing-v2")]
	UsageBased,
	#[serde(rename = "latency-based-routing")]
	LatencyBased,
	#[serde(rename = "lowest-cost")]
	LowestCost,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewaySettings {
	/// When true, request parameters a provider does not support are dropped
	/// instead of failing the call with a 400.
	#[serde(default)]
	pub drop_params: bool,
	#[serde(default)]
	pub set_verbose: bool,
	/// Client headers projected onto upstream provider requests.
	#[serde(default)]
	pub forward_client_headers_to_llm_api: Vec<String>,
	/// Allow adapters to adjust params to provider constraints (e.g. clamp
	/// temperature) instead of rejecting.
	#[serde(default)]
	pub modify_params: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneralSettings {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub master_key: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub database_url: Option<String>,
	#[serde(default)]
	pub alerting: Vec<String>,
	#[serde(default)]
	pub disable_spend_logs: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_request_size_mb: Option<u64>,
}

impl GeneralSettings {
	pub fn max_request_size_bytes(&self) -> usize {
		self
			.max_request_size_mb
			.map(|mb| (mb as usize) * 1024 * 1024)
			.unwrap_or(crate::http::DEFAULT_BODY_LIMIT)
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to read config: {0}")]
	Io(#[from] std::io::Error),
	#[error("failed to parse config: {0}")]
	Parse(#[from] serde_yaml::Error),
	#[error("invalid config: {0}")]
	Invalid(String),
}

impl Config {
	pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
		let raw = std::fs::read_to_string(path)?;
		Self::parse(&raw)
	}

	pub fn parse(raw: &str) -> Result<Config, ConfigError> {
		let cfg: Config = serde_yaml::from_str(raw)?;
		cfg.validate()?;
		// Environment merge happens after validation so a bad file never
		// half-applies.
		for (k, v) in &cfg.environment_variables {
			// Real environment wins over the config file.
			if std::env::var(k).is_err() {
				unsafe { std::env::set_var(k, v) };
			}
		}
		Ok(cfg)
	}

	fn validate(&self) -> Result<(), ConfigError> {
		for entry in &self.model_list {
			if entry.model_name.is_empty() {
				return Err(ConfigError::Invalid("model_name must not be empty".into()));
			}
			if entry.params.model.is_empty() {
				return Err(ConfigError::Invalid(format!(
					"model_list entry {:?} is missing a model",
					entry.model_name
				)));
			}
		}
		for server in &self.mcp_servers {
			server
				.validate()
				.map_err(|e| ConfigError::Invalid(e.to_string()))?;
		}
		for g in &self.guardrails {
			if g.guardrail_name.is_empty() {
				return Err(ConfigError::Invalid(
					"guardrail_name must not be empty".into(),
				));
			}
		}
		Ok(())
	}
}

fn default_num_retries() -> u32 {
	2
}

fn default_request_timeout() -> f64 {
	600.0
}

fn default_cooldown_time() -> f64 {
	60.0
}

fn default_allowed_fails() -> u32 {
	3
}

#[cfg(test)]
mod tests {
	use super::*;

	const BASIC: &str = r#"
model_list:
  - model_name: gpt-4o
    litellm_params:
      model: openai/gpt-4o
      api_key: os.environ/OPENAI_API_KEY
  - model_name: gpt-4o
    litellm_params:
      model: azure/gpt-4o-eastus
      api_base: https://eastus.example.azure.com
      api_version: 2024-06-01
router_settings:
  routing_strategy: latency-based-routing
  num_retries: 2
  cooldown_time: 30
  fallbacks:
    - gpt-4o: ["claude-sonnet"]
litellm_settings:
  drop_params: true
general_settings:
  master_key: sk-test
  max_request_size_mb: 4
"#;

	#[test]
	fn parses_basic_config() {
		let cfg = Config::parse(BASIC).unwrap();
		assert_eq!(cfg.model_list.len(), 2);
		assert_eq!(cfg.model_list[0].model_name, "gpt-4o");
		assert_eq!(cfg.model_list[1].params.model, "azure/gpt-4o-eastus");
		assert_eq!(
			cfg.router_settings.routing_strategy,
			RoutingStrategy::LatencyBased
		);
		assert!(cfg.gateway_settings.drop_params);
		assert_eq!(
			cfg.router_settings.fallback_map().get("gpt-4o").unwrap(),
			&vec!["claude-sonnet".to_string()]
		);
		assert_eq!(
			cfg.general_settings.max_request_size_bytes(),
			4 * 1024 * 1024
		);
	}

	#[test]
	fn rejects_unknown_top_level_sections() {
		let res = Config::parse("unknown_section: {}\n");
		assert!(res.is_err());
	}

	#[test]
	fn defaults_apply() {
		let cfg = Config::parse("model_list: []\n").unwrap();
		assert_eq!(cfg.router_settings.num_retries, 2);
		assert_eq!(cfg.router_settings.request_timeout, 600.0);
		assert_eq!(cfg.router_settings.cooldown_time, 60.0);
	}
}
