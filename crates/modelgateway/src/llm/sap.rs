//! SAP Generative AI Hub (AI Core). Models are namespaced with a `--`
//! separator (`sap/anthropic--claude-4.5-sonnet`); the part before `--`
//! selects the wire dialect, the whole string is the serving model id.

use serde::{Deserialize, Serialize};

use crate::llm::RouteType;
use crate::{Strng, strng};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub model: Option<Strng>,
	/// AI Core deployment id serving this model.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub deployment_id: Option<Strng>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub resource_group: Option<Strng>,
}

impl super::Provider for Provider {
	const NAME: Strng = strng::literal!("sap");
}

/// Single JSON blob alternative to the discrete variables below; discrete
/// variables win on conflict.
pub const SERVICE_KEY_ENV: &str = "AICORE_SERVICE_KEY";
pub const CLIENT_ID_ENV: &str = "AICORE_CLIENT_ID";
pub const CLIENT_SECRET_ENV: &str = "AICORE_CLIENT_SECRET";
pub const AUTH_URL_ENV: &str = "AICORE_AUTH_URL";
pub const BASE_URL_ENV: &str = "AICORE_BASE_URL";
pub const RESOURCE_GROUP_HEADER: &str = "ai-resource-group";

/// The sub-model namespace before the `--` separator, when present.
pub fn submodel_namespace(model: &str) -> Option<&str> {
	model.split_once("--").map(|(ns, _)| ns)
}

impl Provider {
	pub fn is_anthropic_submodel(&self, model: &str) -> bool {
		let model = self.model.as_deref().unwrap_or(model);
		submodel_namespace(model) == Some("anthropic")
	}

	pub fn resource_group(&self) -> Strng {
		self
			.resource_group
			.clone()
			.unwrap_or_else(|| strng::literal!("default"))
	}

	pub fn get_path_for_model(&self, route: RouteType, model: &str) -> Strng {
		let deployment = self.deployment_id.as_deref().unwrap_or(model);
		let suffix = match route {
			RouteType::Embeddings => "embeddings",
			_ if self.is_anthropic_submodel(model) => "invoke",
			_ => "chat/completions",
		};
		strng::format!("/v2/inference/deployments/{deployment}/{suffix}")
	}
}

/// Credentials resolved from the environment, per the precedence contract.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceKey {
	pub clientid: String,
	pub clientsecret: String,
	/// XSUAA token endpoint base.
	pub url: String,
	#[serde(default)]
	pub serviceurls: ServiceUrls,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceUrls {
	#[serde(rename = "AI_API_URL", default)]
	pub ai_api_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Credentials {
	pub client_id: String,
	pub client_secret: String,
	pub auth_url: String,
	pub api_base: Option<String>,
}

/// Resolve SAP credentials: discrete `AICORE_*` variables first, falling back
/// per-field to the `AICORE_SERVICE_KEY` JSON blob.
pub fn resolve_credentials() -> Option<Credentials> {
	let key: Option<ServiceKey> = std::env::var(SERVICE_KEY_ENV)
		.ok()
		.and_then(|raw| serde_json::from_str(&raw).ok());

	let client_id = std::env::var(CLIENT_ID_ENV)
		.ok()
		.or_else(|| key.as_ref().map(|k| k.clientid.clone()))?;
	let client_secret = std::env::var(CLIENT_SECRET_ENV)
		.ok()
		.or_else(|| key.as_ref().map(|k| k.clientsecret.clone()))?;
	let auth_url = std::env::var(AUTH_URL_ENV)
		.ok()
		.or_else(|| key.as_ref().map(|k| k.url.clone()))?;
	let api_base = std::env::var(BASE_URL_ENV)
		.ok()
		.or_else(|| key.as_ref().and_then(|k| k.serviceurls.ai_api_url.clone()));

	Some(Credentials {
		client_id,
		client_secret,
		auth_url,
		api_base,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn submodel_parsing() {
		assert_eq!(
			submodel_namespace("anthropic--claude-4.5-sonnet"),
			Some("anthropic")
		);
		assert_eq!(submodel_namespace("gpt-4o"), None);
		let p = Provider::default();
		assert!(p.is_anthropic_submodel("anthropic--claude-4.5-sonnet"));
		assert!(!p.is_anthropic_submodel("meta--llama-3"));
	}

	#[test]
	fn service_key_blob_parses() {
		let key: ServiceKey = serde_json::from_str(
			r#"{"clientid": "c", "clientsecret": "s", "url": "https://auth.example.com",
			    "serviceurls": {"AI_API_URL": "https://api.ai.example.com"}}"#,
		)
		.unwrap();
		assert_eq!(key.clientid, "c");
		assert_eq!(
			key.serviceurls.ai_api_url.as_deref(),
			Some("https://api.ai.example.com")
		);
	}
}
