//! The provider registry: deployments built from config, model-string
//! resolution, and credential precedence.
//!
//! Resolution order for a request's `model`:
//! 1. a configured model-group alias → the router selects a deployment;
//! 2. a `provider/model` prefix → that provider, ad-hoc deployment;
//! 3. anything else → treated as an OpenAI model.

use std::collections::HashMap;
use std::sync::Arc;

use secrecy::SecretString;

use crate::config::{ModelEntry, RouterSettings};
use crate::error::{ErrorKind, GatewayError};
use crate::llm::cost::ModelInfo;
use crate::llm::{AIProvider, anthropic, azureopenai, bedrock, gemini, openai, sap, vertex};
use crate::{Strng, strng};

/// A concrete `(provider, model, credentials, endpoint)` binding. Deployments
/// sharing a `model_name` form a model group.
#[derive(Debug, Clone)]
pub struct Deployment {
	pub id: Strng,
	pub model_name: Strng,
	pub provider: AIProvider,
	/// Provider-side model id, after the prefix is stripped.
	pub model: Strng,
	pub api_base: Option<Strng>,
	/// Key as written in config; may be an `os.environ/NAME` indirection.
	pub api_key: Option<String>,
	pub rpm: Option<u64>,
	pub tpm: Option<u64>,
	/// Model-level guardrail attachments for this deployment's group.
	pub guardrails: Vec<String>,
	pub info: Arc<ModelInfo>,
}

impl Deployment {
	/// The canonical `provider/model` spelling used in fallback chains and
	/// logs. Deployment ids additionally carry a `#index` disambiguator,
	/// which is stripped here.
	pub fn qualified_model(&self) -> Strng {
		match self.id.split_once('#') {
			Some((qualified, _)) => crate::strng::new(qualified),
			None => self.id.clone(),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
	#[error("unknown provider: {0}")]
	UnknownProvider(String),
	#[error("unknown model: {0}")]
	UnknownModel(String),
	#[error("missing credential for {0}")]
	MissingCredential(String),
	#[error("invalid deployment {0}: {1}")]
	InvalidDeployment(String, String),
}

impl From<RegistryError> for GatewayError {
	fn from(e: RegistryError) -> Self {
		let kind = match &e {
			RegistryError::UnknownProvider(_) | RegistryError::UnknownModel(_) => ErrorKind::NotFound,
			RegistryError::MissingCredential(_) => ErrorKind::AuthenticationError,
			RegistryError::InvalidDeployment(_, _) => ErrorKind::BadRequest,
		};
		GatewayError::new(kind, e.to_string())
	}
}

#[derive(Debug)]
pub enum Resolution {
	/// The model string names a configured group; deployment selection is
	/// deferred to the router.
	Group(Strng),
	Deployment(Arc<Deployment>),
}

#[derive(Debug, Default)]
pub struct Registry {
	deployments: HashMap<Strng, Arc<Deployment>>,
	groups: HashMap<Strng, Vec<Arc<Deployment>>>,
	pub fallbacks: HashMap<String, Vec<String>>,
}

impl Registry {
	pub fn from_config(
		model_list: &[ModelEntry],
		router: &RouterSettings,
	) -> Result<Registry, RegistryError> {
		let mut reg = Registry {
			fallbacks: router.fallback_map(),
			..Default::default()
		};
		for (idx, entry) in model_list.iter().enumerate() {
			let dep = Arc::new(build_deployment(entry, idx)?);
			reg
				.groups
				.entry(dep.model_name.clone())
				.or_default()
				.push(dep.clone());
			reg.deployments.insert(dep.id.clone(), dep);
		}
		Ok(reg)
	}

	pub fn deployment(&self, id: &str) -> Option<Arc<Deployment>> {
		self.deployments.get(id).cloned()
	}

	pub fn group(&self, name: &str) -> Option<&[Arc<Deployment>]> {
		self.groups.get(name).map(|v| v.as_slice())
	}

	pub fn group_names(&self) -> impl Iterator<Item = &Strng> {
		self.groups.keys()
	}

	pub fn resolve(&self, model: &str) -> Result<Resolution, RegistryError> {
		if self.groups.contains_key(model) {
			return Ok(Resolution::Group(strng::new(model)));
		}
		let dep = ad_hoc_deployment(model)?;
		Ok(Resolution::Deployment(Arc::new(dep)))
	}
}

/// Resolve a credential for a deployment. Precedence: per-call override,
/// deployment config (with `os.environ/NAME` indirection), provider
/// environment variable.
pub fn resolve_credential(
	dep: &Deployment,
	per_call: Option<&str>,
) -> Result<Option<SecretString>, RegistryError> {
	if let Some(key) = per_call {
		return Ok(Some(SecretString::from(key.to_string())));
	}
	if let Some(configured) = &dep.api_key {
		let key = match configured.strip_prefix("os.environ/") {
			Some(var) => std::env::var(var)
				.map_err(|_| RegistryError::MissingCredential(format!("{} ({var} unset)", dep.id)))?,
			None => configured.clone(),
		};
		return Ok(Some(SecretString::from(key)));
	}
	let env = match &dep.provider {
		AIProvider::OpenAI(_) => openai::API_KEY_ENV,
		AIProvider::AzureOpenAI(_) => azureopenai::API_KEY_ENV,
		AIProvider::Anthropic(_) => anthropic::API_KEY_ENV,
		AIProvider::Gemini(_) => gemini::API_KEY_ENV,
		AIProvider::Vertex(_) => vertex::ACCESS_TOKEN_ENV,
		AIProvider::Bedrock(_) => bedrock::API_KEY_ENV,
		// SAP exchanges client credentials for a token; no static key.
		AIProvider::Sap(_) => return Ok(None),
	};
	match std::env::var(env) {
		Ok(key) => Ok(Some(SecretString::from(key))),
		Err(_) => Err(RegistryError::MissingCredential(format!(
			"{} ({env} unset)",
			dep.id
		))),
	}
}

/// Split a `provider/model` string. Providers using a second `--` separator
/// to namespace sub-models (SAP) keep that part inside `model`; the adapter
/// owns parsing it.
pub fn split_model(model: &str) -> (Option<&str>, &str) {
	match model.split_once('/') {
		Some((prefix, rest)) if !rest.is_empty() => (Some(prefix), rest),
		_ => (None, model),
	}
}

struct TagInfo {
	provider: fn(&ModelEntry, &str) -> Result<AIProvider, RegistryError>,
	/// Default API base for OpenAI-compatible hosted providers.
	default_api_base: Option<&'static str>,
}

fn openai_compat(base: &'static str) -> TagInfo {
	TagInfo {
		provider: |_, _| Ok(AIProvider::OpenAI(openai::Provider::default())),
		default_api_base: Some(base),
	}
}

fn tag_info(tag: &str) -> Option<TagInfo> {
	Some(match tag {
		"openai" => TagInfo {
			provider: |_, _| Ok(AIProvider::OpenAI(openai::Provider::default())),
			default_api_base: None,
		},
		"azure" => TagInfo {
			provider: |entry, _| {
				let host = entry
					.params
					.api_base
					.as_deref()
					.and_then(host_of)
					.or_else(|| std::env::var("AZURE_API_BASE").ok().as_deref().and_then(host_of))
					.ok_or_else(|| {
						RegistryError::InvalidDeployment(
							entry.model_name.clone(),
							"azure deployments require api_base".to_string(),
						)
					})?;
				Ok(AIProvider::AzureOpenAI(azureopenai::Provider {
					model: None,
					host: strng::new(&host),
					api_version: entry.params.api_version.as_deref().map(strng::new),
				}))
			},
			default_api_base: None,
		},
		"anthropic" => TagInfo {
			provider: |_, _| Ok(AIProvider::Anthropic(anthropic::Provider::default())),
			default_api_base: None,
		},
		"gemini" => TagInfo {
			provider: |_, _| Ok(AIProvider::Gemini(gemini::Provider::default())),
			default_api_base: None,
		},
		"vertex_ai" | "vertex" => TagInfo {
			provider: |entry, _| {
				let project = entry
					.params
					.project
					.clone()
					.or_else(|| extra_str(entry, "vertex_project"))
					.or_else(|| std::env::var("VERTEX_PROJECT").ok())
					.ok_or_else(|| {
						RegistryError::InvalidDeployment(
							entry.model_name.clone(),
							"vertex deployments require a project".to_string(),
						)
					})?;
				Ok(AIProvider::Vertex(vertex::Provider {
					model: None,
					region: entry
						.params
						.region
						.as_deref()
						.map(strng::new)
						.or_else(|| extra_str(entry, "vertex_location").as_deref().map(strng::new)),
					project_id: strng::new(&project),
				}))
			},
			default_api_base: None,
		},
		"bedrock" => TagInfo {
			provider: |entry, _| {
				let region = entry
					.params
					.region
					.clone()
					.or_else(|| extra_str(entry, "aws_region_name"))
					.or_else(|| std::env::var("AWS_REGION").ok())
					.unwrap_or_else(|| "us-east-1".to_string());
				Ok(AIProvider::Bedrock(bedrock::Provider {
					model: None,
					region: strng::new(&region),
					guardrail_identifier: extra_str(entry, "guardrail_identifier")
						.as_deref()
						.map(strng::new),
					guardrail_version: extra_str(entry, "guardrail_version")
						.as_deref()
						.map(strng::new),
				}))
			},
			default_api_base: None,
		},
		"sap" => TagInfo {
			provider: |entry, _| {
				Ok(AIProvider::Sap(sap::Provider {
					model: None,
					deployment_id: extra_str(entry, "deployment_id").as_deref().map(strng::new),
					resource_group: extra_str(entry, "resource_group").as_deref().map(strng::new),
				}))
			},
			default_api_base: None,
		},
		// OpenAI-compatible hosted providers ride the OpenAI adapter with a
		// different base URL and key.
		"mistral" => openai_compat("https://api.mistral.ai/v1"),
		"cohere" => openai_compat("https://api.cohere.ai/compatibility/v1"),
		_ => return None,
	})
}

fn api_key_env_for_tag(tag: &str) -> Option<&'static str> {
	match tag {
		"mistral" => Some("MISTRAL_API_KEY"),
		"cohere" => Some("COHERE_API_KEY"),
		_ => None,
	}
}

fn extra_str(entry: &ModelEntry, key: &str) -> Option<String> {
	entry
		.params
		.extra
		.get(key)
		.and_then(|v| v.as_str())
		.map(str::to_string)
}

fn host_of(url: &str) -> Option<String> {
	url::Url::parse(url)
		.ok()
		.and_then(|u| u.host_str().map(str::to_string))
}

fn build_deployment(entry: &ModelEntry, idx: usize) -> Result<Deployment, RegistryError> {
	let (tag, model) = split_model(&entry.params.model);
	let tag = tag.unwrap_or("openai");
	let info = tag_info(tag).ok_or_else(|| RegistryError::UnknownProvider(tag.to_string()))?;
	let provider = (info.provider)(entry, model)?;
	let api_base = entry
		.params
		.api_base
		.clone()
		.or_else(|| info.default_api_base.map(str::to_string));
	// Compat providers keep their own key env when the config has none.
	let api_key = entry.params.api_key.clone().or_else(|| {
		api_key_env_for_tag(tag).map(|env| format!("os.environ/{env}"))
	});
	Ok(Deployment {
		id: strng::format!("{}/{}#{}", tag, model, idx),
		model_name: strng::new(&entry.model_name),
		provider,
		model: strng::new(model),
		api_base: api_base.as_deref().map(strng::new),
		api_key,
		rpm: entry.params.rpm,
		tpm: entry.params.tpm,
		guardrails: entry.params.guardrails.clone(),
		info: Arc::new(entry.model_info.clone().unwrap_or_default()),
	})
}

/// Deployment for an unconfigured `provider/model` (or bare OpenAI model)
/// request; credentials come from the environment.
fn ad_hoc_deployment(model: &str) -> Result<Deployment, RegistryError> {
	let (tag, rest) = split_model(model);
	let (tag, rest) = match tag {
		Some(t) if tag_info(t).is_some() => (t, rest),
		// Unknown prefix: the whole string is an OpenAI model (some OpenAI
		// model ids legitimately contain slashes).
		_ => ("openai", model),
	};
	let entry = ModelEntry {
		model_name: model.to_string(),
		params: crate::config::DeploymentParams {
			model: format!("{tag}/{rest}"),
			..Default::default()
		},
		model_info: None,
	};
	let info = tag_info(tag).expect("tag already validated");
	let provider = (info.provider)(&entry, rest)?;
	let api_key = api_key_env_for_tag(tag).map(|env| format!("os.environ/{env}"));
	Ok(Deployment {
		id: strng::format!("{tag}/{rest}"),
		model_name: strng::new(model),
		provider,
		model: strng::new(rest),
		api_base: info.default_api_base.map(strng::new),
		api_key,
		rpm: None,
		tpm: None,
		guardrails: Vec::new(),
		info: Arc::new(ModelInfo::default()),
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;

	fn registry() -> Registry {
		let cfg = Config::parse(
			r#"
model_list:
  - model_name: gpt-4o
    litellm_params:
      model: openai/gpt-4o
      api_key: sk-direct
  - model_name: gpt-4o
    litellm_params:
      model: azure/gpt-4o-eastus
      api_base: https://eastus.example.azure.com
  - model_name: claude
    litellm_params:
      model: bedrock/anthropic.claude-sonnet-4-5
      region: us-west-2
"#,
		)
		.unwrap();
		Registry::from_config(&cfg.model_list, &cfg.router_settings).unwrap()
	}

	#[test]
	fn groups_are_built() {
		let reg = registry();
		assert_eq!(reg.group("gpt-4o").unwrap().len(), 2);
		assert_eq!(reg.group("claude").unwrap().len(), 1);
		assert!(matches!(
			reg.resolve("gpt-4o").unwrap(),
			Resolution::Group(_)
		));
	}

	#[test]
	fn prefixed_model_resolves_ad_hoc() {
		let reg = registry();
		let Resolution::Deployment(dep) = reg.resolve("anthropic/claude-sonnet-4-5").unwrap() else {
			panic!("expected deployment");
		};
		assert!(matches!(dep.provider, AIProvider::Anthropic(_)));
		assert_eq!(dep.model.as_str(), "claude-sonnet-4-5");
	}

	#[test]
	fn unknown_prefix_is_treated_as_openai() {
		let reg = registry();
		let Resolution::Deployment(dep) = reg.resolve("ft:gpt-4o/custom").unwrap() else {
			panic!("expected deployment");
		};
		assert!(matches!(dep.provider, AIProvider::OpenAI(_)));
		assert_eq!(dep.model.as_str(), "ft:gpt-4o/custom");
	}

	#[test]
	fn credential_precedence() {
		let reg = registry();
		let dep = reg.group("gpt-4o").unwrap()[0].clone();
		// Per-call override wins over the configured key.
		let key = resolve_credential(&dep, Some("sk-override")).unwrap().unwrap();
		use secrecy::ExposeSecret;
		assert_eq!(key.expose_secret(), "sk-override");
		let key = resolve_credential(&dep, None).unwrap().unwrap();
		assert_eq!(key.expose_secret(), "sk-direct");
	}

	#[test]
	fn bedrock_region_is_bound() {
		let reg = registry();
		let dep = reg.group("claude").unwrap()[0].clone();
		let AIProvider::Bedrock(p) = &dep.provider else {
			panic!("expected bedrock");
		};
		assert_eq!(p.region.as_str(), "us-west-2");
		assert_eq!(p.get_host().as_str(), "bedrock-runtime.us-west-2.amazonaws.com");
	}
}
