//! The upstream HTTP transport: provider calls built by the adapters are
//! dispatched over per-provider connection pools.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::TryStreamExt;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{ErrorKind, GatewayError};
use crate::http::{Body, HeaderMap, HeaderValue, Method, StatusCode, header};
use crate::llm::registry::Deployment;
use crate::llm::{AIProvider, LLMRequest, RouteType, anthropic, gemini, openai, sap};
use crate::{Strng, strng};

/// A fully-prepared provider request: method, URL, headers (credentials
/// already injected), body.
#[derive(Debug)]
pub struct ProviderCall {
	pub method: Method,
	pub url: String,
	pub headers: HeaderMap,
	pub body: Bytes,
	pub timeout: Duration,
}

#[derive(Debug)]
pub struct ProviderResponse {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Body,
}

/// Transport contract; swapped for a fake in router and pipeline tests.
#[async_trait]
pub trait Transport: Send + Sync {
	async fn dispatch(&self, provider: Strng, call: ProviderCall)
	-> Result<ProviderResponse, GatewayError>;
}

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE: usize = 32;

/// Reqwest-backed transport with one bounded pool per provider. Idle
/// connections are reaped by the pool's idle timeout.
pub struct HttpTransport {
	clients: Mutex<HashMap<Strng, reqwest::Client>>,
	pool_max_idle: usize,
}

impl Default for HttpTransport {
	fn default() -> Self {
		Self::new(DEFAULT_POOL_MAX_IDLE)
	}
}

impl HttpTransport {
	pub fn new(pool_max_idle: usize) -> Self {
		Self {
			clients: Mutex::new(HashMap::new()),
			pool_max_idle,
		}
	}

	fn client_for(&self, provider: &Strng) -> Result<reqwest::Client, GatewayError> {
		let mut clients = self.clients.lock();
		if let Some(c) = clients.get(provider) {
			return Ok(c.clone());
		}
		let client = reqwest::Client::builder()
			.pool_max_idle_per_host(self.pool_max_idle)
			.pool_idle_timeout(POOL_IDLE_TIMEOUT)
			.build()
			.map_err(|e| GatewayError::internal(format!("failed to build http client: {e}")))?;
		clients.insert(provider.clone(), client.clone());
		Ok(client)
	}
}

#[async_trait]
impl Transport for HttpTransport {
	async fn dispatch(
		&self,
		provider: Strng,
		call: ProviderCall,
	) -> Result<ProviderResponse, GatewayError> {
		let client = self.client_for(&provider)?;
		let result = client
			.request(call.method, &call.url)
			.headers(call.headers)
			.body(call.body)
			.timeout(call.timeout)
			.send()
			.await;
		let resp = match result {
			Ok(resp) => resp,
			Err(e) if e.is_timeout() => {
				return Err(GatewayError::new(
					ErrorKind::Timeout,
					format!("upstream request timed out: {e}"),
				));
			},
			Err(e) => {
				return Err(GatewayError::upstream(format!("upstream request failed: {e}")));
			},
		};
		let status = resp.status();
		let headers = resp.headers().clone();
		let body = Body::from_stream(resp.bytes_stream().map_err(axum::Error::new));
		Ok(ProviderResponse {
			status,
			headers,
			body,
		})
	}
}

/// Assemble the provider call for a translated body: endpoint URL, version
/// and beta headers, and credential injection, per adapter.
pub fn build_provider_call(
	dep: &Deployment,
	route: RouteType,
	llm_req: Option<&LLMRequest>,
	body: Bytes,
	credential: Option<&SecretString>,
	beta_header: Option<&str>,
	forwarded: HeaderMap,
	timeout: Duration,
) -> Result<ProviderCall, GatewayError> {
	let streaming = llm_req.map(|l| l.streaming).unwrap_or(false);
	let model = llm_req
		.map(|l| l.request_model.as_str())
		.unwrap_or(dep.model.as_str());

	let mut headers = forwarded;
	headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

	let path: Strng = match &dep.provider {
		AIProvider::OpenAI(_) => strng::new(openai::path(route)),
		AIProvider::AzureOpenAI(p) => p.get_path_for_model(route, model),
		AIProvider::Anthropic(_) => strng::new(anthropic::path(route)),
		AIProvider::Gemini(_) => gemini::path(route, model, streaming),
		AIProvider::Vertex(p) => p.get_path_for_model(route, Some(model), streaming),
		AIProvider::Bedrock(p) => p.get_path_for_route(route, streaming, model),
		AIProvider::Sap(p) => p.get_path_for_model(route, model),
	};

	let base = match &dep.api_base {
		Some(base) => base.trim_end_matches('/').to_string(),
		None => default_base(&dep.provider)?,
	};
	// api_base may already carry a path prefix (e.g. ".../v1"); provider
	// paths that repeat it collapse naturally at the provider side only for
	// hosts, so paths are always appended to the configured base.
	let url = if base.ends_with("/v1") && path.starts_with("/v1/") {
		format!("{base}{}", &path[3..])
	} else {
		format!("{base}{path}")
	};

	apply_credential(&dep.provider, &mut headers, credential)?;
	if let Some(beta) = beta_header {
		headers.insert(
			"anthropic-beta",
			HeaderValue::from_str(beta)
				.map_err(|e| GatewayError::internal(format!("invalid beta header: {e}")))?,
		);
	}
	if let AIProvider::Sap(p) = &dep.provider {
		headers.insert(
			sap::RESOURCE_GROUP_HEADER,
			HeaderValue::from_str(p.resource_group().as_str())
				.map_err(|e| GatewayError::internal(format!("invalid resource group: {e}")))?,
		);
	}

	Ok(ProviderCall {
		method: Method::POST,
		url,
		headers,
		body,
		timeout,
	})
}

fn default_base(provider: &AIProvider) -> Result<String, GatewayError> {
	Ok(match provider {
		AIProvider::OpenAI(_) => format!("https://{}", openai::DEFAULT_HOST),
		AIProvider::AzureOpenAI(p) => format!("https://{}", p.get_host()),
		AIProvider::Anthropic(_) => format!("https://{}", anthropic::DEFAULT_HOST),
		AIProvider::Gemini(_) => format!("https://{}", gemini::DEFAULT_HOST),
		AIProvider::Vertex(p) => format!("https://{}", p.get_host()),
		AIProvider::Bedrock(p) => format!("https://{}", p.get_host()),
		AIProvider::Sap(_) => {
			let creds = sap::resolve_credentials().and_then(|c| c.api_base);
			match creds {
				Some(base) => base.trim_end_matches('/').to_string(),
				None => {
					return Err(GatewayError::new(
						ErrorKind::AuthenticationError,
						"sap deployments require an api_base or AICORE_SERVICE_KEY",
					));
				},
			}
		},
	})
}

fn apply_credential(
	provider: &AIProvider,
	headers: &mut HeaderMap,
	credential: Option<&SecretString>,
) -> Result<(), GatewayError> {
	let Some(credential) = credential else {
		return Ok(());
	};
	let sensitive = |v: &str| -> Result<HeaderValue, GatewayError> {
		let mut value = HeaderValue::from_str(v)
			.map_err(|_| GatewayError::new(ErrorKind::AuthenticationError, "invalid credential"))?;
		value.set_sensitive(true);
		Ok(value)
	};
	match provider {
		AIProvider::OpenAI(_)
		| AIProvider::Vertex(_)
		| AIProvider::Bedrock(_)
		| AIProvider::Sap(_) => {
			headers.insert(
				header::AUTHORIZATION,
				sensitive(&format!("Bearer {}", credential.expose_secret()))?,
			);
		},
		AIProvider::AzureOpenAI(_) => {
			headers.insert("api-key", sensitive(credential.expose_secret())?);
		},
		AIProvider::Anthropic(_) => {
			headers.insert("x-api-key", sensitive(credential.expose_secret())?);
			headers.insert(
				"anthropic-version",
				HeaderValue::from_static(anthropic::API_VERSION),
			);
		},
		AIProvider::Gemini(_) => {
			headers.insert("x-goog-api-key", sensitive(credential.expose_secret())?);
		},
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::llm::InputFormat;
	use crate::llm::registry::{Registry, Resolution};

	fn deployment(model: &str) -> Deployment {
		let reg = Registry::default();
		match reg.resolve(model).unwrap() {
			Resolution::Deployment(d) => std::sync::Arc::into_inner(d).unwrap(),
			_ => panic!("expected deployment"),
		}
	}

	fn llm_req(model: &str, streaming: bool) -> LLMRequest {
		LLMRequest {
			input_tokens: None,
			input_format: InputFormat::Completions,
			request_model: strng::new(model),
			provider: strng::literal!("test"),
			streaming,
			params: Default::default(),
		}
	}

	#[test]
	fn openai_call_shape() {
		let dep = deployment("openai/gpt-4o");
		let key = SecretString::from("sk-test".to_string());
		let call = build_provider_call(
			&dep,
			RouteType::Completions,
			Some(&llm_req("gpt-4o", false)),
			Bytes::from_static(b"{}"),
			Some(&key),
			None,
			HeaderMap::new(),
			Duration::from_secs(30),
		)
		.unwrap();
		assert_eq!(call.url, "https://api.openai.com/v1/chat/completions");
		assert_eq!(
			call.headers.get(header::AUTHORIZATION).unwrap(),
			"Bearer sk-test"
		);
	}

	#[test]
	fn anthropic_version_header_is_set() {
		let dep = deployment("anthropic/claude-sonnet-4-5");
		let key = SecretString::from("sk-ant".to_string());
		let call = build_provider_call(
			&dep,
			RouteType::Messages,
			Some(&llm_req("claude-sonnet-4-5", false)),
			Bytes::new(),
			Some(&key),
			Some("advanced-tool-use-2025-11-20"),
			HeaderMap::new(),
			Duration::from_secs(30),
		)
		.unwrap();
		assert_eq!(call.url, "https://api.anthropic.com/v1/messages");
		assert_eq!(call.headers.get("x-api-key").unwrap(), "sk-ant");
		assert_eq!(call.headers.get("anthropic-version").unwrap(), anthropic::API_VERSION);
		assert_eq!(
			call.headers.get("anthropic-beta").unwrap(),
			"advanced-tool-use-2025-11-20"
		);
		assert!(call.headers.get(header::AUTHORIZATION).is_none());
	}

	#[test]
	fn compat_base_does_not_duplicate_v1() {
		let dep = deployment("mistral/mistral-large");
		let call = build_provider_call(
			&dep,
			RouteType::Completions,
			Some(&llm_req("mistral-large", false)),
			Bytes::new(),
			None,
			None,
			HeaderMap::new(),
			Duration::from_secs(30),
		)
		.unwrap();
		assert_eq!(call.url, "https://api.mistral.ai/v1/chat/completions");
	}

	#[test]
	fn gemini_streaming_path() {
		let dep = deployment("gemini/gemini-2.5-pro");
		let call = build_provider_call(
			&dep,
			RouteType::Completions,
			Some(&llm_req("gemini-2.5-pro", true)),
			Bytes::new(),
			None,
			None,
			HeaderMap::new(),
			Duration::from_secs(30),
		)
		.unwrap();
		assert_eq!(
			call.url,
			"https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=sse"
		);
	}
}
