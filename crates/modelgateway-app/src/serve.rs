//! The OpenAI-compatible HTTP surface, wired to the gateway pipeline.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::routing::{get, post};
use bytes::Bytes;
use http::HeaderMap;
use modelgateway::client::HttpTransport;
use modelgateway::config::Config;
use modelgateway::error::{ErrorKind, GatewayError};
use modelgateway::http::{Body, Response, StatusCode};
use modelgateway::llm::RouteType;
use modelgateway::llm::types::{completions, embeddings, messages};
use modelgateway::mcp::rbac::McpCaller;
use modelgateway::proxy::{API_KEY_HEADER, CallContext, Gateway};
use serde_json::{Value, json};
use tracing::info;

pub async fn run(cfg: Config, addr: &str) -> anyhow::Result<()> {
	let gateway = Arc::new(Gateway::from_config(cfg, Arc::new(HttpTransport::default()))?);
	let app = router(gateway);
	let listener = tokio::net::TcpListener::bind(addr).await?;
	info!("listening on {addr}");
	axum::serve(listener, app).await?;
	Ok(())
}

pub fn router(gateway: Arc<Gateway>) -> Router {
	Router::new()
		.route("/v1/chat/completions", post(chat_completions))
		.route("/chat/completions", post(chat_completions))
		.route("/v1/embeddings", post(embeddings))
		.route("/v1/messages", post(messages_handler))
		.route("/v1/messages/count_tokens", post(count_tokens))
		.route("/v1/rerank", post(rerank))
		.route("/v1/audio/speech", post(passthrough))
		.route("/v1/images/generations", post(passthrough))
		.route("/v1/images/edits", post(passthrough))
		.route("/v1/videos/generations", post(passthrough))
		.route("/v1/responses", post(responses))
		.route("/v1/models", get(models))
		.route("/mcp", post(mcp))
		.route("/health", get(health))
		.with_state(gateway)
}

/// Authenticate the call and assemble its context. Keys arrive as
/// `Authorization: Bearer` or the dedicated header.
fn authenticate(gateway: &Gateway, headers: &HeaderMap) -> Result<CallContext, Response> {
	let token = headers
		.get(http::header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "))
		.or_else(|| {
			headers
				.get(API_KEY_HEADER)
				.and_then(|v| v.to_str().ok())
		});

	let mut ctx = CallContext::new(headers.clone(), gateway.router.request_timeout());
	// Auth is only enforced once a master key is configured.
	if gateway.general.master_key.is_some() {
		let Some(token) = token else {
			return Err(
				GatewayError::new(ErrorKind::AuthenticationError, "missing api key").into_response(),
			);
		};
		let Some(policy) = gateway.policies.lookup_key(token) else {
			return Err(
				GatewayError::new(ErrorKind::AuthenticationError, "invalid api key").into_response(),
			);
		};
		// The policy's guardrail attachments are team-scoped and picked up by
		// the pipeline's hook selection; only per-call opt-ins ride
		// `requested_guardrails`.
		ctx.key_hash = Some(key_hash(token));
		ctx.policy = Some(policy);
	}
	Ok(ctx)
}

fn key_hash(token: &str) -> String {
	use sha2::{Digest, Sha256};
	let digest = Sha256::digest(token.as_bytes());
	digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

fn parse_json<T: serde::de::DeserializeOwned>(bytes: &Bytes) -> Result<T, Response> {
	serde_json::from_slice(bytes).map_err(|e| {
		GatewayError::bad_request(format!("invalid request body: {e}")).into_response()
	})
}

async fn chat_completions(
	State(gateway): State<Arc<Gateway>>,
	headers: HeaderMap,
	bytes: Bytes,
) -> Response {
	let ctx = match authenticate(&gateway, &headers) {
		Ok(ctx) => ctx,
		Err(resp) => return resp,
	};
	let req: completions::Request = match parse_json(&bytes) {
		Ok(req) => req,
		Err(resp) => return resp,
	};
	gateway.chat_completions(ctx, req).await
}

async fn messages_handler(
	State(gateway): State<Arc<Gateway>>,
	headers: HeaderMap,
	bytes: Bytes,
) -> Response {
	let ctx = match authenticate(&gateway, &headers) {
		Ok(ctx) => ctx,
		Err(resp) => return resp,
	};
	let req: messages::Request = match parse_json(&bytes) {
		Ok(req) => req,
		Err(resp) => return resp,
	};
	gateway.messages(ctx, req).await
}

async fn embeddings(
	State(gateway): State<Arc<Gateway>>,
	headers: HeaderMap,
	bytes: Bytes,
) -> Response {
	let ctx = match authenticate(&gateway, &headers) {
		Ok(ctx) => ctx,
		Err(resp) => return resp,
	};
	let req: embeddings::Request = match parse_json(&bytes) {
		Ok(req) => req,
		Err(resp) => return resp,
	};
	gateway.embeddings(ctx, req).await
}

async fn count_tokens(
	State(gateway): State<Arc<Gateway>>,
	headers: HeaderMap,
	bytes: Bytes,
) -> Response {
	forward(gateway, headers, bytes, RouteType::CountTokens).await
}

async fn rerank(
	State(gateway): State<Arc<Gateway>>,
	headers: HeaderMap,
	bytes: Bytes,
) -> Response {
	// Validate the body against the rerank shape before forwarding.
	if let Err(resp) = parse_json::<modelgateway::llm::types::rerank::Request>(&bytes) {
		return resp;
	}
	forward(gateway, headers, bytes, RouteType::Rerank).await
}

async fn responses(
	State(gateway): State<Arc<Gateway>>,
	headers: HeaderMap,
	bytes: Bytes,
) -> Response {
	forward(gateway, headers, bytes, RouteType::Responses).await
}

async fn passthrough(
	State(gateway): State<Arc<Gateway>>,
	headers: HeaderMap,
	bytes: Bytes,
) -> Response {
	forward(gateway, headers, bytes, RouteType::Passthrough).await
}

/// Provider-native endpoints forward verbatim after routing and credential
/// injection; the body's `model` picks the deployment.
async fn forward(
	gateway: Arc<Gateway>,
	headers: HeaderMap,
	bytes: Bytes,
	route: RouteType,
) -> Response {
	let ctx = match authenticate(&gateway, &headers) {
		Ok(ctx) => ctx,
		Err(resp) => return resp,
	};
	let model = serde_json::from_slice::<Value>(&bytes)
		.ok()
		.and_then(|v| v.get("model").and_then(|m| m.as_str()).map(str::to_string));
	let Some(model) = model else {
		return GatewayError::bad_request("model not specified").into_response();
	};
	gateway.passthrough_call(ctx, &model, route, bytes).await
}

async fn models(State(gateway): State<Arc<Gateway>>, headers: HeaderMap) -> Response {
	if let Err(resp) = authenticate(&gateway, &headers) {
		return resp;
	}
	let registry = gateway.router.registry();
	let data: Vec<Value> = registry
		.group_names()
		.map(|name| {
			json!({
				"id": name.as_str(),
				"object": "model",
				"owned_by": "modelgateway",
			})
		})
		.collect();
	modelgateway::http::json_response(StatusCode::OK, &json!({"object": "list", "data": data}))
}

/// Minimal MCP server surface: JSON-RPC over POST, proxying `tools/list` and
/// `tools/call` through the gateway's access-control and cost layer.
async fn mcp(
	State(gateway): State<Arc<Gateway>>,
	headers: HeaderMap,
	bytes: Bytes,
) -> Response {
	let ctx = match authenticate(&gateway, &headers) {
		Ok(ctx) => ctx,
		Err(resp) => return resp,
	};
	let caller = McpCaller {
		access_groups: ctx
			.policy
			.as_ref()
			.map(|p| p.mcp_access_groups.clone())
			.unwrap_or_default(),
		user_id: ctx.key_hash.clone(),
		..Default::default()
	}
	.with_server_filter(
		headers
			.get("x-mcp-servers")
			.and_then(|v| v.to_str().ok()),
	);

	let request: Value = match parse_json(&bytes) {
		Ok(v) => v,
		Err(resp) => return resp,
	};
	let id = request.get("id").cloned().unwrap_or(Value::Null);
	let method = request.get("method").and_then(|m| m.as_str()).unwrap_or("");

	let result = match method {
		"initialize" => Ok(json!({
			"protocolVersion": "2025-03-26",
			"capabilities": {"tools": {}},
			"serverInfo": {"name": "modelgateway", "version": env!("CARGO_PKG_VERSION")},
		})),
		"notifications/initialized" => {
			return http::Response::builder()
				.status(StatusCode::ACCEPTED)
				.body(Body::empty())
				.expect("static response");
		},
		"tools/list" => match gateway.mcp_list_tools(&ctx, &caller).await {
			Ok(tools) => Ok(json!({
				"tools": tools.iter().map(|t| &t.tool).collect::<Vec<_>>(),
			})),
			Err(e) => Err(e.into_response()),
		},
		"tools/call" => {
			let name = request
				.pointer("/params/name")
				.and_then(|v| v.as_str())
				.unwrap_or_default()
				.to_string();
			let args = request.pointer("/params/arguments").cloned();
			match gateway.mcp_call_tool(ctx, &caller, &name, args).await {
				Ok(result) => Ok(serde_json::to_value(result).unwrap_or_default()),
				Err(resp) => Err(resp),
			}
		},
		_ => Ok(json!({"error": format!("method {method} not supported")})),
	};

	match result {
		Ok(result) => modelgateway::http::json_response(
			StatusCode::OK,
			&json!({"jsonrpc": "2.0", "id": id, "result": result}),
		),
		Err(resp) => resp,
	}
}

async fn health() -> Response {
	modelgateway::http::json_response(StatusCode::OK, &json!({"status": "ok"}))
}
