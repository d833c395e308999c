//! The per-call pipeline: admission → hooks → router → adapter → transport
//! → translation → cost → audit record.
//!
//! All per-call state lives in a [`CallContext`] threaded through the
//! pipeline; process-wide state (router, hooks, limiters, sinks) is built
//! once at boot and read-mostly afterwards. The audit record travels in an
//! [`EmitGuard`] so that a client disconnect at any point still produces
//! exactly one record, marked `ClientCancelled`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;

use crate::client::{Transport, build_provider_call};
use crate::config::Config;
use crate::error::{ErrorKind, GatewayError};
use crate::hooks::{GuardrailRegistry, HookPipeline, HookPoint, HookSelection};
use crate::http::{Body, HeaderMap, Response, StatusCode, header};
use crate::llm::registry::{Deployment, Registry, resolve_credential};
use crate::llm::types::{RequestType, ResponseType, completions};
use crate::llm::{AIProvider, InputFormat, LLMInfo, LLMRequest, RouteType, anthropic, cost};
use crate::mcp::gateway::McpGateway;
use crate::mcp::rbac::McpCaller;
use crate::router::limits::{
	Admission, BudgetLimiter, DynamicRateLimiter, ParallelRequestLimiter, Priority,
};
use crate::router::Router;
use crate::store::{KeyPolicy, MemorySpendStore, PolicyStore, SpendScope, SpendStore, StaticPolicyStore};
use crate::telemetry::log::{AsyncLog, LogDispatcher, LoggingRecord};
use crate::{Strng, debug, strng, warn};

/// Compatibility alias also accepted on `Authorization: Bearer`.
pub const API_KEY_HEADER: &str = "x-litellm-api-key";
pub const RESPONSE_COST_HEADER: &str = "x-gateway-response-cost";

/// Process-wide state, initialized once at boot.
pub struct Gateway {
	pub router: Router,
	pub hooks: Arc<HookPipeline>,
	pub transport: Arc<dyn Transport>,
	pub spend: Arc<dyn SpendStore>,
	pub policies: Arc<dyn PolicyStore>,
	pub logs: LogDispatcher,
	pub mcp: Arc<McpGateway>,
	parallel: ParallelRequestLimiter,
	budget: BudgetLimiter,
	group_limiters: Mutex<HashMap<Strng, Arc<DynamicRateLimiter>>>,
	pub settings: crate::config::GatewaySettings,
	pub general: crate::config::GeneralSettings,
}

impl Gateway {
	pub fn from_config(cfg: Config, transport: Arc<dyn Transport>) -> anyhow::Result<Gateway> {
		let registry = Registry::from_config(&cfg.model_list, &cfg.router_settings)?;
		let router = Router::new(registry, cfg.router_settings.clone());
		let hooks = Arc::new(HookPipeline::from_config(
			&cfg.guardrails,
			&GuardrailRegistry::default(),
		)?);
		let spend: Arc<dyn SpendStore> = Arc::new(MemorySpendStore::new());
		let policies = Arc::new(StaticPolicyStore::new(
			cfg.general_settings.master_key.clone(),
		));
		let logs = if cfg.general_settings.disable_spend_logs {
			LogDispatcher::disabled()
		} else {
			LogDispatcher::spawn(vec![
				Arc::new(crate::telemetry::log::StdoutSink) as Arc<dyn crate::telemetry::log::LoggingSink>,
			])
		};
		let mcp = Arc::new(McpGateway::new(cfg.mcp_servers.clone(), None)?);
		Ok(Gateway {
			router,
			hooks,
			transport,
			spend: spend.clone(),
			policies,
			logs,
			mcp,
			parallel: ParallelRequestLimiter::new(),
			budget: BudgetLimiter::new(spend, Duration::from_secs(30 * 24 * 3600)),
			group_limiters: Mutex::new(HashMap::new()),
			settings: cfg.gateway_settings,
			general: cfg.general_settings,
		})
	}

	fn group_limiter(&self, group: &Strng) -> Arc<DynamicRateLimiter> {
		let mut limiters = self.group_limiters.lock();
		if let Some(l) = limiters.get(group) {
			return l.clone();
		}
		let capacity = self
			.router
			.registry()
			.group(group.as_str())
			.map(|deps| deps.iter().filter_map(|d| d.rpm).sum::<u64>())
			.filter(|rpm| *rpm > 0)
			.unwrap_or(u64::MAX / 2);
		let limiter = Arc::new(DynamicRateLimiter::new(capacity));
		limiters.insert(group.clone(), limiter.clone());
		limiter
	}

	/// Guardrails attached at model level: the union across the group's
	/// deployments.
	fn model_guardrails(&self, model: &str) -> Vec<String> {
		let registry = self.router.registry();
		let Some(group) = registry.group(model) else {
			return Vec::new();
		};
		let mut out: Vec<String> = Vec::new();
		for dep in group {
			for name in &dep.guardrails {
				if !out.contains(name) {
					out.push(name.clone());
				}
			}
		}
		out
	}

	/// Assemble the scoped guardrail selection for one call: model-level
	/// attachments run first, then the key policy's team-level attachments,
	/// then the global guardrails (default-on plus per-call opt-ins).
	fn hook_selection(&self, ctx: &CallContext, model: &str) -> HookSelection {
		HookSelection {
			model: self.model_guardrails(model),
			team: ctx
				.policy
				.as_ref()
				.map(|p| p.guardrails.clone())
				.unwrap_or_default(),
			requested: ctx.requested_guardrails.clone().unwrap_or_default(),
		}
	}

	fn emit_guard(&self, ctx: &CallContext, model: &str, selection: HookSelection) -> EmitGuard {
		EmitGuard {
			logs: self.logs.clone(),
			spend: self.spend.clone(),
			hooks: self.hooks.clone(),
			selection,
			started: ctx.started,
			record: Some(ctx.base_record(model)),
			llm_log: None,
			cost_info: None,
		}
	}
}

/// Carries the audit record through the pipeline and guarantees exactly one
/// emission. Terminal paths consume the guard explicitly; if the call's
/// future is dropped instead (the client went away), Drop emits the record
/// with `error=ClientCancelled`, folding in partial usage from an in-flight
/// stream and running the logging-only hooks.
struct EmitGuard {
	logs: LogDispatcher,
	spend: Arc<dyn SpendStore>,
	hooks: Arc<HookPipeline>,
	selection: HookSelection,
	started: Instant,
	record: Option<LoggingRecord>,
	llm_log: Option<AsyncLog<LLMInfo>>,
	cost_info: Option<Arc<cost::ModelInfo>>,
}

impl EmitGuard {
	fn rec(&mut self) -> &mut LoggingRecord {
		self.record.as_mut().expect("record already taken")
	}

	/// Once a stream is in flight, cancellation must still capture whatever
	/// usage the bridge observed.
	fn attach_stream(&mut self, llm_log: AsyncLog<LLMInfo>, info: Arc<cost::ModelInfo>) {
		self.llm_log = Some(llm_log);
		self.cost_info = Some(info);
	}

	/// Take the record for explicit emission; Drop becomes a no-op.
	fn take(mut self) -> LoggingRecord {
		self.record.take().expect("record already taken")
	}
}

impl Drop for EmitGuard {
	fn drop(&mut self) {
		let Some(mut record) = self.record.take() else {
			return;
		};
		if let (Some(llm_log), Some(info)) = (&self.llm_log, &self.cost_info) {
			absorb_stream_info(&mut record, llm_log, info, self.started);
		}
		record.error = Some(ErrorKind::ClientCancelled.as_str().to_string());
		record
			.guardrail_results
			.extend(self.hooks.observe("client_cancelled", &self.selection));
		record.response_ts = Some(chrono::Utc::now());
		record.latency = self.started.elapsed();
		self.spend.record(&record);
		self.logs.emit(record);
	}
}

/// Fold whatever the stream produced into the record: usage (counted locally
/// when the provider never reported it), cost, and time-to-first-token.
/// Returns the assembled completion text for the stream-terminal hooks.
fn absorb_stream_info(
	record: &mut LoggingRecord,
	llm_log: &AsyncLog<LLMInfo>,
	info: &cost::ModelInfo,
	started: Instant,
) -> String {
	let Some(mut llm) = llm_log.take() else {
		return String::new();
	};
	crate::llm::amend_stream_usage(&mut llm);
	record.usage = llm.response.usage.clone();
	record.cost = record
		.usage
		.as_ref()
		.map(|u| cost::compute_cost(info, u))
		.unwrap_or_default();
	record.time_to_first_token = llm.response.first_token.map(|t| t.duration_since(started));
	llm
		.response
		.completion
		.as_ref()
		.map(|c| c.join(""))
		.unwrap_or_default()
}

/// Everything one call carries through the pipeline.
pub struct CallContext {
	pub call_id: String,
	pub started: Instant,
	pub deadline: Instant,
	pub headers: HeaderMap,
	pub key_hash: Option<String>,
	pub policy: Option<KeyPolicy>,
	pub tags: Vec<String>,
	/// Per-call overrides pulled from the request body.
	pub api_key_override: Option<String>,
	pub api_base_override: Option<String>,
	pub requested_guardrails: Option<Vec<String>>,
	/// Headers the caller asked to add to the provider request; these bypass
	/// the forwarding allowlist.
	pub extra_headers: HeaderMap,
	pub user: Option<String>,
}

impl CallContext {
	pub fn new(headers: HeaderMap, timeout: Duration) -> CallContext {
		let now = Instant::now();
		CallContext {
			call_id: format!("call-{}", uuid::Uuid::new_v4()),
			started: now,
			deadline: now + timeout,
			headers,
			key_hash: None,
			policy: None,
			tags: Vec::new(),
			api_key_override: None,
			api_base_override: None,
			requested_guardrails: None,
			extra_headers: HeaderMap::new(),
			user: None,
		}
	}

	fn base_record(&self, model: &str) -> LoggingRecord {
		let mut record = LoggingRecord::new(self.call_id.clone());
		record.model_group = strng::new(model);
		record.model = strng::new(model);
		record.key_hash = self.key_hash.clone();
		record.team = self.policy.as_ref().and_then(|p| p.team_id.clone());
		record.user = self.user.clone();
		record.tags = self.tags.clone();
		record
	}

	fn priority(&self) -> Priority {
		self.policy.as_ref().map(|p| p.priority).unwrap_or_default()
	}
}

/// Gateway-level parameters are stripped out of the request body before
/// provider translation: per-call guardrail selection and credential
/// overrides are not provider params.
pub fn extract_gateway_params(req: &mut completions::Request, ctx: &mut CallContext) {
	if let Some(v) = req.rest.remove("guardrails")
		&& let Ok(names) = serde_json::from_value::<Vec<String>>(v)
	{
		// Adds to any key-level selection rather than replacing it.
		ctx
			.requested_guardrails
			.get_or_insert_with(Vec::new)
			.extend(names);
	}
	if let Some(v) = req.rest.remove("api_key")
		&& let Some(key) = v.as_str()
	{
		ctx.api_key_override = Some(key.to_string());
	}
	if let Some(v) = req.rest.remove("api_base")
		&& let Some(base) = v.as_str()
	{
		ctx.api_base_override = Some(base.to_string());
	}
	if let Some(v) = req.rest.remove("extra_headers")
		&& let Some(obj) = v.as_object()
	{
		for (k, v) in obj {
			let (Ok(name), Some(value)) = (k.parse::<crate::http::HeaderName>(), v.as_str()) else {
				continue;
			};
			if let Ok(value) = crate::http::HeaderValue::from_str(value) {
				ctx.extra_headers.insert(name, value);
			}
		}
	}
	// extra_body merges verbatim.
	if let Some(v) = req.rest.remove("extra_body")
		&& let Some(obj) = v.as_object()
	{
		for (k, v) in obj {
			req.rest.insert(k.clone(), v.clone());
		}
	}
	ctx.user = req.user.clone();
}

enum SuccessKind {
	Buffered {
		resp: Box<dyn ResponseType>,
		status: StatusCode,
	},
	Stream {
		response: Response,
	},
}

struct AttemptSuccess {
	dep: Arc<Deployment>,
	llm_log: AsyncLog<LLMInfo>,
	kind: SuccessKind,
}

impl Gateway {
	/// Serve `/v1/chat/completions`.
	pub async fn chat_completions(
		&self,
		mut ctx: CallContext,
		mut req: completions::Request,
	) -> Response {
		extract_gateway_params(&mut req, &mut ctx);
		if let Err(e) = crate::llm::apply_drop_params(&mut req, self.settings.drop_params) {
			return self.reject(&ctx, &req.model.clone().unwrap_or_default(), e.into());
		}
		// We need usage to account for streamed calls; always request it.
		if req.stream.unwrap_or_default() && req.stream_options.is_none() {
			req.stream_options = Some(completions::StreamOptions {
				include_usage: true,
				rest: Default::default(),
			});
		}
		let streaming = req.stream.unwrap_or_default();
		self
			.run_model_call(
				ctx,
				InputFormat::Completions,
				RouteType::Completions,
				streaming,
				Box::new(req),
			)
			.await
	}

	/// Serve `/v1/messages`.
	pub async fn messages(
		&self,
		mut ctx: CallContext,
		req: crate::llm::types::messages::Request,
	) -> Response {
		ctx.user = req
			.metadata
			.as_ref()
			.and_then(|m| m.fields.get("user_id").cloned());
		let streaming = req.stream;
		self
			.run_model_call(
				ctx,
				InputFormat::Messages,
				RouteType::Messages,
				streaming,
				Box::new(req),
			)
			.await
	}

	/// Serve `/v1/embeddings`.
	pub async fn embeddings(
		&self,
		ctx: CallContext,
		req: crate::llm::types::embeddings::Request,
	) -> Response {
		self
			.run_model_call(
				ctx,
				InputFormat::Embeddings,
				RouteType::Embeddings,
				false,
				Box::new(req),
			)
			.await
	}

	async fn run_model_call(
		&self,
		ctx: CallContext,
		format: InputFormat,
		route: RouteType,
		streaming: bool,
		mut req: Box<dyn RequestType>,
	) -> Response {
		let model = match req.model().clone() {
			Some(m) => m,
			None => {
				return self.reject(
					&ctx,
					"",
					GatewayError::bad_request("model not specified"),
				);
			},
		};
		let selection = self.hook_selection(&ctx, &model);
		let mut guard = self.emit_guard(&ctx, &model, selection.clone());

		// Admission: allowed models, budget, concurrency.
		if let Err(e) = self.admit(&ctx, &model) {
			return self.finish_error(&ctx, guard, e, false);
		}
		let caps = self.parallel_caps(&ctx, &model);
		let _parallel_lease = match self.parallel.acquire(&caps) {
			Ok(lease) => lease,
			Err(e) => return self.finish_error(&ctx, guard, e, false),
		};

		// Dynamic rate limiter; at saturation low priority waits its turn.
		let group_limiter = self.group_limiter(&strng::new(&model));
		match group_limiter.try_acquire(ctx.priority()) {
			Admission::Admitted => {},
			Admission::Queued(rx) => {
				debug!("call {} deferred by dynamic rate limiter", ctx.call_id);
				let remaining = ctx.deadline.saturating_duration_since(Instant::now());
				if tokio::time::timeout(remaining, rx).await.is_err() {
					group_limiter.release();
					return self.finish_error(
						&ctx,
						guard,
						GatewayError::new(ErrorKind::Timeout, "deadline reached while rate limited"),
						false,
					);
				}
			},
		}

		// Input-side hooks, in scope order. A rejection still runs
		// logging-only hooks.
		let pre = self
			.hooks
			.run_request(HookPoint::PreCall, req.as_mut(), &selection)
			.await;
		guard.rec().guardrail_results.extend(pre.results);
		if let Some(blocked) = pre.blocked {
			let observed = self.hooks.observe("blocked", &selection);
			guard.rec().guardrail_results.extend(observed);
			group_limiter.release();
			return self.finish_error(&ctx, guard, blocked, false);
		}

		// during_call hooks run concurrently with the upstream call; the
		// verdict is awaited before anything is returned to the client.
		let during_messages = req.get_messages();
		let during_selection = selection.clone();
		let during = async {
			if self.hooks.is_empty() {
				return crate::hooks::StageOutcome {
					results: Vec::new(),
					blocked: None,
				};
			}
			let mut probe = ProbeRequest {
				messages: during_messages,
				model: None,
			};
			self
				.hooks
				.run_request(HookPoint::DuringCall, &mut probe, &during_selection)
				.await
		};

		let req_cell = tokio::sync::Mutex::new(req);
		let include_completion = !self.hooks.is_empty() || self.settings.set_verbose;
		let attempt = |dep: Arc<Deployment>| {
			let req_cell = &req_cell;
			let ctx = &ctx;
			async move {
				self
					.attempt(dep, req_cell, ctx, format, route, include_completion)
					.await
			}
		};
		let remaining = ctx.deadline.saturating_duration_since(Instant::now());
		let route_fut = self.router.route(&model, ctx.deadline, attempt);
		let ((outcome, trace), during_outcome) = match tokio::time::timeout(remaining, async {
			tokio::join!(route_fut, during)
		})
		.await
		{
			Ok(v) => v,
			Err(_) => {
				group_limiter.release();
				guard.rec().retries = 0;
				return self.finish_error(
					&ctx,
					guard,
					GatewayError::new(ErrorKind::Timeout, "request timed out"),
					streaming,
				);
			},
		};
		group_limiter.release();

		guard.rec().fallback_chain = trace.fallback_chain.clone();
		guard.rec().retries = trace.retries;
		guard.rec().guardrail_results.extend(during_outcome.results);
		if let Some(blocked) = during_outcome.blocked {
			let observed = self.hooks.observe("blocked", &selection);
			guard.rec().guardrail_results.extend(observed);
			return self.finish_error(&ctx, guard, blocked, streaming);
		}

		let success = match outcome {
			Ok(success) => success,
			Err(e) => {
				let observed = self.hooks.observe("failed", &selection);
				guard.rec().guardrail_results.extend(observed);
				return self.finish_error(&ctx, guard, e, streaming);
			},
		};

		guard.rec().deployment_id = success.dep.id.clone();
		guard.rec().provider = success.dep.provider.provider();
		guard.rec().model = success.dep.model.clone();
		guard.rec().api_base = success.dep.api_base.clone();
		let observed = self.hooks.observe("passed", &selection);
		guard.rec().guardrail_results.extend(observed);

		match success.kind {
			SuccessKind::Buffered { mut resp, status } => {
				// Output-side hooks may redact or reject.
				let post = self.hooks.run_response(resp.as_mut(), &selection).await;
				guard.rec().guardrail_results.extend(post.results);
				if let Some(blocked) = post.blocked {
					return self.finish_error(&ctx, guard, blocked, false);
				}

				let info = success.llm_log.take();
				let usage = info.as_ref().and_then(|i| i.response.usage.clone());
				let cost = usage
					.as_ref()
					.map(|u| cost::compute_cost(&success.dep.info, u))
					.unwrap_or_default();
				let record = guard.rec();
				record.usage = usage;
				record.cost = cost;
				record.server_tool_use = record
					.usage
					.as_ref()
					.and_then(|u| u.server_tool_use.clone());
				record.response_ts = Some(chrono::Utc::now());
				record.latency = ctx.started.elapsed();

				let body = match resp.serialize() {
					Ok(body) => body,
					Err(e) => {
						return self.finish_error(
							&ctx,
							guard,
							GatewayError::internal(format!("failed to serialize response: {e}")),
							false,
						);
					},
				};
				self.emit(guard.take());
				let mut response = ::http::Response::builder()
					.status(status)
					.header(header::CONTENT_TYPE, "application/json")
					.body(Body::from(body))
					.expect("response should build");
				if cost.total > 0.0 {
					if let Ok(v) = ::http::HeaderValue::from_str(&format!("{:.8}", cost.total)) {
						response.headers_mut().insert(RESPONSE_COST_HEADER, v);
					}
				}
				response
			},
			SuccessKind::Stream { response } => {
				// The record is finalized when the stream ends (or the
				// client disconnects); cost falls back to local token
				// counting if usage never arrived.
				self.finalize_stream(guard, success.dep, success.llm_log, response)
			},
		}
	}

	async fn attempt(
		&self,
		dep: Arc<Deployment>,
		req_cell: &tokio::sync::Mutex<Box<dyn RequestType>>,
		ctx: &CallContext,
		format: InputFormat,
		route: RouteType,
		include_completion: bool,
	) -> Result<AttemptSuccess, GatewayError> {
		if !dep.provider.accepts(format, dep.model.as_str()) {
			return Err(GatewayError::bad_request(format!(
				"provider {} does not serve {format:?}",
				dep.provider.provider()
			)));
		}
		let (body, llm_req, beta, invoke) = {
			let mut req = req_cell.lock().await;
			*req.model() = Some(
				dep
					.provider
					.override_model()
					.unwrap_or_else(|| dep.model.clone())
					.to_string(),
			);
			let llm_req = req
				.to_llm_request(dep.provider.provider(), false)
				.map_err(GatewayError::from)?;
			// Capability matrix: tool search is Invoke-only on Bedrock, and
			// Invoke speaks the Anthropic shape natively.
			let invoke = matches!(&dep.provider, AIProvider::Bedrock(p)
				if format == InputFormat::Messages
					&& p.channel_for_tools(Some(&req.tool_definitions()))
						== crate::llm::bedrock::Channel::Invoke);
			if invoke && llm_req.streaming {
				return Err(GatewayError::bad_request(
					"tool search does not support streaming on this provider",
				));
			}
			let body = if invoke {
				crate::llm::conversion::bedrock::to_invoke_body(
					req.to_anthropic().map_err(GatewayError::from)?,
				)
				.map_err(GatewayError::from)?
			} else {
				dep
					.provider
					.translate_request(req.as_ref(), dep.model.as_str())
					.map_err(GatewayError::from)?
			};
			let beta = beta_header_for(&dep.provider, req.as_ref());
			(Bytes::from(body), llm_req, beta, invoke)
		};

		let credential = resolve_credential(&dep, ctx.api_key_override.as_deref())
			.map_err(GatewayError::from)?;
		let mut dep_for_call = (*dep).clone();
		if let Some(base) = &ctx.api_base_override {
			dep_for_call.api_base = Some(strng::new(base));
		}

		let mut forwarded = crate::http::project_headers(
			&ctx.headers,
			&self.settings.forward_client_headers_to_llm_api,
		);
		for (name, value) in ctx.extra_headers.iter() {
			forwarded.insert(name.clone(), value.clone());
		}
		let timeout = ctx.deadline.saturating_duration_since(Instant::now());
		let mut call = build_provider_call(
			&dep_for_call,
			route,
			Some(&llm_req),
			body,
			credential.as_ref(),
			beta.as_deref(),
			forwarded,
			timeout,
		)?;
		if invoke && let AIProvider::Bedrock(p) = &dep.provider {
			call.url = format!(
				"https://{}{}",
				p.get_host(),
				p.get_invoke_path(llm_req.streaming, llm_req.request_model.as_str())
			);
		}

		let resp = self
			.transport
			.dispatch(dep.provider.provider(), call)
			.await?;

		if !resp.status.is_success() {
			let bytes = crate::http::to_bytes(resp.body, crate::http::DEFAULT_BODY_LIMIT)
				.await
				.unwrap_or_default();
			let (kind, body) = dep.provider.process_error(&llm_req, resp.status, &bytes);
			return Err(
				GatewayError::new(kind, String::from_utf8_lossy(&body).to_string())
					.with_code("upstream_error"),
			);
		}

		let llm_log: AsyncLog<LLMInfo> = AsyncLog::default();
		if llm_req.streaming {
			llm_log.store(Some(LLMInfo::new(
				llm_req.clone(),
				Default::default(),
			)));
			let buffer_limit = crate::http::DEFAULT_BODY_LIMIT;
			let body = dep
				.provider
				.process_streaming(&llm_req, llm_log.clone(), include_completion, resp.body, buffer_limit)
				.map_err(GatewayError::from)?;
			let response = ::http::Response::builder()
				.status(StatusCode::OK)
				.header(header::CONTENT_TYPE, "text/event-stream")
				.header(header::CACHE_CONTROL, "no-cache")
				.body(body)
				.expect("response should build");
			return Ok(AttemptSuccess {
				dep,
				llm_log,
				kind: SuccessKind::Stream { response },
			});
		}

		let bytes = crate::http::to_bytes(resp.body, crate::http::DEFAULT_BODY_LIMIT)
			.await
			.map_err(|e| GatewayError::upstream(format!("failed to read response: {e}")))?;
		let parsed: Box<dyn ResponseType> = if invoke {
			// Invoke answers in the Anthropic shape already.
			Box::new(
				serde_json::from_slice::<crate::llm::types::messages::MessagesResponse>(&bytes)
					.map_err(|e| GatewayError::upstream(format!("failed to parse response: {e}")))?,
			)
		} else {
			dep
				.provider
				.process_success(&llm_req, &bytes)
				.map_err(GatewayError::from)?
		};
		let llm_resp = parsed.to_llm_response(include_completion);
		llm_log.store(Some(LLMInfo::new(llm_req, llm_resp)));
		Ok(AttemptSuccess {
			dep,
			llm_log,
			kind: SuccessKind::Buffered {
				resp: parsed,
				status: resp.status,
			},
		})
	}

	/// Wrap a streaming response body so that the audit record is finalized
	/// exactly once: on normal completion here, or via the guard's Drop if
	/// the client disconnects mid-stream (the generator holding the guard is
	/// dropped with it, capturing partial usage).
	fn finalize_stream(
		&self,
		mut guard: EmitGuard,
		dep: Arc<Deployment>,
		llm_log: AsyncLog<LLMInfo>,
		response: Response,
	) -> Response {
		guard.attach_stream(llm_log, dep.info.clone());
		let (parts, body) = response.into_parts();
		let stream = async_stream::stream! {
			let mut saw_error = false;
			let mut upstream = body.into_data_stream();
			while let Some(chunk) = upstream.next().await {
				if chunk.is_err() {
					saw_error = true;
				}
				yield chunk;
			}
			// Normal completion: take the record so the cancel path in Drop
			// stays silent, then finalize off the response path.
			let hooks = guard.hooks.clone();
			let selection = guard.selection.clone();
			let started = guard.started;
			let llm_log = guard.llm_log.clone().expect("attached above");
			let info = guard.cost_info.clone().expect("attached above");
			let logs = guard.logs.clone();
			let spend = guard.spend.clone();
			let mut record = guard.take();
			let content = absorb_stream_info(&mut record, &llm_log, &info, started);
			if saw_error {
				record.error = Some(ErrorKind::StreamAborted.as_str().to_string());
			}
			let outcome = hooks.run_stream_complete(&content, &selection).await;
			record.guardrail_results.extend(outcome.results);
			record.response_ts = Some(chrono::Utc::now());
			record.latency = started.elapsed();
			spend.record(&record);
			logs.emit(record);
		};
		Response::from_parts(parts, Body::from_stream(stream))
	}

	/// Forward a provider-native endpoint (`/audio/speech`, `/images/*`,
	/// rerank, count_tokens, ...) with routing and credential injection but
	/// no body translation.
	pub async fn passthrough_call(
		&self,
		ctx: CallContext,
		model: &str,
		route: RouteType,
		body: Bytes,
	) -> Response {
		let selection = self.hook_selection(&ctx, model);
		let mut guard = self.emit_guard(&ctx, model, selection);
		let attempt = |dep: Arc<Deployment>| {
			let body = body.clone();
			let ctx = &ctx;
			async move {
				let credential = resolve_credential(&dep, ctx.api_key_override.as_deref())
					.map_err(GatewayError::from)?;
				let forwarded = crate::http::project_headers(
					&ctx.headers,
					&self.settings.forward_client_headers_to_llm_api,
				);
				let timeout = ctx.deadline.saturating_duration_since(Instant::now());
				let call = build_provider_call(
					&dep,
					route,
					None,
					body,
					credential.as_ref(),
					None,
					forwarded,
					timeout,
				)?;
				let resp = self.transport.dispatch(dep.provider.provider(), call).await?;
				if !resp.status.is_success() {
					let bytes = crate::http::to_bytes(resp.body, crate::http::DEFAULT_BODY_LIMIT)
						.await
						.unwrap_or_default();
					let kind = ErrorKind::from_provider_status(resp.status);
					return Err(GatewayError::new(
						kind,
						String::from_utf8_lossy(&bytes).to_string(),
					));
				}
				let mut builder = ::http::Response::builder().status(resp.status);
				for (name, value) in resp.headers.iter() {
					builder = builder.header(name, value);
				}
				builder
					.body(resp.body)
					.map_err(|e| GatewayError::internal(e.to_string()))
			}
		};
		let (outcome, trace) = self.router.route(model, ctx.deadline, attempt).await;
		guard.rec().fallback_chain = trace.fallback_chain;
		guard.rec().retries = trace.retries;
		match outcome {
			Ok(resp) => {
				let mut record = guard.take();
				record.response_ts = Some(chrono::Utc::now());
				record.latency = ctx.started.elapsed();
				self.emit(record);
				resp
			},
			Err(e) => self.finish_error(&ctx, guard, e, false),
		}
	}

	/// Invoke an MCP tool on behalf of the caller, attributing its cost and
	/// emitting the audit record.
	pub async fn mcp_call_tool(
		&self,
		ctx: CallContext,
		caller: &McpCaller,
		name: &str,
		args: Option<serde_json::Value>,
	) -> Result<rmcp::model::CallToolResult, Response> {
		let selection =
			HookSelection::global_only(ctx.requested_guardrails.clone().unwrap_or_default());
		let guard = self.emit_guard(&ctx, name, selection);
		let outcome = match self.mcp.call_tool(name, args, caller, &ctx.headers).await {
			Ok(outcome) => outcome,
			Err(e) => {
				return Err(self.finish_error(&ctx, guard, e.into(), false));
			},
		};
		let mut record = guard.take();
		record.mcp_server_id = Some(outcome.server.clone());
		record.mcp_tool_name = Some(outcome.tool.clone());
		record.cost = crate::llm::cost::CostBreakdown::default().with_tool_calls(outcome.cost);
		record.response_ts = Some(chrono::Utc::now());
		record.latency = ctx.started.elapsed();
		self.emit(record);
		Ok(outcome.result)
	}

	/// Aggregate the tools visible to the caller across configured servers.
	pub async fn mcp_list_tools(
		&self,
		ctx: &CallContext,
		caller: &McpCaller,
	) -> Result<Vec<crate::mcp::gateway::DiscoveredTool>, GatewayError> {
		self
			.mcp
			.list_tools(caller, &ctx.headers)
			.await
			.map_err(GatewayError::from)
	}

	fn admit(&self, ctx: &CallContext, model: &str) -> Result<(), GatewayError> {
		if let Some(policy) = &ctx.policy {
			if !policy.allows_model(model) {
				return Err(GatewayError::new(
					ErrorKind::PermissionDenied,
					format!("key is not allowed to call model {model}"),
				));
			}
			if let Some(key) = &ctx.key_hash {
				self
					.budget
					.check(&SpendScope::Key(key.clone()), policy.budget, 0.0)?;
			}
		}
		Ok(())
	}

	fn parallel_caps(&self, ctx: &CallContext, model: &str) -> Vec<(Strng, usize)> {
		let mut caps = Vec::new();
		if let Some(policy) = &ctx.policy
			&& let Some(max) = policy.max_parallel
			&& let Some(key) = &ctx.key_hash
		{
			caps.push((strng::format!("key:{key}"), max as usize));
			if let Some(team) = &policy.team_id {
				caps.push((strng::format!("team:{team}"), (max * 4) as usize));
			}
		}
		let _ = model;
		caps
	}

	fn emit(&self, record: LoggingRecord) {
		self.spend.record(&record);
		self.logs.emit(record);
	}

	fn reject(&self, ctx: &CallContext, model: &str, err: GatewayError) -> Response {
		let guard = self.emit_guard(ctx, model, HookSelection::default());
		self.finish_error(ctx, guard, err, false)
	}

	fn finish_error(
		&self,
		ctx: &CallContext,
		guard: EmitGuard,
		err: GatewayError,
		streaming: bool,
	) -> Response {
		warn!("call {} failed: {err}", ctx.call_id);
		let mut record = guard.take();
		record.error = Some(err.kind.as_str().to_string());
		record.response_ts = Some(chrono::Utc::now());
		record.latency = ctx.started.elapsed();
		self.emit(record);
		if streaming {
			err.sse_response()
		} else {
			err.into_response()
		}
	}
}

/// Minimal request view handed to during-call hooks; they see a snapshot of
/// the messages, not the live request.
struct ProbeRequest {
	messages: Vec<crate::llm::types::SimpleChatCompletionMessage>,
	model: Option<String>,
}

impl RequestType for ProbeRequest {
	fn model(&mut self) -> &mut Option<String> {
		&mut self.model
	}
	fn prepend_prompts(&mut self, _prompts: Vec<crate::llm::types::SimpleChatCompletionMessage>) {}
	fn append_prompts(&mut self, _prompts: Vec<crate::llm::types::SimpleChatCompletionMessage>) {}
	fn to_llm_request(
		&self,
		_provider: Strng,
		_tokenize: bool,
	) -> Result<LLMRequest, crate::llm::AIError> {
		Err(crate::llm::AIError::UnsupportedContent)
	}
	fn get_messages(&self) -> Vec<crate::llm::types::SimpleChatCompletionMessage> {
		self.messages.clone()
	}
	fn set_messages(&mut self, messages: Vec<crate::llm::types::SimpleChatCompletionMessage>) {
		self.messages = messages;
	}
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;

fn beta_header_for(provider: &AIProvider, req: &dyn RequestType) -> Option<String> {
	// Table-driven beta header injection applies to Anthropic-family
	// channels only, keyed on tool types present in the request.
	let channel = match provider {
		AIProvider::Anthropic(_) => anthropic::Channel::Direct,
		AIProvider::Vertex(_) => anthropic::Channel::Vertex,
		AIProvider::Bedrock(_) => anthropic::Channel::Bedrock,
		_ => return None,
	};
	let tools = req.tool_definitions();
	if tools.is_empty() {
		return None;
	}
	anthropic::beta_header_for_tools(&tools, channel)
}
