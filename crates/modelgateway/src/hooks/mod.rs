//! The guardrail hook pipeline.
//!
//! Hooks run at four points: `pre_call` (blocking, input side),
//! `during_call` (input side, concurrent with the upstream call),
//! `post_call_success` (output side), and `post_call_stream` (on the
//! assembled stream terminal). Logging-only hooks additionally observe every
//! outcome and never mutate or block.
//!
//! Ordering is model-level guardrails, then team-level, then global. A
//! rejection skips the remaining mutating hooks but logging-only hooks still
//! run with `action=blocked`.

mod pii;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, GatewayError};
use crate::llm::types::{GuardChoice, RequestType, ResponseType, SimpleChatCompletionMessage};
use crate::telemetry::log::GuardrailResult;
use crate::{Strng, debug, strng, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
	PreCall,
	DuringCall,
	#[serde(alias = "post_call")]
	PostCallSuccess,
	PostCallStream,
	/// Fire-and-forget observation; never blocks or mutates.
	LoggingOnly,
}

impl HookPoint {
	pub fn as_str(&self) -> &'static str {
		match self {
			HookPoint::PreCall => "pre_call",
			HookPoint::DuringCall => "during_call",
			HookPoint::PostCallSuccess => "post_call",
			HookPoint::PostCallStream => "post_call_stream",
			HookPoint::LoggingOnly => "logging_only",
		}
	}
}

/// Where a hook was attached; drives execution order. Model-level
/// attachments run first, then team-level, then the globally configured
/// guardrails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HookScope {
	Model,
	Team,
	Global,
}

impl HookScope {
	pub fn as_str(&self) -> &'static str {
		match self {
			HookScope::Model => "model",
			HookScope::Team => "team",
			HookScope::Global => "global",
		}
	}
}

/// Which guardrails apply to one call, by attachment scope. Model
/// attachments come from the deployment config, team attachments from the
/// caller's key policy, and `requested` holds per-call opt-ins for
/// non-default global guardrails.
#[derive(Debug, Clone, Default)]
pub struct HookSelection {
	pub model: Vec<String>,
	pub team: Vec<String>,
	pub requested: Vec<String>,
}

impl HookSelection {
	pub fn global_only(requested: Vec<String>) -> HookSelection {
		HookSelection {
			requested,
			..Default::default()
		}
	}
}

/// What a guardrail decided.
pub enum Verdict {
	Pass,
	/// Replacement content (masking, redaction).
	MutateRequest(Vec<SimpleChatCompletionMessage>),
	MutateResponse(Vec<GuardChoice>),
	Blocked(Blocked),
}

#[derive(Debug, Clone, Serialize)]
pub struct Blocked {
	pub entities: Vec<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub confidence: Option<f64>,
	pub details: Value,
}

impl Blocked {
	pub fn into_error(self, guardrail: &str) -> GatewayError {
		let details = serde_json::to_string(&self).unwrap_or_default();
		GatewayError::new(
			ErrorKind::ContentFiltered,
			format!("request blocked by guardrail {guardrail}: {details}"),
		)
		.with_code("guardrail_blocked")
	}
}

/// The payload a guardrail inspects.
pub enum GuardPayload<'a> {
	Request(&'a [SimpleChatCompletionMessage]),
	Response(&'a [GuardChoice]),
	/// Assembled stream content plus usage, at stream end.
	StreamComplete { content: &'a str },
}

/// The backend contract. Concrete engines (Presidio, Bedrock Guardrails,
/// Lakera, Noma, ...) live out of tree; `regex` and `webhook` ship builtin.
#[async_trait]
pub trait GuardrailBackend: Send + Sync {
	fn name(&self) -> Strng;
	async fn check(&self, point: HookPoint, payload: GuardPayload<'_>) -> anyhow::Result<Verdict>;
}

/// Guardrail config entry (`guardrails[]` in the config file).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuardrailConfig {
	pub guardrail_name: String,
	#[serde(alias = "litellm_params")]
	pub params: GuardrailParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailParams {
	/// Backend id in the registry (`regex`, `webhook`, vendor ids).
	pub guardrail: String,
	#[serde(default)]
	pub mode: Modes,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub api_key: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub api_base: Option<String>,
	/// Run without being selected per-call.
	#[serde(default)]
	pub default_on: bool,
	#[serde(flatten)]
	pub extra: serde_json::Map<String, Value>,
}

/// `mode` accepts a single point or a list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Modes {
	One(HookPoint),
	Many(Vec<HookPoint>),
}

impl Default for Modes {
	fn default() -> Self {
		Modes::One(HookPoint::PreCall)
	}
}

impl Modes {
	pub fn points(&self) -> Vec<HookPoint> {
		match self {
			Modes::One(p) => vec![*p],
			Modes::Many(ps) => ps.clone(),
		}
	}
}

type BackendBuilder = fn(&GuardrailParams) -> anyhow::Result<Arc<dyn GuardrailBackend>>;

/// Startup-registered backend table, keyed by the string id used in config.
pub struct GuardrailRegistry {
	builders: HashMap<Strng, BackendBuilder>,
}

impl Default for GuardrailRegistry {
	fn default() -> Self {
		let mut reg = GuardrailRegistry {
			builders: HashMap::new(),
		};
		reg.register(strng::literal!("regex"), RegexBackend::build);
		reg.register(strng::literal!("webhook"), WebhookBackend::build);
		reg
	}
}

impl GuardrailRegistry {
	pub fn register(&mut self, id: Strng, builder: BackendBuilder) {
		self.builders.insert(id, builder);
	}

	pub fn build(&self, params: &GuardrailParams) -> anyhow::Result<Arc<dyn GuardrailBackend>> {
		let builder = self
			.builders
			.get(params.guardrail.as_str())
			.ok_or_else(|| anyhow::anyhow!("unknown guardrail backend: {}", params.guardrail))?;
		builder(params)
	}
}

struct ConfiguredHook {
	name: Strng,
	points: Vec<HookPoint>,
	default_on: bool,
	backend: Arc<dyn GuardrailBackend>,
}

/// The assembled pipeline for a process. Scope is a property of the
/// per-call selection, not of the configured hook: the same guardrail runs
/// at model level for one call and globally for another.
#[derive(Default)]
pub struct HookPipeline {
	hooks: Vec<ConfiguredHook>,
}

/// Outcome of running one stage of the pipeline.
pub struct StageOutcome {
	pub results: Vec<GuardrailResult>,
	pub blocked: Option<GatewayError>,
}

impl HookPipeline {
	pub fn from_config(
		configs: &[GuardrailConfig],
		registry: &GuardrailRegistry,
	) -> anyhow::Result<HookPipeline> {
		let mut hooks = Vec::new();
		for cfg in configs {
			let backend = registry.build(&cfg.params)?;
			hooks.push(ConfiguredHook {
				name: strng::new(&cfg.guardrail_name),
				points: cfg.params.mode.points(),
				default_on: cfg.params.default_on,
				backend,
			});
		}
		Ok(HookPipeline { hooks })
	}

	pub fn is_empty(&self) -> bool {
		self.hooks.is_empty()
	}

	fn by_name(&self, name: &str, point: HookPoint) -> Option<&ConfiguredHook> {
		self
			.hooks
			.iter()
			.find(|h| h.name.as_str() == name && h.points.contains(&point))
	}

	/// Hooks applicable to this call at `point`, in scope order: the
	/// model-level attachments, then team-level, then global (default-on or
	/// explicitly requested). A hook attached at more than one scope runs
	/// once, at the highest-precedence scope.
	fn ordered(&self, point: HookPoint, selection: &HookSelection) -> Vec<(&ConfiguredHook, HookScope)> {
		let mut out: Vec<(&ConfiguredHook, HookScope)> = Vec::new();
		for (scope, names) in [
			(HookScope::Model, &selection.model),
			(HookScope::Team, &selection.team),
		] {
			for name in names {
				if let Some(hook) = self.by_name(name, point)
					&& !out.iter().any(|(h, _)| h.name == hook.name)
				{
					out.push((hook, scope));
				}
			}
		}
		for hook in &self.hooks {
			if h_applies_globally(hook, point, selection)
				&& !out.iter().any(|(h, _)| h.name == hook.name)
			{
				out.push((hook, HookScope::Global));
			}
		}
		out
	}

	/// Run the input-side hooks for `point`, mutating the request in place.
	/// On rejection the remaining mutating hooks are skipped; the caller
	/// still runs logging-only hooks via [`HookPipeline::observe`].
	pub async fn run_request(
		&self,
		point: HookPoint,
		req: &mut dyn RequestType,
		selection: &HookSelection,
	) -> StageOutcome {
		let mut results = Vec::new();
		for (hook, scope) in self.ordered(point, selection) {
			let messages = req.get_messages();
			let verdict = hook
				.backend
				.check(point, GuardPayload::Request(&messages))
				.await;
			match verdict {
				Ok(Verdict::Pass) => results.push(result(hook, scope, point, "passed", None, vec![])),
				Ok(Verdict::MutateRequest(msgs)) => {
					req.set_messages(msgs);
					results.push(result(hook, scope, point, "mutated", None, vec![]));
				},
				Ok(Verdict::MutateResponse(_)) => {
					warn!("guardrail {} returned a response mutation on the input side", hook.name);
					results.push(result(hook, scope, point, "error", None, vec![]));
				},
				Ok(Verdict::Blocked(blocked)) => {
					results.push(result(
						hook,
						scope,
						point,
						"blocked",
						blocked.confidence,
						blocked.entities.clone(),
					));
					return StageOutcome {
						results,
						blocked: Some(blocked.into_error(hook.name.as_str())),
					};
				},
				Err(e) => {
					warn!("guardrail {} failed: {e}", hook.name);
					results.push(result(hook, scope, point, "error", None, vec![]));
				},
			}
		}
		StageOutcome {
			results,
			blocked: None,
		}
	}

	/// Run the output-side hooks, mutating the response in place.
	pub async fn run_response(
		&self,
		resp: &mut dyn ResponseType,
		selection: &HookSelection,
	) -> StageOutcome {
		let point = HookPoint::PostCallSuccess;
		let mut results = Vec::new();
		for (hook, scope) in self.ordered(point, selection) {
			let choices = resp.to_guard_choices();
			let verdict = hook
				.backend
				.check(point, GuardPayload::Response(&choices))
				.await;
			match verdict {
				Ok(Verdict::Pass) => results.push(result(hook, scope, point, "passed", None, vec![])),
				Ok(Verdict::MutateResponse(choices)) => {
					if let Err(e) = resp.set_guard_choices(choices) {
						warn!("guardrail {} mutation failed: {e}", hook.name);
						results.push(result(hook, scope, point, "error", None, vec![]));
					} else {
						results.push(result(hook, scope, point, "mutated", None, vec![]));
					}
				},
				Ok(Verdict::MutateRequest(_)) => {
					warn!("guardrail {} returned a request mutation on the output side", hook.name);
					results.push(result(hook, scope, point, "error", None, vec![]));
				},
				Ok(Verdict::Blocked(blocked)) => {
					results.push(result(
						hook,
						scope,
						point,
						"blocked",
						blocked.confidence,
						blocked.entities.clone(),
					));
					return StageOutcome {
						results,
						blocked: Some(blocked.into_error(hook.name.as_str())),
					};
				},
				Err(e) => {
					warn!("guardrail {} failed: {e}", hook.name);
					results.push(result(hook, scope, point, "error", None, vec![]));
				},
			}
		}
		StageOutcome {
			results,
			blocked: None,
		}
	}

	/// Run the stream-terminal hooks against the assembled content. Streams
	/// cannot be retroactively mutated; a block is reported for audit.
	pub async fn run_stream_complete(
		&self,
		content: &str,
		selection: &HookSelection,
	) -> StageOutcome {
		let point = HookPoint::PostCallStream;
		let mut results = Vec::new();
		for (hook, scope) in self.ordered(point, selection) {
			match hook
				.backend
				.check(point, GuardPayload::StreamComplete { content })
				.await
			{
				Ok(Verdict::Blocked(blocked)) => {
					results.push(result(
						hook,
						scope,
						point,
						"blocked",
						blocked.confidence,
						blocked.entities.clone(),
					));
					return StageOutcome {
						results,
						blocked: Some(blocked.into_error(hook.name.as_str())),
					};
				},
				Ok(_) => results.push(result(hook, scope, point, "passed", None, vec![])),
				Err(e) => {
					warn!("guardrail {} failed: {e}", hook.name);
					results.push(result(hook, scope, point, "error", None, vec![]));
				},
			}
		}
		StageOutcome {
			results,
			blocked: None,
		}
	}

	/// Logging-only hooks run on every outcome, including rejections and
	/// client cancellation, with the terminal action recorded.
	pub fn observe(&self, action: &str, selection: &HookSelection) -> Vec<GuardrailResult> {
		self
			.ordered(HookPoint::LoggingOnly, selection)
			.into_iter()
			.map(|(hook, scope)| result(hook, scope, HookPoint::LoggingOnly, action, None, vec![]))
			.collect()
	}
}

fn h_applies_globally(hook: &ConfiguredHook, point: HookPoint, selection: &HookSelection) -> bool {
	hook.points.contains(&point)
		&& (hook.default_on
			|| selection
				.requested
				.iter()
				.any(|n| n == hook.name.as_str()))
}

fn result(
	hook: &ConfiguredHook,
	scope: HookScope,
	point: HookPoint,
	action: &str,
	confidence: Option<f64>,
	entities: Vec<String>,
) -> GuardrailResult {
	GuardrailResult {
		name: hook.name.clone(),
		mode: strng::new(point.as_str()),
		scope: strng::new(scope.as_str()),
		action: strng::new(action),
		confidence,
		entities,
	}
}

// ── builtin: regex / PII ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RegexAction {
	#[default]
	Mask,
	Reject,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RegexRule {
	Builtin {
		builtin: Builtin,
	},
	Pattern {
		#[serde(with = "serde_regex")]
		pattern: regex::Regex,
	},
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Builtin {
	Ssn,
	CreditCard,
	PhoneNumber,
	Email,
}

struct RegexBackend {
	name: Strng,
	action: RegexAction,
	rules: Vec<RegexRule>,
}

impl RegexBackend {
	fn build(params: &GuardrailParams) -> anyhow::Result<Arc<dyn GuardrailBackend>> {
		#[derive(Deserialize)]
		struct Extra {
			#[serde(default)]
			action: RegexAction,
			rules: Vec<RegexRule>,
		}
		let extra: Extra =
			serde_json::from_value(Value::Object(params.extra.clone()))?;
		Ok(Arc::new(RegexBackend {
			name: strng::new(&params.guardrail),
			action: extra.action,
			rules: extra.rules,
		}))
	}

	/// Apply every rule to `content`; `Some` means the content was masked or
	/// must be rejected.
	fn apply(&self, content: &str) -> Option<RegexOutcome> {
		let mut current = content.to_string();
		let mut entities: Vec<String> = Vec::new();
		for rule in &self.rules {
			let ranges: Vec<(std::ops::Range<usize>, String)> = match rule {
				RegexRule::Builtin { builtin } => {
					let rec = match builtin {
						Builtin::Ssn => &*pii::SSN,
						Builtin::CreditCard => &*pii::CREDIT_CARD,
						Builtin::PhoneNumber => &*pii::PHONE,
						Builtin::Email => &*pii::EMAIL,
					};
					rec.recognize(&current)
						.into_iter()
						.map(|r| (r.start..r.end, r.entity_type.to_string()))
						.collect()
				},
				RegexRule::Pattern { pattern } => pattern
					.find_iter(&current)
					.map(|m| (m.range(), "masked".to_string()))
					.collect(),
			};
			if ranges.is_empty() {
				continue;
			}
			if self.action == RegexAction::Reject {
				return Some(RegexOutcome::Reject {
					entities: ranges.into_iter().map(|(_, e)| e).collect(),
				});
			}
			// Replace in reverse to avoid index shifting.
			for (range, entity) in ranges.into_iter().rev() {
				current.replace_range(range, &format!("<{}>", entity.to_uppercase()));
				entities.push(entity);
			}
		}
		if entities.is_empty() {
			None
		} else {
			Some(RegexOutcome::Masked {
				content: current,
				entities,
			})
		}
	}
}

enum RegexOutcome {
	Masked { content: String, entities: Vec<String> },
	Reject { entities: Vec<String> },
}

#[async_trait]
impl GuardrailBackend for RegexBackend {
	fn name(&self) -> Strng {
		self.name.clone()
	}

	async fn check(&self, _point: HookPoint, payload: GuardPayload<'_>) -> anyhow::Result<Verdict> {
		match payload {
			GuardPayload::Request(messages) => {
				let mut out = messages.to_vec();
				let mut mutated = false;
				for msg in &mut out {
					match self.apply(msg.content.as_str()) {
						Some(RegexOutcome::Reject { entities }) => {
							return Ok(Verdict::Blocked(Blocked {
								entities,
								confidence: None,
								details: serde_json::json!({"action": "reject"}),
							}));
						},
						Some(RegexOutcome::Masked { content, entities }) => {
							debug!("masked {} entities", entities.len());
							msg.content = strng::new(&content);
							mutated = true;
						},
						None => {},
					}
				}
				Ok(if mutated {
					Verdict::MutateRequest(out)
				} else {
					Verdict::Pass
				})
			},
			GuardPayload::Response(choices) => {
				let mut out = choices.to_vec();
				let mut mutated = false;
				for c in &mut out {
					match self.apply(&c.content) {
						Some(RegexOutcome::Reject { entities }) => {
							return Ok(Verdict::Blocked(Blocked {
								entities,
								confidence: None,
								details: serde_json::json!({"action": "reject"}),
							}));
						},
						Some(RegexOutcome::Masked { content, entities: _ }) => {
							c.content = content;
							mutated = true;
						},
						None => {},
					}
				}
				Ok(if mutated {
					Verdict::MutateResponse(out)
				} else {
					Verdict::Pass
				})
			},
			GuardPayload::StreamComplete { content } => {
				match self.apply(content) {
					Some(RegexOutcome::Reject { entities }) => Ok(Verdict::Blocked(Blocked {
						entities,
						confidence: None,
						details: serde_json::json!({"action": "reject"}),
					})),
					_ => Ok(Verdict::Pass),
				}
			},
		}
	}
}

// ── builtin: webhook ───────────────────────────────────────────────────

/// Generic HTTP guardrail: POST the payload, act on the verdict. This is the
/// integration point for external engines configured with `api_base`.
struct WebhookBackend {
	name: Strng,
	client: reqwest::Client,
	api_base: String,
	api_key: Option<String>,
}

#[derive(Deserialize)]
struct WebhookVerdict {
	#[serde(default)]
	blocked: bool,
	#[serde(default)]
	confidence: Option<f64>,
	#[serde(default)]
	entities: Vec<String>,
	#[serde(default)]
	messages: Option<Vec<SimpleChatCompletionMessage>>,
	#[serde(flatten)]
	details: serde_json::Map<String, Value>,
}

impl WebhookBackend {
	fn build(params: &GuardrailParams) -> anyhow::Result<Arc<dyn GuardrailBackend>> {
		let api_base = params
			.api_base
			.clone()
			.ok_or_else(|| anyhow::anyhow!("webhook guardrail requires api_base"))?;
		Ok(Arc::new(WebhookBackend {
			name: strng::new(&params.guardrail),
			client: reqwest::Client::new(),
			api_base,
			api_key: params.api_key.clone(),
		}))
	}
}

#[async_trait]
impl GuardrailBackend for WebhookBackend {
	fn name(&self) -> Strng {
		self.name.clone()
	}

	async fn check(&self, point: HookPoint, payload: GuardPayload<'_>) -> anyhow::Result<Verdict> {
		let body = match payload {
			GuardPayload::Request(messages) => serde_json::json!({
				"mode": point.as_str(),
				"messages": messages,
			}),
			GuardPayload::Response(choices) => serde_json::json!({
				"mode": point.as_str(),
				"choices": choices,
			}),
			GuardPayload::StreamComplete { content } => serde_json::json!({
				"mode": point.as_str(),
				"content": content,
			}),
		};
		let mut req = self.client.post(&self.api_base).json(&body);
		if let Some(key) = &self.api_key {
			req = req.bearer_auth(key);
		}
		let resp = req.send().await?;
		let verdict: WebhookVerdict = resp.error_for_status()?.json().await?;
		if verdict.blocked {
			return Ok(Verdict::Blocked(Blocked {
				entities: verdict.entities,
				confidence: verdict.confidence,
				details: Value::Object(verdict.details),
			}));
		}
		if let Some(messages) = verdict.messages {
			return Ok(Verdict::MutateRequest(messages));
		}
		Ok(Verdict::Pass)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::llm::types::completions;

	fn pipeline(yaml: &str) -> HookPipeline {
		let configs: Vec<GuardrailConfig> = serde_yaml::from_str(yaml).unwrap();
		HookPipeline::from_config(&configs, &GuardrailRegistry::default()).unwrap()
	}

	fn chat_request(content: &str) -> completions::Request {
		serde_json::from_value(serde_json::json!({
			"model": "gpt-4o",
			"messages": [{"role": "user", "content": content}],
		}))
		.unwrap()
	}

	#[tokio::test]
	async fn regex_mask_rewrites_request() {
		let p = pipeline(
			r#"
- guardrail_name: pii-mask
  litellm_params:
    guardrail: regex
    mode: pre_call
    default_on: true
    action: mask
    rules:
      - builtin: email
"#,
		);
		let mut req = chat_request("contact me at alice@example.com please");
		let outcome = p
			.run_request(HookPoint::PreCall, &mut req, &HookSelection::default())
			.await;
		assert!(outcome.blocked.is_none());
		assert_eq!(outcome.results[0].action.as_str(), "mutated");
		let text = req.messages[0].text().unwrap();
		assert!(text.contains("<EMAIL>"), "got {text}");
		assert!(!text.contains("alice@example.com"));
	}

	#[tokio::test]
	async fn regex_reject_blocks_with_content_filtered() {
		let p = pipeline(
			r#"
- guardrail_name: ssn-block
  litellm_params:
    guardrail: regex
    mode: pre_call
    default_on: true
    action: reject
    rules:
      - builtin: ssn
"#,
		);
		let mut req = chat_request("my ssn is 123-45-6789");
		let outcome = p
			.run_request(HookPoint::PreCall, &mut req, &HookSelection::default())
			.await;
		let err = outcome.blocked.expect("should block");
		assert_eq!(err.kind, ErrorKind::ContentFiltered);
		assert_eq!(outcome.results[0].action.as_str(), "blocked");
		assert_eq!(outcome.results[0].entities, vec!["ssn".to_string()]);
	}

	#[tokio::test]
	async fn non_default_hooks_require_selection() {
		let p = pipeline(
			r#"
- guardrail_name: opt-in
  litellm_params:
    guardrail: regex
    mode: pre_call
    action: reject
    rules:
      - builtin: email
"#,
		);
		let mut req = chat_request("alice@example.com");
		// Not selected: passes untouched.
		let outcome = p
			.run_request(HookPoint::PreCall, &mut req, &HookSelection::default())
			.await;
		assert!(outcome.blocked.is_none());
		assert!(outcome.results.is_empty());
		// Selected per-call by name: blocks.
		let selection = HookSelection::global_only(vec!["opt-in".to_string()]);
		let outcome = p.run_request(HookPoint::PreCall, &mut req, &selection).await;
		assert!(outcome.blocked.is_some());
	}

	#[tokio::test]
	async fn scoped_hooks_run_model_then_team_then_global() {
		// Three guardrails; only `global-mask` is on by default. The other
		// two run because a deployment and a key policy attach them.
		let p = pipeline(
			r#"
- guardrail_name: model-mask
  litellm_params:
    guardrail: regex
    mode: pre_call
    action: mask
    rules:
      - builtin: email
- guardrail_name: team-mask
  litellm_params:
    guardrail: regex
    mode: pre_call
    action: mask
    rules:
      - builtin: phone_number
- guardrail_name: global-mask
  litellm_params:
    guardrail: regex
    mode: pre_call
    default_on: true
    action: mask
    rules:
      - builtin: ssn
"#,
		);
		let selection = HookSelection {
			model: vec!["model-mask".to_string()],
			team: vec!["team-mask".to_string()],
			requested: Vec::new(),
		};
		let mut req = chat_request("mail a@b.com, call 415-555-1212, ssn 123-45-6789");
		let outcome = p.run_request(HookPoint::PreCall, &mut req, &selection).await;
		assert!(outcome.blocked.is_none());
		let order: Vec<&str> = outcome.results.iter().map(|r| r.name.as_str()).collect();
		assert_eq!(order, vec!["model-mask", "team-mask", "global-mask"]);
		let scopes: Vec<&str> = outcome.results.iter().map(|r| r.scope.as_str()).collect();
		assert_eq!(scopes, vec!["model", "team", "global"]);
		let text = req.messages[0].text().unwrap();
		assert!(text.contains("<EMAIL>") && text.contains("<PHONE_NUMBER>") && text.contains("<SSN>"));
	}

	#[tokio::test]
	async fn scoped_attachment_runs_once_at_highest_scope() {
		let p = pipeline(
			r#"
- guardrail_name: shared
  litellm_params:
    guardrail: regex
    mode: pre_call
    default_on: true
    action: mask
    rules:
      - builtin: email
"#,
		);
		// Attached at model level AND on by default globally: runs once.
		let selection = HookSelection {
			model: vec!["shared".to_string()],
			team: vec!["shared".to_string()],
			requested: Vec::new(),
		};
		let mut req = chat_request("a@b.com");
		let outcome = p.run_request(HookPoint::PreCall, &mut req, &selection).await;
		assert_eq!(outcome.results.len(), 1);
		assert_eq!(outcome.results[0].name.as_str(), "shared");
		assert_eq!(outcome.results[0].scope.as_str(), "model");
	}
}
