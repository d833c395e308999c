//! The cost engine: per-call spend computed from usage and per-model pricing.
//!
//! Pricing is bucketed (uncached input, cached read, cache write, reasoning,
//! output, server tools) and input supports tiered `above_Nk` rates that
//! compose piecewise, so cost is monotonic and continuous at tier thresholds.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::types::completions::Usage;
use crate::llm::{AIError, num_tokens_from_text};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelInfo {
	/// chat | embedding | rerank | image_generation | audio_speech
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub mode: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub context_window: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_input_tokens: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_output_tokens: Option<u64>,

	#[serde(default)]
	pub input_cost_per_token: f64,
	#[serde(default)]
	pub output_cost_per_token: f64,
	/// Defaults to the output rate when unset.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reasoning_cost_per_token: Option<f64>,
	/// Defaults to the input rate when unset.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cache_read_input_token_cost: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cache_creation_input_token_cost: Option<f64>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cost_per_web_search_request: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cost_per_tool_search_request: Option<f64>,

	#[serde(default, skip_serializing_if = "crate::is_default")]
	pub supports_function_calling: bool,
	#[serde(default, skip_serializing_if = "crate::is_default")]
	pub supports_vision: bool,
	#[serde(default, skip_serializing_if = "crate::is_default")]
	pub supports_reasoning: bool,
	#[serde(default, skip_serializing_if = "crate::is_default")]
	pub supports_pdf_input: bool,
	#[serde(default, skip_serializing_if = "crate::is_default")]
	pub supports_tool_choice: bool,
	#[serde(default, skip_serializing_if = "crate::is_default")]
	pub supports_response_format: bool,
	#[serde(default, skip_serializing_if = "crate::is_default")]
	pub supports_streaming: bool,
	#[serde(default, skip_serializing_if = "crate::is_default")]
	pub supports_audio_input: bool,
	#[serde(default, skip_serializing_if = "crate::is_default")]
	pub supports_audio_output: bool,
	#[serde(default, skip_serializing_if = "crate::is_default")]
	pub supports_prompt_caching: bool,
	#[serde(default, skip_serializing_if = "crate::is_default")]
	pub supports_web_search: bool,

	/// Catch-all for keys we derive structure from, most importantly the
	/// tiered `{input,output}_cost_per_token_above_{N}k_tokens` entries.
	#[serde(flatten)]
	pub extra: serde_json::Map<String, Value>,
}

static TIER_KEY: Lazy<Regex> = Lazy::new(|| {
	Regex::new(r"^(input|output)_cost_per_token_above_(\d+)k_tokens$").expect("static regex")
});

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceTier {
	/// Threshold in tokens (the `N` in `above_Nk`, times 1000).
	pub threshold: u64,
	pub input_cost_per_token: Option<f64>,
	pub output_cost_per_token: Option<f64>,
}

impl ModelInfo {
	/// Tier entries parsed from `extra`, ascending by threshold.
	pub fn tiers(&self) -> Vec<PriceTier> {
		let mut tiers: Vec<PriceTier> = Vec::new();
		for (key, value) in &self.extra {
			let Some(caps) = TIER_KEY.captures(key) else {
				continue;
			};
			let Some(rate) = value.as_f64() else {
				continue;
			};
			let threshold: u64 = caps[2].parse::<u64>().unwrap_or_default() * 1000;
			let idx = match tiers.iter().position(|t| t.threshold == threshold) {
				Some(idx) => idx,
				None => {
					tiers.push(PriceTier {
						threshold,
						input_cost_per_token: None,
						output_cost_per_token: None,
					});
					tiers.len() - 1
				},
			};
			let entry = &mut tiers[idx];
			match &caps[1] {
				"input" => entry.input_cost_per_token = Some(rate),
				_ => entry.output_cost_per_token = Some(rate),
			}
		}
		tiers.sort_by_key(|t| t.threshold);
		tiers
	}

	/// Piecewise input cost: the base rate covers tokens up to the first
	/// threshold; each tier prices the tokens between its threshold and the
	/// next.
	pub fn input_cost(&self, tokens: u64) -> f64 {
		let mut remaining = tokens;
		let mut cost = 0.0;
		let mut rate = self.input_cost_per_token;
		let mut floor = 0u64;
		for tier in self.tiers() {
			let Some(tier_rate) = tier.input_cost_per_token else {
				continue;
			};
			let span = tier.threshold.saturating_sub(floor).min(remaining);
			cost += span as f64 * rate;
			remaining -= span;
			floor = tier.threshold;
			rate = tier_rate;
			if remaining == 0 {
				break;
			}
		}
		cost + remaining as f64 * rate
	}

	/// Output rate, switched (not piecewise) by prompt size when an output
	/// tier is declared: long-context requests price all output at the tier
	/// rate.
	pub fn output_rate(&self, prompt_tokens: u64) -> f64 {
		let mut rate = self.output_cost_per_token;
		for tier in self.tiers() {
			if prompt_tokens > tier.threshold
				&& let Some(r) = tier.output_cost_per_token
			{
				rate = r;
			}
		}
		rate
	}

	pub fn cache_read_rate(&self) -> f64 {
		self
			.cache_read_input_token_cost
			.unwrap_or(self.input_cost_per_token)
	}

	pub fn reasoning_rate(&self) -> f64 {
		self
			.reasoning_cost_per_token
			.unwrap_or(self.output_cost_per_token)
	}
}

/// Cost of one call, by bucket. All figures in USD.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CostBreakdown {
	pub input: f64,
	pub output: f64,
	pub tool_calls: f64,
	pub total: f64,
}

impl CostBreakdown {
	pub fn with_tool_calls(mut self, tool_calls: f64) -> CostBreakdown {
		self.tool_calls += tool_calls;
		self.total += tool_calls;
		self
	}
}

/// Compute the cost of a completed call from its usage.
pub fn compute_cost(info: &ModelInfo, usage: &Usage) -> CostBreakdown {
	let cached_read = usage.cached_tokens().min(usage.prompt_tokens);
	let uncached = usage.prompt_tokens - cached_read;
	let cache_write = usage.cache_creation_input_tokens.unwrap_or_default();
	let reasoning = usage.reasoning_tokens();

	// Tiering is keyed on total prompt size; the cached split prices within
	// the blended rate.
	let mut input = if cached_read > 0 {
		let blended = info.input_cost(usage.prompt_tokens);
		let cached_discount = cached_read as f64 * (info.input_cost_per_token - info.cache_read_rate());
		(blended - cached_discount).max(0.0)
	} else {
		info.input_cost(uncached)
	};
	input += cache_write as f64
		* info
			.cache_creation_input_token_cost
			.unwrap_or(info.input_cost_per_token);

	let output = usage.completion_tokens as f64 * info.output_rate(usage.prompt_tokens)
		+ reasoning as f64 * info.reasoning_rate();

	let mut tool_calls = 0.0;
	if let Some(st) = &usage.server_tool_use {
		tool_calls += st.web_search_requests as f64 * info.cost_per_web_search_request.unwrap_or(0.0);
		tool_calls += st.tool_search_requests as f64 * info.cost_per_tool_search_request.unwrap_or(0.0);
	}

	CostBreakdown {
		input,
		output,
		tool_calls,
		total: input + output + tool_calls,
	}
}

/// When a stream ends without a usage block, fall back to counting tokens
/// locally over the concatenated content with a model-appropriate tokenizer
/// (generic BPE when the model is unknown).
pub fn usage_from_completion_text(
	model: &str,
	prompt_tokens: Option<u64>,
	completion: &str,
) -> Result<Usage, AIError> {
	let completion_tokens = num_tokens_from_text(model, completion)?;
	Ok(Usage::new(
		prompt_tokens.unwrap_or_default(),
		completion_tokens,
		0,
	))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sonnet_tiered() -> ModelInfo {
		serde_json::from_value(serde_json::json!({
			"input_cost_per_token": 3e-6,
			"output_cost_per_token": 15e-6,
			"input_cost_per_token_above_200k_tokens": 6e-6,
		}))
		.unwrap()
	}

	#[test]
	fn tier_keys_parse() {
		let tiers = sonnet_tiered().tiers();
		assert_eq!(tiers.len(), 1);
		assert_eq!(tiers[0].threshold, 200_000);
		assert_eq!(tiers[0].input_cost_per_token, Some(6e-6));
	}

	#[test]
	fn tiered_pricing_long_context() {
		// 250k input at $3/M below 200k and $6/M above, 1k output at $15/M:
		// 0.6 + 0.3 + 0.015
		let info = sonnet_tiered();
		let usage = Usage::new(250_000, 1_000, 0);
		let cost = compute_cost(&info, &usage);
		assert!((cost.input - 0.9).abs() < 1e-9, "input was {}", cost.input);
		assert!((cost.output - 0.015).abs() < 1e-9);
		assert!((cost.total - 0.915).abs() < 1e-9);
	}

	#[test]
	fn tiered_pricing_is_continuous_at_threshold() {
		let info = sonnet_tiered();
		let below = info.input_cost(200_000);
		let at = info.input_cost(200_001);
		assert!(at > below);
		assert!((at - below - 6e-6).abs() < 1e-12);
	}

	#[test]
	fn cost_is_monotonic() {
		let info = sonnet_tiered();
		let mut last = -1.0;
		for tokens in [0u64, 1, 100, 199_999, 200_000, 200_001, 400_000] {
			let c = info.input_cost(tokens);
			assert!(c >= last, "cost regressed at {tokens}");
			last = c;
		}
	}

	#[test]
	fn multiple_tiers_compose_ascending() {
		let info: ModelInfo = serde_json::from_value(serde_json::json!({
			"input_cost_per_token": 1e-6,
			"input_cost_per_token_above_100k_tokens": 2e-6,
			"input_cost_per_token_above_200k_tokens": 4e-6,
		}))
		.unwrap();
		// 100k at base + 100k at tier1 + 50k at tier2
		let cost = info.input_cost(250_000);
		let want = 100_000.0 * 1e-6 + 100_000.0 * 2e-6 + 50_000.0 * 4e-6;
		assert!((cost - want).abs() < 1e-9);
	}

	#[test]
	fn cached_reads_are_discounted_not_additive() {
		let info: ModelInfo = serde_json::from_value(serde_json::json!({
			"input_cost_per_token": 10e-6,
			"output_cost_per_token": 0.0,
			"cache_read_input_token_cost": 1e-6,
		}))
		.unwrap();
		let mut usage = Usage::new(1_000, 0, 0);
		usage.prompt_tokens_details = Some(crate::llm::types::completions::PromptTokensDetails {
			cached_tokens: 400,
			..Default::default()
		});
		let cost = compute_cost(&info, &usage);
		// 600 uncached at 10, 400 cached at 1
		let want = 600.0 * 10e-6 + 400.0 * 1e-6;
		assert!((cost.input - want).abs() < 1e-9);
	}

	#[test]
	fn server_tool_use_is_priced() {
		let info: ModelInfo = serde_json::from_value(serde_json::json!({
			"cost_per_web_search_request": 0.01,
		}))
		.unwrap();
		let mut usage = Usage::new(10, 10, 0);
		usage.server_tool_use = Some(crate::llm::types::completions::ServerToolUse {
			web_search_requests: 3,
			..Default::default()
		});
		let cost = compute_cost(&info, &usage);
		assert!((cost.tool_calls - 0.03).abs() < 1e-9);
	}
}
