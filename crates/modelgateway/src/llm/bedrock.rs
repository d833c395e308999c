use serde::{Deserialize, Serialize};

use crate::llm::RouteType;
use crate::llm::types::completions;
use crate::{Strng, strng};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
	/// Optional: model override for the Bedrock API path.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub model: Option<Strng>,
	/// Required: AWS region.
	pub region: Strng,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub guardrail_identifier: Option<Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub guardrail_version: Option<Strng>,
}

impl super::Provider for Provider {
	const NAME: Strng = strng::literal!("aws.bedrock");
}

/// Bedrock supports key-based auth with a bearer token; SigV4 signing is a
/// transport concern layered outside the adapter.
pub const API_KEY_ENV: &str = "AWS_BEARER_TOKEN_BEDROCK";

/// Which Bedrock API a request is sent over. Converse is the default;
/// features outside its surface fall back to Invoke, which speaks the
/// Anthropic Messages shape natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
	Converse,
	Invoke,
}

impl Provider {
	pub fn get_path_for_route(&self, route_type: RouteType, streaming: bool, model: &str) -> Strng {
		let model = self.model.as_deref().unwrap_or(model);
		match route_type {
			RouteType::CountTokens => strng::format!("/model/{model}/count-tokens"),
			RouteType::Embeddings => strng::format!("/model/{model}/invoke"),
			_ if streaming => strng::format!("/model/{model}/converse-stream"),
			_ => strng::format!("/model/{model}/converse"),
		}
	}

	pub fn get_invoke_path(&self, streaming: bool, model: &str) -> Strng {
		let model = self.model.as_deref().unwrap_or(model);
		if streaming {
			strng::format!("/model/{model}/invoke-with-response-stream")
		} else {
			strng::format!("/model/{model}/invoke")
		}
	}

	pub fn get_host(&self) -> Strng {
		strng::format!("bedrock-runtime.{}.amazonaws.com", self.region)
	}

	/// Capability matrix: tool search only works over Invoke; the BM25
	/// variant is not available on Bedrock at all and is filtered out by the
	/// request translation.
	pub fn channel_for_tools(&self, tools: Option<&[completions::Tool]>) -> Channel {
		let uses_tool_search = tools
			.into_iter()
			.flatten()
			.any(|t| t.r#type.starts_with("tool_search_tool_regex"));
		if uses_tool_search {
			Channel::Invoke
		} else {
			Channel::Converse
		}
	}

	/// Tools Bedrock cannot serve on any channel.
	pub fn is_unsupported_tool(tool: &completions::Tool) -> bool {
		tool.r#type.starts_with("tool_search_tool_bm25")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn tool(t: &str) -> completions::Tool {
		completions::Tool {
			r#type: t.to_string(),
			function: None,
			rest: Default::default(),
		}
	}

	#[test]
	fn tool_search_selects_invoke() {
		let p = Provider {
			model: None,
			region: strng::literal!("us-west-2"),
			guardrail_identifier: None,
			guardrail_version: None,
		};
		assert_eq!(p.channel_for_tools(None), Channel::Converse);
		let tools = vec![tool("function")];
		assert_eq!(p.channel_for_tools(Some(&tools)), Channel::Converse);
		let tools = vec![tool("tool_search_tool_regex_20251119")];
		assert_eq!(p.channel_for_tools(Some(&tools)), Channel::Invoke);
	}

	#[test]
	fn bm25_variant_is_filtered() {
		assert!(Provider::is_unsupported_tool(&tool(
			"tool_search_tool_bm25_20251119"
		)));
		assert!(!Provider::is_unsupported_tool(&tool("function")));
	}
}
