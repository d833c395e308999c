use serde::{Deserialize, Serialize};

use crate::llm::RouteType;
use crate::llm::types::completions;
use crate::{Strng, strng};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub model: Option<Strng>,
}

impl super::Provider for Provider {
	const NAME: Strng = strng::literal!("anthropic");
}

pub const DEFAULT_HOST_STR: &str = "api.anthropic.com";
pub const DEFAULT_HOST: Strng = strng::literal!(DEFAULT_HOST_STR);
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
// https://docs.anthropic.com/en/api/versioning
pub const API_VERSION: &str = "2023-06-01";

pub fn path(route: RouteType) -> &'static str {
	match route {
		RouteType::CountTokens => "/v1/messages/count_tokens",
		_ => "/v1/messages",
	}
}

/// Which flavor of the Anthropic API serves this request. Beta feature names
/// differ per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
	Direct,
	Vertex,
	Bedrock,
}

/// Request features that require an `anthropic-beta` header, keyed by the
/// tool `type` prefix that activates them. Unknown tool types never inject a
/// header.
const BETA_FEATURES: &[(&str, BetaFeature)] = &[
	(
		"tool_search_tool_regex",
		BetaFeature {
			direct: "advanced-tool-use-2025-11-20",
			alternate: Some("tool-search-tool-2025-10-02"),
		},
	),
	(
		"code_execution",
		BetaFeature {
			direct: "code-execution-2025-05-22",
			alternate: None,
		},
	),
	(
		"computer",
		BetaFeature {
			direct: "computer-use-2025-01-24",
			alternate: None,
		},
	),
	(
		"mcp",
		BetaFeature {
			direct: "mcp-client-2025-04-04",
			alternate: None,
		},
	),
];

#[derive(Debug, Clone, Copy)]
struct BetaFeature {
	direct: &'static str,
	/// Used on the Vertex/Bedrock channels where the beta is named
	/// differently; `None` means the direct name applies everywhere.
	alternate: Option<&'static str>,
}

/// Compute the `anthropic-beta` header value for a request, if any of its
/// tools activate a beta feature.
pub fn beta_header_for_tools(tools: &[completions::Tool], channel: Channel) -> Option<String> {
	let mut betas: Vec<&'static str> = Vec::new();
	for tool in tools {
		for (prefix, feature) in BETA_FEATURES {
			if tool.r#type.starts_with(prefix) {
				let name = match channel {
					Channel::Direct => feature.direct,
					Channel::Vertex | Channel::Bedrock => feature.alternate.unwrap_or(feature.direct),
				};
				if !betas.contains(&name) {
					betas.push(name);
				}
			}
		}
	}
	if betas.is_empty() {
		None
	} else {
		Some(betas.join(","))
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
	fn beta_header_injection_is_table_driven() {
		let tools = vec![tool("function"), tool("tool_search_tool_regex_20251119")];
		assert_eq!(
			beta_header_for_tools(&tools, Channel::Direct).as_deref(),
			Some("advanced-tool-use-2025-11-20")
		);
		assert_eq!(
			beta_header_for_tools(&tools, Channel::Bedrock).as_deref(),
			Some("tool-search-tool-2025-10-02")
		);
	}

	#[test]
	fn unknown_features_never_inject() {
		let tools = vec![tool("function"), tool("some_future_tool")];
		assert_eq!(beta_header_for_tools(&tools, Channel::Direct), None);
	}
}
