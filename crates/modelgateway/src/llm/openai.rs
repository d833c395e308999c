use serde::{Deserialize, Serialize};

use crate::llm::RouteType;
use crate::{Strng, strng};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub model: Option<Strng>,
}

impl super::Provider for Provider {
	const NAME: Strng = strng::literal!("openai");
}

pub const DEFAULT_HOST_STR: &str = "api.openai.com";
pub const DEFAULT_HOST: Strng = strng::literal!(DEFAULT_HOST_STR);
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

pub fn path(route: RouteType) -> &'static str {
	match route {
		RouteType::Embeddings => "/v1/embeddings",
		RouteType::Responses => "/v1/responses",
		RouteType::Models => "/v1/models",
		RouteType::Rerank => "/v1/rerank",
		// All others get translated down to completions
		_ => "/v1/chat/completions",
	}
}
