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
	const NAME: Strng = strng::literal!("gcp.gemini");
}

pub const DEFAULT_HOST_STR: &str = "generativelanguage.googleapis.com";
pub const DEFAULT_HOST: Strng = strng::literal!(DEFAULT_HOST_STR);
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

pub fn path(route: RouteType, model: &str, streaming: bool) -> Strng {
	match route {
		// Gemini exposes an OpenAI-compatible embeddings surface; use it so
		// no translation is needed.
		RouteType::Embeddings => strng::literal!("/v1beta/openai/embeddings"),
		_ if streaming => strng::format!("/v1beta/models/{model}:streamGenerateContent?alt=sse"),
		_ => strng::format!("/v1beta/models/{model}:generateContent"),
	}
}
