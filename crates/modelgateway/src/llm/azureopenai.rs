use serde::{Deserialize, Serialize};

use crate::llm::RouteType;
use crate::{Strng, strng};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
	/// The Azure OpenAI model deployment name.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub model: Option<Strng>,
	/// `<resource>.openai.azure.com`.
	pub host: Strng,
	/// Defaults to the `v1` surface.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub api_version: Option<Strng>,
}

impl super::Provider for Provider {
	const NAME: Strng = strng::literal!("azure.openai");
}

pub const API_KEY_ENV: &str = "AZURE_API_KEY";

impl Provider {
	pub fn get_path_for_model(&self, route: RouteType, model: &str) -> Strng {
		let t = match route {
			RouteType::Embeddings => strng::literal!("embeddings"),
			RouteType::Responses => strng::literal!("responses"),
			_ => strng::literal!("chat/completions"),
		};
		let api_version = self.api_version();
		if api_version == "v1" {
			strng::format!("/openai/v1/{t}")
		} else if api_version == "preview" {
			strng::format!("/openai/v1/{t}?api-version=preview")
		} else {
			let model = self.model.as_deref().unwrap_or(model);
			strng::format!(
				"/openai/deployments/{}/{t}?api-version={}",
				model,
				api_version
			)
		}
	}

	pub fn get_host(&self) -> Strng {
		self.host.clone()
	}

	fn api_version(&self) -> &str {
		self.api_version.as_deref().unwrap_or("v1")
	}
}
