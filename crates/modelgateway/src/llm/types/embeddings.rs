//! The OpenAI `/v1/embeddings` shape. Providers that accept it natively get
//! passthrough; others receive a small translation in their adapter.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::types::{GuardChoice, RequestType, ResponseType, SimpleChatCompletionMessage};
use crate::llm::{AIError, InputFormat, LLMRequest, LLMRequestParams, LLMResponse};
use crate::{Strng, strng};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
	pub input: EmbeddingInput,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub encoding_format: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub dimensions: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user: Option<String>,
	#[serde(flatten)]
	pub rest: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
	Text(String),
	Array(Vec<String>),
	/// Pre-tokenized input.
	Tokens(Vec<Vec<u32>>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	pub object: String,
	pub data: Vec<Embedding>,
	pub model: String,
	pub usage: EmbeddingUsage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
	pub object: String,
	pub index: u32,
	pub embedding: Value,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EmbeddingUsage {
	pub prompt_tokens: u64,
	pub total_tokens: u64,
}

impl RequestType for Request {
	fn model(&mut self) -> &mut Option<String> {
		&mut self.model
	}

	// Embeddings have no conversational turns; prompt enrichment does not
	// apply.
	fn prepend_prompts(&mut self, _prompts: Vec<SimpleChatCompletionMessage>) {}
	fn append_prompts(&mut self, _prompts: Vec<SimpleChatCompletionMessage>) {}

	fn to_llm_request(&self, provider: Strng, _tokenize: bool) -> Result<LLMRequest, AIError> {
		Ok(LLMRequest {
			input_tokens: None,
			input_format: InputFormat::Embeddings,
			request_model: strng::new(self.model.as_deref().unwrap_or_default()),
			provider,
			streaming: false,
			params: LLMRequestParams {
				encoding_format: self.encoding_format.as_deref().map(strng::new),
				dimensions: self.dimensions,
				..Default::default()
			},
		})
	}

	fn get_messages(&self) -> Vec<SimpleChatCompletionMessage> {
		Vec::new()
	}

	fn set_messages(&mut self, _messages: Vec<SimpleChatCompletionMessage>) {}

	fn to_openai(&self) -> Result<Vec<u8>, AIError> {
		serde_json::to_vec(self).map_err(AIError::RequestMarshal)
	}
}

impl ResponseType for Response {
	fn to_llm_response(&self, _include_completion_in_log: bool) -> LLMResponse {
		LLMResponse {
			input_tokens: Some(self.usage.prompt_tokens),
			total_tokens: Some(self.usage.total_tokens),
			provider_model: Some(strng::new(&self.model)),
			..Default::default()
		}
	}

	fn to_guard_choices(&self) -> Vec<GuardChoice> {
		Vec::new()
	}

	fn set_guard_choices(&mut self, _choices: Vec<GuardChoice>) -> anyhow::Result<()> {
		Ok(())
	}

	fn serialize(&self) -> serde_json::Result<Vec<u8>> {
		serde_json::to_vec(self)
	}
}
