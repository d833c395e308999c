pub mod bedrock;
pub mod completions;
pub mod embeddings;
pub mod gemini;
pub mod messages;
pub mod rerank;

use crate::Strng;
use crate::llm::{AIError, LLMRequest, LLMResponse};
use crate::strng;

/// ResponseType is an abstraction over provider/endpoint specific response
/// formats that enables uniform policy enforcement and observability.
pub trait ResponseType: Send + Sync {
	fn to_llm_response(&self, include_completion_in_log: bool) -> LLMResponse;
	fn to_guard_choices(&self) -> Vec<GuardChoice>;
	fn set_guard_choices(&mut self, choices: Vec<GuardChoice>) -> anyhow::Result<()>;
	fn serialize(&self) -> serde_json::Result<Vec<u8>>;
}

/// RequestType is an abstraction over provider/endpoint specific request
/// formats that enables uniform policy enforcement and observability.
pub trait RequestType: Send + Sync {
	fn model(&mut self) -> &mut Option<String>;
	fn prepend_prompts(&mut self, prompts: Vec<SimpleChatCompletionMessage>);
	fn append_prompts(&mut self, prompts: Vec<SimpleChatCompletionMessage>);
	fn to_llm_request(&self, provider: Strng, tokenize: bool) -> Result<LLMRequest, AIError>;
	fn get_messages(&self) -> Vec<SimpleChatCompletionMessage>;
	fn set_messages(&mut self, messages: Vec<SimpleChatCompletionMessage>);

	/// Tool definitions in the unified shape, used for feature detection
	/// (beta headers, channel selection).
	fn tool_definitions(&self) -> Vec<completions::Tool> {
		Vec::new()
	}

	fn to_openai(&self) -> Result<Vec<u8>, AIError> {
		Err(AIError::UnsupportedConversion(strng::literal!("openai")))
	}

	fn to_anthropic(&self) -> Result<Vec<u8>, AIError> {
		Err(AIError::UnsupportedConversion(strng::literal!("anthropic")))
	}

	fn to_gemini(&self) -> Result<Vec<u8>, AIError> {
		Err(AIError::UnsupportedConversion(strng::literal!("gemini")))
	}

	fn to_bedrock(
		&self,
		_provider: &crate::llm::bedrock::Provider,
	) -> Result<Vec<u8>, AIError> {
		Err(AIError::UnsupportedConversion(strng::literal!("bedrock")))
	}
}

/// A simplified view of one conversational turn, used by guardrails and
/// prompt enrichment which do not care about provider shapes.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SimpleChatCompletionMessage {
	pub role: Strng,
	pub content: Strng,
}

/// One response choice as seen by output-side guardrails.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GuardChoice {
	pub role: Strng,
	pub content: String,
}
