//! The Anthropic Messages API shape, used both as an inbound surface
//! (`/v1/messages`) and as the wire format for Anthropic-family providers.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::is_default;
use crate::llm::types::{GuardChoice, RequestType, ResponseType, SimpleChatCompletionMessage};
use crate::llm::{
	AIError, InputFormat, LLMRequest, LLMRequestParams, LLMResponse, conversion,
	num_tokens_from_text,
};
use crate::{Strng, strng};

pub use super::completions::ThinkingInput;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
	pub messages: Vec<Message>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub system: Option<SystemPrompt>,
	pub max_tokens: u64,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub stop_sequences: Vec<String>,
	#[serde(default, skip_serializing_if = "is_default")]
	pub stream: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_k: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tools: Option<Vec<Tool>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool_choice: Option<ToolChoice>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub metadata: Option<Metadata>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub thinking: Option<ThinkingInput>,
	#[serde(flatten)]
	pub rest: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
	pub role: Role,
	#[serde(deserialize_with = "deserialize_content")]
	pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	#[default]
	User,
	Assistant,
}

/// Anthropic allows `content` to be a bare string shorthand for one text
/// block.
fn deserialize_content<'de, D>(deserializer: D) -> Result<Vec<ContentBlock>, D::Error>
where
	D: Deserializer<'de>,
{
	use serde::de::Error;

	let value = Value::deserialize(deserializer)?;
	match value {
		Value::String(text) => Ok(vec![ContentBlock::Text(ContentTextBlock {
			text,
			citations: None,
			cache_control: None,
		})]),
		Value::Array(_) => Vec::<ContentBlock>::deserialize(value).map_err(D::Error::custom),
		_ => Err(D::Error::custom(
			"content must be either a string or an array",
		)),
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ContentBlock {
	Text(ContentTextBlock),
	Image {
		source: Value,
		#[serde(skip_serializing_if = "Option::is_none")]
		cache_control: Option<Value>,
	},
	Document {
		source: Value,
		#[serde(skip_serializing_if = "Option::is_none")]
		cache_control: Option<Value>,
	},
	Thinking {
		thinking: String,
		signature: String,
	},
	RedactedThinking {
		data: String,
	},
	ToolUse {
		id: String,
		name: String,
		input: Value,
		#[serde(skip_serializing_if = "Option::is_none")]
		cache_control: Option<Value>,
	},
	ToolResult {
		tool_use_id: String,
		content: ToolResultContent,
		#[serde(skip_serializing_if = "Option::is_none")]
		is_error: Option<bool>,
		#[serde(skip_serializing_if = "Option::is_none")]
		cache_control: Option<Value>,
	},
	ServerToolUse {
		id: String,
		name: String,
		input: Value,
	},
	WebSearchToolResult {
		tool_use_id: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		content: Option<Value>,
	},
	// There are LOTs of possible values; since we don't support them all,
	// just allow them without failing
	#[serde(other)]
	Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentTextBlock {
	pub text: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub citations: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_control: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
	Text(String),
	Array(Vec<Value>),
}

impl ToolResultContent {
	pub fn as_text(&self) -> String {
		match self {
			ToolResultContent::Text(t) => t.clone(),
			ToolResultContent::Array(parts) => parts
				.iter()
				.filter_map(|p| p.get("text").and_then(|t| t.as_str()))
				.collect::<Vec<_>>()
				.join("\n"),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
	Text(String),
	Blocks(Vec<SystemContentBlock>),
}

impl SystemPrompt {
	pub fn as_text(&self) -> String {
		match self {
			SystemPrompt::Text(t) => t.clone(),
			SystemPrompt::Blocks(blocks) => blocks
				.iter()
				.map(|SystemContentBlock::Text { text, .. }| text.as_str())
				.collect::<Vec<_>>()
				.join("\n"),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemContentBlock {
	Text {
		text: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		cache_control: Option<Value>,
	},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
	pub name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	/// Absent for provider built-in tools, whose `type` rides in `rest`.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub input_schema: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_control: Option<Value>,
	#[serde(flatten)]
	pub rest: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
	Auto,
	Any,
	Tool { name: String },
	None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
	#[serde(flatten)]
	pub fields: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
	pub id: String,
	pub r#type: String,
	pub role: Role,
	pub content: Vec<ContentBlock>,
	pub model: String,
	pub stop_reason: Option<StopReason>,
	pub stop_sequence: Option<String>,
	pub usage: Usage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
	EndTurn,
	MaxTokens,
	StopSequence,
	ToolUse,
	Refusal,
	PauseTurn,
	ModelContextWindowExceeded,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
	pub input_tokens: u64,
	pub output_tokens: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_creation_input_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_read_input_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum MessagesStreamEvent {
	MessageStart {
		message: MessagesResponse,
	},
	ContentBlockStart {
		index: usize,
		content_block: ContentBlock,
	},
	ContentBlockDelta {
		index: usize,
		delta: ContentBlockDelta,
	},
	ContentBlockStop {
		index: usize,
	},
	MessageDelta {
		delta: MessageDelta,
		usage: MessageDeltaUsage,
	},
	MessageStop,
	Ping,
	Error {
		error: MessagesError,
	},
}

impl MessagesStreamEvent {
	pub fn event_name(&self) -> &'static str {
		match self {
			Self::MessageStart { .. } => "message_start",
			Self::ContentBlockStart { .. } => "content_block_start",
			Self::ContentBlockDelta { .. } => "content_block_delta",
			Self::ContentBlockStop { .. } => "content_block_stop",
			Self::MessageDelta { .. } => "message_delta",
			Self::MessageStop => "message_stop",
			Self::Ping => "ping",
			Self::Error { .. } => "error",
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ContentBlockDelta {
	TextDelta { text: String },
	InputJsonDelta { partial_json: String },
	ThinkingDelta { thinking: String },
	SignatureDelta { signature: String },
	CitationsDelta { citations: Value },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageDelta {
	pub stop_reason: Option<StopReason>,
	pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageDeltaUsage {
	#[serde(default)]
	pub input_tokens: u64,
	pub output_tokens: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_creation_input_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_read_input_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesErrorResponse {
	pub r#type: String,
	pub error: MessagesError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessagesError {
	pub r#type: String,
	pub message: String,
}

/// Request body for `/v1/messages/count_tokens`: the same fields minus the
/// sampling controls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountTokensRequest {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
	pub messages: Vec<Message>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub system: Option<SystemPrompt>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tools: Option<Vec<Tool>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountTokensResponse {
	pub input_tokens: u64,
}

impl Message {
	pub fn text(&self) -> Option<String> {
		let texts: Vec<&str> = self
			.content
			.iter()
			.filter_map(|b| match b {
				ContentBlock::Text(t) => Some(t.text.as_str()),
				_ => None,
			})
			.collect();
		if texts.is_empty() {
			None
		} else {
			Some(texts.join("\n"))
		}
	}
}

impl From<SimpleChatCompletionMessage> for Message {
	fn from(m: SimpleChatCompletionMessage) -> Self {
		Message {
			role: if m.role.as_str() == "assistant" {
				Role::Assistant
			} else {
				Role::User
			},
			content: vec![ContentBlock::Text(ContentTextBlock {
				text: m.content.to_string(),
				citations: None,
				cache_control: None,
			})],
		}
	}
}

impl RequestType for Request {
	fn model(&mut self) -> &mut Option<String> {
		&mut self.model
	}

	fn prepend_prompts(&mut self, prompts: Vec<SimpleChatCompletionMessage>) {
		let (system_prompts, message_prompts): (Vec<_>, Vec<_>) = prompts
			.into_iter()
			.partition(|p| p.role.as_str() == "system");

		if !system_prompts.is_empty() {
			let existing = self.system.take().map(|s| s.as_text()).unwrap_or_default();
			let mut joined: Vec<String> = system_prompts
				.into_iter()
				.map(|p| p.content.to_string())
				.collect();
			if !existing.is_empty() {
				joined.push(existing);
			}
			self.system = Some(SystemPrompt::Text(joined.join("\n")));
		}

		if !message_prompts.is_empty() {
			self
				.messages
				.splice(..0, message_prompts.into_iter().map(Into::into));
		}
	}

	fn append_prompts(&mut self, prompts: Vec<SimpleChatCompletionMessage>) {
		let (system_prompts, message_prompts): (Vec<_>, Vec<_>) = prompts
			.into_iter()
			.partition(|p| p.role.as_str() == "system");

		if !system_prompts.is_empty() {
			let existing = self.system.take().map(|s| s.as_text()).unwrap_or_default();
			let mut joined = if existing.is_empty() {
				Vec::new()
			} else {
				vec![existing]
			};
			joined.extend(system_prompts.into_iter().map(|p| p.content.to_string()));
			self.system = Some(SystemPrompt::Text(joined.join("\n")));
		}

		if !message_prompts.is_empty() {
			self
				.messages
				.extend(message_prompts.into_iter().map(Into::into));
		}
	}

	fn to_llm_request(&self, provider: Strng, tokenize: bool) -> Result<LLMRequest, AIError> {
		let model = strng::new(self.model.as_deref().unwrap_or_default());
		let input_tokens = if tokenize {
			let text = self
				.messages
				.iter()
				.filter_map(|m| m.text())
				.collect::<Vec<_>>()
				.join("\n");
			Some(num_tokens_from_text(&model, &text)? + 3 * self.messages.len() as u64)
		} else {
			None
		};
		Ok(LLMRequest {
			input_tokens,
			input_format: InputFormat::Messages,
			request_model: model,
			provider,
			streaming: self.stream,
			params: LLMRequestParams {
				temperature: self.temperature,
				top_p: self.top_p,
				max_tokens: Some(self.max_tokens),
				..Default::default()
			},
		})
	}

	fn get_messages(&self) -> Vec<SimpleChatCompletionMessage> {
		self
			.messages
			.iter()
			.map(|m| SimpleChatCompletionMessage {
				role: match m.role {
					Role::User => strng::literal!("user"),
					Role::Assistant => strng::literal!("assistant"),
				},
				content: m.text().map(|t| strng::new(&t)).unwrap_or_default(),
			})
			.collect()
	}

	fn set_messages(&mut self, messages: Vec<SimpleChatCompletionMessage>) {
		self.messages = messages.into_iter().map(Into::into).collect();
	}

	fn tool_definitions(&self) -> Vec<crate::llm::types::completions::Tool> {
		self
			.tools
			.iter()
			.flatten()
			.map(|t| crate::llm::types::completions::Tool {
				r#type: t
					.rest
					.get("type")
					.and_then(|v| v.as_str())
					.unwrap_or("function")
					.to_string(),
				function: None,
				rest: Default::default(),
			})
			.collect()
	}

	fn to_openai(&self) -> Result<Vec<u8>, AIError> {
		conversion::completions::from_messages::translate(self)
	}

	fn to_anthropic(&self) -> Result<Vec<u8>, AIError> {
		serde_json::to_vec(self).map_err(AIError::RequestMarshal)
	}

	fn to_bedrock(
		&self,
		provider: &crate::llm::bedrock::Provider,
	) -> Result<Vec<u8>, AIError> {
		conversion::bedrock::from_messages::translate(self, provider)
	}
}

impl ResponseType for MessagesResponse {
	fn to_llm_response(&self, include_completion_in_log: bool) -> LLMResponse {
		LLMResponse {
			input_tokens: Some(self.usage.input_tokens),
			output_tokens: Some(self.usage.output_tokens),
			total_tokens: Some(self.usage.input_tokens + self.usage.output_tokens),
			provider_model: Some(strng::new(&self.model)),
			completion: include_completion_in_log.then(|| {
				self
					.content
					.iter()
					.filter_map(|c| match c {
						ContentBlock::Text(t) => Some(t.text.clone()),
						_ => None,
					})
					.collect()
			}),
			usage: Some(crate::llm::types::completions::Usage {
				prompt_tokens: self.usage.input_tokens,
				completion_tokens: self.usage.output_tokens,
				total_tokens: self.usage.input_tokens + self.usage.output_tokens,
				prompt_tokens_details: self.usage.cache_read_input_tokens.map(|cached| {
					crate::llm::types::completions::PromptTokensDetails {
						cached_tokens: cached,
						..Default::default()
					}
				}),
				cache_creation_input_tokens: self.usage.cache_creation_input_tokens,
				..Default::default()
			}),
			first_token: None,
			count_tokens: None,
		}
	}

	fn to_guard_choices(&self) -> Vec<GuardChoice> {
		self
			.content
			.iter()
			.filter_map(|c| match c {
				ContentBlock::Text(t) => Some(GuardChoice {
					role: strng::literal!("assistant"),
					content: t.text.clone(),
				}),
				_ => None,
			})
			.collect()
	}

	fn set_guard_choices(&mut self, choices: Vec<GuardChoice>) -> anyhow::Result<()> {
		let mut iter = choices.into_iter();
		for block in self.content.iter_mut() {
			if let ContentBlock::Text(t) = block {
				let Some(g) = iter.next() else {
					anyhow::bail!("guard choice count mismatch");
				};
				t.text = g.content;
			}
		}
		Ok(())
	}

	fn serialize(&self) -> serde_json::Result<Vec<u8>> {
		serde_json::to_vec(self)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn string_content_shorthand() {
		let m: Message =
			serde_json::from_value(serde_json::json!({"role": "user", "content": "hello"})).unwrap();
		assert_eq!(m.text().as_deref(), Some("hello"));
	}

	#[test]
	fn unknown_blocks_tolerated() {
		let m: Message = serde_json::from_value(serde_json::json!({
			"role": "assistant",
			"content": [
				{"type": "text", "text": "hi"},
				{"type": "some_future_block", "payload": 1}
			]
		}))
		.unwrap();
		assert!(matches!(m.content[1], ContentBlock::Unknown));
	}

	#[test]
	fn system_prepend_merges_blocks() {
		let mut req = Request {
			system: Some(SystemPrompt::Text("existing".to_string())),
			..Default::default()
		};
		req.prepend_prompts(vec![SimpleChatCompletionMessage {
			role: strng::literal!("system"),
			content: strng::literal!("injected"),
		}]);
		assert_eq!(req.system.unwrap().as_text(), "injected\nexisting");
	}
}
