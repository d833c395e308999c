//! The unified request/response shape: OpenAI `/v1/chat/completions`.
//!
//! Every provider adapter translates to and from these types. Fields the
//! gateway does not model are carried in the flattened `rest` map so that
//! passthrough serialization is lossless and `drop_params` can reason about
//! them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::types::{GuardChoice, RequestType, ResponseType, SimpleChatCompletionMessage};
use crate::llm::{
	AIError, InputFormat, LLMRequest, LLMRequestParams, LLMResponse, conversion,
	num_tokens_from_messages,
};
use crate::{Strng, strng};

pub const SYSTEM_ROLE: &str = "system";
pub const DEVELOPER_ROLE: &str = "developer";
pub const USER_ROLE: &str = "user";
pub const ASSISTANT_ROLE: &str = "assistant";
pub const TOOL_ROLE: &str = "tool";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
	pub messages: Vec<RequestMessage>,

	/// Deprecated on the OpenAI surface in favor of `max_completion_tokens`,
	/// still widely sent.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_completion_tokens: Option<u64>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	/// Not part of the OpenAI surface; accepted on the unified shape and
	/// forwarded to providers that support it.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_k: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub n: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stop: Option<Stop>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub seed: Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub frequency_penalty: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub presence_penalty: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub logprobs: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_logprobs: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub logit_bias: Option<Value>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub stream: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stream_options: Option<StreamOptions>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub tools: Option<Vec<Tool>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool_choice: Option<ToolChoiceOption>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub parallel_tool_calls: Option<bool>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub response_format: Option<ResponseFormat>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub reasoning_effort: Option<ReasoningEffort>,
	/// Anthropic-style extended thinking control, accepted on the unified
	/// surface.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub thinking: Option<ThinkingInput>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub audio: Option<AudioParams>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub modalities: Option<Vec<String>>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub user: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub metadata: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub service_tier: Option<String>,

	/// Anything we do not model. Subject to the `drop_params` policy.
	#[serde(flatten)]
	pub rest: serde_json::Map<String, Value>,
}

impl Request {
	/// Effective output token limit, preferring the non-deprecated field.
	pub fn max_output_tokens(&self) -> Option<u64> {
		self.max_completion_tokens.or(self.max_tokens)
	}

	pub fn stop_sequences(&self) -> Vec<String> {
		match &self.stop {
			Some(Stop::String(s)) => vec![s.clone()],
			Some(Stop::StringArray(v)) => v.clone(),
			None => Vec::new(),
		}
	}

	/// Parameter names present on this request that the gateway does not
	/// model. With `drop_params` they are removed; without it the request is
	/// rejected.
	pub fn unknown_params(&self) -> Vec<String> {
		self.rest.keys().cloned().collect()
	}

	pub fn drop_unknown_params(&mut self) -> Vec<String> {
		let dropped = self.unknown_params();
		self.rest.clear();
		dropped
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Stop {
	String(String),
	StringArray(Vec<String>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamOptions {
	pub include_usage: bool,
	#[serde(flatten, default)]
	pub rest: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum RequestMessage {
	System(RequestSystemMessage),
	/// OpenAI's replacement spelling for `system`; treated identically.
	Developer(RequestSystemMessage),
	User(RequestUserMessage),
	Assistant(RequestAssistantMessage),
	Tool(RequestToolMessage),
}

impl RequestMessage {
	pub fn role(&self) -> &'static str {
		match self {
			RequestMessage::System(_) => SYSTEM_ROLE,
			RequestMessage::Developer(_) => DEVELOPER_ROLE,
			RequestMessage::User(_) => USER_ROLE,
			RequestMessage::Assistant(_) => ASSISTANT_ROLE,
			RequestMessage::Tool(_) => TOOL_ROLE,
		}
	}

	pub fn is_system(&self) -> bool {
		matches!(
			self,
			RequestMessage::System(_) | RequestMessage::Developer(_)
		)
	}

	/// The textual content of the message, if it is plain text or can be
	/// flattened to text.
	pub fn text(&self) -> Option<String> {
		match self {
			RequestMessage::System(m) | RequestMessage::Developer(m) => m.content.as_text(),
			RequestMessage::User(m) => m.content.as_text(),
			RequestMessage::Assistant(m) => m.content.as_ref().and_then(|c| c.as_text()),
			RequestMessage::Tool(m) => m.content.as_text(),
		}
	}

	pub fn from_simple(m: SimpleChatCompletionMessage) -> RequestMessage {
		let content = Content::Text(m.content.to_string());
		match m.role.as_str() {
			SYSTEM_ROLE => RequestMessage::System(RequestSystemMessage {
				content,
				name: None,
			}),
			DEVELOPER_ROLE => RequestMessage::Developer(RequestSystemMessage {
				content,
				name: None,
			}),
			ASSISTANT_ROLE => RequestMessage::Assistant(RequestAssistantMessage {
				content: Some(content),
				..Default::default()
			}),
			_ => RequestMessage::User(RequestUserMessage {
				content,
				name: None,
			}),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSystemMessage {
	pub content: Content,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestUserMessage {
	pub content: Content,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestAssistantMessage {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub content: Option<Content>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<MessageToolCall>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reasoning_content: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub thinking_blocks: Option<Vec<ThinkingBlock>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestToolMessage {
	pub tool_call_id: String,
	pub content: Content,
}

/// Message content: either a bare string or an ordered list of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
	Text(String),
	Parts(Vec<ContentPart>),
}

impl Content {
	/// Flatten to plain text. Parts that are not textual are skipped; returns
	/// `None` when nothing textual remains.
	pub fn as_text(&self) -> Option<String> {
		match self {
			Content::Text(t) => Some(t.clone()),
			Content::Parts(parts) => {
				let texts: Vec<&str> = parts
					.iter()
					.filter_map(|p| match p {
						ContentPart::Text { text } => Some(text.as_str()),
						_ => None,
					})
					.collect();
				if texts.is_empty() {
					None
				} else {
					Some(texts.join("\n"))
				}
			},
		}
	}

	pub fn parts(&self) -> Vec<ContentPart> {
		match self {
			Content::Text(t) => vec![ContentPart::Text { text: t.clone() }],
			Content::Parts(p) => p.clone(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
	Text {
		text: String,
	},
	ImageUrl {
		image_url: ImageUrl,
	},
	InputAudio {
		input_audio: InputAudio,
	},
	File {
		file: FilePart,
	},
	/// Cross-provider bridging parts; never produced by OpenAI clients but
	/// preserved when translating between non-OpenAI providers.
	ToolUse {
		id: String,
		name: String,
		input: Value,
	},
	ToolResult {
		tool_use_id: String,
		content: Value,
	},
	Thinking {
		thinking: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		signature: Option<String>,
	},
	RedactedThinking {
		data: String,
	},
	Citation {
		citation: Value,
	},
	#[serde(other)]
	Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
	pub url: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub detail: Option<String>,
}

impl ImageUrl {
	/// Split a `data:` URL into (mime type, base64 payload).
	pub fn as_data_url(&self) -> Option<(String, String)> {
		let rest = self.url.strip_prefix("data:")?;
		let (mime, data) = rest.split_once(";base64,")?;
		Some((mime.to_string(), data.to_string()))
	}

	pub fn is_remote(&self) -> bool {
		self.url.starts_with("http://") || self.url.starts_with("https://")
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputAudio {
	/// Base64 encoded audio data.
	pub data: String,
	pub format: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilePart {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub file_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub filename: Option<String>,
	/// Base64 data URL, for inline files.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub file_data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageToolCall {
	pub id: String,
	#[serde(default = "function_type")]
	pub r#type: String,
	pub function: FunctionCall,
}

fn function_type() -> String {
	"function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
	pub name: String,
	/// JSON-encoded arguments, verbatim from the provider.
	pub arguments: String,
}

/// A tool definition. `type` is open-ended: beyond `function` the providers
/// define built-ins (`mcp`, `computer_use_preview`, tool-search variants, …)
/// which ride in `rest` and are recognized by name in the adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
	pub r#type: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub function: Option<FunctionObject>,
	#[serde(flatten)]
	pub rest: serde_json::Map<String, Value>,
}

impl Tool {
	pub fn is_function(&self) -> bool {
		self.r#type == "function"
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionObject {
	pub name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub parameters: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub strict: Option<bool>,
	#[serde(flatten)]
	pub rest: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoiceOption {
	Mode(ToolChoiceMode),
	Named(NamedToolChoice),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoiceMode {
	None,
	Auto,
	Required,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedToolChoice {
	pub r#type: String,
	pub function: FunctionName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionName {
	pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
	Text,
	JsonObject,
	JsonSchema { json_schema: JsonSchemaFormat },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonSchemaFormat {
	pub name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	pub schema: Value,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub strict: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
	None,
	Minimal,
	Low,
	Medium,
	High,
	Xhigh,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ThinkingInput {
	Enabled { budget_tokens: u64 },
	Disabled {},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioParams {
	pub voice: String,
	pub format: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	#[default]
	Assistant,
	System,
	User,
	Tool,
	Developer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
	Stop,
	Length,
	ToolCalls,
	ContentFilter,
	ToolUse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	pub id: String,
	pub object: String,
	pub created: u64,
	pub model: String,
	pub choices: Vec<ChatChoice>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub service_tier: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub system_fingerprint: Option<String>,
	/// Gateway-internal annotations (e.g. computed cost). Never serialized to
	/// clients.
	#[serde(skip)]
	pub hidden: HiddenParams,
}

#[derive(Debug, Clone, Default)]
pub struct HiddenParams {
	pub response_cost: Option<f64>,
	pub deployment_id: Option<Strng>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
	pub index: u32,
	pub message: ResponseMessage,
	pub finish_reason: Option<FinishReason>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub logprobs: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMessage {
	pub role: Role,
	pub content: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<MessageToolCall>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reasoning_content: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub thinking_blocks: Option<Vec<ThinkingBlock>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub refusal: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub audio: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThinkingBlock {
	Thinking {
		thinking: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		signature: Option<String>,
	},
	/// Preserved verbatim; the payload is opaque to the gateway.
	RedactedThinking { data: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
	pub prompt_tokens: u64,
	pub completion_tokens: u64,
	pub total_tokens: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub prompt_tokens_details: Option<PromptTokensDetails>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub completion_tokens_details: Option<CompletionTokensDetails>,
	/// Tokens spent creating a provider cache entry (Anthropic-style).
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_creation_input_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub server_tool_use: Option<ServerToolUse>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PromptTokensDetails {
	#[serde(default)]
	pub cached_tokens: u64,
	#[serde(default, skip_serializing_if = "crate::is_default")]
	pub audio_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletionTokensDetails {
	#[serde(default)]
	pub reasoning_tokens: u64,
	#[serde(default, skip_serializing_if = "crate::is_default")]
	pub audio_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerToolUse {
	#[serde(default, skip_serializing_if = "crate::is_default")]
	pub web_search_requests: u64,
	#[serde(default, skip_serializing_if = "crate::is_default")]
	pub tool_search_requests: u64,
}

impl Usage {
	/// Build a usage block maintaining the invariant
	/// `total == prompt + completion + reasoning`. Cached tokens are a subset
	/// of `prompt_tokens`, never additive.
	pub fn new(prompt_tokens: u64, completion_tokens: u64, reasoning_tokens: u64) -> Usage {
		Usage {
			prompt_tokens,
			completion_tokens,
			total_tokens: prompt_tokens + completion_tokens + reasoning_tokens,
			completion_tokens_details: (reasoning_tokens > 0).then(|| CompletionTokensDetails {
				reasoning_tokens,
				..Default::default()
			}),
			..Default::default()
		}
	}

	pub fn reasoning_tokens(&self) -> u64 {
		self
			.completion_tokens_details
			.as_ref()
			.map(|d| d.reasoning_tokens)
			.unwrap_or_default()
	}

	pub fn cached_tokens(&self) -> u64 {
		self
			.prompt_tokens_details
			.as_ref()
			.map(|d| d.cached_tokens)
			.unwrap_or_default()
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamResponse {
	pub id: String,
	pub object: String,
	pub created: u64,
	pub model: String,
	pub choices: Vec<ChatChoiceStream>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub service_tier: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub system_fingerprint: Option<String>,
}

pub const CHUNK_OBJECT: &str = "chat.completion.chunk";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoiceStream {
	pub index: u32,
	pub delta: StreamResponseDelta,
	pub finish_reason: Option<FinishReason>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub logprobs: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamResponseDelta {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub role: Option<Role>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<ToolCallDelta>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reasoning_content: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub thinking_blocks: Option<Vec<ThinkingBlock>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallDelta {
	pub index: u32,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub r#type: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub function: Option<FunctionCallDelta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionCallDelta {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub arguments: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionErrorResponse {
	pub error: ChatCompletionError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionError {
	pub r#type: String,
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub param: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub code: Option<String>,
}

impl RequestType for Request {
	fn model(&mut self) -> &mut Option<String> {
		&mut self.model
	}

	fn prepend_prompts(&mut self, prompts: Vec<SimpleChatCompletionMessage>) {
		self
			.messages
			.splice(..0, prompts.into_iter().map(RequestMessage::from_simple));
	}

	fn append_prompts(&mut self, prompts: Vec<SimpleChatCompletionMessage>) {
		self
			.messages
			.extend(prompts.into_iter().map(RequestMessage::from_simple));
	}

	fn to_llm_request(&self, provider: Strng, tokenize: bool) -> Result<LLMRequest, AIError> {
		let model = strng::new(self.model.as_deref().unwrap_or_default());
		let input_tokens = if tokenize {
			Some(num_tokens_from_messages(&model, &self.get_messages())?)
		} else {
			None
		};
		Ok(LLMRequest {
			input_tokens,
			input_format: InputFormat::Completions,
			request_model: model,
			provider,
			streaming: self.stream.unwrap_or_default(),
			params: LLMRequestParams {
				temperature: self.temperature,
				top_p: self.top_p,
				frequency_penalty: self.frequency_penalty,
				presence_penalty: self.presence_penalty,
				seed: self.seed,
				max_tokens: self.max_output_tokens(),
				encoding_format: None,
				dimensions: None,
			},
		})
	}

	fn get_messages(&self) -> Vec<SimpleChatCompletionMessage> {
		self
			.messages
			.iter()
			.map(|m| SimpleChatCompletionMessage {
				role: strng::new(m.role()),
				content: m.text().map(|t| strng::new(&t)).unwrap_or_default(),
			})
			.collect()
	}

	fn set_messages(&mut self, messages: Vec<SimpleChatCompletionMessage>) {
		self.messages = messages
			.into_iter()
			.map(RequestMessage::from_simple)
			.collect();
	}

	fn tool_definitions(&self) -> Vec<Tool> {
		self.tools.clone().unwrap_or_default()
	}

	fn to_openai(&self) -> Result<Vec<u8>, AIError> {
		serde_json::to_vec(self).map_err(AIError::RequestMarshal)
	}

	fn to_anthropic(&self) -> Result<Vec<u8>, AIError> {
		conversion::messages::from_completions::translate(self)
	}

	fn to_gemini(&self) -> Result<Vec<u8>, AIError> {
		conversion::gemini::from_completions::translate(self)
	}

	fn to_bedrock(
		&self,
		provider: &crate::llm::bedrock::Provider,
	) -> Result<Vec<u8>, AIError> {
		conversion::bedrock::from_completions::translate(self, provider)
	}
}

impl ResponseType for Response {
	fn to_llm_response(&self, include_completion_in_log: bool) -> LLMResponse {
		LLMResponse {
			input_tokens: self.usage.as_ref().map(|u| u.prompt_tokens),
			output_tokens: self.usage.as_ref().map(|u| u.completion_tokens),
			total_tokens: self.usage.as_ref().map(|u| u.total_tokens),
			provider_model: Some(strng::new(&self.model)),
			completion: include_completion_in_log.then(|| {
				self
					.choices
					.iter()
					.filter_map(|c| c.message.content.clone())
					.collect()
			}),
			usage: self.usage.clone(),
			first_token: None,
			count_tokens: None,
		}
	}

	fn to_guard_choices(&self) -> Vec<GuardChoice> {
		self
			.choices
			.iter()
			.map(|c| GuardChoice {
				role: strng::literal!("assistant"),
				content: c.message.content.clone().unwrap_or_default(),
			})
			.collect()
	}

	fn set_guard_choices(&mut self, choices: Vec<GuardChoice>) -> anyhow::Result<()> {
		if self.choices.len() != choices.len() {
			anyhow::bail!("guard choice count mismatch");
		}
		for (c, g) in self.choices.iter_mut().zip(choices) {
			c.message.content = Some(g.content);
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
	fn content_string_or_parts() {
		let plain: RequestMessage =
			serde_json::from_value(serde_json::json!({"role": "user", "content": "hi"})).unwrap();
		assert_eq!(plain.text().as_deref(), Some("hi"));

		let parts: RequestMessage = serde_json::from_value(serde_json::json!({
			"role": "user",
			"content": [
				{"type": "text", "text": "describe this"},
				{"type": "image_url", "image_url": {"url": "data:image/png;base64,aGk="}}
			]
		}))
		.unwrap();
		assert_eq!(parts.text().as_deref(), Some("describe this"));
	}

	#[test]
	fn data_url_split() {
		let img = ImageUrl {
			url: "data:image/png;base64,aGVsbG8=".to_string(),
			detail: None,
		};
		let (mime, data) = img.as_data_url().unwrap();
		assert_eq!(mime, "image/png");
		assert_eq!(data, "aGVsbG8=");
		assert!(!img.is_remote());
	}

	#[test]
	fn usage_invariant() {
		let u = Usage::new(100, 20, 5);
		assert_eq!(u.total_tokens, 125);
		assert_eq!(u.reasoning_tokens(), 5);
	}

	#[test]
	fn unknown_params_are_captured() {
		let mut req: Request = serde_json::from_value(serde_json::json!({
			"model": "gpt-4o",
			"messages": [{"role": "user", "content": "hi"}],
			"some_future_param": 3
		}))
		.unwrap();
		assert_eq!(req.unknown_params(), vec!["some_future_param".to_string()]);
		let dropped = req.drop_unknown_params();
		assert_eq!(dropped.len(), 1);
		assert!(req.rest.is_empty());
	}

	#[test]
	fn passthrough_roundtrip() {
		let raw = serde_json::json!({
			"model": "gpt-4o",
			"messages": [
				{"role": "system", "content": "be brief"},
				{"role": "user", "content": "hello"},
				{"role": "assistant", "tool_calls": [
					{"id": "call_1", "type": "function", "function": {"name": "get_weather", "arguments": "{\"location\":\"Tokyo\"}"}}
				]},
				{"role": "tool", "tool_call_id": "call_1", "content": "sunny"}
			],
			"temperature": 0.0,
			"stream": true,
			"stream_options": {"include_usage": true}
		});
		let req: Request = serde_json::from_value(raw.clone()).unwrap();
		let back = serde_json::to_value(&req).unwrap();
		assert_eq!(raw, back);
	}
}
