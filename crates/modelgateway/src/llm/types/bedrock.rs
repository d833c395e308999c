//! The Bedrock Converse wire shape. Converse is the default channel; the
//! Invoke channel reuses the Anthropic Messages shape for features Converse
//! does not expose (see the bedrock provider's capability matrix).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverseRequest {
	pub messages: Vec<Message>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub system: Vec<SystemContentBlock>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub inference_config: Option<InferenceConfiguration>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool_config: Option<ToolConfiguration>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub guardrail_config: Option<GuardrailConfiguration>,
	/// Passed through to the model untyped (e.g. `top_k` for Anthropic
	/// models, thinking budgets).
	#[serde(skip_serializing_if = "Option::is_none")]
	pub additional_model_request_fields: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
	pub role: ConversationRole,
	pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationRole {
	User,
	Assistant,
}

/// Converse content blocks are single-key objects; the externally tagged
/// representation matches the wire exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentBlock {
	Text(String),
	Image(ImageBlock),
	Document(Value),
	ToolUse(ToolUseBlock),
	ToolResult(ToolResultBlock),
	ReasoningContent(ReasoningBlock),
	GuardContent(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageBlock {
	pub format: String,
	pub source: ImageSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImageSource {
	/// Base64 encoded bytes.
	Bytes(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseBlock {
	pub tool_use_id: String,
	pub name: String,
	pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultBlock {
	pub tool_use_id: String,
	pub content: Vec<ToolResultContentBlock>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolResultContentBlock {
	Text(String),
	Json(Value),
	Image(ImageBlock),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReasoningBlock {
	ReasoningText(ReasoningText),
	RedactedContent(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningText {
	pub text: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SystemContentBlock {
	Text(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfiguration {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub stop_sequences: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfiguration {
	pub tools: Vec<Tool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool_choice: Option<ToolChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Tool {
	ToolSpec(ToolSpecification),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpecification {
	pub name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	pub input_schema: ToolInputSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolInputSchema {
	Json(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolChoice {
	Auto(Value),
	Any(Value),
	Tool(ToolChoiceTool),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolChoiceTool {
	pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailConfiguration {
	pub guardrail_identifier: String,
	pub guardrail_version: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub trace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverseResponse {
	pub output: ConverseOutput,
	pub stop_reason: StopReason,
	pub usage: TokenUsage,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub metrics: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverseOutput {
	pub message: Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
	EndTurn,
	ToolUse,
	MaxTokens,
	StopSequence,
	GuardrailIntervened,
	ContentFiltered,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
	pub input_tokens: u64,
	pub output_tokens: u64,
	pub total_tokens: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_read_input_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_write_input_tokens: Option<u64>,
}

/// Payloads carried by the Converse event stream (`:event-type` header names
/// the variant).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessageStart {
	pub role: ConversationRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamContentBlockStart {
	pub content_block_index: u32,
	pub start: Option<ContentBlockStart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentBlockStart {
	ToolUse(ToolUseBlockStart),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseBlockStart {
	pub tool_use_id: String,
	pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamContentBlockDelta {
	pub content_block_index: u32,
	pub delta: ContentBlockDelta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentBlockDelta {
	Text(String),
	ToolUse(ToolUseBlockDelta),
	ReasoningContent(ReasoningContentBlockDelta),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseBlockDelta {
	pub input: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReasoningContentBlockDelta {
	Text(String),
	Signature(String),
	RedactedContent(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamContentBlockStop {
	pub content_block_index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessageStop {
	pub stop_reason: StopReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetadata {
	pub usage: TokenUsage,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub metrics: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BedrockErrorResponse {
	pub message: String,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn content_block_wire_shape() {
		let b = ContentBlock::Text("hi".to_string());
		assert_eq!(serde_json::to_value(&b).unwrap(), serde_json::json!({"text": "hi"}));

		let t = ContentBlock::ToolUse(ToolUseBlock {
			tool_use_id: "call_1".into(),
			name: "get_weather".into(),
			input: serde_json::json!({"location": "Tokyo"}),
		});
		assert_eq!(
			serde_json::to_value(&t).unwrap(),
			serde_json::json!({"toolUse": {"toolUseId": "call_1", "name": "get_weather", "input": {"location": "Tokyo"}}})
		);
	}
}
