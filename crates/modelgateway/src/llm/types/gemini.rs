//! The Gemini `generateContent` wire shape (camelCase JSON). Also used by
//! Vertex AI for Gemini-family models.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
	pub contents: Vec<Content>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub system_instruction: Option<Content>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tools: Option<Vec<Tool>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool_config: Option<ToolConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub generation_config: Option<GenerationConfig>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub safety_settings: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
	/// "user" or "model". Absent for `system_instruction`.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub role: Option<String>,
	pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub text: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub inline_data: Option<Blob>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub file_data: Option<FileData>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub function_call: Option<FunctionCall>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub function_response: Option<FunctionResponse>,
	/// Set on reasoning parts when `includeThoughts` is enabled.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub thought: Option<bool>,
}

impl Part {
	pub fn text(text: impl Into<String>) -> Part {
		Part {
			text: Some(text.into()),
			..Default::default()
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
	pub mime_type: String,
	/// Base64 encoded bytes.
	pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
	pub mime_type: String,
	pub file_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCall {
	pub name: String,
	pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResponse {
	pub name: String,
	pub response: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub function_declarations: Option<Vec<FunctionDeclaration>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub google_search: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDeclaration {
	pub name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfig {
	pub function_calling_config: FunctionCallingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCallingConfig {
	pub mode: FunctionCallingMode,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub allowed_function_names: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FunctionCallingMode {
	Auto,
	Any,
	None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_k: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub candidate_count: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_output_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stop_sequences: Option<Vec<String>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub response_mime_type: Option<String>,
	/// Structured output schema. Key order inside `propertyOrdering` is
	/// semantic; callers must preserve insertion order.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub response_schema: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub thinking_budget: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub include_thoughts: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
	#[serde(default)]
	pub candidates: Vec<Candidate>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub usage_metadata: Option<UsageMetadata>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub model_version: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub response_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
	pub content: Option<Content>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub finish_reason: Option<String>,
	#[serde(default)]
	pub index: u32,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub safety_ratings: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
	#[serde(default)]
	pub prompt_token_count: u64,
	#[serde(default)]
	pub candidates_token_count: u64,
	#[serde(default)]
	pub total_token_count: u64,
	#[serde(default, skip_serializing_if = "crate::is_default")]
	pub thoughts_token_count: u64,
	#[serde(default, skip_serializing_if = "crate::is_default")]
	pub cached_content_token_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
	pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
	pub code: u32,
	pub message: String,
	pub status: String,
}
