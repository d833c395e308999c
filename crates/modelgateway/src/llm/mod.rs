//! The provider layer: one flat adapter per provider, treated polymorphically
//! through [`AIProvider`]. Adapters translate between the unified shapes in
//! [`types`] and each provider's wire format, including streaming.

use std::time::Instant;

use bytes::Bytes;
use tiktoken_rs::CoreBPE;
use tiktoken_rs::tokenizer::{Tokenizer, get_tokenizer};

use crate::error::{ErrorKind, GatewayError};
use crate::http::StatusCode;
use crate::llm::types::{RequestType, ResponseType, SimpleChatCompletionMessage};
use crate::telemetry::log::AsyncLog;
use crate::{Strng, debug, strng};

pub mod anthropic;
pub mod azureopenai;
pub mod bedrock;
pub mod cost;
pub mod gemini;
pub mod openai;
pub mod registry;
pub mod sap;
pub mod vertex;

pub mod conversion;
pub mod types;

#[cfg(test)]
#[path = "tests.rs"]
mod tests;

/// The endpoint family a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RouteType {
	/// OpenAI /v1/chat/completions
	Completions,
	/// Anthropic /v1/messages
	Messages,
	/// OpenAI /v1/embeddings
	Embeddings,
	/// OpenAI /v1/responses
	Responses,
	/// Cohere-compatible /v1/rerank
	Rerank,
	/// OpenAI /v1/models
	Models,
	/// Anthropic /v1/messages/count_tokens
	CountTokens,
	/// Forward to the provider as-is (images, audio, videos, search,
	/// vector stores). Credential injection still applies.
	Passthrough,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputFormat {
	Completions,
	Messages,
	Embeddings,
	Rerank,
	CountTokens,
}

impl InputFormat {
	pub fn supports_prompt_guard(&self) -> bool {
		match self {
			InputFormat::Completions => true,
			InputFormat::Messages => true,
			InputFormat::Embeddings => false,
			InputFormat::Rerank => false,
			InputFormat::CountTokens => false,
		}
	}
}

#[derive(Debug, Clone)]
pub struct LLMRequest {
	/// Input tokens derived by tokenizing the request. Not always enabled.
	pub input_tokens: Option<u64>,
	pub input_format: InputFormat,
	pub request_model: Strng,
	pub provider: Strng,
	pub streaming: bool,
	pub params: LLMRequestParams,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct LLMRequestParams {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub frequency_penalty: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub presence_penalty: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub seed: Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_tokens: Option<u64>,
	// Embeddings
	#[serde(skip_serializing_if = "Option::is_none")]
	pub encoding_format: Option<Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub dimensions: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct LLMResponse {
	pub input_tokens: Option<u64>,
	/// Tokens reported by a count_tokens endpoint. Not billed as input.
	pub count_tokens: Option<u64>,
	pub output_tokens: Option<u64>,
	pub total_tokens: Option<u64>,
	pub provider_model: Option<Strng>,
	pub completion: Option<Vec<String>>,
	/// Full usage detail when the provider reported one.
	pub usage: Option<types::completions::Usage>,
	// Time to get the first token. Only used for streaming.
	pub first_token: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct LLMInfo {
	pub request: LLMRequest,
	pub response: LLMResponse,
}

impl LLMInfo {
	pub fn new(req: LLMRequest, resp: LLMResponse) -> Self {
		Self {
			request: req,
			response: resp,
		}
	}

	pub fn input_tokens(&self) -> Option<u64> {
		self.response.input_tokens.or(self.request.input_tokens)
	}
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AIProvider {
	OpenAI(openai::Provider),
	AzureOpenAI(azureopenai::Provider),
	Anthropic(anthropic::Provider),
	Gemini(gemini::Provider),
	Vertex(vertex::Provider),
	Bedrock(bedrock::Provider),
	Sap(sap::Provider),
}

pub(crate) trait Provider {
	const NAME: Strng;
}

impl AIProvider {
	pub fn provider(&self) -> Strng {
		match self {
			AIProvider::OpenAI(_) => openai::Provider::NAME,
			AIProvider::AzureOpenAI(_) => azureopenai::Provider::NAME,
			AIProvider::Anthropic(_) => anthropic::Provider::NAME,
			AIProvider::Gemini(_) => gemini::Provider::NAME,
			AIProvider::Vertex(_) => vertex::Provider::NAME,
			AIProvider::Bedrock(_) => bedrock::Provider::NAME,
			AIProvider::Sap(_) => sap::Provider::NAME,
		}
	}

	pub fn override_model(&self) -> Option<Strng> {
		match self {
			AIProvider::OpenAI(p) => p.model.clone(),
			AIProvider::AzureOpenAI(p) => p.model.clone(),
			AIProvider::Anthropic(p) => p.model.clone(),
			AIProvider::Gemini(p) => p.model.clone(),
			AIProvider::Vertex(p) => p.model.clone(),
			AIProvider::Bedrock(p) => p.model.clone(),
			AIProvider::Sap(p) => p.model.clone(),
		}
	}

	/// Whether the provider can serve this input format for the given model;
	/// anything else fails with `UnsupportedConversion`.
	pub fn accepts(&self, format: InputFormat, model: &str) -> bool {
		match (format, self) {
			// All providers can serve completions input, via translation
			// where needed.
			(InputFormat::Completions, _) => true,
			(InputFormat::Messages, AIProvider::Anthropic(_)) => true,
			(InputFormat::Messages, AIProvider::Bedrock(_)) => true,
			(InputFormat::Messages, AIProvider::Vertex(p)) => p.is_anthropic_model(Some(model)),
			(InputFormat::Messages, AIProvider::Sap(p)) => p.is_anthropic_submodel(model),
			(
				InputFormat::Embeddings,
				AIProvider::OpenAI(_) | AIProvider::AzureOpenAI(_) | AIProvider::Gemini(_),
			) => true,
			(InputFormat::Rerank, AIProvider::OpenAI(_)) => true,
			(InputFormat::CountTokens, AIProvider::Anthropic(_) | AIProvider::Bedrock(_)) => true,
			_ => false,
		}
	}

	/// Translate the unified request into the provider's wire body.
	pub fn translate_request(
		&self,
		req: &dyn RequestType,
		request_model: &str,
	) -> Result<Vec<u8>, AIError> {
		match self {
			AIProvider::OpenAI(_) | AIProvider::AzureOpenAI(_) => req.to_openai(),
			AIProvider::Anthropic(_) => req.to_anthropic(),
			AIProvider::Gemini(_) => req.to_gemini(),
			AIProvider::Vertex(p) => {
				if p.is_anthropic_model(Some(request_model)) {
					let body = req.to_anthropic()?;
					vertex::prepare_anthropic_request_body(body)
				} else {
					req.to_gemini()
				}
			},
			AIProvider::Bedrock(p) => req.to_bedrock(p),
			AIProvider::Sap(p) => {
				if p.is_anthropic_submodel(request_model) {
					req.to_anthropic()
				} else {
					req.to_openai()
				}
			},
		}
	}

	/// Parse and translate a successful provider response back to the
	/// caller's input format.
	pub fn process_success(
		&self,
		req: &LLMRequest,
		bytes: &Bytes,
	) -> Result<Box<dyn ResponseType>, AIError> {
		match (self, req.input_format) {
			// OpenAI-shaped providers with completions input: passthrough
			(
				AIProvider::OpenAI(_) | AIProvider::AzureOpenAI(_),
				InputFormat::Completions,
			) => Ok(Box::new(
				serde_json::from_slice::<types::completions::Response>(bytes)
					.map_err(AIError::ResponseParsing)?,
			)),
			(AIProvider::Sap(p), InputFormat::Completions) => {
				if p.is_anthropic_submodel(req.request_model.as_str()) {
					conversion::messages::from_completions::translate_response(bytes)
				} else {
					Ok(Box::new(
						serde_json::from_slice::<types::completions::Response>(bytes)
							.map_err(AIError::ResponseParsing)?,
					))
				}
			},
			(AIProvider::Anthropic(_), InputFormat::Messages) => Ok(Box::new(
				serde_json::from_slice::<types::messages::MessagesResponse>(bytes)
					.map_err(AIError::ResponseParsing)?,
			)),
			(AIProvider::Anthropic(_), InputFormat::Completions) => {
				conversion::messages::from_completions::translate_response(bytes)
			},
			(AIProvider::Gemini(_), InputFormat::Completions) => {
				conversion::gemini::from_completions::translate_response(bytes, &req.request_model)
			},
			(AIProvider::Vertex(p), InputFormat::Completions) => {
				if p.is_anthropic_model(Some(req.request_model.as_str())) {
					conversion::messages::from_completions::translate_response(bytes)
				} else {
					conversion::gemini::from_completions::translate_response(bytes, &req.request_model)
				}
			},
			(AIProvider::Vertex(_), InputFormat::Messages) => Ok(Box::new(
				serde_json::from_slice::<types::messages::MessagesResponse>(bytes)
					.map_err(AIError::ResponseParsing)?,
			)),
			(AIProvider::Bedrock(_), InputFormat::Completions) => {
				conversion::bedrock::from_completions::translate_response(bytes, &req.request_model)
			},
			(AIProvider::Bedrock(_), InputFormat::Messages) => {
				conversion::bedrock::from_messages::translate_response(bytes, &req.request_model)
			},
			// Embeddings are served off OpenAI-compatible surfaces only; no
			// translation needed.
			(
				AIProvider::OpenAI(_) | AIProvider::AzureOpenAI(_) | AIProvider::Gemini(_),
				InputFormat::Embeddings,
			) => Ok(Box::new(
				serde_json::from_slice::<types::embeddings::Response>(bytes)
					.map_err(AIError::ResponseParsing)?,
			)),
			(p, f) => Err(AIError::UnsupportedConversion(strng::format!(
				"{f:?} from provider {}",
				p.provider()
			))),
		}
	}

	/// Translate a provider error body into the caller's wire shape and
	/// classify it.
	pub fn process_error(
		&self,
		req: &LLMRequest,
		status: StatusCode,
		bytes: &Bytes,
	) -> (ErrorKind, Bytes) {
		let kind = self.classify_error(status, bytes);
		let body = match (self, req.input_format) {
			(AIProvider::OpenAI(_) | AIProvider::AzureOpenAI(_), _) => bytes.clone(),
			(AIProvider::Anthropic(_) | AIProvider::Vertex(_) | AIProvider::Sap(_), InputFormat::Messages) => {
				bytes.clone()
			},
			(AIProvider::Anthropic(_), _) => {
				conversion::messages::from_completions::translate_error(bytes).unwrap_or_else(|_| bytes.clone())
			},
			(AIProvider::Gemini(_) | AIProvider::Vertex(_), _) => {
				conversion::gemini::from_completions::translate_error(bytes).unwrap_or_else(|_| bytes.clone())
			},
			(AIProvider::Bedrock(_), _) => {
				conversion::bedrock::translate_error(bytes).unwrap_or_else(|_| bytes.clone())
			},
			(AIProvider::Sap(_), _) => bytes.clone(),
		};
		(kind, body)
	}

	fn classify_error(&self, status: StatusCode, bytes: &Bytes) -> ErrorKind {
		let base = ErrorKind::from_provider_status(status);
		if base != ErrorKind::BadRequest {
			return base;
		}
		// Providers bury context-window and content-filter failures in 400s;
		// sniff the body to give the router an accurate classification.
		let text = String::from_utf8_lossy(bytes);
		let lowered = text.to_ascii_lowercase();
		if lowered.contains("context window")
			|| lowered.contains("context_length")
			|| lowered.contains("maximum context")
			|| lowered.contains("too many tokens")
		{
			ErrorKind::ContextWindowExceeded
		} else if lowered.contains("content_filter")
			|| lowered.contains("content management policy")
			|| lowered.contains("blocked by")
		{
			ErrorKind::ContentFiltered
		} else {
			base
		}
	}

	/// Build the streaming translation for this provider/format pair. The
	/// returned body yields unified SSE chunks.
	pub fn process_streaming(
		&self,
		req: &LLMRequest,
		log: AsyncLog<LLMInfo>,
		include_completion_in_log: bool,
		body: crate::http::Body,
		buffer_limit: usize,
	) -> Result<crate::http::Body, AIError> {
		let model = req.request_model.clone();
		Ok(match (self, req.input_format) {
			(AIProvider::OpenAI(_) | AIProvider::AzureOpenAI(_), InputFormat::Completions) => {
				conversion::completions::passthrough_stream(body, buffer_limit, log, include_completion_in_log)
			},
			(AIProvider::Sap(p), InputFormat::Completions) => {
				if p.is_anthropic_submodel(model.as_str()) {
					conversion::messages::from_completions::translate_stream(body, buffer_limit, log)
				} else {
					conversion::completions::passthrough_stream(body, buffer_limit, log, include_completion_in_log)
				}
			},
			(AIProvider::Anthropic(_), InputFormat::Messages) => {
				conversion::messages::passthrough_stream(body, buffer_limit, log)
			},
			(AIProvider::Anthropic(_), InputFormat::Completions) => {
				conversion::messages::from_completions::translate_stream(body, buffer_limit, log)
			},
			(AIProvider::Gemini(_), InputFormat::Completions) => {
				conversion::gemini::from_completions::translate_stream(body, buffer_limit, log, &model)
			},
			(AIProvider::Vertex(p), InputFormat::Completions) => {
				if p.is_anthropic_model(Some(model.as_str())) {
					conversion::messages::from_completions::translate_stream(body, buffer_limit, log)
				} else {
					conversion::gemini::from_completions::translate_stream(body, buffer_limit, log, &model)
				}
			},
			(AIProvider::Vertex(_), InputFormat::Messages) => {
				conversion::messages::passthrough_stream(body, buffer_limit, log)
			},
			(AIProvider::Bedrock(_), InputFormat::Completions) => {
				conversion::bedrock::from_completions::translate_stream(body, log, &model)
			},
			(AIProvider::Bedrock(_), InputFormat::Messages) => {
				conversion::bedrock::from_messages::translate_stream(body, log, &model)
			},
			(p, f) => {
				return Err(AIError::UnsupportedConversion(strng::format!(
					"streaming {f:?} from provider {}",
					p.provider()
				)));
			},
		})
	}
}

pub fn num_tokens_from_messages(
	model: &str,
	messages: &[SimpleChatCompletionMessage],
) -> Result<u64, AIError> {
	// NOTE: this estimator only accounts for textual content. Use provider
	// token counting endpoints for precise totals over tools/images.
	let tokenizer = get_tokenizer(model).unwrap_or(Tokenizer::Cl100kBase);
	let bpe = get_bpe_from_tokenizer(tokenizer);

	let tokens_per_message = 3;

	let mut num_tokens: u64 = 0;
	for message in messages {
		num_tokens += tokens_per_message;
		// Role is always 1 token
		num_tokens += 1;
		num_tokens += bpe
			.encode_with_special_tokens(message.content.as_str())
			.len() as u64;
	}
	num_tokens += 3; // every reply is primed with <|start|>assistant<|message|>
	Ok(num_tokens)
}

pub fn num_tokens_from_text(model: &str, text: &str) -> Result<u64, AIError> {
	let tokenizer = get_tokenizer(model).unwrap_or(Tokenizer::Cl100kBase);
	let bpe = get_bpe_from_tokenizer(tokenizer);
	Ok(bpe.encode_with_special_tokens(text).len() as u64)
}

/// Fallback accounting for streams that closed without a usage block: count
/// tokens locally over the concatenated completion text.
pub fn amend_stream_usage(info: &mut LLMInfo) {
	if info.response.usage.is_some() {
		return;
	}
	let Some(completion) = info.response.completion.as_ref() else {
		return;
	};
	let text = completion.join("");
	let Ok(tokens) = num_tokens_from_text(info.request.request_model.as_str(), &text) else {
		return;
	};
	let prompt = info.input_tokens().unwrap_or_default();
	let usage = types::completions::Usage::new(prompt, tokens, 0);
	info.response.input_tokens = info.response.input_tokens.or(Some(prompt));
	info.response.output_tokens = Some(tokens);
	info.response.total_tokens = Some(usage.total_tokens);
	info.response.usage = Some(usage);
}

/// Tokenizers take about 200ms to load and are lazy loaded. This loads them
/// on demand, outside the request path.
pub fn preload_tokenizers() {
	let _ = tiktoken_rs::cl100k_base_singleton();
	let _ = tiktoken_rs::o200k_base_singleton();
}

pub fn get_bpe_from_tokenizer<'a>(tokenizer: Tokenizer) -> &'a CoreBPE {
	match tokenizer {
		Tokenizer::O200kHarmony => tiktoken_rs::o200k_harmony_singleton(),
		Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
		Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
		Tokenizer::R50kBase => tiktoken_rs::r50k_base_singleton(),
		Tokenizer::P50kBase => tiktoken_rs::r50k_base_singleton(),
		Tokenizer::P50kEdit => tiktoken_rs::r50k_base_singleton(),
		Tokenizer::Gpt2 => tiktoken_rs::r50k_base_singleton(),
	}
}

/// Translation-layer failures. These surface before or after the provider
/// call; transport failures are classified separately.
#[derive(thiserror::Error, Debug)]
pub enum AIError {
	#[error("missing field: {0}")]
	MissingField(Strng),
	#[error("unknown model")]
	UnknownModel,
	#[error("unsupported content")]
	UnsupportedContent,
	#[error("unsupported conversion to {0}")]
	UnsupportedConversion(Strng),
	#[error("unsupported parameters: {0:?}")]
	UnsupportedParams(Vec<String>),
	#[error("request was too large")]
	RequestTooLarge,
	#[error("response was too large")]
	ResponseTooLarge,
	#[error("failed to parse request: {0}")]
	RequestParsing(serde_json::Error),
	#[error("failed to marshal request: {0}")]
	RequestMarshal(serde_json::Error),
	#[error("failed to parse response: {0}")]
	ResponseParsing(serde_json::Error),
	#[error("failed to marshal response: {0}")]
	ResponseMarshal(serde_json::Error),
}

impl From<AIError> for GatewayError {
	fn from(e: AIError) -> Self {
		let kind = match &e {
			AIError::MissingField(_)
			| AIError::UnsupportedContent
			| AIError::UnsupportedConversion(_)
			| AIError::UnsupportedParams(_)
			| AIError::RequestParsing(_) => ErrorKind::BadRequest,
			AIError::UnknownModel => ErrorKind::NotFound,
			AIError::RequestTooLarge | AIError::ResponseTooLarge => ErrorKind::RequestTooLarge,
			AIError::RequestMarshal(_) | AIError::ResponseParsing(_) | AIError::ResponseMarshal(_) => {
				ErrorKind::InternalError
			},
		};
		GatewayError::new(kind, e.to_string())
	}
}

/// Enforce the `drop_params` policy over fields the gateway does not model.
pub fn apply_drop_params(
	req: &mut types::completions::Request,
	drop_params: bool,
) -> Result<(), AIError> {
	if req.rest.is_empty() {
		return Ok(());
	}
	if drop_params {
		let dropped = req.drop_unknown_params();
		debug!("dropped unsupported params: {dropped:?}");
		Ok(())
	} else {
		Err(AIError::UnsupportedParams(req.unknown_params()))
	}
}
