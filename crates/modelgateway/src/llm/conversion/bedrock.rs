//! Translation between the unified shapes and Bedrock Converse, including
//! the AWS EventStream streaming bridge.

use bytes::Bytes;

use crate::llm::AIError;
use crate::llm::types::completions;
use crate::llm::types::{bedrock, messages};

/// Prepare an Anthropic messages body for the Invoke channel: the version
/// moves into the body, the model and stream flags ride the URL.
pub fn to_invoke_body(anthropic_body: Vec<u8>) -> Result<Vec<u8>, AIError> {
	let mut map: serde_json::Map<String, serde_json::Value> =
		serde_json::from_slice(&anthropic_body).map_err(AIError::RequestMarshal)?;
	map.insert(
		"anthropic_version".to_string(),
		serde_json::Value::String("bedrock-2023-05-31".to_string()),
	);
	map.remove("model");
	map.remove("stream");
	serde_json::to_vec(&map).map_err(AIError::RequestMarshal)
}

/// Bedrock errors are a bare `{"message": ...}`; wrap them in the OpenAI
/// error shape.
pub fn translate_error(bytes: &Bytes) -> Result<Bytes, AIError> {
	let res = serde_json::from_slice::<bedrock::BedrockErrorResponse>(bytes)
		.map_err(AIError::ResponseParsing)?;
	let m = completions::ChatCompletionErrorResponse {
		error: completions::ChatCompletionError {
			r#type: "invalid_request_error".to_string(),
			message: res.message,
			param: None,
			code: None,
		},
	};
	Ok(Bytes::from(
		serde_json::to_vec(&m).map_err(AIError::ResponseMarshal)?,
	))
}

fn translate_stop_reason(reason: bedrock::StopReason) -> completions::FinishReason {
	match reason {
		bedrock::StopReason::EndTurn => completions::FinishReason::Stop,
		bedrock::StopReason::ToolUse => completions::FinishReason::ToolCalls,
		bedrock::StopReason::MaxTokens => completions::FinishReason::Length,
		bedrock::StopReason::StopSequence => completions::FinishReason::Stop,
		bedrock::StopReason::GuardrailIntervened | bedrock::StopReason::ContentFiltered => {
			completions::FinishReason::ContentFilter
		},
	}
}

fn usage_to_openai(u: &bedrock::TokenUsage) -> completions::Usage {
	let cache_read = u.cache_read_input_tokens.unwrap_or_default();
	let cache_write = u.cache_write_input_tokens.unwrap_or_default();
	let mut usage = completions::Usage::new(u.input_tokens + cache_read + cache_write, u.output_tokens, 0);
	if cache_read > 0 {
		usage.prompt_tokens_details = Some(completions::PromptTokensDetails {
			cached_tokens: cache_read,
			..Default::default()
		});
	}
	if cache_write > 0 {
		usage.cache_creation_input_tokens = Some(cache_write);
	}
	usage
}

pub mod from_completions {
	use std::collections::HashMap;
	use std::time::Instant;

	use bytes::Bytes;

	use super::{translate_stop_reason, usage_to_openai};
	use crate::http::Body;
	use crate::llm::bedrock::Provider;
	use crate::llm::conversion::scrub_schema_for_bedrock;
	use crate::llm::types::{ResponseType, bedrock, completions};
	use crate::llm::{AIError, LLMInfo};
	use crate::parse::aws_sse;
	use crate::telemetry::log::AsyncLog;
	use crate::{Strng, debug, strng};

	pub fn translate(
		req: &completions::Request,
		provider: &Provider,
	) -> Result<Vec<u8>, AIError> {
		let xlated = translate_internal(req, provider)?;
		serde_json::to_vec(&xlated).map_err(AIError::RequestMarshal)
	}

	fn translate_internal(
		req: &completions::Request,
		provider: &Provider,
	) -> Result<bedrock::ConverseRequest, AIError> {
		let system: Vec<bedrock::SystemContentBlock> = req
			.messages
			.iter()
			.filter(|m| m.is_system())
			.filter_map(|m| m.text())
			.map(bedrock::SystemContentBlock::Text)
			.collect();

		let mut msgs: Vec<bedrock::Message> = Vec::new();
		for msg in req.messages.iter().filter(|m| !m.is_system()) {
			let (role, blocks) = match msg {
				completions::RequestMessage::User(m) => {
					(bedrock::ConversationRole::User, user_blocks(&m.content))
				},
				completions::RequestMessage::Tool(m) => (
					bedrock::ConversationRole::User,
					vec![bedrock::ContentBlock::ToolResult(bedrock::ToolResultBlock {
						tool_use_id: m.tool_call_id.clone(),
						content: vec![bedrock::ToolResultContentBlock::Text(
							m.content.as_text().unwrap_or_default(),
						)],
						status: None,
					})],
				),
				completions::RequestMessage::Assistant(m) => {
					let mut blocks = Vec::new();
					for tb in m.thinking_blocks.iter().flatten() {
						blocks.push(bedrock::ContentBlock::ReasoningContent(match tb {
							completions::ThinkingBlock::Thinking {
								thinking,
								signature,
							} => bedrock::ReasoningBlock::ReasoningText(bedrock::ReasoningText {
								text: thinking.clone(),
								signature: signature.clone(),
							}),
							completions::ThinkingBlock::RedactedThinking { data } => {
								bedrock::ReasoningBlock::RedactedContent(data.clone())
							},
						}));
					}
					if let Some(text) = m.content.as_ref().and_then(|c| c.as_text()) {
						blocks.push(bedrock::ContentBlock::Text(text));
					}
					for call in m.tool_calls.iter().flatten() {
						blocks.push(bedrock::ContentBlock::ToolUse(bedrock::ToolUseBlock {
							tool_use_id: call.id.clone(),
							name: call.function.name.clone(),
							input: serde_json::from_str(&call.function.arguments)
								.unwrap_or(serde_json::Value::Object(Default::default())),
						}));
					}
					(bedrock::ConversationRole::Assistant, blocks)
				},
				completions::RequestMessage::System(_) | completions::RequestMessage::Developer(_) => {
					continue;
				},
			};
			if blocks.is_empty() {
				continue;
			}
			// Converse requires alternating roles.
			if msgs.last().map(|m| m.role == role).unwrap_or(false) {
				msgs
					.last_mut()
					.expect("just checked")
					.content
					.extend(blocks);
			} else {
				msgs.push(bedrock::Message {
					role,
					content: blocks,
				});
			}
		}

		let mut tools = Vec::new();
		for tool in req.tools.iter().flatten() {
			if Provider::is_unsupported_tool(tool) {
				// Not available on this provider on any channel.
				debug!("dropping unsupported tool type {}", tool.r#type);
				continue;
			}
			let Some(f) = tool.function.as_ref().filter(|_| tool.is_function()) else {
				continue;
			};
			let mut schema = f.parameters.clone().unwrap_or(serde_json::json!({
				"type": "object",
				"properties": {}
			}));
			scrub_schema_for_bedrock(&mut schema);
			tools.push(bedrock::Tool::ToolSpec(bedrock::ToolSpecification {
				name: f.name.clone(),
				description: f.description.clone(),
				input_schema: bedrock::ToolInputSchema::Json(schema),
			}));
		}

		let tool_choice = req.tool_choice.as_ref().and_then(|choice| match choice {
			completions::ToolChoiceOption::Mode(completions::ToolChoiceMode::Auto) => {
				Some(bedrock::ToolChoice::Auto(serde_json::json!({})))
			},
			completions::ToolChoiceOption::Mode(completions::ToolChoiceMode::Required) => {
				Some(bedrock::ToolChoice::Any(serde_json::json!({})))
			},
			// Converse has no "none"; omitting the tool config entirely is
			// the closest equivalent, handled below.
			completions::ToolChoiceOption::Mode(completions::ToolChoiceMode::None) => None,
			completions::ToolChoiceOption::Named(named) => {
				Some(bedrock::ToolChoice::Tool(bedrock::ToolChoiceTool {
					name: named.function.name.clone(),
				}))
			},
		});
		let disable_tools = matches!(
			req.tool_choice,
			Some(completions::ToolChoiceOption::Mode(
				completions::ToolChoiceMode::None
			))
		);

		// Anthropic-specific knobs ride in additionalModelRequestFields.
		let mut additional = serde_json::Map::new();
		if let Some(k) = req.top_k {
			additional.insert("top_k".to_string(), serde_json::json!(k));
		}
		if let Some(completions::ThinkingInput::Enabled { budget_tokens }) = req.thinking {
			additional.insert(
				"thinking".to_string(),
				serde_json::json!({"type": "enabled", "budget_tokens": budget_tokens}),
			);
		}

		Ok(bedrock::ConverseRequest {
			messages: msgs,
			system,
			inference_config: Some(bedrock::InferenceConfiguration {
				max_tokens: req.max_output_tokens(),
				temperature: req.temperature,
				top_p: req.top_p,
				stop_sequences: req.stop_sequences(),
			}),
			tool_config: if tools.is_empty() || disable_tools {
				None
			} else {
				Some(bedrock::ToolConfiguration { tools, tool_choice })
			},
			guardrail_config: provider.guardrail_identifier.as_ref().map(|id| {
				bedrock::GuardrailConfiguration {
					guardrail_identifier: id.to_string(),
					guardrail_version: provider
						.guardrail_version
						.as_deref()
						.unwrap_or("DRAFT")
						.to_string(),
					trace: None,
				}
			}),
			additional_model_request_fields: (!additional.is_empty())
				.then_some(serde_json::Value::Object(additional)),
		})
	}

	fn user_blocks(content: &completions::Content) -> Vec<bedrock::ContentBlock> {
		content
			.parts()
			.into_iter()
			.filter_map(|part| match part {
				completions::ContentPart::Text { text } => Some(bedrock::ContentBlock::Text(text)),
				completions::ContentPart::ImageUrl { image_url } => {
					// Converse only takes raw bytes; remote URLs would need a
					// fetch-and-inline pass upstream of translation.
					let (mime, data) = image_url.as_data_url()?;
					Some(bedrock::ContentBlock::Image(bedrock::ImageBlock {
						format: mime.strip_prefix("image/").unwrap_or("png").to_string(),
						source: bedrock::ImageSource::Bytes(data),
					}))
				},
				_ => None,
			})
			.collect()
	}

	pub fn translate_response(
		bytes: &Bytes,
		request_model: &Strng,
	) -> Result<Box<dyn ResponseType>, AIError> {
		let resp = serde_json::from_slice::<bedrock::ConverseResponse>(bytes)
			.map_err(AIError::ResponseParsing)?;
		Ok(Box::new(translate_response_internal(resp, request_model)))
	}

	fn translate_response_internal(
		resp: bedrock::ConverseResponse,
		request_model: &Strng,
	) -> completions::Response {
		let mut content = None;
		let mut reasoning_content = None;
		let mut thinking_blocks = Vec::new();
		let mut tool_calls = Vec::new();
		for block in resp.output.message.content {
			match block {
				bedrock::ContentBlock::Text(text) => content = Some(text),
				bedrock::ContentBlock::ToolUse(tu) => {
					tool_calls.push(completions::MessageToolCall {
						id: tu.tool_use_id,
						r#type: "function".to_string(),
						function: completions::FunctionCall {
							name: tu.name,
							arguments: serde_json::to_string(&tu.input).unwrap_or_default(),
						},
					});
				},
				bedrock::ContentBlock::ReasoningContent(rb) => match rb {
					bedrock::ReasoningBlock::ReasoningText(rt) => {
						reasoning_content = Some(rt.text.clone());
						thinking_blocks.push(completions::ThinkingBlock::Thinking {
							thinking: rt.text,
							signature: rt.signature,
						});
					},
					bedrock::ReasoningBlock::RedactedContent(data) => {
						thinking_blocks.push(completions::ThinkingBlock::RedactedThinking { data });
					},
				},
				_ => {},
			}
		}

		completions::Response {
			id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
			object: "chat.completion".to_string(),
			created: chrono::Utc::now().timestamp() as u64,
			model: request_model.to_string(),
			choices: vec![completions::ChatChoice {
				index: 0,
				message: completions::ResponseMessage {
					role: completions::Role::Assistant,
					content,
					tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
					reasoning_content,
					thinking_blocks: (!thinking_blocks.is_empty()).then_some(thinking_blocks),
					refusal: None,
					audio: None,
				},
				finish_reason: Some(translate_stop_reason(resp.stop_reason)),
				logprobs: None,
			}],
			usage: Some(usage_to_openai(&resp.usage)),
			service_tier: None,
			system_fingerprint: None,
			hidden: Default::default(),
		}
	}

	/// Bridge the Converse event stream into unified chunks.
	pub fn translate_stream(body: Body, log: AsyncLog<LLMInfo>, model: &Strng) -> Body {
		let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
		let created = chrono::Utc::now().timestamp() as u64;
		let model = model.to_string();
		let mut sent_role = false;
		let mut saw_token = false;
		let mut finish_reason: Option<completions::FinishReason> = None;
		// Converse content block index -> OpenAI tool_call index
		let mut tool_indices: HashMap<u32, u32> = HashMap::new();
		aws_sse::transform::<completions::StreamResponse>(body, move |event, payload| {
			let mk = |choices: Vec<completions::ChatChoiceStream>,
			          usage: Option<completions::Usage>| {
				completions::StreamResponse {
					id: id.clone(),
					object: completions::CHUNK_OBJECT.to_string(),
					created,
					model: model.clone(),
					choices,
					usage,
					service_tier: None,
					system_fingerprint: None,
				}
			};
			let choice = |delta: completions::StreamResponseDelta,
			              finish: Option<completions::FinishReason>| {
				vec![completions::ChatChoiceStream {
					index: 0,
					delta,
					finish_reason: finish,
					logprobs: None,
				}]
			};
			match event {
				"messageStart" => {
					sent_role = true;
					vec![mk(
						choice(
							completions::StreamResponseDelta {
								role: Some(completions::Role::Assistant),
								..Default::default()
							},
							None,
						),
						None,
					)]
				},
				"contentBlockStart" => {
					let Ok(start) =
						serde_json::from_slice::<bedrock::StreamContentBlockStart>(&payload)
					else {
						return vec![];
					};
					let Some(bedrock::ContentBlockStart::ToolUse(tu)) = start.start else {
						return vec![];
					};
					let tool_index = tool_indices.len() as u32;
					tool_indices.insert(start.content_block_index, tool_index);
					vec![mk(
						choice(
							completions::StreamResponseDelta {
								role: (!sent_role).then(|| {
									sent_role = true;
									completions::Role::Assistant
								}),
								tool_calls: Some(vec![completions::ToolCallDelta {
									index: tool_index,
									id: Some(tu.tool_use_id),
									r#type: Some("function".to_string()),
									function: Some(completions::FunctionCallDelta {
										name: Some(tu.name),
										arguments: Some(String::new()),
									}),
								}]),
								..Default::default()
							},
							None,
						),
						None,
					)]
				},
				"contentBlockDelta" => {
					let Ok(delta) =
						serde_json::from_slice::<bedrock::StreamContentBlockDelta>(&payload)
					else {
						return vec![];
					};
					if !saw_token {
						saw_token = true;
						log.non_atomic_mutate(|r| {
							r.response.first_token = Some(Instant::now());
						});
					}
					let mut dr = completions::StreamResponseDelta::default();
					match delta.delta {
						bedrock::ContentBlockDelta::Text(text) => dr.content = Some(text),
						bedrock::ContentBlockDelta::ToolUse(tu) => {
							let Some(tool_index) =
								tool_indices.get(&delta.content_block_index).copied()
							else {
								return vec![];
							};
							dr.tool_calls = Some(vec![completions::ToolCallDelta {
								index: tool_index,
								id: None,
								r#type: None,
								function: Some(completions::FunctionCallDelta {
									name: None,
									arguments: Some(tu.input),
								}),
							}]);
						},
						bedrock::ContentBlockDelta::ReasoningContent(rc) => match rc {
							bedrock::ReasoningContentBlockDelta::Text(text) => {
								dr.reasoning_content = Some(text)
							},
							bedrock::ReasoningContentBlockDelta::Signature(signature) => {
								dr.thinking_blocks =
									Some(vec![completions::ThinkingBlock::Thinking {
										thinking: String::new(),
										signature: Some(signature),
									}]);
							},
							bedrock::ReasoningContentBlockDelta::RedactedContent(data) => {
								dr.thinking_blocks =
									Some(vec![completions::ThinkingBlock::RedactedThinking {
										data,
									}]);
							},
						},
					}
					if !sent_role {
						sent_role = true;
						dr.role = Some(completions::Role::Assistant);
					}
					vec![mk(choice(dr, None), None)]
				},
				"messageStop" => {
					let Ok(stop) = serde_json::from_slice::<bedrock::StreamMessageStop>(&payload)
					else {
						return vec![];
					};
					// finish_reason is held for the terminal chunk, which
					// carries usage from the trailing metadata event.
					finish_reason = Some(translate_stop_reason(stop.stop_reason));
					vec![]
				},
				"metadata" => {
					let Ok(meta) = serde_json::from_slice::<bedrock::StreamMetadata>(&payload)
					else {
						return vec![];
					};
					let usage = usage_to_openai(&meta.usage);
					let u = usage.clone();
					log.non_atomic_mutate(move |r| {
						r.response.input_tokens = Some(u.prompt_tokens);
						r.response.output_tokens = Some(u.completion_tokens);
						r.response.total_tokens = Some(u.total_tokens);
						r.response.usage = Some(u);
					});
					vec![mk(
						choice(
							Default::default(),
							finish_reason.take().or(Some(completions::FinishReason::Stop)),
						),
						Some(usage),
					)]
				},
				_ => vec![],
			}
		})
	}
}

pub mod from_messages {
	use std::collections::HashMap;

	use bytes::Bytes;

	use crate::http::Body;
	use crate::llm::bedrock::Provider;
	use crate::llm::types::{ResponseType, bedrock, completions, messages};
	use crate::llm::{AIError, LLMInfo, conversion};
	use crate::parse::aws_sse;
	use crate::telemetry::log::AsyncLog;
	use crate::{Strng, strng};

	/// Anthropic-shaped requests reach Converse through the unified shape.
	pub fn translate(req: &messages::Request, provider: &Provider) -> Result<Vec<u8>, AIError> {
		let unified = conversion::completions::from_messages::translate(req)?;
		let unified: completions::Request =
			serde_json::from_slice(&unified).map_err(AIError::RequestParsing)?;
		super::from_completions::translate(&unified, provider)
	}

	pub fn translate_response(
		bytes: &Bytes,
		request_model: &Strng,
	) -> Result<Box<dyn ResponseType>, AIError> {
		let resp = serde_json::from_slice::<bedrock::ConverseResponse>(bytes)
			.map_err(AIError::ResponseParsing)?;
		Ok(Box::new(translate_response_internal(resp, request_model)))
	}

	fn translate_response_internal(
		resp: bedrock::ConverseResponse,
		request_model: &Strng,
	) -> messages::MessagesResponse {
		let mut content = Vec::new();
		for block in resp.output.message.content {
			match block {
				bedrock::ContentBlock::Text(text) => {
					content.push(messages::ContentBlock::Text(messages::ContentTextBlock {
						text,
						citations: None,
						cache_control: None,
					}));
				},
				bedrock::ContentBlock::ToolUse(tu) => {
					content.push(messages::ContentBlock::ToolUse {
						id: tu.tool_use_id,
						name: tu.name,
						input: tu.input,
						cache_control: None,
					});
				},
				bedrock::ContentBlock::ReasoningContent(rb) => match rb {
					bedrock::ReasoningBlock::ReasoningText(rt) => {
						content.push(messages::ContentBlock::Thinking {
							thinking: rt.text,
							signature: rt.signature.unwrap_or_default(),
						});
					},
					bedrock::ReasoningBlock::RedactedContent(data) => {
						content.push(messages::ContentBlock::RedactedThinking { data });
					},
				},
				_ => {},
			}
		}

		messages::MessagesResponse {
			id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
			r#type: "message".to_string(),
			role: messages::Role::Assistant,
			content,
			model: request_model.to_string(),
			stop_reason: Some(translate_stop_reason(resp.stop_reason)),
			stop_sequence: None,
			usage: messages::Usage {
				input_tokens: resp.usage.input_tokens,
				output_tokens: resp.usage.output_tokens,
				cache_creation_input_tokens: resp.usage.cache_write_input_tokens,
				cache_read_input_tokens: resp.usage.cache_read_input_tokens,
			},
		}
	}

	fn translate_stop_reason(reason: bedrock::StopReason) -> messages::StopReason {
		match reason {
			bedrock::StopReason::EndTurn => messages::StopReason::EndTurn,
			bedrock::StopReason::ToolUse => messages::StopReason::ToolUse,
			bedrock::StopReason::MaxTokens => messages::StopReason::MaxTokens,
			bedrock::StopReason::StopSequence => messages::StopReason::StopSequence,
			bedrock::StopReason::GuardrailIntervened | bedrock::StopReason::ContentFiltered => {
				messages::StopReason::Refusal
			},
		}
	}

	/// Bridge the Converse event stream back into an Anthropic-shaped event
	/// stream for `/v1/messages` clients.
	pub fn translate_stream(body: Body, log: AsyncLog<LLMInfo>, model: &Strng) -> Body {
		let message_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
		let model = model.to_string();
		let mut stop_reason: Option<messages::StopReason> = None;
		// Indices where we have emitted a content_block_start.
		let mut started: HashMap<u32, bool> = HashMap::new();
		aws_sse::transform_named::<messages::MessagesStreamEvent>(body, move |event, payload| {
			match event {
				"messageStart" => {
					log.non_atomic_mutate(|r| r.response.provider_model = Some(strng::new(&model)));
					vec![(
						"message_start",
						messages::MessagesStreamEvent::MessageStart {
							message: messages::MessagesResponse {
								id: message_id.clone(),
								r#type: "message".to_string(),
								role: messages::Role::Assistant,
								content: Vec::new(),
								model: model.clone(),
								stop_reason: None,
								stop_sequence: None,
								usage: messages::Usage::default(),
							},
						},
					)]
				},
				"contentBlockStart" => {
					let Ok(start) =
						serde_json::from_slice::<bedrock::StreamContentBlockStart>(&payload)
					else {
						return vec![];
					};
					started.insert(start.content_block_index, true);
					let block = match start.start {
						Some(bedrock::ContentBlockStart::ToolUse(tu)) => {
							messages::ContentBlock::ToolUse {
								id: tu.tool_use_id,
								name: tu.name,
								input: serde_json::Value::Object(Default::default()),
								cache_control: None,
							}
						},
						None => messages::ContentBlock::Text(messages::ContentTextBlock {
							text: String::new(),
							citations: None,
							cache_control: None,
						}),
					};
					vec![(
						"content_block_start",
						messages::MessagesStreamEvent::ContentBlockStart {
							index: start.content_block_index as usize,
							content_block: block,
						},
					)]
				},
				"contentBlockDelta" => {
					let Ok(delta) =
						serde_json::from_slice::<bedrock::StreamContentBlockDelta>(&payload)
					else {
						return vec![];
					};
					let index = delta.content_block_index;
					let mapped = match delta.delta {
						bedrock::ContentBlockDelta::Text(text) => {
							messages::ContentBlockDelta::TextDelta { text }
						},
						bedrock::ContentBlockDelta::ToolUse(tu) => {
							messages::ContentBlockDelta::InputJsonDelta {
								partial_json: tu.input,
							}
						},
						bedrock::ContentBlockDelta::ReasoningContent(rc) => match rc {
							bedrock::ReasoningContentBlockDelta::Text(thinking) => {
								messages::ContentBlockDelta::ThinkingDelta { thinking }
							},
							bedrock::ReasoningContentBlockDelta::Signature(signature) => {
								messages::ContentBlockDelta::SignatureDelta { signature }
							},
							bedrock::ReasoningContentBlockDelta::RedactedContent(_) => {
								return vec![];
							},
						},
					};
					let mut out = Vec::new();
					// Converse only announces tool blocks; synthesize the
					// start event for text blocks.
					if !started.contains_key(&index) {
						started.insert(index, true);
						out.push((
							"content_block_start",
							messages::MessagesStreamEvent::ContentBlockStart {
								index: index as usize,
								content_block: messages::ContentBlock::Text(
									messages::ContentTextBlock {
										text: String::new(),
										citations: None,
										cache_control: None,
									},
								),
							},
						));
					}
					out.push((
						"content_block_delta",
						messages::MessagesStreamEvent::ContentBlockDelta {
							index: index as usize,
							delta: mapped,
						},
					));
					out
				},
				"contentBlockStop" => {
					let Ok(stop) =
						serde_json::from_slice::<bedrock::StreamContentBlockStop>(&payload)
					else {
						return vec![];
					};
					vec![(
						"content_block_stop",
						messages::MessagesStreamEvent::ContentBlockStop {
							index: stop.content_block_index as usize,
						},
					)]
				},
				"messageStop" => {
					let Ok(stop) = serde_json::from_slice::<bedrock::StreamMessageStop>(&payload)
					else {
						return vec![];
					};
					stop_reason = Some(translate_stop_reason(stop.stop_reason));
					vec![]
				},
				"metadata" => {
					let Ok(meta) = serde_json::from_slice::<bedrock::StreamMetadata>(&payload)
					else {
						return vec![];
					};
					log.non_atomic_mutate(|r| {
						r.response.input_tokens = Some(meta.usage.input_tokens);
						r.response.output_tokens = Some(meta.usage.output_tokens);
						r.response.total_tokens = Some(meta.usage.total_tokens);
					});
					vec![
						(
							"message_delta",
							messages::MessagesStreamEvent::MessageDelta {
								delta: messages::MessageDelta {
									stop_reason: stop_reason.take(),
									stop_sequence: None,
								},
								usage: messages::MessageDeltaUsage {
									input_tokens: meta.usage.input_tokens,
									output_tokens: meta.usage.output_tokens,
									cache_creation_input_tokens: meta.usage.cache_write_input_tokens,
									cache_read_input_tokens: meta.usage.cache_read_input_tokens,
								},
							},
						),
						("message_stop", messages::MessagesStreamEvent::MessageStop),
					]
				},
				_ => vec![],
			}
		})
	}
}
