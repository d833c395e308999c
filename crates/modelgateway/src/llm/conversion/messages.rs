//! Translation between the unified completions shape and the Anthropic
//! Messages shape, both directions, including streaming.

use std::time::Instant;

use crate::http::Body;
use crate::llm::LLMInfo;
use crate::llm::types::completions;
use crate::llm::types::messages;
use crate::parse;
use crate::strng;
use crate::telemetry::log::AsyncLog;

/// Conventional tool name used when coercing `json_schema` response format
/// into tool use; the response side folds it back into plain content.
pub const JSON_TOOL_NAME: &str = "json_tool_call";

pub mod from_completions {
	use std::collections::HashMap;
	use std::time::Instant;

	use bytes::Bytes;

	use super::JSON_TOOL_NAME;
	use crate::http::Body;
	use crate::llm::conversion::scrub_schema_for_anthropic;
	use crate::llm::types::completions;
	use crate::llm::types::messages;
	use crate::llm::types::{ResponseType, completions::FinishReason};
	use crate::llm::{AIError, LLMInfo};
	use crate::parse;
	use crate::telemetry::log::AsyncLog;
	use crate::{debug, strng};

	/// Translate a unified completions request into an Anthropic messages
	/// request.
	pub fn translate(req: &completions::Request) -> Result<Vec<u8>, AIError> {
		let xlated = translate_internal(req)?;
		serde_json::to_vec(&xlated).map_err(AIError::RequestMarshal)
	}

	fn translate_internal(req: &completions::Request) -> Result<messages::Request, AIError> {
		// Anthropic has all system prompts in a single field. Join them.
		let system = req
			.messages
			.iter()
			.filter(|m| m.is_system())
			.filter_map(|m| m.text())
			.collect::<Vec<_>>()
			.join("\n");

		let mut msgs: Vec<messages::Message> = Vec::new();
		for msg in req.messages.iter().filter(|m| !m.is_system()) {
			let (role, blocks) = match msg {
				completions::RequestMessage::User(m) => {
					(messages::Role::User, user_blocks(&m.content))
				},
				completions::RequestMessage::Tool(m) => (
					messages::Role::User,
					vec![messages::ContentBlock::ToolResult {
						tool_use_id: m.tool_call_id.clone(),
						content: messages::ToolResultContent::Text(
							m.content.as_text().unwrap_or_default(),
						),
						is_error: None,
						cache_control: None,
					}],
				),
				completions::RequestMessage::Assistant(m) => {
					(messages::Role::Assistant, assistant_blocks(m))
				},
				completions::RequestMessage::System(_) | completions::RequestMessage::Developer(_) => {
					continue;
				},
			};
			if blocks.is_empty() {
				continue;
			}
			// The Messages API requires alternating roles; merge consecutive
			// same-role turns.
			if msgs.last().map(|m| m.role == role).unwrap_or(false) {
				msgs
					.last_mut()
					.expect("just checked")
					.content
					.extend(blocks);
			} else {
				msgs.push(messages::Message {
					role,
					content: blocks,
				});
			}
		}

		let mut tools: Vec<messages::Tool> = Vec::new();
		for tool in req.tools.iter().flatten() {
			if let Some(f) = tool.function.as_ref().filter(|_| tool.is_function()) {
				let mut schema = f.parameters.clone().unwrap_or(serde_json::json!({
					"type": "object",
					"properties": {}
				}));
				scrub_schema_for_anthropic(&mut schema);
				tools.push(messages::Tool {
					name: f.name.clone(),
					description: f.description.clone(),
					input_schema: Some(schema),
					cache_control: None,
					rest: Default::default(),
				});
			} else {
				// Provider built-ins (tool search, computer use, ...) pass
				// through with their type intact; the beta header table
				// handles activation.
				let mut rest = tool.rest.clone();
				rest.insert(
					"type".to_string(),
					serde_json::Value::String(tool.r#type.clone()),
				);
				let name = rest
					.get("name")
					.and_then(|v| v.as_str())
					.unwrap_or(tool.r#type.as_str())
					.to_string();
				rest.remove("name");
				tools.push(messages::Tool {
					name,
					description: None,
					input_schema: None,
					cache_control: None,
					rest,
				});
			}
		}

		let mut tool_choice = req.tool_choice.as_ref().map(|choice| match choice {
			completions::ToolChoiceOption::Mode(completions::ToolChoiceMode::Auto) => {
				messages::ToolChoice::Auto
			},
			completions::ToolChoiceOption::Mode(completions::ToolChoiceMode::Required) => {
				messages::ToolChoice::Any
			},
			completions::ToolChoiceOption::Mode(completions::ToolChoiceMode::None) => {
				messages::ToolChoice::None
			},
			completions::ToolChoiceOption::Named(named) => messages::ToolChoice::Tool {
				name: named.function.name.clone(),
			},
		});

		// Structured output has no native surface here; coerce json_schema
		// into a forced tool call that the response path folds back.
		if let Some(completions::ResponseFormat::JsonSchema { json_schema }) = &req.response_format {
			let mut schema = json_schema.schema.clone();
			scrub_schema_for_anthropic(&mut schema);
			tools.push(messages::Tool {
				name: JSON_TOOL_NAME.to_string(),
				description: Some("Produce the response in the required JSON shape".to_string()),
				input_schema: Some(schema),
				cache_control: None,
				rest: Default::default(),
			});
			tool_choice = Some(messages::ToolChoice::Tool {
				name: JSON_TOOL_NAME.to_string(),
			});
		}

		let thinking = match &req.thinking {
			Some(t) => Some(*t),
			None => match req.reasoning_effort {
				// Budget constants are the conventional effort mapping.
				// Anthropic's minimum budget_tokens is 1024.
				Some(completions::ReasoningEffort::Minimal) | Some(completions::ReasoningEffort::Low) => {
					Some(messages::ThinkingInput::Enabled {
						budget_tokens: 1024,
					})
				},
				Some(completions::ReasoningEffort::Medium) => Some(messages::ThinkingInput::Enabled {
					budget_tokens: 2048,
				}),
				Some(completions::ReasoningEffort::High) | Some(completions::ReasoningEffort::Xhigh) => {
					Some(messages::ThinkingInput::Enabled {
						budget_tokens: 4096,
					})
				},
				Some(completions::ReasoningEffort::None) | None => None,
			},
		};

		let metadata = req.user.as_ref().map(|user| messages::Metadata {
			fields: HashMap::from([("user_id".to_string(), user.clone())]),
		});

		Ok(messages::Request {
			model: req.model.clone(),
			messages: msgs,
			system: if system.is_empty() {
				None
			} else {
				Some(messages::SystemPrompt::Text(system))
			},
			// max_tokens is mandatory on this API.
			max_tokens: req.max_output_tokens().unwrap_or(4096),
			stop_sequences: req.stop_sequences(),
			stream: req.stream.unwrap_or(false),
			temperature: req.temperature,
			top_p: req.top_p,
			top_k: req.top_k,
			tools: if tools.is_empty() { None } else { Some(tools) },
			tool_choice,
			metadata,
			thinking,
			rest: Default::default(),
		})
	}

	fn user_blocks(content: &completions::Content) -> Vec<messages::ContentBlock> {
		content
			.parts()
			.into_iter()
			.filter_map(|part| match part {
				completions::ContentPart::Text { text } => {
					Some(messages::ContentBlock::Text(messages::ContentTextBlock {
						text,
						citations: None,
						cache_control: None,
					}))
				},
				completions::ContentPart::ImageUrl { image_url } => {
					let source = if let Some((media_type, data)) = image_url.as_data_url() {
						serde_json::json!({"type": "base64", "media_type": media_type, "data": data})
					} else {
						serde_json::json!({"type": "url", "url": image_url.url})
					};
					Some(messages::ContentBlock::Image {
						source,
						cache_control: None,
					})
				},
				completions::ContentPart::File { file } => {
					let data_url = file.file_data.as_deref()?;
					let (media_type, data) = data_url
						.strip_prefix("data:")
						.and_then(|rest| rest.split_once(";base64,"))?;
					Some(messages::ContentBlock::Document {
						source: serde_json::json!({"type": "base64", "media_type": media_type, "data": data}),
						cache_control: None,
					})
				},
				other => {
					debug!("unsupported user content part: {other:?}");
					None
				},
			})
			.collect()
	}

	fn assistant_blocks(m: &completions::RequestAssistantMessage) -> Vec<messages::ContentBlock> {
		let mut blocks = Vec::new();
		// Thinking must precede text for replayed assistant turns.
		for tb in m.thinking_blocks.iter().flatten() {
			blocks.push(match tb {
				completions::ThinkingBlock::Thinking {
					thinking,
					signature,
				} => messages::ContentBlock::Thinking {
					thinking: thinking.clone(),
					signature: signature.clone().unwrap_or_default(),
				},
				completions::ThinkingBlock::RedactedThinking { data } => {
					messages::ContentBlock::RedactedThinking { data: data.clone() }
				},
			});
		}
		if let Some(text) = m.content.as_ref().and_then(|c| c.as_text()) {
			blocks.push(messages::ContentBlock::Text(messages::ContentTextBlock {
				text,
				citations: None,
				cache_control: None,
			}));
		}
		for call in m.tool_calls.iter().flatten() {
			let input = serde_json::from_str(&call.function.arguments)
				.unwrap_or(serde_json::Value::Object(Default::default()));
			blocks.push(messages::ContentBlock::ToolUse {
				id: call.id.clone(),
				name: call.function.name.clone(),
				input,
				cache_control: None,
			});
		}
		blocks
	}

	pub fn translate_response(bytes: &Bytes) -> Result<Box<dyn ResponseType>, AIError> {
		let resp = serde_json::from_slice::<messages::MessagesResponse>(bytes)
			.map_err(AIError::ResponseParsing)?;
		Ok(Box::new(translate_response_internal(resp)))
	}

	fn translate_response_internal(resp: messages::MessagesResponse) -> completions::Response {
		let mut tool_calls: Vec<completions::MessageToolCall> = Vec::new();
		let mut content = None;
		let mut reasoning_content = None;
		let mut thinking_blocks: Vec<completions::ThinkingBlock> = Vec::new();
		let mut coerced_json = None;
		for block in resp.content {
			match block {
				messages::ContentBlock::Text(t) => content = Some(t.text),
				messages::ContentBlock::ToolUse {
					id, name, input, ..
				}
				| messages::ContentBlock::ServerToolUse { id, name, input } => {
					if name == JSON_TOOL_NAME {
						coerced_json = serde_json::to_string(&input).ok();
						continue;
					}
					let Ok(args) = serde_json::to_string(&input) else {
						continue;
					};
					tool_calls.push(completions::MessageToolCall {
						id,
						r#type: "function".to_string(),
						function: completions::FunctionCall {
							name,
							arguments: args,
						},
					});
				},
				messages::ContentBlock::Thinking {
					thinking,
					signature,
				} => {
					reasoning_content = Some(thinking.clone());
					thinking_blocks.push(completions::ThinkingBlock::Thinking {
						thinking,
						signature: if signature.is_empty() {
							None
						} else {
							Some(signature)
						},
					});
				},
				messages::ContentBlock::RedactedThinking { data } => {
					// Preserved verbatim so multi-turn replay keeps working.
					thinking_blocks.push(completions::ThinkingBlock::RedactedThinking { data });
				},
				_ => {},
			}
		}

		// Structured output coercion folds back into plain content.
		let finish_reason = if let Some(json) = coerced_json {
			content = Some(json);
			Some(FinishReason::Stop)
		} else {
			resp.stop_reason.as_ref().map(super::translate_stop_reason)
		};

		let message = completions::ResponseMessage {
			role: completions::Role::Assistant,
			content,
			tool_calls: if tool_calls.is_empty() {
				None
			} else {
				Some(tool_calls)
			},
			reasoning_content,
			thinking_blocks: if thinking_blocks.is_empty() {
				None
			} else {
				Some(thinking_blocks)
			},
			refusal: None,
			audio: None,
		};
		// Only one choice for this provider
		let choice = completions::ChatChoice {
			index: 0,
			message,
			finish_reason,
			logprobs: None,
		};

		completions::Response {
			id: resp.id,
			object: "chat.completion".to_string(),
			// No date in the provider response so just call it "now"
			created: chrono::Utc::now().timestamp() as u64,
			model: resp.model,
			choices: vec![choice],
			usage: Some(super::usage_to_openai(&resp.usage)),
			service_tier: None,
			system_fingerprint: None,
			hidden: Default::default(),
		}
	}

	pub fn translate_error(bytes: &Bytes) -> Result<Bytes, AIError> {
		let res = serde_json::from_slice::<messages::MessagesErrorResponse>(bytes)
			.map_err(AIError::ResponseParsing)?;
		let m = completions::ChatCompletionErrorResponse {
			error: completions::ChatCompletionError {
				r#type: res.error.r#type,
				message: res.error.message,
				param: None,
				code: None,
			},
		};
		Ok(Bytes::from(
			serde_json::to_vec(&m).map_err(AIError::ResponseMarshal)?,
		))
	}

	/// Translate an Anthropic event stream into unified chunks.
	///
	/// Chunk invariants: one stable id from `message_start`, `role` only on
	/// the first delta, `finish_reason` and usage only on the terminal chunk,
	/// partial tool-call JSON keyed by OpenAI-style index.
	pub fn translate_stream(b: Body, buffer_limit: usize, log: AsyncLog<LLMInfo>) -> Body {
		let mut message_id = None;
		let mut model = String::new();
		let created = chrono::Utc::now().timestamp() as u64;
		let mut input_tokens = 0u64;
		let mut cache_read = None;
		let mut saw_token = false;
		let mut sent_role = false;
		let mut finish_reason = None;
		let mut emitted_any = false;
		// Anthropic content block index -> OpenAI tool_call index
		let mut tool_indices: HashMap<usize, u32> = HashMap::new();
		parse::sse::json_transform::<messages::MessagesStreamEvent, completions::StreamResponse>(
			b,
			buffer_limit,
			move |f| {
				let mk = |choices: Vec<completions::ChatChoiceStream>,
				          usage: Option<completions::Usage>,
				          message_id: &Option<String>,
				          model: &str| {
					Some(completions::StreamResponse {
						id: message_id.clone().unwrap_or_else(|| "unknown".to_string()),
						model: model.to_string(),
						object: completions::CHUNK_OBJECT.to_string(),
						system_fingerprint: None,
						service_tier: None,
						created,
						choices,
						usage,
					})
				};
				let Some(f) = f else {
					// Upstream closed without producing anything the client
					// saw; still deliver one terminal chunk with zero usage.
					if emitted_any {
						return None;
					}
					return mk(
						vec![completions::ChatChoiceStream {
							index: 0,
							delta: completions::StreamResponseDelta {
								role: Some(completions::Role::Assistant),
								..Default::default()
							},
							finish_reason: Some(FinishReason::Stop),
							logprobs: None,
						}],
						Some(completions::Usage::new(0, 0, 0)),
						&message_id,
						&model,
					);
				};
				// ignore errors... what else can we do?
				let f = f.ok()?;

				let out = match f {
					messages::MessagesStreamEvent::MessageStart { message } => {
						message_id = Some(message.id);
						model = message.model.clone();
						input_tokens = message.usage.input_tokens;
						cache_read = message.usage.cache_read_input_tokens;
						log.non_atomic_mutate(|r| {
							r.response.output_tokens = Some(message.usage.output_tokens);
							r.response.input_tokens = Some(message.usage.input_tokens);
							r.response.provider_model = Some(strng::new(&message.model))
						});
						sent_role = true;
						let choice = completions::ChatChoiceStream {
							index: 0,
							delta: completions::StreamResponseDelta {
								role: Some(completions::Role::Assistant),
								..Default::default()
							},
							finish_reason: None,
							logprobs: None,
						};
						mk(vec![choice], None, &message_id, &model)
					},
					messages::MessagesStreamEvent::ContentBlockStart {
						index,
						content_block,
					} => match content_block {
						messages::ContentBlock::ToolUse { id, name, .. }
						| messages::ContentBlock::ServerToolUse { id, name, .. } => {
							let tool_index = tool_indices.len() as u32;
							tool_indices.insert(index, tool_index);
							let delta = completions::StreamResponseDelta {
								role: (!sent_role).then(|| {
									sent_role = true;
									completions::Role::Assistant
								}),
								tool_calls: Some(vec![completions::ToolCallDelta {
									index: tool_index,
									id: Some(id),
									r#type: Some("function".to_string()),
									function: Some(completions::FunctionCallDelta {
										name: Some(name),
										arguments: Some(String::new()),
									}),
								}]),
								..Default::default()
							};
							mk(
								vec![completions::ChatChoiceStream {
									index: 0,
									delta,
									finish_reason: None,
									logprobs: None,
								}],
								None,
								&message_id,
								&model,
							)
						},
						// Text/thinking starts carry no content
						_ => None,
					},
					messages::MessagesStreamEvent::ContentBlockDelta { index, delta } => {
						if !saw_token {
							saw_token = true;
							log.non_atomic_mutate(|r| {
								r.response.first_token = Some(Instant::now());
							});
						}
						let mut dr = completions::StreamResponseDelta::default();
						match delta {
							messages::ContentBlockDelta::TextDelta { text } => {
								dr.content = Some(text);
							},
							messages::ContentBlockDelta::ThinkingDelta { thinking } => {
								dr.reasoning_content = Some(thinking);
							},
							messages::ContentBlockDelta::InputJsonDelta { partial_json } => {
								let Some(tool_index) = tool_indices.get(&index).copied() else {
									return None;
								};
								dr.tool_calls = Some(vec![completions::ToolCallDelta {
									index: tool_index,
									id: None,
									r#type: None,
									function: Some(completions::FunctionCallDelta {
										name: None,
										arguments: Some(partial_json),
									}),
								}]);
							},
							messages::ContentBlockDelta::SignatureDelta { signature } => {
								dr.thinking_blocks = Some(vec![completions::ThinkingBlock::Thinking {
									thinking: String::new(),
									signature: Some(signature),
								}]);
							},
							messages::ContentBlockDelta::CitationsDelta { .. } => return None,
						};
						if !sent_role {
							sent_role = true;
							dr.role = Some(completions::Role::Assistant);
						}
						let choice = completions::ChatChoiceStream {
							index: 0,
							logprobs: None,
							delta: dr,
							finish_reason: None,
						};
						mk(vec![choice], None, &message_id, &model)
					},
					messages::MessagesStreamEvent::MessageDelta { usage, delta } => {
						finish_reason = delta
							.stop_reason
							.as_ref()
							.map(super::translate_stop_reason)
							.or(finish_reason);
						log.non_atomic_mutate(|r| {
							r.response.output_tokens = Some(usage.output_tokens);
							if let Some(inp) = r.response.input_tokens {
								r.response.total_tokens = Some(inp + usage.output_tokens)
							}
						});
						let mut openai_usage =
							completions::Usage::new(input_tokens, usage.output_tokens, 0);
						if let Some(cached) = cache_read {
							openai_usage.prompt_tokens_details =
								Some(completions::PromptTokensDetails {
									cached_tokens: cached,
									..Default::default()
								});
						}
						log.non_atomic_mutate(|r| r.response.usage = Some(openai_usage.clone()));
						// Terminal chunk: finish_reason and usage together.
						let choice = completions::ChatChoiceStream {
							index: 0,
							logprobs: None,
							delta: Default::default(),
							finish_reason: finish_reason.or(Some(FinishReason::Stop)),
						};
						mk(vec![choice], Some(openai_usage), &message_id, &model)
					},
					messages::MessagesStreamEvent::ContentBlockStop { .. } => None,
					messages::MessagesStreamEvent::MessageStop => None,
					messages::MessagesStreamEvent::Ping => None,
					messages::MessagesStreamEvent::Error { .. } => None,
				};
				if out.is_some() {
					emitted_any = true;
				}
				out
			},
		)
	}
}

fn translate_stop_reason(resp: &messages::StopReason) -> completions::FinishReason {
	match resp {
		messages::StopReason::EndTurn => completions::FinishReason::Stop,
		messages::StopReason::MaxTokens => completions::FinishReason::Length,
		messages::StopReason::StopSequence => completions::FinishReason::Stop,
		messages::StopReason::ToolUse => completions::FinishReason::ToolCalls,
		messages::StopReason::Refusal => completions::FinishReason::ContentFilter,
		messages::StopReason::PauseTurn => completions::FinishReason::Stop,
		messages::StopReason::ModelContextWindowExceeded => completions::FinishReason::Length,
	}
}

fn usage_to_openai(usage: &messages::Usage) -> completions::Usage {
	// The provider reports uncached input separately; the unified shape
	// counts cached reads and writes inside prompt_tokens.
	let cache_read = usage.cache_read_input_tokens.unwrap_or_default();
	let cache_write = usage.cache_creation_input_tokens.unwrap_or_default();
	let prompt = usage.input_tokens + cache_read + cache_write;
	let mut out = completions::Usage::new(prompt, usage.output_tokens, 0);
	if cache_read > 0 {
		out.prompt_tokens_details = Some(completions::PromptTokensDetails {
			cached_tokens: cache_read,
			..Default::default()
		});
	}
	if cache_write > 0 {
		out.cache_creation_input_tokens = Some(cache_write);
	}
	out
}

/// Observe an Anthropic-native stream without rewriting it.
pub fn passthrough_stream(b: Body, buffer_limit: usize, log: AsyncLog<LLMInfo>) -> Body {
	let mut saw_token = false;
	parse::sse::json_passthrough::<messages::MessagesStreamEvent>(b, buffer_limit, move |f| {
		let Some(Ok(f)) = f else { return };

		match f {
			messages::MessagesStreamEvent::MessageStart { message } => {
				log.non_atomic_mutate(|r| {
					r.response.output_tokens = Some(message.usage.output_tokens);
					r.response.input_tokens = Some(message.usage.input_tokens);
					r.response.provider_model = Some(strng::new(&message.model))
				});
			},
			messages::MessagesStreamEvent::ContentBlockDelta { .. } => {
				if !saw_token {
					saw_token = true;
					log.non_atomic_mutate(|r| {
						r.response.first_token = Some(Instant::now());
					});
				}
			},
			messages::MessagesStreamEvent::MessageDelta { usage, delta: _ } => {
				log.non_atomic_mutate(|r| {
					r.response.output_tokens = Some(usage.output_tokens);
					if let Some(inp) = r.response.input_tokens {
						r.response.total_tokens = Some(inp + usage.output_tokens)
					}
				});
			},
			_ => {},
		}
	})
}
