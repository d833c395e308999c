//! Translation into the unified completions shape, plus observation of
//! OpenAI-native streams.

use std::time::Instant;

use crate::http::Body;
use crate::llm::types::completions;
use crate::llm::{LLMInfo, amend_stream_usage};
use crate::parse;
use crate::strng;
use crate::telemetry::log::AsyncLog;
use crate::{debug, trace};

pub mod from_messages {
	use itertools::Itertools;

	use crate::llm::AIError;
	use crate::llm::types::completions;
	use crate::llm::types::messages;

	/// Translate an Anthropic messages request to a unified completions
	/// request, for serving `/v1/messages` off OpenAI-shaped providers.
	pub fn translate(req: &messages::Request) -> Result<Vec<u8>, AIError> {
		let xlated = translate_internal(req);
		serde_json::to_vec(&xlated).map_err(AIError::RequestMarshal)
	}

	fn translate_internal(req: &messages::Request) -> completions::Request {
		let mut msgs: Vec<completions::RequestMessage> = Vec::new();

		if let Some(system) = &req.system {
			msgs.push(completions::RequestMessage::System(
				completions::RequestSystemMessage {
					content: completions::Content::Text(system.as_text()),
					name: None,
				},
			));
		}

		for msg in &req.messages {
			match msg.role {
				messages::Role::User => {
					let mut user_text = String::new();
					for block in &msg.content {
						match block {
							messages::ContentBlock::Text(t) => {
								if !user_text.is_empty() {
									user_text.push('\n');
								}
								user_text.push_str(&t.text);
							},
							messages::ContentBlock::ToolResult {
								tool_use_id,
								content,
								..
							} => {
								msgs.push(completions::RequestMessage::Tool(
									completions::RequestToolMessage {
										tool_call_id: tool_use_id.clone(),
										content: completions::Content::Text(content.as_text()),
									},
								));
							},
							// Other block types have no user-side equivalent
							// on this surface.
							_ => {},
						}
					}
					if !user_text.is_empty() {
						msgs.push(completions::RequestMessage::User(
							completions::RequestUserMessage {
								content: completions::Content::Text(user_text),
								name: None,
							},
						));
					}
				},
				messages::Role::Assistant => {
					let mut assistant_text = None;
					let mut thinking_blocks = Vec::new();
					let mut tool_calls: Vec<completions::MessageToolCall> = Vec::new();
					for block in &msg.content {
						match block {
							messages::ContentBlock::Text(t) => {
								assistant_text = Some(t.text.clone());
							},
							messages::ContentBlock::ToolUse {
								id, name, input, ..
							} => {
								tool_calls.push(completions::MessageToolCall {
									id: id.clone(),
									r#type: "function".to_string(),
									function: completions::FunctionCall {
										name: name.clone(),
										arguments: serde_json::to_string(input).unwrap_or_default(),
									},
								});
							},
							messages::ContentBlock::Thinking {
								thinking,
								signature,
							} => {
								thinking_blocks.push(completions::ThinkingBlock::Thinking {
									thinking: thinking.clone(),
									signature: Some(signature.clone()),
								});
							},
							messages::ContentBlock::RedactedThinking { data } => {
								thinking_blocks.push(completions::ThinkingBlock::RedactedThinking {
									data: data.clone(),
								});
							},
							_ => {},
						}
					}
					if assistant_text.is_some() || !tool_calls.is_empty() || !thinking_blocks.is_empty() {
						msgs.push(completions::RequestMessage::Assistant(
							completions::RequestAssistantMessage {
								content: assistant_text.map(completions::Content::Text),
								tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
								reasoning_content: None,
								thinking_blocks: (!thinking_blocks.is_empty()).then_some(thinking_blocks),
								name: None,
							},
						));
					}
				},
			}
		}

		let tools = req.tools.as_ref().map(|tools| {
			tools
				.iter()
				.map(|tool| completions::Tool {
					r#type: tool
						.rest
						.get("type")
						.and_then(|v| v.as_str())
						.unwrap_or("function")
						.to_string(),
					function: tool.input_schema.as_ref().map(|schema| {
						completions::FunctionObject {
							name: tool.name.clone(),
							description: tool.description.clone(),
							parameters: Some(schema.clone()),
							strict: None,
							rest: Default::default(),
						}
					}),
					rest: Default::default(),
				})
				.collect_vec()
		});

		let tool_choice = req.tool_choice.as_ref().map(|choice| match choice {
			messages::ToolChoice::Auto => {
				completions::ToolChoiceOption::Mode(completions::ToolChoiceMode::Auto)
			},
			messages::ToolChoice::Any => {
				completions::ToolChoiceOption::Mode(completions::ToolChoiceMode::Required)
			},
			messages::ToolChoice::None => {
				completions::ToolChoiceOption::Mode(completions::ToolChoiceMode::None)
			},
			messages::ToolChoice::Tool { name } => {
				completions::ToolChoiceOption::Named(completions::NamedToolChoice {
					r#type: "function".to_string(),
					function: completions::FunctionName { name: name.clone() },
				})
			},
		});

		let user = req
			.metadata
			.as_ref()
			.and_then(|m| m.fields.get("user_id").cloned());

		completions::Request {
			model: req.model.clone(),
			messages: msgs,
			max_completion_tokens: Some(req.max_tokens),
			stop: if req.stop_sequences.is_empty() {
				None
			} else {
				Some(completions::Stop::StringArray(req.stop_sequences.clone()))
			},
			stream: Some(req.stream),
			temperature: req.temperature,
			top_p: req.top_p,
			top_k: req.top_k,
			tools,
			tool_choice,
			thinking: req.thinking,
			user,
			..Default::default()
		}
	}
}

/// Observe an OpenAI-native stream without rewriting it, accumulating usage
/// and (optionally) the completion into the log cell. The completion is
/// recorded incrementally so that a client disconnect mid-stream still sees
/// the delivered prefix.
pub fn passthrough_stream(
	b: Body,
	buffer_limit: usize,
	log: AsyncLog<LLMInfo>,
	include_completion_in_log: bool,
) -> Body {
	let mut seen_provider = false;
	let mut saw_token = false;
	parse::sse::json_passthrough::<completions::StreamResponse>(b, buffer_limit, move |f| {
		match f {
			Some(Ok(f)) => {
				if include_completion_in_log
					&& let Some(delta) = f.choices.first().and_then(|c| c.delta.content.as_deref())
				{
					log.non_atomic_mutate(|r| {
						r
							.response
							.completion
							.get_or_insert_with(|| vec![String::new()])[0]
							.push_str(delta);
					});
				}
				if !saw_token {
					saw_token = true;
					log.non_atomic_mutate(|r| {
						r.response.first_token = Some(Instant::now());
					});
				}
				if !seen_provider {
					seen_provider = true;
					log.non_atomic_mutate(|r| r.response.provider_model = Some(strng::new(&f.model)));
				}
				if let Some(u) = f.usage {
					log.non_atomic_mutate(|r| {
						r.response.input_tokens = Some(u.prompt_tokens);
						r.response.output_tokens = Some(u.completion_tokens);
						r.response.total_tokens = Some(u.total_tokens);
						r.response.usage = Some(u.clone());
					});
				}
			},
			Some(Err(e)) => {
				debug!("failed to parse streaming response: {e}");
			},
			None => {
				// We are done; backfill usage by counting the text we saw if
				// the provider never reported it.
				trace!("stream complete");
				log.non_atomic_mutate(amend_stream_usage);
			},
		}
	})
}
