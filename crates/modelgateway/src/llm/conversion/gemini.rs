//! Translation between the unified completions shape and the Gemini
//! `generateContent` shape, including streaming.

pub mod from_completions {
	use std::collections::HashMap;
	use std::time::Instant;

	use bytes::Bytes;

	use crate::http::Body;
	use crate::llm::conversion::{scrub_schema_for_gemini, tool_call_id};
	use crate::llm::types::completions::FinishReason;
	use crate::llm::types::{ResponseType, completions, gemini};
	use crate::llm::{AIError, LLMInfo};
	use crate::parse;
	use crate::strng;
	use crate::telemetry::log::AsyncLog;

	pub fn translate(req: &completions::Request) -> Result<Vec<u8>, AIError> {
		let xlated = translate_internal(req)?;
		serde_json::to_vec(&xlated).map_err(AIError::RequestMarshal)
	}

	fn translate_internal(req: &completions::Request) -> Result<gemini::Request, AIError> {
		// Tool results arrive keyed by call id; this provider keys them by
		// function name. Recover the mapping from prior assistant turns.
		let mut call_names: HashMap<String, String> = HashMap::new();
		for msg in &req.messages {
			if let completions::RequestMessage::Assistant(m) = msg {
				for call in m.tool_calls.iter().flatten() {
					call_names.insert(call.id.clone(), call.function.name.clone());
				}
			}
		}

		let system_text = req
			.messages
			.iter()
			.filter(|m| m.is_system())
			.filter_map(|m| m.text())
			.collect::<Vec<_>>()
			.join("\n");

		let mut contents: Vec<gemini::Content> = Vec::new();
		for msg in req.messages.iter().filter(|m| !m.is_system()) {
			match msg {
				completions::RequestMessage::User(m) => {
					let parts = user_parts(&m.content);
					if !parts.is_empty() {
						contents.push(gemini::Content {
							role: Some("user".to_string()),
							parts,
						});
					}
				},
				completions::RequestMessage::Tool(m) => {
					let name = call_names
						.get(&m.tool_call_id)
						.cloned()
						.unwrap_or_else(|| m.tool_call_id.clone());
					contents.push(gemini::Content {
						role: Some("user".to_string()),
						parts: vec![gemini::Part {
							function_response: Some(gemini::FunctionResponse {
								name,
								response: serde_json::json!({
									"result": m.content.as_text().unwrap_or_default()
								}),
							}),
							..Default::default()
						}],
					});
				},
				completions::RequestMessage::Assistant(m) => {
					let mut parts = Vec::new();
					if let Some(text) = m.content.as_ref().and_then(|c| c.as_text()) {
						parts.push(gemini::Part::text(text));
					}
					for call in m.tool_calls.iter().flatten() {
						let args = serde_json::from_str(&call.function.arguments)
							.unwrap_or(serde_json::Value::Object(Default::default()));
						parts.push(gemini::Part {
							function_call: Some(gemini::FunctionCall {
								name: call.function.name.clone(),
								args,
							}),
							..Default::default()
						});
					}
					if !parts.is_empty() {
						contents.push(gemini::Content {
							role: Some("model".to_string()),
							parts,
						});
					}
				},
				completions::RequestMessage::System(_) | completions::RequestMessage::Developer(_) => {},
			}
		}

		let declarations: Vec<gemini::FunctionDeclaration> = req
			.tools
			.iter()
			.flatten()
			.filter(|t| t.is_function())
			.filter_map(|t| t.function.as_ref())
			.map(|f| {
				let parameters = f.parameters.clone().map(|mut schema| {
					scrub_schema_for_gemini(&mut schema);
					schema
				});
				gemini::FunctionDeclaration {
					name: f.name.clone(),
					description: f.description.clone(),
					parameters,
				}
			})
			.collect();

		let tool_config = req.tool_choice.as_ref().map(|choice| {
			let (mode, allowed) = match choice {
				completions::ToolChoiceOption::Mode(completions::ToolChoiceMode::Auto) => {
					(gemini::FunctionCallingMode::Auto, None)
				},
				completions::ToolChoiceOption::Mode(completions::ToolChoiceMode::Required) => {
					(gemini::FunctionCallingMode::Any, None)
				},
				completions::ToolChoiceOption::Mode(completions::ToolChoiceMode::None) => {
					(gemini::FunctionCallingMode::None, None)
				},
				completions::ToolChoiceOption::Named(named) => (
					gemini::FunctionCallingMode::Any,
					Some(vec![named.function.name.clone()]),
				),
			};
			gemini::ToolConfig {
				function_calling_config: gemini::FunctionCallingConfig {
					mode,
					allowed_function_names: allowed,
				},
			}
		});

		// Structured output: response_schema preserves the caller's property
		// insertion order, which is semantic on this provider.
		let (response_mime_type, response_schema) = match &req.response_format {
			Some(completions::ResponseFormat::JsonObject) => {
				(Some("application/json".to_string()), None)
			},
			Some(completions::ResponseFormat::JsonSchema { json_schema }) => {
				let mut schema = json_schema.schema.clone();
				scrub_schema_for_gemini(&mut schema);
				(Some("application/json".to_string()), Some(schema))
			},
			_ => (None, None),
		};

		let thinking_config = match (&req.thinking, req.reasoning_effort) {
			(Some(completions::ThinkingInput::Enabled { budget_tokens }), _) => {
				Some(gemini::ThinkingConfig {
					thinking_budget: Some(*budget_tokens),
					include_thoughts: Some(true),
				})
			},
			(_, Some(effort)) if effort != completions::ReasoningEffort::None => {
				Some(gemini::ThinkingConfig {
					thinking_budget: None,
					include_thoughts: Some(true),
				})
			},
			_ => None,
		};

		let generation_config = gemini::GenerationConfig {
			temperature: req.temperature,
			top_p: req.top_p,
			top_k: req.top_k,
			candidate_count: req.n,
			max_output_tokens: req.max_output_tokens(),
			stop_sequences: {
				let stops = req.stop_sequences();
				(!stops.is_empty()).then_some(stops)
			},
			response_mime_type,
			response_schema,
			thinking_config,
		};

		Ok(gemini::Request {
			contents,
			system_instruction: (!system_text.is_empty()).then(|| gemini::Content {
				role: None,
				parts: vec![gemini::Part::text(system_text)],
			}),
			tools: (!declarations.is_empty()).then(|| {
				vec![gemini::Tool {
					function_declarations: Some(declarations),
					google_search: None,
				}]
			}),
			tool_config,
			generation_config: Some(generation_config),
			safety_settings: None,
		})
	}

	fn user_parts(content: &completions::Content) -> Vec<gemini::Part> {
		content
			.parts()
			.into_iter()
			.filter_map(|part| match part {
				completions::ContentPart::Text { text } => Some(gemini::Part::text(text)),
				completions::ContentPart::ImageUrl { image_url } => {
					if let Some((mime_type, data)) = image_url.as_data_url() {
						Some(gemini::Part {
							inline_data: Some(gemini::Blob { mime_type, data }),
							..Default::default()
						})
					} else {
						Some(gemini::Part {
							file_data: Some(gemini::FileData {
								mime_type: "image/*".to_string(),
								file_uri: image_url.url,
							}),
							..Default::default()
						})
					}
				},
				completions::ContentPart::InputAudio { input_audio } => Some(gemini::Part {
					inline_data: Some(gemini::Blob {
						mime_type: format!("audio/{}", input_audio.format),
						data: input_audio.data,
					}),
					..Default::default()
				}),
				_ => None,
			})
			.collect()
	}

	pub fn translate_response(
		bytes: &Bytes,
		request_model: &str,
	) -> Result<Box<dyn ResponseType>, AIError> {
		let resp = serde_json::from_slice::<gemini::Response>(bytes)
			.map_err(AIError::ResponseParsing)?;
		Ok(Box::new(translate_response_internal(resp, request_model)))
	}

	fn translate_response_internal(
		resp: gemini::Response,
		request_model: &str,
	) -> completions::Response {
		let mut choices = Vec::new();
		for candidate in resp.candidates {
			let mut content = None;
			let mut reasoning_content: Option<String> = None;
			let mut tool_calls = Vec::new();
			for part in candidate.content.iter().flat_map(|c| c.parts.iter()) {
				if let Some(text) = &part.text {
					if part.thought.unwrap_or(false) {
						reasoning_content
							.get_or_insert_with(String::new)
							.push_str(text);
					} else {
						content = Some(text.clone());
					}
				}
				if let Some(call) = &part.function_call {
					// Numeric tool indexes; mint deterministic ids for the
					// OpenAI surface.
					let id = tool_call_id(tool_calls.len(), &call.name);
					tool_calls.push(completions::MessageToolCall {
						id,
						r#type: "function".to_string(),
						function: completions::FunctionCall {
							name: call.name.clone(),
							arguments: serde_json::to_string(&call.args).unwrap_or_default(),
						},
					});
				}
			}
			let finish_reason = if !tool_calls.is_empty() {
				Some(FinishReason::ToolCalls)
			} else {
				candidate
					.finish_reason
					.as_deref()
					.map(translate_finish_reason)
			};
			choices.push(completions::ChatChoice {
				index: candidate.index,
				message: completions::ResponseMessage {
					role: completions::Role::Assistant,
					content,
					tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
					reasoning_content,
					thinking_blocks: None,
					refusal: None,
					audio: None,
				},
				finish_reason,
				logprobs: None,
			});
		}

		completions::Response {
			id: resp
				.response_id
				.unwrap_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4())),
			object: "chat.completion".to_string(),
			created: chrono::Utc::now().timestamp() as u64,
			model: resp
				.model_version
				.unwrap_or_else(|| request_model.to_string()),
			choices,
			usage: resp.usage_metadata.as_ref().map(usage_to_openai),
			service_tier: None,
			system_fingerprint: None,
			hidden: Default::default(),
		}
	}

	fn usage_to_openai(u: &gemini::UsageMetadata) -> completions::Usage {
		let mut usage = completions::Usage::new(
			u.prompt_token_count,
			u.candidates_token_count,
			u.thoughts_token_count,
		);
		if u.cached_content_token_count > 0 {
			usage.prompt_tokens_details = Some(completions::PromptTokensDetails {
				cached_tokens: u.cached_content_token_count,
				..Default::default()
			});
		}
		usage
	}

	fn translate_finish_reason(reason: &str) -> FinishReason {
		match reason {
			"STOP" => FinishReason::Stop,
			"MAX_TOKENS" => FinishReason::Length,
			"SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" => FinishReason::ContentFilter,
			_ => FinishReason::Stop,
		}
	}

	pub fn translate_error(bytes: &Bytes) -> Result<Bytes, AIError> {
		let res = serde_json::from_slice::<gemini::ErrorResponse>(bytes)
			.map_err(AIError::ResponseParsing)?;
		let m = completions::ChatCompletionErrorResponse {
			error: completions::ChatCompletionError {
				r#type: res.error.status,
				message: res.error.message,
				param: None,
				code: Some(res.error.code.to_string()),
			},
		};
		Ok(Bytes::from(
			serde_json::to_vec(&m).map_err(AIError::ResponseMarshal)?,
		))
	}

	/// Translate a Gemini SSE stream (frames are whole `Response` objects
	/// carrying incremental parts) into unified chunks.
	pub fn translate_stream(
		b: Body,
		buffer_limit: usize,
		log: AsyncLog<LLMInfo>,
		request_model: &str,
	) -> Body {
		let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
		let created = chrono::Utc::now().timestamp() as u64;
		let request_model = request_model.to_string();
		let mut sent_role = false;
		let mut saw_token = false;
		let mut emitted_any = false;
		let mut tool_index = 0u32;
		parse::sse::json_transform::<gemini::Response, completions::StreamResponse>(
			b,
			buffer_limit,
			move |f| {
				let Some(f) = f else {
					if emitted_any {
						return None;
					}
					// Empty stream: one terminal chunk, zero usage.
					return Some(completions::StreamResponse {
						id: id.clone(),
						object: completions::CHUNK_OBJECT.to_string(),
						created,
						model: request_model.clone(),
						choices: vec![completions::ChatChoiceStream {
							index: 0,
							delta: completions::StreamResponseDelta {
								role: Some(completions::Role::Assistant),
								..Default::default()
							},
							finish_reason: Some(completions::FinishReason::Stop),
							logprobs: None,
						}],
						usage: Some(completions::Usage::new(0, 0, 0)),
						service_tier: None,
						system_fingerprint: None,
					});
				};
				emitted_any = true;
				let f = f.ok()?;
				let model = f
					.model_version
					.clone()
					.unwrap_or_else(|| request_model.clone());
				if !saw_token {
					saw_token = true;
					log.non_atomic_mutate(|r| {
						r.response.first_token = Some(Instant::now());
						r.response.provider_model = Some(strng::new(&model));
					});
				}

				let candidate = f.candidates.into_iter().next();
				let mut delta = completions::StreamResponseDelta::default();
				let mut finish_reason = None;
				if let Some(c) = &candidate {
					for part in c.content.iter().flat_map(|c| c.parts.iter()) {
						if let Some(text) = &part.text {
							if part.thought.unwrap_or(false) {
								delta.reasoning_content = Some(
									delta.reasoning_content.take().unwrap_or_default() + text,
								);
							} else {
								delta.content =
									Some(delta.content.take().unwrap_or_default() + text);
							}
						}
						if let Some(call) = &part.function_call {
							let idx = tool_index;
							tool_index += 1;
							delta.tool_calls.get_or_insert_with(Vec::new).push(
								completions::ToolCallDelta {
									index: idx,
									id: Some(tool_call_id(idx as usize, &call.name)),
									r#type: Some("function".to_string()),
									function: Some(completions::FunctionCallDelta {
										name: Some(call.name.clone()),
										arguments: Some(
											serde_json::to_string(&call.args).unwrap_or_default(),
										),
									}),
								},
							);
						}
					}
					finish_reason = if delta.tool_calls.is_some() {
						c.finish_reason
							.as_ref()
							.map(|_| completions::FinishReason::ToolCalls)
					} else {
						c.finish_reason
							.as_deref()
							.map(translate_finish_reason)
					};
				}

				if !sent_role {
					sent_role = true;
					delta.role = Some(completions::Role::Assistant);
				}

				let usage = f.usage_metadata.as_ref().map(usage_to_openai);
				if let Some(u) = &usage {
					let u = u.clone();
					log.non_atomic_mutate(move |r| {
						r.response.input_tokens = Some(u.prompt_tokens);
						r.response.output_tokens = Some(u.completion_tokens);
						r.response.total_tokens = Some(u.total_tokens);
						r.response.usage = Some(u);
					});
				}

				Some(completions::StreamResponse {
					id: id.clone(),
					object: completions::CHUNK_OBJECT.to_string(),
					created,
					model,
					choices: vec![completions::ChatChoiceStream {
						index: 0,
						delta,
						finish_reason,
						logprobs: None,
					}],
					// Usage rides only the terminal frame, which is the one
					// carrying finish_reason on this provider.
					usage: finish_reason.is_some().then_some(usage).flatten(),
					service_tier: None,
					system_fingerprint: None,
				})
			},
		)
	}
}
