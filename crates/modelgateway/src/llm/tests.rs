use http_body_util::BodyExt;
use serde_json::{Value, json};

use super::*;
use crate::http::Body;
use crate::llm::types::completions;
use crate::parse::sse::Parser;

fn full_completions_request() -> types::completions::Request {
	serde_json::from_value(json!({
		"model": "claude-sonnet-4-5",
		"messages": [
			{"role": "system", "content": "be terse"},
			{"role": "system", "content": "answer in english"},
			{"role": "user", "content": "weather in Tokyo?"},
			{"role": "assistant", "tool_calls": [
				{"id": "toolu_1", "type": "function", "function": {"name": "get_weather", "arguments": "{\"location\":\"Tokyo\"}"}}
			]},
			{"role": "tool", "tool_call_id": "toolu_1", "content": "sunny, 21C"}
		],
		"max_tokens": 512,
		"temperature": 0.2,
		"stop": ["END"],
		"tools": [
			{"type": "function", "function": {
				"name": "get_weather",
				"description": "look up weather",
				"parameters": {
					"$schema": "http://json-schema.org/draft-07/schema#",
					"type": "object",
					"properties": {"location": {"type": "string"}}
				}
			}}
		],
		"tool_choice": "auto"
	}))
	.unwrap()
}

async fn collect_chunks(body: Body) -> Vec<completions::StreamResponse> {
	let bytes = body.collect().await.unwrap().to_bytes();
	let mut parser = Parser::default();
	parser.push(&bytes);
	let mut out = Vec::new();
	while let Some(event) = parser.next_event() {
		if event.data.is_empty() || event.is_done() {
			continue;
		}
		out.push(serde_json::from_str(&event.data).unwrap());
	}
	out
}

#[test]
fn passthrough_request_is_identity() {
	let raw = json!({
		"model": "gpt-4o",
		"messages": [
			{"role": "system", "content": "be terse"},
			{"role": "user", "content": [
				{"type": "text", "text": "what is this"},
				{"type": "image_url", "image_url": {"url": "https://example.com/cat.png"}}
			]}
		],
		"temperature": 0.5,
		"top_p": 0.9,
		"stream": false,
		"response_format": {"type": "json_schema", "json_schema": {"name": "out", "schema": {"type": "object"}, "strict": true}},
		"reasoning_effort": "high"
	});
	let req: types::completions::Request = serde_json::from_value(raw.clone()).unwrap();
	let bytes = req.to_openai().unwrap();
	let back: Value = serde_json::from_slice(&bytes).unwrap();
	assert_eq!(raw, back);
}

#[test]
fn completions_to_messages_request() {
	let req = full_completions_request();
	let bytes = req.to_anthropic().unwrap();
	let v: Value = serde_json::from_slice(&bytes).unwrap();

	// Both system messages collapse into the top-level system field.
	assert_eq!(v["system"], "be terse\nanswer in english");
	// Tool result becomes a user-side tool_result block referencing the id.
	let messages = v["messages"].as_array().unwrap();
	assert_eq!(messages[0]["role"], "user");
	assert_eq!(messages[1]["role"], "assistant");
	assert_eq!(messages[1]["content"][0]["type"], "tool_use");
	assert_eq!(messages[1]["content"][0]["id"], "toolu_1");
	assert_eq!(messages[2]["content"][0]["type"], "tool_result");
	assert_eq!(messages[2]["content"][0]["tool_use_id"], "toolu_1");
	// Schema keywords the provider rejects are scrubbed, idempotently.
	assert!(v["tools"][0]["input_schema"].get("$schema").is_none());
	assert_eq!(v["tools"][0]["input_schema"]["type"], "object");
	assert_eq!(v["max_tokens"], 512);
	assert_eq!(v["stop_sequences"][0], "END");
	assert_eq!(v["tool_choice"]["type"], "auto");
}

#[test]
fn messages_response_preserves_tool_calls() {
	let provider_response = json!({
		"id": "msg_9",
		"type": "message",
		"role": "assistant",
		"content": [
			{"type": "text", "text": "checking"},
			{"type": "tool_use", "id": "toolu_9", "name": "get_weather", "input": {"location": "Tokyo"}}
		],
		"model": "claude-sonnet-4-5",
		"stop_reason": "tool_use",
		"stop_sequence": null,
		"usage": {"input_tokens": 17, "output_tokens": 40}
	});
	let bytes = bytes::Bytes::from(serde_json::to_vec(&provider_response).unwrap());
	let resp = conversion::messages::from_completions::translate_response(&bytes).unwrap();
	let v: Value = serde_json::from_slice(&resp.serialize().unwrap()).unwrap();

	assert_eq!(v["choices"][0]["finish_reason"], "tool_calls");
	let call = &v["choices"][0]["message"]["tool_calls"][0];
	assert_eq!(call["id"], "toolu_9");
	assert_eq!(call["function"]["name"], "get_weather");
	let args: Value = serde_json::from_str(call["function"]["arguments"].as_str().unwrap()).unwrap();
	assert_eq!(args, json!({"location": "Tokyo"}));
	// usage invariant holds after translation
	assert_eq!(v["usage"]["total_tokens"], 57);
}

#[test]
fn messages_response_surfaces_thinking() {
	let provider_response = json!({
		"id": "msg_t",
		"type": "message",
		"role": "assistant",
		"content": [
			{"type": "thinking", "thinking": "let me reason", "signature": "sig=="},
			{"type": "redacted_thinking", "data": "opaque-bytes"},
			{"type": "text", "text": "answer"}
		],
		"model": "claude-sonnet-4-5",
		"stop_reason": "end_turn",
		"stop_sequence": null,
		"usage": {"input_tokens": 5, "output_tokens": 9}
	});
	let bytes = bytes::Bytes::from(serde_json::to_vec(&provider_response).unwrap());
	let resp = conversion::messages::from_completions::translate_response(&bytes).unwrap();
	let v: Value = serde_json::from_slice(&resp.serialize().unwrap()).unwrap();

	let msg = &v["choices"][0]["message"];
	assert_eq!(msg["reasoning_content"], "let me reason");
	assert_eq!(msg["thinking_blocks"][0]["type"], "thinking");
	assert_eq!(msg["thinking_blocks"][0]["signature"], "sig==");
	// Redacted blocks are preserved verbatim.
	assert_eq!(msg["thinking_blocks"][1]["type"], "redacted_thinking");
	assert_eq!(msg["thinking_blocks"][1]["data"], "opaque-bytes");
	assert_eq!(msg["content"], "answer");
}

#[tokio::test]
async fn messages_stream_to_completions_chunks() {
	// The streaming tool-call scenario: role chunk first, argument fragments
	// that concatenate to well-formed JSON, terminal chunk carrying
	// finish_reason and usage.
	let input = concat!(
		"event: message_start\n",
		"data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"type\":\"message\",\"role\":\"assistant\",\"content\":[],\"model\":\"claude-sonnet-4-5\",\"stop_reason\":null,\"stop_sequence\":null,\"usage\":{\"input_tokens\":10,\"output_tokens\":1}}}\n\n",
		"event: content_block_start\n",
		"data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_1\",\"name\":\"get_weather\",\"input\":{}}}\n\n",
		"event: content_block_delta\n",
		"data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"location\\\":\"}}\n\n",
		"event: content_block_delta\n",
		"data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"\\\"Tokyo\\\"}\"}}\n\n",
		"event: message_delta\n",
		"data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\",\"stop_sequence\":null},\"usage\":{\"output_tokens\":15}}\n\n",
		"event: message_stop\n",
		"data: {\"type\":\"message_stop\"}\n\n",
	);
	let log = AsyncLog::default();
	log.store(Some(LLMInfo::new(
		LLMRequest {
			input_tokens: None,
			input_format: InputFormat::Completions,
			request_model: strng::literal!("claude-sonnet-4-5"),
			provider: strng::literal!("anthropic"),
			streaming: true,
			params: Default::default(),
		},
		Default::default(),
	)));
	let body = conversion::messages::from_completions::translate_stream(
		Body::from(input),
		0,
		log.clone(),
	);
	let chunks = collect_chunks(body).await;

	// Stable id across every chunk.
	assert!(chunks.iter().all(|c| c.id == "msg_1"));
	assert!(chunks.iter().all(|c| c.object == "chat.completion.chunk"));
	// Role appears only on the first delta.
	assert_eq!(
		chunks[0].choices[0].delta.role,
		Some(completions::Role::Assistant)
	);
	assert!(
		chunks[1..]
			.iter()
			.all(|c| c.choices.first().map(|ch| ch.delta.role.is_none()).unwrap_or(true))
	);
	// Argument fragments concatenate to well-formed JSON under one index.
	let args: String = chunks
		.iter()
		.flat_map(|c| c.choices.iter())
		.flat_map(|ch| ch.delta.tool_calls.iter().flatten())
		.filter(|tc| tc.index == 0)
		.filter_map(|tc| tc.function.as_ref().and_then(|f| f.arguments.clone()))
		.collect();
	assert_eq!(
		serde_json::from_str::<Value>(&args).unwrap(),
		json!({"location": "Tokyo"})
	);
	// finish_reason only on the terminal chunk, together with usage.
	let terminal = chunks.last().unwrap();
	assert_eq!(
		terminal.choices[0].finish_reason,
		Some(completions::FinishReason::ToolCalls)
	);
	let usage = terminal.usage.as_ref().unwrap();
	assert_eq!(usage.prompt_tokens, 10);
	assert_eq!(usage.completion_tokens, 15);
	assert_eq!(usage.total_tokens, 25);
	assert!(
		chunks[..chunks.len() - 1]
			.iter()
			.all(|c| c.choices.iter().all(|ch| ch.finish_reason.is_none()))
	);
	// The log cell saw the same usage.
	let info = log.take().unwrap();
	assert_eq!(info.response.output_tokens, Some(15));
}

#[tokio::test]
async fn empty_stream_yields_single_terminal_chunk() {
	let log = AsyncLog::default();
	let body =
		conversion::messages::from_completions::translate_stream(Body::from(""), 0, log);
	let chunks = collect_chunks(body).await;
	assert_eq!(chunks.len(), 1);
	let only = &chunks[0];
	assert_eq!(
		only.choices[0].finish_reason,
		Some(completions::FinishReason::Stop)
	);
	assert_eq!(only.usage.as_ref().unwrap().total_tokens, 0);
}

#[tokio::test]
async fn stream_whitespace_is_preserved() {
	// Deltas with leading/trailing spaces must come through byte-exact.
	let input = concat!(
		"event: message_start\n",
		"data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_2\",\"type\":\"message\",\"role\":\"assistant\",\"content\":[],\"model\":\"m\",\"stop_reason\":null,\"stop_sequence\":null,\"usage\":{\"input_tokens\":1,\"output_tokens\":0}}}\n\n",
		"event: content_block_delta\n",
		"data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"  hello \"}}\n\n",
		"event: content_block_delta\n",
		"data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" world  \"}}\n\n",
	);
	let log = AsyncLog::default();
	let body = conversion::messages::from_completions::translate_stream(
		Body::from(input),
		0,
		log,
	);
	let chunks = collect_chunks(body).await;
	let text: String = chunks
		.iter()
		.flat_map(|c| c.choices.iter())
		.filter_map(|ch| ch.delta.content.clone())
		.collect();
	assert_eq!(text, "  hello  world  ");
}

#[test]
fn completions_to_gemini_request() {
	let req = full_completions_request();
	let bytes = req.to_gemini().unwrap();
	let v: Value = serde_json::from_slice(&bytes).unwrap();

	assert_eq!(
		v["systemInstruction"]["parts"][0]["text"],
		"be terse\nanswer in english"
	);
	let contents = v["contents"].as_array().unwrap();
	assert_eq!(contents[0]["role"], "user");
	assert_eq!(contents[1]["role"], "model");
	assert_eq!(
		contents[1]["parts"][0]["functionCall"]["name"],
		"get_weather"
	);
	// Tool results bridge back by call id to the function name.
	assert_eq!(
		contents[2]["parts"][0]["functionResponse"]["name"],
		"get_weather"
	);
	assert_eq!(v["generationConfig"]["maxOutputTokens"], 512);
	assert_eq!(v["generationConfig"]["stopSequences"][0], "END");
	assert_eq!(
		v["tools"][0]["functionDeclarations"][0]["name"],
		"get_weather"
	);
}

#[test]
fn gemini_response_gets_deterministic_tool_ids() {
	let provider_response = json!({
		"candidates": [{
			"content": {"role": "model", "parts": [
				{"functionCall": {"name": "get_weather", "args": {"location": "Tokyo"}}}
			]},
			"finishReason": "STOP",
			"index": 0
		}],
		"usageMetadata": {"promptTokenCount": 8, "candidatesTokenCount": 3, "totalTokenCount": 11}
	});
	let bytes = bytes::Bytes::from(serde_json::to_vec(&provider_response).unwrap());
	let a = conversion::gemini::from_completions::translate_response(&bytes, "gemini-2.5-pro")
		.unwrap();
	let b = conversion::gemini::from_completions::translate_response(&bytes, "gemini-2.5-pro")
		.unwrap();
	let va: Value = serde_json::from_slice(&a.serialize().unwrap()).unwrap();
	let vb: Value = serde_json::from_slice(&b.serialize().unwrap()).unwrap();
	let id_a = va["choices"][0]["message"]["tool_calls"][0]["id"]
		.as_str()
		.unwrap();
	let id_b = vb["choices"][0]["message"]["tool_calls"][0]["id"]
		.as_str()
		.unwrap();
	assert_eq!(id_a, id_b);
	assert!(id_a.starts_with("call_0_"));
	assert_eq!(va["choices"][0]["finish_reason"], "tool_calls");
}

#[test]
fn completions_to_bedrock_request() {
	let provider = bedrock::Provider {
		model: None,
		region: strng::literal!("us-west-2"),
		guardrail_identifier: None,
		guardrail_version: None,
	};
	let req = full_completions_request();
	let bytes = req.to_bedrock(&provider).unwrap();
	let v: Value = serde_json::from_slice(&bytes).unwrap();

	assert_eq!(v["system"][0]["text"], "be terse");
	let messages = v["messages"].as_array().unwrap();
	assert_eq!(messages[0]["role"], "user");
	assert_eq!(messages[1]["content"][0]["toolUse"]["toolUseId"], "toolu_1");
	assert_eq!(
		messages[2]["content"][0]["toolResult"]["toolUseId"],
		"toolu_1"
	);
	assert_eq!(v["inferenceConfig"]["maxTokens"], 512);
	assert_eq!(
		v["toolConfig"]["tools"][0]["toolSpec"]["name"],
		"get_weather"
	);
}

#[test]
fn drop_params_policy() {
	let mut req: types::completions::Request = serde_json::from_value(json!({
		"model": "gpt-4o",
		"messages": [{"role": "user", "content": "hi"}],
		"some_vendor_param": {"a": 1}
	}))
	.unwrap();
	// Without drop_params the request is refused.
	let err = apply_drop_params(&mut req.clone(), false).unwrap_err();
	assert!(matches!(err, AIError::UnsupportedParams(_)));
	// With drop_params the unknown key is removed and the request proceeds.
	apply_drop_params(&mut req, true).unwrap();
	assert!(req.rest.is_empty());
}

#[test]
fn json_schema_coercion_for_messages_shape() {
	let req: types::completions::Request = serde_json::from_value(json!({
		"model": "claude-sonnet-4-5",
		"messages": [{"role": "user", "content": "give me json"}],
		"response_format": {"type": "json_schema", "json_schema": {
			"name": "weather", "schema": {"type": "object", "properties": {"temp": {"type": "number"}}}
		}}
	}))
	.unwrap();
	let bytes = req.to_anthropic().unwrap();
	let v: Value = serde_json::from_slice(&bytes).unwrap();
	// Structured output rides a forced tool call.
	assert_eq!(v["tool_choice"]["type"], "tool");
	assert_eq!(v["tool_choice"]["name"], "json_tool_call");
	assert_eq!(v["tools"][0]["name"], "json_tool_call");

	// And the response path folds it back into plain JSON content.
	let provider_response = json!({
		"id": "msg_3",
		"type": "message",
		"role": "assistant",
		"content": [
			{"type": "tool_use", "id": "toolu_5", "name": "json_tool_call", "input": {"temp": 21.5}}
		],
		"model": "claude-sonnet-4-5",
		"stop_reason": "tool_use",
		"stop_sequence": null,
		"usage": {"input_tokens": 4, "output_tokens": 6}
	});
	let bytes = bytes::Bytes::from(serde_json::to_vec(&provider_response).unwrap());
	let resp = conversion::messages::from_completions::translate_response(&bytes).unwrap();
	let v: Value = serde_json::from_slice(&resp.serialize().unwrap()).unwrap();
	assert_eq!(v["choices"][0]["finish_reason"], "stop");
	let content: Value =
		serde_json::from_str(v["choices"][0]["message"]["content"].as_str().unwrap()).unwrap();
	assert_eq!(content, json!({"temp": 21.5}));
}
