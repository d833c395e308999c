use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::BodyExt;
use parking_lot::Mutex;
use serde_json::{Value, json};

use super::*;
use crate::client::{ProviderCall, ProviderResponse};
use crate::config::Config;
use crate::telemetry::log::{LoggingSink, StdoutSink};

#[derive(Default)]
struct CaptureSink(Mutex<Vec<LoggingRecord>>);

impl LoggingSink for CaptureSink {
	fn name(&self) -> &'static str {
		"capture"
	}
	fn emit(&self, record: &LoggingRecord) {
		self.0.lock().push(record.clone());
	}
}

/// Transport returning canned responses; used so pipeline tests never touch
/// the network.
struct FakeTransport {
	calls: AtomicU32,
	responses: Mutex<Vec<(StatusCode, &'static str)>>,
}

impl FakeTransport {
	fn returning(responses: Vec<(StatusCode, &'static str)>) -> Arc<FakeTransport> {
		Arc::new(FakeTransport {
			calls: AtomicU32::new(0),
			responses: Mutex::new(responses),
		})
	}
}

#[async_trait::async_trait]
impl crate::client::Transport for FakeTransport {
	async fn dispatch(
		&self,
		_provider: Strng,
		_call: ProviderCall,
	) -> Result<ProviderResponse, GatewayError> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		let mut responses = self.responses.lock();
		let (status, body) = if responses.len() > 1 {
			responses.remove(0)
		} else {
			responses[0]
		};
		Ok(ProviderResponse {
			status,
			headers: HeaderMap::new(),
			body: Body::from(body),
		})
	}
}

const CHAT_OK: &str = r#"{
	"id": "chatcmpl-1",
	"object": "chat.completion",
	"created": 1700000000,
	"model": "gpt-4o",
	"choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
	"usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12}
}"#;

const CONFIG: &str = r#"
model_list:
  - model_name: gpt-4o
    litellm_params:
      model: openai/gpt-4o
      api_key: sk-test
    model_info:
      input_cost_per_token: 0.000001
      output_cost_per_token: 0.000002
router_settings:
  num_retries: 1
guardrails:
  - guardrail_name: ssn-block
    litellm_params:
      guardrail: regex
      mode: pre_call
      default_on: true
      action: reject
      rules:
        - builtin: ssn
"#;

fn gateway(transport: Arc<FakeTransport>) -> (Gateway, Arc<CaptureSink>) {
	let cfg = Config::parse(CONFIG).unwrap();
	let mut gw = Gateway::from_config(cfg, transport).unwrap();
	let sink = Arc::new(CaptureSink::default());
	gw.logs = LogDispatcher::spawn(vec![
		sink.clone() as Arc<dyn LoggingSink>,
		Arc::new(StdoutSink) as Arc<dyn LoggingSink>,
	]);
	(gw, sink)
}

fn ctx() -> CallContext {
	CallContext::new(HeaderMap::new(), Duration::from_secs(600))
}

fn chat_request(content: &str) -> completions::Request {
	serde_json::from_value(json!({
		"model": "gpt-4o",
		"messages": [{"role": "user", "content": content}],
	}))
	.unwrap()
}

async fn body_json(resp: Response) -> Value {
	let bytes = resp.into_body().collect().await.unwrap().to_bytes();
	serde_json::from_slice(&bytes).unwrap()
}

async fn emitted(sink: &CaptureSink) -> Vec<LoggingRecord> {
	tokio::time::sleep(Duration::from_millis(50)).await;
	sink.0.lock().clone()
}

#[tokio::test]
async fn happy_path_emits_exactly_one_record_with_cost() {
	let transport = FakeTransport::returning(vec![(StatusCode::OK, CHAT_OK)]);
	let (gw, sink) = gateway(transport.clone());

	let resp = gw.chat_completions(ctx(), chat_request("hello")).await;
	assert_eq!(resp.status(), StatusCode::OK);
	let cost_header = resp
		.headers()
		.get(RESPONSE_COST_HEADER)
		.and_then(|v| v.to_str().ok())
		.unwrap()
		.to_string();
	let v = body_json(resp).await;
	assert_eq!(v["choices"][0]["message"]["content"], "hi");
	assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

	let records = emitted(&sink).await;
	assert_eq!(records.len(), 1);
	let record = &records[0];
	assert!(!record.call_id.is_empty());
	assert!(record.request_ts.is_some());
	assert!(record.response_ts.is_some());
	assert_eq!(record.deployment_id.as_str(), "openai/gpt-4o#0");
	assert_eq!(record.usage.as_ref().unwrap().total_tokens, 12);
	// 10 input at 1e-6 plus 2 output at 2e-6.
	let want = 10.0 * 1e-6 + 2.0 * 2e-6;
	assert!((record.cost.total - want).abs() < 1e-12);
	let parsed: f64 = cost_header.parse().unwrap();
	assert!((parsed - want).abs() < 1e-8);
}

#[tokio::test]
async fn guardrail_block_short_circuits_before_upstream() {
	let transport = FakeTransport::returning(vec![(StatusCode::OK, CHAT_OK)]);
	let (gw, sink) = gateway(transport.clone());

	let resp = gw
		.chat_completions(ctx(), chat_request("my ssn is 123-45-6789"))
		.await;
	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
	let v = body_json(resp).await;
	assert_eq!(v["error"]["type"], "ContentFiltered");
	assert!(v["error"]["message"].as_str().unwrap().contains("ssn-block"));

	// No provider call was made.
	assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

	let records = emitted(&sink).await;
	assert_eq!(records.len(), 1);
	let record = &records[0];
	assert_eq!(record.guardrail_results[0].action.as_str(), "blocked");
	assert_eq!(record.cost.total, 0.0);
	assert_eq!(record.error.as_deref(), Some("ContentFiltered"));
}

#[tokio::test(start_paused = true)]
async fn transient_provider_errors_retry_then_succeed() {
	let transport = FakeTransport::returning(vec![
		(StatusCode::TOO_MANY_REQUESTS, r#"{"error": {"message": "slow down", "type": "rate_limit_error"}}"#),
		(StatusCode::OK, CHAT_OK),
	]);
	let (gw, sink) = gateway(transport.clone());

	let resp = gw.chat_completions(ctx(), chat_request("hello")).await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(transport.calls.load(Ordering::SeqCst), 2);

	let records = emitted(&sink).await;
	assert_eq!(records.len(), 1);
	assert_eq!(records[0].retries, 1);
	assert_eq!(records[0].fallback_chain.len(), 2);
}

#[tokio::test]
async fn unsupported_params_rejected_without_drop_params() {
	let transport = FakeTransport::returning(vec![(StatusCode::OK, CHAT_OK)]);
	let (gw, sink) = gateway(transport.clone());

	let req: completions::Request = serde_json::from_value(json!({
		"model": "gpt-4o",
		"messages": [{"role": "user", "content": "hi"}],
		"fancy_new_param": true
	}))
	.unwrap();
	let resp = gw.chat_completions(ctx(), req).await;
	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
	assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
	let records = emitted(&sink).await;
	assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn streaming_response_finalizes_record_at_stream_end() {
	let stream_body = concat!(
		"data: {\"id\":\"chatcmpl-s\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"he\"},\"finish_reason\":null}]}\n\n",
		"data: {\"id\":\"chatcmpl-s\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"llo\"},\"finish_reason\":null}]}\n\n",
		"data: {\"id\":\"chatcmpl-s\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2,\"total_tokens\":6}}\n\n",
		"data: [DONE]\n\n",
	);
	let transport = FakeTransport::returning(vec![(StatusCode::OK, stream_body)]);
	let (gw, sink) = gateway(transport.clone());

	let mut req = chat_request("hello");
	req.stream = Some(true);
	let resp = gw.chat_completions(ctx(), req).await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(
		resp.headers().get(header::CONTENT_TYPE).unwrap(),
		"text/event-stream"
	);
	// Byte-exact passthrough for OpenAI-native streams, [DONE] included.
	let bytes = resp.into_body().collect().await.unwrap().to_bytes();
	assert_eq!(std::str::from_utf8(&bytes).unwrap(), stream_body);

	let records = emitted(&sink).await;
	assert_eq!(records.len(), 1);
	let record = &records[0];
	assert_eq!(record.usage.as_ref().unwrap().total_tokens, 6);
	assert!(record.error.is_none());
	assert!(record.cost.total > 0.0);
}

/// Transport whose response stream delivers one chunk and then hangs,
/// standing in for a provider mid-stream while the client goes away.
struct HangingStreamTransport {
	calls: AtomicU32,
	first: &'static str,
}

#[async_trait::async_trait]
impl crate::client::Transport for HangingStreamTransport {
	async fn dispatch(
		&self,
		_provider: Strng,
		_call: ProviderCall,
	) -> Result<ProviderResponse, GatewayError> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		let first = self.first;
		let body = Body::from_stream(async_stream::stream! {
			yield Ok::<_, axum::Error>(Bytes::from_static(first.as_bytes()));
			futures_util::future::pending::<()>().await;
		});
		Ok(ProviderResponse {
			status: StatusCode::OK,
			headers: HeaderMap::new(),
			body,
		})
	}
}

#[tokio::test]
async fn client_cancel_after_first_byte_emits_cancelled_record() {
	let transport = Arc::new(HangingStreamTransport {
		calls: AtomicU32::new(0),
		first: "data: {\"id\":\"chatcmpl-c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"hello there\"},\"finish_reason\":null}]}\n\n",
	});
	let cfg = Config::parse(CONFIG).unwrap();
	let mut gw = Gateway::from_config(cfg, transport.clone()).unwrap();
	let sink = Arc::new(CaptureSink::default());
	gw.logs = LogDispatcher::spawn(vec![sink.clone() as Arc<dyn LoggingSink>]);

	let mut req = chat_request("hello");
	req.stream = Some(true);
	let resp = gw.chat_completions(ctx(), req).await;
	assert_eq!(resp.status(), StatusCode::OK);

	// Receive the first frame, then hang up.
	let mut body = resp.into_body().into_data_stream();
	let first = body.next().await.expect("first frame").expect("frame ok");
	assert!(std::str::from_utf8(&first).unwrap().starts_with("data:"));
	drop(body);

	let records = emitted(&sink).await;
	assert_eq!(records.len(), 1);
	let record = &records[0];
	assert_eq!(record.error.as_deref(), Some("ClientCancelled"));
	// No retry once bytes reached the client.
	assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
	// Partial usage: the delivered prefix was still counted.
	let usage = record.usage.as_ref().expect("partial usage");
	assert!(usage.completion_tokens > 0);
}

#[tokio::test]
async fn model_level_guardrails_apply_without_opt_in() {
	// `email-block` is not default-on; it runs because the deployment
	// attaches it at model level.
	let config = r#"
model_list:
  - model_name: gpt-4o
    litellm_params:
      model: openai/gpt-4o
      api_key: sk-test
      guardrails: [email-block]
guardrails:
  - guardrail_name: email-block
    litellm_params:
      guardrail: regex
      mode: pre_call
      action: reject
      rules:
        - builtin: email
"#;
	let cfg = Config::parse(config).unwrap();
	let transport = FakeTransport::returning(vec![(StatusCode::OK, CHAT_OK)]);
	let mut gw = Gateway::from_config(cfg, transport.clone()).unwrap();
	let sink = Arc::new(CaptureSink::default());
	gw.logs = LogDispatcher::spawn(vec![sink.clone() as Arc<dyn LoggingSink>]);

	let resp = gw
		.chat_completions(ctx(), chat_request("reach me at alice@example.com"))
		.await;
	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
	assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
	let records = emitted(&sink).await;
	assert_eq!(records.len(), 1);
	assert_eq!(records[0].guardrail_results[0].name.as_str(), "email-block");
	assert_eq!(records[0].guardrail_results[0].action.as_str(), "blocked");

	// A plain request passes through: the model-level attachment is the only
	// guardrail and it finds nothing.
	let resp = gw.chat_completions(ctx(), chat_request("hello")).await;
	assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn mcp_tool_cost_is_attributed() {
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/mcp"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"jsonrpc": "2.0",
			"id": "1",
			"result": {"content": [{"type": "text", "text": "42"}], "isError": false}
		})))
		.mount(&server)
		.await;

	let config = format!(
		r#"
mcp_servers:
  - server_name: deepwiki
    transport: http
    url: {}/mcp
    tool_cost:
      - tool: ask_question
        cost_per_call: 0.01
"#,
		server.uri()
	);
	let cfg = Config::parse(&config).unwrap();
	let transport = FakeTransport::returning(vec![(StatusCode::OK, CHAT_OK)]);
	let mut gw = Gateway::from_config(cfg, transport).unwrap();
	let sink = Arc::new(CaptureSink::default());
	gw.logs = LogDispatcher::spawn(vec![sink.clone() as Arc<dyn LoggingSink>]);

	let caller = McpCaller::default();
	let result = gw
		.mcp_call_tool(ctx(), &caller, "deepwiki-ask_question", Some(json!({"q": "?"})))
		.await
		.expect("tool call should succeed");
	assert_eq!(result.is_error, Some(false));

	let records = emitted(&sink).await;
	assert_eq!(records.len(), 1);
	let record = &records[0];
	assert_eq!(record.mcp_server_id.as_deref(), Some("deepwiki"));
	assert_eq!(record.mcp_tool_name.as_deref(), Some("ask_question"));
	assert!((record.cost.tool_calls - 0.01).abs() < 1e-12);
	assert!((record.cost.total - 0.01).abs() < 1e-12);
	// SpendStore saw the same single record.
	let spent = gw.spend.get_spend(
		&crate::store::SpendScope::Key("nope".to_string()),
		Duration::from_secs(60),
	);
	assert_eq!(spent, 0.0);
}
