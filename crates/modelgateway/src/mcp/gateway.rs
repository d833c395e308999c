//! Tool discovery and invocation across configured MCP servers.

use std::borrow::Cow;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rmcp::model::{CallToolResult, Tool};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex as AsyncMutex;

use crate::http::HeaderMap;
use crate::mcp::rbac::{self, McpCaller};
use crate::mcp::{McpAuthKind, McpError, McpServerConfig, McpTransport, SessionState};
use crate::{Strng, debug, strng, warn};

/// A tool discovered on some server, namespaced for the caller.
#[derive(Debug, Clone)]
pub struct DiscoveredTool {
	pub server: Strng,
	/// `server<sep>tool` as exposed to callers.
	pub namespaced_name: String,
	pub tool: Tool,
	pub per_call_cost: f64,
}

/// Result of one tool invocation, with the cost attributed to it.
#[derive(Debug)]
pub struct ToolCallOutcome {
	pub server: Strng,
	pub tool: Strng,
	pub result: CallToolResult,
	pub cost: f64,
}

struct CachedToken {
	token: String,
	expires_at: Instant,
}

/// Margin subtracted from token lifetimes before re-fetching.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);
const STDIO_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub struct McpGateway {
	servers: HashMap<Strng, Arc<McpServerConfig>>,
	separator: String,
	http: reqwest::Client,
	oauth_tokens: AsyncMutex<HashMap<(Strng, String), CachedToken>>,
	stdio_pool: AsyncMutex<HashMap<(Strng, String), StdioSession>>,
}

impl McpGateway {
	pub fn new(
		configs: Vec<McpServerConfig>,
		separator: Option<String>,
	) -> Result<McpGateway, McpError> {
		let separator = separator.unwrap_or_else(|| crate::mcp::DEFAULT_TOOL_SEPARATOR.to_string());
		let mut servers = HashMap::new();
		for cfg in configs {
			cfg
				.validate_with_separator(&separator)
				.map_err(|e| McpError::Protocol(e.to_string()))?;
			let name = strng::new(&cfg.server_name);
			if servers.insert(name.clone(), Arc::new(cfg)).is_some() {
				return Err(McpError::Protocol(format!(
					"duplicate mcp server name: {name}"
				)));
			}
		}
		Ok(McpGateway {
			servers,
			separator,
			http: reqwest::Client::new(),
			oauth_tokens: AsyncMutex::new(HashMap::new()),
			stdio_pool: AsyncMutex::new(HashMap::new()),
		})
	}

	pub fn server(&self, name: &str) -> Option<Arc<McpServerConfig>> {
		self.servers.get(name).cloned()
	}

	/// Split a namespaced tool name back into `(server, tool)`.
	pub fn split_tool_name<'a>(&self, name: &'a str) -> Result<(Arc<McpServerConfig>, &'a str), McpError> {
		let (server, tool) = name
			.split_once(&self.separator)
			.ok_or_else(|| McpError::UnknownTool(name.to_string()))?;
		let server = self
			.servers
			.get(server)
			.ok_or_else(|| McpError::UnknownServer(server.to_string()))?;
		Ok((server.clone(), tool))
	}

	/// Aggregate tools across every server the caller may see, applying the
	/// caller's access groups, the servers' tool filters, and any
	/// `x-mcp-servers` narrowing.
	pub async fn list_tools(
		&self,
		caller: &McpCaller,
		headers: &HeaderMap,
	) -> Result<Vec<DiscoveredTool>, McpError> {
		let mut out = Vec::new();
		for (name, server) in &self.servers {
			if !rbac::selected(caller, server) {
				continue;
			}
			if rbac::authorize(caller, server).is_err() {
				continue;
			}
			let tools = match self.list_server_tools(server, caller, headers).await {
				Ok(tools) => tools,
				Err(e) => {
					// One unreachable server must not break discovery.
					warn!("failed to list tools on {name}: {e}");
					continue;
				},
			};
			for mut tool in tools {
				if !server.tool_allowed(&tool.name) {
					continue;
				}
				let per_call_cost = server.cost_for_tool(&tool.name);
				let namespaced = format!("{}{}{}", name, self.separator, tool.name);
				tool.name = Cow::Owned(namespaced.clone());
				out.push(DiscoveredTool {
					server: name.clone(),
					namespaced_name: namespaced,
					tool,
					per_call_cost,
				});
			}
		}
		Ok(out)
	}

	/// Invoke a namespaced tool. The caller's access groups are re-checked
	/// so invocation can never reach a server discovery would have hidden.
	pub async fn call_tool(
		&self,
		name: &str,
		args: Option<Value>,
		caller: &McpCaller,
		headers: &HeaderMap,
	) -> Result<ToolCallOutcome, McpError> {
		let (server, tool) = self.split_tool_name(name)?;
		rbac::authorize(caller, &server)?;
		if !server.tool_allowed(tool) {
			return Err(McpError::UnknownTool(name.to_string()));
		}

		let params = serde_json::json!({
			"name": tool,
			"arguments": args.unwrap_or(Value::Object(Default::default())),
		});
		let raw = self
			.request(&server, caller, headers, "tools/call", params)
			.await?;
		let result: CallToolResult =
			serde_json::from_value(raw).map_err(|e| McpError::Protocol(e.to_string()))?;

		let cost = server.cost_for_tool(tool);
		debug!("mcp tool {name} invoked, cost {cost}");
		Ok(ToolCallOutcome {
			server: strng::new(&server.server_name),
			tool: strng::new(tool),
			result,
			cost,
		})
	}

	async fn list_server_tools(
		&self,
		server: &Arc<McpServerConfig>,
		caller: &McpCaller,
		headers: &HeaderMap,
	) -> Result<Vec<Tool>, McpError> {
		let raw = self
			.request(server, caller, headers, "tools/list", serde_json::json!({}))
			.await?;
		#[derive(serde::Deserialize)]
		struct ListToolsResult {
			tools: Vec<Tool>,
		}
		let result: ListToolsResult =
			serde_json::from_value(raw).map_err(|e| McpError::Protocol(e.to_string()))?;
		Ok(result.tools)
	}

	/// One JSON-RPC round trip over the server's configured transport.
	async fn request(
		&self,
		server: &Arc<McpServerConfig>,
		caller: &McpCaller,
		headers: &HeaderMap,
		method: &str,
		params: Value,
	) -> Result<Value, McpError> {
		let request = serde_json::json!({
			"jsonrpc": "2.0",
			"id": uuid::Uuid::new_v4().to_string(),
			"method": method,
			"params": params,
		});
		match server.transport {
			McpTransport::Http | McpTransport::Sse => {
				self.http_request(server, caller, headers, request).await
			},
			McpTransport::Stdio => self.stdio_request(server, caller, request).await,
		}
	}

	async fn http_request(
		&self,
		server: &Arc<McpServerConfig>,
		caller: &McpCaller,
		headers: &HeaderMap,
		request: Value,
	) -> Result<Value, McpError> {
		let url = server
			.url
			.as_deref()
			.ok_or_else(|| McpError::Protocol("missing url".to_string()))?;

		let mut req = self
			.http
			.post(url)
			.header("accept", "application/json, text/event-stream")
			.json(&request);

		// Project only the headers the server opted into, then layer the
		// server's own auth on top.
		let projected = crate::http::project_headers(headers, &server.forwardable_headers);
		for (name, value) in projected.iter() {
			req = req.header(name, value);
		}
		if let Some((name, value)) = self.auth_header(server, caller).await? {
			req = req.header(name, value);
		}

		let resp = req
			.send()
			.await
			.map_err(|e| McpError::Transport(e.to_string()))?;
		if !resp.status().is_success() {
			return Err(McpError::Transport(format!(
				"server returned {}",
				resp.status()
			)));
		}
		let content_type = resp
			.headers()
			.get("content-type")
			.and_then(|v| v.to_str().ok())
			.unwrap_or_default()
			.to_string();
		let body = resp
			.bytes()
			.await
			.map_err(|e| McpError::Transport(e.to_string()))?;

		let message: Value = if content_type.starts_with("text/event-stream") {
			// Streamable HTTP servers answer single requests as a one-event
			// SSE stream.
			let mut parser = crate::parse::sse::Parser::default();
			parser.push(&body);
			let mut found = None;
			while let Some(event) = parser.next_event() {
				if !event.data.is_empty() && !event.is_done() {
					found = Some(
						serde_json::from_str(&event.data)
							.map_err(|e| McpError::Protocol(e.to_string()))?,
					);
				}
			}
			found.ok_or_else(|| McpError::Protocol("empty event stream".to_string()))?
		} else {
			serde_json::from_slice(&body).map_err(|e| McpError::Protocol(e.to_string()))?
		};
		extract_result(message)
	}

	/// Resolve the auth header for a server, performing the OAuth
	/// client-credentials exchange when configured. Tokens are cached per
	/// `(server, principal)` until expiry minus a safety margin.
	async fn auth_header(
		&self,
		server: &Arc<McpServerConfig>,
		caller: &McpCaller,
	) -> Result<Option<(String, String)>, McpError> {
		let Some(auth) = &server.auth else {
			return Ok(None);
		};
		let header = auth
			.header_name
			.clone()
			.unwrap_or_else(|| "authorization".to_string());
		match auth.kind {
			McpAuthKind::Bearer | McpAuthKind::ApiKey => {
				let token = auth
					.token
					.clone()
					.or_else(|| {
						auth
							.token_env
							.as_deref()
							.and_then(|env| std::env::var(env).ok())
					})
					.ok_or_else(|| McpError::Auth("no token configured".to_string()))?;
				let value = if auth.kind == McpAuthKind::Bearer {
					format!("Bearer {token}")
				} else {
					token
				};
				Ok(Some((header, value)))
			},
			McpAuthKind::Oauth => {
				let principal = caller.user_id.clone().unwrap_or_default();
				let key = (strng::new(&server.server_name), principal);
				{
					let tokens = self.oauth_tokens.lock().await;
					if let Some(cached) = tokens.get(&key)
						&& cached.expires_at > Instant::now()
					{
						return Ok(Some((header, format!("Bearer {}", cached.token))));
					}
				}
				let token = self.oauth_exchange(server).await?;
				let value = format!("Bearer {}", token.token);
				self.oauth_tokens.lock().await.insert(key, token);
				Ok(Some((header, value)))
			},
		}
	}

	async fn oauth_exchange(
		&self,
		server: &Arc<McpServerConfig>,
	) -> Result<CachedToken, McpError> {
		let auth = server.auth.as_ref().expect("checked by caller");
		let (Some(client_id), Some(client_secret), Some(token_url)) =
			(&auth.client_id, &auth.client_secret, &auth.token_url)
		else {
			return Err(McpError::Auth(
				"oauth requires client_id, client_secret and token_url".to_string(),
			));
		};
		#[derive(serde::Deserialize)]
		struct TokenResponse {
			access_token: String,
			#[serde(default = "default_expiry")]
			expires_in: u64,
		}
		fn default_expiry() -> u64 {
			3600
		}
		let mut form = vec![
			("grant_type", "client_credentials".to_string()),
			("client_id", client_id.clone()),
			("client_secret", client_secret.clone()),
		];
		if !auth.scopes.is_empty() {
			form.push(("scope", auth.scopes.join(" ")));
		}
		let resp: TokenResponse = self
			.http
			.post(token_url)
			.form(&form)
			.send()
			.await
			.map_err(|e| McpError::Auth(e.to_string()))?
			.error_for_status()
			.map_err(|e| McpError::Auth(e.to_string()))?
			.json()
			.await
			.map_err(|e| McpError::Auth(e.to_string()))?;
		let ttl = Duration::from_secs(resp.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
		Ok(CachedToken {
			token: resp.access_token,
			expires_at: Instant::now() + ttl,
		})
	}

	/// One JSON-RPC round trip over a pooled stdio child process. Processes
	/// are keyed by `(server, user)` and reaped after an idle timeout;
	/// reaping runs on access.
	async fn stdio_request(
		&self,
		server: &Arc<McpServerConfig>,
		caller: &McpCaller,
		request: Value,
	) -> Result<Value, McpError> {
		let key = (
			strng::new(&server.server_name),
			caller.user_id.clone().unwrap_or_default(),
		);
		let mut pool = self.stdio_pool.lock().await;
		pool.retain(|_, s| s.last_used.elapsed() < STDIO_IDLE_TIMEOUT && s.state == SessionState::Ready);

		if !pool.contains_key(&key) {
			let session = StdioSession::spawn(server).await?;
			pool.insert(key.clone(), session);
		}
		let session = pool.get_mut(&key).expect("just inserted");
		match session.round_trip(request).await {
			Ok(v) => Ok(v),
			Err(e) => {
				// Transport errors close the session; the next invocation
				// respawns.
				pool.remove(&key);
				Err(e)
			},
		}
	}
}

fn extract_result(message: Value) -> Result<Value, McpError> {
	if let Some(err) = message.get("error") {
		return Err(McpError::Protocol(err.to_string()));
	}
	message
		.get("result")
		.cloned()
		.ok_or_else(|| McpError::Protocol("response missing result".to_string()))
}

struct StdioSession {
	state: SessionState,
	child: Child,
	stdin: ChildStdin,
	stdout: BufReader<ChildStdout>,
	last_used: Instant,
}

impl StdioSession {
	async fn spawn(server: &McpServerConfig) -> Result<StdioSession, McpError> {
		let command = server
			.command
			.as_deref()
			.ok_or_else(|| McpError::Protocol("missing command".to_string()))?;
		let mut child = Command::new(command)
			.args(&server.args)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::null())
			.kill_on_drop(true)
			.spawn()
			.map_err(|e| McpError::Transport(format!("failed to spawn {command}: {e}")))?;
		let stdin = child
			.stdin
			.take()
			.ok_or_else(|| McpError::Transport("no stdin".to_string()))?;
		let stdout = BufReader::new(
			child
				.stdout
				.take()
				.ok_or_else(|| McpError::Transport("no stdout".to_string()))?,
		);
		let mut session = StdioSession {
			state: SessionState::Connecting,
			child,
			stdin,
			stdout,
			last_used: Instant::now(),
		};
		session.initialize().await?;
		session.state = SessionState::Ready;
		Ok(session)
	}

	async fn initialize(&mut self) -> Result<(), McpError> {
		let init = serde_json::json!({
			"jsonrpc": "2.0",
			"id": "init",
			"method": "initialize",
			"params": {
				"protocolVersion": "2025-03-26",
				"capabilities": {},
				"clientInfo": {"name": "modelgateway", "version": env!("CARGO_PKG_VERSION")},
			},
		});
		self.write_line(&init).await?;
		let _ = self.read_response("init").await?;
		let initialized = serde_json::json!({
			"jsonrpc": "2.0",
			"method": "notifications/initialized",
		});
		self.write_line(&initialized).await
	}

	async fn round_trip(&mut self, request: Value) -> Result<Value, McpError> {
		if !self.state.can_transition_to(SessionState::Invoking) {
			return Err(McpError::Transport("session not ready".to_string()));
		}
		self.state = SessionState::Invoking;
		let id = request
			.get("id")
			.and_then(|v| v.as_str())
			.unwrap_or_default()
			.to_string();
		let result = async {
			self.write_line(&request).await?;
			let message = self.read_response(&id).await?;
			extract_result(message)
		}
		.await;
		match &result {
			Ok(_) => {
				self.state = SessionState::Ready;
				self.last_used = Instant::now();
			},
			Err(_) => {
				self.state = SessionState::Closed;
				let _ = self.child.start_kill();
			},
		}
		result
	}

	async fn write_line(&mut self, value: &Value) -> Result<(), McpError> {
		let mut line = serde_json::to_vec(value).map_err(|e| McpError::Protocol(e.to_string()))?;
		line.push(b'\n');
		self
			.stdin
			.write_all(&line)
			.await
			.map_err(|e| McpError::Transport(e.to_string()))
	}

	async fn read_response(&mut self, id: &str) -> Result<Value, McpError> {
		// Servers may interleave notifications; skip until our id answers.
		loop {
			let mut line = String::new();
			let n = self
				.stdout
				.read_line(&mut line)
				.await
				.map_err(|e| McpError::Transport(e.to_string()))?;
			if n == 0 {
				return Err(McpError::Transport("server closed stdout".to_string()));
			}
			let Ok(message) = serde_json::from_str::<Value>(&line) else {
				continue;
			};
			match message.get("id").and_then(|v| v.as_str()) {
				Some(got) if got == id => return Ok(message),
				_ => continue,
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::mcp::ToolCostEntry;

	fn gateway() -> McpGateway {
		McpGateway::new(
			vec![
				McpServerConfig {
					server_name: "deepwiki".to_string(),
					transport: McpTransport::Http,
					url: Some("https://example.com/mcp".to_string()),
					command: None,
					args: Vec::new(),
					auth: None,
					allowed_tools: Vec::new(),
					disallowed_tools: Vec::new(),
					access_groups: vec!["docs".to_string()],
					forwardable_headers: vec!["x-trace-id".to_string()],
					tool_cost: vec![ToolCostEntry {
						tool: "ask_question".to_string(),
						cost_per_call: 0.01,
					}],
					cost_per_call: None,
				},
			],
			None,
		)
		.unwrap()
	}

	#[test]
	fn tool_names_are_namespaced_and_split() {
		let gw = gateway();
		let (server, tool) = gw.split_tool_name("deepwiki-ask_question").unwrap();
		assert_eq!(server.server_name, "deepwiki");
		assert_eq!(tool, "ask_question");
		assert!(gw.split_tool_name("nosuchserver-tool").is_err());
		assert!(gw.split_tool_name("nodashes").is_err());
	}

	#[tokio::test]
	async fn invocation_requires_access_group() {
		let gw = gateway();
		let outsider = McpCaller::default();
		let err = gw
			.call_tool("deepwiki-ask_question", None, &outsider, &HeaderMap::new())
			.await
			.unwrap_err();
		assert!(matches!(err, McpError::AccessDenied(_)));
	}

	#[test]
	fn rejects_server_names_containing_separator() {
		let err = McpGateway::new(
			vec![McpServerConfig {
				server_name: "deep-wiki".to_string(),
				transport: McpTransport::Http,
				url: Some("https://example.com".to_string()),
				command: None,
				args: Vec::new(),
				auth: None,
				allowed_tools: Vec::new(),
				disallowed_tools: Vec::new(),
				access_groups: Vec::new(),
				forwardable_headers: Vec::new(),
				tool_cost: Vec::new(),
				cost_per_call: None,
			}],
			None,
		)
		.err();
		assert!(err.is_some());
	}
}
