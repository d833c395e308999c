//! The MCP gateway: a pure proxy over Model Context Protocol servers plus
//! access control and cost attribution.

pub mod gateway;
pub mod rbac;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, GatewayError};

/// Default separator used to namespace server names into tool names. Server
/// names must not contain it.
pub const DEFAULT_TOOL_SEPARATOR: &str = "-";

/// One entry of `mcp_servers[]` in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct McpServerConfig {
	/// Globally unique name. Used as the tool namespace prefix.
	pub server_name: String,
	pub transport: McpTransport,
	/// Endpoint for `http`/`sse` transports.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub url: Option<String>,
	/// Command line for the `stdio` transport.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub command: Option<String>,
	#[serde(default)]
	pub args: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub auth: Option<McpAuthConfig>,
	/// Empty means every discovered tool is allowed.
	#[serde(default)]
	pub allowed_tools: Vec<String>,
	#[serde(default)]
	pub disallowed_tools: Vec<String>,
	/// Access groups whose members may reach this server. Empty means
	/// public.
	#[serde(default)]
	pub access_groups: Vec<String>,
	/// Incoming request headers projected onto upstream tool calls.
	#[serde(default)]
	pub forwardable_headers: Vec<String>,
	/// Per-tool pricing; the server-level default applies otherwise.
	#[serde(default)]
	pub tool_cost: Vec<ToolCostEntry>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cost_per_call: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpTransport {
	Http,
	Sse,
	Stdio,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct McpAuthConfig {
	#[serde(rename = "type")]
	pub kind: McpAuthKind,
	/// Header carrying the credential; defaults to `Authorization`.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub header_name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub token: Option<String>,
	/// Environment variable holding the token, as an alternative to
	/// inlining it.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub token_env: Option<String>,
	// OAuth 2.0 client-credentials fields.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub client_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub client_secret: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub token_url: Option<String>,
	#[serde(default)]
	pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpAuthKind {
	Bearer,
	ApiKey,
	Oauth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolCostEntry {
	pub tool: String,
	pub cost_per_call: f64,
}

impl McpServerConfig {
	pub fn validate(&self) -> Result<(), GatewayError> {
		self.validate_with_separator(DEFAULT_TOOL_SEPARATOR)
	}

	pub fn validate_with_separator(&self, separator: &str) -> Result<(), GatewayError> {
		if self.server_name.is_empty() {
			return Err(GatewayError::bad_request("mcp server_name must not be empty"));
		}
		if self.server_name.contains(separator) {
			return Err(GatewayError::bad_request(format!(
				"mcp server_name {:?} must not contain the tool separator {separator:?}",
				self.server_name
			)));
		}
		match self.transport {
			McpTransport::Http | McpTransport::Sse if self.url.is_none() => {
				Err(GatewayError::bad_request(format!(
					"mcp server {:?} requires a url",
					self.server_name
				)))
			},
			McpTransport::Stdio if self.command.is_none() => Err(GatewayError::bad_request(format!(
				"mcp server {:?} requires a command",
				self.server_name
			))),
			_ => Ok(()),
		}
	}

	/// Tool-level price beats server-level; absent either, tools are free.
	pub fn cost_for_tool(&self, tool: &str) -> f64 {
		self
			.tool_cost
			.iter()
			.find(|t| t.tool == tool)
			.map(|t| t.cost_per_call)
			.or(self.cost_per_call)
			.unwrap_or(0.0)
	}

	pub fn tool_allowed(&self, tool: &str) -> bool {
		if self.disallowed_tools.iter().any(|t| t == tool) {
			return false;
		}
		self.allowed_tools.is_empty() || self.allowed_tools.iter().any(|t| t == tool)
	}
}

/// Lifecycle of one upstream MCP session. `Closed` is terminal; transport
/// errors go straight to `Closed` and the next invocation reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Idle,
	Connecting,
	Ready,
	Invoking,
	Closed,
}

impl SessionState {
	pub fn can_transition_to(self, next: SessionState) -> bool {
		use SessionState::*;
		matches!(
			(self, next),
			(Idle, Connecting)
				| (Connecting, Ready)
				| (Ready, Invoking)
				| (Invoking, Ready)
				| (Idle | Connecting | Ready | Invoking, Closed)
		)
	}
}

#[derive(Debug, thiserror::Error)]
pub enum McpError {
	#[error("unknown mcp server: {0}")]
	UnknownServer(String),
	#[error("unknown mcp tool: {0}")]
	UnknownTool(String),
	#[error("access denied to mcp server {0}")]
	AccessDenied(String),
	#[error("mcp transport error: {0}")]
	Transport(String),
	#[error("mcp protocol error: {0}")]
	Protocol(String),
	#[error("mcp auth error: {0}")]
	Auth(String),
}

impl From<McpError> for GatewayError {
	fn from(e: McpError) -> Self {
		let kind = match &e {
			McpError::UnknownServer(_) | McpError::UnknownTool(_) => ErrorKind::NotFound,
			McpError::AccessDenied(_) => ErrorKind::PermissionDenied,
			McpError::Transport(_) => ErrorKind::UpstreamError,
			McpError::Protocol(_) => ErrorKind::UpstreamError,
			McpError::Auth(_) => ErrorKind::AuthenticationError,
		};
		GatewayError::new(kind, e.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn server_name_must_not_contain_separator() {
		let cfg: McpServerConfig = serde_yaml::from_str(
			"server_name: deep-wiki\ntransport: http\nurl: https://example.com/mcp\n",
		)
		.unwrap();
		assert!(cfg.validate().is_err());
		let cfg: McpServerConfig = serde_yaml::from_str(
			"server_name: deepwiki\ntransport: http\nurl: https://example.com/mcp\n",
		)
		.unwrap();
		assert!(cfg.validate().is_ok());
	}

	#[test]
	fn tool_cost_precedence() {
		let cfg: McpServerConfig = serde_yaml::from_str(
			r#"
server_name: deepwiki
transport: http
url: https://example.com/mcp
cost_per_call: 0.005
tool_cost:
  - tool: ask_question
    cost_per_call: 0.01
"#,
		)
		.unwrap();
		assert_eq!(cfg.cost_for_tool("ask_question"), 0.01);
		assert_eq!(cfg.cost_for_tool("read_wiki"), 0.005);
		let mut free = cfg.clone();
		free.cost_per_call = None;
		free.tool_cost.clear();
		assert_eq!(free.cost_for_tool("anything"), 0.0);
	}

	#[test]
	fn session_state_machine() {
		use SessionState::*;
		assert!(Idle.can_transition_to(Connecting));
		assert!(Connecting.can_transition_to(Ready));
		assert!(Ready.can_transition_to(Invoking));
		assert!(Invoking.can_transition_to(Ready));
		assert!(Invoking.can_transition_to(Closed));
		assert!(!Closed.can_transition_to(Connecting));
		assert!(!Idle.can_transition_to(Invoking));
		assert!(!Closed.can_transition_to(Ready));
	}

	#[test]
	fn allowed_and_disallowed_tools() {
		let cfg: McpServerConfig = serde_yaml::from_str(
			r#"
server_name: wiki
transport: http
url: https://example.com/mcp
allowed_tools: [ask_question, read_wiki]
disallowed_tools: [read_wiki]
"#,
		)
		.unwrap();
		assert!(cfg.tool_allowed("ask_question"));
		assert!(!cfg.tool_allowed("read_wiki"));
		assert!(!cfg.tool_allowed("other"));
	}
}
