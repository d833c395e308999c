//! Access-group checks for MCP servers. Keys and teams are granted access by
//! group membership; a server with no groups is public.

use crate::mcp::{McpError, McpServerConfig};

/// The caller's identity as it matters to MCP routing.
#[derive(Debug, Clone, Default)]
pub struct McpCaller {
	/// Access groups granted to the calling key/team.
	pub access_groups: Vec<String>,
	/// Parsed `x-mcp-servers` header: server names or access-group names
	/// narrowing this call. Empty means no narrowing.
	pub server_filter: Vec<String>,
	/// Stable id for per-user stdio pooling.
	pub user_id: Option<String>,
}

impl McpCaller {
	/// Parse the `x-mcp-servers` header value (comma-separated names).
	pub fn with_server_filter(mut self, header: Option<&str>) -> Self {
		self.server_filter = header
			.map(|h| {
				h.split(',')
					.map(|s| s.trim().to_string())
					.filter(|s| !s.is_empty())
					.collect()
			})
			.unwrap_or_default();
		self
	}
}

/// Whether the caller may reach this server at all.
pub fn authorize(caller: &McpCaller, server: &McpServerConfig) -> Result<(), McpError> {
	if server.access_groups.is_empty() {
		return Ok(());
	}
	let allowed = server
		.access_groups
		.iter()
		.any(|g| caller.access_groups.contains(g));
	if allowed {
		Ok(())
	} else {
		Err(McpError::AccessDenied(server.server_name.clone()))
	}
}

/// Whether the `x-mcp-servers` narrowing (if any) selects this server,
/// either by its name or by one of its access groups.
pub fn selected(caller: &McpCaller, server: &McpServerConfig) -> bool {
	if caller.server_filter.is_empty() {
		return true;
	}
	caller.server_filter.iter().any(|f| {
		f == &server.server_name || server.access_groups.contains(f)
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::mcp::McpTransport;

	fn server(name: &str, groups: &[&str]) -> McpServerConfig {
		McpServerConfig {
			server_name: name.to_string(),
			transport: McpTransport::Http,
			url: Some("https://example.com/mcp".to_string()),
			command: None,
			args: Vec::new(),
			auth: None,
			allowed_tools: Vec::new(),
			disallowed_tools: Vec::new(),
			access_groups: groups.iter().map(|g| g.to_string()).collect(),
			forwardable_headers: Vec::new(),
			tool_cost: Vec::new(),
			cost_per_call: None,
		}
	}

	#[test]
	fn public_servers_need_no_groups() {
		let caller = McpCaller::default();
		assert!(authorize(&caller, &server("wiki", &[])).is_ok());
	}

	#[test]
	fn group_membership_is_enforced() {
		let server = server("internal", &["eng"]);
		let outsider = McpCaller::default();
		assert!(matches!(
			authorize(&outsider, &server),
			Err(McpError::AccessDenied(_))
		));
		let member = McpCaller {
			access_groups: vec!["eng".to_string()],
			..Default::default()
		};
		assert!(authorize(&member, &server).is_ok());
	}

	#[test]
	fn header_narrowing_matches_names_and_groups() {
		let wiki = server("wiki", &["docs"]);
		let caller = McpCaller::default().with_server_filter(Some("wiki, other"));
		assert!(selected(&caller, &wiki));
		let caller = McpCaller::default().with_server_filter(Some("docs"));
		assert!(selected(&caller, &wiki));
		let caller = McpCaller::default().with_server_filter(Some("unrelated"));
		assert!(!selected(&caller, &wiki));
		let caller = McpCaller::default().with_server_filter(None);
		assert!(selected(&caller, &wiki));
	}
}
