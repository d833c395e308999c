//! Collaborator interfaces for persistence. The gateway never talks to a
//! database directly; spend and key policy stores are implemented out of
//! tree. In-memory implementations ship for tests and single-node use.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::Strng;
use crate::telemetry::log::LoggingRecord;

/// What a spend query is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SpendScope {
	Key(String),
	Team(String),
	Tag(String),
}

pub trait SpendStore: Send + Sync {
	fn record(&self, record: &LoggingRecord);
	fn get_spend(&self, scope: &SpendScope, window: Duration) -> f64;
}

/// Per-key policy resolved at request entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyPolicy {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub budget: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rpm: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tpm: Option<u64>,
	/// Concurrency cap for this key.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_parallel: Option<u64>,
	/// Empty means every model is allowed.
	#[serde(default)]
	pub allowed_models: Vec<String>,
	/// Guardrails attached at team/key scope; they run after any model-level
	/// attachments and before the global guardrails.
	#[serde(default)]
	pub guardrails: Vec<String>,
	/// MCP access groups granted to this key.
	#[serde(default)]
	pub mcp_access_groups: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub team_id: Option<String>,
	#[serde(default)]
	pub priority: crate::router::limits::Priority,
}

impl KeyPolicy {
	pub fn allows_model(&self, model: &str) -> bool {
		self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
	}
}

pub trait PolicyStore: Send + Sync {
	fn lookup_key(&self, token: &str) -> Option<KeyPolicy>;
}

/// Spend tracking that lives and dies with the process.
#[derive(Default)]
pub struct MemorySpendStore {
	spend: RwLock<HashMap<SpendScope, f64>>,
}

impl MemorySpendStore {
	pub fn new() -> Self {
		Self::default()
	}
}

impl SpendStore for MemorySpendStore {
	fn record(&self, record: &LoggingRecord) {
		let mut spend = self.spend.write();
		if let Some(key) = &record.key_hash {
			*spend.entry(SpendScope::Key(key.clone())).or_default() += record.cost.total;
		}
		if let Some(team) = &record.team {
			*spend.entry(SpendScope::Team(team.clone())).or_default() += record.cost.total;
		}
		for tag in &record.tags {
			*spend.entry(SpendScope::Tag(tag.clone())).or_default() += record.cost.total;
		}
	}

	fn get_spend(&self, scope: &SpendScope, _window: Duration) -> f64 {
		self.spend.read().get(scope).copied().unwrap_or(0.0)
	}
}

/// Virtual keys loaded from config or `keys import`.
#[derive(Default)]
pub struct StaticPolicyStore {
	keys: RwLock<HashMap<String, KeyPolicy>>,
	master_key: Option<String>,
}

impl StaticPolicyStore {
	pub fn new(master_key: Option<String>) -> Self {
		Self {
			keys: RwLock::new(HashMap::new()),
			master_key,
		}
	}

	pub fn insert(&self, token: impl Into<String>, policy: KeyPolicy) {
		self.keys.write().insert(token.into(), policy);
	}

	pub fn import(&self, keys: HashMap<String, KeyPolicy>) -> usize {
		let count = keys.len();
		self.keys.write().extend(keys);
		count
	}
}

impl PolicyStore for StaticPolicyStore {
	fn lookup_key(&self, token: &str) -> Option<KeyPolicy> {
		if self.master_key.as_deref() == Some(token) {
			// The operator key has no limits.
			return Some(KeyPolicy::default());
		}
		self.keys.read().get(token).cloned()
	}
}

/// Cooldown state sharing across gateway instances. Process-local state is
/// authoritative; an external KV mirror may lag.
pub trait CooldownStore: Send + Sync {
	fn mark(&self, deployment: &Strng, until_epoch_ms: u64);
	fn is_cooled(&self, deployment: &Strng) -> bool;
}
