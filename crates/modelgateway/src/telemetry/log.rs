//! The per-call audit record and its emission path.
//!
//! Exactly one [`LoggingRecord`] is emitted per call, success or failure. The
//! record is built up across the pipeline via [`AsyncLog`] (streaming paths
//! mutate it as chunks arrive) and handed to the sink dispatcher on exit.
//! Sinks are decoupled by a bounded queue: on overflow records are dropped
//! and counted, the pipeline is never blocked.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::llm::cost::CostBreakdown;
use crate::llm::types::completions::{ServerToolUse, Usage};
use crate::{Strng, warn};

/// A log cell shared between the request path and an in-flight stream. The
/// stream side mutates the value as data arrives; the owner takes it at
/// emission time.
#[derive(Debug)]
pub struct AsyncLog<T>(Arc<Mutex<Option<T>>>);

impl<T> Clone for AsyncLog<T> {
	fn clone(&self) -> Self {
		AsyncLog(self.0.clone())
	}
}

impl<T> Default for AsyncLog<T> {
	fn default() -> Self {
		AsyncLog(Arc::new(Mutex::new(None)))
	}
}

impl<T> AsyncLog<T> {
	pub fn store(&self, value: Option<T>) {
		*self.0.lock() = value;
	}

	/// Mutate the stored value in place. Mutations from the stream task and
	/// reads from the emitter are not ordered with respect to each other;
	/// last write wins.
	pub fn non_atomic_mutate(&self, f: impl FnOnce(&mut T)) {
		let mut guard = self.0.lock();
		if let Some(v) = guard.as_mut() {
			f(v);
		}
	}

	pub fn take(&self) -> Option<T> {
		self.0.lock().take()
	}

	pub fn with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
		let guard = self.0.lock();
		f(guard.as_ref())
	}
}

/// Outcome of one guardrail execution, recorded for audit.
#[derive(Debug, Clone, Serialize)]
pub struct GuardrailResult {
	pub name: Strng,
	pub mode: Strng,
	/// model | team | global: the attachment scope the hook ran at.
	pub scope: Strng,
	/// passed | mutated | blocked | client_cancelled | error
	pub action: Strng,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub confidence: Option<f64>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub entities: Vec<String>,
}

/// Immutable snapshot emitted once per call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoggingRecord {
	pub call_id: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub trace_id: Option<String>,
	#[serde(skip_serializing_if = "Vec::is_empty", default)]
	pub parent_ids: Vec<String>,
	pub request_ts: Option<DateTime<Utc>>,
	pub response_ts: Option<DateTime<Utc>>,
	/// Wall time of the full call.
	pub latency: Duration,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub time_to_first_token: Option<Duration>,

	pub model: Strng,
	pub model_group: Strng,
	pub deployment_id: Strng,
	pub provider: Strng,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub api_base: Option<Strng>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub user: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub team: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub key_hash: Option<String>,
	#[serde(skip_serializing_if = "Vec::is_empty", default)]
	pub tags: Vec<String>,

	/// Redacted per policy before emission.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub request: Option<serde_json::Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub response: Option<serde_json::Value>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
	pub cost: CostBreakdown,
	pub cache_hit: bool,
	pub retries: u32,
	/// Every deployment actually tried for this logical call, in order.
	#[serde(skip_serializing_if = "Vec::is_empty", default)]
	pub fallback_chain: Vec<Strng>,
	#[serde(skip_serializing_if = "Vec::is_empty", default)]
	pub guardrail_results: Vec<GuardrailResult>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub server_tool_use: Option<ServerToolUse>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub mcp_server_id: Option<Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub mcp_tool_name: Option<Strng>,

	/// Terminal error kind, when the call failed.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

impl LoggingRecord {
	pub fn new(call_id: impl Into<String>) -> LoggingRecord {
		LoggingRecord {
			call_id: call_id.into(),
			request_ts: Some(Utc::now()),
			..Default::default()
		}
	}
}

/// The emission contract. Implementations: Langfuse, Datadog, S3, Prometheus,
/// SQS, stdout; only stdout ships in-tree.
pub trait LoggingSink: Send + Sync {
	fn name(&self) -> &'static str;
	fn emit(&self, record: &LoggingRecord);
}

pub struct StdoutSink;

impl LoggingSink for StdoutSink {
	fn name(&self) -> &'static str {
		"stdout"
	}

	fn emit(&self, record: &LoggingRecord) {
		if let Ok(line) = serde_json::to_string(record) {
			println!("{line}");
		}
	}
}

const QUEUE_DEPTH: usize = 2048;

/// Fan-out dispatcher feeding every configured sink from a bounded queue.
#[derive(Clone)]
pub struct LogDispatcher {
	tx: mpsc::Sender<Arc<LoggingRecord>>,
	dropped: Arc<AtomicU64>,
}

impl std::fmt::Debug for LogDispatcher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LogDispatcher")
			.field("dropped", &self.dropped.load(Ordering::Relaxed))
			.finish()
	}
}

impl LogDispatcher {
	pub fn spawn(sinks: Vec<Arc<dyn LoggingSink>>) -> LogDispatcher {
		let (tx, mut rx) = mpsc::channel::<Arc<LoggingRecord>>(QUEUE_DEPTH);
		tokio::spawn(async move {
			while let Some(record) = rx.recv().await {
				for sink in &sinks {
					sink.emit(&record);
				}
			}
		});
		LogDispatcher {
			tx,
			dropped: Arc::new(AtomicU64::new(0)),
		}
	}

	/// A dispatcher that discards everything; used in tests and when spend
	/// logs are disabled.
	pub fn disabled() -> LogDispatcher {
		Self::spawn(Vec::new())
	}

	pub fn emit(&self, record: LoggingRecord) {
		match self.tx.try_send(Arc::new(record)) {
			Ok(()) => {},
			Err(mpsc::error::TrySendError::Full(_)) => {
				// Exposed as a metric; emission never blocks the pipeline.
				let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
				if n.is_power_of_two() {
					warn!("logging queue full; dropped {n} records");
				}
			},
			Err(mpsc::error::TrySendError::Closed(_)) => {
				self.dropped.fetch_add(1, Ordering::Relaxed);
			},
		}
	}

	pub fn dropped(&self) -> u64 {
		self.dropped.load(Ordering::Relaxed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Default)]
	struct CaptureSink(Mutex<Vec<String>>);

	impl LoggingSink for CaptureSink {
		fn name(&self) -> &'static str {
			"capture"
		}
		fn emit(&self, record: &LoggingRecord) {
			self.0.lock().push(record.call_id.clone());
		}
	}

	#[tokio::test]
	async fn records_reach_every_sink() {
		let sink = Arc::new(CaptureSink::default());
		let d = LogDispatcher::spawn(vec![sink.clone() as Arc<dyn LoggingSink>]);
		d.emit(LoggingRecord::new("call-1"));
		d.emit(LoggingRecord::new("call-2"));
		tokio::time::sleep(Duration::from_millis(50)).await;
		assert_eq!(*sink.0.lock(), vec!["call-1", "call-2"]);
		assert_eq!(d.dropped(), 0);
	}

	#[test]
	fn async_log_mutation() {
		let log: AsyncLog<u64> = AsyncLog::default();
		log.non_atomic_mutate(|v| *v += 1);
		assert_eq!(log.take(), None);
		log.store(Some(1));
		log.non_atomic_mutate(|v| *v += 1);
		assert_eq!(log.take(), Some(2));
		assert_eq!(log.take(), None);
	}
}
