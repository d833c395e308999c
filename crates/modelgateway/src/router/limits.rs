//! Admission control consulted before dispatch: parallel-request caps,
//! dynamic (saturation-aware, priority-weighted) rate limiting, and budget
//! enforcement.
//!
//! Keys are hashed onto a fixed slot space so that multiple gateway
//! instances sharing an external store converge on the same owner slot.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;

use crate::error::{ErrorKind, GatewayError};
use crate::store::{SpendScope, SpendStore};
use crate::{Strng, debug};

pub const LIMIT_SLOTS: u16 = 16384;

/// Deterministic slot for a limiter key, stable across instances.
pub fn limit_slot(key: &str) -> u16 {
	let digest = Sha256::digest(key.as_bytes());
	let n = u16::from_be_bytes([digest[0], digest[1]]);
	n % LIMIT_SLOTS
}

#[derive(
	Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
	Low,
	#[default]
	Medium,
	High,
}

/// Concurrency caps per key, team, and model. Dropping the lease releases
/// the slot.
#[derive(Default)]
pub struct ParallelRequestLimiter {
	inner: Arc<Mutex<HashMap<Strng, usize>>>,
}

#[derive(Debug)]
pub struct ParallelLease {
	inner: Arc<Mutex<HashMap<Strng, usize>>>,
	keys: Vec<Strng>,
}

impl Drop for ParallelLease {
	fn drop(&mut self) {
		let mut map = self.inner.lock();
		for key in &self.keys {
			if let Some(count) = map.get_mut(key) {
				*count = count.saturating_sub(1);
				if *count == 0 {
					map.remove(key);
				}
			}
		}
	}
}

impl ParallelRequestLimiter {
	pub fn new() -> Self {
		Self::default()
	}

	/// Acquire a slot under every `(key, cap)` pair, atomically: either all
	/// succeed or the request is refused.
	pub fn acquire(&self, caps: &[(Strng, usize)]) -> Result<ParallelLease, GatewayError> {
		let mut map = self.inner.lock();
		for (key, cap) in caps {
			let current = map.get(key).copied().unwrap_or(0);
			if current >= *cap {
				return Err(GatewayError::new(
					ErrorKind::RateLimited,
					format!("parallel request limit reached for {key}"),
				)
				.with_code("parallel_request_limit"));
			}
		}
		for (key, _) in caps {
			*map.entry(key.clone()).or_insert(0) += 1;
		}
		Ok(ParallelLease {
			inner: self.inner.clone(),
			keys: caps.iter().map(|(k, _)| k.clone()).collect(),
		})
	}

	pub fn in_flight(&self, key: &Strng) -> usize {
		self.inner.lock().get(key).copied().unwrap_or(0)
	}
}

/// Saturation threshold beyond which admission becomes priority-weighted.
const SATURATION_THRESHOLD: f64 = 0.8;

/// The dynamic rate limiter: below 80% saturation every requester is
/// admitted; at or above it, lower-priority requests queue behind a grant
/// while higher-priority requests are admitted immediately, so low priority
/// never starves high.
pub struct DynamicRateLimiter {
	capacity_rpm: u64,
	state: Mutex<DynamicState>,
}

#[derive(Default)]
struct DynamicState {
	window_minute: u64,
	admitted: u64,
	waiting: VecDeque<Waiter>,
}

struct Waiter {
	priority: Priority,
	tx: oneshot::Sender<()>,
}

pub enum Admission {
	Admitted,
	/// Deferred behind higher-priority traffic; resolves when capacity
	/// frees up.
	Queued(oneshot::Receiver<()>),
}

impl DynamicRateLimiter {
	pub fn new(capacity_rpm: u64) -> Self {
		Self {
			capacity_rpm,
			state: Mutex::new(DynamicState::default()),
		}
	}

	fn minute() -> u64 {
		std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.map(|d| d.as_secs() / 60)
			.unwrap_or_default()
	}

	pub fn saturation(&self) -> f64 {
		let mut state = self.state.lock();
		Self::roll_window(&mut state);
		if self.capacity_rpm == 0 {
			return 1.0;
		}
		state.admitted as f64 / self.capacity_rpm as f64
	}

	fn roll_window(state: &mut DynamicState) {
		let minute = Self::minute();
		if state.window_minute != minute {
			state.window_minute = minute;
			state.admitted = 0;
		}
	}

	pub fn try_acquire(&self, priority: Priority) -> Admission {
		let mut state = self.state.lock();
		Self::roll_window(&mut state);
		let saturation = if self.capacity_rpm == 0 {
			1.0
		} else {
			state.admitted as f64 / self.capacity_rpm as f64
		};
		if saturation < SATURATION_THRESHOLD || priority == Priority::High {
			state.admitted += 1;
			return Admission::Admitted;
		}
		// Over the threshold: weighted admission. Anything not top priority
		// waits its turn, ordered by priority then arrival.
		debug!("saturation {saturation:.2} >= {SATURATION_THRESHOLD}; queueing {priority:?}");
		let (tx, rx) = oneshot::channel();
		let pos = state
			.waiting
			.iter()
			.position(|w| w.priority < priority)
			.unwrap_or(state.waiting.len());
		state.waiting.insert(pos, Waiter { priority, tx });
		Admission::Queued(rx)
	}

	/// Release capacity at request completion; wakes the frontmost waiter
	/// when the window has headroom again.
	pub fn release(&self) {
		let mut state = self.state.lock();
		Self::roll_window(&mut state);
		state.admitted = state.admitted.saturating_sub(1);
		let saturation = if self.capacity_rpm == 0 {
			1.0
		} else {
			state.admitted as f64 / self.capacity_rpm as f64
		};
		if saturation < SATURATION_THRESHOLD
			&& let Some(waiter) = state.waiting.pop_front()
		{
			state.admitted += 1;
			let _ = waiter.tx.send(());
		}
	}

	pub fn queued(&self) -> usize {
		self.state.lock().waiting.len()
	}
}

/// Per-key / per-team spend enforcement against a refreshed total.
pub struct BudgetLimiter {
	spend: Arc<dyn SpendStore>,
	/// Window over which spend is summed.
	window: Duration,
}

impl BudgetLimiter {
	pub fn new(spend: Arc<dyn SpendStore>, window: Duration) -> Self {
		Self { spend, window }
	}

	pub fn check(
		&self,
		scope: &SpendScope,
		budget: Option<f64>,
		cost_estimate: f64,
	) -> Result<(), GatewayError> {
		let Some(budget) = budget else {
			return Ok(());
		};
		let spent = self.spend.get_spend(scope, self.window);
		if spent + cost_estimate > budget {
			return Err(GatewayError::new(
				ErrorKind::BudgetExceeded,
				format!("budget exceeded: spent {spent:.4} of {budget:.4}"),
			)
			.with_code("budget_exceeded"));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::strng;

	#[test]
	fn slots_are_deterministic_and_bounded() {
		assert_eq!(limit_slot("key-a"), limit_slot("key-a"));
		assert!(limit_slot("key-a") < LIMIT_SLOTS);
		assert!(limit_slot("key-b") < LIMIT_SLOTS);
	}

	#[test]
	fn parallel_limiter_caps_and_releases() {
		let limiter = ParallelRequestLimiter::new();
		let key = strng::literal!("key:abc");
		let l1 = limiter.acquire(&[(key.clone(), 2)]).unwrap();
		let _l2 = limiter.acquire(&[(key.clone(), 2)]).unwrap();
		let err = limiter.acquire(&[(key.clone(), 2)]).unwrap_err();
		assert_eq!(err.kind, ErrorKind::RateLimited);
		drop(l1);
		assert!(limiter.acquire(&[(key.clone(), 2)]).is_ok());
	}

	#[test]
	fn partial_acquisition_does_not_leak() {
		let limiter = ParallelRequestLimiter::new();
		let key = strng::literal!("key:abc");
		let team = strng::literal!("team:t1");
		let _l1 = limiter.acquire(&[(team.clone(), 1)]).unwrap();
		// Key slot is free but the team cap refuses; nothing must be held.
		assert!(limiter.acquire(&[(key.clone(), 5), (team.clone(), 1)]).is_err());
		assert_eq!(limiter.in_flight(&key), 0);
	}

	#[tokio::test]
	async fn dynamic_limiter_prioritizes_at_saturation() {
		// Capacity 100, 85 admitted: >= 80% saturation.
		let limiter = DynamicRateLimiter::new(100);
		for _ in 0..85 {
			assert!(matches!(
				limiter.try_acquire(Priority::High),
				Admission::Admitted
			));
		}
		assert!(limiter.saturation() >= 0.8);

		// Low priority defers, high priority passes straight through.
		let low = limiter.try_acquire(Priority::Low);
		assert!(matches!(low, Admission::Queued(_)));
		assert!(matches!(
			limiter.try_acquire(Priority::High),
			Admission::Admitted
		));
		assert_eq!(limiter.queued(), 1);

		// Capacity frees up below the threshold: the waiter is admitted.
		let Admission::Queued(rx) = low else {
			unreachable!()
		};
		for _ in 0..10 {
			limiter.release();
		}
		rx.await.expect("waiter should be admitted");
		assert_eq!(limiter.queued(), 0);
	}

	#[test]
	fn queue_orders_by_priority_then_arrival() {
		let limiter = DynamicRateLimiter::new(10);
		for _ in 0..10 {
			let _ = limiter.try_acquire(Priority::High);
		}
		let _low = limiter.try_acquire(Priority::Low);
		let _med = limiter.try_acquire(Priority::Medium);
		let state = limiter.state.lock();
		let order: Vec<Priority> = state.waiting.iter().map(|w| w.priority).collect();
		assert_eq!(order, vec![Priority::Medium, Priority::Low]);
	}

	#[test]
	fn budget_limiter_refuses_over_spend() {
		use crate::store::MemorySpendStore;
		use crate::telemetry::log::LoggingRecord;

		let store = Arc::new(MemorySpendStore::new());
		let mut record = LoggingRecord::new("c1");
		record.key_hash = Some("k1".to_string());
		record.cost.total = 9.5;
		store.record(&record);

		let limiter = BudgetLimiter::new(store, Duration::from_secs(3600));
		let scope = SpendScope::Key("k1".to_string());
		assert!(limiter.check(&scope, Some(10.0), 0.2).is_ok());
		let err = limiter.check(&scope, Some(10.0), 1.0).unwrap_err();
		assert_eq!(err.kind, ErrorKind::BudgetExceeded);
		// No budget configured: always admitted.
		assert!(limiter.check(&scope, None, 100.0).is_ok());
	}
}
