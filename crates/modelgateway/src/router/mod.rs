//! Deployment selection, cooldowns, retries and fallbacks.
//!
//! The router works on the error taxonomy, never raw status codes: transient
//! kinds retry the same deployment with jittered backoff, cooldown-class
//! kinds park the deployment, and exhausted groups fall back to the
//! configured fallback models, each being a full re-entry.

pub mod limits;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rand::RngExt;

use crate::config::{RouterSettings, RoutingStrategy};
use crate::error::{ErrorKind, GatewayError};
use crate::llm::registry::{Deployment, Registry, Resolution};
use crate::{Strng, debug, trace};

const COOLDOWN_SHARDS: usize = 16;
/// Consecutive-cooldown exponent cap; beyond this the duration stops
/// doubling.
const MAX_COOLDOWN_DOUBLINGS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(8);
/// EWMA smoothing for latency-based routing.
const LATENCY_ALPHA: f64 = 0.3;

#[derive(Debug, Default)]
struct CooldownEntry {
	until: Option<Instant>,
	consecutive_cooldowns: u32,
	consecutive_failures: u32,
}

#[derive(Debug, Default)]
struct DeploymentStats {
	in_flight: AtomicU64,
	/// EWMA latency in microseconds; zero means unmeasured.
	latency_ewma_us: AtomicU64,
	/// (minute epoch, count) for the RPM window.
	rpm_window: Mutex<(u64, u64)>,
}

impl DeploymentStats {
	fn record_request(&self) {
		let minute = minute_epoch();
		let mut w = self.rpm_window.lock();
		if w.0 != minute {
			*w = (minute, 0);
		}
		w.1 += 1;
	}

	fn current_rpm(&self) -> u64 {
		let minute = minute_epoch();
		let w = self.rpm_window.lock();
		if w.0 == minute { w.1 } else { 0 }
	}

	fn record_latency(&self, latency: Duration) {
		let sample = latency.as_micros() as u64;
		let prev = self.latency_ewma_us.load(Ordering::Relaxed);
		let next = if prev == 0 {
			sample
		} else {
			((1.0 - LATENCY_ALPHA) * prev as f64 + LATENCY_ALPHA * sample as f64) as u64
		};
		self.latency_ewma_us.store(next, Ordering::Relaxed);
	}
}

fn minute_epoch() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_secs() / 60)
		.unwrap_or_default()
}

/// Decrements the in-flight gauge when the request finishes.
pub struct ActiveHandle {
	stats: Arc<DeploymentStats>,
	started: Instant,
	router: Router,
	deployment: Strng,
}

impl ActiveHandle {
	pub fn finish(self, outcome: Result<(), ErrorKind>) {
		let latency = self.started.elapsed();
		self.stats.record_latency(latency);
		match outcome {
			Ok(()) => self.router.record_success(&self.deployment),
			Err(kind) => self.router.record_failure(&self.deployment, kind),
		}
	}
}

impl Drop for ActiveHandle {
	fn drop(&mut self) {
		self.stats.in_flight.fetch_sub(1, Ordering::Relaxed);
	}
}

#[derive(Clone)]
pub struct Router {
	inner: Arc<RouterInner>,
}

struct RouterInner {
	registry: ArcSwap<Registry>,
	settings: RouterSettings,
	cooldowns: Vec<Mutex<HashMap<Strng, CooldownEntry>>>,
	stats: Mutex<HashMap<Strng, Arc<DeploymentStats>>>,
}

/// What actually happened while routing one logical call, for the audit
/// record.
#[derive(Debug, Default, Clone)]
pub struct RouteTrace {
	pub fallback_chain: Vec<Strng>,
	pub retries: u32,
}

impl Router {
	pub fn new(registry: Registry, settings: RouterSettings) -> Router {
		Router {
			inner: Arc::new(RouterInner {
				registry: ArcSwap::from_pointee(registry),
				settings,
				cooldowns: (0..COOLDOWN_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
				stats: Mutex::new(HashMap::new()),
			}),
		}
	}

	/// Swap in a new registry on configuration reload. In-flight calls keep
	/// the snapshot they started with.
	pub fn reload(&self, registry: Registry) {
		self.inner.registry.store(Arc::new(registry));
	}

	pub fn registry(&self) -> Arc<Registry> {
		self.inner.registry.load_full()
	}

	pub fn settings(&self) -> &RouterSettings {
		&self.inner.settings
	}

	pub fn request_timeout(&self) -> Duration {
		Duration::from_secs_f64(self.inner.settings.request_timeout)
	}

	fn shard(&self, id: &Strng) -> &Mutex<HashMap<Strng, CooldownEntry>> {
		let mut hash = 0usize;
		for b in id.as_bytes() {
			hash = hash.wrapping_mul(31).wrapping_add(*b as usize);
		}
		&self.inner.cooldowns[hash % COOLDOWN_SHARDS]
	}

	pub fn is_cooled(&self, id: &Strng) -> bool {
		let shard = self.shard(id).lock();
		shard
			.get(id)
			.and_then(|e| e.until)
			.map(|until| until > Instant::now())
			.unwrap_or(false)
	}

	pub fn record_failure(&self, id: &Strng, kind: ErrorKind) {
		let allowed_fails = self.inner.settings.allowed_fails;
		let base = Duration::from_secs_f64(self.inner.settings.cooldown_time);
		let mut shard = self.shard(id).lock();
		let entry = shard.entry(id.clone()).or_default();
		entry.consecutive_failures += 1;
		let over_fail_budget = entry.consecutive_failures >= allowed_fails;
		if kind.cools_down() || over_fail_budget {
			let doublings = entry.consecutive_cooldowns.min(MAX_COOLDOWN_DOUBLINGS);
			let duration = base * 2u32.pow(doublings);
			entry.until = Some(Instant::now() + duration);
			entry.consecutive_cooldowns += 1;
			entry.consecutive_failures = 0;
			debug!("deployment {id} cooled for {duration:?} ({kind:?})");
		}
	}

	pub fn record_success(&self, id: &Strng) {
		let mut shard = self.shard(id).lock();
		if let Some(entry) = shard.get_mut(id) {
			entry.consecutive_failures = 0;
			entry.consecutive_cooldowns = 0;
			entry.until = None;
		}
	}

	fn stats_for(&self, id: &Strng) -> Arc<DeploymentStats> {
		self
			.inner
			.stats
			.lock()
			.entry(id.clone())
			.or_default()
			.clone()
	}

	/// Start tracking a request against a deployment. The handle maintains
	/// the in-flight gauge and feeds latency/cooldown state on completion.
	pub fn start_request(&self, dep: &Deployment) -> ActiveHandle {
		let stats = self.stats_for(&dep.id);
		stats.in_flight.fetch_add(1, Ordering::Relaxed);
		stats.record_request();
		ActiveHandle {
			stats,
			started: Instant::now(),
			router: self.clone(),
			deployment: dep.id.clone(),
		}
	}

	/// Healthy deployments of a group, excluding cooled ones and ones
	/// already tried for this call.
	fn healthy<'a>(
		&self,
		group: &'a [Arc<Deployment>],
		exclude: &[Strng],
	) -> Vec<&'a Arc<Deployment>> {
		group
			.iter()
			.filter(|d| !exclude.contains(&d.id))
			.filter(|d| !self.is_cooled(&d.id))
			.collect()
	}

	/// Pick one deployment from a model group. Ranking is O(n) in the group
	/// size; ties break by deployment id ascending.
	pub fn select(
		&self,
		group_name: &str,
		exclude: &[Strng],
	) -> Result<Arc<Deployment>, GatewayError> {
		let registry = self.inner.registry.load();
		let Some(group) = registry.group(group_name) else {
			return Err(GatewayError::new(
				ErrorKind::NotFound,
				format!("unknown model group: {group_name}"),
			));
		};
		let healthy = self.healthy(group, exclude);
		if healthy.is_empty() {
			return Err(GatewayError::new(
				ErrorKind::RateLimited,
				format!("no available deployment for {group_name}"),
			)
			.with_code("no_available_deployment"));
		}
		let chosen = match self.inner.settings.routing_strategy {
			RoutingStrategy::SimpleShuffle => {
				let idx = rand::rng().random_range(0..healthy.len());
				healthy[idx]
			},
			RoutingStrategy::LeastBusy => self.rank(&healthy, |s, _| {
				s.in_flight.load(Ordering::Relaxed) as f64
			}),
			RoutingStrategy::UsageBased => self.rank(&healthy, |s, d| {
				// Most headroom wins; rank by negated headroom.
				let limit = d.rpm.unwrap_or(u64::MAX);
				-(limit.saturating_sub(s.current_rpm()) as f64)
			}),
			RoutingStrategy::LatencyBased => self.rank(&healthy, |s, _| {
				s.latency_ewma_us.load(Ordering::Relaxed) as f64
			}),
			RoutingStrategy::LowestCost => self.rank(&healthy, |_, d| {
				d.info.input_cost_per_token + d.info.output_cost_per_token
			}),
		};
		trace!("selected deployment {}", chosen.id);
		Ok(chosen.clone())
	}

	fn rank<'a>(
		&self,
		healthy: &[&'a Arc<Deployment>],
		score: impl Fn(&DeploymentStats, &Deployment) -> f64,
	) -> &'a Arc<Deployment> {
		healthy
			.iter()
			.copied()
			.min_by(|a, b| {
				let sa = score(&self.stats_for(&a.id), a);
				let sb = score(&self.stats_for(&b.id), b);
				sa.total_cmp(&sb).then_with(|| a.id.cmp(&b.id))
			})
			.expect("healthy is non-empty")
	}

	/// Jittered exponential backoff for retry `attempt` (0-based).
	pub fn backoff_delay(attempt: u32) -> Duration {
		let exp = BACKOFF_BASE
			.saturating_mul(2u32.saturating_pow(attempt))
			.min(BACKOFF_CAP);
		let jitter = rand::rng().random_range(0.8..1.2);
		exp.mul_f64(jitter)
	}

	/// Drive one logical call: pick deployments, retry transient failures on
	/// the same deployment, fail over within the group, then walk the
	/// configured fallback models, each as a full re-entry. Every attempt is
	/// recorded in the trace's fallback chain.
	pub async fn route<T, F, Fut>(
		&self,
		model: &str,
		deadline: Instant,
		attempt: F,
	) -> (Result<T, GatewayError>, RouteTrace)
	where
		F: Fn(Arc<Deployment>) -> Fut,
		Fut: Future<Output = Result<T, GatewayError>>,
	{
		let mut trace = RouteTrace::default();
		let mut last_err = None;

		// The primary model plus its configured fallbacks, in order.
		let registry = self.inner.registry.load_full();
		let mut targets = vec![model.to_string()];
		if let Some(fallbacks) = registry.fallbacks.get(model) {
			targets.extend(fallbacks.iter().cloned());
		}

		for (i, target) in targets.iter().enumerate() {
			if i > 0 {
				debug!("falling back from {model} to {target}");
			}
			match self
				.route_one(target, deadline, &attempt, &mut trace)
				.await
			{
				Ok(v) => return (Ok(v), trace),
				Err(e) => {
					let terminal = !e.retriable();
					last_err = Some(e);
					// Non-retriable errors are client errors; fallbacks
					// cannot fix them.
					if terminal {
						break;
					}
				},
			}
		}
		(
			Err(last_err.unwrap_or_else(|| {
				GatewayError::new(ErrorKind::NotFound, format!("unknown model: {model}"))
			})),
			trace,
		)
	}

	/// Route within a single model target (group or direct deployment).
	async fn route_one<T, F, Fut>(
		&self,
		model: &str,
		deadline: Instant,
		attempt: &F,
		route_trace: &mut RouteTrace,
	) -> Result<T, GatewayError>
	where
		F: Fn(Arc<Deployment>) -> Fut,
		Fut: Future<Output = Result<T, GatewayError>>,
	{
		let registry = self.inner.registry.load_full();
		let mut tried: Vec<Strng> = Vec::new();
		let mut last_err: Option<GatewayError> = None;

		loop {
			let dep = match registry.resolve(model).map_err(GatewayError::from)? {
				Resolution::Group(name) => match self.select(name.as_str(), &tried) {
					Ok(dep) => dep,
					Err(e) => return Err(last_err.unwrap_or(e)),
				},
				Resolution::Deployment(dep) => {
					if !tried.is_empty() {
						// Single deployment and we already tried it.
						return Err(last_err.unwrap_or_else(|| {
							GatewayError::new(
								ErrorKind::RateLimited,
								format!("no available deployment for {model}"),
							)
							.with_code("no_available_deployment")
						}));
					}
					if self.is_cooled(&dep.id) {
						return Err(GatewayError::new(
							ErrorKind::RateLimited,
							format!("no available deployment for {model}"),
						)
						.with_code("no_available_deployment"));
					}
					dep
				},
			};
			tried.push(dep.id.clone());

			match self
				.attempt_with_retries(dep, deadline, attempt, route_trace)
				.await
			{
				Ok(v) => return Ok(v),
				Err(e) => last_err = Some(e),
			}
		}
	}

	/// Try one deployment, retrying transient failures in place with capped
	/// jittered backoff, within the deadline budget.
	async fn attempt_with_retries<T, F, Fut>(
		&self,
		dep: Arc<Deployment>,
		deadline: Instant,
		attempt: &F,
		route_trace: &mut RouteTrace,
	) -> Result<T, GatewayError>
	where
		F: Fn(Arc<Deployment>) -> Fut,
		Fut: Future<Output = Result<T, GatewayError>>,
	{
		let num_retries = self.inner.settings.num_retries;
		let mut last_err = None;
		for try_idx in 0..=num_retries {
			if try_idx > 0 {
				let delay = Self::backoff_delay(try_idx - 1);
				// Retries must fit in the remaining deadline budget.
				if Instant::now() + delay >= deadline {
					debug!("skipping retry of {}: deadline budget exhausted", dep.id);
					break;
				}
				route_trace.retries += 1;
				tokio::time::sleep(delay).await;
			}
			route_trace.fallback_chain.push(dep.qualified_model());

			let handle = self.start_request(&dep);
			match attempt(dep.clone()).await {
				Ok(v) => {
					handle.finish(Ok(()));
					return Ok(v);
				},
				Err(e) => {
					handle.finish(Err(e.kind));
					let retriable = e.retriable();
					last_err = Some(e);
					if !retriable {
						break;
					}
				},
			}
		}
		Err(last_err.unwrap_or_else(|| GatewayError::internal("attempt loop did not run")))
	}
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
