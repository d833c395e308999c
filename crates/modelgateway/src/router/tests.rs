use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use super::*;
use crate::config::Config;
use crate::error::{ErrorKind, GatewayError};
use crate::llm::registry::Registry;

const GROUP_CONFIG: &str = r#"
model_list:
  - model_name: gpt-4o
    litellm_params:
      model: openai/gpt-4o
  - model_name: gpt-4o
    litellm_params:
      model: azure/gpt-4o-eastus
      api_base: https://eastus.example.azure.com
router_settings:
  routing_strategy: least-busy
  num_retries: 2
  cooldown_time: 30
"#;

fn test_router(config: &str) -> Router {
	let cfg = Config::parse(config).unwrap();
	let registry = Registry::from_config(&cfg.model_list, &cfg.router_settings).unwrap();
	Router::new(registry, cfg.router_settings)
}

fn deadline() -> Instant {
	Instant::now() + Duration::from_secs(600)
}

#[tokio::test(start_paused = true)]
async fn fallback_within_group_records_full_chain() {
	// openai keeps returning 429; after the initial try plus two retries the
	// router fails over to the azure deployment in the same group.
	let router = test_router(GROUP_CONFIG);
	// Pin one in-flight request on azure so least-busy deterministically
	// picks openai first.
	let azure = router.registry().group("gpt-4o").unwrap()[1].clone();
	let _busy = router.start_request(&azure);
	let calls = Arc::new(AtomicU32::new(0));
	let calls2 = calls.clone();

	let (result, trace) = router
		.route("gpt-4o", deadline(), move |dep| {
			let calls = calls2.clone();
			async move {
				calls.fetch_add(1, Ordering::SeqCst);
				if dep.id.starts_with("openai/") {
					Err(GatewayError::new(ErrorKind::RateLimited, "rate limited"))
				} else {
					Ok("hi".to_string())
				}
			}
		})
		.await;

	assert_eq!(result.unwrap(), "hi");
	assert_eq!(calls.load(Ordering::SeqCst), 4);
	let chain: Vec<&str> = trace.fallback_chain.iter().map(|s| s.as_str()).collect();
	assert_eq!(
		chain,
		vec![
			"openai/gpt-4o",
			"openai/gpt-4o",
			"openai/gpt-4o",
			"azure/gpt-4o-eastus",
		]
	);
	assert_eq!(trace.retries, 2);
}

#[tokio::test(start_paused = true)]
async fn cooled_deployments_are_never_selected() {
	let router = test_router(GROUP_CONFIG);
	let registry = router.registry();
	let openai = registry.group("gpt-4o").unwrap()[0].clone();
	router.record_failure(&openai.id, ErrorKind::RateLimited);
	assert!(router.is_cooled(&openai.id));

	// With one deployment cooled, selection still succeeds on the other.
	for _ in 0..20 {
		let dep = router.select("gpt-4o", &[]).unwrap();
		assert_ne!(dep.id, openai.id);
	}

	// With every deployment cooled, the group is exhausted: a distinct
	// failure from an unknown model.
	let azure = registry.group("gpt-4o").unwrap()[1].clone();
	router.record_failure(&azure.id, ErrorKind::Timeout);
	let err = router.select("gpt-4o", &[]).unwrap_err();
	assert_eq!(err.code.as_deref(), Some("no_available_deployment"));
	let err = router.select("not-a-model", &[]).unwrap_err();
	assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test(start_paused = true)]
async fn success_resets_cooldown_state() {
	let router = test_router(GROUP_CONFIG);
	let registry = router.registry();
	let dep = registry.group("gpt-4o").unwrap()[0].clone();
	router.record_failure(&dep.id, ErrorKind::UpstreamError);
	assert!(router.is_cooled(&dep.id));
	router.record_success(&dep.id);
	assert!(!router.is_cooled(&dep.id));
}

#[tokio::test(start_paused = true)]
async fn non_transient_errors_do_not_retry() {
	let router = test_router(GROUP_CONFIG);
	let calls = Arc::new(AtomicU32::new(0));
	let calls2 = calls.clone();
	let (result, trace) = router
		.route("gpt-4o", deadline(), move |_dep| {
			let calls = calls2.clone();
			async move {
				calls.fetch_add(1, Ordering::SeqCst);
				Err::<(), _>(GatewayError::new(
					ErrorKind::ContextWindowExceeded,
					"prompt too large",
				))
			}
		})
		.await;
	assert_eq!(result.unwrap_err().kind, ErrorKind::ContextWindowExceeded);
	// One try, no same-deployment retries, no fallback.
	assert_eq!(calls.load(Ordering::SeqCst), 1);
	assert_eq!(trace.retries, 0);
	assert_eq!(trace.fallback_chain.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn configured_fallback_models_are_walked() {
	let config = r#"
model_list:
  - model_name: gpt-4o
    litellm_params:
      model: openai/gpt-4o
  - model_name: claude
    litellm_params:
      model: anthropic/claude-sonnet-4-5
router_settings:
  num_retries: 0
  fallbacks:
    - gpt-4o: ["claude"]
"#;
	let router = test_router(config);
	let (result, trace) = router
		.route("gpt-4o", deadline(), |dep| async move {
			if dep.id.starts_with("openai/") {
				Err(GatewayError::new(ErrorKind::UpstreamError, "boom"))
			} else {
				Ok(dep.qualified_model().to_string())
			}
		})
		.await;
	assert_eq!(result.unwrap(), "anthropic/claude-sonnet-4-5");
	let chain: Vec<&str> = trace.fallback_chain.iter().map(|s| s.as_str()).collect();
	assert_eq!(chain, vec!["openai/gpt-4o", "anthropic/claude-sonnet-4-5"]);
}

#[tokio::test(start_paused = true)]
async fn retries_skip_when_deadline_budget_is_exhausted() {
	let router = test_router(GROUP_CONFIG);
	let calls = Arc::new(AtomicU32::new(0));
	let calls2 = calls.clone();
	// A deadline too close to fit any backoff sleep.
	let deadline = Instant::now() + Duration::from_millis(10);
	let (result, trace) = router
		.route("gpt-4o", deadline, move |_dep| {
			let calls = calls2.clone();
			async move {
				calls.fetch_add(1, Ordering::SeqCst);
				Err::<(), _>(GatewayError::new(ErrorKind::Timeout, "upstream timeout"))
			}
		})
		.await;
	assert!(result.is_err());
	// Each deployment is tried once; the backoff would overrun the deadline
	// so no retry is attempted.
	assert_eq!(trace.retries, 0);
	assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn backoff_is_capped_and_jittered() {
	for attempt in 0..10 {
		let d = Router::backoff_delay(attempt);
		assert!(d <= Duration::from_secs(8).mul_f64(1.2), "attempt {attempt}: {d:?}");
		assert!(d >= Duration::from_millis(400), "attempt {attempt}: {d:?}");
	}
}

#[tokio::test(start_paused = true)]
async fn cooldown_duration_grows_exponentially() {
	let router = test_router(GROUP_CONFIG);
	let registry = router.registry();
	let dep = registry.group("gpt-4o").unwrap()[0].clone();

	// First cooldown: 30s base.
	router.record_failure(&dep.id, ErrorKind::RateLimited);
	tokio::time::sleep(Duration::from_secs(31)).await;
	tokio::task::yield_now().await;
	// With tokio's paused clock, std Instant does not advance, so verify
	// growth through the recorded entries instead.
	router.record_failure(&dep.id, ErrorKind::RateLimited);
	let shard = router.shard(&dep.id).lock();
	let entry = shard.get(&dep.id).unwrap();
	assert_eq!(entry.consecutive_cooldowns, 2);
}
