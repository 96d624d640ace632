use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::breaker::CircuitBreaker;
use crate::config::RoutingStrategy;
use crate::provider::ChatProvider;
use crate::ratelimit::RateTracker;
use crate::types::ChatRequest;

/// One registered provider with its routing metadata.
pub struct Candidate {
    pub adapter: Arc<dyn ChatProvider>,
    pub priority: u8,
    pub weight: u32,
}

impl Candidate {
    pub fn new(adapter: Arc<dyn ChatProvider>, priority: u8, weight: u32) -> Self {
        Self {
            adapter,
            priority,
            weight,
        }
    }
}

/// Sort key per candidate: rate-exhausted providers sort after everything
/// else regardless of configured priority, then priority ascending, then
/// capability mismatch last. Lower sorts earlier.
type RankKey = (bool, u8, bool);

/// Produces a priority-ordered candidate list per request from live
/// breaker and rate-limit state.
pub struct Router {
    strategy: RoutingStrategy,
    rr_counter: AtomicUsize,
}

impl Router {
    pub fn new(strategy: RoutingStrategy) -> Self {
        Self {
            strategy,
            rr_counter: AtomicUsize::new(0),
        }
    }

    /// Rank the pool for one request. Open-circuit providers are excluded;
    /// rate-exhausted ones sort last rather than dropping out, since
    /// vendor quota headers are advisory and may be stale.
    pub fn rank(
        &self,
        pool: &[Candidate],
        request: &ChatRequest,
        breaker: &CircuitBreaker,
        rates: &RateTracker,
    ) -> Vec<Arc<dyn ChatProvider>> {
        let mut ranked: Vec<(RankKey, &Candidate)> = pool
            .iter()
            .filter(|c| breaker.available(c.adapter.id()))
            .map(|c| {
                let id = c.adapter.id();
                let exhausted = rates.is_exhausted(id);
                let mismatch = !supports_request(c, request);
                ((exhausted, c.priority, mismatch), c)
            })
            .collect();

        // Stable sort keeps configured order within equal keys, which is
        // what makes the static-priority strategy deterministic.
        ranked.sort_by_key(|(key, _)| *key);

        let mut ordered: Vec<Arc<dyn ChatProvider>> = Vec::with_capacity(ranked.len());
        let mut start = 0;
        while start < ranked.len() {
            let key = ranked[start].0;
            let mut end = start + 1;
            while end < ranked.len() && ranked[end].0 == key {
                end += 1;
            }
            self.emit_group(&ranked[start..end], &mut ordered);
            start = end;
        }
        ordered
    }

    /// Order one group of equal-key candidates according to the strategy.
    fn emit_group(
        &self,
        group: &[(RankKey, &Candidate)],
        ordered: &mut Vec<Arc<dyn ChatProvider>>,
    ) {
        match self.strategy {
            RoutingStrategy::Priority => {
                ordered.extend(group.iter().map(|(_, c)| Arc::clone(&c.adapter)));
            }
            RoutingStrategy::RoundRobin => {
                let offset = self.rr_counter.fetch_add(1, Ordering::Relaxed) % group.len();
                for i in 0..group.len() {
                    let (_, c) = group[(offset + i) % group.len()];
                    ordered.push(Arc::clone(&c.adapter));
                }
            }
            RoutingStrategy::WeightedRandom => {
                let mut remaining: Vec<&Candidate> = group.iter().map(|(_, c)| *c).collect();
                let mut rng = rand::thread_rng();
                while !remaining.is_empty() {
                    let total: u64 = remaining.iter().map(|c| c.weight.max(1) as u64).sum();
                    let mut draw = rng.gen_range(0..total);
                    let mut picked = 0;
                    for (i, c) in remaining.iter().enumerate() {
                        let w = c.weight.max(1) as u64;
                        if draw < w {
                            picked = i;
                            break;
                        }
                        draw -= w;
                    }
                    ordered.push(Arc::clone(&remaining.remove(picked).adapter));
                }
            }
        }
    }
}

/// Whether a candidate's catalog can serve the request: a streaming
/// request needs a streaming-capable model, and a pinned model must
/// appear in the catalog.
fn supports_request(candidate: &Candidate, request: &ChatRequest) -> bool {
    let models = candidate.adapter.models();
    if request.stream && !models.iter().any(|m| m.capabilities.streaming) {
        return false;
    }
    if let Some(pinned) = &request.model {
        // Pins may carry a vendor routing prefix like "anthropic/".
        let bare = pinned.rsplit('/').next().unwrap_or(pinned);
        if !models.iter().any(|m| m.id == bare || &m.id == pinned) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, ProviderSettings};
    use crate::provider::anthropic::AnthropicAdapter;
    use crate::provider::gemini::GeminiAdapter;
    use crate::provider::openai::OpenAiAdapter;
    use crate::types::{ChatMessage, ProviderId};

    fn pool() -> Vec<Candidate> {
        vec![
            Candidate::new(
                Arc::new(OpenAiAdapter::new(ProviderSettings::new(
                    ProviderId::OpenAi,
                    "k",
                ))),
                1,
                1,
            ),
            Candidate::new(
                Arc::new(AnthropicAdapter::new(ProviderSettings::new(
                    ProviderId::Anthropic,
                    "k",
                ))),
                2,
                1,
            ),
            Candidate::new(
                Arc::new(GeminiAdapter::new(ProviderSettings::new(
                    ProviderId::Gemini,
                    "k",
                ))),
                3,
                1,
            ),
        ]
    }

    fn request() -> ChatRequest {
        ChatRequest::new(vec![ChatMessage::user("hi")])
    }

    fn ids(ranked: &[Arc<dyn ChatProvider>]) -> Vec<ProviderId> {
        ranked.iter().map(|a| a.id()).collect()
    }

    #[test]
    fn test_priority_order_is_deterministic() {
        let router = Router::new(RoutingStrategy::Priority);
        let breaker = CircuitBreaker::new(BreakerConfig::default());
        let rates = RateTracker::new();
        let pool = pool();

        for _ in 0..3 {
            let ranked = router.rank(&pool, &request(), &breaker, &rates);
            assert_eq!(
                ids(&ranked),
                vec![ProviderId::OpenAi, ProviderId::Anthropic, ProviderId::Gemini]
            );
        }
    }

    #[test]
    fn test_open_circuit_excluded() {
        let router = Router::new(RoutingStrategy::Priority);
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            recovery_timeout_secs: 10_000,
            ..Default::default()
        });
        let rates = RateTracker::new();
        let pool = pool();

        breaker.record_failure(ProviderId::OpenAi);
        let ranked = router.rank(&pool, &request(), &breaker, &rates);
        assert_eq!(ids(&ranked), vec![ProviderId::Anthropic, ProviderId::Gemini]);
    }

    #[test]
    fn test_rate_exhausted_ranks_last() {
        let router = Router::new(RoutingStrategy::Priority);
        let breaker = CircuitBreaker::new(BreakerConfig::default());
        let rates = RateTracker::new();
        let pool = pool();

        // OpenAI holds the top configured priority, but exhaustion
        // pushes it behind everything still under quota.
        rates.mark_exhausted(ProviderId::OpenAi, None);
        let ranked = router.rank(&pool, &request(), &breaker, &rates);
        assert_eq!(
            ids(&ranked),
            vec![ProviderId::Anthropic, ProviderId::Gemini, ProviderId::OpenAi]
        );
    }

    #[test]
    fn test_pinned_model_mismatch_ranks_last() {
        let router = Router::new(RoutingStrategy::Priority);
        let breaker = CircuitBreaker::new(BreakerConfig::default());
        let rates = RateTracker::new();

        // Capability match only breaks ties between equal priorities;
        // configured priority still dominates.
        let mut pool = pool();
        for c in &mut pool {
            c.priority = 1;
        }

        let req = request().with_model("gemini-2.0-flash");
        let ranked = router.rank(&pool, &req, &breaker, &rates);
        // Gemini is the only catalog carrying the pinned model.
        assert_eq!(ids(&ranked)[0], ProviderId::Gemini);
    }

    #[test]
    fn test_round_robin_rotates_equal_priority() {
        let router = Router::new(RoutingStrategy::RoundRobin);
        let breaker = CircuitBreaker::new(BreakerConfig::default());
        let rates = RateTracker::new();

        let mut pool = pool();
        for c in &mut pool {
            c.priority = 1;
        }

        let first = ids(&router.rank(&pool, &request(), &breaker, &rates));
        let second = ids(&router.rank(&pool, &request(), &breaker, &rates));
        assert_ne!(first[0], second[0]);
        // Rotation, not reshuffling: same set every time.
        let mut a = first.clone();
        let mut b = second.clone();
        a.sort_by_key(|id| id.to_string());
        b.sort_by_key(|id| id.to_string());
        assert_eq!(a, b);
    }

    #[test]
    fn test_weighted_random_orders_whole_pool() {
        let router = Router::new(RoutingStrategy::WeightedRandom);
        let breaker = CircuitBreaker::new(BreakerConfig::default());
        let rates = RateTracker::new();

        let mut pool = pool();
        for c in &mut pool {
            c.priority = 1;
            c.weight = 5;
        }

        let ranked = router.rank(&pool, &request(), &breaker, &rates);
        assert_eq!(ranked.len(), 3);
    }
}
