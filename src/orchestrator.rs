use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::config::OrchestratorConfig;
use crate::error::AiError;
use crate::provider::{ChatProvider, ChunkStream};
use crate::ratelimit::RateTracker;
use crate::registry;
use crate::router::{Candidate, Router};
use crate::types::{ChatRequest, ChatResponse, ProviderId, RateLimitStatus, StreamChunk};

/// Health snapshot for one provider, consumed by the host application's
/// status endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderHealth {
    pub provider: ProviderId,
    pub circuit: CircuitState,
    pub rate_limit: Option<RateLimitStatus>,
}

/// Top-level façade tying router, circuit breaker, rate tracker and
/// adapters into a single entry point with failover.
///
/// Explicitly constructed and passed in by the host application; there is
/// no process-wide instance.
pub struct Orchestrator {
    pool: Vec<Candidate>,
    router: Router,
    breaker: Arc<CircuitBreaker>,
    rates: Arc<RateTracker>,
}

impl Orchestrator {
    /// Build from configuration, initializing every enabled provider.
    /// Providers that fail to initialize are excluded; an empty pool is a
    /// valid degraded state.
    pub async fn from_config(config: OrchestratorConfig) -> Self {
        let adapters = registry::create_adapters(config.providers.clone()).await;
        let pool = adapters
            .into_iter()
            .map(|(settings, adapter)| {
                Candidate::new(adapter, settings.priority, settings.weight)
            })
            .collect();
        Self::new(pool, config)
    }

    /// Assemble from an existing pool. Used directly by tests and by
    /// hosts that construct adapters themselves.
    pub fn new(pool: Vec<Candidate>, config: OrchestratorConfig) -> Self {
        if pool.is_empty() {
            warn!("orchestrator starting with no providers; requests will fail");
        }
        Self {
            pool,
            router: Router::new(config.strategy),
            breaker: Arc::new(CircuitBreaker::new(config.breaker)),
            rates: Arc::new(RateTracker::new()),
        }
    }

    /// Single-shot completion with failover across ranked providers.
    pub async fn ask(&self, request: &ChatRequest) -> Result<ChatResponse, AiError> {
        request.validate()?;

        let ranked = self.router.rank(&self.pool, request, &self.breaker, &self.rates);
        let mut attempts = 0;
        let mut last_err: Option<AiError> = None;

        for adapter in ranked {
            let id = adapter.id();
            if !self.breaker.allow_request(id) {
                debug!("skipping {}: circuit open", id);
                continue;
            }
            attempts += 1;

            match adapter.chat(request).await {
                Ok(response) => {
                    self.record_success(id, adapter.as_ref());
                    return Ok(response);
                }
                Err(err) => {
                    self.record_error(id, &err);
                    info!("failing over after {} error: {}", id, err);
                    last_err = Some(err);
                }
            }
        }

        Err(Self::aggregate(attempts, last_err))
    }

    /// Streaming completion. Failover only happens while opening the
    /// stream and waiting for its first chunk; once a chunk has been
    /// yielded to the caller, a mid-stream failure terminates the stream
    /// instead of switching providers.
    pub async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream, AiError> {
        request.validate()?;

        let ranked = self.router.rank(&self.pool, request, &self.breaker, &self.rates);
        let mut attempts = 0;
        let mut last_err: Option<AiError> = None;

        for adapter in ranked {
            let id = adapter.id();
            if !self.breaker.allow_request(id) {
                debug!("skipping {}: circuit open", id);
                continue;
            }
            attempts += 1;

            match adapter.chat_stream(request).await {
                Ok(mut stream) => match stream.next().await {
                    Some(Ok(first)) => {
                        return Ok(self.adopt_stream(adapter, first, stream));
                    }
                    Some(Err(err)) => {
                        self.record_error(id, &err);
                        info!("failing over after {} stream error: {}", id, err);
                        last_err = Some(err);
                    }
                    None => {
                        let err = AiError::Parse("provider returned an empty stream".into());
                        self.record_error(id, &err);
                        last_err = Some(err);
                    }
                },
                Err(err) => {
                    self.record_error(id, &err);
                    info!("failing over after {} stream error: {}", id, err);
                    last_err = Some(err);
                }
            }
        }

        Err(Self::aggregate(attempts, last_err))
    }

    /// Circuit and rate-limit snapshot per registered provider.
    pub fn provider_health(&self) -> Vec<ProviderHealth> {
        self.pool
            .iter()
            .map(|c| {
                let id = c.adapter.id();
                ProviderHealth {
                    provider: id,
                    circuit: self.breaker.state(id),
                    rate_limit: self.rates.status(id),
                }
            })
            .collect()
    }

    /// Commit to one provider's stream: replay the probed first chunk,
    /// then forward the rest, recording the outcome in the breaker when
    /// the terminal chunk (or an error) arrives.
    fn adopt_stream(
        &self,
        adapter: Arc<dyn ChatProvider>,
        first: StreamChunk,
        mut rest: ChunkStream,
    ) -> ChunkStream {
        let breaker = Arc::clone(&self.breaker);
        let rates = Arc::clone(&self.rates);
        let id = adapter.id();

        Box::pin(async_stream::stream! {
            if first.done {
                breaker.record_success(id);
                rates.record(id, adapter.rate_limit_status());
                yield Ok(first);
                return;
            }
            yield Ok(first);

            while let Some(item) = rest.next().await {
                match item {
                    Ok(chunk) => {
                        let done = chunk.done;
                        if done {
                            breaker.record_success(id);
                            rates.record(id, adapter.rate_limit_status());
                        }
                        yield Ok(chunk);
                        if done {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!("{} stream failed mid-flight: {}", id, err);
                        breaker.record_failure(id);
                        yield Err(err);
                        return;
                    }
                }
            }

            // The vendor closed the connection without a terminal chunk.
            breaker.record_failure(id);
            yield Err(AiError::Network("stream ended before completion".into()));
        })
    }

    fn record_success(&self, id: ProviderId, adapter: &dyn ChatProvider) {
        self.breaker.record_success(id);
        self.rates.record(id, adapter.rate_limit_status());
    }

    fn record_error(&self, id: ProviderId, err: &AiError) {
        match err {
            AiError::Authentication(_) => {
                self.breaker.record_auth_failure(id);
            }
            AiError::RateLimited { retry_after, .. } => {
                self.rates.mark_exhausted(id, *retry_after);
                self.breaker.record_rate_limited(id);
            }
            _ => {
                self.breaker.record_failure(id);
            }
        }
    }

    fn aggregate(attempts: usize, last_err: Option<AiError>) -> AiError {
        AiError::AllProvidersFailed {
            attempts,
            last: Box::new(last_err.unwrap_or(AiError::NoProviders)),
        }
    }
}
