//! The request pipeline: admission, cache, budget, breaker, ledger.
//!
//! One `Governance` object is constructed at process start and shared by
//! reference; there is no ambient global state. For one AI request the order
//! is fixed: the rate limiter admits, the response cache may short-circuit,
//! the cost governor may deny or downgrade the model, the circuit breaker
//! guards the provider call, and only a successful non-degraded call writes
//! the usage ledger and populates the cache.

use std::future::Future;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::{cache_key, ResponseCache};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::cost::CostGovernor;
use crate::db::CounterQueries;
use crate::error::{Error, ErrorDetails};
use crate::rate_limiting::{RateLimitCategory, RateLimitDecision, RateLimiter, RequestIdentity};
use crate::usage::{UsageLedger, UsageRecord};

/// One AI generation request as the pipeline sees it.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub service: String,
    pub provider: String,
    pub operation: String,
    pub model: String,
    #[serde(default)]
    pub estimated_tokens: u64,
    #[serde(default)]
    pub parameters: Value,
}

/// What a provider call yields: the payload plus realized usage.
#[derive(Clone, Debug, PartialEq)]
pub struct ProviderResponse {
    pub payload: Value,
    pub tokens: u64,
    pub cost: f64,
}

/// The pipeline's answer for one admitted request.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    pub payload: Value,
    /// Model actually used, after any budget downgrade.
    pub model: String,
    pub tokens: u64,
    pub cost: f64,
    pub cached: bool,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub rate_limit: RateLimitDecision,
}

pub struct Governance {
    limiter: RateLimiter,
    cache: ResponseCache,
    governor: CostGovernor,
    breaker: CircuitBreaker,
    ledger: UsageLedger,
}

impl Governance {
    pub fn new(
        config: &Config,
        counter_store: std::sync::Arc<dyn CounterQueries>,
        ledger: UsageLedger,
    ) -> Self {
        Self {
            limiter: RateLimiter::new(counter_store, config.rate_limiting.clone()),
            cache: ResponseCache::new(&config.cache),
            governor: CostGovernor::new(ledger.clone(), config.budgets.clone()),
            breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
            ledger,
        }
    }

    pub fn governor(&self) -> &CostGovernor {
        &self.governor
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Admission check alone, for non-generation endpoints that still sit
    /// behind a category limit.
    pub async fn admit(
        &self,
        category: RateLimitCategory,
        identity: &RequestIdentity,
    ) -> Result<RateLimitDecision, Error> {
        let decision = self.limiter.check(category, identity).await;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(Error::new(ErrorDetails::RateLimitExceeded {
                category: category.as_str().to_string(),
                limit: decision.limit,
                reset_at: decision.reset_at,
                retry_after_s: decision.retry_after_s.unwrap_or(1),
            }))
        }
    }

    /// Run one AI generation through the whole pipeline.
    ///
    /// `primary` receives the model to call (the requested one, or the
    /// configured cheaper fallback once the budget is exhausted).
    /// `fallback` is only invoked while the provider's circuit is open; its
    /// result is tagged degraded, is not cached, and records no cost.
    pub async fn execute<P, PFut, B, BFut>(
        &self,
        identity: &RequestIdentity,
        request: &GenerationRequest,
        primary: P,
        fallback: B,
    ) -> Result<GenerationResult, Error>
    where
        P: FnOnce(String) -> PFut,
        PFut: Future<Output = Result<ProviderResponse, Error>>,
        B: FnOnce() -> BFut,
        BFut: Future<Output = Result<ProviderResponse, Error>>,
    {
        let rate_limit = self.admit(RateLimitCategory::Ai, identity).await?;

        let key = cache_key(&request.operation, &request.parameters);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(GenerationResult {
                payload: hit.payload,
                model: request.model.clone(),
                tokens: 0,
                cost: 0.0,
                cached: true,
                degraded: false,
                warning: None,
                rate_limit,
            });
        }

        let user_id = identity.stable_id();
        let preflight = self
            .governor
            .preflight(&request.service, &user_id, Utc::now())
            .await;
        if !preflight.allowed {
            return Err(Error::new(ErrorDetails::BudgetExceeded {
                service: request.service.clone(),
                percent_used: preflight.usage_stats.percent_used,
            }));
        }
        let model = preflight
            .fallback_model
            .clone()
            .unwrap_or_else(|| request.model.clone());

        let guarded = self
            .breaker
            .execute(
                &request.provider,
                &request.operation,
                || primary(model.clone()),
                fallback,
            )
            .await?;

        if guarded.degraded {
            return Ok(GenerationResult {
                payload: guarded.value.payload,
                model,
                tokens: 0,
                cost: 0.0,
                cached: false,
                degraded: true,
                warning: preflight.warning,
                rate_limit,
            });
        }

        let response = guarded.value;
        self.ledger
            .record(UsageRecord::new(
                &request.service,
                &model,
                &request.operation,
                &user_id,
                response.tokens,
                response.cost,
            ))
            .await;
        self.cache.insert(key, response.payload.clone());

        Ok(GenerationResult {
            payload: response.payload,
            model,
            tokens: response.tokens,
            cost: response.cost,
            cached: false,
            degraded: false,
            warning: preflight.warning,
            rate_limit,
        })
    }
}
