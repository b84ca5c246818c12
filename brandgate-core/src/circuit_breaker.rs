//! Per-provider circuit breaking for upstream AI calls.
//!
//! Each `(provider, operation)` pair carries its own breaker. The breaker is
//! closed until a run of consecutive failures reaches the threshold, open for
//! the cooldown after that, and half-open for exactly one trial call once the
//! cooldown lapses. A timed-out call counts as a failure.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::time::{timeout, Instant};

use crate::config::CircuitBreakerConfig;
use crate::error::{Error, ErrorDetails};

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct BreakerKey {
    provider: String,
    operation: String,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Gate {
    Closed { consecutive_failures: u32 },
    Open { opened_at: Instant },
    // The single trial call is in flight; every other arrival is rejected
    // as open until the trial settles.
    HalfOpen,
}

impl Gate {
    fn state(&self) -> BreakerState {
        match self {
            Gate::Closed { .. } => BreakerState::Closed,
            Gate::Open { .. } => BreakerState::Open,
            Gate::HalfOpen => BreakerState::HalfOpen,
        }
    }
}

/// A result that knows whether it came from the primary provider or from a
/// fallback while the circuit was open. Degraded results are what the usage
/// pipeline keys on to skip cost recording.
#[derive(Clone, Debug, PartialEq)]
pub struct GuardedResult<T> {
    pub value: T,
    pub degraded: bool,
}

/// The breaker registry. Cloning shares the underlying breakers.
///
/// State transitions happen in short critical sections on the per-pair gate;
/// provider calls run outside the lock, so a slow call never serializes other
/// requests to the same `(provider, operation)`. The half-open trial stays
/// exclusive because entering the trial flips the gate to `HalfOpen`, which
/// rejects every other arrival until the trial settles.
#[derive(Clone)]
pub struct CircuitBreaker {
    gates: Arc<Mutex<HashMap<BreakerKey, Arc<Mutex<Gate>>>>>,
    config: CircuitBreakerConfig,
}

fn lock_gate(gate: &Mutex<Gate>) -> std::sync::MutexGuard<'_, Gate> {
    match gate.lock() {
        Ok(gate) => gate,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            gates: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    fn gate(&self, provider: &str, operation: &str) -> Arc<Mutex<Gate>> {
        let key = BreakerKey {
            provider: provider.to_string(),
            operation: operation.to_string(),
        };
        let mut gates = match self.gates.lock() {
            Ok(gates) => gates,
            Err(poisoned) => poisoned.into_inner(),
        };
        gates
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Mutex::new(Gate::Closed {
                    consecutive_failures: 0,
                }))
            })
            .clone()
    }

    /// Current state for one pair, for the dashboard and tests.
    pub fn state(&self, provider: &str, operation: &str) -> BreakerState {
        lock_gate(&self.gate(provider, operation)).state()
    }

    /// Run `call` under the breaker for `(provider, operation)`.
    ///
    /// Returns `CircuitOpen` without invoking `call` while the breaker is
    /// open and inside its cooldown. The caller decides whether that becomes
    /// a degraded fallback response or a 503.
    pub async fn call<T, F, Fut>(
        &self,
        provider: &str,
        operation: &str,
        call: F,
    ) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let gate = self.gate(provider, operation);
        let trial = {
            let mut gate = lock_gate(&gate);
            match &*gate {
                Gate::Closed { .. } => false,
                Gate::HalfOpen => {
                    return Err(Error::new(ErrorDetails::CircuitOpen {
                        provider: provider.to_string(),
                        operation: operation.to_string(),
                    }));
                }
                Gate::Open { opened_at } => {
                    if opened_at.elapsed() < self.config.cooldown() {
                        return Err(Error::new(ErrorDetails::CircuitOpen {
                            provider: provider.to_string(),
                            operation: operation.to_string(),
                        }));
                    }
                    tracing::info!(
                        "Circuit for provider `{provider}` operation `{operation}` moving to \
                         half-open after cooldown"
                    );
                    *gate = Gate::HalfOpen;
                    true
                }
            }
        };

        let outcome = match timeout(self.config.call_timeout(), call()).await {
            Ok(result) => result,
            Err(_) => Err(Error::new(ErrorDetails::ProviderTimeout {
                provider: provider.to_string(),
                operation: operation.to_string(),
                timeout: self.config.call_timeout(),
            })),
        };

        let mut gate = lock_gate(&gate);
        match &outcome {
            Ok(_) if trial => {
                tracing::info!("Circuit for provider `{provider}` operation `{operation}` closed");
                *gate = Gate::Closed {
                    consecutive_failures: 0,
                };
            }
            Ok(_) => {
                // A call admitted while the circuit was still closed; the
                // gate may have opened behind it, in which case the trial
                // decides recovery, not this straggler.
                if let Gate::Closed {
                    consecutive_failures,
                } = &mut *gate
                {
                    *consecutive_failures = 0;
                }
            }
            Err(_) if trial => {
                // The single trial failed; restart the cooldown.
                tracing::warn!(
                    "Circuit trial failed for provider `{provider}` operation `{operation}`; \
                     reopening"
                );
                *gate = Gate::Open {
                    opened_at: Instant::now(),
                };
            }
            Err(_) => match &mut *gate {
                Gate::Closed {
                    consecutive_failures,
                } => {
                    *consecutive_failures += 1;
                    let failures = *consecutive_failures;
                    if failures >= self.config.failure_threshold {
                        tracing::warn!(
                            "Circuit for provider `{provider}` operation `{operation}` opened \
                             after {failures} consecutive failures"
                        );
                        *gate = Gate::Open {
                            opened_at: Instant::now(),
                        };
                    }
                }
                Gate::Open { .. } | Gate::HalfOpen => {}
            },
        }

        outcome
    }

    /// Run `primary` under the breaker and serve `fallback` while the
    /// circuit is open.
    ///
    /// The fallback result is tagged degraded. Primary failures other than
    /// an open circuit still propagate; only "provider known to be down"
    /// gets the seamless degraded path.
    pub async fn execute<T, P, PFut, B, BFut>(
        &self,
        provider: &str,
        operation: &str,
        primary: P,
        fallback: B,
    ) -> Result<GuardedResult<T>, Error>
    where
        P: FnOnce() -> PFut,
        PFut: Future<Output = Result<T, Error>>,
        B: FnOnce() -> BFut,
        BFut: Future<Output = Result<T, Error>>,
    {
        match self.call(provider, operation, primary).await {
            Ok(value) => Ok(GuardedResult {
                value,
                degraded: false,
            }),
            Err(e) if matches!(e.get_details(), ErrorDetails::CircuitOpen { .. }) => {
                let value = fallback().await?;
                Ok(GuardedResult {
                    value,
                    degraded: true,
                })
            }
            Err(e) => Err(e),
        }
    }
}
