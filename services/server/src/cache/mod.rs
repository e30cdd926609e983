//! Fault-isolated access to the sharded cache cluster.
//!
//! Every command and script invocation runs through [`CacheCluster::run`] /
//! [`CacheCluster::run_script`]: a circuit breaker guards the cluster as a
//! whole, and transient failures (I/O, timeouts, cluster redirection churn)
//! are retried a bounded number of times with a doubling delay.  Logical
//! errors (wrong type, malformed script replies) surface immediately and do
//! not count against the breaker.
//!
//! Scripts are `redis::Script` values: invocation goes out as EVALSHA by
//! digest and the library reloads the body once on a NOSCRIPT response.

pub mod keyspace;

use deadpool_redis::{redis, Config, Connection, Pool, Runtime};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::CacheConfig;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache command failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("cache pool exhausted: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("cache circuit breaker is open")]
    BreakerOpen,

    #[error("cache configuration: {0}")]
    Config(String),

    #[error("corrupt cache payload: {0}")]
    Corrupt(String),
}

impl CacheError {
    /// Transient errors are safe to retry and are the only errors that count
    /// against the circuit breaker.
    pub fn is_transient(&self) -> bool {
        match self {
            CacheError::Redis(e) => is_transient_redis(e),
            CacheError::Pool(_) | CacheError::BreakerOpen => true,
            CacheError::Config(_) | CacheError::Corrupt(_) => false,
        }
    }
}

fn is_transient_redis(e: &redis::RedisError) -> bool {
    e.is_io_error()
        || e.is_timeout()
        || e.is_connection_refusal()
        || e.is_connection_dropped()
        || e.is_cluster_error()
        || matches!(
            e.kind(),
            redis::ErrorKind::TryAgain | redis::ErrorKind::BusyLoadingError
        )
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Ring-buffer failure-ratio breaker.
///
/// Closed: all calls pass, outcomes are recorded into a bounded window.
/// Open: calls fail fast until the cooldown elapses, after which a single
/// probe call is let through (half-open); its outcome closes or re-opens
/// the breaker.
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    window: usize,
    threshold: f64,
    min_calls: usize,
    cooldown: Duration,
}

struct BreakerState {
    outcomes: VecDeque<bool>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(window: usize, threshold: f64, min_calls: usize, cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState {
                outcomes: VecDeque::with_capacity(window),
                opened_at: None,
                probe_in_flight: false,
            }),
            window: window.max(1),
            threshold,
            min_calls: min_calls.max(1),
            cooldown,
        }
    }

    /// Returns `Err(BreakerOpen)` when calls must fail fast.
    pub fn check(&self) -> Result<(), CacheError> {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match state.opened_at {
            None => Ok(()),
            Some(opened) => {
                if opened.elapsed() >= self.cooldown && !state.probe_in_flight {
                    state.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(CacheError::BreakerOpen)
                }
            }
        }
    }

    pub fn record(&self, success: bool) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        if state.opened_at.is_some() {
            // Only a half-open probe reaches here.
            state.probe_in_flight = false;
            if success {
                state.opened_at = None;
                state.outcomes.clear();
            } else {
                state.opened_at = Some(Instant::now());
            }
            return;
        }

        if state.outcomes.len() == self.window {
            state.outcomes.pop_front();
        }
        state.outcomes.push_back(success);

        if state.outcomes.len() >= self.min_calls {
            let failures = state.outcomes.iter().filter(|ok| !**ok).count();
            let ratio = failures as f64 / state.outcomes.len() as f64;
            if ratio >= self.threshold {
                state.opened_at = Some(Instant::now());
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.state
            .lock()
            .expect("breaker lock poisoned")
            .opened_at
            .is_some()
    }
}

// ---------------------------------------------------------------------------
// Cluster client
// ---------------------------------------------------------------------------

/// Pooled connection to one logical cache cluster, wrapped in the breaker
/// and retry policy described in the module docs.
pub struct CacheCluster {
    pool: Pool,
    breaker: CircuitBreaker,
    retries: u32,
    retry_delay: Duration,
    /// Logical shard count for the persist queue index.
    pub shards: u32,
    url: String,
}

impl CacheCluster {
    pub fn new(cfg: &CacheConfig) -> Result<Self, CacheError> {
        let pool = Config::from_url(cfg.url.clone())
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::Config(e.to_string()))?;
        Ok(Self {
            pool,
            breaker: CircuitBreaker::new(
                cfg.breaker_window,
                cfg.breaker_threshold,
                cfg.breaker_min_calls,
                cfg.breaker_cooldown,
            ),
            retries: cfg.retries,
            retry_delay: cfg.retry_delay,
            shards: cfg.shards,
            url: cfg.url.clone(),
        })
    }

    /// A bare client for the dedicated pub/sub connection; the keyspace
    /// listener manages its own reconnects outside the breaker.
    pub fn pubsub_client(&self) -> Result<redis::Client, CacheError> {
        Ok(redis::Client::open(self.url.as_str())?)
    }

    /// Run a single command against a pooled connection.
    ///
    /// The command may be sent more than once (bounded retries); every
    /// mutation we issue is a script or an idempotent command, so
    /// re-execution is safe.
    pub async fn run<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, CacheError> {
        self.execute(Op::Cmd(cmd)).await
    }

    /// Run a pipeline under the same breaker/retry policy.
    pub async fn run_pipe<T: redis::FromRedisValue>(
        &self,
        pipe: &redis::Pipeline,
    ) -> Result<T, CacheError> {
        self.execute(Op::Pipe(pipe)).await
    }

    /// Invoke a prepared script under the same breaker/retry policy.
    pub async fn run_script<T: redis::FromRedisValue>(
        &self,
        invocation: &redis::ScriptInvocation<'_>,
    ) -> Result<T, CacheError> {
        self.execute(Op::Script(invocation)).await
    }

    async fn execute<T: redis::FromRedisValue>(&self, op: Op<'_>) -> Result<T, CacheError> {
        let mut attempt: u32 = 0;
        loop {
            self.breaker.check()?;
            let result = self.attempt(&op).await;
            match result {
                Ok(value) => {
                    self.breaker.record(true);
                    return Ok(value);
                }
                Err(e) => {
                    let transient = e.is_transient();
                    self.breaker.record(!transient);
                    if transient && attempt < self.retries {
                        attempt += 1;
                        tokio::time::sleep(self.retry_delay * 2u32.saturating_pow(attempt - 1))
                            .await;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn attempt<T: redis::FromRedisValue>(&self, op: &Op<'_>) -> Result<T, CacheError> {
        let mut conn: Connection = self.pool.get().await?;
        let value = match op {
            Op::Cmd(cmd) => cmd.query_async(&mut conn).await?,
            Op::Pipe(pipe) => pipe.query_async(&mut conn).await?,
            Op::Script(invocation) => invocation.invoke_async(&mut conn).await?,
        };
        Ok(value)
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

enum Op<'a> {
    Cmd(&'a redis::Cmd),
    Pipe(&'a redis::Pipeline),
    Script(&'a redis::ScriptInvocation<'a>),
}
