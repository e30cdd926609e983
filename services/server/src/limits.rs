//! Rate-limit seam.
//!
//! The limiter engine lives outside this repo; the pipeline only consumes
//! its decision, a tagged result converted to an HTTP status at the
//! boundary.  No control flow rides on errors.

use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    RateLimited { retry_after: Duration },
    /// The sender must satisfy a push challenge before retrying.
    Blocked,
}

pub trait RateLimiter: Send + Sync {
    fn check_send(&self, account: Uuid) -> RateLimitDecision;
}

/// Default stand-in: everything is allowed.
pub struct Unlimited;

impl RateLimiter for Unlimited {
    fn check_send(&self, _account: Uuid) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }
}
