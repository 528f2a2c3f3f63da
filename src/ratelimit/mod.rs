//! Rate limiting decisions.

mod key;
mod limiter;

pub use key::RateKey;
pub use limiter::{Decision, LimitRule, LimiterConfig, RateLimiter};
