//! Rate limiting logic and state management.

mod limiter;
mod policies;
mod rules;
mod window;

pub use limiter::SlidingWindowRateLimiter;
pub use policies::RateLimitPolicies;
pub use rules::{RateLimitConfig, TimeUnit};
pub use window::{RateLimitResult, WindowState};
