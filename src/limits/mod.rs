//! Resource limits
//!
//! Two independent guards keep the fabric stable under load: a process-wide
//! byte budget across every fragment ring buffer, and a per-IP rate limiter
//! applied before connections are upgraded.

pub mod memory;
pub mod rate;

pub use memory::{MemoryLimiter, MemoryLimiterConfig};
pub use rate::{RateLimiter, RateLimiterConfig};
