//! Per-IP rate limiting
//!
//! Two independent checks, applied in order on every HTTP request:
//!
//! 1. A lazy leaky-bucket request counter. Each counter decays by
//!    `max_requests_per_second` for every elapsed second since it was last
//!    checked; a request is rejected when the decayed count has reached
//!    `max(burst, max_requests_per_second)`.
//! 2. A hard cap on concurrent upgraded connections.
//!
//! A whitelist exempts trusted addresses: `"*"` exempts everything, else a
//! comma-separated list of CIDR ranges. The membership test is linear; the
//! list is expected to be short.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use ipnet::IpNet;

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// True if the limiter is active
    pub enabled: bool,

    /// `"*"` or comma-separated CIDR ranges exempt from limits
    pub whitelist: String,

    /// Max concurrent connections per IP (0 = unlimited)
    pub max_connections: usize,

    /// Max requests per second per IP (0 = unlimited)
    pub max_requests_per_second: u32,

    /// Request burst allowance
    pub request_burst: u32,

    /// Interval between sweeps of the request-count map, in seconds
    pub cleanup_interval_seconds: i64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            whitelist: String::new(),
            max_connections: 0,
            max_requests_per_second: 0,
            request_burst: 0,
            cleanup_interval_seconds: 10,
        }
    }
}

/// Request counter for one IP
#[derive(Debug)]
struct RequestCount {
    /// Outstanding request count
    count: u32,

    /// Unix seconds of the last decay
    timestamp: i64,
}

impl RequestCount {
    /// Decay the counter by the allowance accumulated since last check
    fn update(&mut self, now: i64, max_requests_per_second: u32) {
        let seconds_passed = now - self.timestamp;

        if seconds_passed <= 0 {
            return;
        }

        let allowed = (max_requests_per_second as i64).saturating_mul(seconds_passed);

        if allowed >= self.count as i64 {
            self.count = 0;
        } else {
            self.count -= allowed as u32;
        }

        self.timestamp = now;
    }
}

#[derive(Debug, Default)]
struct RateLimiterState {
    /// IP -> active connection count
    connections_count: HashMap<IpAddr, usize>,

    /// IP -> request counter
    request_count: HashMap<IpAddr, RequestCount>,

    /// Unix seconds of the last request-count sweep
    last_cleanup: i64,
}

/// Per-IP connection cap and request limiter
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    whitelist: Vec<IpNet>,
    whitelist_all: bool,
    request_limit: u32,
    state: Mutex<RateLimiterState>,
}

fn now_unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl RateLimiter {
    /// Create a new rate limiter, parsing the whitelist
    pub fn new(config: RateLimiterConfig) -> Self {
        let mut whitelist = Vec::new();
        let mut whitelist_all = false;

        if config.whitelist == "*" {
            whitelist_all = true;
        } else if !config.whitelist.is_empty() {
            for part in config.whitelist.split(',') {
                match part.trim().parse::<IpNet>() {
                    Ok(range) => whitelist.push(range),
                    Err(_) => {
                        tracing::warn!(range = part, "Config error: invalid IP range in whitelist");
                    }
                }
            }
        }

        let request_limit = config.request_burst.max(config.max_requests_per_second);

        Self {
            config,
            whitelist,
            whitelist_all,
            request_limit,
            state: Mutex::new(RateLimiterState {
                last_cleanup: now_unix_seconds(),
                ..Default::default()
            }),
        }
    }

    /// Checks if an IP is exempt from the limits
    fn is_exempted(&self, ip: IpAddr) -> bool {
        if self.whitelist_all {
            return true;
        }

        self.whitelist.iter().any(|range| range.contains(&ip))
    }

    /// Call when a connection is accepted; false means reject
    pub fn start_connection(&self, ip: IpAddr) -> bool {
        if !self.config.enabled || self.config.max_connections == 0 || self.is_exempted(ip) {
            return true;
        }

        let mut state = self.state.lock().unwrap();
        let count = state.connections_count.get(&ip).copied().unwrap_or(0);

        if count >= self.config.max_connections {
            return false;
        }

        state.connections_count.insert(ip, count + 1);
        true
    }

    /// Call when a connection ends
    pub fn end_connection(&self, ip: IpAddr) {
        if !self.config.enabled || self.config.max_connections == 0 || self.is_exempted(ip) {
            return;
        }

        let mut state = self.state.lock().unwrap();
        let count = state.connections_count.get(&ip).copied().unwrap_or(0);

        if count <= 1 {
            state.connections_count.remove(&ip);
        } else {
            state.connections_count.insert(ip, count - 1);
        }
    }

    /// Counts a request; false means reject (HTTP 429)
    pub fn count_request(&self, ip: IpAddr) -> bool {
        self.count_request_at(ip, now_unix_seconds())
    }

    fn count_request_at(&self, ip: IpAddr, now: i64) -> bool {
        if !self.config.enabled || self.config.max_requests_per_second == 0 || self.is_exempted(ip)
        {
            return true;
        }

        let mut state = self.state.lock().unwrap();

        if now - state.last_cleanup >= self.config.cleanup_interval_seconds {
            let max_rps = self.config.max_requests_per_second;
            let before = state.request_count.len();

            state.request_count.retain(|_, rc| {
                rc.update(now, max_rps);
                rc.count > 0
            });

            tracing::debug!(
                removed = before - state.request_count.len(),
                "Swept request counters"
            );

            state.last_cleanup = now;
        }

        let rc = state.request_count.entry(ip).or_insert(RequestCount {
            count: 0,
            timestamp: now,
        });

        rc.update(now, self.config.max_requests_per_second);

        if rc.count >= self.request_limit {
            return false;
        }

        rc.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn limiter(config: RateLimiterConfig) -> RateLimiter {
        RateLimiter::new(config)
    }

    #[test]
    fn test_disabled_allows_everything() {
        let rl = limiter(RateLimiterConfig::default());

        for _ in 0..1000 {
            assert!(rl.count_request(ip("10.0.0.1")));
            assert!(rl.start_connection(ip("10.0.0.1")));
        }
    }

    #[test]
    fn test_connection_cap() {
        let rl = limiter(RateLimiterConfig {
            enabled: true,
            max_connections: 2,
            ..Default::default()
        });

        assert!(rl.start_connection(ip("10.0.0.1")));
        assert!(rl.start_connection(ip("10.0.0.1")));
        assert!(!rl.start_connection(ip("10.0.0.1")));

        // Another IP is unaffected
        assert!(rl.start_connection(ip("10.0.0.2")));

        // Teardown frees a slot
        rl.end_connection(ip("10.0.0.1"));
        assert!(rl.start_connection(ip("10.0.0.1")));
    }

    #[test]
    fn test_request_burst_then_reject() {
        let rl = limiter(RateLimiterConfig {
            enabled: true,
            max_requests_per_second: 2,
            request_burst: 5,
            ..Default::default()
        });

        let now = now_unix_seconds();

        for _ in 0..5 {
            assert!(rl.count_request_at(ip("10.0.0.1"), now));
        }

        assert!(!rl.count_request_at(ip("10.0.0.1"), now));
    }

    #[test]
    fn test_request_count_decays() {
        let rl = limiter(RateLimiterConfig {
            enabled: true,
            max_requests_per_second: 2,
            request_burst: 4,
            ..Default::default()
        });

        let now = now_unix_seconds();

        for _ in 0..4 {
            assert!(rl.count_request_at(ip("10.0.0.1"), now));
        }
        assert!(!rl.count_request_at(ip("10.0.0.1"), now));

        // Three seconds of decay at 2 req/s clears the counter
        assert!(rl.count_request_at(ip("10.0.0.1"), now + 3));
    }

    #[test]
    fn test_whitelist_all() {
        let rl = limiter(RateLimiterConfig {
            enabled: true,
            whitelist: "*".to_string(),
            max_connections: 1,
            max_requests_per_second: 1,
            ..Default::default()
        });

        for _ in 0..100 {
            assert!(rl.count_request(ip("10.0.0.1")));
            assert!(rl.start_connection(ip("10.0.0.1")));
        }
    }

    #[test]
    fn test_whitelist_cidr() {
        let rl = limiter(RateLimiterConfig {
            enabled: true,
            whitelist: "10.0.0.0/8,192.168.1.0/24".to_string(),
            max_connections: 1,
            ..Default::default()
        });

        assert!(rl.start_connection(ip("10.1.2.3")));
        assert!(rl.start_connection(ip("10.1.2.3")));

        assert!(rl.start_connection(ip("192.168.1.7")));
        assert!(rl.start_connection(ip("192.168.1.7")));

        assert!(rl.start_connection(ip("172.16.0.1")));
        assert!(!rl.start_connection(ip("172.16.0.1")));
    }

    #[test]
    fn test_invalid_whitelist_entry_ignored() {
        let rl = limiter(RateLimiterConfig {
            enabled: true,
            whitelist: "not-a-range,10.0.0.0/8".to_string(),
            max_connections: 1,
            ..Default::default()
        });

        assert!(rl.start_connection(ip("10.1.2.3")));
        assert!(rl.start_connection(ip("10.1.2.3")));
    }

    #[test]
    fn test_cleanup_sweeps_decayed_entries() {
        let rl = limiter(RateLimiterConfig {
            enabled: true,
            max_requests_per_second: 10,
            request_burst: 10,
            cleanup_interval_seconds: 5,
            ..Default::default()
        });

        let now = now_unix_seconds();

        assert!(rl.count_request_at(ip("10.0.0.1"), now));
        assert!(rl.count_request_at(ip("10.0.0.2"), now));

        // Past the cleanup interval both counters have fully decayed
        assert!(rl.count_request_at(ip("10.0.0.3"), now + 10));

        let state = rl.state.lock().unwrap();
        assert_eq!(state.request_count.len(), 1);
    }
}
