//! Sliding-window per-client rate limiting.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Exact wire bytes returned to a client whose request is rejected.
pub const TOO_MANY_REQUESTS: &[u8] =
    b"HTTP/1.1 429 Too Many Requests\r\nContent-Type: text/plain\r\nContent-Length: 19\r\n\r\nToo Many Requests";

/// Sliding-window admission control, keyed by an opaque client identifier (the original
/// behavior keys on remote address).
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    clients: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// Creates a limiter admitting at most `max_requests` per `window_seconds` per client.
    pub fn new(max_requests: u32, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(window_seconds),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Prunes timestamps older than the window, then accepts or rejects the current request.
    ///
    /// Returns `true` if the request is admitted.
    pub fn admit(&self, client_id: &str) -> bool {
        let now = Instant::now();
        let mut clients = self.clients.lock();
        let timestamps = clients.entry(client_id.to_string()).or_default();

        while let Some(&front) = timestamps.front() {
            if now.duration_since(front) > self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() as u32 >= self.max_requests {
            return false;
        }

        timestamps.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_max_then_rejects() {
        let limiter = RateLimiter::new(2, 60);
        assert!(limiter.admit("client-a"));
        assert!(limiter.admit("client-a"));
        assert!(!limiter.admit("client-a"));
    }

    #[test]
    fn clients_are_independent() {
        let limiter = RateLimiter::new(1, 60);
        assert!(limiter.admit("client-a"));
        assert!(limiter.admit("client-b"));
        assert!(!limiter.admit("client-a"));
    }

    #[test]
    fn window_expiry_readmits() {
        let limiter = RateLimiter::new(1, 0);
        assert!(limiter.admit("client-a"));
        // window_seconds == 0 means every prior timestamp is immediately stale on the next tick.
        std::thread::sleep(Duration::from_millis(5));
        assert!(limiter.admit("client-a"));
    }
}
