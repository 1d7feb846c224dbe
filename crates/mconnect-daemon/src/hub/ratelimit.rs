use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

/// Per-IP connection rate limiter: at most `limit` new connections per IP
/// per tumbling window. Exceeding connections are refused with HTTP 429
/// before upgrade.
pub struct ConnectionRateLimiter {
    limit: u32,
    window_ms: u64,
    windows: Mutex<HashMap<IpAddr, Window>>,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_ms: u64,
    count: u32,
}

pub const CONNECTION_RATE_WINDOW_MS: u64 = 60_000;

impl ConnectionRateLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            window_ms: CONNECTION_RATE_WINDOW_MS,
            windows: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn with_window(limit: u32, window_ms: u64) -> Self {
        Self {
            limit,
            window_ms,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpAddr, Window>> {
        match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Account one connection attempt from `ip`. Returns whether it may
    /// proceed. Stale windows are swept opportunistically.
    pub fn try_acquire(&self, ip: IpAddr, now_ms: u64) -> bool {
        let mut windows = self.lock();
        windows.retain(|_, w| now_ms.saturating_sub(w.started_ms) <= self.window_ms);

        let window = windows.entry(ip).or_insert(Window {
            started_ms: now_ms,
            count: 0,
        });
        if now_ms.saturating_sub(window.started_ms) > self.window_ms {
            window.started_ms = now_ms;
            window.count = 0;
        }
        if window.count >= self.limit {
            return false;
        }
        window.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([127, 0, 0, last])
    }

    #[test]
    fn test_allows_up_to_limit() {
        let limiter = ConnectionRateLimiter::with_window(3, 60_000);
        assert!(limiter.try_acquire(ip(1), 0));
        assert!(limiter.try_acquire(ip(1), 10));
        assert!(limiter.try_acquire(ip(1), 20));
        assert!(!limiter.try_acquire(ip(1), 30));
    }

    #[test]
    fn test_per_ip_isolation() {
        let limiter = ConnectionRateLimiter::with_window(1, 60_000);
        assert!(limiter.try_acquire(ip(1), 0));
        assert!(!limiter.try_acquire(ip(1), 10));
        assert!(limiter.try_acquire(ip(2), 20));
    }

    #[test]
    fn test_window_rollover() {
        let limiter = ConnectionRateLimiter::with_window(1, 1_000);
        assert!(limiter.try_acquire(ip(1), 0));
        assert!(!limiter.try_acquire(ip(1), 500));
        assert!(limiter.try_acquire(ip(1), 1_501));
    }
}
