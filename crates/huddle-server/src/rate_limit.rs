//! Per-IP token-bucket limiting for the HTTP surface.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug)]
struct Bucket {
    level: f64,
    touched: Instant,
}

#[derive(Clone)]
pub struct ApiRateLimiter {
    buckets: Arc<Mutex<HashMap<IpAddr, Bucket>>>,
    refill_per_sec: f64,
    burst: f64,
}

impl ApiRateLimiter {
    pub fn new(refill_per_sec: f64, burst: f64) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            refill_per_sec,
            burst,
        }
    }

    /// Take one token from the caller's bucket, refilling for elapsed time
    /// first. Returns false when the bucket is dry.
    pub async fn allow(&self, ip: IpAddr) -> bool {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let bucket = buckets.entry(ip).or_insert(Bucket {
            level: self.burst,
            touched: now,
        });

        let idle = now.duration_since(bucket.touched).as_secs_f64();
        bucket.level = (bucket.level + idle * self.refill_per_sec).min(self.burst);
        bucket.touched = now;

        if bucket.level < 1.0 {
            return false;
        }
        bucket.level -= 1.0;
        true
    }

    /// Drop buckets that have not been touched recently so the map does not
    /// grow with every IP ever seen.
    pub async fn evict_idle(&self, older_than: Duration) {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        buckets.retain(|_, bucket| now.duration_since(bucket.touched) < older_than);
    }
}

impl Default for ApiRateLimiter {
    // 10 req/s sustained, burst of 30.
    fn default() -> Self {
        Self::new(10.0, 30.0)
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<ApiRateLimiter>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(ip) = client_ip(&req) {
        if !limiter.allow(ip).await {
            warn!(ip = %ip, "Rate limit exceeded");
            return Err(StatusCode::TOO_MANY_REQUESTS);
        }
    }

    Ok(next.run(req).await)
}

/// Peer address from the connection, or the first X-Forwarded-For entry when
/// running behind a proxy.
fn client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<std::net::SocketAddr>>() {
        return Some(connect_info.0.ip());
    }

    req.headers()
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_then_dry() {
        let limiter = ApiRateLimiter::new(10.0, 3.0);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        for _ in 0..3 {
            assert!(limiter.allow(ip).await);
        }
        assert!(!limiter.allow(ip).await);
    }

    #[tokio::test]
    async fn test_buckets_are_per_ip() {
        let limiter = ApiRateLimiter::new(10.0, 1.0);
        let first: IpAddr = "10.0.0.1".parse().unwrap();
        let second: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(limiter.allow(first).await);
        assert!(!limiter.allow(first).await);
        assert!(limiter.allow(second).await);
    }

    #[tokio::test]
    async fn test_evict_idle_buckets() {
        let limiter = ApiRateLimiter::new(10.0, 5.0);
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        assert!(limiter.allow(ip).await);

        limiter.evict_idle(Duration::ZERO).await;
        assert!(limiter.buckets.lock().await.is_empty());
    }
}
