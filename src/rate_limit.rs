use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use redis::{aio::ConnectionManager, Script};
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

use crate::{config::RateLimitConfig, error::AppError};

/// Sliding window over a sorted set of hit times (ms).
/// KEYS[1] key; ARGV now, window, max, member. Returns {allowed, count, retry_after_ms}.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
if count < max then
    redis.call('ZADD', key, now, ARGV[4])
    redis.call('PEXPIRE', key, window)
    return {1, count + 1, 0}
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local retry = window
if oldest[2] then
    retry = tonumber(oldest[2]) + window - now
end
return {0, count, retry}
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Limited { retry_after: Duration },
}

/// Shared hit counter behind the limiters.
#[async_trait]
pub trait HitStore: Send + Sync {
    /// Counts a hit on `key` unless `max` hits already fall inside the trailing `window`.
    async fn hit(&self, key: &str, max: u64, window: Duration) -> anyhow::Result<Verdict>;
}

pub struct RedisStore {
    conn: ConnectionManager,
    script: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("parse redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("connect to redis")?;
        Ok(Self {
            conn,
            script: Script::new(SLIDING_WINDOW_SCRIPT),
        })
    }
}

#[async_trait]
impl HitStore for RedisStore {
    async fn hit(&self, key: &str, max: u64, window: Duration) -> anyhow::Result<Verdict> {
        let now_ms = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
        let window_ms = window.as_millis() as i64;
        let mut conn = self.conn.clone();
        let result: Vec<i64> = self
            .script
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(max)
            .arg(format!("{now_ms}-{}", Uuid::new_v4()))
            .invoke_async(&mut conn)
            .await
            .context("rate limit script")?;
        match result.as_slice() {
            [1, ..] => Ok(Verdict::Allowed),
            [0, _, retry_ms] => Ok(Verdict::Limited {
                retry_after: Duration::from_millis((*retry_ms).max(0) as u64),
            }),
            other => anyhow::bail!("unexpected rate limit reply {other:?}"),
        }
    }
}

/// One named budget: `max_requests` per client per `window`.
pub struct RateLimiter {
    name: &'static str,
    max_requests: u64,
    window: Duration,
    store: Arc<dyn HitStore>,
    trusted_proxies: Arc<[IpAddr]>,
}

impl RateLimiter {
    pub fn new(
        name: &'static str,
        max_requests: u64,
        window: Duration,
        store: Arc<dyn HitStore>,
        trusted_proxies: Arc<[IpAddr]>,
    ) -> Self {
        Self {
            name,
            max_requests,
            window,
            store,
            trusted_proxies,
        }
    }

    /// Store errors let the request through.
    pub async fn check(&self, client: &str) -> Verdict {
        let key = format!("coursehub:ratelimit:{}:{}", self.name, client);
        match self.store.hit(&key, self.max_requests, self.window).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(error = ?e, limiter = self.name, "rate limit store failed, allowing request");
                Verdict::Allowed
            }
        }
    }
}

/// Per-route limiters shared through `AppState`.
#[derive(Clone)]
pub struct Limits {
    pub enroll: Arc<RateLimiter>,
    pub subscribe: Arc<RateLimiter>,
    pub auth: Arc<RateLimiter>,
}

impl Limits {
    pub fn new(cfg: &RateLimitConfig, store: Arc<dyn HitStore>) -> Self {
        let window = Duration::from_secs(cfg.window_secs);
        let trusted: Arc<[IpAddr]> = cfg.trusted_proxies.clone().into();
        let limiter = |name, max| {
            Arc::new(RateLimiter::new(
                name,
                max,
                window,
                store.clone(),
                trusted.clone(),
            ))
        };
        Self {
            enroll: limiter("enroll", cfg.enroll_max),
            subscribe: limiter("subscribe", cfg.subscribe_max),
            auth: limiter("auth", cfg.auth_max),
        }
    }
}

/// Client address behind `peer`. `X-Forwarded-For` is read only when the peer is a trusted
/// proxy, right to left, stopping at the first hop that is not itself trusted.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>, trusted: &[IpAddr]) -> Option<IpAddr> {
    let peer = peer?;
    if !trusted.contains(&peer) {
        return Some(peer);
    }
    let hops: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .collect();
    let mut client = peer;
    for hop in hops.into_iter().rev() {
        match hop.trim().parse::<IpAddr>() {
            Ok(ip) => {
                client = ip;
                if !trusted.contains(&ip) {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    Some(client)
}

/// Middleware for `axum::middleware::from_fn_with_state`.
pub async fn limit(
    State(limiter): State<Arc<RateLimiter>>,
    req: Request,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let client = client_ip(req.headers(), peer, &limiter.trusted_proxies)
        .map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
    match limiter.check(&client).await {
        Verdict::Allowed => next.run(req).await,
        Verdict::Limited { retry_after } => {
            warn!(limiter = limiter.name, %client, "rate limit exceeded");
            AppError::RateLimited {
                retry_after_secs: retry_after.as_secs().max(1),
            }
            .into_response()
        }
    }
}

#[cfg(test)]
pub mod testing {
    use std::{
        collections::HashMap,
        sync::Mutex,
        time::Instant,
    };

    use super::*;

    /// Process-local stand-in for Redis with the same window rule.
    #[derive(Default)]
    pub struct MemoryStore {
        hits: Mutex<HashMap<String, Vec<Instant>>>,
    }

    #[async_trait]
    impl HitStore for MemoryStore {
        async fn hit(&self, key: &str, max: u64, window: Duration) -> anyhow::Result<Verdict> {
            let now = Instant::now();
            let mut hits = self.hits.lock().expect("store lock");
            let list = hits.entry(key.to_string()).or_default();
            list.retain(|t| now.duration_since(*t) < window);
            if list.len() as u64 >= max {
                let oldest = list.first().copied().unwrap_or(now);
                return Ok(Verdict::Limited {
                    retry_after: window.saturating_sub(now.duration_since(oldest)),
                });
            }
            list.push(now);
            Ok(Verdict::Allowed)
        }
    }

    pub struct DownStore;

    #[async_trait]
    impl HitStore for DownStore {
        async fn hit(&self, _: &str, _: u64, _: Duration) -> anyhow::Result<Verdict> {
            anyhow::bail!("connection refused")
        }
    }
}
