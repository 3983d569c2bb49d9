use std::net::IpAddr;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
    pub refresh_ttl_minutes: i64,
}

/// Outbound mail settings. Without `smtp_host` the service logs mail instead of sending it.
#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub from_name: String,
    pub from_email: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub redis_url: String,
    pub window_secs: u64,
    pub enroll_max: u64,
    pub subscribe_max: u64,
    pub auth_max: u64,
    /// Peers allowed to report the client address in `X-Forwarded-For`.
    pub trusted_proxies: Vec<IpAddr>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub jwt: JwtConfig,
    pub mail: MailConfig,
    pub rate_limit: RateLimitConfig,
    /// Public frontend origin used in access, certificate and redirect URLs.
    pub client_url: String,
    /// Public API origin used in tracking pixels and confirmation links.
    pub api_url: String,
    pub webhook_secret: Option<String>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Comma-separated IP addresses; blank entries are skipped.
fn parse_proxies(raw: &str) -> anyhow::Result<Vec<IpAddr>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpAddr>()
                .with_context(|| format!("TRUSTED_PROXIES entry {s:?}"))
        })
        .collect()
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET")?,
            issuer: env_or("JWT_ISSUER", "coursehub"),
            audience: env_or("JWT_AUDIENCE", "coursehub-users"),
            ttl_minutes: env_parse("JWT_TTL_MINUTES", 60),
            refresh_ttl_minutes: env_parse("JWT_REFRESH_TTL_MINUTES", 60 * 24 * 14),
        };
        let mail = MailConfig {
            smtp_host: std::env::var("SMTP_HOST").ok().filter(|h| !h.is_empty()),
            smtp_port: env_parse("SMTP_PORT", 587),
            smtp_username: env_or("SMTP_USERNAME", ""),
            smtp_password: env_or("SMTP_PASSWORD", ""),
            from_name: env_or("MAIL_FROM_NAME", "EduTech"),
            from_email: env_or("MAIL_FROM_EMAIL", "no-reply@localhost"),
        };
        let rate_limit = RateLimitConfig {
            redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379"),
            window_secs: env_parse("RATE_LIMIT_WINDOW_SECS", 15 * 60),
            enroll_max: env_parse("RATE_LIMIT_ENROLL_MAX", 10),
            subscribe_max: env_parse("RATE_LIMIT_SUBSCRIBE_MAX", 5),
            auth_max: env_parse("RATE_LIMIT_AUTH_MAX", 20),
            trusted_proxies: parse_proxies(&env_or("TRUSTED_PROXIES", ""))?,
        };
        Ok(Self {
            database_url,
            jwt,
            mail,
            rate_limit,
            client_url: env_or("CLIENT_URL", "http://localhost:3000")
                .trim_end_matches('/')
                .to_string(),
            api_url: env_or("API_URL", "http://localhost:8080")
                .trim_end_matches('/')
                .to_string(),
            webhook_secret: std::env::var("EMAIL_WEBHOOK_SECRET").ok().filter(|s| !s.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_on_garbage() {
        std::env::set_var("COURSEHUB_TEST_PARSE", "not-a-number");
        assert_eq!(env_parse("COURSEHUB_TEST_PARSE", 42u64), 42);
        std::env::set_var("COURSEHUB_TEST_PARSE", "7");
        assert_eq!(env_parse("COURSEHUB_TEST_PARSE", 42u64), 7);
        std::env::remove_var("COURSEHUB_TEST_PARSE");
    }

    #[test]
    fn trusted_proxies_parse_or_fail_loudly() {
        assert!(parse_proxies("").unwrap().is_empty());
        let list = parse_proxies("10.0.0.1, ::1,").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0], "10.0.0.1".parse::<IpAddr>().unwrap());
        assert!(parse_proxies("10.0.0.1, 10.0.0.0/8").is_err());
    }

    #[test]
    fn env_or_uses_default_when_unset() {
        assert_eq!(env_or("COURSEHUB_TEST_UNSET_KEY", "fallback"), "fallback");
    }
}
