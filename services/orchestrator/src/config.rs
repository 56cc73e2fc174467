use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use hoster_reconcile::{RetryPolicy, StalePolicy, DEFAULT_STUCK_AFTER, DEFAULT_SWEEP_INTERVAL};

use crate::db::DbConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::providers::{cloudflare, hcloud};

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub database: DbConfig,
    pub hcloud: hcloud::HcloudConfig,
    pub cloudflare: cloudflare::CloudflareConfig,
    pub orchestrator: OrchestratorConfig,
    pub sweep_interval: Duration,
    pub stale: StalePolicy,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| anyhow!("{key} must be set"))
        };

        let listen_addr = lookup("HOSTER_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse::<SocketAddr>()
            .context("HOSTER_LISTEN_ADDR")?;

        let log_level = lookup("HOSTER_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let dev_mode = lookup("HOSTER_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let database = DbConfig::from_lookup(&lookup);

        let call_timeout = Duration::from_secs(parse_or(
            &lookup,
            "HOSTER_PROVIDER_TIMEOUT_SECS",
            OrchestratorConfig::DEFAULT_CALL_TIMEOUT.as_secs(),
        )?);

        let hcloud = hcloud::HcloudConfig {
            api_url: lookup("HCLOUD_API_URL")
                .unwrap_or_else(|| hcloud::DEFAULT_API_URL.to_string()),
            token: required("HCLOUD_TOKEN")?,
            request_timeout: call_timeout,
        };

        let cloudflare = cloudflare::CloudflareConfig {
            api_url: lookup("CLOUDFLARE_API_URL")
                .unwrap_or_else(|| cloudflare::DEFAULT_API_URL.to_string()),
            token: required("CLOUDFLARE_API_TOKEN")?,
            request_timeout: call_timeout,
        };

        let mut orchestrator =
            OrchestratorConfig::new(required("CLOUDFLARE_ZONE_ID")?, required("HOSTER_BASE_DOMAIN")?);
        if let Some(location) = lookup("HCLOUD_LOCATION") {
            orchestrator.location = location;
        }
        if let Some(image) = lookup("HCLOUD_IMAGE") {
            orchestrator.image = image;
        }
        orchestrator.dns_ttl = parse_or(
            &lookup,
            "HOSTER_DNS_TTL_SECS",
            OrchestratorConfig::DEFAULT_DNS_TTL,
        )?;
        orchestrator.call_timeout = call_timeout;
        orchestrator.retry = RetryPolicy {
            max_attempts: parse_or(
                &lookup,
                "HOSTER_PROVIDER_MAX_ATTEMPTS",
                hoster_reconcile::DEFAULT_MAX_ATTEMPTS,
            )?,
            ..RetryPolicy::default()
        };
        orchestrator.fit_max_attempts = parse_or(
            &lookup,
            "HOSTER_FIT_MAX_ATTEMPTS",
            OrchestratorConfig::DEFAULT_FIT_MAX_ATTEMPTS,
        )?;

        let sweep_interval = Duration::from_secs(parse_or(
            &lookup,
            "HOSTER_SWEEP_INTERVAL_SECS",
            DEFAULT_SWEEP_INTERVAL.as_secs(),
        )?);
        let stale = StalePolicy::new(Duration::from_secs(parse_or(
            &lookup,
            "HOSTER_STUCK_AFTER_SECS",
            DEFAULT_STUCK_AFTER.as_secs(),
        )?));

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            database,
            hcloud,
            cloudflare,
            orchestrator,
            sweep_interval,
            stale,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse::<T>().with_context(|| format!("{key}={raw}")),
        None => Ok(default),
    }
}
