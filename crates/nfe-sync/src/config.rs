use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use nfe_core::BackoffPolicy;
use nfe_gateway::{
    EmailRenderer, FixturePortalGateway, HttpClientConfig, HttpPortalGateway, HttpRelayChannel,
    LogChannel, NotificationChannel, PortalGateway, RelayConfig, TokenBucketConfig,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Headroom a lease keeps beyond the slowest call it guards, for the store
/// writes that follow the call.
const LEASE_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub worker_concurrency: usize,
    pub gateway_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub lease_ttl: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
            gateway_timeout: Duration::from_secs(240),
            backoff: BackoffPolicy::new(Duration::from_secs(60), Duration::from_secs(3600))
                .with_jitter(0.2),
            lease_ttl: Duration::from_secs(300),
        }
    }
}

impl PollSettings {
    /// The poll lease must outlive a whole gateway call, or a second worker
    /// could reach the portal for the same company mid-call.
    pub fn with_lease_covering_timeout(mut self) -> Self {
        let floor = self.gateway_timeout + LEASE_MARGIN;
        if self.lease_ttl < floor {
            warn!(
                lease_secs = self.lease_ttl.as_secs(),
                gateway_timeout_secs = self.gateway_timeout.as_secs(),
                "poll lease shorter than the gateway timeout; extending it"
            );
            self.lease_ttl = floor;
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct NotifySettings {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub batch_size: u32,
    pub lease_ttl: Duration,
}

impl NotifySettings {
    /// Same rule for deliveries: one send must fit inside the document lease.
    pub fn with_lease_covering_timeout(mut self, send_timeout: Duration) -> Self {
        let floor = send_timeout + LEASE_MARGIN;
        if self.lease_ttl < floor {
            warn!(
                lease_secs = self.lease_ttl.as_secs(),
                send_timeout_secs = send_timeout.as_secs(),
                "notification lease shorter than the relay timeout; extending it"
            );
            self.lease_ttl = floor;
        }
        self
    }
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::new(Duration::from_secs(60), Duration::from_secs(1800))
                .with_jitter(0.2),
            batch_size: 50,
            lease_ttl: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub database_url: String,
    pub worker_id: String,
    pub tick_interval: Duration,
    pub poll: PollSettings,
    pub notify: NotifySettings,
    pub digest_enabled: bool,
    /// Six-field cron expression (seconds first), evaluated in UTC.
    pub digest_cron: String,
    pub portal_url: Option<String>,
    pub portal_requests_per_minute: Option<u32>,
    pub fixtures_dir: PathBuf,
    pub relay_url: Option<String>,
    pub relay_timeout: Duration,
    pub emails_from_name: String,
    pub dashboard_url: String,
    pub companies_file: PathBuf,
    pub default_poll_interval_secs: u64,
    pub initial_lookback_days: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://nfe-monitor.db?mode=rwc".to_string(),
            worker_id: default_worker_id(),
            tick_interval: Duration::from_secs(15),
            poll: PollSettings::default(),
            notify: NotifySettings::default(),
            digest_enabled: true,
            digest_cron: "0 0 8 * * *".to_string(),
            portal_url: None,
            portal_requests_per_minute: None,
            fixtures_dir: PathBuf::from("./fixtures/portal"),
            relay_url: None,
            relay_timeout: Duration::from_secs(30),
            emails_from_name: "NFe Monitor".to_string(),
            dashboard_url: "http://localhost:8501".to_string(),
            companies_file: PathBuf::from("companies.yaml"),
            default_poll_interval_secs: 900,
            initial_lookback_days: 30,
        }
    }
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let poll_base = env_parse("NFE_BACKOFF_BASE_SECS", 60u64);
        let poll_max = env_parse("NFE_BACKOFF_MAX_SECS", 3600u64);
        let notify_base = env_parse("NFE_NOTIFY_RETRY_BASE_SECS", 60u64);
        let notify_max = env_parse("NFE_NOTIFY_RETRY_MAX_SECS", 1800u64);
        let jitter = env_parse("NFE_BACKOFF_JITTER", 0.2f64);
        let relay_timeout =
            Duration::from_secs(env_parse("NFE_EMAIL_RELAY_TIMEOUT_SECS", 30u64));

        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            worker_id: std::env::var("NFE_WORKER_ID").unwrap_or(defaults.worker_id),
            tick_interval: Duration::from_secs(
                env_parse("NFE_TICK_INTERVAL_SECS", 15u64).max(1),
            ),
            poll: PollSettings {
                worker_concurrency: env_parse("NFE_WORKER_CONCURRENCY", 4usize).max(1),
                gateway_timeout: Duration::from_secs(env_parse(
                    "NFE_GATEWAY_TIMEOUT_SECS",
                    240u64,
                )),
                backoff: BackoffPolicy::new(
                    Duration::from_secs(poll_base),
                    Duration::from_secs(poll_max.max(poll_base)),
                )
                .with_jitter(jitter),
                lease_ttl: Duration::from_secs(env_parse("NFE_POLL_LEASE_SECS", 300u64)),
            }
            .with_lease_covering_timeout(),
            notify: NotifySettings {
                max_attempts: env_parse("NFE_NOTIFY_MAX_ATTEMPTS", 3u32).max(1),
                backoff: BackoffPolicy::new(
                    Duration::from_secs(notify_base),
                    Duration::from_secs(notify_max.max(notify_base)),
                )
                .with_jitter(jitter),
                batch_size: env_parse("NFE_DRAIN_BATCH", 50u32).max(1),
                lease_ttl: Duration::from_secs(env_parse("NFE_NOTIFY_LEASE_SECS", 120u64)),
            }
            .with_lease_covering_timeout(relay_timeout),
            digest_enabled: std::env::var("NFE_DIGEST_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.digest_enabled),
            digest_cron: std::env::var("NFE_DIGEST_CRON").unwrap_or(defaults.digest_cron),
            portal_url: non_empty_var("NFE_PORTAL_URL"),
            portal_requests_per_minute: non_empty_var("NFE_PORTAL_REQUESTS_PER_MIN")
                .and_then(|v| v.parse().ok()),
            fixtures_dir: std::env::var("NFE_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.fixtures_dir),
            relay_url: non_empty_var("NFE_EMAIL_RELAY_URL"),
            relay_timeout,
            emails_from_name: std::env::var("NFE_EMAILS_FROM_NAME")
                .unwrap_or(defaults.emails_from_name),
            dashboard_url: std::env::var("NFE_DASHBOARD_URL").unwrap_or(defaults.dashboard_url),
            companies_file: std::env::var("NFE_COMPANIES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.companies_file),
            default_poll_interval_secs: env_parse("NFE_DEFAULT_POLL_INTERVAL_SECS", 900u64)
                .max(1),
            initial_lookback_days: env_parse("NFE_INITIAL_LOOKBACK_DAYS", 30u32),
        }
    }

    pub fn email_renderer(&self) -> EmailRenderer {
        EmailRenderer::new(self.emails_from_name.clone(), self.dashboard_url.clone())
    }

    /// HTTP sidecar when `NFE_PORTAL_URL` is set, checked-in fixtures otherwise.
    pub fn build_gateway(&self) -> Result<Arc<dyn PortalGateway>> {
        match &self.portal_url {
            Some(url) => {
                info!(url, "using http portal gateway");
                let token_bucket = self.portal_requests_per_minute.map(|per_minute| {
                    let per_minute = per_minute.max(1);
                    TokenBucketConfig {
                        capacity: per_minute,
                        refill_every: Duration::from_millis(60_000 / u64::from(per_minute)),
                    }
                });
                Ok(Arc::new(HttpPortalGateway::new(HttpClientConfig {
                    base_url: url.clone(),
                    global_concurrency: self.poll.worker_concurrency,
                    token_bucket,
                    initial_lookback_days: self.initial_lookback_days,
                    ..HttpClientConfig::default()
                })?))
            }
            None => {
                info!(dir = %self.fixtures_dir.display(), "using fixture portal gateway");
                Ok(Arc::new(FixturePortalGateway::new(self.fixtures_dir.clone())))
            }
        }
    }

    /// Email relay when `NFE_EMAIL_RELAY_URL` is set, log-only delivery otherwise.
    pub fn build_channel(&self) -> Result<Arc<dyn NotificationChannel>> {
        match &self.relay_url {
            Some(url) => {
                info!(url, "using email relay channel");
                Ok(Arc::new(HttpRelayChannel::new(RelayConfig {
                    url: url.clone(),
                    timeout: self.relay_timeout,
                    renderer: self.email_renderer(),
                })?))
            }
            None => {
                warn!("NFE_EMAIL_RELAY_URL not set; emails will only be logged");
                Ok(Arc::new(LogChannel::new(self.email_renderer())))
            }
        }
    }
}

fn default_worker_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("nfe-{}", &id[..8])
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "ignoring unparseable environment value");
            default
        }),
        Err(_) => default,
    }
}
