//! Bus configuration with environment-variable fallbacks

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Cap on simultaneously accepted connections.
pub const REMOTE_LINK_MAX_DEFAULT: usize = 20_000;
pub const REMOTE_LINK_MAX_MIN: usize = 10_000;
pub const REMOTE_LINK_MAX_MAX: usize = 50_000;

/// Idle-scan counter bounds for recycling HTTP-classified remote links.
pub const LINK_RECYCLE_PERIOD_MIN: u32 = 20;
pub const LINK_RECYCLE_PERIOD_MAX: u32 = 360;

/// Interval between recycle scans.
pub const LINK_RECYCLE_TICK: Duration = Duration::from_secs(10);

/// Default interval between send-metrics reports.
pub const METRICS_INTERVAL_DEFAULT: Duration = Duration::from_millis(600_000);

pub const ENV_REMOTE_LINK_MAX: &str = "LITEBUS_REMOTE_LINK_MAX";
pub const ENV_LINK_RECYCLE_PERIOD: &str = "LITEBUS_LINK_RECYCLE_PERIOD";
pub const ENV_HTTPKMSG_ENABLED: &str = "LITEBUS_HTTPKMSG_ENABLED";

/// TLS material for both sides of a link. Loading key files and password
/// stores is the caller's concern; the bus only consumes built configs.
#[derive(Clone)]
pub struct TlsConfig {
    pub server: Arc<rustls::ServerConfig>,
    pub client: Arc<rustls::ClientConfig>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}

/// Bus configuration. Unset fields fall back to the matching `LITEBUS_*`
/// environment variable, then to the built-in default.
#[derive(Debug, Clone, Default)]
pub struct BusConfig {
    /// Double-link mode: locally initiated and accepted connections to the
    /// same peer stay distinct and both carry linker subscriptions.
    pub double_link: Option<bool>,
    /// Cap on accepted connections, clamped to
    /// [`REMOTE_LINK_MAX_MIN`, `REMOTE_LINK_MAX_MAX`].
    pub remote_link_max: Option<usize>,
    /// Idle scans after which an HTTP-classified remote link is recycled.
    /// Values outside [`LINK_RECYCLE_PERIOD_MIN`, `LINK_RECYCLE_PERIOD_MAX`]
    /// disable recycling.
    pub link_recycle_period: Option<u32>,
    /// Interval between send-metrics reports.
    pub metrics_interval: Option<Duration>,
    pub tls: Option<TlsConfig>,
}

/// Configuration after environment fallbacks and clamping.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedConfig {
    pub double_link: bool,
    pub remote_link_max: usize,
    pub link_recycle_period: Option<u32>,
    pub metrics_interval: Duration,
    pub tls: Option<TlsConfig>,
}

impl BusConfig {
    pub(crate) fn resolve(self) -> ResolvedConfig {
        let double_link = self.double_link.unwrap_or_else(env_double_link);
        let remote_link_max = clamp_remote_link_max(
            self.remote_link_max
                .or_else(|| env_usize(ENV_REMOTE_LINK_MAX)),
        );
        let link_recycle_period = self
            .link_recycle_period
            .or_else(|| env_u32(ENV_LINK_RECYCLE_PERIOD))
            .filter(|period| {
                (LINK_RECYCLE_PERIOD_MIN..=LINK_RECYCLE_PERIOD_MAX).contains(period)
            });
        info!(
            double_link,
            remote_link_max,
            recycle_period = ?link_recycle_period,
            "bus config resolved"
        );
        ResolvedConfig {
            double_link,
            remote_link_max,
            link_recycle_period,
            metrics_interval: self.metrics_interval.unwrap_or(METRICS_INTERVAL_DEFAULT),
            tls: self.tls,
        }
    }
}

fn clamp_remote_link_max(value: Option<usize>) -> usize {
    match value {
        Some(count) if (REMOTE_LINK_MAX_MIN..=REMOTE_LINK_MAX_MAX).contains(&count) => count,
        Some(count) => {
            error!(count, "remote link max out of range, using default");
            REMOTE_LINK_MAX_DEFAULT
        }
        None => REMOTE_LINK_MAX_DEFAULT,
    }
}

fn env_double_link() -> bool {
    matches!(
        std::env::var(ENV_HTTPKMSG_ENABLED).as_deref(),
        Ok("1") | Ok("true")
    )
}

fn env_usize(name: &str) -> Option<usize> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            error!(name, %raw, "unparseable environment value");
            None
        }
    }
}

fn env_u32(name: &str) -> Option<u32> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            error!(name, %raw, "unparseable environment value");
            None
        }
    }
}
