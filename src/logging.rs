use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Result, anyhow};
use http::StatusCode;
use time::OffsetDateTime;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

#[derive(Debug, Clone)]
pub struct AccessLogEvent {
    pub client_ip: Option<IpAddr>,
    pub client_port: Option<u16>,
    pub method: String,
    pub path: String,
    pub origin_url: Option<String>,
    pub cache_key: Option<String>,
    pub cache_lookup: Option<String>,
    pub status: u16,
    pub elapsed_ms: u128,
    pub error_reason: Option<String>,
    pub error_detail: Option<String>,
}

#[derive(Debug)]
pub struct AccessLogBuilder {
    event: AccessLogEvent,
}

impl AccessLogBuilder {
    pub fn new(peer: Option<SocketAddr>) -> Self {
        Self {
            event: AccessLogEvent {
                client_ip: peer.map(|addr| addr.ip()),
                client_port: peer.map(|addr| addr.port()),
                method: String::new(),
                path: String::new(),
                origin_url: None,
                cache_key: None,
                cache_lookup: None,
                status: 0,
                elapsed_ms: 0,
                error_reason: None,
                error_detail: None,
            },
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.event.method = method.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.event.path = path.into();
        self
    }

    pub fn origin_url(mut self, url: impl Into<String>) -> Self {
        self.event.origin_url = Some(url.into());
        self
    }

    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.event.cache_key = Some(key.into());
        self
    }

    pub fn cache_lookup(mut self, value: impl Into<String>) -> Self {
        self.event.cache_lookup = Some(value.into());
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.event.status = status.as_u16();
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.event.elapsed_ms = elapsed.as_millis();
        self
    }

    pub fn error_reason(mut self, reason: impl Into<String>) -> Self {
        self.event.error_reason = Some(reason.into());
        self
    }

    pub fn error_detail(mut self, detail: impl Into<String>) -> Self {
        self.event.error_detail = Some(detail.into());
        self
    }

    pub fn build(self) -> AccessLogEvent {
        self.event
    }

    pub fn log(self) {
        log_access(self.build());
    }
}

pub fn log_access(event: AccessLogEvent) {
    let AccessLogEvent {
        client_ip,
        client_port,
        method,
        path,
        origin_url,
        cache_key,
        cache_lookup,
        status,
        elapsed_ms,
        error_reason,
        error_detail,
    } = event;

    let now = OffsetDateTime::now_utc();
    let (year, month, day) = now.to_calendar_date();
    let (hour, minute, second) = now.to_hms();
    let millisecond = now.millisecond();
    let month_number: u8 = month.into();
    let ts = format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millisecond:03}Z",
        month = month_number
    );

    let client_ip_field = client_ip.map(|ip| ip.to_string());

    tracing::info!(
        target = "access_log",
        ts,
        client_ip = client_ip_field.as_deref(),
        client_port,
        method,
        path,
        origin_url = origin_url.as_deref(),
        cache_key = cache_key.as_deref(),
        cache_lookup = cache_lookup.as_deref(),
        status,
        elapsed_ms,
        error_reason = error_reason.as_deref(),
        error_detail = error_detail.as_deref()
    );

    crate::metrics::record_request(
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Duration::from_millis(elapsed_ms as u64),
    );
}
