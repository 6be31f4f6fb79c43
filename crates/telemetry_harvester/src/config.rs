//! Harvester configuration and observability hooks.

use crate::attributes::Attributes;
use crate::error::ConfigError;
use crate::harvester::Harvester;
use crate::transport::{ReqwestTransport, TransportBoxed};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default trace ingestion endpoint.
pub const DEFAULT_SPANS_URL: &str = "https://trace-api.newrelic.com/trace/v1";
/// Default metric ingestion endpoint.
pub const DEFAULT_METRICS_URL: &str = "https://metric-api.newrelic.com/metric/v1";

const USER_AGENT_PRODUCT: &str = concat!("TelemetryHarvester-Rust/", env!("CARGO_PKG_VERSION"));

/// Structured fields handed to a [`LogSink`].
pub type LogFields = Map<String, Value>;

/// Consumer of structured log records.
///
/// Closures taking [`LogFields`] implement this trait, so a hook can be set
/// with `config.with_error_logger(|fields| ...)`.
pub trait LogSink: Send + Sync {
    fn log(&self, fields: LogFields);
}

impl<F> LogSink for F
where
    F: Fn(LogFields) + Send + Sync,
{
    fn log(&self, fields: LogFields) {
        self(fields)
    }
}

/// Sink that discards everything. Every hook slot starts out as one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl LogSink for NoopSink {
    fn log(&self, _fields: LogFields) {}
}

/// Sink that forwards hook records to the `tracing` subscriber.
#[derive(Debug, Clone, Copy)]
pub struct TracingSink {
    level: tracing::Level,
}

impl TracingSink {
    pub fn new(level: tracing::Level) -> Self {
        Self { level }
    }
}

impl LogSink for TracingSink {
    fn log(&self, fields: LogFields) {
        let fields = Value::Object(fields);
        match self.level {
            tracing::Level::ERROR => tracing::error!(target: "telemetry_harvester", %fields),
            tracing::Level::WARN => tracing::warn!(target: "telemetry_harvester", %fields),
            tracing::Level::INFO => tracing::info!(target: "telemetry_harvester", %fields),
            tracing::Level::DEBUG => tracing::debug!(target: "telemetry_harvester", %fields),
            _ => tracing::trace!(target: "telemetry_harvester", %fields),
        }
    }
}

/// Callback run at the start of every harvest, e.g. to record gauges.
pub type BeforeHarvest = Arc<dyn Fn(&Harvester) + Send + Sync>;

/// Configuration for a [`Harvester`].
///
/// Read-only once the harvester is built.
#[derive(Clone)]
pub struct Config {
    /// Key sent in the `Api-Key` header. Empty disables metric recording and
    /// the background harvest task.
    pub api_key: String,
    /// Interval between background harvests. Zero disables the background task.
    ///
    /// Default: 5s
    pub harvest_period: Duration,
    /// Deadline for each background harvest cycle.
    ///
    /// Default: 15s
    pub harvest_timeout: Duration,
    /// Minimum wait before the single retry of a 429/5xx response.
    ///
    /// Default: 2s
    pub retry_backoff: Duration,
    /// Replaces [`DEFAULT_SPANS_URL`] when set.
    pub spans_url_override: Option<String>,
    /// Replaces [`DEFAULT_METRICS_URL`] when set.
    pub metrics_url_override: Option<String>,
    /// Product name appended to the User-Agent.
    pub product: Option<String>,
    /// Product version appended after `product`.
    pub product_version: Option<String>,
    /// Attributes attached to every span and metric batch.
    pub common_attributes: Attributes,
    /// Transport used for outbound requests.
    pub client: Arc<dyn TransportBoxed>,
    pub error_logger: Arc<dyn LogSink>,
    pub debug_logger: Arc<dyn LogSink>,
    pub audit_logger: Arc<dyn LogSink>,
    pub before_harvest: Option<BeforeHarvest>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            harvest_period: Duration::from_secs(5),
            harvest_timeout: Duration::from_secs(15),
            retry_backoff: Duration::from_secs(2),
            spans_url_override: None,
            metrics_url_override: None,
            product: None,
            product_version: None,
            common_attributes: Attributes::new(),
            client: Arc::new(ReqwestTransport::default()),
            error_logger: Arc::new(NoopSink),
            debug_logger: Arc::new(NoopSink),
            audit_logger: Arc::new(NoopSink),
            before_harvest: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("api_key_set", &!self.api_key.is_empty())
            .field("harvest_period", &self.harvest_period)
            .field("harvest_timeout", &self.harvest_timeout)
            .field("retry_backoff", &self.retry_backoff)
            .field("spans_url", &self.spans_url())
            .field("metrics_url", &self.metrics_url())
            .field("product", &self.product)
            .field("product_version", &self.product_version)
            .field("common_attributes", &self.common_attributes.len())
            .finish_non_exhaustive()
    }
}

fn env_millis(var: &'static str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| ConfigError::InvalidVar { var, value }),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Creates a configuration with the given API key and default settings.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    /// Creates a configuration from environment variables.
    ///
    /// - `HARVESTER_API_KEY`: API key (default: empty, harvesting disabled)
    /// - `HARVESTER_HARVEST_PERIOD_MS`: background harvest period (default: 5000)
    /// - `HARVESTER_RETRY_BACKOFF_MS`: retry backoff (default: 2000)
    /// - `HARVESTER_SPANS_URL`: trace endpoint override
    /// - `HARVESTER_METRICS_URL`: metric endpoint override
    ///
    /// # Errors
    ///
    /// Returns an error if a millisecond variable is set but not a
    /// non-negative integer.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(key) = std::env::var("HARVESTER_API_KEY") {
            config.api_key = key;
        }
        if let Some(period) = env_millis("HARVESTER_HARVEST_PERIOD_MS")? {
            config.harvest_period = period;
        }
        if let Some(backoff) = env_millis("HARVESTER_RETRY_BACKOFF_MS")? {
            config.retry_backoff = backoff;
        }
        config.spans_url_override = std::env::var("HARVESTER_SPANS_URL").ok();
        config.metrics_url_override = std::env::var("HARVESTER_METRICS_URL").ok();
        Ok(config)
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_harvest_period(mut self, period: Duration) -> Self {
        self.harvest_period = period;
        self
    }

    pub fn with_harvest_timeout(mut self, timeout: Duration) -> Self {
        self.harvest_timeout = timeout;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_spans_url(mut self, url: impl Into<String>) -> Self {
        self.spans_url_override = Some(url.into());
        self
    }

    pub fn with_metrics_url(mut self, url: impl Into<String>) -> Self {
        self.metrics_url_override = Some(url.into());
        self
    }

    pub fn with_product(mut self, product: impl Into<String>, version: impl Into<String>) -> Self {
        self.product = Some(product.into());
        self.product_version = Some(version.into());
        self
    }

    pub fn with_common_attributes(mut self, attributes: Attributes) -> Self {
        self.common_attributes = attributes;
        self
    }

    /// Sets the transport used for outbound requests.
    pub fn with_client(mut self, client: Arc<dyn TransportBoxed>) -> Self {
        self.client = client;
        self
    }

    pub fn with_error_logger(mut self, sink: impl LogSink + 'static) -> Self {
        self.error_logger = Arc::new(sink);
        self
    }

    pub fn with_debug_logger(mut self, sink: impl LogSink + 'static) -> Self {
        self.debug_logger = Arc::new(sink);
        self
    }

    pub fn with_audit_logger(mut self, sink: impl LogSink + 'static) -> Self {
        self.audit_logger = Arc::new(sink);
        self
    }

    pub fn with_before_harvest(
        mut self,
        hook: impl Fn(&Harvester) + Send + Sync + 'static,
    ) -> Self {
        self.before_harvest = Some(Arc::new(hook));
        self
    }

    /// Destination for span batches.
    pub fn spans_url(&self) -> &str {
        self.spans_url_override.as_deref().unwrap_or(DEFAULT_SPANS_URL)
    }

    /// Destination for metric batches.
    pub fn metrics_url(&self) -> &str {
        self.metrics_url_override.as_deref().unwrap_or(DEFAULT_METRICS_URL)
    }

    /// Value of the `User-Agent` header.
    pub fn user_agent(&self) -> String {
        let mut agent = USER_AGENT_PRODUCT.to_string();
        if let Some(product) = &self.product {
            agent.push(' ');
            agent.push_str(product);
            if let Some(version) = &self.product_version {
                agent.push('/');
                agent.push_str(version);
            }
        }
        agent
    }

    /// Whether a background harvest task should run.
    pub fn needs_harvest_thread(&self) -> bool {
        !self.harvest_period.is_zero() && !self.api_key.is_empty()
    }

    pub(crate) fn log_error(&self, fields: LogFields) {
        self.error_logger.log(fields);
    }

    pub(crate) fn log_debug(&self, fields: LogFields) {
        self.debug_logger.log(fields);
    }

    pub(crate) fn log_audit(&self, fields: LogFields) {
        self.audit_logger.log(fields);
    }
}

/// Builds a [`LogFields`] map from `key => value` pairs.
macro_rules! log_fields {
    ($($key:expr => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut fields = $crate::config::LogFields::new();
        $(fields.insert(($key).to_string(), ::serde_json::Value::from($value));)*
        fields
    }};
}

pub(crate) use log_fields;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_missing_loggers_are_noops() {
        let config = Config::default();
        config.log_error(LogFields::new());
        config.log_debug(log_fields!("something" => "happened"));
        config.log_audit(LogFields::new());
    }

    #[test]
    fn test_error_logger_receives_fields() {
        let saved = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&saved);
        let config = Config::default().with_error_logger(move |fields: LogFields| {
            sink.lock().unwrap().push(fields);
        });

        config.log_error(log_fields!("err" => "boom"));
        let saved = saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0]["err"], "boom");
    }

    #[test]
    fn test_debug_logger_receives_fields() {
        let saved = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&saved);
        let config = Config::default().with_debug_logger(move |fields: LogFields| {
            *sink.lock().unwrap() = Some(fields);
        });

        let fields = log_fields!("something" => "happened");
        config.log_debug(fields.clone());
        assert_eq!(saved.lock().unwrap().as_ref(), Some(&fields));
    }

    #[test]
    fn test_needs_harvest_thread() {
        let cases = [
            (Duration::from_secs(5), "", false),
            (Duration::from_secs(5), "APIKey", true),
            (Duration::ZERO, "APIKey", false),
            (Duration::ZERO, "", false),
        ];
        assert!(!Config::default().needs_harvest_thread());
        for (period, key, expected) in cases {
            let config = Config::new(key).with_harvest_period(period);
            assert_eq!(config.needs_harvest_thread(), expected, "{period:?} {key:?}");
        }
    }

    #[test]
    fn test_urls_and_overrides() {
        let config = Config::default();
        assert_eq!(config.spans_url(), DEFAULT_SPANS_URL);
        assert_eq!(config.metrics_url(), DEFAULT_METRICS_URL);

        let config = config
            .with_spans_url("http://localhost/traces")
            .with_metrics_url("http://localhost/metrics");
        assert_eq!(config.spans_url(), "http://localhost/traces");
        assert_eq!(config.metrics_url(), "http://localhost/metrics");
    }

    #[test]
    fn test_user_agent() {
        let config = Config::default();
        assert!(config.user_agent().starts_with("TelemetryHarvester-Rust/"));

        let config = config.with_product("istio-adapter", "1.2");
        assert!(config.user_agent().ends_with(" istio-adapter/1.2"));
    }

    // Only test touching HARVESTER_* variables; keep it that way.
    #[test]
    fn test_from_env() {
        std::env::set_var("HARVESTER_API_KEY", "env-key");
        std::env::set_var("HARVESTER_HARVEST_PERIOD_MS", "250");
        std::env::set_var("HARVESTER_METRICS_URL", "http://localhost/metrics");
        std::env::remove_var("HARVESTER_RETRY_BACKOFF_MS");
        std::env::remove_var("HARVESTER_SPANS_URL");

        let config = Config::from_env().unwrap();
        assert_eq!(config.api_key, "env-key");
        assert_eq!(config.harvest_period, Duration::from_millis(250));
        assert_eq!(config.retry_backoff, Duration::from_secs(2));
        assert_eq!(config.metrics_url(), "http://localhost/metrics");
        assert_eq!(config.spans_url(), DEFAULT_SPANS_URL);

        std::env::set_var("HARVESTER_RETRY_BACKOFF_MS", "soon");
        let err = Config::from_env().unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidVar {
                var: "HARVESTER_RETRY_BACKOFF_MS",
                value: "soon".into()
            }
        );

        for var in [
            "HARVESTER_API_KEY",
            "HARVESTER_HARVEST_PERIOD_MS",
            "HARVESTER_METRICS_URL",
            "HARVESTER_RETRY_BACKOFF_MS",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_debug_hides_api_key() {
        let rendered = format!("{:?}", Config::new("secret-key"));
        assert!(!rendered.contains("secret-key"));
        assert!(rendered.contains("api_key_set: true"));
    }
}
