//! Telemetry Harvester
//!
//! An in-process buffer that collects spans and dimensional metrics from any
//! number of tasks and periodically ships them, gzip-compressed, to New Relic
//! style trace and metric ingestion endpoints.
//!
//! Recording is a short critical section on a `Mutex<Vec<_>>`; every harvest
//! detaches the whole buffer and does its encoding and network I/O outside the
//! lock. Each request is retried at most once (429/5xx), and every outcome is
//! reported through pluggable error/debug/audit hooks instead of being
//! returned to the recorder.
//!
//! # Example
//!
//! ```no_run
//! use telemetry_harvester::{Config, Count, Harvester, Span, TracingSink};
//!
//! # async fn run() {
//! let harvester = Harvester::new(
//!     Config::new("my-api-key").with_error_logger(TracingSink::new(tracing::Level::ERROR)),
//! );
//!
//! harvester.record_span(Span::new("span-1", "trace-1", "checkout").with_service_name("shop"));
//! harvester.record_metric(Count {
//!     name: "orders".into(),
//!     value: 1.0,
//!     ..Default::default()
//! });
//!
//! harvester.shutdown().await;
//! # }
//! ```
//!
//! Transports use native async fn in traits (no `#[async_trait]` macro); see
//! [`Transport`] and its object-safe twin [`TransportBoxed`].

pub mod attributes;
pub mod config;
pub mod error;
pub mod harvester;
pub(crate) mod invariants;
pub mod metric;
pub mod request;
pub mod retry;
pub mod span;
pub mod timestamp;
pub mod transport;

// Re-export main types
pub use attributes::{AttributeValue, Attributes};
pub use config::{
    BeforeHarvest, Config, LogFields, LogSink, NoopSink, TracingSink, DEFAULT_METRICS_URL,
    DEFAULT_SPANS_URL,
};
pub use error::{
    AttributeError, AttributeErrorKind, BuildError, ConfigError, MetricError, TransportError,
};
pub use harvester::{Harvester, RecordReport};
pub use metric::{Count, Gauge, Metric, Summary};
pub use request::{EntityKind, HarvestRequest};
pub use retry::{HarvestResponse, ResponseClass};
pub use span::Span;
pub use tokio_util::sync::CancellationToken;
pub use transport::{ReqwestTransport, Transport, TransportBoxed};
