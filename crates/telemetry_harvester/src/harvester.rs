//! The harvester: pending buffers, swap, and the harvest cycle.
//!
//! # Concurrency
//!
//! Recorders append to a `Mutex`-guarded `Vec` per entity kind. A harvest takes
//! the whole `Vec` with `std::mem::take` and releases the lock before encoding
//! or sending anything, so a slow backend never blocks recorders. The detached
//! batch is owned by the harvest; nothing aliases the live buffer.
//!
//! ```text
//!  record_span ──┐                      ┌── swap_out_spans ── build ── send/retry ──┐
//!  record_span ──┼─► Mutex<Vec<Span>> ──┤                                           ├─► hooks
//!  record_metric ┴─► Mutex<Metrics> ────┴── swap_out_metrics ─ build ── send/retry ──┘
//! ```
//!
//! # Inert handles
//!
//! [`Harvester::disabled()`] (also `Harvester::default()`) holds no state.
//! Every public method checks for that once and returns immediately, so
//! callers can keep a harvester around without checking whether telemetry is
//! configured.

use crate::attributes::{to_raw, vet_attributes};
use crate::config::{log_fields, Config};
use crate::error::AttributeError;
use crate::invariants::{
    debug_assert_backoff_floor, debug_assert_bounded_attempts, debug_assert_buffer_drained,
};
use crate::metric::Metric;
use crate::request::{
    build_requests, encode_metrics, encode_spans, EntityKind, HarvestRequest, MetricCommon,
};
use crate::retry::ResponseClass;
use crate::span::{RecordedSpan, Span};
use crate::timestamp::{duration_millis, epoch_millis};
use serde_json::value::RawValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// One initial attempt plus one retry.
const MAX_ATTEMPTS: u32 = 2;

/// Outcome of a `record_*` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordReport {
    /// Whether the entity was buffered.
    pub accepted: bool,
    /// Attributes dropped during validation. Also sent to the error hook.
    pub dropped: Vec<AttributeError>,
}

impl RecordReport {
    fn ignored() -> Self {
        Self::default()
    }

    /// `true` if the entity was buffered with every attribute intact.
    pub fn is_clean(&self) -> bool {
        self.accepted && self.dropped.is_empty()
    }
}

struct MetricBuffer {
    raw: Vec<Box<RawValue>>,
    last_harvest: SystemTime,
}

struct HarvestTask {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

enum TaskState {
    Idle,
    Running(HarvestTask),
    Stopped,
}

struct Inner {
    config: Config,
    /// Vetted `config.common_attributes`, encoded once.
    common_attributes: Option<Box<RawValue>>,
    spans: Mutex<Vec<RecordedSpan>>,
    metrics: Mutex<MetricBuffer>,
    task: Mutex<TaskState>,
    task_started: AtomicBool,
}

/// Locks `m`, recovering the data if a recorder panicked while holding it.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.task.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let TaskState::Running(task) = state {
            task.shutdown.cancel();
        }
    }
}

impl Inner {
    fn report_attribute_errors(&self, entity: &'static str, name: &str, errors: &[AttributeError]) {
        for e in errors {
            self.config.log_error(log_fields!(
                "err" => e.to_string(),
                "message" => "invalid attribute",
                "entity" => entity,
                "name" => name,
                "key" => e.key.as_str(),
            ));
        }
    }

    async fn send_all(&self, requests: Vec<HarvestRequest>, ctx: &CancellationToken) {
        for request in requests {
            self.harvest_request(&request, ctx).await;
        }
    }

    /// Sends one request, retrying once on 429/5xx.
    async fn harvest_request(&self, req: &HarvestRequest, ctx: &CancellationToken) {
        let config = &self.config;
        let url = req.url.as_str();

        for attempt in 0..MAX_ATTEMPTS {
            debug_assert_bounded_attempts!(attempt, MAX_ATTEMPTS);

            config.log_audit(log_fields!(
                "event" => "data post",
                "kind" => req.kind.as_str(),
                "url" => url,
                "data" => req.uncompressed_str().into_owned(),
            ));

            let resp = match config.client.send_boxed(req, ctx).await {
                Ok(resp) => resp,
                Err(e) => {
                    config.log_error(log_fields!(
                        "event" => "data post",
                        "kind" => req.kind.as_str(),
                        "url" => url,
                        "err" => e.to_string(),
                        "attempt" => attempt + 1,
                    ));
                    return;
                }
            };

            if resp.is_success() {
                config.log_debug(log_fields!(
                    "event" => "data post",
                    "kind" => req.kind.as_str(),
                    "url" => url,
                    "status" => resp.status,
                ));
                return;
            }

            let class = resp.class();
            config.log_error(log_fields!(
                "event" => "data post",
                "kind" => req.kind.as_str(),
                "url" => url,
                "status" => resp.status,
                "err" => match class {
                    ResponseClass::Rejected => "payload rejected",
                    ResponseClass::Retryable => "retryable response",
                    _ => "unexpected response status",
                },
                "attempt" => attempt + 1,
            ));

            let (retry, backoff) = resp.needs_retry(config.retry_backoff);
            if !retry {
                return;
            }
            if attempt + 1 == MAX_ATTEMPTS {
                config.log_error(log_fields!(
                    "event" => "data post",
                    "kind" => req.kind.as_str(),
                    "url" => url,
                    "err" => "retry limit reached, data discarded",
                ));
                return;
            }

            debug_assert_backoff_floor!(backoff, config.retry_backoff);
            tracing::debug!(url, ?backoff, status = resp.status, "retrying harvest request");

            // Cancellation is reported once per cycle by `harvest_now`.
            tokio::select! {
                biased;
                () = ctx.cancelled() => return,
                () = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

/// Buffers spans and metrics and ships them to the ingestion backend.
///
/// Cloning is cheap and every clone shares the same buffers.
#[derive(Clone, Default)]
pub struct Harvester {
    inner: Option<Arc<Inner>>,
}

impl std::fmt::Debug for Harvester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Some(inner) => f
                .debug_struct("Harvester")
                .field("config", &inner.config)
                .field("pending_spans", &lock(&inner.spans).len())
                .field("pending_metrics", &lock(&inner.metrics).raw.len())
                .finish(),
            None => f.write_str("Harvester(disabled)"),
        }
    }
}

impl Harvester {
    /// Creates a harvester.
    ///
    /// Invalid common attributes are dropped and reported through the error
    /// hook. When a Tokio runtime is running and
    /// [`needs_harvest_thread`](Self::needs_harvest_thread) holds, the
    /// background harvest task starts right away; otherwise it starts on the
    /// first record call that finds a runtime.
    pub fn new(config: Config) -> Self {
        let (vetted, errors) = vet_attributes(&config.common_attributes);
        let inner = Arc::new(Inner {
            common_attributes: to_raw(&vetted),
            config,
            spans: Mutex::new(Vec::new()),
            metrics: Mutex::new(MetricBuffer {
                raw: Vec::new(),
                last_harvest: SystemTime::now(),
            }),
            task: Mutex::new(TaskState::Idle),
            task_started: AtomicBool::new(false),
        });
        inner.report_attribute_errors("common", "", &errors);

        let harvester = Self { inner: Some(inner) };
        harvester.ensure_harvest_task();
        harvester
    }

    /// Returns an inert harvester on which every operation is a no-op.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// `false` for [`disabled`](Self::disabled) harvesters.
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// The configuration, unless the harvester is inert.
    pub fn config(&self) -> Option<&Config> {
        self.inner.as_deref().map(|inner| &inner.config)
    }

    /// Whether a background harvest task is wanted: a non-zero harvest period
    /// and an API key.
    pub fn needs_harvest_thread(&self) -> bool {
        self.config().is_some_and(Config::needs_harvest_thread)
    }

    /// Number of spans waiting for the next harvest.
    pub fn pending_spans(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| lock(&inner.spans).len())
    }

    /// Number of metrics waiting for the next harvest.
    pub fn pending_metrics(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| lock(&inner.metrics).raw.len())
    }

    /// Buffers a span for the next harvest.
    ///
    /// Invalid attributes are dropped, reported through the error hook and
    /// listed in the returned report; the span itself is always kept. A span
    /// without a timestamp is stamped with the current time.
    pub fn record_span(&self, span: Span) -> RecordReport {
        let Some(inner) = &self.inner else {
            return RecordReport::ignored();
        };

        let (recorded, dropped) = RecordedSpan::from_span(span, SystemTime::now());
        inner.report_attribute_errors("span", &recorded.name, &dropped);
        lock(&inner.spans).push(recorded);

        self.ensure_harvest_task();
        RecordReport {
            accepted: true,
            dropped,
        }
    }

    /// Buffers a metric for the next harvest.
    ///
    /// Without an API key there is nowhere to send metrics, so nothing is
    /// buffered. A metric with a NaN or infinite value is rejected and reported
    /// through the error hook.
    pub fn record_metric(&self, metric: impl Into<Metric>) -> RecordReport {
        let Some(inner) = &self.inner else {
            return RecordReport::ignored();
        };
        if inner.config.api_key.is_empty() {
            return RecordReport::ignored();
        }

        let metric = metric.into();
        let (raw, dropped) = match metric.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                inner.config.log_error(log_fields!(
                    "err" => e.to_string(),
                    "message" => "invalid metric",
                    "name" => metric.name(),
                ));
                return RecordReport::ignored();
            }
        };
        inner.report_attribute_errors("metric", metric.name(), &dropped);
        lock(&inner.metrics).raw.push(raw);

        self.ensure_harvest_task();
        RecordReport {
            accepted: true,
            dropped,
        }
    }

    /// Detaches all pending spans and builds their requests.
    ///
    /// Spans recorded after this returns go to the next batch. A destination
    /// that fails to parse yields no requests and an error-hook report.
    pub fn swap_out_spans(&self) -> Vec<HarvestRequest> {
        let Some(inner) = &self.inner else {
            return Vec::new();
        };

        let spans = {
            let mut pending = lock(&inner.spans);
            let spans = std::mem::take(&mut *pending);
            debug_assert_buffer_drained!("span", pending.len());
            spans
        };
        if spans.is_empty() {
            return Vec::new();
        }

        let common = inner.common_attributes.as_deref();
        let encode = |chunk: &[RecordedSpan]| encode_spans(common, chunk);
        match build_requests(&inner.config, EntityKind::Spans, &spans, &encode) {
            Ok(requests) => requests,
            Err(e) => {
                inner.config.log_error(log_fields!(
                    "err" => e.to_string(),
                    "message" => "unable to build span requests",
                    "url" => inner.config.spans_url(),
                    "dropped" => spans.len(),
                ));
                Vec::new()
            }
        }
    }

    /// Detaches all pending metrics and builds their requests.
    ///
    /// The batch's `common` block covers the window from the previous swap to
    /// `now`; metrics without their own timestamp/interval inherit it.
    pub fn swap_out_metrics(&self, now: SystemTime) -> Vec<HarvestRequest> {
        let Some(inner) = &self.inner else {
            return Vec::new();
        };

        let (metrics, last_harvest) = {
            let mut pending = lock(&inner.metrics);
            let metrics = std::mem::take(&mut pending.raw);
            let last_harvest = std::mem::replace(&mut pending.last_harvest, now);
            debug_assert_buffer_drained!("metric", pending.raw.len());
            (metrics, last_harvest)
        };
        if metrics.is_empty() {
            return Vec::new();
        }

        let common = MetricCommon {
            timestamp: epoch_millis(last_harvest),
            interval_ms: now
                .duration_since(last_harvest)
                .map_or(0, duration_millis),
            attributes: inner.common_attributes.as_deref(),
        };
        let encode = |chunk: &[Box<RawValue>]| encode_metrics(common, chunk);
        match build_requests(&inner.config, EntityKind::Metrics, &metrics, &encode) {
            Ok(requests) => requests,
            Err(e) => {
                inner.config.log_error(log_fields!(
                    "err" => e.to_string(),
                    "message" => "unable to build metric requests",
                    "url" => inner.config.metrics_url(),
                    "dropped" => metrics.len(),
                ));
                Vec::new()
            }
        }
    }

    /// Runs one harvest cycle now.
    ///
    /// Calls the `before_harvest` hook, swaps out both buffers and sends the
    /// span and metric requests concurrently. `ctx` bounds the network work:
    /// every request is still attempted once, pending retries are abandoned,
    /// and a cycle that ends with `ctx` cancelled reports `"harvest cancelled"`
    /// once through the error hook, after the per-request outcomes.
    pub async fn harvest_now(&self, ctx: &CancellationToken) {
        let Some(inner) = &self.inner else {
            return;
        };

        if let Some(hook) = &inner.config.before_harvest {
            hook(self);
        }

        let span_requests = self.swap_out_spans();
        let metric_requests = self.swap_out_metrics(SystemTime::now());
        if span_requests.is_empty() && metric_requests.is_empty() {
            return;
        }

        tracing::debug!(
            span_requests = span_requests.len(),
            metric_requests = metric_requests.len(),
            "harvesting"
        );
        tokio::join!(
            inner.send_all(span_requests, ctx),
            inner.send_all(metric_requests, ctx),
        );

        if ctx.is_cancelled() {
            inner.config.log_error(log_fields!(
                "event" => "harvest",
                "err" => "harvest cancelled",
            ));
        }
    }

    /// Runs one harvest cycle, cancelling its network work after `timeout`.
    pub async fn harvest_with_timeout(&self, timeout: Duration) {
        let ctx = CancellationToken::new();
        self.harvest_until(&ctx, timeout).await;
    }

    async fn harvest_until(&self, ctx: &CancellationToken, timeout: Duration) {
        let deadline = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                ctx.cancel();
            })
        };
        self.harvest_now(ctx).await;
        deadline.abort();
    }

    /// Stops the background task and flushes whatever is still buffered.
    ///
    /// Afterwards the harvester keeps accepting records but only
    /// [`harvest_now`](Self::harvest_now) ships them.
    pub async fn shutdown(&self) {
        let Some(inner) = &self.inner else {
            return;
        };

        // Keeps later record calls on the atomic fast path.
        inner.task_started.store(true, Ordering::Release);
        let task = match std::mem::replace(&mut *lock(&inner.task), TaskState::Stopped) {
            TaskState::Running(task) => Some(task),
            TaskState::Idle | TaskState::Stopped => None,
        };
        if let Some(task) = task {
            task.shutdown.cancel();
            if let Err(e) = task.handle.await {
                inner.config.log_error(log_fields!(
                    "err" => e.to_string(),
                    "message" => "harvest task failed",
                ));
            }
        }

        self.harvest_with_timeout(inner.config.harvest_timeout).await;
        inner.config.log_debug(log_fields!("event" => "harvester shutdown"));
    }

    /// Starts the background task if it is wanted, not yet running, and a
    /// Tokio runtime is available.
    fn ensure_harvest_task(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        if inner.task_started.load(Ordering::Acquire) || !inner.config.needs_harvest_thread() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let mut state = lock(&inner.task);
        if !matches!(*state, TaskState::Idle) {
            return;
        }

        let shutdown = CancellationToken::new();
        let handle = runtime.spawn(harvest_loop(
            Arc::downgrade(inner),
            inner.config.harvest_period,
            inner.config.harvest_timeout,
            shutdown.clone(),
        ));
        *state = TaskState::Running(HarvestTask { shutdown, handle });
        inner.task_started.store(true, Ordering::Release);

        inner.config.log_debug(log_fields!(
            "event" => "harvest task started",
            "period_ms" => duration_millis(inner.config.harvest_period),
        ));
    }
}

/// Background cycle: harvests every `period` until shut down or until the
/// last handle is dropped.
async fn harvest_loop(
    inner: Weak<Inner>,
    period: Duration,
    timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        let harvester = Harvester { inner: Some(inner) };
        let cycle = shutdown.child_token();
        harvester.harvest_until(&cycle, timeout).await;
    }

    tracing::debug!("harvest task stopped");
}
