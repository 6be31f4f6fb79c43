//! # Telemetry Harvester Demo
//!
//! Runs several producer tasks that record spans and metrics into one shared
//! [`Harvester`] while the background task ships them every harvest period.
//!
//! By default requests go to a simulated backend that answers with a mix of
//! `202`, `429 Retry-After` and `503`, so the retry path shows up in the logs.
//! With `--live` the harvester is configured from the environment
//! (`HARVESTER_API_KEY`, `HARVESTER_SPANS_URL`, ...) and posts for real.
//!
//! ## Running
//!
//! ```bash
//! # Quick mode (4 producers, 25 iterations each)
//! cargo run -p telemetry_harvester --features demo --bin demo -- --quick
//!
//! # Full mode with hook output
//! RUST_LOG=telemetry_harvester=debug cargo run -p telemetry_harvester --features demo --bin demo
//!
//! # Against a real endpoint
//! HARVESTER_API_KEY=... cargo run -p telemetry_harvester --features demo --bin demo -- --live
//! ```

use anyhow::Context;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use telemetry_harvester::{
    CancellationToken, Config, Count, Gauge, HarvestRequest, HarvestResponse, Harvester, Span,
    Summary, TracingSink, Transport, TransportError,
};
use tracing::Level;
use tracing_subscriber::EnvFilter;

// =============================================================================
// SIMULATED BACKEND
// =============================================================================

/// Answers like an ingestion endpoint under load.
struct SimulatedBackend {
    /// Probability of a `503`
    failure_rate: f64,
    /// Probability of a `429` with `Retry-After: 1`
    throttle_rate: f64,
    latency: Duration,
    posts: AtomicU64,
    accepted: AtomicU64,
    bytes: AtomicU64,
}

impl SimulatedBackend {
    fn new(failure_rate: f64, throttle_rate: f64, latency: Duration) -> Self {
        Self {
            failure_rate,
            throttle_rate,
            latency,
            posts: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }
}

impl Transport for SimulatedBackend {
    async fn send(
        &self,
        request: &HarvestRequest,
        ctx: &CancellationToken,
    ) -> Result<HarvestResponse, TransportError> {
        self.posts.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(request.body.len() as u64, Ordering::Relaxed);

        // Draw before awaiting; the thread-local rng is not Send.
        let roll: f64 = rand::thread_rng().gen();

        tokio::select! {
            () = ctx.cancelled() => return Err(TransportError::Cancelled),
            () = tokio::time::sleep(self.latency) => {}
        }

        if roll < self.failure_rate {
            Ok(HarvestResponse::new(503, None))
        } else if roll < self.failure_rate + self.throttle_rate {
            Ok(HarvestResponse::new(429, Some("1".into())))
        } else {
            self.accepted.fetch_add(1, Ordering::Relaxed);
            Ok(HarvestResponse::new(202, None))
        }
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

// =============================================================================
// PRODUCERS
// =============================================================================

const OPERATIONS: [&str; 5] = [
    "GET /cart",
    "POST /checkout",
    "SELECT orders",
    "cache.get",
    "publish order.created",
];

async fn run_producer(id: usize, harvester: Harvester, iterations: usize, verbose: bool) -> u64 {
    let mut recorded = 0;
    for i in 0..iterations {
        let (root, children, status, latency_ms) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen::<u64>(),
                rng.gen_range(1..4),
                if rng.gen_bool(0.1) { 500 } else { 200 },
                rng.gen_range(1.0..250.0),
            )
        };
        let trace_id = format!("{root:016x}");
        let root_id = format!("{id}-{i}");

        harvester.record_span(
            Span::new(root_id.clone(), trace_id.clone(), OPERATIONS[0])
                .with_service_name(format!("shop-{id}"))
                .with_duration(Duration::from_secs_f64(latency_ms / 1000.0))
                .with_attribute("http.status_code", status)
                .with_attribute("error", status >= 500),
        );
        recorded += 1;

        for c in 0..children {
            harvester.record_span(
                Span::new(format!("{root_id}-{c}"), trace_id.clone(), OPERATIONS[1 + c % 4])
                    .with_parent(root_id.clone())
                    .with_service_name(format!("shop-{id}")),
            );
            recorded += 1;
        }

        harvester.record_metric(Count {
            name: "http.requests".into(),
            attributes: [("status".to_string(), status.into())].into_iter().collect(),
            value: 1.0,
            ..Default::default()
        });
        harvester.record_metric(Summary {
            name: "http.latency".into(),
            count: 1.0,
            sum: latency_ms,
            min: latency_ms,
            max: latency_ms,
            ..Default::default()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    if verbose {
        println!("   Producer {id} completed: {recorded} spans");
    }
    recorded
}

// =============================================================================
// MAIN APPLICATION
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let verbose = args.iter().any(|a| a == "--verbose");
    let quick = args.iter().any(|a| a == "--quick");
    let live = args.iter().any(|a| a == "--live");

    let (num_producers, iterations) = if quick { (4, 25) } else { (8, 100) };

    let backend = Arc::new(SimulatedBackend::new(0.1, 0.05, Duration::from_millis(5)));
    let config = if live {
        Config::from_env().context("invalid harvester environment")?
    } else {
        Config::new("demo-key")
            .with_harvest_period(Duration::from_millis(500))
            .with_retry_backoff(Duration::from_millis(200))
            .with_client(backend.clone())
    };
    anyhow::ensure!(
        config.needs_harvest_thread(),
        "harvesting disabled: set HARVESTER_API_KEY and a non-zero HARVESTER_HARVEST_PERIOD_MS"
    );

    let config = config
        .with_product("harvester-demo", env!("CARGO_PKG_VERSION"))
        .with_common_attributes(
            [("host".to_string(), "demo-host".into())].into_iter().collect(),
        )
        .with_error_logger(TracingSink::new(Level::WARN))
        .with_debug_logger(TracingSink::new(Level::DEBUG))
        .with_audit_logger(TracingSink::new(Level::TRACE))
        .with_before_harvest(|h: &Harvester| {
            h.record_metric(Gauge {
                name: "harvester.pending_spans".into(),
                value: h.pending_spans() as f64,
                timestamp: Some(SystemTime::now()),
                ..Default::default()
            });
        });

    println!("Demo Configuration:");
    println!("   Mode: {}", if quick { "quick" } else { "full" });
    println!("   Backend: {}", if live { "live" } else { "simulated" });
    println!("   Producers: {num_producers}");
    println!("   Iterations per producer: {iterations}");
    println!("   {config:?}");
    println!();

    let harvester = Harvester::new(config);
    let start = Instant::now();

    let producers: Vec<_> = (0..num_producers)
        .map(|id| tokio::spawn(run_producer(id, harvester.clone(), iterations, verbose)))
        .collect();

    let mut total_spans = 0;
    for (id, handle) in producers.into_iter().enumerate() {
        total_spans += handle
            .await
            .with_context(|| format!("producer {id} panicked"))?;
    }
    let generation_time = start.elapsed();

    println!("\nShutting down, flushing {} pending spans", harvester.pending_spans());
    tokio::select! {
        () = harvester.shutdown() => {}
        res = tokio::signal::ctrl_c() => {
            res.context("unable to listen for ctrl-c")?;
            println!("   interrupted, pending data dropped");
        }
    }

    println!("\nResults");
    println!("   Total time:          {:>12.2?}", start.elapsed());
    println!("   Generation time:     {generation_time:>12.2?}");
    println!("   Spans recorded:      {total_spans:>12}");
    if !live {
        println!("   Requests posted:     {:>12}", backend.posts.load(Ordering::Relaxed));
        println!("   Requests accepted:   {:>12}", backend.accepted.load(Ordering::Relaxed));
        println!("   Compressed bytes:    {:>12}", backend.bytes.load(Ordering::Relaxed));
    }
    Ok(())
}
