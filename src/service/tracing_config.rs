use std::path::Path;
use std::time::Duration;

use dotenv::dotenv;
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::trace::SpanLimits;
use opentelemetry_sdk::{
    metrics::{
        reader::{DefaultAggregationSelector, DefaultTemporalitySelector},
        Aggregation, Instrument, MeterProviderBuilder, PeriodicReader, SdkMeterProvider, Stream,
    },
    runtime,
    trace::{BatchConfigBuilder, RandomIdGenerator, Sampler, Tracer},
    Resource,
};
use opentelemetry_semantic_conventions::{
    resource::{SERVICE_NAME, SERVICE_VERSION},
    SCHEMA_URL,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_opentelemetry::{MetricsLayer, OpenTelemetryLayer};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use super::config::TracingConfig;
use super::{AppError, AppResult};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

fn resource() -> Resource {
    Resource::from_schema_url(
        [
            KeyValue::new(SERVICE_NAME, env!("CARGO_PKG_NAME")),
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
        ],
        SCHEMA_URL,
    )
}

/// `RUST_LOG` wins, `default_directive` applies when it is unset.
fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// OTLP metrics every 30 seconds, optionally mirrored to stdout. Installed
/// as the global meter provider so partitions can record publish latency.
fn init_meter_provider(stdout_metrics: bool) -> AppResult<SdkMeterProvider> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .build_metrics_exporter(
            Box::new(DefaultAggregationSelector::new()),
            Box::new(DefaultTemporalitySelector::new()),
        )
        .map_err(|e| AppError::IllegalStateError(format!("otlp metrics exporter: {}", e)))?;

    let reader = PeriodicReader::builder(exporter, runtime::Tokio)
        .with_interval(Duration::from_secs(30))
        .build();

    // publish latency in milliseconds, bucketed for a local broker
    let publish_latency_view = |instrument: &Instrument| -> Option<Stream> {
        if instrument.name == "lanemq.publish.latency" {
            Some(
                Stream::new()
                    .name("lanemq.publish.latency")
                    .aggregation(Aggregation::ExplicitBucketHistogram {
                        boundaries: vec![0.5, 1.0, 2.0, 5.0, 10.0, 50.0, 100.0, 500.0],
                        record_min_max: true,
                    }),
            )
        } else {
            None
        }
    };

    let mut builder = MeterProviderBuilder::default()
        .with_resource(resource())
        .with_reader(reader)
        .with_view(publish_latency_view);
    if stdout_metrics {
        let stdout_reader = PeriodicReader::builder(
            opentelemetry_stdout::MetricsExporter::default(),
            runtime::Tokio,
        )
        .build();
        builder = builder.with_reader(stdout_reader);
    }
    let meter_provider = builder.build();

    global::set_meter_provider(meter_provider.clone());

    Ok(meter_provider)
}

/// Batched OTLP span export, sampling everything.
fn init_tracer() -> AppResult<Tracer> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_batch_config(
            BatchConfigBuilder::default()
                .with_scheduled_delay(Duration::from_secs(5))
                .build(),
        )
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                    1.0,
                ))))
                .with_id_generator(RandomIdGenerator::default())
                .with_span_limits(SpanLimits::default())
                .with_resource(resource()),
        )
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .install_batch(runtime::Tokio)
        .map_err(|e| AppError::IllegalStateError(format!("otlp tracer: {}", e)))
}

/// Flushes exporters and the log file writer when dropped.
pub struct OtelGuard {
    meter_provider: SdkMeterProvider,
    _worker_guard: WorkerGuard,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        tracing::info!("flushing telemetry");
        if let Err(err) = self.meter_provider.shutdown() {
            eprintln!("meter provider shutdown failed: {err:?}");
        }
        global::shutdown_tracer_provider();
    }
}

/// Console only tracing, used by the client tools and tests. Loads `.env`
/// first so `RUST_LOG` can live there.
pub fn setup_local_tracing(default_directive: &str) -> AppResult<()> {
    dotenv().ok();
    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter(default_directive))
        .try_init()
        .map_err(|e| AppError::IllegalStateError(format!("tracing already set up: {}", e)))
}

/// Node tracing: console plus an hourly rolling file under `log_dir`, spans
/// and metrics exported over OTLP. Must be called inside a tokio runtime;
/// keep the guard alive until shutdown.
pub fn setup_tracing(config: &TracingConfig) -> AppResult<OtelGuard> {
    dotenv().ok();
    let file_appender =
        tracing_appender::rolling::hourly(Path::new(&config.log_dir), "lanemq.log");
    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);

    // write to the console and the file at the same time
    let writer = non_blocking.and(std::io::stdout);

    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(true)
        .with_writer(writer);

    let meter_provider = init_meter_provider(config.stdout_metrics)?;
    let tracer = init_tracer()?;

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(MetricsLayer::new(meter_provider.clone()))
        .with(OpenTelemetryLayer::new(tracer))
        .with(env_filter(&config.default_directive))
        .try_init()
        .map_err(|e| AppError::IllegalStateError(format!("tracing already set up: {}", e)))?;

    Ok(OtelGuard {
        meter_provider,
        _worker_guard: worker_guard,
    })
}
