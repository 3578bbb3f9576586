use opentelemetry::KeyValue;
use opentelemetry_otlp::{Protocol, WithExportConfig};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::Resource;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Default, Clone)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

fn default_transport() -> String {
    "http".into()
}

fn default_endpoint() -> String {
    "http://localhost:8428/opentelemetry/v1/metrics".into()
}

/// Build and register a global meter provider.
/// For gRPC transport, requires an active tokio runtime context.
pub fn init_meter_provider(config: &MetricsConfig) -> Option<SdkMeterProvider> {
    if !config.enabled {
        return None;
    }

    let resource = Resource::builder_empty()
        .with_attributes([KeyValue::new("service.name", "gmem")])
        .build();

    let exporter = match config.transport.as_str() {
        "grpc" => opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(&config.endpoint)
            .with_protocol(Protocol::Grpc)
            .with_timeout(Duration::from_secs(5))
            .build(),
        _ => opentelemetry_otlp::MetricExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(&config.endpoint)
            .with_timeout(Duration::from_secs(5))
            .build(),
    }
    .map_err(|e| log::warn!("metrics {} exporter: {e}", config.transport))
    .ok()?;

    let provider = SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(resource)
        .build();

    opentelemetry::global::set_meter_provider(provider.clone());
    Some(provider)
}

fn add(name: &'static str, n: u64, attrs: &[KeyValue]) {
    opentelemetry::global::meter("gmem")
        .u64_counter(name)
        .build()
        .add(n, attrs);
}

pub fn count_parse_skips(n: u64) {
    add("gmem_parse_skipped_lines_total", n, &[]);
}

pub fn count_turn(group_id: &str, partial: bool) {
    add(
        "gmem_turns_total",
        1,
        &[
            KeyValue::new("group_id", group_id.to_string()),
            KeyValue::new("partial", partial),
        ],
    );
}

pub fn count_submitted(group_id: &str) {
    add(
        "gmem_episodes_submitted_total",
        1,
        &[KeyValue::new("group_id", group_id.to_string())],
    );
}

/// An episode parked in the failed list, tagged with the store error kind.
pub fn count_failed(kind: &'static str) {
    add("gmem_episodes_failed_total", 1, &[KeyValue::new("kind", kind)]);
}

pub fn count_summarizer_cache_hit() {
    add("gmem_summarizer_cache_hits_total", 1, &[]);
}

pub fn count_summarizer_fallback() {
    add("gmem_summarizer_fallbacks_total", 1, &[]);
}

pub fn count_request(route: &'static str) {
    add("gmem_api_requests_total", 1, &[KeyValue::new("route", route)]);
}

pub fn count_daemon_restart() {
    add("gmem_daemon_restarts_total", 1, &[]);
}
