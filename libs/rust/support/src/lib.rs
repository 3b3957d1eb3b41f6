//! Shared ambient utilities for fedquorum services: tracing/OTEL init, a
//! `/healthz` endpoint, and layered environment+file configuration loading.
//!
//! Nothing in this crate knows about consensus, messages, or transports —
//! it is the same bootstrap surface every binary in the workspace uses.

use anyhow::Result;
use tracing::info;
use once_cell::sync::OnceCell;
use opentelemetry::{global, sdk::{trace as sdktrace, Resource}, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use axum::{routing::get, Router};
use std::net::SocketAddr;
use serde::Deserialize;

pub mod metrics;

static OTEL_INIT: OnceCell<()> = OnceCell::new();

pub fn init_tracing(service: &str) -> Result<()> {
    OTEL_INIT.get_or_try_init(|| {
        let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or_else(|_| "http://localhost:4317".into());
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_endpoint(otlp_endpoint)
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", service.to_string()),
            ])))
            .install_batch(opentelemetry::runtime::Tokio)?;

        let fmt_layer = tracing_subscriber::fmt::layer();
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        let env_filter = tracing_subscriber::EnvFilter::from_default_env();
        let registry = tracing_subscriber::registry().with(env_filter).with(fmt_layer).with(otel_layer);
        registry.try_init()?;
        Ok(())
    })?;
    info!(target: service, "Tracing + OTEL initialized");
    Ok(())
}

pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

pub async fn start_health_server(port: u16) -> Result<()> {
    let app = Router::new().route("/healthz", get(|| async { "ok" }));
    let addr = SocketAddr::from(([0,0,0,0], port));
    tracing::info!(?addr, "Health server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::Server::bind(&addr).serve(app.into_make_service()).await {
            tracing::error!(error=?e, "Health server failed");
        }
    });
    Ok(())
}

/// Installs a Prometheus exporter as the global meter provider (so every
/// `opentelemetry::global::meter(...)` call, including the ones backing
/// `crate::metrics::CONSENSUS_METRICS`, reports through it) and serves the
/// scrape endpoint on `/metrics`.
pub async fn start_metrics_server(port: u16) -> Result<()> {
    use opentelemetry::sdk::export::metrics::aggregation;
    use opentelemetry_sdk::metrics::{controllers, processors, selectors};

    let controller = controllers::basic(processors::factory(
        selectors::simple::Selector::Exact,
        aggregation::cumulative_temporality_selector(),
    ))
    .build();
    let exporter = opentelemetry_prometheus::PrometheusExporter::new(controller);
    opentelemetry::global::set_meter_provider(exporter.meter_provider()?);

    let handle = exporter.clone();
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(?addr, "Metrics server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::Server::bind(&addr).serve(app.into_make_service()).await {
            tracing::error!(error=?e, "Metrics server failed");
        }
    });
    Ok(())
}

/// Generic service-level defaults, loaded before any protocol-specific
/// configuration. Individual services layer their own typed config on top
/// of the same `config::Config` builder pattern (see `services/node`).
#[derive(Debug, Deserialize, Clone)]
pub struct DynamicConfig {
    pub service_name: Option<String>,
    pub log_level: Option<String>,
}

impl Default for DynamicConfig {
    fn default() -> Self { Self { service_name: None, log_level: Some("info".into()) } }
}

pub async fn load_config(service: &str, env_prefix: &str) -> Result<DynamicConfig> {
    let mut builder = config::Config::builder()
        .set_default("service_name", service)?
        .set_default("log_level", "info")?;

    if let Ok(file) = std::env::var("FEDQUORUM_CONFIG_FILE") {
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    if let Ok(http_url) = std::env::var("FEDQUORUM_CONFIG_HTTP") {
        if let Ok(resp) = reqwest::get(http_url.clone()).await {
            if let Ok(text) = resp.text().await {
                builder = builder.add_source(config::File::from_str(&text, config::FileFormat::Yaml));
            }
        }
    }
    builder = builder.add_source(config::Environment::with_prefix(env_prefix).separator("__"));
    let cfg = builder.build()?;
    let dyn_cfg: DynamicConfig = cfg.try_deserialize()?;
    Ok(dyn_cfg)
}
