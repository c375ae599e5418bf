use std::path::Path;

use fusen_gateway::{
    config::{GatewayConfig, DEFAULT_CONFIG_PATH},
    error::GatewayError,
    GatewayApplication,
};
use fusen_gateway_common::logs::{init_log, BoxLayer};
use opentelemetry::{global, trace::TracerProvider as _};
use opentelemetry_sdk::{propagation::TraceContextPropagator, trace::TracerProvider};
use tracing::info;
use tracing_subscriber::Registry;

fn load_config() -> Result<GatewayConfig, GatewayError> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_owned());
    if !Path::new(&path).exists() {
        return Ok(GatewayConfig::default());
    }
    GatewayConfig::load(&path).map_err(|error| GatewayError::Config(format!("{path}: {error}")))
}

#[tokio::main]
async fn main() -> Result<(), GatewayError> {
    let config = load_config()?;
    global::set_text_map_propagator(TraceContextPropagator::new());
    let provider = TracerProvider::builder().build();
    let tracer = provider.tracer(config.application_name.clone());
    let telemetry: BoxLayer =
        Box::new(tracing_opentelemetry::layer::<Registry>().with_tracer(tracer));
    let _log_guard = init_log(&config.log, Some(telemetry));
    info!(listeners = config.listeners.len(), "gateway config loaded");
    let application = GatewayApplication::builder().config(config).build()?;
    application.run().await?;
    let _ = provider.shutdown();
    Ok(())
}
