use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// A layer installed beneath the filter, e.g. an OpenTelemetry span exporter.
pub type BoxLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
    /// Rolls daily log files into this directory instead of writing to stdout.
    pub directory: Option<String>,
    pub file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            json: false,
            directory: None,
            file_prefix: "fusen-gateway.log".to_owned(),
        }
    }
}

/// `RUST_LOG` takes precedence over `config.level`. Keep the returned guard alive
/// for as long as file logging is needed.
pub fn init_log(config: &LogConfig, telemetry: Option<BoxLayer>) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let (writer, guard) = match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, &config.file_prefix);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stdout), None),
    };
    let layer = fmt::layer()
        .with_line_number(true)
        .with_thread_ids(true)
        .with_writer(writer);
    let layer = if config.json {
        layer.json().boxed()
    } else {
        layer.boxed()
    };
    let _ = tracing_subscriber::registry()
        .with(telemetry)
        .with(filter)
        .with(layer)
        .try_init();
    guard
}

pub fn get_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn get_trade_id() -> String {
    format!(
        "{}-{}",
        uuid::Uuid::new_v4(),
        Local::now().format("%Y%m%d%H%M%S")
    )
}
