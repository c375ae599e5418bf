use std::time::Duration;

use fusen_gateway_common::{error::ServeError, model::Service};
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    KeyValue,
};

pub const METER_NAME: &str = "fusen-gateway";

pub const STAGE_SELECTOR: &str = "selector";
pub const STAGE_FILTERS: &str = "filters";
pub const STAGE_TRANSPORTER: &str = "transporter";
pub const STAGE_ROUTE: &str = "route";

/// Endpoint access counters and stage latencies, exported through the global meter provider.
#[derive(Clone)]
pub struct RouterMetrics {
    access: Counter<u64>,
    errors: Counter<u64>,
    duration: Histogram<f64>,
}

impl Default for RouterMetrics {
    fn default() -> Self {
        let meter = global::meter(METER_NAME);
        Self {
            access: meter
                .u64_counter("gateway_endpoint_access_total")
                .with_description("Requests routed to an endpoint")
                .build(),
            errors: meter
                .u64_counter("gateway_endpoint_error_total")
                .with_description("Requests routed to an endpoint that failed")
                .build(),
            duration: meter
                .f64_histogram("gateway_route_duration_seconds")
                .with_description("Elapsed time of each routing stage")
                .with_unit("s")
                .build(),
        }
    }
}

impl RouterMetrics {
    pub fn record_access(&self, service: &Service) {
        self.access.add(1, &endpoint_labels(service));
    }

    pub fn record_error(&self, service: &Service, error: &ServeError) {
        let mut labels = endpoint_labels(service);
        labels.push(KeyValue::new(
            "error_code",
            error.error_code.as_str().to_owned(),
        ));
        self.errors.add(1, &labels);
    }

    pub fn record_stage(&self, stage: &'static str, elapsed: Duration) {
        self.duration
            .record(elapsed.as_secs_f64(), &[KeyValue::new("stage", stage)]);
    }
}

fn endpoint_labels(service: &Service) -> Vec<KeyValue> {
    vec![
        KeyValue::new("proto", service.rpc_proto()),
        KeyValue::new("interface", service.interface.clone()),
        KeyValue::new("method", service.method.clone()),
    ]
}
