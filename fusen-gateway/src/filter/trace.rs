use std::collections::HashMap;

use fusen_gateway_common::BoxFutureV2;
use opentelemetry::{propagation::TextMapPropagator, trace::TraceContextExt};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use serde_json::Value;
use tracing::{info_span, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::{Filter, FilterResult, ProceedingJoinPoint};

pub const TRACE_FILTER_ID: &str = "trace_filter";
pub const ATTR_TRACE_ID: &str = "X-Trace-Id";

/// Continues the caller's W3C trace, or starts one, around the rest of the chain.
#[derive(Default)]
pub struct TraceFilter {
    propagator: TraceContextPropagator,
}

impl Filter for TraceFilter {
    fn filter_id(&self) -> &str {
        TRACE_FILTER_ID
    }

    fn order(&self) -> i32 {
        -1000
    }

    fn call<'a>(&'a self, join_point: ProceedingJoinPoint<'a>) -> BoxFutureV2<'a, FilterResult> {
        Box::pin(async move {
            let request = join_point.context.request();
            let carrier: HashMap<String, String> = request
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_owned(), value.to_owned()))
                })
                .collect();
            let parent = self.propagator.extract(&carrier);
            let span = info_span!(
                "gateway_route",
                request_id = join_point.context.request_id(),
                method = %request.method,
                path = request.path()
            );
            if parent.span().span_context().is_valid() {
                span.set_parent(parent);
            }
            let span_context = span.context().span().span_context().clone();
            if span_context.is_valid() {
                let trace_id = span_context.trace_id().to_string();
                span.set_attribute("trace_id", trace_id.clone());
                join_point
                    .context
                    .set_attribute(ATTR_TRACE_ID, Value::String(trace_id));
            }
            join_point.proceed().instrument(span).await
        })
    }
}

#[cfg(test)]
mod tests {
    use fusen_gateway_common::context::{CancelSignal, Context, WebRequest};

    use super::*;
    use crate::filter::{
        tests::{RecordInvoker, Trace},
        FilterChain,
    };

    #[tokio::test]
    async fn test_trace_filter_proceeds() {
        let trace = Trace::default();
        let chain = FilterChain::new(vec![std::sync::Arc::new(TraceFilter::default())], vec![]);
        let invoker = RecordInvoker {
            trace: trace.clone(),
        };
        let mut ctx = Context::new(
            WebRequest::new("GET", "/users").with_header(
                "traceparent",
                "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            ),
            CancelSignal::never(),
        );
        assert!(chain.execute(&mut ctx, &invoker).await.is_ok());
        assert_eq!(*trace.lock().unwrap(), vec!["terminal"]);
    }
}
