use std::{any::Any, backtrace::Backtrace, panic::AssertUnwindSafe, sync::Arc, time::Instant};

use fusen_gateway_common::{
    context::Context,
    error::{ErrorCode, ServeError},
    model::Endpoint,
    response::ServeResponse,
    BoxFutureV2,
};
use futures::FutureExt;
use tracing::{error, info, warn};

use crate::{
    config::DEFAULT_VERSION_HEADER,
    endpoint::MultiEndpoint,
    filter::{FilterChain, FilterResult, Invoker},
    transporter::TransporterRegistry,
};
use self::metrics::{RouterMetrics, STAGE_FILTERS, STAGE_ROUTE, STAGE_SELECTOR, STAGE_TRANSPORTER};

pub mod metrics;

/// Picks an endpoint version when the version header does not name one.
pub trait EndpointSelector: Send + Sync {
    fn active(&self, ctx: &Context, listener_id: &str) -> bool;

    fn do_select(&self, ctx: &Context, multi: &MultiEndpoint) -> Option<Arc<Endpoint>>;
}

/// Terminal of every chain: dispatches to the transporter of the selected endpoint.
struct TransportInvoker {
    transporters: Arc<TransporterRegistry>,
    metrics: RouterMetrics,
}

impl Invoker for TransportInvoker {
    fn invoke<'a>(&'a self, ctx: &'a mut Context) -> BoxFutureV2<'a, FilterResult> {
        Box::pin(async move {
            if ctx.is_canceled() {
                return Err(ServeError::canceled("request canceled before dispatch"));
            }
            let endpoint = ctx
                .endpoint()
                .cloned()
                .ok_or_else(|| ServeError::internal("no endpoint selected for dispatch"))?;
            let start = Instant::now();
            let mut cancel = ctx.cancel_signal();
            let result = tokio::select! {
                biased;
                _ = cancel.canceled() => {
                    Err(ServeError::canceled("request canceled during dispatch"))
                }
                result = self.transporters.do_invoke_codec(ctx, &endpoint.service) => result,
            };
            ctx.add_metric(STAGE_TRANSPORTER, start.elapsed());
            self.metrics.record_stage(STAGE_TRANSPORTER, start.elapsed());
            let response = result?;
            for (name, value) in &response.attachments {
                ctx.set_attribute(name, value.clone());
            }
            Ok(response)
        })
    }
}

/// Selects the endpoint version of a request and runs its filter chain.
pub struct Router {
    chain: FilterChain,
    selectors: Vec<Arc<dyn EndpointSelector>>,
    version_header: String,
    invoker: TransportInvoker,
    metrics: RouterMetrics,
}

impl Router {
    pub fn new(transporters: Arc<TransporterRegistry>, chain: FilterChain) -> Self {
        let metrics = RouterMetrics::default();
        Self {
            chain,
            selectors: Vec::new(),
            version_header: DEFAULT_VERSION_HEADER.to_owned(),
            invoker: TransportInvoker {
                transporters,
                metrics: metrics.clone(),
            },
            metrics,
        }
    }

    pub fn with_version_header(mut self, version_header: &str) -> Self {
        version_header.clone_into(&mut self.version_header);
        self
    }

    pub fn add_selector(&mut self, selector: Arc<dyn EndpointSelector>) {
        self.selectors.push(selector);
    }

    pub fn transporters(&self) -> &Arc<TransporterRegistry> {
        &self.invoker.transporters
    }

    /// Version header first, then the active selectors in registration order.
    /// Without a requested version, or with a single registered one, any version matches.
    pub fn select_endpoint(
        &self,
        ctx: &Context,
        listener_id: &str,
        multi: &MultiEndpoint,
    ) -> Option<Arc<Endpoint>> {
        let version = ctx
            .request()
            .header_value(&self.version_header)
            .unwrap_or_default()
            .trim();
        if let Some(endpoint) = multi.lookup_by_version(version) {
            return Some(endpoint);
        }
        let selected = self
            .selectors
            .iter()
            .filter(|e| e.active(ctx, listener_id))
            .find_map(|e| e.do_select(ctx, multi));
        if selected.is_some() {
            return selected;
        }
        if version.is_empty() {
            multi.random_version()
        } else {
            multi.single_version()
        }
    }

    /// Selection and dispatch share one unwind boundary; a panic anywhere in
    /// them becomes a `CriticalPanic` error.
    pub async fn route(
        &self,
        ctx: &mut Context,
        listener_id: &str,
        multi: &MultiEndpoint,
    ) -> Result<ServeResponse, ServeError> {
        let start = Instant::now();
        let routed = AssertUnwindSafe(self.select_and_dispatch(ctx, listener_id, multi, start));
        let result = match routed.catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(critical_panic(ctx.request_id(), panic)),
        };
        ctx.add_metric(STAGE_ROUTE, start.elapsed());
        self.metrics.record_stage(STAGE_ROUTE, start.elapsed());
        let service = ctx.endpoint().map(|e| e.service.id()).unwrap_or_default();
        match &result {
            Ok(response) => info!(
                request_id = ctx.request_id(),
                %service,
                status = response.status_code,
                elapsed = ?start.elapsed(),
                "route end"
            ),
            Err(error) => {
                if let Some(endpoint) = ctx.endpoint() {
                    self.metrics.record_error(&endpoint.service, error);
                }
                if error.is_canceled() {
                    info!(request_id = ctx.request_id(), "route canceled");
                } else if error.error_code != ErrorCode::RouteNotFound {
                    warn!(
                        request_id = ctx.request_id(),
                        %service,
                        status = error.status_code,
                        code = %error.error_code,
                        error = ?error.cause,
                        "route error: {}",
                        error.message
                    );
                }
            }
        }
        result
    }

    async fn select_and_dispatch(
        &self,
        ctx: &mut Context,
        listener_id: &str,
        multi: &MultiEndpoint,
        start: Instant,
    ) -> Result<ServeResponse, ServeError> {
        let endpoint = self.select_endpoint(ctx, listener_id, multi);
        ctx.add_metric(STAGE_SELECTOR, start.elapsed());
        self.metrics.record_stage(STAGE_SELECTOR, start.elapsed());
        let Some(endpoint) = endpoint else {
            info!(
                request_id = ctx.request_id(),
                method = %ctx.request().method,
                uri = %ctx.request().uri,
                "route not found"
            );
            return Err(ServeError::route_not_found(format!(
                "no endpoint version matched: {} {}",
                ctx.request().method,
                ctx.request().path()
            )));
        };
        self.metrics.record_access(&endpoint.service);
        ctx.set_endpoint(endpoint);
        self.dispatch(ctx).await
    }

    async fn dispatch(&self, ctx: &mut Context) -> Result<ServeResponse, ServeError> {
        if ctx.is_canceled() {
            return Err(ServeError::canceled("request canceled before filters"));
        }
        let start = Instant::now();
        let result = self.chain.execute(ctx, &self.invoker).await;
        ctx.add_metric(STAGE_FILTERS, start.elapsed());
        self.metrics.record_stage(STAGE_FILTERS, start.elapsed());
        result
    }
}

fn critical_panic(request_id: &str, panic: Box<dyn Any + Send>) -> ServeError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|e| e.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned());
    error!(
        request_id,
        panic = %message,
        backtrace = %Backtrace::force_capture(),
        "route critical panic"
    );
    ServeError::new(ErrorCode::CriticalPanic, "internal server error")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use fusen_gateway_common::{
        context::{cancel_pair, CancelSignal, WebRequest},
        model::Service,
    };
    use serde_json::{json, Value};

    use super::*;
    use crate::{
        filter::tests::{RecordFilter, Trace},
        transporter::Transporter,
    };

    #[derive(Default)]
    struct CountingTransporter {
        calls: AtomicUsize,
    }

    impl Transporter for CountingTransporter {
        fn do_invoke<'a>(
            &'a self,
            ctx: &'a Context,
            service: &'a Service,
        ) -> BoxFutureV2<'a, Result<ServeResponse, ServeError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if service.method == "panic" {
                    panic!("backend exploded");
                }
                let version = ctx.endpoint().map(|e| e.version.clone());
                let mut response = ServeResponse::ok(json!({ "version": version }));
                response
                    .attachments
                    .insert("X-Backend".to_owned(), json!("mock"));
                Ok(response)
            })
        }
    }

    fn endpoint(version: &str, method: &str) -> Arc<Endpoint> {
        Arc::new(Endpoint {
            version: version.to_owned(),
            http_method: "GET".to_owned(),
            http_pattern: "/users".to_owned(),
            service: Service {
                protocol: "mock".to_owned(),
                interface: "users".to_owned(),
                method: method.to_owned(),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn multi(versions: &[&str]) -> MultiEndpoint {
        let multi = MultiEndpoint::default();
        for version in versions {
            multi.update(version, endpoint(version, "query"));
        }
        multi
    }

    fn router(chain: FilterChain) -> (Router, Arc<CountingTransporter>) {
        let transporter = Arc::new(CountingTransporter::default());
        let mut transporters = TransporterRegistry::new();
        transporters.register_transporter("MOCK", transporter.clone());
        (Router::new(Arc::new(transporters), chain), transporter)
    }

    fn context(request: WebRequest) -> Context {
        Context::new(request, CancelSignal::never())
    }

    fn body_version(response: &ServeResponse) -> Value {
        response.body.as_value().unwrap()["version"].clone()
    }

    #[tokio::test]
    async fn test_version_selection() {
        let (router, _) = router(FilterChain::default());
        let multi = multi(&["v1", "v2"]);

        let mut ctx = context(WebRequest::new("GET", "/users").with_header("X-Version", "v2"));
        let response = router.route(&mut ctx, "default", &multi).await.unwrap();
        assert_eq!(body_version(&response), json!("v2"));
        assert_eq!(ctx.attribute("X-Backend"), Some(&json!("mock")));
        let stages: Vec<&str> = ctx.metrics().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(stages, vec!["selector", "transporter", "filters", "route"]);

        let mut ctx = context(WebRequest::new("GET", "/users").with_header("X-Version", "v9"));
        let error = router.route(&mut ctx, "default", &multi).await.unwrap_err();
        assert_eq!(error.error_code, ErrorCode::RouteNotFound);
        assert_eq!(error.status_code, 404);

        let mut ctx = context(WebRequest::new("GET", "/users"));
        assert!(router.route(&mut ctx, "default", &multi).await.is_ok());
    }

    #[tokio::test]
    async fn test_single_version_fallback() {
        let (router, _) = router(FilterChain::default());
        let multi = multi(&["v1"]);
        let mut ctx = context(WebRequest::new("GET", "/users").with_header("X-Version", "v3"));
        let response = router.route(&mut ctx, "default", &multi).await.unwrap();
        assert_eq!(body_version(&response), json!("v1"));
    }

    struct CanarySelector;

    impl EndpointSelector for CanarySelector {
        fn active(&self, ctx: &Context, listener_id: &str) -> bool {
            listener_id == "web" && ctx.request().header_value("X-Canary").is_some()
        }

        fn do_select(&self, _ctx: &Context, multi: &MultiEndpoint) -> Option<Arc<Endpoint>> {
            multi.lookup_by_version("canary")
        }
    }

    #[tokio::test]
    async fn test_endpoint_selector() {
        let (mut router, _) = router(FilterChain::default());
        router.add_selector(Arc::new(CanarySelector));
        let multi = multi(&["v1", "canary"]);
        let request = || {
            WebRequest::new("GET", "/users")
                .with_header("X-Version", "v5")
                .with_header("X-Canary", "1")
        };

        let mut ctx = context(request());
        let response = router.route(&mut ctx, "web", &multi).await.unwrap();
        assert_eq!(body_version(&response), json!("canary"));

        let mut ctx = context(request());
        let error = router.route(&mut ctx, "admin", &multi).await.unwrap_err();
        assert_eq!(error.error_code, ErrorCode::RouteNotFound);
    }

    #[tokio::test]
    async fn test_filter_short_circuit_skips_transporter() {
        let trace = Trace::default();
        let chain = FilterChain::new(
            vec![
                Arc::new(RecordFilter {
                    id: "a",
                    order: 1,
                    trace: trace.clone(),
                    fail: false,
                }),
                Arc::new(RecordFilter {
                    id: "b",
                    order: 2,
                    trace: trace.clone(),
                    fail: true,
                }),
            ],
            vec![],
        );
        let (router, transporter) = router(chain);
        let mut ctx = context(WebRequest::new("GET", "/users"));
        let error = router
            .route(&mut ctx, "default", &multi(&["v1"]))
            .await
            .unwrap_err();
        assert_eq!(error.error_code, ErrorCode::PermissionDenied);
        assert_eq!(error.message, "b rejected");
        assert_eq!(transporter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_canceled_before_dispatch() {
        let (router, transporter) = router(FilterChain::default());
        let (handle, signal) = cancel_pair();
        handle.cancel();
        let mut ctx = Context::new(WebRequest::new("GET", "/users"), signal);
        let error = router
            .route(&mut ctx, "default", &multi(&["v1"]))
            .await
            .unwrap_err();
        assert!(error.is_canceled());
        assert_eq!(error.status_code, 499);
        assert_eq!(transporter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_deadline_counts_as_canceled() {
        let (router, transporter) = router(FilterChain::default());
        let mut ctx = context(WebRequest::new("GET", "/users"));
        ctx.set_deadline(Instant::now());
        let error = router
            .route(&mut ctx, "default", &multi(&["v1"]))
            .await
            .unwrap_err();
        assert_eq!(error.error_code, ErrorCode::Canceled);
        assert_eq!(transporter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panic_is_recovered() {
        let (router, _) = router(FilterChain::default());
        let multi = MultiEndpoint::default();
        multi.update("v1", endpoint("v1", "panic"));
        let mut ctx = context(WebRequest::new("GET", "/users"));
        let error = router.route(&mut ctx, "default", &multi).await.unwrap_err();
        assert_eq!(error.error_code, ErrorCode::CriticalPanic);
        assert_eq!(error.status_code, 500);
        assert_eq!(error.message, "internal server error");
    }

    struct FaultySelector;

    impl EndpointSelector for FaultySelector {
        fn active(&self, _ctx: &Context, _listener_id: &str) -> bool {
            true
        }

        fn do_select(&self, _ctx: &Context, _multi: &MultiEndpoint) -> Option<Arc<Endpoint>> {
            panic!("selector exploded");
        }
    }

    #[tokio::test]
    async fn test_selector_panic_is_recovered() {
        let (mut router, transporter) = router(FilterChain::default());
        router.add_selector(Arc::new(FaultySelector));
        let multi = multi(&["v1", "v2"]);
        let mut ctx = context(WebRequest::new("GET", "/users").with_header("X-Version", "v9"));
        let routed = AssertUnwindSafe(router.route(&mut ctx, "default", &multi))
            .catch_unwind()
            .await;
        let error = routed.expect("panic escaped the router").unwrap_err();
        assert_eq!(error.error_code, ErrorCode::CriticalPanic);
        assert_eq!(error.status_code, 500);
        assert_eq!(transporter.calls.load(Ordering::SeqCst), 0);
        assert!(ctx.endpoint().is_none());
        assert_eq!(ctx.metrics().last().map(|e| e.name.as_str()), Some("route"));
    }
}
