use std::sync::Arc;

use fusen_gateway_common::{
    context::Context, error::ServeError, response::ServeResponse, BoxFutureV2,
};

pub mod hystrix;
pub mod jwt;
pub mod permission;
pub mod ratelimit;
pub mod trace;

pub type FilterResult = Result<ServeResponse, ServeError>;

/// The end of a filter chain.
pub trait Invoker: Send + Sync {
    fn invoke<'a>(&'a self, ctx: &'a mut Context) -> BoxFutureV2<'a, FilterResult>;
}

/// A chainable request-processing unit.
///
/// A filter either calls [`ProceedingJoinPoint::proceed`] exactly once or
/// returns its own result, which short-circuits everything after it.
pub trait Filter: Send + Sync {
    fn filter_id(&self) -> &str;

    /// Lower runs first.
    fn order(&self) -> i32 {
        0
    }

    fn call<'a>(&'a self, join_point: ProceedingJoinPoint<'a>) -> BoxFutureV2<'a, FilterResult>;
}

/// Contributes filters for the requests it activates on.
pub trait FilterSelector: Send + Sync {
    fn activate(&self, ctx: &Context) -> bool;

    fn do_select(&self, ctx: &Context) -> Vec<Arc<dyn Filter>>;
}

/// The remaining chain as seen by one filter.
pub struct ProceedingJoinPoint<'a> {
    filters: &'a [Arc<dyn Filter>],
    terminal: &'a dyn Invoker,
    pub context: &'a mut Context,
}

impl<'a> ProceedingJoinPoint<'a> {
    pub fn new(
        filters: &'a [Arc<dyn Filter>],
        terminal: &'a dyn Invoker,
        context: &'a mut Context,
    ) -> Self {
        Self {
            filters,
            terminal,
            context,
        }
    }

    pub fn get_context(&self) -> &Context {
        self.context
    }

    /// Runs the next filter, or the terminal invoker once the filters are exhausted.
    pub fn proceed(self) -> BoxFutureV2<'a, FilterResult> {
        let filters = self.filters;
        match filters.split_first() {
            Some((filter, rest)) => filter.call(ProceedingJoinPoint {
                filters: rest,
                terminal: self.terminal,
                context: self.context,
            }),
            None => self.terminal.invoke(self.context),
        }
    }
}

/// Global filters sorted by order, kept stable for equal orders.
#[derive(Default, Clone)]
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
    selectors: Vec<Arc<dyn FilterSelector>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Arc<dyn Filter>>, selectors: Vec<Arc<dyn FilterSelector>>) -> Self {
        let mut chain = Self {
            filters,
            selectors,
        };
        chain.filters.sort_by_key(|e| e.order());
        chain
    }

    pub fn add_filter(&mut self, filter: Arc<dyn Filter>) {
        self.filters.push(filter);
        self.filters.sort_by_key(|e| e.order());
    }

    pub fn add_selector(&mut self, selector: Arc<dyn FilterSelector>) {
        self.selectors.push(selector);
    }

    /// Global filters plus those of every activated selector, ordered.
    pub fn filters_for(&self, ctx: &Context) -> Vec<Arc<dyn Filter>> {
        let mut filters = self.filters.clone();
        let mut selected = false;
        for selector in &self.selectors {
            if selector.activate(ctx) {
                filters.extend(selector.do_select(ctx));
                selected = true;
            }
        }
        if selected {
            filters.sort_by_key(|e| e.order());
        }
        filters
    }

    pub async fn execute(&self, ctx: &mut Context, terminal: &dyn Invoker) -> FilterResult {
        let filters = self.filters_for(ctx);
        ProceedingJoinPoint::new(&filters, terminal, ctx).proceed().await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use fusen_gateway_common::{
        context::{CancelSignal, WebRequest},
        error::ErrorCode,
    };
    use serde_json::{json, Value};

    use super::*;

    pub(crate) type Trace = Arc<Mutex<Vec<String>>>;

    pub(crate) struct RecordFilter {
        pub id: &'static str,
        pub order: i32,
        pub trace: Trace,
        pub fail: bool,
    }

    impl Filter for RecordFilter {
        fn filter_id(&self) -> &str {
            self.id
        }

        fn order(&self) -> i32 {
            self.order
        }

        fn call<'a>(
            &'a self,
            join_point: ProceedingJoinPoint<'a>,
        ) -> BoxFutureV2<'a, FilterResult> {
            Box::pin(async move {
                self.trace.lock().unwrap().push(format!("{}:in", self.id));
                if self.fail {
                    return Err(ServeError::permission_denied(format!("{} rejected", self.id)));
                }
                join_point
                    .context
                    .set_attribute(self.id, Value::Bool(true));
                let result = join_point.proceed().await;
                self.trace.lock().unwrap().push(format!("{}:out", self.id));
                result
            })
        }
    }

    pub(crate) struct RecordInvoker {
        pub trace: Trace,
    }

    impl Invoker for RecordInvoker {
        fn invoke<'a>(&'a self, ctx: &'a mut Context) -> BoxFutureV2<'a, FilterResult> {
            Box::pin(async move {
                self.trace.lock().unwrap().push("terminal".to_owned());
                let mut seen: Vec<&String> = ctx.attributes().keys().collect();
                seen.sort();
                Ok(ServeResponse::ok(json!(seen)))
            })
        }
    }

    pub(crate) fn record(id: &'static str, order: i32, trace: &Trace, fail: bool) -> Arc<dyn Filter> {
        Arc::new(RecordFilter {
            id,
            order,
            trace: trace.clone(),
            fail,
        })
    }

    struct HeaderSelector {
        filter: Arc<dyn Filter>,
    }

    impl FilterSelector for HeaderSelector {
        fn activate(&self, ctx: &Context) -> bool {
            ctx.request().header_value("X-Audit").is_some()
        }

        fn do_select(&self, _ctx: &Context) -> Vec<Arc<dyn Filter>> {
            vec![self.filter.clone()]
        }
    }

    fn context(request: WebRequest) -> Context {
        Context::new(request, CancelSignal::never())
    }

    #[tokio::test]
    async fn test_onion_order() {
        let trace = Trace::default();
        let chain = FilterChain::new(
            vec![record("b", 2, &trace, false), record("a", 1, &trace, false)],
            vec![],
        );
        let invoker = RecordInvoker {
            trace: trace.clone(),
        };
        let mut ctx = context(WebRequest::new("GET", "/"));
        let response = chain.execute(&mut ctx, &invoker).await.unwrap();
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["a:in", "b:in", "terminal", "b:out", "a:out"]
        );
        let seen = response.body.as_value().unwrap().as_array().unwrap().clone();
        assert!(seen.contains(&json!("a")) && seen.contains(&json!("b")));
    }

    #[tokio::test]
    async fn test_short_circuit() {
        let trace = Trace::default();
        let chain = FilterChain::new(
            vec![record("a", 1, &trace, false), record("b", 2, &trace, true)],
            vec![],
        );
        let invoker = RecordInvoker {
            trace: trace.clone(),
        };
        let mut ctx = context(WebRequest::new("GET", "/"));
        let error = chain.execute(&mut ctx, &invoker).await.unwrap_err();
        assert_eq!(error.error_code, ErrorCode::PermissionDenied);
        assert_eq!(error.message, "b rejected");
        assert_eq!(*trace.lock().unwrap(), vec!["a:in", "b:in", "a:out"]);
    }

    #[tokio::test]
    async fn test_selector_activation() {
        let trace = Trace::default();
        let chain = FilterChain::new(
            vec![record("global", 10, &trace, false)],
            vec![Arc::new(HeaderSelector {
                filter: record("audit", 0, &trace, false),
            })],
        );
        let invoker = RecordInvoker {
            trace: trace.clone(),
        };

        let mut ctx = context(WebRequest::new("GET", "/"));
        chain.execute(&mut ctx, &invoker).await.unwrap();
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["global:in", "terminal", "global:out"]
        );

        trace.lock().unwrap().clear();
        let mut ctx = context(WebRequest::new("GET", "/").with_header("X-Audit", "1"));
        chain.execute(&mut ctx, &invoker).await.unwrap();
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["audit:in", "global:in", "terminal", "global:out", "audit:out"]
        );
    }
}
