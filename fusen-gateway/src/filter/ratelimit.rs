use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use fusen_gateway_common::{
    context::Context,
    error::{ErrorCode, ServeError},
    BoxFutureV2,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Filter, FilterResult, FilterSelector, ProceedingJoinPoint};
use crate::{config::RateLimitFilterConfig, lookup::lookup_text};

pub const RATE_LIMIT_FILTER_ID: &str = "rate_limit_filter";
pub const RATE_OVER_LIMIT: &str = "RATE:OVER_LIMIT";

/// Holds up to `burst` tokens and regains one every `refill`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    burst: f64,
    refill: Duration,
    updated_at: Instant,
}

impl TokenBucket {
    pub fn new(burst: u32, refill: Duration, now: Instant) -> Self {
        Self {
            tokens: f64::from(burst),
            burst: f64::from(burst),
            refill,
            updated_at: now,
        }
    }

    fn refresh(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.updated_at);
        let gained = elapsed.as_secs_f64() / self.refill.as_secs_f64();
        self.tokens = (self.tokens + gained).min(self.burst);
        self.updated_at = now;
    }

    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refresh(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn is_full(&mut self, now: Instant) -> bool {
        self.refresh(now);
        self.tokens >= self.burst
    }
}

/// Limits requests per lookup key, e.g. per jwt subject. Requests without a
/// key share one anonymous bucket.
pub struct RateLimitFilter {
    lookup_id: String,
    burst: u32,
    refill: Duration,
    max_keys: usize,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimitFilter {
    pub fn new(config: &RateLimitFilterConfig) -> Self {
        info!(
            lookup = %config.lookup_id,
            burst = config.burst,
            refill = ?config.refill(),
            "rate limit filter init"
        );
        Self {
            lookup_id: config.lookup_id.clone(),
            burst: config.burst,
            refill: config.refill(),
            max_keys: config.max_keys.max(1),
            buckets: Mutex::default(),
        }
    }

    fn limit_key(&self, ctx: &Context) -> Result<String, ServeError> {
        let key = lookup_text(ctx, &self.lookup_id).map_err(|error| {
            ServeError::new(ErrorCode::ArgumentLookupFailed, error.to_string())
        })?;
        Ok(key.unwrap_or_default())
    }

    pub async fn try_acquire(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        if !buckets.contains_key(key) && buckets.len() >= self.max_keys {
            buckets.retain(|_, bucket| !bucket.is_full(now));
        }
        buckets
            .entry(key.to_owned())
            .or_insert_with(|| TokenBucket::new(self.burst, self.refill, now))
            .try_acquire(now)
    }
}

impl Filter for RateLimitFilter {
    fn filter_id(&self) -> &str {
        RATE_LIMIT_FILTER_ID
    }

    fn order(&self) -> i32 {
        -150
    }

    fn call<'a>(&'a self, join_point: ProceedingJoinPoint<'a>) -> BoxFutureV2<'a, FilterResult> {
        Box::pin(async move {
            let key = self.limit_key(join_point.context)?;
            if !self.try_acquire(&key).await {
                debug!(key = %key, "request over limit");
                return Err(ServeError::new(ErrorCode::RateLimited, RATE_OVER_LIMIT));
            }
            join_point.proceed().await
        })
    }
}

/// Activates the [`RateLimitFilter`] on every routed request.
pub struct RateLimitFilterSelector {
    filter: Arc<dyn Filter>,
}

impl RateLimitFilterSelector {
    pub fn new(filter: Arc<RateLimitFilter>) -> Self {
        Self { filter }
    }
}

impl FilterSelector for RateLimitFilterSelector {
    fn activate(&self, ctx: &Context) -> bool {
        ctx.endpoint().is_some()
    }

    fn do_select(&self, _ctx: &Context) -> Vec<Arc<dyn Filter>> {
        vec![self.filter.clone()]
    }
}

#[cfg(test)]
mod tests {
    use fusen_gateway_common::{
        context::{CancelSignal, WebRequest},
        model::Endpoint,
    };

    use super::*;
    use crate::filter::{
        tests::{record, RecordInvoker, Trace},
        FilterChain,
    };

    fn config(burst: u32) -> RateLimitFilterConfig {
        RateLimitFilterConfig {
            lookup_id: "header:X-Client".to_owned(),
            refill: "1h".to_owned(),
            burst,
            max_keys: 2,
        }
    }

    fn context(client: Option<&str>) -> Context {
        let mut request = WebRequest::new("GET", "/orders");
        if let Some(client) = client {
            request = request.with_header("X-Client", client);
        }
        let mut ctx = Context::new(request, CancelSignal::never());
        ctx.set_endpoint(Arc::new(Endpoint::default()));
        ctx
    }

    #[test]
    fn test_token_bucket() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2, Duration::from_millis(100), start);
        assert!(bucket.try_acquire(start));
        assert!(bucket.try_acquire(start));
        assert!(!bucket.try_acquire(start));
        assert!(!bucket.try_acquire(start + Duration::from_millis(50)));
        assert!(bucket.try_acquire(start + Duration::from_millis(150)));
        assert!(!bucket.is_full(start + Duration::from_millis(150)));
        assert!(bucket.is_full(start + Duration::from_secs(10)));
        assert!(bucket.try_acquire(start + Duration::from_secs(10)));
        assert!(bucket.try_acquire(start + Duration::from_secs(10)));
        assert!(!bucket.try_acquire(start + Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_over_limit_in_onion_order() {
        let trace = Trace::default();
        let filter = Arc::new(RateLimitFilter::new(&config(1)));
        let chain = FilterChain::new(
            vec![record("outer", -500, &trace, false), record("inner", 0, &trace, false)],
            vec![Arc::new(RateLimitFilterSelector::new(filter))],
        );
        let invoker = RecordInvoker {
            trace: trace.clone(),
        };

        chain
            .execute(&mut context(Some("app-1")), &invoker)
            .await
            .unwrap();
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["outer:in", "inner:in", "terminal", "inner:out", "outer:out"]
        );

        trace.lock().unwrap().clear();
        let error = chain
            .execute(&mut context(Some("app-1")), &invoker)
            .await
            .unwrap_err();
        assert_eq!(error.error_code, ErrorCode::RateLimited);
        assert_eq!(error.status_code, 429);
        assert_eq!(error.message, RATE_OVER_LIMIT);
        assert_eq!(*trace.lock().unwrap(), vec!["outer:in", "outer:out"]);

        chain
            .execute(&mut context(Some("app-2")), &invoker)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_anonymous_bucket() {
        let filter = RateLimitFilter::new(&config(1));
        let anonymous = filter.limit_key(&context(None)).unwrap();
        assert_eq!(anonymous, "");
        assert!(filter.try_acquire(&anonymous).await);
        assert!(!filter.try_acquire(&anonymous).await);
        assert!(filter.try_acquire("app-1").await);
    }

    #[tokio::test]
    async fn test_full_buckets_evicted() {
        let filter = RateLimitFilter::new(&RateLimitFilterConfig {
            refill: "10ms".to_owned(),
            ..config(1)
        });
        assert!(filter.try_acquire("a").await);
        assert!(filter.try_acquire("b").await);
        assert_eq!(filter.buckets.lock().await.len(), 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(filter.try_acquire("c").await);
        let buckets = filter.buckets.lock().await;
        assert_eq!(buckets.len(), 1);
        assert!(buckets.contains_key("c"));
    }
}
