use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use fusen_gateway_common::{
    context::Context,
    error::{ErrorCode, ServeError},
    BoxFutureV2,
};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::{Filter, FilterResult, FilterSelector, ProceedingJoinPoint};
use crate::config::HystrixFilterConfig;

pub const HYSTRIX_FILTER_ID: &str = "hystrix_filter";
pub const CIRCUIT_SERVER_BUSY: &str = "Server busy";

/// Builds the error returned while a service is circuited.
pub type DowngradeFunc = Arc<dyn Fn(&Context, &str) -> ServeError + Send + Sync>;

pub fn default_downgrade() -> DowngradeFunc {
    Arc::new(|_ctx: &Context, _service: &str| {
        ServeError::new(ErrorCode::BackendCircuited, CIRCUIT_SERVER_BUSY)
    })
}

#[derive(Debug, Clone, Copy)]
struct CircuitSettings {
    timeout: Duration,
    max_concurrent_requests: usize,
    request_volume_threshold: u32,
    error_percent_threshold: u32,
    sleep_window: Duration,
    metrics_window: Duration,
}

impl From<&HystrixFilterConfig> for CircuitSettings {
    fn from(config: &HystrixFilterConfig) -> Self {
        Self {
            timeout: config.timeout(),
            max_concurrent_requests: config.max_concurrent_requests.max(1),
            request_volume_threshold: config.request_volume_threshold.max(1),
            error_percent_threshold: config.error_percent_threshold.clamp(1, 100),
            sleep_window: config.sleep_window(),
            metrics_window: config.metrics_window(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { until: Instant },
    /// One trial request is in flight.
    HalfOpen { since: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Allowed,
    Trial,
    Rejected,
}

#[derive(Debug)]
struct CircuitStats {
    state: CircuitState,
    window_start: Instant,
    total: u32,
    errors: u32,
}

impl CircuitStats {
    fn reset(&mut self, now: Instant) {
        self.window_start = now;
        self.total = 0;
        self.errors = 0;
    }
}

struct Circuit {
    service: String,
    settings: CircuitSettings,
    permits: Arc<Semaphore>,
    stats: Mutex<CircuitStats>,
}

impl Circuit {
    fn new(service: &str, settings: CircuitSettings, now: Instant) -> Self {
        Self {
            service: service.to_owned(),
            settings,
            permits: Arc::new(Semaphore::new(settings.max_concurrent_requests)),
            stats: Mutex::new(CircuitStats {
                state: CircuitState::Closed,
                window_start: now,
                total: 0,
                errors: 0,
            }),
        }
    }

    fn state(&self) -> CircuitState {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).state
    }

    fn admit(&self, now: Instant) -> Admission {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        match stats.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open { until } if now >= until => {
                stats.state = CircuitState::HalfOpen { since: now };
                Admission::Trial
            }
            // a trial that never reported back, e.g. dropped with its request
            CircuitState::HalfOpen { since }
                if now >= since + self.settings.timeout + self.settings.sleep_window =>
            {
                stats.state = CircuitState::HalfOpen { since: now };
                Admission::Trial
            }
            CircuitState::Open { .. } | CircuitState::HalfOpen { .. } => Admission::Rejected,
        }
    }

    fn record(&self, admission: Admission, failed: bool, now: Instant) {
        let settings = &self.settings;
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        if admission == Admission::Trial {
            if failed {
                stats.state = CircuitState::Open {
                    until: now + settings.sleep_window,
                };
                warn!(service = %self.service, "circuit trial failed, reopened");
            } else {
                stats.state = CircuitState::Closed;
                stats.reset(now);
                info!(service = %self.service, "circuit closed");
            }
            return;
        }
        if stats.state != CircuitState::Closed {
            return;
        }
        if now.saturating_duration_since(stats.window_start) >= settings.metrics_window {
            stats.reset(now);
        }
        stats.total += 1;
        if failed {
            stats.errors += 1;
        }
        let tripped = stats.total >= settings.request_volume_threshold
            && u64::from(stats.errors) * 100
                >= u64::from(settings.error_percent_threshold) * u64::from(stats.total);
        if tripped {
            warn!(
                service = %self.service,
                total = stats.total,
                errors = stats.errors,
                "circuit opened"
            );
            stats.state = CircuitState::Open {
                until: now + settings.sleep_window,
            };
            stats.reset(now);
        }
    }
}

/// Per-service circuit breaker around the backend call.
///
/// A service is circuited while its error rate is over the threshold, and
/// while it already runs `maxConcurrentRequests` requests.
pub struct HystrixFilter {
    settings: CircuitSettings,
    downgrade: DowngradeFunc,
    circuits: Mutex<HashMap<String, Arc<Circuit>>>,
}

impl HystrixFilter {
    pub fn new(config: &HystrixFilterConfig) -> Self {
        let settings = CircuitSettings::from(config);
        info!(?settings, "hystrix filter init");
        Self {
            settings,
            downgrade: default_downgrade(),
            circuits: Mutex::default(),
        }
    }

    pub fn with_downgrade(mut self, downgrade: DowngradeFunc) -> Self {
        self.downgrade = downgrade;
        self
    }

    fn circuit(&self, service: &str) -> Arc<Circuit> {
        let mut circuits = self.circuits.lock().unwrap_or_else(PoisonError::into_inner);
        circuits
            .entry(service.to_owned())
            .or_insert_with(|| {
                info!(service, "circuit init");
                Arc::new(Circuit::new(service, self.settings, Instant::now()))
            })
            .clone()
    }

    pub fn circuit_state(&self, service: &str) -> Option<CircuitState> {
        let circuits = self.circuits.lock().unwrap_or_else(PoisonError::into_inner);
        circuits.get(service).map(|e| e.state())
    }
}

fn is_failure(result: &FilterResult) -> bool {
    match result {
        Ok(response) => response.status_code >= 500,
        Err(error) => error.status_code >= 500 && !error.is_canceled(),
    }
}

impl Filter for HystrixFilter {
    fn filter_id(&self) -> &str {
        HYSTRIX_FILTER_ID
    }

    fn order(&self) -> i32 {
        100
    }

    fn call<'a>(&'a self, join_point: ProceedingJoinPoint<'a>) -> BoxFutureV2<'a, FilterResult> {
        Box::pin(async move {
            let Some(service) = join_point.context.endpoint().map(|e| e.service.id()) else {
                return join_point.proceed().await;
            };
            let start = Instant::now();
            let circuit = self.circuit(&service);
            let Ok(_permit) = circuit.permits.clone().try_acquire_owned() else {
                info!(service = %service, "circuit rejected, max concurrent requests");
                return Err((self.downgrade)(&*join_point.context, &service));
            };
            let admission = circuit.admit(start);
            if admission == Admission::Rejected {
                info!(service = %service, "circuit rejected, open");
                return Err((self.downgrade)(&*join_point.context, &service));
            }
            join_point
                .context
                .add_metric(HYSTRIX_FILTER_ID, start.elapsed());
            let timeout = self.settings.timeout;
            let result = match tokio::time::timeout(timeout, join_point.proceed()).await {
                Ok(result) => result,
                Err(_) => Err(ServeError::new(
                    ErrorCode::BackendTimeout,
                    format!("circuit command timeout after {timeout:?}, service: {service}"),
                )),
            };
            circuit.record(admission, is_failure(&result), Instant::now());
            result
        })
    }
}

/// Activates the [`HystrixFilter`] on every routed request.
pub struct HystrixFilterSelector {
    filter: Arc<dyn Filter>,
}

impl HystrixFilterSelector {
    pub fn new(filter: Arc<HystrixFilter>) -> Self {
        Self { filter }
    }
}

impl FilterSelector for HystrixFilterSelector {
    fn activate(&self, ctx: &Context) -> bool {
        ctx.endpoint().is_some()
    }

    fn do_select(&self, _ctx: &Context) -> Vec<Arc<dyn Filter>> {
        vec![self.filter.clone()]
    }
}
