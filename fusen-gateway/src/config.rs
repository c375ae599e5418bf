use std::time::Duration;

use fusen_gateway_common::{
    config::get_config_by_file, error::BoxError, logs::LogConfig, model::service::parse_duration,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_VERSION_HEADER: &str = "X-Version";
pub const DEFAULT_CONFIG_PATH: &str = "./conf.d/application.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub application_name: String,
    pub listeners: Vec<ListenerConfig>,
    pub log: LogConfig,
    pub discovery: DiscoveryConfig,
    pub transporter: TransporterConfig,
    pub filter: FilterConfig,
    /// Inbound header carrying the requested endpoint version.
    pub version_header: String,
    pub context_pool_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            application_name: "fusen-gateway".to_owned(),
            listeners: vec![ListenerConfig::default()],
            log: LogConfig::default(),
            discovery: DiscoveryConfig::default(),
            transporter: TransporterConfig::default(),
            filter: FilterConfig::default(),
            version_header: DEFAULT_VERSION_HEADER.to_owned(),
            context_pool_size: 1024,
        }
    }
}

impl GatewayConfig {
    pub fn load(path: &str) -> Result<Self, BoxError> {
        get_config_by_file(path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListenerConfig {
    pub id: String,
    pub address: String,
    pub port: u16,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            id: "default".to_owned(),
            address: "0.0.0.0".to_owned(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryConfig {
    pub resource: Option<ResourceDiscoveryConfig>,
    #[cfg(feature = "nacos")]
    pub nacos: Option<fusen_gateway_register::support::nacos::NacosConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceDiscoveryConfig {
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransporterConfig {
    pub client: UpstreamClientConfig,
    pub http: HttpTransporterConfig,
    pub dubbo: DubboTransporterConfig,
}

/// Connection pool settings shared by every outbound transporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamClientConfig {
    pub keepalive: String,
    pub connect_timeout: String,
    pub idle_timeout: String,
    pub max_idle_per_host: usize,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            keepalive: "1800s".to_owned(),
            connect_timeout: "3s".to_owned(),
            idle_timeout: "90s".to_owned(),
            max_idle_per_host: 32,
        }
    }
}

impl UpstreamClientConfig {
    pub fn keepalive(&self) -> Duration {
        parse_duration(&self.keepalive).unwrap_or(Duration::from_secs(1800))
    }

    pub fn connect_timeout(&self) -> Duration {
        parse_duration(&self.connect_timeout).unwrap_or(Duration::from_secs(3))
    }

    pub fn idle_timeout(&self) -> Duration {
        parse_duration(&self.idle_timeout).unwrap_or(Duration::from_secs(90))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpTransporterConfig {
    pub timeout: String,
    pub user_agent: String,
}

impl Default for HttpTransporterConfig {
    fn default() -> Self {
        Self {
            timeout: "10s".to_owned(),
            user_agent: "fusen-gateway/transporter".to_owned(),
        }
    }
}

impl HttpTransporterConfig {
    pub fn timeout(&self) -> Duration {
        parse_duration(&self.timeout).unwrap_or(Duration::from_secs(10))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DubboTransporterConfig {
    pub timeout: String,
    pub retries: u32,
    pub cluster: String,
    pub load_balance: String,
    /// Wait applied after creating a generic reference, before it is used.
    pub reference_delay: String,
}

impl Default for DubboTransporterConfig {
    fn default() -> Self {
        Self {
            timeout: "5000".to_owned(),
            retries: 0,
            cluster: "failover".to_owned(),
            load_balance: "random".to_owned(),
            reference_delay: "10ms".to_owned(),
        }
    }
}

impl DubboTransporterConfig {
    pub fn timeout(&self) -> Duration {
        parse_duration(&self.timeout).unwrap_or(Duration::from_millis(5000))
    }

    pub fn reference_delay(&self) -> Duration {
        parse_duration(&self.reference_delay).unwrap_or(Duration::from_millis(10))
    }
}

/// Optional filters; each one is installed only when its section is present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterConfig {
    pub jwt: Option<JwtFilterConfig>,
    pub rate_limit: Option<RateLimitFilterConfig>,
    pub hystrix: Option<HystrixFilterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JwtFilterConfig {
    /// `scope:key` the token is looked up from.
    pub lookup_token: String,
    pub algorithm: String,
    /// HMAC secret for the `HS*` algorithms.
    pub secret: String,
    /// PEM encoded public key for the `RS*`, `PS*`, `ES*` and `EdDSA` algorithms.
    pub public_key: String,
    pub issuer_key: String,
    pub subject_key: String,
    /// Accepted issuers, any when empty.
    pub issuers: Vec<String>,
    pub leeway: u64,
}

impl Default for JwtFilterConfig {
    fn default() -> Self {
        Self {
            lookup_token: "header:Authorization".to_owned(),
            algorithm: "HS256".to_owned(),
            secret: String::new(),
            public_key: String::new(),
            issuer_key: "iss".to_owned(),
            subject_key: "sub".to_owned(),
            issuers: vec![],
            leeway: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitFilterConfig {
    /// `scope:key` naming the bucket of a request.
    pub lookup_id: String,
    /// Time to refill one token.
    pub refill: String,
    pub burst: u32,
    /// Full buckets are evicted once more than this many keys are tracked.
    pub max_keys: usize,
}

impl Default for RateLimitFilterConfig {
    fn default() -> Self {
        Self {
            lookup_id: "attr:X-Jwt-Subject".to_owned(),
            refill: "1m".to_owned(),
            burst: 1000,
            max_keys: 65536,
        }
    }
}

impl RateLimitFilterConfig {
    pub fn refill(&self) -> Duration {
        parse_duration(&self.refill)
            .filter(|e| !e.is_zero())
            .unwrap_or(Duration::from_secs(60))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HystrixFilterConfig {
    pub timeout: String,
    pub max_concurrent_requests: usize,
    /// Requests a window needs before its error rate can open the circuit.
    pub request_volume_threshold: u32,
    pub error_percent_threshold: u32,
    pub sleep_window: String,
    pub metrics_window: String,
}

impl Default for HystrixFilterConfig {
    fn default() -> Self {
        Self {
            timeout: "1000ms".to_owned(),
            max_concurrent_requests: 10,
            request_volume_threshold: 20,
            error_percent_threshold: 50,
            sleep_window: "500ms".to_owned(),
            metrics_window: "10s".to_owned(),
        }
    }
}

impl HystrixFilterConfig {
    pub fn timeout(&self) -> Duration {
        parse_duration(&self.timeout).unwrap_or(Duration::from_millis(1000))
    }

    pub fn sleep_window(&self) -> Duration {
        parse_duration(&self.sleep_window).unwrap_or(Duration::from_millis(500))
    }

    pub fn metrics_window(&self) -> Duration {
        parse_duration(&self.metrics_window).unwrap_or(Duration::from_secs(10))
    }
}
