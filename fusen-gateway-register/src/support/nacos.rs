use std::sync::{Arc, Mutex};

use fusen_gateway_common::{config::get_config_by_context, BoxFuture};
use nacos_sdk::api::{
    config::{ConfigChangeListener, ConfigResponse, ConfigService, ConfigServiceBuilder},
    props::ClientProps,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info};

use super::resource::{diff_resources, send_events, DiscoveryResource};
use crate::{error::RegisterError, Discovery, EndpointEvent, ServiceEvent};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NacosConfig {
    pub application_name: String,
    pub server_addr: String,
    pub namespace: Option<String>,
    pub group: String,
    pub data_id: String,
    /// `json`, `yaml` or `toml`.
    pub format: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for NacosConfig {
    fn default() -> Self {
        Self {
            application_name: "fusen-gateway".to_owned(),
            server_addr: "127.0.0.1:8848".to_owned(),
            namespace: None,
            group: "DEFAULT_GROUP".to_owned(),
            data_id: "fusen-gateway-endpoints".to_owned(),
            format: "json".to_owned(),
            username: None,
            password: None,
        }
    }
}

/// Reads the definitions document from a Nacos config entry and follows its changes.
#[derive(Clone)]
pub struct NacosDiscovery {
    config_service: Arc<ConfigService>,
    config: Arc<NacosConfig>,
}

impl NacosDiscovery {
    pub fn init(config: NacosConfig) -> Result<Self, RegisterError> {
        let mut client_props = ClientProps::new();
        client_props = client_props
            .server_addr(config.server_addr.clone())
            .namespace(config.namespace.clone().unwrap_or_default())
            .app_name(config.application_name.clone())
            .auth_username(config.username.clone().unwrap_or_default())
            .auth_password(config.password.clone().unwrap_or_default());
        let builder = ConfigServiceBuilder::new(client_props);
        let builder = if config.username.is_some() {
            builder.enable_auth_plugin_http()
        } else {
            builder
        };
        let config_service = Arc::new(
            builder
                .build()
                .map_err(|e| RegisterError::Error(Box::new(e)))?,
        );
        Ok(Self {
            config_service,
            config: Arc::new(config),
        })
    }
}

impl Discovery for NacosDiscovery {
    fn id(&self) -> &str {
        "nacos"
    }

    fn watch(
        &self,
        endpoints: UnboundedSender<EndpointEvent>,
        services: UnboundedSender<ServiceEvent>,
    ) -> BoxFuture<Result<(), RegisterError>> {
        let nacos = self.clone();
        Box::pin(async move {
            let data_id = nacos.config.data_id.clone();
            let group = nacos.config.group.clone();
            info!("nacos watch config: {data_id} - group: {group}");
            let response = nacos
                .config_service
                .get_config(data_id.clone(), group.clone())
                .await
                .map_err(|e| RegisterError::Error(Box::new(e)))?;
            let listener = ConfigResourceListener {
                format: nacos.config.format.clone(),
                current: Mutex::new(DiscoveryResource::default()),
                endpoints,
                services,
            };
            listener.apply(response.content())?;
            nacos
                .config_service
                .add_listener(data_id, group, Arc::new(listener))
                .await
                .map_err(|e| RegisterError::Error(Box::new(e)))?;
            Ok(())
        })
    }
}

struct ConfigResourceListener {
    format: String,
    current: Mutex<DiscoveryResource>,
    endpoints: UnboundedSender<EndpointEvent>,
    services: UnboundedSender<ServiceEvent>,
}

impl ConfigResourceListener {
    fn apply(&self, content: &str) -> Result<(), RegisterError> {
        let resource: DiscoveryResource = if self.format == "json" {
            serde_json::from_str(content).map_err(|e| RegisterError::Error(Box::new(e)))?
        } else {
            get_config_by_context(content, &self.format).map_err(RegisterError::Error)?
        };
        let mut current = self
            .current
            .lock()
            .map_err(|e| RegisterError::Resource(e.to_string()))?;
        let (endpoint_events, service_events) = diff_resources(&current, &resource);
        *current = resource;
        send_events(&self.endpoints, &self.services, endpoint_events, service_events)
    }
}

impl ConfigChangeListener for ConfigResourceListener {
    fn notify(&self, config_resp: ConfigResponse) {
        info!("nacos config change: {}", config_resp.data_id());
        if let Err(error) = self.apply(config_resp.content()) {
            error!("nacos config apply occur an error: {error:?}");
        }
    }
}
