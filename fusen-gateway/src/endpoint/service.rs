use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, PoisonError, RwLock},
};

use fusen_gateway_common::model::Service;

/// Backend services by service id and alias id.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl ServiceRegistry {
    pub fn register_service(&self, service: Arc<Service>) {
        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        if !service.alias_id.is_empty() {
            services.insert(service.alias_id.clone(), service.clone());
        }
        services.insert(service.id(), service);
    }

    pub fn remove_service(&self, service: &Service) {
        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        services.remove(&service.id());
        if !service.alias_id.is_empty() {
            services.remove(&service.alias_id);
        }
    }

    pub fn lookup_service_by_id(&self, id: &str) -> Option<Arc<Service>> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Service> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, service)| (id.clone(), service.as_ref().clone()))
            .collect()
    }
}
