use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, PoisonError, RwLock},
};

use fusen_gateway_common::model::Endpoint;
use rand::seq::IteratorRandom;

pub mod service;

/// All versions of one route key.
#[derive(Debug, Default)]
pub struct MultiEndpoint {
    versions: RwLock<HashMap<String, Arc<Endpoint>>>,
}

impl MultiEndpoint {
    pub fn update(&self, version: &str, endpoint: Arc<Endpoint>) {
        self.versions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(version.to_owned(), endpoint);
    }

    pub fn delete(&self, version: &str) -> Option<Arc<Endpoint>> {
        self.versions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(version)
    }

    pub fn lookup_by_version(&self, version: &str) -> Option<Arc<Endpoint>> {
        self.versions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(version)
            .cloned()
    }

    /// Any registered version, for reading version invariant metadata.
    pub fn random_version(&self) -> Option<Arc<Endpoint>> {
        self.versions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    /// The only registered version, if there is exactly one.
    pub fn single_version(&self) -> Option<Arc<Endpoint>> {
        let versions = self.versions.read().unwrap_or_else(PoisonError::into_inner);
        if versions.len() == 1 {
            versions.values().next().cloned()
        } else {
            None
        }
    }

    pub fn endpoints(&self) -> BTreeMap<String, Arc<Endpoint>> {
        self.versions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(version, endpoint)| (version.clone(), endpoint.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.versions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Route key to [`MultiEndpoint`] table.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: RwLock<HashMap<String, Arc<MultiEndpoint>>>,
}

impl EndpointRegistry {
    /// Returns the [`MultiEndpoint`] of `route_key` with `endpoint` stored under its
    /// version. The flag is true when the route key was seen for the first time,
    /// in which case the caller binds the route.
    pub fn register_endpoint(
        &self,
        route_key: &str,
        endpoint: Arc<Endpoint>,
    ) -> (Arc<MultiEndpoint>, bool) {
        let mut endpoints = self
            .endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let (multi, created) = match endpoints.get(route_key) {
            Some(multi) => (multi.clone(), false),
            None => {
                let multi = Arc::new(MultiEndpoint::default());
                endpoints.insert(route_key.to_owned(), multi.clone());
                (multi, true)
            }
        };
        let version = endpoint.version.clone();
        multi.update(&version, endpoint);
        (multi, created)
    }

    pub fn endpoint_by_key(&self, route_key: &str) -> Option<Arc<MultiEndpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(route_key)
            .cloned()
    }

    pub fn multi_endpoints(&self) -> Vec<(String, Arc<MultiEndpoint>)> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, multi)| (key.clone(), multi.clone()))
            .collect()
    }

    /// Serializable view of every route key and its versions.
    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, Endpoint>> {
        self.multi_endpoints()
            .into_iter()
            .map(|(key, multi)| {
                let versions = multi
                    .endpoints()
                    .into_iter()
                    .map(|(version, endpoint)| (version, endpoint.as_ref().clone()))
                    .collect();
                (key, versions)
            })
            .collect()
    }
}
