use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_recursion::async_recursion;
use fusen_gateway_common::model::endpoint::route_key;
use tokio::sync::RwLock;

/// Route templates of one listener: exact paths first, then the `{var}` trie.
#[derive(Debug, Default)]
pub struct PathCache {
    path_cache: RwLock<HashMap<String, String>>,
    rest_trie: Trie,
}

impl PathCache {
    pub async fn insert(&self, route_key: &str) {
        if !route_key.contains('{') {
            self.path_cache
                .write()
                .await
                .insert(route_key.to_owned(), route_key.to_owned());
        }
        self.rest_trie.insert(route_key).await;
    }

    pub async fn search(&self, method: &str, path: &str) -> Option<QueryResult> {
        let key = route_key(method, path);
        if let Some(route_key) = self.path_cache.read().await.get(&key) {
            return Some(QueryResult {
                route_key: route_key.clone(),
                path_values: Vec::new(),
            });
        }
        self.rest_trie.search(&key).await
    }
}

#[derive(Debug, Default)]
pub struct Trie {
    root: Arc<RwLock<TreeNode>>,
}

#[derive(Debug, Default)]
struct TreeNode {
    nodes: BTreeMap<String, Arc<RwLock<TreeNode>>>,
    value: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub route_key: String,
    pub path_values: Vec<(String, String)>,
}

fn variable_name(segment: &str) -> Option<&str> {
    segment.strip_prefix('{')?.strip_suffix('}')
}

impl Trie {
    pub async fn insert(&self, route_key: &str) {
        let mut temp = self.root.clone();
        for item in route_key.split('/') {
            let res_node = temp.read().await.nodes.get(item).cloned();
            let node = match res_node {
                Some(node) => node,
                None => {
                    let mut parent = temp.write().await;
                    let node = parent.nodes.entry(item.to_owned()).or_default();
                    node.clone()
                }
            };
            temp = node;
        }
        let _ = temp.write().await.value.insert(route_key.to_owned());
    }

    pub async fn search(&self, path: &str) -> Option<QueryResult> {
        Self::search_by_nodes(Some(path), self.root.clone()).await
    }

    /// Literal segments win over variables; variables never match an empty segment.
    #[async_recursion]
    async fn search_by_nodes(
        path: Option<&str>,
        temp: Arc<RwLock<TreeNode>>,
    ) -> Option<QueryResult> {
        let Some(path) = path else {
            let value = temp.read().await.value.clone();
            return value.map(|route_key| QueryResult {
                route_key,
                path_values: Vec::new(),
            });
        };
        let (item, rest) = match path.split_once('/') {
            Some((item, rest)) => (item, Some(rest)),
            None => (path, None),
        };
        let (literal, variables) = {
            let node = temp.read().await;
            let variables: Vec<(String, Arc<RwLock<TreeNode>>)> = node
                .nodes
                .iter()
                .filter_map(|(segment, child)| {
                    variable_name(segment).map(|name| (name.to_owned(), child.clone()))
                })
                .collect();
            (node.nodes.get(item).cloned(), variables)
        };
        if let Some(node) = literal {
            if let Some(result) = Self::search_by_nodes(rest, node).await {
                return Some(result);
            }
        }
        if item.is_empty() {
            return None;
        }
        for (name, node) in variables {
            if let Some(mut result) = Self::search_by_nodes(rest, node).await {
                let value = urlencoding::decode(item)
                    .map_or_else(|_| item.to_owned(), |e| e.into_owned());
                result.path_values.insert(0, (name, value));
                return Some(result);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn path_cache() -> PathCache {
        let cache = PathCache::default();
        for key in [
            "GET#/users/{id}",
            "GET#/users/me",
            "GET#/users/{id}/orders/{orderId}",
            "POST#/users",
        ] {
            cache.insert(key).await;
        }
        cache
    }

    #[tokio::test]
    async fn test_exact_match() {
        let cache = path_cache().await;
        let result = cache.search("get", "/users/me").await.unwrap();
        assert_eq!(result.route_key, "GET#/users/me");
        assert!(result.path_values.is_empty());
        assert_eq!(
            cache.search("POST", "/users").await.unwrap().route_key,
            "POST#/users"
        );
        assert!(cache.search("DELETE", "/users").await.is_none());
    }

    #[tokio::test]
    async fn test_path_values() {
        let cache = path_cache().await;
        let result = cache.search("GET", "/users/42").await.unwrap();
        assert_eq!(result.route_key, "GET#/users/{id}");
        assert_eq!(result.path_values, vec![("id".to_owned(), "42".to_owned())]);

        let result = cache.search("GET", "/users/a%20b/orders/7").await.unwrap();
        assert_eq!(result.route_key, "GET#/users/{id}/orders/{orderId}");
        assert_eq!(
            result.path_values,
            vec![
                ("id".to_owned(), "a b".to_owned()),
                ("orderId".to_owned(), "7".to_owned())
            ]
        );

        assert!(cache.search("GET", "/users/").await.is_none());
        assert!(cache.search("GET", "/users/42/orders").await.is_none());
    }
}
