//! # Trellis State
//!
//! In-memory [`ClusterState`] implementation for development and testing.
//!
//! This crate provides:
//! - `InMemoryClusterState` with builder-style seeding
//!
//! It backs dry-run resolution (resolving a policy without a live cluster)
//! and the test suites of downstream crates.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

// Re-export the core lookup contract for convenience
pub use trellis_core::lookup::{ClusterClaim, ClusterState, LookupError};

type ObjectKey = (String, String);
type ResourceKey = (String, String, String, String);

/// In-memory cluster state for development and testing.
///
/// Seed it with the `with_*` builders, or mutate it between resolve calls
/// with the `insert_*` methods. All reads go through an interior lock, so a
/// shared instance tolerates the resolver's concurrent lookups.
#[derive(Default)]
pub struct InMemoryClusterState {
    secrets: RwLock<HashMap<ObjectKey, BTreeMap<String, Vec<u8>>>>,
    config_maps: RwLock<HashMap<ObjectKey, BTreeMap<String, String>>>,
    cluster_claims: RwLock<HashMap<String, ClusterClaim>>,
    resources: RwLock<HashMap<ResourceKey, serde_json::Value>>,
}

impl InMemoryClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret<K, V>(
        self,
        namespace: &str,
        name: &str,
        data: impl IntoIterator<Item = (K, V)>,
    ) -> Self
    where
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        self.insert_secret(namespace, name, data);
        self
    }

    pub fn with_config_map<K, V>(
        self,
        namespace: &str,
        name: &str,
        data: impl IntoIterator<Item = (K, V)>,
    ) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.insert_config_map(namespace, name, data);
        self
    }

    pub fn with_cluster_claim(self, name: &str, value: &str) -> Self {
        self.insert_cluster_claim(name, value);
        self
    }

    pub fn with_resource(
        self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
        object: serde_json::Value,
    ) -> Self {
        self.insert_resource(api_version, kind, namespace, name, object);
        self
    }

    pub fn insert_secret<K, V>(
        &self,
        namespace: &str,
        name: &str,
        data: impl IntoIterator<Item = (K, V)>,
    ) where
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        let data = data
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        if let Ok(mut secrets) = self.secrets.write() {
            secrets.insert(object_key(namespace, name), data);
        }
    }

    pub fn insert_config_map<K, V>(
        &self,
        namespace: &str,
        name: &str,
        data: impl IntoIterator<Item = (K, V)>,
    ) where
        K: Into<String>,
        V: Into<String>,
    {
        let data = data
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        if let Ok(mut config_maps) = self.config_maps.write() {
            config_maps.insert(object_key(namespace, name), data);
        }
    }

    pub fn insert_cluster_claim(&self, name: &str, value: &str) {
        if let Ok(mut claims) = self.cluster_claims.write() {
            claims.insert(name.to_string(), ClusterClaim::new(value));
        }
    }

    pub fn insert_resource(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
        object: serde_json::Value,
    ) {
        if let Ok(mut resources) = self.resources.write() {
            resources.insert(
                (
                    api_version.to_string(),
                    kind.to_string(),
                    namespace.to_string(),
                    name.to_string(),
                ),
                object,
            );
        }
    }
}

fn object_key(namespace: &str, name: &str) -> ObjectKey {
    (namespace.to_string(), name.to_string())
}

#[async_trait]
impl ClusterState for InMemoryClusterState {
    async fn secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, LookupError> {
        let secrets = self
            .secrets
            .read()
            .map_err(|err| LookupError::Backend(err.to_string()))?;

        secrets
            .get(&object_key(namespace, name))
            .cloned()
            .ok_or_else(|| LookupError::NotFound(format!("secret {namespace}/{name}")))
    }

    async fn config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, LookupError> {
        let config_maps = self
            .config_maps
            .read()
            .map_err(|err| LookupError::Backend(err.to_string()))?;

        config_maps
            .get(&object_key(namespace, name))
            .cloned()
            .ok_or_else(|| LookupError::NotFound(format!("config map {namespace}/{name}")))
    }

    async fn cluster_claim(&self, name: &str) -> Result<ClusterClaim, LookupError> {
        let claims = self
            .cluster_claims
            .read()
            .map_err(|err| LookupError::Backend(err.to_string()))?;

        claims
            .get(name)
            .cloned()
            .ok_or_else(|| LookupError::NotFound(format!("cluster claim {name}")))
    }

    async fn resource(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<serde_json::Value, LookupError> {
        let resources = self
            .resources
            .read()
            .map_err(|err| LookupError::Backend(err.to_string()))?;

        resources
            .get(&(
                api_version.to_string(),
                kind.to_string(),
                namespace.to_string(),
                name.to_string(),
            ))
            .cloned()
            .ok_or_else(|| {
                let scope = if namespace.is_empty() {
                    name.to_string()
                } else {
                    format!("{namespace}/{name}")
                };
                LookupError::NotFound(format!("{kind} {scope}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded() -> InMemoryClusterState {
        InMemoryClusterState::new()
            .with_secret(
                "testns",
                "testsecret",
                [("secretkey1", b"secretkey1Val".as_slice())],
            )
            .with_config_map("testns", "testconfigmap", [("cmkey1", "cmkey1Val")])
            .with_cluster_claim("region", "east-1")
            .with_resource(
                "v1",
                "Namespace",
                "",
                "testns",
                json!({"kind": "Namespace", "metadata": {"name": "testns"}}),
            )
    }

    #[test]
    fn test_seeded_objects_are_readable() {
        tokio_test::block_on(async {
            let state = seeded();

            let secret = state.secret("testns", "testsecret").await.expect("secret");
            assert_eq!(
                secret.get("secretkey1").map(Vec::as_slice),
                Some(b"secretkey1Val".as_slice())
            );

            let config_map = state
                .config_map("testns", "testconfigmap")
                .await
                .expect("config map");
            assert_eq!(config_map.get("cmkey1").map(String::as_str), Some("cmkey1Val"));

            let claim = state.cluster_claim("region").await.expect("claim");
            assert_eq!(claim.value, "east-1");

            let namespace = state
                .resource("v1", "Namespace", "", "testns")
                .await
                .expect("resource");
            assert_eq!(namespace["metadata"]["name"], json!("testns"));
        });
    }

    #[test]
    fn test_missing_objects_are_errors_not_empty_values() {
        tokio_test::block_on(async {
            let state = seeded();

            match state.secret("testns", "absent").await {
                Err(LookupError::NotFound(message)) => {
                    assert_eq!(message, "secret testns/absent");
                }
                other => panic!("expected not-found, got {:?}", other),
            }

            match state.config_map("otherns", "testconfigmap").await {
                Err(LookupError::NotFound(_)) => {}
                other => panic!("expected not-found, got {:?}", other),
            }

            match state.cluster_claim("absent").await {
                Err(LookupError::NotFound(_)) => {}
                other => panic!("expected not-found, got {:?}", other),
            }

            match state.resource("v1", "Namespace", "", "absent").await {
                Err(LookupError::NotFound(message)) => {
                    assert_eq!(message, "Namespace absent");
                }
                other => panic!("expected not-found, got {:?}", other),
            }
        });
    }

    #[test]
    fn test_insert_after_construction_is_visible() {
        tokio_test::block_on(async {
            let state = InMemoryClusterState::new();
            state.insert_config_map("apps", "settings", [("mode", "canary")]);

            let config_map = state.config_map("apps", "settings").await.expect("config map");
            assert_eq!(config_map.get("mode").map(String::as_str), Some("canary"));
        });
    }
}
