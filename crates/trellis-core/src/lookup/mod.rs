//! Cluster state adapter contract.
//!
//! The resolver never talks to a cluster API directly; template functions
//! read through this trait. Missing objects and keys are errors, never empty
//! values, and adapter failures surface verbatim. Implementations must
//! tolerate concurrent reads.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ClusterScopedObjectId;

/// Lookup error types.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("lookup denied: {0}")]
    Denied(String),

    #[error("cluster state error: {0}")]
    Backend(String),
}

/// A cluster-scoped claim exposing one opaque value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterClaim {
    pub value: String,
}

impl ClusterClaim {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

/// Read access to live cluster state.
///
/// Implementations are external collaborators (an API client, a cache, or the
/// in-memory state used for dry runs and tests).
#[async_trait]
pub trait ClusterState: Send + Sync {
    /// Raw data of a namespaced secret.
    async fn secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, LookupError>;

    /// Data of a namespaced config map.
    async fn config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, LookupError>;

    /// A cluster-scoped claim by name.
    async fn cluster_claim(&self, name: &str) -> Result<ClusterClaim, LookupError>;

    /// An arbitrary live object as a nested mapping. An empty `namespace`
    /// means the object is cluster scoped.
    async fn resource(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<serde_json::Value, LookupError>;
}

/// Wraps a caller-provided adapter with the resolver's reachability rules:
/// an optional namespace restriction and a cluster-scoped allow-list.
///
/// Template functions forward their arguments verbatim; scoping is enforced
/// here so every lookup path inherits it.
pub struct ScopedClusterState {
    inner: Arc<dyn ClusterState>,
    lookup_namespace: Option<String>,
    cluster_scoped_allow_list: Vec<ClusterScopedObjectId>,
}

impl ScopedClusterState {
    pub fn new(
        inner: Arc<dyn ClusterState>,
        lookup_namespace: Option<String>,
        cluster_scoped_allow_list: Vec<ClusterScopedObjectId>,
    ) -> Self {
        Self {
            inner,
            lookup_namespace,
            cluster_scoped_allow_list,
        }
    }

    fn check_namespace(&self, namespace: &str) -> Result<(), LookupError> {
        match &self.lookup_namespace {
            Some(restricted) if !restricted.is_empty() && restricted != namespace => {
                Err(LookupError::Denied(format!(
                    "lookups are restricted to the {restricted} namespace, got {namespace}"
                )))
            }
            _ => Ok(()),
        }
    }

    fn check_cluster_scoped(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
    ) -> Result<(), LookupError> {
        if self.cluster_scoped_allow_list.is_empty() {
            return Ok(());
        }

        let allowed = self.cluster_scoped_allow_list.iter().any(|id| {
            (id.api_version.is_empty() || id.api_version == api_version)
                && id.kind == kind
                && (id.name == "*" || id.name == name)
        });

        if allowed {
            Ok(())
        } else {
            Err(LookupError::Denied(format!(
                "the cluster-scoped object {kind} {name} is not in the allow list"
            )))
        }
    }
}

#[async_trait]
impl ClusterState for ScopedClusterState {
    async fn secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, LookupError> {
        self.check_namespace(namespace)?;
        self.inner.secret(namespace, name).await
    }

    async fn config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, LookupError> {
        self.check_namespace(namespace)?;
        self.inner.config_map(namespace, name).await
    }

    async fn cluster_claim(&self, name: &str) -> Result<ClusterClaim, LookupError> {
        self.check_cluster_scoped("", "ClusterClaim", name)?;
        self.inner.cluster_claim(name).await
    }

    async fn resource(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<serde_json::Value, LookupError> {
        if namespace.is_empty() {
            self.check_cluster_scoped(api_version, kind, name)?;
        } else {
            self.check_namespace(namespace)?;
        }

        self.inner.resource(api_version, kind, namespace, name).await
    }
}
