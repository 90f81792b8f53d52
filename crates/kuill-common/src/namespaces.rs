//! Namespace snapshot
//!
//! The gateway consults the namespace list whenever a cluster-scope request
//! is denied and has to be retried once per namespace.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::ListParams;
use kube::{Api, Client};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{Error, Result};
use crate::refresh::Refreshable;

/// Source of namespace names
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NamespaceSource: Send + Sync {
    /// List the names of every namespace
    async fn list(&self) -> Result<Vec<String>>;
}

/// Lists namespaces through the backend API using the gateway's own credential
pub struct KubeNamespaceSource {
    api: Api<Namespace>,
}

impl KubeNamespaceSource {
    /// Create a namespace source using the given client
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl NamespaceSource for KubeNamespaceSource {
    async fn list(&self) -> Result<Vec<String>> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::Namespaces(e.to_string()))?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }
}

/// Periodically refreshed, sorted list of namespace names
pub struct NamespaceSet {
    source: Arc<dyn NamespaceSource>,
    snapshot: RwLock<Arc<Vec<String>>>,
}

impl NamespaceSet {
    /// Create an empty set backed by `source`
    pub fn new(source: Arc<dyn NamespaceSource>) -> Self {
        Self {
            source,
            snapshot: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Create a set with fixed contents
    pub fn from_names(source: Arc<dyn NamespaceSource>, names: Vec<String>) -> Self {
        Self {
            source,
            snapshot: RwLock::new(Arc::new(normalize(names))),
        }
    }

    /// Current namespace names
    pub async fn snapshot(&self) -> Arc<Vec<String>> {
        self.snapshot.read().await.clone()
    }
}

fn normalize(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names.dedup();
    names
}

#[async_trait]
impl Refreshable for NamespaceSet {
    fn name(&self) -> &'static str {
        "namespaces"
    }

    async fn refresh(&self) -> Result<()> {
        let names = Arc::new(normalize(self.source.list().await?));
        let count = names.len();
        *self.snapshot.write().await = names;
        info!(count, "Refreshed namespace list");
        Ok(())
    }
}
