//! Fixtures shared by unit tests

use std::sync::Arc;

use async_trait::async_trait;
use kuill_common::{KindCatalog, KindDescriptor, KindSource, NamespaceSet, NamespaceSource};

/// Catalog source that never changes
pub(crate) struct FixedSource;

#[async_trait]
impl KindSource for FixedSource {
    async fn load(&self) -> kuill_common::Result<Vec<KindDescriptor>> {
        Ok(standard_kinds())
    }
}

#[async_trait]
impl NamespaceSource for FixedSource {
    async fn list(&self) -> kuill_common::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

pub(crate) fn standard_kinds() -> Vec<KindDescriptor> {
    let rw = ["get", "list", "watch", "create", "update", "delete"];
    vec![
        KindDescriptor::new("Pod", "pods", "", "v1", true, rw),
        KindDescriptor::new("Service", "services", "", "v1", true, rw),
        KindDescriptor::new("Secret", "secrets", "", "v1", true, rw),
        KindDescriptor::new("Deployment", "deployments", "apps", "v1", true, rw),
        KindDescriptor::new("Node", "nodes", "", "v1", false, rw),
        KindDescriptor::new("ComponentStatus", "componentstatuses", "", "v1", false, ["get", "list"]),
    ]
}

pub(crate) fn kind_catalog() -> Arc<KindCatalog> {
    catalog_of(standard_kinds())
}

pub(crate) fn catalog_of(kinds: Vec<KindDescriptor>) -> Arc<KindCatalog> {
    Arc::new(KindCatalog::from_kinds(Arc::new(FixedSource), kinds))
}

pub(crate) fn namespace_set(names: &[&str]) -> Arc<NamespaceSet> {
    Arc::new(NamespaceSet::from_names(
        Arc::new(FixedSource),
        names.iter().map(|n| n.to_string()).collect(),
    ))
}
