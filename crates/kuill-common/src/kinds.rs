//! Resource kind catalog
//!
//! The catalog is a snapshot of every listable resource kind the backend
//! advertises through discovery. Snapshots are replaced wholesale on each
//! refresh; readers clone an `Arc` to the current snapshot and never see a
//! partially updated catalog.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use kube::discovery::{verbs, Discovery, Scope};
use kube::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::refresh::Refreshable;

/// Kinds that govern access control
const ACCESS_KINDS: &[&str] = &[
    "Role",
    "ClusterRole",
    "RoleBinding",
    "ClusterRoleBinding",
    "ServiceAccount",
];

/// Namespaced kinds that are administered like cluster resources
const NAMESPACED_CLUSTER_KINDS: &[&str] = &[
    "ResourceQuota",
    "NetworkPolicy",
    "RoleBinding",
    "ClusterRoleBinding",
    "ServiceAccount",
];

/// UI grouping for a kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceGroup {
    /// RBAC and identity kinds
    Access,
    /// Namespaced workload kinds
    Workloads,
    /// Everything else
    Cluster,
}

impl ResourceGroup {
    /// Classify a kind by name and scope
    pub fn classify(kind: &str, namespaced: bool) -> Self {
        if ACCESS_KINDS.contains(&kind) {
            ResourceGroup::Access
        } else if namespaced && !NAMESPACED_CLUSTER_KINDS.contains(&kind) {
            ResourceGroup::Workloads
        } else {
            ResourceGroup::Cluster
        }
    }
}

/// Metadata for one resource kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindDescriptor {
    /// Kind name, e.g. `Deployment`
    #[serde(rename = "name")]
    pub kind: String,
    /// Plural resource name, e.g. `deployments`
    pub plural: String,
    /// API group (empty for the core group)
    pub group: String,
    /// API version within the group
    pub version: String,
    /// Path prefix, `api/v1` or `apis/{group}/{version}`
    #[serde(rename = "base")]
    pub api_base: String,
    /// Whether instances live inside a namespace
    pub namespaced: bool,
    /// Verbs the backend supports for this kind
    pub verbs: BTreeSet<String>,
    /// UI grouping
    pub resource_group: ResourceGroup,
    /// Short display abbreviation
    pub abbrev: String,
}

impl KindDescriptor {
    /// Build a descriptor, deriving the API base, abbreviation and group
    pub fn new(
        kind: impl Into<String>,
        plural: impl Into<String>,
        group: impl Into<String>,
        version: impl Into<String>,
        namespaced: bool,
        verbs: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let kind = kind.into();
        let group = group.into();
        let version = version.into();
        let api_base = if group.is_empty() {
            format!("api/{}", version)
        } else {
            format!("apis/{}/{}", group, version)
        };
        Self {
            abbrev: abbreviate(&kind),
            resource_group: ResourceGroup::classify(&kind, namespaced),
            plural: plural.into(),
            verbs: verbs.into_iter().map(Into::into).collect(),
            kind,
            group,
            version,
            api_base,
            namespaced,
        }
    }

    /// Whether the backend supports `verb` on this kind
    pub fn supports(&self, verb: &str) -> bool {
        self.verbs.contains(verb)
    }

    /// Whether a watch stream can be opened for this kind
    pub fn is_watchable(&self) -> bool {
        self.supports("watch")
    }

    /// Collection path for this kind
    ///
    /// A namespace is only applied to namespaced kinds; an empty or absent
    /// namespace yields the cluster-scope path.
    pub fn path(&self, namespace: Option<&str>) -> String {
        match namespace.filter(|ns| self.namespaced && !ns.is_empty()) {
            Some(ns) => format!("/{}/namespaces/{}/{}", self.api_base, ns, self.plural),
            None => format!("/{}/{}", self.api_base, self.plural),
        }
    }
}

/// Derive a two-letter abbreviation from a camel-case kind name
///
/// `ConfigMap` becomes `Cm`, `Pod` becomes `Po`.
pub fn abbreviate(kind: &str) -> String {
    let chars: Vec<char> = kind.chars().collect();
    let humps: Vec<usize> = chars
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_ascii_uppercase())
        .map(|(i, _)| i)
        .collect();

    match humps.as_slice() {
        [first, second, ..] => {
            let mut out = String::new();
            out.push(chars[*first]);
            out.push(chars[*second].to_ascii_lowercase());
            out
        }
        [only] => {
            let mut out = String::new();
            out.push(chars[*only]);
            if let Some(next) = chars.get(only + 1).filter(|c| c.is_ascii_lowercase()) {
                out.push(*next);
            }
            out
        }
        [] => {
            let mut out = String::new();
            for (i, c) in chars.iter().take(2).enumerate() {
                if i == 0 {
                    out.push(c.to_ascii_uppercase());
                } else {
                    out.push(*c);
                }
            }
            out
        }
    }
}

/// Immutable view of the catalog at one point in time
#[derive(Debug, Default)]
pub struct KindSnapshot {
    kinds: BTreeMap<String, Arc<KindDescriptor>>,
    document: Vec<u8>,
}

impl KindSnapshot {
    /// Build a snapshot, pre-rendering the JSON kinds document
    ///
    /// When several groups serve a kind of the same name, the core group
    /// wins, then built-in groups, then the lexically first group.
    pub fn new(kinds: Vec<KindDescriptor>) -> Self {
        let mut by_name: BTreeMap<String, Arc<KindDescriptor>> = BTreeMap::new();
        for kind in kinds {
            let replace = match by_name.get(&kind.kind) {
                None => true,
                Some(existing) => {
                    let wins = group_precedence(&kind.group) < group_precedence(&existing.group);
                    let (kept, skipped) = if wins {
                        (&kind.api_base, &existing.api_base)
                    } else {
                        (&existing.api_base, &kind.api_base)
                    };
                    debug!(kind = %kind.kind, kept = %kept, skipped = %skipped, "Kind served by several groups");
                    wins
                }
            };
            if replace {
                by_name.insert(kind.kind.clone(), Arc::new(kind));
            }
        }
        let items: Vec<&KindDescriptor> = by_name.values().map(|k| k.as_ref()).collect();
        let document = serde_json::to_vec(&serde_json::json!({ "items": items }))
            .unwrap_or_else(|_| b"{\"items\":[]}".to_vec());
        Self {
            kinds: by_name,
            document,
        }
    }

    /// Look up a kind by name
    pub fn get(&self, kind: &str) -> Option<Arc<KindDescriptor>> {
        self.kinds.get(kind).cloned()
    }

    /// All kinds, ordered by name
    pub fn iter(&self) -> impl Iterator<Item = &Arc<KindDescriptor>> {
        self.kinds.values()
    }

    /// Kinds that support the watch verb
    pub fn watchable(&self) -> Vec<Arc<KindDescriptor>> {
        self.kinds
            .values()
            .filter(|k| k.is_watchable())
            .cloned()
            .collect()
    }

    /// Number of kinds
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Whether the snapshot holds no kinds
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Pre-rendered `{"items":[...]}` document
    pub fn document(&self) -> &[u8] {
        &self.document
    }
}

/// Ordering key for groups serving the same kind name; lower wins
fn group_precedence(group: &str) -> (u8, &str) {
    let rank = if group.is_empty() {
        0
    } else if !group.contains('.') || group.ends_with(".k8s.io") {
        1
    } else {
        2
    };
    (rank, group)
}

/// Source of kind metadata
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KindSource: Send + Sync {
    /// Load every listable kind
    async fn load(&self) -> Result<Vec<KindDescriptor>>;
}

/// Loads kinds from backend API discovery
///
/// Uses the preferred version of each API group and keeps only kinds that
/// support `list`.
pub struct DiscoveryKindSource {
    client: Client,
}

impl DiscoveryKindSource {
    /// Create a discovery source using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KindSource for DiscoveryKindSource {
    async fn load(&self) -> Result<Vec<KindDescriptor>> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| Error::Discovery(e.to_string()))?;

        let mut kinds = Vec::new();
        for group in discovery.groups() {
            for (resource, caps) in group.recommended_resources() {
                if !caps.supports_operation(verbs::LIST) {
                    continue;
                }
                kinds.push(KindDescriptor::new(
                    resource.kind,
                    resource.plural,
                    resource.group,
                    resource.version,
                    matches!(caps.scope, Scope::Namespaced),
                    caps.operations,
                ));
            }
        }
        debug!(count = kinds.len(), "Discovered listable kinds");
        Ok(kinds)
    }
}

/// Periodically refreshed catalog of resource kinds
pub struct KindCatalog {
    source: Arc<dyn KindSource>,
    snapshot: RwLock<Arc<KindSnapshot>>,
}

impl KindCatalog {
    /// Create an empty catalog backed by `source`
    pub fn new(source: Arc<dyn KindSource>) -> Self {
        Self {
            source,
            snapshot: RwLock::new(Arc::new(KindSnapshot::default())),
        }
    }

    /// Create a catalog with fixed contents
    pub fn from_kinds(source: Arc<dyn KindSource>, kinds: Vec<KindDescriptor>) -> Self {
        Self {
            source,
            snapshot: RwLock::new(Arc::new(KindSnapshot::new(kinds))),
        }
    }

    /// Current snapshot
    pub async fn snapshot(&self) -> Arc<KindSnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Look up a kind in the current snapshot
    pub async fn get(&self, kind: &str) -> Option<Arc<KindDescriptor>> {
        self.snapshot.read().await.get(kind)
    }
}

#[async_trait]
impl Refreshable for KindCatalog {
    fn name(&self) -> &'static str {
        "kinds"
    }

    async fn refresh(&self) -> Result<()> {
        let kinds = self.source.load().await?;
        let snapshot = Arc::new(KindSnapshot::new(kinds));
        let count = snapshot.len();
        *self.snapshot.write().await = snapshot;
        info!(count, "Refreshed kind catalog");
        Ok(())
    }
}
