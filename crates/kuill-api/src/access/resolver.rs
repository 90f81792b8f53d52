//! Effective permissions with cluster to namespace fallback
//!
//! A check is first asked at the scope requested. A denied cluster-scope
//! check on a namespaced resource expands into one check per known
//! namespace; namespace-scope denials are final. Every check, including
//! the expanded ones, runs as its own task in one fan-out group, so the
//! expansion is a work queue rather than call-stack recursion and the
//! group completes exactly when the last discovered check does.

use std::collections::BTreeMap;
use std::sync::Arc;

use kuill_common::{fan_out, KindCatalog, KindDescriptor, NamespaceSet, Spawner};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::review::{AccessReviewer, ReviewRequest};
use crate::error::{Error, Result};
use crate::identity::AuthContext;

/// Where a capability is available
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessResolution {
    /// Granted at cluster scope
    pub cluster_wide: bool,
    /// Namespaces granted individually, sorted
    pub namespaces: Vec<String>,
}

impl AccessResolution {
    /// Whether the capability is available anywhere
    pub fn is_granted(&self) -> bool {
        self.cluster_wide || !self.namespaces.is_empty()
    }

    /// Whether the capability is available in `namespace`
    pub fn allows(&self, namespace: &str) -> bool {
        self.cluster_wide || self.namespaces.iter().any(|ns| ns == namespace)
    }
}

/// UI-level actions on a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Read
    Get,
    /// Replace
    Put,
    /// Delete
    Delete,
    /// Read container logs
    Logs,
    /// Exec into containers
    Exec,
}

impl Permission {
    /// Every permission, in reporting order
    pub const ALL: [Permission; 5] = [
        Permission::Get,
        Permission::Put,
        Permission::Delete,
        Permission::Logs,
        Permission::Exec,
    ];

    /// Backend check answering this permission for `kind`
    ///
    /// Logs and exec are pod subresources regardless of `kind`.
    fn check(self, kind: &KindDescriptor, namespace: Option<&str>, name: Option<&str>) -> Check {
        let name = name.map(str::to_string);
        let (request, namespaced) = match self {
            Permission::Get => (kind_request(kind, "get"), kind.namespaced),
            Permission::Put => (kind_request(kind, "update"), kind.namespaced),
            Permission::Delete => (kind_request(kind, "delete"), kind.namespaced),
            Permission::Logs => (ReviewRequest::new("", "pods", "get").with_subresource("log"), true),
            Permission::Exec => (ReviewRequest::new("", "pods", "get").with_subresource("exec"), true),
        };
        let pod_scoped = matches!(self, Permission::Logs | Permission::Exec);
        let request = if !pod_scoped || kind.kind == "Pod" {
            request.with_name(name)
        } else {
            request
        };
        let request = match namespace.filter(|_| namespaced) {
            Some(ns) => request.in_namespace(ns),
            None => request,
        };
        Check { request, namespaced }
    }
}

fn kind_request(kind: &KindDescriptor, verb: &str) -> ReviewRequest {
    ReviewRequest::new(kind.group.clone(), kind.plural.clone(), verb)
}

/// Result of `permissions_for_resource`
pub type ResourcePermissions = BTreeMap<Permission, AccessResolution>;

/// A review plus whether a cluster-scope denial may fall back
#[derive(Debug, Clone)]
struct Check {
    request: ReviewRequest,
    namespaced: bool,
}

struct Grant {
    index: usize,
    namespace: Option<String>,
}

struct CheckContext {
    reviewer: Arc<dyn AccessReviewer>,
    ctx: AuthContext,
    namespaces: Arc<Vec<String>>,
}

/// Resolves permissions through concurrent access reviews
pub struct AccessResolver {
    reviewer: Arc<dyn AccessReviewer>,
    kinds: Arc<KindCatalog>,
    namespaces: Arc<NamespaceSet>,
}

impl AccessResolver {
    /// Create a resolver over the given catalogs
    pub fn new(reviewer: Arc<dyn AccessReviewer>, kinds: Arc<KindCatalog>, namespaces: Arc<NamespaceSet>) -> Self {
        Self {
            reviewer,
            kinds,
            namespaces,
        }
    }

    /// Resolve one check for `kind`, falling back to namespaces when denied
    /// at cluster scope
    pub async fn resolve_access(
        &self,
        ctx: &AuthContext,
        kind: &KindDescriptor,
        request: ReviewRequest,
    ) -> AccessResolution {
        let check = Check {
            request,
            namespaced: kind.namespaced,
        };
        self.resolve_all(ctx, vec![check]).await.pop().unwrap_or_default()
    }

    /// Get, put, delete, logs and exec for `kind`, resolved concurrently
    pub async fn permissions_for_resource(
        &self,
        ctx: &AuthContext,
        kind: &str,
        namespace: Option<&str>,
        name: Option<&str>,
    ) -> Result<ResourcePermissions> {
        let descriptor = self
            .kinds
            .get(kind)
            .await
            .ok_or_else(|| Error::NotFound(format!("unknown kind '{}'", kind)))?;
        let namespace = namespace.filter(|ns| !ns.is_empty());
        let checks = Permission::ALL
            .iter()
            .map(|p| p.check(&descriptor, namespace, name))
            .collect();

        let resolved = self.resolve_all(ctx, checks).await;
        Ok(Permission::ALL.into_iter().zip(resolved).collect())
    }

    /// For every watch-capable kind, where `ctx` may watch it
    ///
    /// Kinds that cannot be watched anywhere are omitted.
    pub async fn watchable_resources(&self, ctx: &AuthContext) -> BTreeMap<String, AccessResolution> {
        let kinds = self.kinds.snapshot().await.watchable();
        let checks = kinds
            .iter()
            .map(|k| Check {
                request: kind_request(k, "watch"),
                namespaced: k.namespaced,
            })
            .collect();

        let resolved = self.resolve_all(ctx, checks).await;
        kinds
            .iter()
            .zip(resolved)
            .filter(|(_, r)| r.is_granted())
            .map(|(k, r)| (k.kind.clone(), r))
            .collect()
    }

    async fn resolve_all(&self, ctx: &AuthContext, checks: Vec<Check>) -> Vec<AccessResolution> {
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        let (spawner, mut collector) = fan_out::<Grant>(cancel);
        let shared = Arc::new(CheckContext {
            reviewer: self.reviewer.clone(),
            ctx: ctx.clone(),
            namespaces: self.namespaces.snapshot().await,
        });

        let mut resolved = vec![AccessResolution::default(); checks.len()];
        for (index, check) in checks.into_iter().enumerate() {
            spawn_check(&spawner, shared.clone(), index, check);
        }
        spawner.finish();

        while let Some(grant) = collector.next().await {
            if let Some(slot) = resolved.get_mut(grant.index) {
                match grant.namespace {
                    None => slot.cluster_wide = true,
                    Some(ns) => slot.namespaces.push(ns),
                }
            }
        }
        for resolution in &mut resolved {
            resolution.namespaces.sort();
            resolution.namespaces.dedup();
        }
        debug!(user = %ctx.user, reviews = collector.spawned(), "Resolved access");
        resolved
    }
}

fn spawn_check(spawner: &Spawner<Grant>, shared: Arc<CheckContext>, index: usize, check: Check) {
    spawner.spawn(move |spawner| async move {
        let request = &check.request;
        match shared.reviewer.review(&shared.ctx, request).await {
            Ok(true) => Some(Grant {
                index,
                namespace: request.namespace.clone(),
            }),
            Ok(false) if check.namespaced && request.is_cluster_scope() => {
                for ns in shared.namespaces.iter() {
                    let child = Check {
                        request: request.in_namespace(ns.clone()),
                        namespaced: true,
                    };
                    spawn_check(&spawner, shared.clone(), index, child);
                }
                None
            }
            Ok(false) => None,
            Err(e) => {
                warn!(
                    user = %shared.ctx.user,
                    resource = %request.resource,
                    verb = %request.verb,
                    namespace = request.namespace.as_deref().unwrap_or(""),
                    error = %e,
                    "Access review failed"
                );
                None
            }
        }
    });
}
