//! Bulk listing of every resource a user can see
//!
//! Each listable kind is first listed at cluster scope. A 403 on a
//! namespaced kind expands into one list per known namespace, run as
//! further tasks in the same fan-out group; namespace-scope refusals are
//! dropped. Empty lists are omitted from the result.

use std::sync::Arc;

use axum::http::header::ACCEPT;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use kuill_common::{fan_out, KindCatalog, KindDescriptor, NamespaceSet, Spawner};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{BackendClient, BackendRequest};
use crate::identity::AuthContext;

/// Response of `/proxy/_/resources/list`
#[derive(Debug, Default, Serialize)]
pub struct ResourceLists {
    /// Non-empty list objects as returned by the backend
    pub lists: Vec<Value>,
}

/// Lists every listable kind on behalf of a user
pub struct ResourceLister {
    backend: Arc<dyn BackendClient>,
    kinds: Arc<KindCatalog>,
    namespaces: Arc<NamespaceSet>,
}

struct ListContext {
    backend: Arc<dyn BackendClient>,
    headers: HeaderMap,
    namespaces: Arc<Vec<String>>,
    user: String,
}

impl ResourceLister {
    /// Create a lister over the given catalogs
    pub fn new(backend: Arc<dyn BackendClient>, kinds: Arc<KindCatalog>, namespaces: Arc<NamespaceSet>) -> Self {
        Self {
            backend,
            kinds,
            namespaces,
        }
    }

    /// List everything visible to `ctx`
    ///
    /// `headers` carry the user's identity and forwarding information.
    pub async fn list_all(&self, ctx: &AuthContext, mut headers: HeaderMap) -> ResourceLists {
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let shared = Arc::new(ListContext {
            backend: self.backend.clone(),
            headers,
            namespaces: self.namespaces.snapshot().await,
            user: ctx.user.clone(),
        });

        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        let (spawner, mut collector) = fan_out::<Value>(cancel);
        for kind in self.kinds.snapshot().await.iter().filter(|k| k.supports("list")) {
            spawn_list(&spawner, shared.clone(), kind.clone(), None);
        }
        spawner.finish();

        let mut lists = Vec::new();
        while let Some(list) = collector.next().await {
            lists.push(list);
        }
        debug!(user = %ctx.user, requests = collector.spawned(), lists = lists.len(), "Listed resources");
        ResourceLists { lists }
    }
}

fn spawn_list(
    spawner: &Spawner<Value>,
    shared: Arc<ListContext>,
    kind: Arc<KindDescriptor>,
    namespace: Option<String>,
) {
    spawner.spawn(move |spawner| async move {
        let path = kind.path(namespace.as_deref());
        let response = match shared
            .backend
            .request(BackendRequest::get(path.clone(), shared.headers.clone()))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(user = %shared.user, path = %path, error = %e, "Failed to list resources");
                return None;
            }
        };

        match response.status {
            status if status.is_success() => {
                let list: Value = match serde_json::from_slice(&response.body) {
                    Ok(list) => list,
                    Err(e) => {
                        warn!(path = %path, error = %e, "Backend returned a malformed list");
                        return None;
                    }
                };
                let populated = list["items"].as_array().is_some_and(|items| !items.is_empty());
                populated.then_some(list)
            }
            StatusCode::FORBIDDEN if kind.namespaced && namespace.is_none() => {
                debug!(user = %shared.user, kind = %kind.plural, "Cluster list denied, listing per namespace");
                for ns in shared.namespaces.iter() {
                    spawn_list(&spawner, shared.clone(), kind.clone(), Some(ns.clone()));
                }
                None
            }
            StatusCode::FORBIDDEN => {
                debug!(user = %shared.user, path = %path, "List denied");
                None
            }
            status => {
                warn!(user = %shared.user, path = %path, status = %status, "Unexpected list response");
                None
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendResponse, MockBackendClient};
    use crate::test_support::{catalog_of, namespace_set};
    use axum::body::Bytes;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    fn pods() -> KindDescriptor {
        KindDescriptor::new("Pod", "pods", "", "v1", true, ["get", "list", "watch"])
    }

    fn nodes() -> KindDescriptor {
        KindDescriptor::new("Node", "nodes", "", "v1", false, ["get", "list"])
    }

    fn list(kind: &str, names: &[&str]) -> BackendResponse {
        let items: Vec<Value> = names
            .iter()
            .map(|n| serde_json::json!({"metadata": {"name": n}}))
            .collect();
        BackendResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from(serde_json::to_vec(&serde_json::json!({"kind": kind, "items": items})).unwrap()),
        }
    }

    fn forbidden() -> BackendResponse {
        BackendResponse {
            status: StatusCode::FORBIDDEN,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"{\"kind\":\"Status\",\"code\":403}"),
        }
    }

    /// Backend answering by path, recording every path requested
    fn backend(route: fn(&str) -> BackendResponse) -> (MockBackendClient, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();
        let mut backend = MockBackendClient::new();
        backend.expect_request().returning(move |req| {
            assert_eq!(req.headers.get(ACCEPT).unwrap(), "application/json");
            recorded.lock().unwrap().push(req.path_and_query.clone());
            Ok(route(&req.path_and_query))
        });
        (backend, seen)
    }

    fn lister(backend: MockBackendClient, kinds: Vec<KindDescriptor>) -> ResourceLister {
        ResourceLister::new(Arc::new(backend), catalog_of(kinds), namespace_set(&["a", "b"]))
    }

    fn kinds_of(lists: &ResourceLists) -> BTreeSet<String> {
        lists
            .lists
            .iter()
            .map(|l| {
                let name = l["items"][0]["metadata"]["name"].as_str().unwrap();
                format!("{}:{}", l["kind"].as_str().unwrap(), name)
            })
            .collect()
    }

    fn alice() -> AuthContext {
        AuthContext::new("alice", ["dev"])
    }

    #[tokio::test]
    async fn cluster_lists_need_no_fallback() {
        let (backend, seen) = backend(|path| match path {
            "/api/v1/pods" => list("PodList", &["web-0"]),
            "/api/v1/nodes" => list("NodeList", &["node-1"]),
            other => panic!("unexpected path {}", other),
        });

        let lists = lister(backend, vec![pods(), nodes()]).list_all(&alice(), HeaderMap::new()).await;

        assert_eq!(lists.lists.len(), 2);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cluster_denial_lists_each_namespace() {
        let (backend, seen) = backend(|path| match path {
            "/api/v1/pods" => forbidden(),
            "/api/v1/namespaces/a/pods" => list("PodList", &["in-a"]),
            "/api/v1/namespaces/b/pods" => list("PodList", &["in-b"]),
            other => panic!("unexpected path {}", other),
        });

        let lists = lister(backend, vec![pods()]).list_all(&alice(), HeaderMap::new()).await;

        let expected = BTreeSet::from(["PodList:in-a".to_string(), "PodList:in-b".to_string()]);
        assert_eq!(kinds_of(&lists), expected);
        let paths: BTreeSet<String> = seen.lock().unwrap().iter().cloned().collect();
        assert_eq!(paths.len(), 3);
    }

    #[tokio::test]
    async fn namespace_denials_and_empty_lists_are_dropped() {
        let (backend, seen) = backend(|path| match path {
            "/api/v1/pods" => forbidden(),
            "/api/v1/namespaces/a/pods" => forbidden(),
            "/api/v1/namespaces/b/pods" => list("PodList", &["in-b"]),
            "/api/v1/nodes" => list("NodeList", &[]),
            other => panic!("unexpected path {}", other),
        });

        let lists = lister(backend, vec![pods(), nodes()]).list_all(&alice(), HeaderMap::new()).await;

        assert_eq!(kinds_of(&lists), BTreeSet::from(["PodList:in-b".to_string()]));
        assert_eq!(seen.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn cluster_scoped_denial_is_final() {
        let (backend, seen) = backend(|path| match path {
            "/api/v1/nodes" => forbidden(),
            other => panic!("unexpected path {}", other),
        });

        let lists = lister(backend, vec![nodes()]).list_all(&alice(), HeaderMap::new()).await;

        assert!(lists.lists.is_empty());
        assert_eq!(*seen.lock().unwrap(), vec!["/api/v1/nodes".to_string()]);
    }
}
