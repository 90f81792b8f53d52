//! Single access-review calls against the backend

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use k8s_openapi::api::authorization::v1::{ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec};
use tracing::debug;

use crate::backend::{BackendClient, BackendRequest};
use crate::error::{Error, Result};
use crate::identity::{AuthContext, IdentityInjector};

const SELF_SUBJECT_ACCESS_REVIEWS: &str = "/apis/authorization.k8s.io/v1/selfsubjectaccessreviews";

/// One "can this identity do this?" question
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReviewRequest {
    /// API group of the resource
    pub group: String,
    /// Plural resource name, e.g. `pods`
    pub resource: String,
    /// Backend verb, e.g. `get` or `watch`
    pub verb: String,
    /// Subresource, e.g. `log`
    pub subresource: Option<String>,
    /// Namespace, or `None` for cluster scope
    pub namespace: Option<String>,
    /// Object name, or `None` for every object
    pub name: Option<String>,
}

impl ReviewRequest {
    /// Cluster-scope question about `resource`
    pub fn new(group: impl Into<String>, resource: impl Into<String>, verb: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
            verb: verb.into(),
            subresource: None,
            namespace: None,
            name: None,
        }
    }

    /// Ask about a subresource
    pub fn with_subresource(mut self, subresource: impl Into<String>) -> Self {
        self.subresource = Some(subresource.into());
        self
    }

    /// Ask about one object
    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name.filter(|n| !n.is_empty());
        self
    }

    /// The same question asked in `namespace`
    pub fn in_namespace(&self, namespace: impl Into<String>) -> Self {
        let mut out = self.clone();
        out.namespace = Some(namespace.into()).filter(|ns| !ns.is_empty());
        out
    }

    /// Whether the question covers every namespace
    pub fn is_cluster_scope(&self) -> bool {
        self.namespace.is_none()
    }

    fn attributes(&self) -> ResourceAttributes {
        ResourceAttributes {
            group: Some(self.group.clone()),
            resource: Some(self.resource.clone()),
            verb: Some(self.verb.clone()),
            subresource: self.subresource.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            ..Default::default()
        }
    }
}

/// Answers single access reviews
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccessReviewer: Send + Sync {
    /// Whether `ctx` may perform `request`
    async fn review(&self, ctx: &AuthContext, request: &ReviewRequest) -> Result<bool>;
}

/// [`AccessReviewer`] posting self-subject reviews as the user
///
/// The review carries the same identity headers as proxied requests, so the
/// backend evaluates it for the end user in either identity mode without the
/// gateway needing rights to review on others' behalf.
pub struct BackendAccessReviewer {
    backend: Arc<dyn BackendClient>,
    identity: IdentityInjector,
}

impl BackendAccessReviewer {
    /// Review through `backend` with identity from `identity`
    pub fn new(backend: Arc<dyn BackendClient>, identity: IdentityInjector) -> Self {
        Self { backend, identity }
    }
}

#[async_trait]
impl AccessReviewer for BackendAccessReviewer {
    async fn review(&self, ctx: &AuthContext, request: &ReviewRequest) -> Result<bool> {
        let review = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(request.attributes()),
                ..Default::default()
            },
            ..Default::default()
        };
        let body = serde_json::to_vec(&review)?;

        let mut headers = HeaderMap::new();
        self.identity.apply(&mut headers, ctx)?;
        let response = self
            .backend
            .request(BackendRequest::post_json(SELF_SUBJECT_ACCESS_REVIEWS, headers, body))
            .await?;

        match response.status {
            StatusCode::OK | StatusCode::CREATED => {
                let answered: SelfSubjectAccessReview = serde_json::from_slice(&response.body)
                    .map_err(|e| Error::BackendUnavailable(format!("malformed access review: {}", e)))?;
                let allowed = answered.status.map(|s| s.allowed).unwrap_or(false);
                debug!(
                    user = %ctx.user,
                    resource = %request.resource,
                    verb = %request.verb,
                    namespace = request.namespace.as_deref().unwrap_or(""),
                    allowed,
                    "Access review"
                );
                Ok(allowed)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Forbidden(format!(
                "access review refused with {}",
                response.status
            ))),
            status => Err(Error::BackendUnavailable(format!(
                "access review returned {}",
                status
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendResponse, MockBackendClient};
    use crate::identity::IdentityMode;
    use axum::body::Bytes;

    fn reviewer(backend: MockBackendClient) -> BackendAccessReviewer {
        BackendAccessReviewer::new(
            Arc::new(backend),
            IdentityInjector::new(IdentityMode::Impersonation, vec!["system:authenticated".into()]),
        )
    }

    fn answer(allowed: bool) -> BackendResponse {
        let body = serde_json::json!({
            "apiVersion": "authorization.k8s.io/v1",
            "kind": "SelfSubjectAccessReview",
            "metadata": {},
            "spec": {},
            "status": { "allowed": allowed }
        });
        BackendResponse {
            status: StatusCode::CREATED,
            headers: HeaderMap::new(),
            body: Bytes::from(serde_json::to_vec(&body).unwrap()),
        }
    }

    #[tokio::test]
    async fn posts_review_as_the_user() {
        let mut backend = MockBackendClient::new();
        backend
            .expect_request()
            .withf(|req| {
                let sent: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
                let attrs = &sent["spec"]["resourceAttributes"];
                req.path_and_query == SELF_SUBJECT_ACCESS_REVIEWS
                    && req.headers.get("impersonate-user").unwrap() == "alice"
                    && req.headers.get_all("impersonate-group").iter().count() == 2
                    && sent["kind"] == "SelfSubjectAccessReview"
                    && attrs["resource"] == "secrets"
                    && attrs["verb"] == "get"
                    && attrs["namespace"] == "kube-system"
            })
            .returning(|_| Ok(answer(true)));

        let request = ReviewRequest::new("", "secrets", "get").in_namespace("kube-system");
        let allowed = reviewer(backend)
            .review(&AuthContext::new("alice", ["dev"]), &request)
            .await
            .unwrap();
        assert!(allowed);
    }

    #[tokio::test]
    async fn cluster_scope_omits_namespace() {
        let mut backend = MockBackendClient::new();
        backend
            .expect_request()
            .withf(|req| {
                let sent: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
                sent["spec"]["resourceAttributes"].get("namespace").is_none()
            })
            .returning(|_| Ok(answer(false)));

        let allowed = reviewer(backend)
            .review(&AuthContext::new("alice", ["dev"]), &ReviewRequest::new("", "pods", "list"))
            .await
            .unwrap();
        assert!(!allowed);
    }

    #[tokio::test]
    async fn backend_failures_are_errors() {
        let mut backend = MockBackendClient::new();
        backend.expect_request().returning(|_| {
            Ok(BackendResponse {
                status: StatusCode::SERVICE_UNAVAILABLE,
                headers: HeaderMap::new(),
                body: Bytes::new(),
            })
        });

        let result = reviewer(backend)
            .review(&AuthContext::new("alice", ["dev"]), &ReviewRequest::new("", "pods", "list"))
            .await;
        assert!(matches!(result, Err(Error::BackendUnavailable(_))));
    }

    #[test]
    fn empty_namespace_means_cluster_scope() {
        let request = ReviewRequest::new("", "pods", "get").in_namespace("");
        assert!(request.is_cluster_scope());
        assert!(!request.in_namespace("a").is_cluster_scope());
    }
}
