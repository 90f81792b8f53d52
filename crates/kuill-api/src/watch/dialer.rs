//! Backend watch connections

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use futures::{Stream, StreamExt, TryStreamExt};
use kuill_common::KindDescriptor;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::backend::{BackendClient, BackendRequest};

/// Longest single watch event accepted from the backend
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One backend watch: a kind at cluster or namespace scope
#[derive(Debug, Clone)]
pub struct WatchTarget {
    /// Kind being watched
    pub kind: Arc<KindDescriptor>,
    /// Namespace, or `None` for cluster scope
    pub namespace: Option<String>,
    /// Resource version to resume from; empty starts from now
    pub resource_version: String,
}

impl WatchTarget {
    /// Cluster-scope watch of `kind`
    pub fn cluster(kind: Arc<KindDescriptor>, resource_version: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: None,
            resource_version: resource_version.into(),
        }
    }

    /// Watch of `kind` in one namespace
    pub fn namespaced(
        kind: Arc<KindDescriptor>,
        namespace: impl Into<String>,
        resource_version: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            namespace: Some(namespace.into()),
            resource_version: resource_version.into(),
        }
    }

    /// Whether this watch covers every namespace
    pub fn is_cluster_scope(&self) -> bool {
        self.namespace.is_none()
    }

    /// Split a cluster-scope watch of a namespaced kind into one per namespace
    pub fn expand(&self, namespaces: &[String]) -> Vec<WatchTarget> {
        if !self.is_cluster_scope() || !self.kind.namespaced {
            return Vec::new();
        }
        namespaces
            .iter()
            .map(|ns| Self::namespaced(self.kind.clone(), ns.clone(), self.resource_version.clone()))
            .collect()
    }

    /// Backend path and query for the watch request
    pub fn path_and_query(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair("watch", "true");
        if !self.resource_version.is_empty() {
            query.append_pair("resourceVersion", &self.resource_version);
        }
        format!("{}?{}", self.kind.path(self.namespace.as_deref()), query.finish())
    }
}

impl std::fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.kind.kind),
            None => write!(f, "{} (cluster)", self.kind.kind),
        }
    }
}

/// Stream of newline-delimited watch events
pub type FrameStream = Pin<Box<dyn Stream<Item = std::io::Result<String>> + Send>>;

/// Why a watch could not be opened
#[derive(Debug, Clone, thiserror::Error)]
pub enum DialError {
    /// The caller may not watch this target
    #[error("watch denied: {0}")]
    Denied(String),

    /// The backend could not serve the watch
    #[error("watch unavailable: {0}")]
    Unavailable(String),
}

/// Opens watch streams against the backend
#[async_trait]
pub trait WatchDialer: Send + Sync {
    /// Open a watch; `headers` carry identity and forwarding information
    async fn dial(&self, target: &WatchTarget, headers: &HeaderMap) -> Result<FrameStream, DialError>;
}

/// [`WatchDialer`] that issues streaming `?watch=true` requests
pub struct BackendWatchDialer {
    backend: Arc<dyn BackendClient>,
}

impl BackendWatchDialer {
    /// Dial through `backend`
    pub fn new(backend: Arc<dyn BackendClient>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl WatchDialer for BackendWatchDialer {
    async fn dial(&self, target: &WatchTarget, headers: &HeaderMap) -> Result<FrameStream, DialError> {
        let mut headers = headers.clone();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        let request = BackendRequest::get(target.path_and_query(), headers);

        let response = self
            .backend
            .request_streaming(request)
            .await
            .map_err(|e| DialError::Unavailable(e.to_string()))?;

        match response.status {
            status if status.is_success() => {
                debug!(target = %target, "Opened backend watch");
                let lines = FramedRead::new(
                    StreamReader::new(response.stream),
                    LinesCodec::new_with_max_length(MAX_FRAME_LEN),
                )
                .map_err(std::io::Error::other)
                .try_filter(|line| futures::future::ready(!line.trim().is_empty()));
                Ok(Box::pin(lines))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(DialError::Denied(format!("{} returned {}", target, response.status)))
            }
            status => Err(DialError::Unavailable(format!("{} returned {}", target, status))),
        }
    }
}

/// Adapt any stream of lines into a [`FrameStream`]
pub fn frames<S>(stream: S) -> FrameStream
where
    S: Stream<Item = std::io::Result<String>> + Send + 'static,
{
    stream.boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackendClient, StreamingResponse};
    use crate::error::Error;
    use axum::body::Bytes;

    fn pods() -> Arc<KindDescriptor> {
        Arc::new(KindDescriptor::new(
            "Pod",
            "pods",
            "",
            "v1",
            true,
            ["get", "list", "watch"],
        ))
    }

    fn nodes() -> Arc<KindDescriptor> {
        Arc::new(KindDescriptor::new("Node", "nodes", "", "v1", false, ["list", "watch"]))
    }

    fn streaming(status: StatusCode, chunks: Vec<&'static str>) -> StreamingResponse {
        let stream = futures::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c.as_bytes()))));
        StreamingResponse {
            status,
            headers: HeaderMap::new(),
            stream: Box::pin(stream),
        }
    }

    #[test]
    fn builds_watch_paths() {
        assert_eq!(
            WatchTarget::namespaced(pods(), "a", "12").path_and_query(),
            "/api/v1/namespaces/a/pods?watch=true&resourceVersion=12"
        );
        assert_eq!(
            WatchTarget::cluster(pods(), "").path_and_query(),
            "/api/v1/pods?watch=true"
        );
    }

    #[test]
    fn only_cluster_scope_namespaced_kinds_expand() {
        let namespaces = vec!["a".to_string(), "b".to_string()];

        let expanded = WatchTarget::cluster(pods(), "3").expand(&namespaces);
        let scopes: Vec<_> = expanded.iter().map(|t| t.namespace.clone()).collect();
        assert_eq!(scopes, vec![Some("a".to_string()), Some("b".to_string())]);
        assert!(expanded.iter().all(|t| t.resource_version == "3"));

        assert!(WatchTarget::cluster(nodes(), "").expand(&namespaces).is_empty());
        assert!(WatchTarget::namespaced(pods(), "a", "").expand(&namespaces).is_empty());
    }

    #[tokio::test]
    async fn splits_chunked_body_into_events() {
        let mut backend = MockBackendClient::new();
        backend
            .expect_request_streaming()
            .withf(|req| req.path_and_query == "/api/v1/namespaces/a/pods?watch=true&resourceVersion=5")
            .returning(|_| {
                Ok(streaming(
                    StatusCode::OK,
                    vec!["{\"type\":\"ADDED\"}\n{\"ty", "pe\":\"MODIFIED\"}\n\n"],
                ))
            });
        let dialer = BackendWatchDialer::new(Arc::new(backend));

        let frames: Vec<String> = dialer
            .dial(&WatchTarget::namespaced(pods(), "a", "5"), &HeaderMap::new())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(frames, vec![r#"{"type":"ADDED"}"#, r#"{"type":"MODIFIED"}"#]);
    }

    #[tokio::test]
    async fn classifies_backend_refusals() {
        let mut backend = MockBackendClient::new();
        backend
            .expect_request_streaming()
            .withf(|req| req.path_and_query.contains("/namespaces/"))
            .returning(|_| Ok(streaming(StatusCode::FORBIDDEN, vec![])));
        backend
            .expect_request_streaming()
            .withf(|req| req.path_and_query.starts_with("/api/v1/pods"))
            .returning(|_| Ok(streaming(StatusCode::INTERNAL_SERVER_ERROR, vec![])));
        backend
            .expect_request_streaming()
            .returning(|_| Err(Error::BackendUnavailable("connection refused".into())));
        let dialer = BackendWatchDialer::new(Arc::new(backend));
        let headers = HeaderMap::new();

        let denied = dialer.dial(&WatchTarget::namespaced(pods(), "a", ""), &headers).await;
        assert!(matches!(denied, Err(DialError::Denied(_))));

        let failed = dialer.dial(&WatchTarget::cluster(pods(), ""), &headers).await;
        assert!(matches!(failed, Err(DialError::Unavailable(_))));

        let unreachable = dialer.dial(&WatchTarget::cluster(nodes(), ""), &headers).await;
        assert!(matches!(unreachable, Err(DialError::Unavailable(msg)) if msg.contains("refused")));
    }
}
