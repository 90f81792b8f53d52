use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::Message;
use axum::http::HeaderMap;
use futures::channel::mpsc as client_channel;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::*;
use crate::error::Error;
use crate::test_support::{kind_catalog, namespace_set};

// =============================================================================
// Scripted dialer
// =============================================================================

enum Script {
    Deny,
    Fail,
    Lines(Vec<String>),
    Live(mpsc::Receiver<String>),
}

#[derive(Default)]
struct FakeDialer {
    scripts: Mutex<HashMap<String, Script>>,
    dialed: Mutex<Vec<String>>,
}

impl FakeDialer {
    fn script(self, key: &str, script: Script) -> Self {
        self.scripts.lock().unwrap().insert(key.to_string(), script);
        self
    }

    fn lines(self, key: &str, lines: &[&str]) -> Self {
        self.script(key, Script::Lines(lines.iter().map(|l| l.to_string()).collect()))
    }

    fn live(self, key: &str) -> (Self, mpsc::Sender<String>) {
        let (tx, rx) = mpsc::channel(8);
        (self.script(key, Script::Live(rx)), tx)
    }

    fn dialed(&self) -> BTreeSet<String> {
        self.dialed.lock().unwrap().iter().cloned().collect()
    }
}

#[async_trait]
impl WatchDialer for FakeDialer {
    async fn dial(&self, target: &WatchTarget, _headers: &HeaderMap) -> Result<FrameStream, DialError> {
        let key = target.to_string();
        self.dialed.lock().unwrap().push(key.clone());
        let script = self.scripts.lock().unwrap().remove(&key);
        match script {
            Some(Script::Deny) => Err(DialError::Denied(key)),
            Some(Script::Fail) | None => Err(DialError::Unavailable(key)),
            Some(Script::Lines(lines)) => Ok(frames(futures::stream::iter(lines.into_iter().map(Ok)))),
            Some(Script::Live(rx)) => Ok(frames(ReceiverStream::new(rx).map(Ok))),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn pod(namespace: Option<&str>) -> WatchTarget {
    kind_target("Pod", namespace).await
}

async fn kind_target(kind: &str, namespace: Option<&str>) -> WatchTarget {
    let kind = kind_catalog().get(kind).await.unwrap();
    match namespace {
        Some(ns) => WatchTarget::namespaced(kind, ns, "0"),
        None => WatchTarget::cluster(kind, "0"),
    }
}

fn aggregator(dialer: Arc<FakeDialer>, policy: SourceFailurePolicy) -> WatchAggregator {
    WatchAggregator::new(
        dialer,
        namespace_set(&["a", "b"]),
        AggregatorConfig {
            queue_capacity: 4,
            failure_policy: policy,
        },
    )
}

struct Client {
    outbound: client_channel::Receiver<Message>,
    inbound: client_channel::Sender<Result<Message, axum::Error>>,
    task: tokio::task::JoinHandle<()>,
}

fn serve(stream: AggregatedStream) -> Client {
    let (sink, outbound) = client_channel::channel(64);
    let (inbound, client) = client_channel::channel(8);
    let task = tokio::spawn(stream.pump(sink, client));
    Client {
        outbound,
        inbound,
        task,
    }
}

/// Text frames received before the server closed the socket
async fn drain(client: &mut Client) -> Vec<String> {
    let mut texts = Vec::new();
    while let Some(message) = client.outbound.next().await {
        match message {
            Message::Text(text) => texts.push(text.as_str().to_string()),
            Message::Close(_) => break,
            _ => {}
        }
    }
    texts
}

// =============================================================================
// Aggregation
// =============================================================================

#[tokio::test]
async fn continues_with_sources_that_connect() {
    let dialer = Arc::new(
        FakeDialer::default()
            .lines("a/Pod", &["pod-1", "pod-2"])
            .script("b/Pod", Script::Fail)
            .lines("a/Service", &["svc-1"]),
    );
    let targets = vec![
        pod(Some("a")).await,
        pod(Some("b")).await,
        kind_target("Service", Some("a")).await,
    ];

    let stream = aggregator(dialer, SourceFailurePolicy::Drop)
        .connect(targets, HeaderMap::new())
        .await
        .unwrap();
    let mut client = serve(stream);
    let frames = drain(&mut client).await;

    let received: BTreeSet<_> = frames.iter().cloned().collect();
    let expected: BTreeSet<_> = ["pod-1", "pod-2", "svc-1"].iter().map(|s| s.to_string()).collect();
    assert_eq!(received, expected);
    assert_eq!(frames.len(), 3);

    let first = frames.iter().position(|f| f == "pod-1").unwrap();
    let second = frames.iter().position(|f| f == "pod-2").unwrap();
    assert!(first < second, "per-source order must be preserved");

    client.task.await.unwrap();
}

#[tokio::test]
async fn fails_when_no_source_connects() {
    let dialer = Arc::new(
        FakeDialer::default()
            .script("a/Pod", Script::Fail)
            .script("b/Pod", Script::Deny),
    );
    let result = aggregator(dialer, SourceFailurePolicy::Drop)
        .connect(vec![pod(Some("a")).await, pod(Some("b")).await], HeaderMap::new())
        .await;

    assert!(matches!(result, Err(Error::BackendUnavailable(_))));
}

#[tokio::test]
async fn cluster_denial_expands_per_namespace() {
    let dialer = Arc::new(
        FakeDialer::default()
            .script("Pod (cluster)", Script::Deny)
            .lines("a/Pod", &["from-a"])
            .lines("b/Pod", &["from-b"]),
    );

    let stream = aggregator(dialer.clone(), SourceFailurePolicy::Drop)
        .connect(vec![pod(None).await], HeaderMap::new())
        .await
        .unwrap();
    let mut client = serve(stream);
    let mut frames = drain(&mut client).await;
    frames.sort();

    assert_eq!(frames, vec!["from-a", "from-b"]);
    let dialed: Vec<_> = dialer.dialed().into_iter().collect();
    assert_eq!(dialed, vec!["Pod (cluster)", "a/Pod", "b/Pod"]);
}

#[tokio::test]
async fn namespace_denial_is_final() {
    let dialer = Arc::new(
        FakeDialer::default()
            .script("a/Pod", Script::Deny)
            .lines("b/Pod", &["from-b"]),
    );

    let stream = aggregator(dialer.clone(), SourceFailurePolicy::Drop)
        .connect(vec![pod(Some("a")).await, pod(Some("b")).await], HeaderMap::new())
        .await
        .unwrap();
    let mut client = serve(stream);

    assert_eq!(drain(&mut client).await, vec!["from-b"]);
    assert_eq!(dialer.dialed.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn cluster_scoped_kind_denial_is_final() {
    let dialer = Arc::new(
        FakeDialer::default()
            .script("Node (cluster)", Script::Deny)
            .lines("a/Pod", &["pod"]),
    );

    let stream = aggregator(dialer.clone(), SourceFailurePolicy::Drop)
        .connect(vec![kind_target("Node", None).await, pod(Some("a")).await], HeaderMap::new())
        .await
        .unwrap();
    let mut client = serve(stream);

    assert_eq!(drain(&mut client).await, vec!["pod"]);
    assert_eq!(dialer.dialed.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn notify_policy_reports_failed_sources() {
    let dialer = Arc::new(
        FakeDialer::default()
            .lines("a/Pod", &["pod-1"])
            .script("b/Pod", Script::Fail),
    );

    let stream = aggregator(dialer, SourceFailurePolicy::Notify)
        .connect(vec![pod(Some("a")).await, pod(Some("b")).await], HeaderMap::new())
        .await
        .unwrap();
    let mut client = serve(stream);
    let frames = drain(&mut client).await;

    assert_eq!(frames.len(), 2);
    assert!(frames.contains(&"pod-1".to_string()));
    let error: serde_json::Value = frames
        .iter()
        .find(|f| f.starts_with('{'))
        .map(|f| serde_json::from_str(f).unwrap())
        .unwrap();
    assert_eq!(error["type"], "ERROR");
    assert_eq!(error["object"]["kind"], "Status");
    assert_eq!(error["object"]["code"], 502);
    assert_eq!(error["object"]["details"]["name"], "b");
}

#[tokio::test]
async fn client_disconnect_stops_every_reader() {
    let (dialer, pods_a) = FakeDialer::default().live("a/Pod");
    let (dialer, pods_b) = dialer.live("b/Pod");
    let dialer = Arc::new(dialer);

    let stream = aggregator(dialer, SourceFailurePolicy::Drop)
        .connect(vec![pod(Some("a")).await, pod(Some("b")).await], HeaderMap::new())
        .await
        .unwrap();
    let mut client = serve(stream);

    pods_a.send("hello".into()).await.unwrap();
    match client.outbound.next().await {
        Some(Message::Text(text)) => assert_eq!(text.as_str(), "hello"),
        other => panic!("unexpected message: {:?}", other),
    }

    client.inbound.send(Ok(Message::Close(None))).await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), client.task)
        .await
        .expect("writer did not stop")
        .unwrap();

    for source in [&pods_a, &pods_b] {
        tokio::time::timeout(Duration::from_secs(1), source.closed())
            .await
            .expect("backend reader left running");
    }
}

#[tokio::test]
async fn answers_pings_while_streaming() {
    let (dialer, _pods) = FakeDialer::default().live("a/Pod");
    let stream = aggregator(Arc::new(dialer), SourceFailurePolicy::Drop)
        .connect(vec![pod(Some("a")).await], HeaderMap::new())
        .await
        .unwrap();
    let mut client = serve(stream);

    client
        .inbound
        .send(Ok(Message::Ping(Bytes::from_static(b"hi"))))
        .await
        .unwrap();
    match client.outbound.next().await {
        Some(Message::Pong(payload)) => assert_eq!(&payload[..], b"hi"),
        other => panic!("unexpected message: {:?}", other),
    }

    drop(client.inbound);
    tokio::time::timeout(Duration::from_secs(1), client.task)
        .await
        .expect("writer did not stop")
        .unwrap();
}

// =============================================================================
// Target resolution
// =============================================================================

fn spec(watches: &[(&str, &[&str])]) -> WatchSpec {
    WatchSpec {
        watches: watches
            .iter()
            .map(|(kind, namespaces)| NamespacedKind {
                kind: kind.to_string(),
                resource_revision: "7".into(),
                namespaces: namespaces.iter().map(|n| n.to_string()).collect(),
            })
            .collect(),
    }
}

#[tokio::test]
async fn resolves_one_target_per_kind_and_namespace() {
    let kinds = kind_catalog().snapshot().await;
    let targets = resolve_targets(
        &spec(&[("Pod", &["a", "b", "a"]), ("Service", &[]), ("Node", &["a"])]),
        &kinds,
    )
    .unwrap();

    let described: Vec<_> = targets.iter().map(|t| t.to_string()).collect();
    assert_eq!(described, vec!["a/Pod", "b/Pod", "Service (cluster)", "Node (cluster)"]);
    assert!(targets.iter().all(|t| t.resource_version == "7"));
}

#[tokio::test]
async fn rejects_unknown_and_unwatchable_kinds() {
    let kinds = kind_catalog().snapshot().await;
    for kind in ["Widget", "ComponentStatus"] {
        let result = resolve_targets(&spec(&[(kind, &[])]), &kinds);
        assert!(matches!(result, Err(Error::Protocol(_))), "{} accepted", kind);
    }
}
