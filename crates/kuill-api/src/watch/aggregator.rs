//! Multiplexes many backend watches onto one client WebSocket
//!
//! Dials run concurrently in a fan-out group. A cluster-scope dial that is
//! denied for a namespaced kind is retried once per known namespace; denial
//! at namespace scope is final. The client is upgraded as soon as the first
//! source connects; later sources join the stream as their dials complete.
//!
//! Every source gets a reader task that copies frames into one bounded
//! queue. A single writer drains the queue into the socket, so frames from
//! different sources are never interleaved mid-message. The writer also
//! answers pings and watches for the client going away, at which point every
//! reader and pending dial is cancelled.

use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::http::HeaderMap;
use futures::{Sink, SinkExt, Stream, StreamExt};
use kuill_common::{fan_out, Collector, NamespaceSet, Spawner};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use super::dialer::{DialError, FrameStream, WatchDialer, WatchTarget};
use crate::error::{Error, Result};

/// Default number of frames buffered between readers and the writer
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// What the client sees when one source fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SourceFailurePolicy {
    /// Log and drop the source silently
    #[default]
    Drop,
    /// Also send a watch `ERROR` event describing the failure
    Notify,
}

impl FromStr for SourceFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "notify" => Ok(Self::Notify),
            other => Err(format!("unknown source failure policy '{}' (expected drop or notify)", other)),
        }
    }
}

/// Aggregator settings
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Frames buffered before readers apply backpressure
    pub queue_capacity: usize,
    /// Treatment of failed sources
    pub failure_policy: SourceFailurePolicy,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            failure_policy: SourceFailurePolicy::default(),
        }
    }
}

enum DialOutcome {
    Connected { target: WatchTarget, frames: FrameStream },
    Failed { target: WatchTarget, error: DialError },
}

struct DialContext {
    dialer: Arc<dyn WatchDialer>,
    headers: HeaderMap,
    namespaces: Arc<Vec<String>>,
}

/// Opens aggregated watch streams
pub struct WatchAggregator {
    dialer: Arc<dyn WatchDialer>,
    namespaces: Arc<NamespaceSet>,
    config: AggregatorConfig,
}

impl WatchAggregator {
    /// Create an aggregator expanding denied watches over `namespaces`
    pub fn new(dialer: Arc<dyn WatchDialer>, namespaces: Arc<NamespaceSet>, config: AggregatorConfig) -> Self {
        Self {
            dialer,
            namespaces,
            config,
        }
    }

    /// Aggregator settings
    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Dial every target and wait for the first one to connect
    ///
    /// Fails with [`Error::BackendUnavailable`] when no source connects.
    /// Dials still in flight keep running and join the returned stream.
    pub async fn connect(&self, targets: Vec<WatchTarget>, headers: HeaderMap) -> Result<AggregatedStream> {
        let cancel = CancellationToken::new();
        let (spawner, mut collector) = fan_out::<DialOutcome>(cancel.child_token());
        let ctx = Arc::new(DialContext {
            dialer: self.dialer.clone(),
            headers,
            namespaces: self.namespaces.snapshot().await,
        });

        let requested = targets.len();
        for target in targets {
            spawn_dial(&spawner, ctx.clone(), target);
        }
        spawner.finish();

        let mut failures = Vec::new();
        while let Some(outcome) = collector.next().await {
            match outcome {
                DialOutcome::Connected { target, frames } => {
                    debug!(target = %target, requested, "First watch source connected");
                    return Ok(AggregatedStream {
                        first: (target, frames),
                        pending: collector,
                        failures,
                        config: self.config.clone(),
                        cancel: cancel.clone(),
                        _guard: cancel.drop_guard(),
                    });
                }
                DialOutcome::Failed { target, error } => {
                    debug!(target = %target, error = %error, "Watch source failed to connect");
                    failures.push((target, error));
                }
            }
        }

        warn!(requested, failed = failures.len(), "No watch source could be opened");
        Err(Error::BackendUnavailable(format!(
            "none of the {} requested watches could be opened",
            requested
        )))
    }
}

fn spawn_dial(spawner: &Spawner<DialOutcome>, ctx: Arc<DialContext>, target: WatchTarget) {
    spawner.spawn(move |spawner| async move {
        match ctx.dialer.dial(&target, &ctx.headers).await {
            Ok(frames) => Some(DialOutcome::Connected { target, frames }),
            Err(DialError::Denied(reason)) if target.is_cluster_scope() && target.kind.namespaced => {
                let expanded = target.expand(&ctx.namespaces);
                debug!(
                    target = %target,
                    reason = %reason,
                    namespaces = expanded.len(),
                    "Cluster-scope watch denied, retrying per namespace"
                );
                for child in expanded {
                    spawn_dial(&spawner, ctx.clone(), child);
                }
                None
            }
            Err(error) => Some(DialOutcome::Failed { target, error }),
        }
    });
}

/// A connected aggregation ready to be pumped into a client socket
pub struct AggregatedStream {
    first: (WatchTarget, FrameStream),
    pending: Collector<DialOutcome>,
    failures: Vec<(WatchTarget, DialError)>,
    config: AggregatorConfig,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl AggregatedStream {
    /// Serve the aggregation over an upgraded WebSocket
    pub async fn run(self, socket: WebSocket) {
        let (sink, stream) = socket.split();
        self.pump(sink, stream).await;
    }

    /// Copy frames into `sink` until the client or every source goes away
    pub(crate) async fn pump<Si, St>(self, mut sink: Si, mut client: St)
    where
        Si: Sink<Message> + Unpin,
        Si::Error: Display,
        St: Stream<Item = std::result::Result<Message, axum::Error>> + Unpin,
    {
        let AggregatedStream {
            first,
            pending,
            failures,
            config,
            cancel,
            _guard,
        } = self;
        let policy = config.failure_policy;
        let (frame_tx, mut frame_rx) = mpsc::channel::<String>(config.queue_capacity.max(1));

        let mut early_errors = Vec::new();
        if policy == SourceFailurePolicy::Notify {
            early_errors = failures.iter().map(|(t, e)| error_event(t, e)).collect();
        }

        spawn_reader(first.0, first.1, frame_tx.clone(), cancel.child_token(), policy);
        tokio::spawn(coordinate(pending, frame_tx, cancel.clone(), policy));

        for event in early_errors {
            if sink.send(Message::Text(event.into())).await.is_err() {
                return;
            }
        }

        let mut sent = 0usize;
        loop {
            tokio::select! {
                frame = frame_rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = sink.send(Message::Text(frame.into())).await {
                            debug!(error = %e, "Client socket closed while sending");
                            break;
                        }
                        sent += 1;
                    }
                    None => {
                        debug!("Every watch source has closed");
                        break;
                    }
                },
                msg = client.next() => match msg {
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Client closed aggregated watch");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "Client socket error");
                        break;
                    }
                },
            }
        }

        cancel.cancel();
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "".into(),
            })))
            .await;
        info!(frames = sent, "Aggregated watch finished");
    }
}

/// Start readers for sources that connect after the client was upgraded
async fn coordinate(
    mut pending: Collector<DialOutcome>,
    frame_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    policy: SourceFailurePolicy,
) {
    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                pending.cancel();
                return;
            }
            outcome = pending.next() => outcome,
        };
        match outcome {
            Some(DialOutcome::Connected { target, frames }) => {
                debug!(target = %target, "Watch source joined");
                spawn_reader(target, frames, frame_tx.clone(), cancel.child_token(), policy);
            }
            Some(DialOutcome::Failed { target, error }) => {
                warn!(target = %target, error = %error, "Watch source failed to connect");
                if policy == SourceFailurePolicy::Notify {
                    send_or_cancel(&frame_tx, error_event(&target, &error), &cancel).await;
                }
            }
            None => return,
        }
    }
}

fn spawn_reader(
    target: WatchTarget,
    mut frames: FrameStream,
    frame_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    policy: SourceFailurePolicy,
) {
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = frames.next() => next,
            };
            match next {
                Some(Ok(frame)) => {
                    if !send_or_cancel(&frame_tx, frame, &cancel).await {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(target = %target, error = %e, "Watch source failed");
                    if policy == SourceFailurePolicy::Notify {
                        let error = DialError::Unavailable(e.to_string());
                        send_or_cancel(&frame_tx, error_event(&target, &error), &cancel).await;
                    }
                    break;
                }
                None => {
                    debug!(target = %target, "Watch source closed");
                    break;
                }
            }
        }
    });
}

/// Queue a frame unless the aggregation is torn down first
async fn send_or_cancel(tx: &mpsc::Sender<String>, frame: String, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(frame) => sent.is_ok(),
    }
}

/// Watch `ERROR` event carrying a Status object
pub(crate) fn error_event(target: &WatchTarget, error: &DialError) -> String {
    let code = match error {
        DialError::Denied(_) => 403,
        DialError::Unavailable(_) => 502,
    };
    serde_json::json!({
        "type": "ERROR",
        "object": {
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": format!("{}: {}", target, error),
            "reason": "WatchSourceFailed",
            "details": {
                "kind": target.kind.kind,
                "name": target.namespace.clone().unwrap_or_default(),
            },
            "code": code,
        }
    })
    .to_string()
}
