//! Aggregated watch streams
//!
//! - `protocol`: the cookie-carried correlation tokens of the two-phase handshake
//! - `dialer`: opens one backend watch per kind and namespace
//! - `aggregator`: merges every open watch into one client WebSocket
//! - `handlers`: the registration, streaming and watch-all endpoints

mod aggregator;
mod dialer;
mod handlers;
mod protocol;

pub use aggregator::{
    AggregatedStream, AggregatorConfig, SourceFailurePolicy, WatchAggregator, DEFAULT_QUEUE_CAPACITY,
};
pub use dialer::{frames, BackendWatchDialer, DialError, FrameStream, WatchDialer, WatchTarget};
pub use handlers::{multiwatch_register_handler, multiwatch_stream_handler, resolve_targets, watch_all_handler};
pub use protocol::{
    CorrelationTokens, NamespacedKind, WatchSpec, KINDS_COOKIE, NAMESPACES_COOKIE, NS_BY_KIND_COOKIE,
};

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
