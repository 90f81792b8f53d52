//! Common types and utilities for kuill
//!
//! Holds the read-mostly snapshots the gateway consults on every request
//! (resource kinds and namespaces), the fan-out task group used by the
//! watch aggregator and the access resolver, and telemetry setup.

#![deny(missing_docs)]

pub mod error;
pub mod kinds;
pub mod namespaces;
pub mod refresh;
pub mod task_group;
pub mod telemetry;

pub use error::{Error, Result};
pub use kinds::{abbreviate, DiscoveryKindSource, KindCatalog, KindDescriptor, KindSnapshot, KindSource, ResourceGroup};
pub use namespaces::{KubeNamespaceSource, NamespaceSet, NamespaceSource};
pub use refresh::{spawn_refresher, Refreshable};
pub use task_group::{fan_out, Collector, Spawner};
pub use telemetry::{init_telemetry, LogFormat, TelemetryConfig, TelemetryError};

/// Default interval between kind catalog refreshes (10 minutes)
pub const DEFAULT_KINDS_REFRESH_SECS: u64 = 600;

/// Default interval between namespace list refreshes
pub const DEFAULT_NAMESPACES_REFRESH_SECS: u64 = 60;
