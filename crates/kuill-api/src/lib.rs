//! Kuill gateway core
//!
//! Authenticating gateway in front of the Kubernetes API:
//! - `auth`: signed cookie sessions and pluggable login methods
//! - `proxy`: reverse and upgrade proxying with identity injection
//! - `watch`: merges many backend watch streams into one client WebSocket
//! - `access`: resolves effective permissions with cluster to namespace fallback
//!
//! # Security
//!
//! Users never talk to the backend directly. Identity headers supplied by
//! the client are always stripped and replaced with headers derived from
//! the verified session.

#![deny(missing_docs)]

pub mod access;
pub mod auth;
pub mod backend;
pub mod error;
pub mod identity;
pub mod proxy;
pub mod server;
pub mod watch;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
pub use identity::{AuthContext, IdentityInjector, IdentityMode};
pub use server::{build_router, start_server, AppState, ClientAddr, ServerConfig, TlsPem};

/// Path prefix under which backend requests are proxied
pub const PROXY_BASE_PATH: &str = "/proxy";

/// Path of the two-phase multi-watch endpoint
pub const MULTIWATCH_PATH: &str = "/proxy/multiwatch";
