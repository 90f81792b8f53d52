//! Two-phase multi-watch handshake
//!
//! A browser cannot send a body with a WebSocket handshake, so a watch
//! specification is registered first with a plain POST and carried to the
//! streaming GET in three cookies:
//!
//! | cookie                  | contents                                     |
//! |-------------------------|----------------------------------------------|
//! | `multiwatch.kinds`      | `["{kind}:{resourceRevision}", ...]`         |
//! | `multiwatch.namespaces` | deduplicated namespace names                 |
//! | `multiwatch.nsByKind`   | per kind, indices into the namespace list    |
//!
//! Each cookie value is `v1.` followed by base64url-encoded JSON. Decoding
//! checks the version, that every kind has an index list, and that every
//! index is in range.

use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cookie::{Cookie, SameSite};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::auth::request_cookie;
use crate::error::{Error, Result};

/// Cookie holding the kinds list
pub const KINDS_COOKIE: &str = "multiwatch.kinds";
/// Cookie holding the namespaces list
pub const NAMESPACES_COOKIE: &str = "multiwatch.namespaces";
/// Cookie holding the namespace indices per kind
pub const NS_BY_KIND_COOKIE: &str = "multiwatch.nsByKind";

/// Encoding version prefix
const TOKEN_VERSION: &str = "v1";

/// Largest encoded cookie value browsers reliably keep
const MAX_TOKEN_LEN: usize = 4000;

/// Longest namespace name the backend accepts
const MAX_NAMESPACE_LEN: usize = 63;

/// A multi-watch request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchSpec {
    /// Kinds to watch, each with its namespaces
    pub watches: Vec<NamespacedKind>,
}

/// One kind and the namespaces to watch it in
///
/// An empty namespace list means cluster scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedKind {
    /// Kind name
    pub kind: String,
    /// Resource version to resume from
    #[serde(deserialize_with = "revision_from_number_or_string", default)]
    pub resource_revision: String,
    /// Namespaces, in order
    #[serde(default)]
    pub namespaces: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Revision {
    Number(u64),
    Text(String),
}

fn revision_from_number_or_string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    Ok(match Revision::deserialize(d)? {
        Revision::Number(n) => n.to_string(),
        Revision::Text(s) => s,
    })
}

impl WatchSpec {
    /// Reject names that could not be a valid kind, revision or namespace
    pub fn validate(&self) -> Result<()> {
        for watch in &self.watches {
            if watch.kind.is_empty() || watch.kind.contains(':') {
                return Err(Error::Protocol(format!("invalid kind '{}'", watch.kind)));
            }
            if !watch.resource_revision.chars().all(|c| c.is_ascii_digit()) {
                return Err(Error::Protocol(format!(
                    "invalid resource revision '{}'",
                    watch.resource_revision
                )));
            }
            for ns in &watch.namespaces {
                if !is_namespace_name(ns) {
                    return Err(Error::Protocol(format!("invalid namespace '{}'", ns)));
                }
            }
        }
        Ok(())
    }
}

/// Whether `name` is a DNS-1123 label
fn is_namespace_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAMESPACE_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

/// The three compact artifacts a [`WatchSpec`] is split into
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationTokens {
    /// `"{kind}:{resourceRevision}"` per watch
    pub kinds: Vec<String>,
    /// Every distinct namespace, in first-seen order
    pub namespaces: Vec<String>,
    /// For each kind, indices into `namespaces`
    pub ns_by_kind: Vec<Vec<usize>>,
}

impl CorrelationTokens {
    /// Split a spec, deduplicating namespaces
    pub fn encode(spec: &WatchSpec) -> Self {
        let mut namespaces: Vec<String> = Vec::new();
        let mut kinds = Vec::with_capacity(spec.watches.len());
        let mut ns_by_kind = Vec::with_capacity(spec.watches.len());

        for watch in &spec.watches {
            kinds.push(format!("{}:{}", watch.kind, watch.resource_revision));
            let mut indices: Vec<usize> = Vec::with_capacity(watch.namespaces.len());
            for ns in &watch.namespaces {
                let index = match namespaces.iter().position(|n| n == ns) {
                    Some(i) => i,
                    None => {
                        namespaces.push(ns.clone());
                        namespaces.len() - 1
                    }
                };
                if !indices.contains(&index) {
                    indices.push(index);
                }
            }
            ns_by_kind.push(indices);
        }

        Self {
            kinds,
            namespaces,
            ns_by_kind,
        }
    }

    /// Rebuild the spec, validating sizes and indices
    pub fn decode(&self) -> Result<WatchSpec> {
        if self.kinds.len() != self.ns_by_kind.len() {
            return Err(Error::Protocol(format!(
                "{} kinds but {} namespace index lists",
                self.kinds.len(),
                self.ns_by_kind.len()
            )));
        }

        let mut watches = Vec::with_capacity(self.kinds.len());
        for (entry, indices) in self.kinds.iter().zip(&self.ns_by_kind) {
            let (kind, revision) = entry
                .split_once(':')
                .ok_or_else(|| Error::Protocol(format!("malformed kind entry '{}'", entry)))?;
            let namespaces = indices
                .iter()
                .map(|&i| {
                    self.namespaces.get(i).cloned().ok_or_else(|| {
                        Error::Protocol(format!("namespace index {} out of range", i))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            watches.push(NamespacedKind {
                kind: kind.to_string(),
                resource_revision: revision.to_string(),
                namespaces,
            });
        }

        let spec = WatchSpec { watches };
        spec.validate()?;
        Ok(spec)
    }

    /// Cookies scoped to `path` carrying these tokens
    pub fn to_cookies(&self, path: &str, secure: bool) -> Result<Vec<Cookie<'static>>> {
        let build = |name: &'static str, value: String| {
            Cookie::build((name, value))
                .path(path.to_string())
                .http_only(true)
                .secure(secure)
                .same_site(SameSite::Strict)
                .build()
        };
        Ok(vec![
            build(KINDS_COOKIE, encode_part(&self.kinds)?),
            build(NAMESPACES_COOKIE, encode_part(&self.namespaces)?),
            build(NS_BY_KIND_COOKIE, encode_part(&self.ns_by_kind)?),
        ])
    }

    /// Read the tokens from request cookies
    pub fn from_headers(headers: &HeaderMap) -> Result<Self> {
        let cookie = |name: &str| {
            request_cookie(headers, name)
                .ok_or_else(|| Error::Protocol(format!("missing '{}' cookie", name)))
        };
        Ok(Self {
            kinds: decode_part(KINDS_COOKIE, &cookie(KINDS_COOKIE)?)?,
            namespaces: decode_part(NAMESPACES_COOKIE, &cookie(NAMESPACES_COOKIE)?)?,
            ns_by_kind: decode_part(NS_BY_KIND_COOKIE, &cookie(NS_BY_KIND_COOKIE)?)?,
        })
    }
}

fn encode_part<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value)?;
    let token = format!("{}.{}", TOKEN_VERSION, URL_SAFE_NO_PAD.encode(json));
    if token.len() > MAX_TOKEN_LEN {
        return Err(Error::Protocol(format!(
            "watch specification too large ({} bytes encoded)",
            token.len()
        )));
    }
    Ok(token)
}

fn decode_part<T: DeserializeOwned>(name: &str, token: &str) -> Result<T> {
    let payload = token
        .strip_prefix(TOKEN_VERSION)
        .and_then(|rest| rest.strip_prefix('.'))
        .ok_or_else(|| Error::Protocol(format!("'{}' has an unsupported encoding", name)))?;
    let json = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| Error::Protocol(format!("'{}' is not valid base64: {}", name, e)))?;
    serde_json::from_slice(&json)
        .map_err(|e| Error::Protocol(format!("'{}' is malformed: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::COOKIE;
    use axum::http::HeaderValue;

    fn example_spec() -> WatchSpec {
        serde_json::from_str(
            r#"{"watches":[
                {"kind":"Pod","resourceRevision":0,"namespaces":["a","b"]},
                {"kind":"Service","resourceRevision":0,"namespaces":["a"]}
            ]}"#,
        )
        .unwrap()
    }

    fn as_request_headers(cookies: &[Cookie<'static>]) -> HeaderMap {
        let joined = cookies
            .iter()
            .map(|c| format!("{}={}", c.name(), c.value()))
            .collect::<Vec<_>>()
            .join("; ");
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(&joined).unwrap());
        headers
    }

    #[test]
    fn splits_example_into_compact_artifacts() {
        let tokens = CorrelationTokens::encode(&example_spec());

        assert_eq!(tokens.kinds, vec!["Pod:0", "Service:0"]);
        assert_eq!(tokens.namespaces, vec!["a", "b"]);
        assert_eq!(tokens.ns_by_kind, vec![vec![0, 1], vec![0]]);
    }

    #[test]
    fn example_survives_cookie_round_trip() {
        let spec = example_spec();
        let cookies = CorrelationTokens::encode(&spec)
            .to_cookies("/proxy/multiwatch", true)
            .unwrap();

        let decoded = CorrelationTokens::from_headers(&as_request_headers(&cookies))
            .unwrap()
            .decode()
            .unwrap();

        assert_eq!(decoded, spec);
        assert_eq!(decoded.watches[0].namespaces, vec!["a", "b"]);
        assert_eq!(decoded.watches[1].namespaces, vec!["a"]);
    }

    #[test]
    fn overlapping_namespaces_keep_per_kind_order() {
        let spec = WatchSpec {
            watches: vec![
                NamespacedKind {
                    kind: "Pod".into(),
                    resource_revision: "41".into(),
                    namespaces: vec!["c".into(), "a".into()],
                },
                NamespacedKind {
                    kind: "Secret".into(),
                    resource_revision: "".into(),
                    namespaces: vec!["a".into(), "b".into(), "c".into()],
                },
                NamespacedKind {
                    kind: "Node".into(),
                    resource_revision: "7".into(),
                    namespaces: vec![],
                },
            ],
        };

        let tokens = CorrelationTokens::encode(&spec);
        assert_eq!(tokens.namespaces, vec!["c", "a", "b"]);
        assert_eq!(tokens.ns_by_kind, vec![vec![0, 1], vec![1, 2, 0], vec![]]);
        assert_eq!(tokens.decode().unwrap(), spec);
    }

    #[test]
    fn cookies_are_scoped_to_aggregation_path() {
        let cookies = CorrelationTokens::encode(&example_spec())
            .to_cookies("/proxy/multiwatch", false)
            .unwrap();

        let names: Vec<_> = cookies.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec![KINDS_COOKIE, NAMESPACES_COOKIE, NS_BY_KIND_COOKIE]);
        for cookie in &cookies {
            assert_eq!(cookie.path(), Some("/proxy/multiwatch"));
            assert_eq!(cookie.http_only(), Some(true));
            assert!(cookie.value().starts_with("v1."));
        }
    }

    #[test]
    fn missing_cookie_is_protocol_error() {
        let cookies = CorrelationTokens::encode(&example_spec())
            .to_cookies("/", false)
            .unwrap();
        let err = CorrelationTokens::from_headers(&as_request_headers(&cookies[..2])).unwrap_err();
        assert!(matches!(err, Error::Protocol(msg) if msg.contains(NS_BY_KIND_COOKIE)));
    }

    #[test]
    fn malformed_cookie_values_are_protocol_errors() {
        for bad in ["Pod:0,Service:0", "v2.W10", "v1.!!!", "v1.eyJ4Ijox"] {
            assert!(matches!(
                decode_part::<Vec<String>>(KINDS_COOKIE, bad),
                Err(Error::Protocol(_))
            ));
        }
    }

    #[test]
    fn inconsistent_tokens_are_rejected() {
        let out_of_range = CorrelationTokens {
            kinds: vec!["Pod:0".into()],
            namespaces: vec!["a".into()],
            ns_by_kind: vec![vec![3]],
        };
        assert!(out_of_range.decode().is_err());

        let arity = CorrelationTokens {
            kinds: vec!["Pod:0".into(), "Service:0".into()],
            namespaces: vec![],
            ns_by_kind: vec![vec![]],
        };
        assert!(arity.decode().is_err());

        let no_revision = CorrelationTokens {
            kinds: vec!["Pod".into()],
            namespaces: vec![],
            ns_by_kind: vec![vec![]],
        };
        assert!(no_revision.decode().is_err());
    }

    #[test]
    fn rejects_unsafe_namespace_names() {
        for ns in ["../secrets", "Default", "", "-a", &"x".repeat(64)] {
            let spec = WatchSpec {
                watches: vec![NamespacedKind {
                    kind: "Pod".into(),
                    resource_revision: "0".into(),
                    namespaces: vec![ns.to_string()],
                }],
            };
            assert!(spec.validate().is_err(), "accepted {:?}", ns);
        }
    }

    #[test]
    fn oversized_spec_is_rejected() {
        let spec = WatchSpec {
            watches: (0..400)
                .map(|i| NamespacedKind {
                    kind: format!("Kind{}", i),
                    resource_revision: "0".into(),
                    namespaces: vec![],
                })
                .collect(),
        };
        assert!(CorrelationTokens::encode(&spec).to_cookies("/", false).is_err());
    }
}
