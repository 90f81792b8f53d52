//! Command line and environment configuration

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use zeroize::Zeroizing;

use kuill_api::auth::{OidcConfig, SessionConfig};
use kuill_api::backend::BackendConfig;
use kuill_api::identity::{DEFAULT_EXTRA_PREFIX, DEFAULT_GROUP_HEADER, DEFAULT_USER_HEADER};
use kuill_api::watch::{AggregatorConfig, SourceFailurePolicy, DEFAULT_QUEUE_CAPACITY};
use kuill_api::{IdentityMode, ServerConfig, TlsPem};
use kuill_common::{LogFormat, TelemetryConfig, DEFAULT_KINDS_REFRESH_SECS, DEFAULT_NAMESPACES_REFRESH_SECS};

const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// kuill - authenticating gateway for the Kubernetes API
#[derive(Parser, Debug)]
#[command(name = "kuill", version, about, long_about = None)]
pub struct Cli {
    /// Port to listen on
    #[arg(long, env = "KUILL_PORT", default_value_t = 8443)]
    pub port: u16,

    /// TLS certificate PEM for the listener
    #[arg(long, env = "KUILL_SERVER_CERT")]
    pub server_cert: Option<PathBuf>,

    /// TLS private key PEM for the listener
    #[arg(long, env = "KUILL_SERVER_KEY")]
    pub server_key: Option<PathBuf>,

    /// Serve plain HTTP (only behind a TLS-terminating proxy)
    #[arg(long, env = "KUILL_DISABLE_TLS")]
    pub disable_tls: bool,

    /// Kubernetes API URL; defaults to the in-cluster or kubeconfig server
    #[arg(long, env = "KUILL_KUBERNETES_API")]
    pub kubernetes_api: Option<String>,

    /// Kubeconfig used for discovery when not running in-cluster
    #[arg(long, env = "KUILL_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// CA bundle trusted for the Kubernetes API
    #[arg(long, env = "KUILL_KUBERNETES_CLIENT_CA")]
    pub kubernetes_client_ca: Option<PathBuf>,

    /// Client certificate the gateway presents to the Kubernetes API
    #[arg(long, env = "KUILL_KUBERNETES_CLIENT_CERT")]
    pub kubernetes_client_cert: Option<PathBuf>,

    /// Client key the gateway presents to the Kubernetes API
    #[arg(long, env = "KUILL_KUBERNETES_CLIENT_KEY")]
    pub kubernetes_client_key: Option<PathBuf>,

    /// Bearer token file for the gateway's own identity
    #[arg(long, env = "KUILL_KUBERNETES_TOKEN_FILE")]
    pub kubernetes_token_file: Option<PathBuf>,

    /// Skip verification of the Kubernetes API certificate
    #[arg(long, env = "KUILL_KUBERNETES_INSECURE_SKIP_VERIFY")]
    pub kubernetes_insecure_skip_verify: bool,

    /// Pass identity as trusted front-proxy headers instead of impersonation
    #[arg(long, env = "KUILL_PROXY_AUTHENTICATION")]
    pub proxy_authentication: bool,

    /// User header in proxy authentication mode
    #[arg(long, env = "KUILL_USERNAME_HEADER", default_value = DEFAULT_USER_HEADER)]
    pub username_header: String,

    /// Group header in proxy authentication mode
    #[arg(long, env = "KUILL_GROUP_HEADER", default_value = DEFAULT_GROUP_HEADER)]
    pub group_header: String,

    /// Extra-attribute header prefix in proxy authentication mode
    #[arg(long, env = "KUILL_EXTRA_HEADERS_PREFIX", default_value = DEFAULT_EXTRA_PREFIX)]
    pub extra_headers_prefix: String,

    /// Groups added to every authenticated user
    #[arg(long, env = "KUILL_AUTHENTICATED_GROUPS", value_delimiter = ',')]
    pub authenticated_groups: Vec<String>,

    /// Disable the anonymous login method
    #[arg(long, env = "KUILL_DISABLE_ANONYMOUS")]
    pub disable_anonymous: bool,

    /// User name given to anonymous sessions
    #[arg(long, env = "KUILL_ANONYMOUS_USER", default_value = "anonymous")]
    pub anonymous_user: String,

    /// Groups given to anonymous sessions
    #[arg(long, env = "KUILL_ANONYMOUS_GROUPS", value_delimiter = ',')]
    pub anonymous_groups: Vec<String>,

    /// Tab-separated `user password groups...` file enabling password login
    #[arg(long, env = "KUILL_PASSWORD_FILE")]
    pub password_file: Option<PathBuf>,

    /// Externally visible base URL of the gateway
    #[arg(long, env = "KUILL_PUBLIC_URL")]
    pub public_url: Option<String>,

    /// OIDC issuer URL; enables OIDC login
    #[arg(long, env = "KUILL_OIDC_PROVIDER")]
    pub oidc_provider: Option<String>,

    /// OIDC login method name
    #[arg(long, env = "KUILL_OIDC_PROVIDER_NAME", default_value = "oidc")]
    pub oidc_provider_name: String,

    /// OIDC login method description
    #[arg(long, env = "KUILL_OIDC_PROVIDER_DESCRIPTION", default_value = "")]
    pub oidc_provider_description: String,

    /// OIDC client ID
    #[arg(long, env = "KUILL_OIDC_CLIENT_ID")]
    pub oidc_client_id: Option<String>,

    /// OIDC client secret
    #[arg(long, env = "KUILL_OIDC_CLIENT_SECRET", hide_env_values = true)]
    pub oidc_client_secret: Option<String>,

    /// Scopes requested in addition to `openid`
    #[arg(long, env = "KUILL_OIDC_ADDITIONAL_SCOPES", value_delimiter = ',')]
    pub oidc_additional_scopes: Vec<String>,

    /// ID token claim used as the user name
    #[arg(long, env = "KUILL_OIDC_USER_CLAIM", default_value = "email")]
    pub oidc_user_claim: String,

    /// ID token claim holding group names
    #[arg(long, env = "KUILL_OIDC_GROUPS_CLAIM", default_value = "groups")]
    pub oidc_groups_claim: String,

    /// Session lifetime in seconds
    #[arg(long, env = "KUILL_SESSION_TIMEOUT_SECS", default_value_t = 900)]
    pub session_timeout_secs: u64,

    /// File holding the session signing secret; random per process when unset
    #[arg(long, env = "KUILL_SESSION_SECRET_FILE")]
    pub session_secret_file: Option<PathBuf>,

    /// Seconds between kind catalog refreshes
    #[arg(long, env = "KUILL_KINDS_REFRESH_SECS", default_value_t = DEFAULT_KINDS_REFRESH_SECS)]
    pub kinds_refresh_secs: u64,

    /// Seconds between namespace list refreshes
    #[arg(long, env = "KUILL_NAMESPACES_REFRESH_SECS", default_value_t = DEFAULT_NAMESPACES_REFRESH_SECS)]
    pub namespaces_refresh_secs: u64,

    /// Frames buffered per aggregated watch
    #[arg(long, env = "KUILL_WATCH_QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub watch_queue_capacity: usize,

    /// What clients see when a watch source fails: drop or notify
    #[arg(long, env = "KUILL_WATCH_SOURCE_FAILURES", default_value = "drop")]
    pub watch_source_failures: SourceFailurePolicy,

    /// Resolve watch permissions before dialing watch-all streams
    #[arg(long, env = "KUILL_WATCH_ACCESS_PRECHECK")]
    pub watch_access_precheck: bool,

    /// Log every proxied request at info level
    #[arg(long, env = "KUILL_TRACE_REQUESTS")]
    pub trace_requests: bool,

    /// Log output format: text or json
    #[arg(long, env = "KUILL_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// Debug logging when RUST_LOG is unset
    #[arg(short, long, env = "KUILL_VERBOSE")]
    pub verbose: bool,
}

impl Cli {
    /// Logging settings
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            format: self.log_format,
            verbose: self.verbose,
        }
    }

    /// Whether clients reach the gateway over TLS
    pub fn tls_enabled(&self) -> bool {
        !self.disable_tls
    }

    /// Identity injection mode
    pub fn identity_mode(&self) -> anyhow::Result<IdentityMode> {
        if !self.proxy_authentication {
            return Ok(IdentityMode::Impersonation);
        }
        Ok(IdentityMode::trusted_headers(
            &self.username_header,
            &self.group_header,
            &self.extra_headers_prefix,
        )?)
    }

    /// Session settings
    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        let defaults = SessionConfig::default();
        let lifetime = Duration::from_secs(self.session_timeout_secs);
        if lifetime <= defaults.renew_threshold {
            bail!(
                "--session-timeout-secs must exceed the {}s renewal threshold",
                defaults.renew_threshold.as_secs()
            );
        }
        Ok(SessionConfig {
            lifetime,
            secure_cookie: self.tls_enabled(),
            ..defaults
        })
    }

    /// Watch aggregation settings
    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            queue_capacity: self.watch_queue_capacity,
            failure_policy: self.watch_source_failures,
        }
    }

    /// OIDC settings, when an issuer is configured
    pub fn oidc_config(&self) -> anyhow::Result<Option<OidcConfig>> {
        let Some(issuer) = &self.oidc_provider else {
            return Ok(None);
        };
        let (Some(client_id), Some(client_secret), Some(public_url)) =
            (&self.oidc_client_id, &self.oidc_client_secret, &self.public_url)
        else {
            bail!("--oidc-provider requires --oidc-client-id, --oidc-client-secret and --public-url");
        };

        Ok(Some(OidcConfig {
            name: self.oidc_provider_name.clone(),
            description: self.oidc_provider_description.clone(),
            issuer_url: issuer.clone(),
            client_id: client_id.clone(),
            client_secret: Zeroizing::new(client_secret.clone()),
            public_url: public_url.clone(),
            additional_scopes: self.oidc_additional_scopes.clone(),
            user_claim: self.oidc_user_claim.clone(),
            groups_claim: self.oidc_groups_claim.clone(),
            ..Default::default()
        }))
    }

    /// Listener settings, reading TLS material
    pub async fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        if self.disable_tls {
            return Ok(ServerConfig { addr, tls: None });
        }
        let (Some(cert), Some(key)) = (&self.server_cert, &self.server_key) else {
            bail!("--server-cert and --server-key are required unless --disable-tls is set");
        };
        Ok(ServerConfig {
            addr,
            tls: Some(TlsPem {
                cert_pem: read(cert).await?,
                key_pem: read(key).await?,
            }),
        })
    }

    /// Client configuration for discovery and namespace listing
    pub async fn kube_config(&self) -> anyhow::Result<kube::Config> {
        let mut config = match &self.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
            }
            None => kube::Config::infer().await?,
        };
        if let Some(url) = &self.kubernetes_api {
            config.cluster_url = url
                .parse()
                .with_context(|| format!("invalid --kubernetes-api '{}'", url))?;
        }
        if self.kubernetes_insecure_skip_verify {
            config.accept_invalid_certs = true;
        }
        Ok(config)
    }

    /// Backend client settings
    ///
    /// Without explicit credentials, the in-cluster service account is used
    /// when present.
    pub async fn backend_config(&self, kube: &kube::Config) -> anyhow::Result<BackendConfig> {
        let url = self
            .kubernetes_api
            .clone()
            .unwrap_or_else(|| kube.cluster_url.to_string())
            .trim_end_matches('/')
            .to_string();

        let in_cluster = Path::new(SERVICE_ACCOUNT_TOKEN).exists();
        let ca = self
            .kubernetes_client_ca
            .clone()
            .or_else(|| in_cluster.then(|| PathBuf::from(SERVICE_ACCOUNT_CA)));
        let token = self.kubernetes_token_file.clone().or_else(|| {
            (in_cluster && self.kubernetes_client_cert.is_none()).then(|| PathBuf::from(SERVICE_ACCOUNT_TOKEN))
        });

        let mut config = BackendConfig {
            url,
            insecure_skip_verify: self.kubernetes_insecure_skip_verify,
            ..Default::default()
        };
        if let Some(path) = ca {
            config.ca_pem = Some(read(&path).await?);
        }
        if let Some(path) = &self.kubernetes_client_cert {
            config.client_cert_pem = Some(read(path).await?);
        }
        if let Some(path) = &self.kubernetes_client_key {
            config.client_key_pem = Some(Zeroizing::new(read(path).await?));
        }
        if let Some(path) = token {
            let raw = Zeroizing::new(read(&path).await?);
            let token = String::from_utf8(raw.to_vec())
                .with_context(|| format!("token file {} is not UTF-8", path.display()))?;
            config.bearer_token = Some(Zeroizing::new(token.trim().to_string()));
        }
        Ok(config)
    }

    /// Kind catalog refresh interval
    pub fn kinds_refresh(&self) -> Duration {
        Duration::from_secs(self.kinds_refresh_secs.max(1))
    }

    /// Namespace list refresh interval
    pub fn namespaces_refresh(&self) -> Duration {
        Duration::from_secs(self.namespaces_refresh_secs.max(1))
    }
}

async fn read(path: &Path) -> anyhow::Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))
}
