//! Bootstrap configuration
//!
//! [`BootstrapConfig`] is built by the binary from CLI flags and environment
//! variables and validated once up front. Naming helpers derive every
//! Kubernetes object name from the release name, matching what the vault
//! chart renders.

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::PollConfig;
use crate::Error;

/// Default namespace for the secrets cluster
pub const DEFAULT_NAMESPACE: &str = "vault";
/// Default helm release name
pub const DEFAULT_RELEASE: &str = "vault";
/// Default chart reference
pub const DEFAULT_CHART: &str = "hashicorp/vault";
/// Default replica count
pub const DEFAULT_REPLICAS: u32 = 3;
/// Default number of unseal key shares
pub const DEFAULT_KEY_SHARES: u8 = 5;
/// Default unseal threshold
pub const DEFAULT_KEY_THRESHOLD: u8 = 3;
/// Default minimum score for a successful exit
pub const DEFAULT_MIN_SCORE: u32 = 70;

/// API port served by every node
pub const API_PORT: u16 = 8200;
/// Raft cluster port
pub const CLUSTER_PORT: u16 = 8201;

/// Certificate readiness: 30 attempts, 10s apart
pub const CERT_POLL: PollConfig = PollConfig::new(Duration::from_secs(10), 30);
/// Workload convergence: 20 attempts, 15s apart
pub const CONVERGENCE_POLL: PollConfig = PollConfig::new(Duration::from_secs(15), 20);
/// Grace period for a restarted node to report its listener state
pub const REPAIR_GRACE: Duration = Duration::from_secs(10);

/// Certificate issuer reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuerConfig {
    /// Issuer name
    pub name: String,
    /// `Issuer` or `ClusterIssuer`
    pub kind: String,
    /// Create a self-signed namespaced issuer if it does not exist
    pub self_signed: bool,
}

/// Fully resolved configuration for one bootstrap run
#[derive(Clone, Debug)]
pub struct BootstrapConfig {
    /// Namespace holding the cluster
    pub namespace: String,
    /// Helm release name; prefixes every object name
    pub release: String,
    /// Chart reference passed to helm
    pub chart: String,
    /// Optional chart version pin
    pub chart_version: Option<String>,
    /// Expected node count
    pub replicas: u32,
    /// Total unseal shares generated at init
    pub key_shares: u8,
    /// Shares needed to unseal
    pub key_threshold: u8,
    /// Secret receiving the TLS material
    pub tls_secret: String,
    /// Certificate issuer
    pub issuer: IssuerConfig,
    /// Externally routable hostnames (route/ingress)
    pub external_hosts: Vec<String>,
    /// Kubernetes cluster DNS domain
    pub cluster_domain: String,
    /// File used to persist and reload init output
    pub credentials_file: PathBuf,
    /// Additional helm values merged over the generated document
    pub extra_values: Option<serde_json::Value>,
    /// Minimum score for a successful run
    pub min_score: u32,
    /// Certificate polling bound
    pub cert_poll: PollConfig,
    /// Convergence polling bound
    pub convergence_poll: PollConfig,
    /// Post-repair grace period
    pub repair_grace: Duration,
}

impl BootstrapConfig {
    /// Config with defaults for the given namespace
    pub fn new(namespace: impl Into<String>) -> Self {
        let release = DEFAULT_RELEASE.to_string();
        Self {
            namespace: namespace.into(),
            tls_secret: format!("{}-server-tls", release),
            issuer: IssuerConfig {
                name: format!("{}-selfsigned", release),
                kind: "Issuer".to_string(),
                self_signed: true,
            },
            release,
            chart: DEFAULT_CHART.to_string(),
            chart_version: None,
            replicas: DEFAULT_REPLICAS,
            key_shares: DEFAULT_KEY_SHARES,
            key_threshold: DEFAULT_KEY_THRESHOLD,
            external_hosts: Vec::new(),
            cluster_domain: "cluster.local".to_string(),
            credentials_file: PathBuf::from("vault-init.json"),
            extra_values: None,
            min_score: DEFAULT_MIN_SCORE,
            cert_poll: CERT_POLL,
            convergence_poll: CONVERGENCE_POLL,
            repair_grace: REPAIR_GRACE,
        }
    }

    /// Check invariants that would otherwise surface deep inside a run
    pub fn validate(&self) -> Result<(), Error> {
        if self.namespace.trim().is_empty() {
            return Err(Error::validation("namespace must not be empty"));
        }
        if self.release.trim().is_empty() {
            return Err(Error::validation("release name must not be empty"));
        }
        if self.replicas == 0 {
            return Err(Error::validation("replica count must be at least 1"));
        }
        if self.key_threshold == 0 {
            return Err(Error::validation("key threshold must be at least 1"));
        }
        if self.key_threshold > self.key_shares {
            return Err(Error::validation(format!(
                "key threshold {} exceeds key shares {}",
                self.key_threshold, self.key_shares
            )));
        }
        if self.min_score > 100 {
            return Err(Error::validation("minimum score must be between 0 and 100"));
        }
        if !matches!(self.issuer.kind.as_str(), "Issuer" | "ClusterIssuer") {
            return Err(Error::validation(format!(
                "issuer kind must be Issuer or ClusterIssuer, got {}",
                self.issuer.kind
            )));
        }
        if self.issuer.self_signed && self.issuer.kind != "Issuer" {
            return Err(Error::validation(
                "a self-signed bootstrap issuer must be a namespaced Issuer",
            ));
        }
        Ok(())
    }

    /// Pod name for a node ordinal
    pub fn pod_name(&self, ordinal: u32) -> String {
        format!("{}-{}", self.release, ordinal)
    }

    /// Headless service used for raft traffic
    pub fn internal_service(&self) -> String {
        format!("{}-internal", self.release)
    }

    /// Config map rendered by the chart with the server configuration
    pub fn config_map(&self) -> String {
        format!("{}-config", self.release)
    }

    /// Certificate resource name
    pub fn certificate_name(&self) -> String {
        self.tls_secret.clone()
    }

    /// Label selector matching server pods
    pub fn pod_selector(&self) -> String {
        format!(
            "app.kubernetes.io/name=vault,app.kubernetes.io/instance={},component=server",
            self.release
        )
    }

    /// Directory the TLS secret is mounted at inside each pod
    pub fn tls_mount_dir(&self) -> String {
        format!("/vault/userconfig/{}", self.tls_secret)
    }

    /// Fully-qualified in-cluster name of a node on the headless service
    pub fn node_fqdn(&self, ordinal: u32) -> String {
        format!(
            "{}.{}.{}.svc.{}",
            self.pod_name(ordinal),
            self.internal_service(),
            self.namespace,
            self.cluster_domain
        )
    }
}
