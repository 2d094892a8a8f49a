//! Collaborator interfaces consumed by the orchestrator
//!
//! Each trait abstracts one external system so phases can be tested against
//! mocks while production uses the real clients:
//!
//! - [`ControlPlaneClient`] - the Kubernetes API (kube-rs)
//! - [`ReleaseManager`] - helm releases of the cluster workload
//! - [`CertificateAuthority`] - cert-manager Certificates and Issuers
//! - [`SecretsEngine`] - the cluster's own management CLI, reached via exec
//! - [`EndpointProbe`] - HTTPS reachability of the external route

pub mod cert_manager;
pub mod helm;
pub mod k8s;
pub mod probe;
pub mod vault;

use std::collections::BTreeMap;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::Error;

pub use cert_manager::{CertManagerClient, Certificate, CertificateState};
pub use helm::{HelmReleaseManager, ReleaseSpec, ReleaseStatus};
pub use k8s::KubeControlPlane;
pub use probe::HttpProbe;
pub use vault::{ExecSecretsEngine, InitResponse, NodeEndpoint, Scheme, SealStatus};

/// Observed state of one pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodInfo {
    /// Pod name
    pub name: String,
    /// Pod phase (`Pending`, `Running`, ...)
    pub phase: String,
    /// Whether the pod is being deleted
    pub terminating: bool,
}

impl PodInfo {
    /// Running and not on its way out
    pub fn is_running(&self) -> bool {
        self.phase == "Running" && !self.terminating
    }
}

/// Result of a command executed inside a pod
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Whether the command exited zero
    pub success: bool,
}

/// Kubernetes operations used by the orchestrator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    /// Check whether a namespace exists
    async fn namespace_exists(&self, name: &str) -> Result<bool, Error>;

    /// Create a namespace if it does not exist
    async fn ensure_namespace(&self, name: &str) -> Result<(), Error>;

    /// List pods matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodInfo>, Error>;

    /// Run a command in a pod container and capture its output
    ///
    /// A non-zero exit is reported through [`ExecOutput::success`], not as an error.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, Error>;

    /// Like [`exec`](Self::exec), writing `input` to the command's stdin and closing it.
    ///
    /// Secrets go through here: exec arguments travel in the request URI and
    /// end up in API server audit logs.
    async fn exec_with_stdin(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
        input: &str,
    ) -> Result<ExecOutput, Error>;

    /// Fetch recent log lines from a pod container
    async fn pod_logs(&self, namespace: &str, pod: &str, container: &str)
        -> Result<String, Error>;

    /// Read a Secret's data, or None if the Secret does not exist
    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error>;

    /// Merge the given keys into a ConfigMap's data
    async fn patch_config_map_data(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<(), Error>;

    /// Delete a pod so its controller recreates it
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Externally routable host for the release (Route, then Ingress)
    async fn external_host(&self, namespace: &str, name: &str) -> Result<Option<String>, Error>;
}

/// Install/upgrade of the cluster workload release
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReleaseManager: Send + Sync {
    /// Current release status and user-supplied values, or None if never installed
    async fn release_status(&self, spec: &ReleaseSpec) -> Result<Option<ReleaseStatus>, Error>;

    /// Install the release, or upgrade it if it exists
    async fn upgrade_install(
        &self,
        spec: &ReleaseSpec,
        values: &serde_json::Value,
    ) -> Result<(), Error>;
}

/// Certificate requests against cert-manager
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Readiness of a Certificate, or None if it does not exist
    async fn certificate_state(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CertificateState>, Error>;

    /// Create (server-side apply) a Certificate
    async fn apply_certificate(&self, certificate: &Certificate) -> Result<(), Error>;

    /// Check whether a namespaced Issuer exists
    async fn issuer_exists(&self, namespace: &str, name: &str) -> Result<bool, Error>;

    /// Create a self-signed namespaced Issuer
    async fn apply_self_signed_issuer(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// The secrets cluster's management operations on a single node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretsEngine: Send + Sync {
    /// Seal/init/HA status of a node
    async fn status(&self, node: &NodeEndpoint) -> Result<SealStatus, Error>;

    /// Initialize the cluster through this node
    async fn init(
        &self,
        node: &NodeEndpoint,
        shares: u8,
        threshold: u8,
    ) -> Result<InitResponse, Error>;

    /// Submit one unseal share, returning the resulting seal status
    async fn unseal(&self, node: &NodeEndpoint, share: &str) -> Result<SealStatus, Error>;

    /// Join this node to the raft cluster led by `leader_address`
    async fn raft_join(&self, node: &NodeEndpoint, leader_address: &str) -> Result<(), Error>;
}

/// Reachability probe for the external endpoint
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EndpointProbe: Send + Sync {
    /// GET the URL, optionally trusting an extra CA (PEM), and return the status code
    async fn get_status(&self, url: &str, ca_pem: Option<Vec<u8>>) -> Result<u16, Error>;
}
