//! Everything a bootstrap run needs, passed explicitly to every phase

use std::sync::Arc;

use kube::Client;

use crate::config::BootstrapConfig;
use crate::listener::ListenerConfigValidator;
use crate::pki::{CertificateLifecycleManager, CA_CERT_KEY};
use crate::platform::{
    CertManagerClient, CertificateAuthority, ControlPlaneClient, EndpointProbe,
    ExecSecretsEngine, HelmReleaseManager, HttpProbe, KubeControlPlane, ReleaseManager,
    SecretsEngine,
};
use crate::unseal::{CredentialStore, FileCredentialStore, UnsealCoordinator};
use crate::workload::WorkloadDeploymentDriver;
use crate::Error;

/// Configuration plus collaborator handles for one run
#[derive(Clone)]
pub struct BootstrapContext {
    /// Validated configuration
    pub config: BootstrapConfig,
    /// Kubernetes API
    pub control: Arc<dyn ControlPlaneClient>,
    /// Helm releases
    pub releases: Arc<dyn ReleaseManager>,
    /// cert-manager
    pub ca: Arc<dyn CertificateAuthority>,
    /// Node management CLI
    pub engine: Arc<dyn SecretsEngine>,
    /// External reachability
    pub probe: Arc<dyn EndpointProbe>,
    /// Init output persistence
    pub credentials: Arc<dyn CredentialStore>,
}

impl BootstrapContext {
    /// Production context from the ambient kubeconfig
    pub async fn connect(config: BootstrapConfig) -> Result<Self, Error> {
        config.validate()?;
        let client = Client::try_default().await?;

        let control: Arc<dyn ControlPlaneClient> = Arc::new(KubeControlPlane::new(client.clone()));
        let engine = ExecSecretsEngine::new(
            control.clone(),
            config.namespace.clone(),
            format!("{}/{}", config.tls_mount_dir(), CA_CERT_KEY),
        );

        Ok(Self {
            releases: Arc::new(HelmReleaseManager::default()),
            ca: Arc::new(CertManagerClient::new(client)),
            engine: Arc::new(engine),
            probe: Arc::new(HttpProbe::default()),
            credentials: Arc::new(FileCredentialStore::new(config.credentials_file.clone())),
            control,
            config,
        })
    }

    /// Certificate phase component
    pub fn certificates(&self) -> CertificateLifecycleManager {
        CertificateLifecycleManager::new(self.ca.clone(), self.control.clone())
    }

    /// Deployment phase component
    pub fn workload(&self) -> WorkloadDeploymentDriver {
        WorkloadDeploymentDriver::new(
            self.releases.clone(),
            self.control.clone(),
            self.config.clone(),
        )
    }

    /// Listener phase component
    pub fn listener(&self) -> ListenerConfigValidator {
        ListenerConfigValidator::new(self.control.clone(), self.config.namespace.clone())
    }

    /// Unseal phase component; scheme detection is cached per instance
    pub fn coordinator(&self) -> UnsealCoordinator {
        UnsealCoordinator::new(self.engine.clone())
    }

    /// Pod names of every expected node, leader first
    pub fn node_names(&self) -> Vec<String> {
        (0..self.config.replicas)
            .map(|ordinal| self.config.pod_name(ordinal))
            .collect()
    }
}
