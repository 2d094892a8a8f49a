//! TLS material for the secrets cluster
//!
//! Builds the certificate request (with a SAN set covering every node's
//! in-cluster and external names), submits it to cert-manager, and waits for
//! the backing secret to hold real key material.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::BootstrapConfig;
use crate::error::CertError;
use crate::platform::cert_manager::{
    CertificateSpec, IssuerRef, ResourceMetadata, CERT_MANAGER_GROUP,
};
use crate::platform::{Certificate, CertificateAuthority, ControlPlaneClient};
use crate::retry::{poll_until, PollConfig, PollStatus};

/// Secret key holding the certificate chain
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Secret key holding the private key
pub const TLS_KEY_KEY: &str = "tls.key";
/// Secret key holding the issuing CA
pub const CA_CERT_KEY: &str = "ca.crt";

/// A certificate request for the cluster's listeners
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsCertificateRequest {
    /// Certificate resource name
    pub name: String,
    /// Namespace of the certificate and its secret
    pub namespace: String,
    /// Subject common name
    pub common_name: String,
    /// DNS subject alternative names
    pub subject_alternative_names: BTreeSet<String>,
    /// IP subject alternative names
    pub ip_addresses: BTreeSet<String>,
    /// Issuer to sign with
    pub issuer_ref: IssuerRef,
    /// Secret receiving the key pair
    pub secret_ref: String,
}

impl TlsCertificateRequest {
    /// Request covering every name the cluster is reached by
    pub fn for_cluster(config: &BootstrapConfig) -> Self {
        let ns = &config.namespace;
        let release = &config.release;
        let internal = config.internal_service();
        let domain = &config.cluster_domain;

        let mut sans: BTreeSet<String> = [
            release.clone(),
            format!("{release}.{ns}"),
            format!("{release}.{ns}.svc"),
            format!("{release}.{ns}.svc.{domain}"),
            format!("{release}-active.{ns}.svc"),
            format!("{release}-active.{ns}.svc.{domain}"),
            internal.clone(),
            format!("*.{internal}"),
            format!("*.{internal}.{ns}.svc.{domain}"),
        ]
        .into_iter()
        .collect();
        sans.extend(required_names(config));

        Self {
            name: config.certificate_name(),
            namespace: ns.clone(),
            common_name: format!("{release}.{ns}.svc"),
            subject_alternative_names: sans,
            ip_addresses: ["127.0.0.1".to_string()].into_iter().collect(),
            issuer_ref: IssuerRef {
                name: config.issuer.name.clone(),
                kind: config.issuer.kind.clone(),
                group: Some(CERT_MANAGER_GROUP.to_string()),
            },
            secret_ref: config.tls_secret.clone(),
        }
    }

    /// Check that every required name is covered by a SAN
    pub fn validate(&self, required: &BTreeSet<String>) -> Result<(), CertError> {
        let missing: Vec<&str> = required
            .iter()
            .filter(|name| {
                !self
                    .subject_alternative_names
                    .iter()
                    .any(|san| san_matches(san, name))
            })
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(CertError::InvalidRequest(format!(
                "SAN set does not cover: {}",
                missing.join(", ")
            )))
        }
    }

    /// cert-manager resource for this request
    pub fn to_certificate(&self) -> Certificate {
        Certificate::new(
            ResourceMetadata {
                name: self.name.clone(),
                namespace: self.namespace.clone(),
            },
            CertificateSpec {
                secret_name: self.secret_ref.clone(),
                common_name: self.common_name.clone(),
                dns_names: self.subject_alternative_names.iter().cloned().collect(),
                ip_addresses: self.ip_addresses.iter().cloned().collect(),
                usages: vec![
                    "server auth".to_string(),
                    "client auth".to_string(),
                    "digital signature".to_string(),
                    "key encipherment".to_string(),
                ],
                issuer_ref: self.issuer_ref.clone(),
            },
        )
    }
}

/// Names that must be valid for node-to-node and external TLS
pub fn required_names(config: &BootstrapConfig) -> BTreeSet<String> {
    let internal = config.internal_service();
    let mut names = BTreeSet::new();
    for ordinal in 0..config.replicas {
        names.insert(format!("{}.{}", config.pod_name(ordinal), internal));
        names.insert(config.node_fqdn(ordinal));
    }
    names.extend(config.external_hosts.iter().cloned());
    names
}

/// RFC 6125 style match: a leading `*` covers exactly one label
fn san_matches(san: &str, name: &str) -> bool {
    match san.strip_prefix("*.") {
        Some(suffix) => name
            .split_once('.')
            .map(|(label, rest)| !label.is_empty() && rest.eq_ignore_ascii_case(suffix))
            .unwrap_or(false),
        None => san.eq_ignore_ascii_case(name),
    }
}

/// Handle to a submitted certificate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateHandle {
    /// Namespace
    pub namespace: String,
    /// Certificate resource name
    pub name: String,
    /// Backing secret
    pub secret_name: String,
}

/// Requests and awaits cluster TLS material
pub struct CertificateLifecycleManager {
    ca: Arc<dyn CertificateAuthority>,
    control: Arc<dyn ControlPlaneClient>,
}

impl CertificateLifecycleManager {
    /// Create a manager
    pub fn new(ca: Arc<dyn CertificateAuthority>, control: Arc<dyn ControlPlaneClient>) -> Self {
        Self { ca, control }
    }

    /// Create the self-signed bootstrap issuer if configured and missing
    pub async fn ensure_issuer(&self, config: &BootstrapConfig) -> Result<(), CertError> {
        if !config.issuer.self_signed {
            return Ok(());
        }
        if self
            .ca
            .issuer_exists(&config.namespace, &config.issuer.name)
            .await?
        {
            debug!(issuer = %config.issuer.name, "issuer already exists");
            return Ok(());
        }
        info!(issuer = %config.issuer.name, "creating self-signed issuer");
        self.ca
            .apply_self_signed_issuer(&config.namespace, &config.issuer.name)
            .await?;
        Ok(())
    }

    /// Submit the request unless a certificate of that name already exists.
    ///
    /// Existing certificates are never modified.
    pub async fn request_certificate(
        &self,
        request: &TlsCertificateRequest,
        required: &BTreeSet<String>,
    ) -> Result<CertificateHandle, CertError> {
        request.validate(required)?;

        let handle = CertificateHandle {
            namespace: request.namespace.clone(),
            name: request.name.clone(),
            secret_name: request.secret_ref.clone(),
        };

        if self
            .ca
            .certificate_state(&request.namespace, &request.name)
            .await?
            .is_some()
        {
            debug!(certificate = %request.name, "certificate already requested");
            return Ok(handle);
        }

        info!(
            certificate = %request.name,
            sans = request.subject_alternative_names.len(),
            "requesting certificate"
        );
        self.ca.apply_certificate(&request.to_certificate()).await?;
        Ok(handle)
    }

    /// True if the certificate is Ready and its secret holds key material
    pub async fn is_issued(&self, handle: &CertificateHandle) -> Result<bool, CertError> {
        let ready = self
            .ca
            .certificate_state(&handle.namespace, &handle.name)
            .await?
            .map(|s| s.ready)
            .unwrap_or(false);
        if !ready {
            return Ok(false);
        }
        match self.verify_key_material(handle).await {
            Ok(()) => Ok(true),
            Err(CertError::MissingKeyMaterial { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Poll until Ready, then confirm the secret holds a certificate and key
    pub async fn await_ready(
        &self,
        handle: &CertificateHandle,
        poll: PollConfig,
    ) -> Result<(), CertError> {
        info!(certificate = %handle.name, attempts = poll.max_attempts, "waiting for certificate");

        poll_until(poll, "certificate ready", || async move {
            let state = self
                .ca
                .certificate_state(&handle.namespace, &handle.name)
                .await?;
            Ok::<_, crate::Error>(match state {
                Some(s) if s.ready => PollStatus::Done(()),
                Some(s) => {
                    debug!(certificate = %handle.name, message = ?s.message, "certificate not ready");
                    PollStatus::Pending(())
                }
                None => PollStatus::Pending(()),
            })
        })
        .await
        .map_err(|exhausted| CertError::Timeout {
            name: handle.name.clone(),
            attempts: exhausted.attempts,
            elapsed: poll.ceiling(),
        })?;

        self.verify_key_material(handle).await?;
        info!(certificate = %handle.name, secret = %handle.secret_name, "certificate issued");
        Ok(())
    }

    /// Check the secret has non-empty PEM certificate and key entries
    pub async fn verify_key_material(&self, handle: &CertificateHandle) -> Result<(), CertError> {
        let data = self
            .control
            .get_secret_data(&handle.namespace, &handle.secret_name)
            .await?
            .ok_or_else(|| CertError::MissingKeyMaterial {
                secret: handle.secret_name.clone(),
                key: "<secret not found>".to_string(),
            })?;

        match missing_key_material(&data) {
            Some(key) => Err(CertError::MissingKeyMaterial {
                secret: handle.secret_name.clone(),
                key: key.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// First of `tls.crt`/`tls.key` that is absent or not PEM, if any
pub fn missing_key_material(data: &BTreeMap<String, Vec<u8>>) -> Option<&'static str> {
    [TLS_CERT_KEY, TLS_KEY_KEY]
        .into_iter()
        .find(|key| !data.get(*key).map(|v| is_pem(v)).unwrap_or(false))
}

fn is_pem(bytes: &[u8]) -> bool {
    std::str::from_utf8(bytes)
        .map(|s| s.contains("-----BEGIN"))
        .unwrap_or(false)
}
