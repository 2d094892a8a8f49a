//! cert-manager resources and the kube-rs [`CertificateAuthority`]

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::CertificateAuthority;
use crate::{Error, FIELD_MANAGER};

/// cert-manager API group
pub const CERT_MANAGER_GROUP: &str = "cert-manager.io";

/// Object metadata for cert-manager resources
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceMetadata {
    /// Resource name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
}

/// cert-manager Certificate resource
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    /// API version (cert-manager.io/v1)
    pub api_version: String,
    /// Resource kind (Certificate)
    pub kind: String,
    /// Resource metadata
    pub metadata: ResourceMetadata,
    /// Certificate specification
    pub spec: CertificateSpec,
}

impl Certificate {
    /// Create a new Certificate
    pub fn new(metadata: ResourceMetadata, spec: CertificateSpec) -> Self {
        Self {
            api_version: format!("{}/v1", CERT_MANAGER_GROUP),
            kind: "Certificate".to_string(),
            metadata,
            spec,
        }
    }
}

/// Certificate spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    /// Name of the Secret to store the certificate
    pub secret_name: String,
    /// Certificate common name
    pub common_name: String,
    /// DNS names for the certificate
    pub dns_names: Vec<String>,
    /// IP addresses for the certificate
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,
    /// Key usages
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usages: Vec<String>,
    /// Reference to the issuer
    pub issuer_ref: IssuerRef,
}

/// Issuer reference for Certificate
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IssuerRef {
    /// Issuer name
    pub name: String,
    /// Issuer kind (Issuer or ClusterIssuer)
    pub kind: String,
    /// API group (cert-manager.io)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// Observed readiness of a Certificate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateState {
    /// Ready condition is True
    pub ready: bool,
    /// Secret the certificate is written to
    pub secret_name: String,
    /// Message of the Ready condition, if any
    pub message: Option<String>,
}

impl CertificateState {
    /// Extract readiness from a Certificate's JSON body
    pub fn from_object(obj: &serde_json::Value) -> Self {
        let ready_condition = obj["status"]["conditions"]
            .as_array()
            .and_then(|conds| conds.iter().find(|c| c["type"] == "Ready"));

        Self {
            ready: ready_condition
                .map(|c| c["status"] == "True")
                .unwrap_or(false),
            secret_name: obj["spec"]["secretName"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            message: ready_condition
                .and_then(|c| c["message"].as_str())
                .map(str::to_string),
        }
    }
}

/// kube-rs backed cert-manager client
#[derive(Clone)]
pub struct CertManagerClient {
    client: Client,
}

impl CertManagerClient {
    /// Wrap a kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str, kind: &str) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(CERT_MANAGER_GROUP, "v1", kind);
        Api::namespaced_with(self.client.clone(), namespace, &ApiResource::from_gvk(&gvk))
    }
}

#[async_trait]
impl CertificateAuthority for CertManagerClient {
    async fn certificate_state(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CertificateState>, Error> {
        let cert = self.api(namespace, "Certificate").get_opt(name).await?;
        Ok(cert.map(|c| CertificateState::from_object(&c.data)))
    }

    async fn apply_certificate(&self, certificate: &Certificate) -> Result<(), Error> {
        let api = self.api(&certificate.metadata.namespace, "Certificate");
        api.patch(
            &certificate.metadata.name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Apply(certificate),
        )
        .await?;
        debug!(certificate = %certificate.metadata.name, "certificate applied");
        Ok(())
    }

    async fn issuer_exists(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        Ok(self.api(namespace, "Issuer").get_opt(name).await?.is_some())
    }

    async fn apply_self_signed_issuer(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let issuer = serde_json::json!({
            "apiVersion": format!("{}/v1", CERT_MANAGER_GROUP),
            "kind": "Issuer",
            "metadata": { "name": name, "namespace": namespace },
            "spec": { "selfSigned": {} }
        });
        self.api(namespace, "Issuer")
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&issuer))
            .await?;
        debug!(issuer = %name, "self-signed issuer applied");
        Ok(())
    }
}
