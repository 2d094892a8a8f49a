//! [`SecretsEngine`] over pod exec
//!
//! Every call runs the `vault` CLI inside the node's container with
//! `-format=json`, so state is read from a structured status document rather
//! than scraped from human-readable output. The CLI talks to the node's own
//! listener on loopback, using whichever [`Scheme`] the caller detected.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use zeroize::Zeroize;

use super::{ControlPlaneClient, ExecOutput, SecretsEngine};
use crate::config::API_PORT;
use crate::Error;

/// Server container name in the chart's pod template
pub const CONTAINER: &str = "vault";

/// Transport used to reach a node's API listener
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// TLS listener
    Https,
    /// Plaintext listener
    Http,
}

impl Scheme {
    /// URL scheme string
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Https => "https",
            Scheme::Http => "http",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node addressed through a specific transport
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeEndpoint {
    /// Pod name
    pub pod: String,
    /// Transport to use
    pub scheme: Scheme,
}

impl NodeEndpoint {
    /// Create an endpoint
    pub fn new(pod: impl Into<String>, scheme: Scheme) -> Self {
        Self {
            pod: pod.into(),
            scheme,
        }
    }
}

/// `vault status -format=json`
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct SealStatus {
    /// Cluster has been initialized
    pub initialized: bool,
    /// Node is sealed
    pub sealed: bool,
    /// Unseal threshold
    #[serde(rename = "t", default)]
    pub threshold: u8,
    /// Total unseal shares
    #[serde(rename = "n", default)]
    pub shares: u8,
    /// Shares accepted towards the current unseal attempt
    #[serde(default)]
    pub progress: u8,
    /// HA storage is in use
    #[serde(default)]
    pub ha_enabled: bool,
    /// This node is the active node
    #[serde(default)]
    pub is_self: bool,
    /// API address of the active node
    #[serde(default)]
    pub leader_address: Option<String>,
    /// Cluster (raft) address of the active node
    #[serde(default)]
    pub leader_cluster_address: Option<String>,
    /// Server version
    #[serde(default)]
    pub version: Option<String>,
}

impl SealStatus {
    /// Leader API address, ignoring the empty string reported before election
    pub fn leader_address(&self) -> Option<&str> {
        self.leader_address.as_deref().filter(|a| !a.is_empty())
    }
}

/// `vault operator init -format=json`
#[derive(Deserialize)]
pub struct InitResponse {
    /// Base64 unseal key shares
    pub unseal_keys_b64: Vec<String>,
    /// Shares generated
    pub unseal_shares: u8,
    /// Shares required to unseal
    pub unseal_threshold: u8,
    /// Initial root token
    pub root_token: String,
}

impl fmt::Debug for InitResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitResponse")
            .field("unseal_keys_b64", &"[REDACTED]")
            .field("unseal_shares", &self.unseal_shares)
            .field("unseal_threshold", &self.unseal_threshold)
            .field("root_token", &"[REDACTED]")
            .finish()
    }
}

impl Drop for InitResponse {
    fn drop(&mut self) {
        self.unseal_keys_b64.zeroize();
        self.root_token.zeroize();
    }
}

const UNSEAL_ARGS: [&str; 5] = ["vault", "operator", "unseal", "-format=json", "-"];

#[derive(Deserialize)]
struct JoinResponse {
    joined: bool,
}

/// Runs the management CLI inside node pods
#[derive(Clone)]
pub struct ExecSecretsEngine {
    control: Arc<dyn ControlPlaneClient>,
    namespace: String,
    ca_cert_path: String,
}

impl ExecSecretsEngine {
    /// Create an engine for nodes in `namespace`, trusting the CA at `ca_cert_path`
    pub fn new(
        control: Arc<dyn ControlPlaneClient>,
        namespace: impl Into<String>,
        ca_cert_path: impl Into<String>,
    ) -> Self {
        Self {
            control,
            namespace: namespace.into(),
            ca_cert_path: ca_cert_path.into(),
        }
    }

    /// `env` prefix selecting the node's listener
    fn env_prefix(&self, scheme: Scheme) -> Vec<String> {
        let mut cmd = vec![
            "env".to_string(),
            format!("VAULT_ADDR={}://127.0.0.1:{}", scheme, API_PORT),
        ];
        if scheme == Scheme::Https {
            cmd.push(format!("VAULT_CACERT={}", self.ca_cert_path));
        }
        cmd
    }

    async fn run(&self, node: &NodeEndpoint, args: &[&str]) -> Result<ExecOutput, Error> {
        let mut command = self.env_prefix(node.scheme);
        command.extend(args.iter().map(|a| a.to_string()));
        self.control
            .exec(&self.namespace, &node.pod, CONTAINER, command)
            .await
    }
}

/// Build the `operator raft join` command.
///
/// Runs through `sh` so the leader CA can be read from the mounted secret;
/// the CA path and leader address are passed as positional parameters, never
/// spliced into the script.
pub fn raft_join_args(ca_cert_path: &str, leader_address: &str) -> Vec<String> {
    if leader_address.starts_with("https://") {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            r#"exec vault operator raft join -format=json -leader-ca-cert="$(cat "$1")" "$2""#
                .to_string(),
            "sh".to_string(),
            ca_cert_path.to_string(),
            leader_address.to_string(),
        ]
    } else {
        vec![
            "vault".to_string(),
            "operator".to_string(),
            "raft".to_string(),
            "join".to_string(),
            "-format=json".to_string(),
            leader_address.to_string(),
        ]
    }
}

#[async_trait]
impl SecretsEngine for ExecSecretsEngine {
    async fn status(&self, node: &NodeEndpoint) -> Result<SealStatus, Error> {
        // exits 2 while sealed but still prints the status document
        let output = self.run(node, &["vault", "status", "-format=json"]).await?;
        serde_json::from_str(&output.stdout).map_err(|e| {
            Error::command_failed(
                "vault status",
                format!("{} ({})", output.stderr.trim(), e),
            )
        })
    }

    async fn init(
        &self,
        node: &NodeEndpoint,
        shares: u8,
        threshold: u8,
    ) -> Result<InitResponse, Error> {
        let shares_arg = format!("-key-shares={}", shares);
        let threshold_arg = format!("-key-threshold={}", threshold);
        let output = self
            .run(
                node,
                &["vault", "operator", "init", &shares_arg, &threshold_arg, "-format=json"],
            )
            .await?;
        if !output.success {
            return Err(Error::command_failed(
                "vault operator init",
                output.stderr.trim(),
            ));
        }
        Ok(serde_json::from_str(&output.stdout)?)
    }

    async fn unseal(&self, node: &NodeEndpoint, share: &str) -> Result<SealStatus, Error> {
        // "-" reads the key from stdin
        let mut command = self.env_prefix(node.scheme);
        command.extend(UNSEAL_ARGS.iter().map(|a| a.to_string()));
        let output = self
            .control
            .exec_with_stdin(&self.namespace, &node.pod, CONTAINER, command, share)
            .await?;
        if !output.success {
            return Err(Error::command_failed(
                "vault operator unseal",
                output.stderr.trim(),
            ));
        }
        Ok(serde_json::from_str(&output.stdout)?)
    }

    async fn raft_join(&self, node: &NodeEndpoint, leader_address: &str) -> Result<(), Error> {
        let mut command = self.env_prefix(node.scheme);
        command.extend(raft_join_args(&self.ca_cert_path, leader_address));
        debug!(node = %node.pod, leader = %leader_address, "raft join");

        let output = self
            .control
            .exec(&self.namespace, &node.pod, CONTAINER, command)
            .await?;
        if !output.success {
            return Err(Error::command_failed(
                "vault operator raft join",
                output.stderr.trim(),
            ));
        }
        let response: JoinResponse = serde_json::from_str(&output.stdout)?;
        if !response.joined {
            return Err(Error::command_failed(
                "vault operator raft join",
                "node reported joined=false",
            ));
        }
        Ok(())
    }
}
