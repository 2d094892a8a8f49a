//! Initialization, unseal and raft membership
//!
//! The leader (ordinal 0) is initialized at most once and unsealed first.
//! Standbys are handled in ascending ordinal: each joins the raft cluster at
//! the address the unsealed leader advertises, then is unsealed. A standby
//! failure is recorded and the next standby is still attempted.

pub mod shares;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{InitError, JoinError, NodeError, UnsealError};
use crate::platform::{NodeEndpoint, Scheme, SealStatus, SecretsEngine};
use crate::retry::{poll_until, PollConfig, PollStatus};
use crate::Error;

pub use shares::{CredentialStore, FileCredentialStore, InitResult, UnsealKeyShare};

/// Waiting for the unsealed leader to advertise its address
pub const LEADER_ADDRESS_POLL: PollConfig = PollConfig::new(Duration::from_secs(5), 12);

/// Role of a node in the raft cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Ordinal 0; initialized and unsealed first
    Leader,
    /// Every other ordinal
    Standby,
}

/// Last observed state of one node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterNode {
    /// Pod name
    pub id: String,
    /// StatefulSet ordinal
    pub ordinal: u32,
    /// Leader or standby
    pub role: Role,
    /// Node reported sealed (or could not be reached)
    pub sealed: bool,
    /// Node reported initialized
    pub initialized: bool,
    /// Raft peer address of the active node as seen by this node
    pub raft_peer_address: Option<String>,
    /// When the state was read; None if the node was unreachable
    pub last_observed_at: Option<DateTime<Utc>>,
}

/// Result of [`UnsealCoordinator::initialize`]
#[derive(Debug)]
pub enum InitOutcome {
    /// The cluster was initialized by this call
    Initialized(InitResult),
    /// The cluster was already initialized; nothing was done
    AlreadyInitialized,
}

/// Drives the secrets engine on each node
pub struct UnsealCoordinator {
    engine: Arc<dyn SecretsEngine>,
    schemes: Mutex<HashMap<String, Scheme>>,
}

impl UnsealCoordinator {
    /// Create a coordinator
    pub fn new(engine: Arc<dyn SecretsEngine>) -> Self {
        Self {
            engine,
            schemes: Mutex::new(HashMap::new()),
        }
    }

    fn cached_scheme(&self, pod: &str) -> Option<Scheme> {
        self.schemes
            .lock()
            .ok()
            .and_then(|cache| cache.get(pod).copied())
    }

    fn remember_scheme(&self, pod: &str, scheme: Scheme) {
        if let Ok(mut cache) = self.schemes.lock() {
            cache.insert(pod.to_string(), scheme);
        }
    }

    /// Status of a node, detecting its scheme on first contact.
    ///
    /// HTTPS is tried first; plain HTTP only if HTTPS fails. The detected
    /// scheme is reused for the rest of the run.
    pub async fn status(&self, pod: &str) -> Result<(NodeEndpoint, SealStatus), Error> {
        if let Some(scheme) = self.cached_scheme(pod) {
            let endpoint = NodeEndpoint::new(pod, scheme);
            let status = self.engine.status(&endpoint).await?;
            return Ok((endpoint, status));
        }

        let https = NodeEndpoint::new(pod, Scheme::Https);
        let https_error = match self.engine.status(&https).await {
            Ok(status) => {
                self.remember_scheme(pod, Scheme::Https);
                return Ok((https, status));
            }
            Err(e) => e,
        };

        debug!(node = %pod, error = %https_error, "https status failed, trying http");
        let http = NodeEndpoint::new(pod, Scheme::Http);
        let status = self.engine.status(&http).await?;
        warn!(node = %pod, "node answers over plain http");
        self.remember_scheme(pod, Scheme::Http);
        Ok((http, status))
    }

    /// Observe a node without failing; unreachable nodes read as sealed
    pub async fn observe(&self, pod: &str, ordinal: u32) -> ClusterNode {
        let role = if ordinal == 0 {
            Role::Leader
        } else {
            Role::Standby
        };
        match self.status(pod).await {
            Ok((_, status)) => ClusterNode {
                id: pod.to_string(),
                ordinal,
                role,
                sealed: status.sealed,
                initialized: status.initialized,
                raft_peer_address: status.leader_cluster_address.filter(|a| !a.is_empty()),
                last_observed_at: Some(Utc::now()),
            },
            Err(e) => {
                debug!(node = %pod, error = %e, "node unreachable");
                ClusterNode {
                    id: pod.to_string(),
                    ordinal,
                    role,
                    sealed: true,
                    initialized: false,
                    raft_peer_address: None,
                    last_observed_at: None,
                }
            }
        }
    }

    /// Initialize the cluster through the leader, unless already initialized
    pub async fn initialize(
        &self,
        leader: &str,
        shares: u8,
        threshold: u8,
    ) -> Result<InitOutcome, InitError> {
        if threshold == 0 || threshold > shares {
            return Err(InitError::InvalidShares { shares, threshold });
        }

        let (endpoint, status) = self.status(leader).await?;
        if status.initialized {
            info!(node = %leader, "cluster already initialized");
            return Ok(InitOutcome::AlreadyInitialized);
        }

        info!(node = %leader, shares, threshold, "initializing cluster");
        let response = self.engine.init(&endpoint, shares, threshold).await?;
        let result = InitResult::from_response(response);
        if result.shares.len() != usize::from(shares) || result.threshold != threshold {
            // keep going: the output must still reach the credential store
            warn!(
                returned = result.shares.len(),
                returned_threshold = result.threshold,
                shares,
                threshold,
                "init output differs from the requested share parameters"
            );
        }
        Ok(InitOutcome::Initialized(result))
    }

    /// Unseal a node, applying shares one at a time until it reports unsealed.
    ///
    /// A node that is already unsealed receives no shares, and no share is
    /// applied once the node has unsealed.
    pub async fn unseal(&self, node: &str, shares: &[UnsealKeyShare]) -> Result<(), UnsealError> {
        let (endpoint, status) = self.status(node).await?;
        if !status.sealed {
            debug!(node, "already unsealed");
            return Ok(());
        }
        if shares.is_empty() {
            return Err(UnsealError::NoShares {
                node: node.to_string(),
            });
        }

        let mut threshold = status.threshold;
        let mut applied = 0usize;
        for share in shares {
            let status = self
                .engine
                .unseal(&endpoint, share.expose())
                .await
                .map_err(|e| UnsealError::ShareRejected {
                    node: node.to_string(),
                    index: share.index(),
                    message: e.to_string(),
                })?;
            applied += 1;
            if status.threshold > 0 {
                threshold = status.threshold;
            }
            debug!(node, applied, progress = status.progress, threshold, "share applied");

            if !status.sealed {
                info!(node, applied, "node unsealed");
                return Ok(());
            }
        }

        Err(UnsealError::InsufficientShares {
            node: node.to_string(),
            applied,
            threshold,
        })
    }

    /// Join a node to the raft cluster led by `leader_address`
    pub async fn join_consensus(&self, node: &str, leader_address: &str) -> Result<(), JoinError> {
        let (endpoint, _) = self.status(node).await?;
        info!(node, leader = %leader_address, "joining raft cluster");
        self.engine
            .raft_join(&endpoint, leader_address)
            .await
            .map_err(|e| JoinError::Consensus {
                node: node.to_string(),
                leader: leader_address.to_string(),
                message: e.to_string(),
            })
    }

    /// Wait for the unsealed leader to report its API address
    pub async fn leader_address(&self, leader: &str) -> Option<String> {
        poll_until(LEADER_ADDRESS_POLL, "leader address", || async move {
            let (_, status) = self.status(leader).await?;
            Ok::<_, Error>(match status.leader_address() {
                Some(address) if !status.sealed => PollStatus::Done(Some(address.to_string())),
                _ => PollStatus::Pending(None),
            })
        })
        .await
        .ok()
        .flatten()
    }

    /// Join (if needed) and unseal each standby in order.
    ///
    /// Only call once the leader reports unsealed. Returns the failures;
    /// a failed join skips that node's unseal.
    pub async fn join_and_unseal_standbys(
        &self,
        standbys: &[String],
        leader_address: Option<&str>,
        shares: &[UnsealKeyShare],
    ) -> Vec<(String, NodeError)> {
        let mut failures = Vec::new();

        for node in standbys {
            if let Err(e) = self.bring_up_standby(node, leader_address, shares).await {
                warn!(node = %node, error = %e, "standby not brought up");
                failures.push((node.clone(), e));
            }
        }
        failures
    }

    async fn bring_up_standby(
        &self,
        node: &str,
        leader_address: Option<&str>,
        shares: &[UnsealKeyShare],
    ) -> Result<(), NodeError> {
        let (_, status) = self.status(node).await.map_err(UnsealError::from)?;
        if !status.sealed {
            debug!(node, "standby already unsealed");
            return Ok(());
        }

        if !status.initialized {
            let leader = leader_address.ok_or_else(|| JoinError::Consensus {
                node: node.to_string(),
                leader: String::new(),
                message: "leader did not advertise an API address".to_string(),
            })?;
            self.join_consensus(node, leader).await?;
        }

        self.unseal(node, shares).await?;
        Ok(())
    }
}
