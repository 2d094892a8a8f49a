//! Deployment phases of a bootstrap run

use std::fmt;

use serde::{Deserialize, Serialize};

/// Observed progress of a cluster bootstrap.
///
/// Variants are declared in pipeline order, so `Ord` follows the state
/// machine: a later phase implies every earlier one was satisfied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeploymentPhase {
    /// Nothing observed yet
    #[default]
    NotStarted,
    /// TLS certificate issued and its secret holds key material
    CertIssued,
    /// Workload running with TLS disabled (first pass)
    WorkloadRunningNoTLS,
    /// Workload running with TLS requested (second pass)
    WorkloadRunningTLS,
    /// Effective listener configuration confirmed (or repaired) to serve TLS
    ConfigRepaired,
    /// Cluster initialized on the leader
    Initialized,
    /// Leader unsealed
    Unsealed,
    /// Every existing node unsealed and participating in raft
    RaftQuorate,
    /// Verification probes ran and produced a score
    Verified,
}

impl DeploymentPhase {
    /// All phases in order
    pub const ALL: [DeploymentPhase; 9] = [
        DeploymentPhase::NotStarted,
        DeploymentPhase::CertIssued,
        DeploymentPhase::WorkloadRunningNoTLS,
        DeploymentPhase::WorkloadRunningTLS,
        DeploymentPhase::ConfigRepaired,
        DeploymentPhase::Initialized,
        DeploymentPhase::Unsealed,
        DeploymentPhase::RaftQuorate,
        DeploymentPhase::Verified,
    ];
}

impl fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
