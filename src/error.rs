//! Error types for the bootstrap orchestrator
//!
//! Platform-level failures (Kubernetes API, helm, exec) use [`Error`]. Each
//! orchestrator component has its own error enum so the bootstrapper can tell
//! fatal failures from node-level ones, and [`BootstrapError`] aggregates the
//! fatal ones for the top-level runner.

use std::time::Duration;

use thiserror::Error;

use crate::phase::DeploymentPhase;

/// Platform error for collaborator calls
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// An external command (helm, or a command exec'd in a pod) failed
    #[error("command failed: {command} - {message}")]
    CommandFailed {
        /// The command that failed
        command: String,
        /// Error output or description
        message: String,
    },

    /// Invalid configuration
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Where the error occurred
        context: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a command failure for the named command
    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Certificate issuance failures
#[derive(Debug, Error)]
pub enum CertError {
    /// Certificate never became Ready within the polling bound
    #[error("certificate {name} not ready after {attempts} attempts ({elapsed:?})")]
    Timeout {
        /// Certificate resource name
        name: String,
        /// Poll attempts made
        attempts: u32,
        /// Total time budget that was exhausted
        elapsed: Duration,
    },

    /// The backing secret exists but lacks certificate or key material
    #[error("secret {secret} is missing key material: {key}")]
    MissingKeyMaterial {
        /// Secret name
        secret: String,
        /// The missing or empty data key
        key: String,
    },

    /// The request violates the SAN invariant
    #[error("invalid certificate request: {0}")]
    InvalidRequest(String),

    /// Platform failure while talking to the CA or API server
    #[error(transparent)]
    Platform(#[from] Error),
}

/// Workload deployment failures
#[derive(Debug, Error)]
pub enum DeployError {
    /// Pods did not reach Running within the polling bound
    #[error("workload did not converge: {running}/{expected} pods running after {attempts} attempts")]
    ConvergenceTimeout {
        /// Expected replica count
        expected: u32,
        /// Pods running at the last observation
        running: u32,
        /// Poll attempts made
        attempts: u32,
    },

    /// Platform failure (helm, API server)
    #[error(transparent)]
    Platform(#[from] Error),
}

/// Listener inspection and repair failures
#[derive(Debug, Error)]
pub enum RepairError {
    /// TLS is still disabled on a node after repair
    #[error("TLS still disabled on {node} after repair")]
    VerificationFailed {
        /// Node that failed verification
        node: String,
    },

    /// Neither the effective config nor the logs yielded a listener state
    #[error("cannot determine listener state for {node}: {message}")]
    Uninspectable {
        /// Node being inspected
        node: String,
        /// Why inspection failed
        message: String,
    },

    /// Rendering the known-good configuration failed
    #[error("template error: {0}")]
    Template(String),

    /// Restart after repair did not converge
    #[error(transparent)]
    Deploy(#[from] DeployError),

    /// Platform failure
    #[error(transparent)]
    Platform(#[from] Error),
}

/// Cluster initialization failures
#[derive(Debug, Error)]
pub enum InitError {
    /// Share parameters violate `1 <= threshold <= shares`
    #[error("invalid share parameters: threshold {threshold} of {shares}")]
    InvalidShares {
        /// Total shares requested
        shares: u8,
        /// Threshold requested
        threshold: u8,
    },

    /// Init output could not be persisted; the cluster may hold keys nobody stored
    #[error("failed to persist init output: {0}")]
    Persist(String),

    /// Platform failure
    #[error(transparent)]
    Platform(#[from] Error),
}

/// Unseal failures for a single node
#[derive(Debug, Error)]
pub enum UnsealError {
    /// The node rejected a share
    #[error("node {node} rejected unseal share {index}: {message}")]
    ShareRejected {
        /// Node being unsealed
        node: String,
        /// Index of the rejected share
        index: usize,
        /// Error reported by the node
        message: String,
    },

    /// All supplied shares were applied and the node is still sealed
    #[error("node {node} still sealed after {applied} shares (threshold {threshold})")]
    InsufficientShares {
        /// Node being unsealed
        node: String,
        /// Shares applied
        applied: usize,
        /// Threshold reported by the node
        threshold: u8,
    },

    /// Node is sealed and no shares are available to the orchestrator
    #[error("node {node} is sealed and no unseal shares are available")]
    NoShares {
        /// Node being unsealed
        node: String,
    },

    /// Platform failure
    #[error(transparent)]
    Platform(#[from] Error),
}

/// Raft join failures for a single node
#[derive(Debug, Error)]
pub enum JoinError {
    /// The join request was refused or failed
    #[error("node {node} failed to join raft at {leader}: {message}")]
    Consensus {
        /// Joining node
        node: String,
        /// Leader API address
        leader: String,
        /// Error reported by the node
        message: String,
    },

    /// Platform failure
    #[error(transparent)]
    Platform(#[from] Error),
}

/// Fatal errors that halt a bootstrap run
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Certificate phase failed
    #[error("certificate phase failed: {0}")]
    Cert(#[from] CertError),

    /// Workload deployment failed
    #[error("deployment phase failed: {0}")]
    Deploy(#[from] DeployError),

    /// Listener repair failed verification
    #[error("listener repair failed: {0}")]
    Repair(#[from] RepairError),

    /// Initialization failed
    #[error("initialization failed: {0}")]
    Init(#[from] InitError),

    /// The leader could not be unsealed, so no node can join
    #[error("leader unseal failed: {0}")]
    LeaderUnseal(#[from] UnsealError),

    /// Platform failure outside a component
    #[error(transparent)]
    Platform(#[from] Error),
}

/// A fatal error together with the last phase the run reached
#[derive(Debug, Error)]
#[error("bootstrap halted after reaching {reached}: {error}")]
pub struct BootstrapFailure {
    /// Last phase reached before the failure
    pub reached: DeploymentPhase,
    /// The fatal error
    pub error: BootstrapError,
}

/// A recoverable failure on one node, carried into the final report
#[derive(Debug, Error)]
pub enum NodeError {
    /// Raft join failed
    #[error(transparent)]
    Join(#[from] JoinError),

    /// Unseal failed
    #[error(transparent)]
    Unseal(#[from] UnsealError),
}
