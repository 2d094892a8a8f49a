//! vault-bootstrap - takes a Raft-backed secrets cluster on Kubernetes from
//! nothing to unsealed, quorate and reachable over TLS
//!
//! # Pipeline
//!
//! A run walks a forward-only sequence of phases (see [`phase`]). Each phase
//! starts with an entry check against the live cluster, so an interrupted run
//! can simply be started again:
//!
//! 1. [`pki`] - request the cluster certificate and wait for key material
//! 2. [`workload`] - install the chart without TLS, then upgrade with TLS
//! 3. [`listener`] - confirm every node really serves TLS, repairing if not
//! 4. [`unseal`] - initialize once, unseal the leader, join and unseal standbys
//! 5. [`score`] - read-only health probes summarised as a 0-100 score
//!
//! [`bootstrap`] drives the pipeline; [`platform`] holds the collaborator
//! traits and their kube-rs, helm, cert-manager and reqwest implementations.

#![deny(missing_docs)]

pub mod bootstrap;
pub mod config;
pub mod context;
pub mod error;
pub mod listener;
pub mod phase;
pub mod pki;
pub mod platform;
pub mod retry;
pub mod score;
pub mod unseal;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager name for server-side apply
pub const FIELD_MANAGER: &str = "vault-bootstrap";
