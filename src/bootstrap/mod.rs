//! Top-level bootstrap state machine
//!
//! [`ClusterBootstrapper::run`] walks the phases of [`DeploymentPhase`] in
//! order. Each phase first checks the live cluster and skips its actions if
//! they are already satisfied, so a run against a finished cluster makes no
//! mutating calls and a run after a failure resumes where the last one
//! stopped.
//!
//! # Failure semantics
//!
//! - Certificate timeout, convergence timeout, repair verification failure,
//!   init failure and leader unseal failure halt the run with a
//!   [`BootstrapFailure`] naming the last phase reached.
//! - Standby join/unseal failures are collected into
//!   [`BootstrapReport::node_failures`] and lower the score.

use tracing::{error, info, warn};

use crate::context::BootstrapContext;
use crate::error::{BootstrapError, BootstrapFailure, NodeError};
use crate::phase::DeploymentPhase;
use crate::pki::{required_names, CertificateHandle, TlsCertificateRequest};
use crate::score::{DeploymentScorer, ScoreCard};
use crate::unseal::{ClusterNode, InitOutcome, InitResult, UnsealCoordinator, UnsealKeyShare};
use crate::workload::{release_spec, values_request_tls};

/// Outcome of a run that reached scoring
#[derive(Debug)]
pub struct BootstrapReport {
    /// Final phase
    pub phase: DeploymentPhase,
    /// Every node reported unsealed at the end of the run
    pub quorate: bool,
    /// Node states observed after the raft phase
    pub nodes: Vec<ClusterNode>,
    /// Recoverable per-node failures
    pub node_failures: Vec<(String, NodeError)>,
    /// This run initialized the cluster (and persisted its credentials)
    pub initialized_now: bool,
    /// Health score
    pub score: ScoreCard,
}

impl BootstrapReport {
    /// Verified with at least `min_score` points
    pub fn succeeded(&self, min_score: u32) -> bool {
        self.phase == DeploymentPhase::Verified && self.score.meets(min_score)
    }
}

/// Drives one bootstrap run
pub struct ClusterBootstrapper {
    ctx: BootstrapContext,
    coordinator: UnsealCoordinator,
    phase: DeploymentPhase,
}

impl ClusterBootstrapper {
    /// Create a bootstrapper for the given context
    pub fn new(ctx: BootstrapContext) -> Self {
        let coordinator = ctx.coordinator();
        Self {
            ctx,
            coordinator,
            phase: DeploymentPhase::NotStarted,
        }
    }

    /// Last phase reached
    pub fn phase(&self) -> DeploymentPhase {
        self.phase
    }

    fn advance(&mut self, to: DeploymentPhase) {
        debug_assert!(to > self.phase, "phase must move forward");
        self.phase = to;
        info!(phase = %to, "phase reached");
        println!("==> {}", to);
    }

    /// Run every phase to completion or to the first fatal error
    pub async fn run(mut self) -> Result<BootstrapReport, BootstrapFailure> {
        match self.run_phases().await {
            Ok(report) => Ok(report),
            Err(error) => Err(BootstrapFailure {
                reached: self.phase,
                error,
            }),
        }
    }

    async fn run_phases(&mut self) -> Result<BootstrapReport, BootstrapError> {
        let namespace = self.ctx.config.namespace.clone();
        if !self.ctx.control.namespace_exists(&namespace).await? {
            info!(namespace = %namespace, "creating namespace");
            self.ctx.control.ensure_namespace(&namespace).await?;
        }

        self.issue_certificate().await?;
        self.advance(DeploymentPhase::CertIssued);

        self.deploy_plaintext().await?;
        self.advance(DeploymentPhase::WorkloadRunningNoTLS);

        self.deploy_tls().await?;
        self.advance(DeploymentPhase::WorkloadRunningTLS);

        self.verify_listeners().await?;
        self.advance(DeploymentPhase::ConfigRepaired);

        let (init, initialized_now) = self.initialize().await?;
        self.advance(DeploymentPhase::Initialized);

        let shares: &[UnsealKeyShare] = init.as_ref().map(|r| r.shares.as_slice()).unwrap_or(&[]);
        let leader = self.ctx.config.pod_name(0);
        self.coordinator
            .unseal(&leader, shares)
            .await
            .map_err(BootstrapError::LeaderUnseal)?;
        self.advance(DeploymentPhase::Unsealed);

        let node_failures = self.form_quorum(&leader, shares).await;
        let mut nodes = Vec::with_capacity(self.ctx.config.replicas as usize);
        for (ordinal, node) in self.ctx.node_names().iter().enumerate() {
            nodes.push(self.coordinator.observe(node, ordinal as u32).await);
        }
        let quorate = nodes.iter().all(|n| !n.sealed);
        if !quorate {
            warn!(
                unsealed = nodes.iter().filter(|n| !n.sealed).count(),
                expected = nodes.len(),
                "continuing with partial quorum"
            );
        }
        self.advance(DeploymentPhase::RaftQuorate);

        let score = DeploymentScorer::new(&self.ctx, &self.coordinator)
            .score()
            .await;
        self.advance(DeploymentPhase::Verified);

        Ok(BootstrapReport {
            phase: self.phase,
            quorate,
            nodes,
            node_failures,
            initialized_now,
            score,
        })
    }

    async fn issue_certificate(&self) -> Result<(), BootstrapError> {
        let config = &self.ctx.config;
        let certificates = self.ctx.certificates();

        certificates.ensure_issuer(config).await?;
        let request = TlsCertificateRequest::for_cluster(config);
        let handle = certificates
            .request_certificate(&request, &required_names(config))
            .await?;

        if certificates.is_issued(&handle).await? {
            info!(certificate = %handle.name, "certificate already issued");
            return Ok(());
        }
        certificates.await_ready(&handle, config.cert_poll).await?;
        Ok(())
    }

    async fn deploy_plaintext(&self) -> Result<(), BootstrapError> {
        let workload = self.ctx.workload();
        match workload.release().await? {
            Some(release) if release.is_failed() && !values_request_tls(&release.values) => {
                warn!(
                    release = %self.ctx.config.release,
                    revision = release.revision,
                    "plaintext release failed, applying it again"
                );
            }
            Some(_) => {
                info!(release = %self.ctx.config.release, "release exists, skipping plaintext pass");
                return Ok(());
            }
            None => {}
        }
        workload
            .apply(&release_spec(&self.ctx.config), false)
            .await?;
        workload
            .await_convergence(self.ctx.config.replicas, self.ctx.config.convergence_poll)
            .await?;
        Ok(())
    }

    async fn deploy_tls(&self) -> Result<(), BootstrapError> {
        let workload = self.ctx.workload();
        if workload.tls_requested().await? {
            info!(release = %self.ctx.config.release, "release already requests TLS");
        } else {
            workload
                .apply(&release_spec(&self.ctx.config), true)
                .await?;
            workload.restart_nodes().await?;
        }
        workload
            .await_convergence(self.ctx.config.replicas, self.ctx.config.convergence_poll)
            .await?;
        Ok(())
    }

    async fn verify_listeners(&self) -> Result<(), BootstrapError> {
        let validator = self.ctx.listener();
        let nodes = self.ctx.node_names();

        let disabled: Vec<String> = validator
            .inspect_all(&nodes)
            .await?
            .into_iter()
            .filter(|(_, state)| !state.enabled)
            .map(|(node, _)| node)
            .collect();

        if disabled.is_empty() {
            info!(nodes = nodes.len(), "TLS confirmed on every node");
            return Ok(());
        }

        warn!(nodes = ?disabled, "TLS disabled in effective config, repairing");
        validator
            .repair(&self.ctx.config, &self.ctx.workload(), &nodes)
            .await?;
        Ok(())
    }

    /// Initialize if needed; returns the shares available to this run
    async fn initialize(&self) -> Result<(Option<InitResult>, bool), BootstrapError> {
        let config = &self.ctx.config;
        let leader = config.pod_name(0);

        let (_, status) = self.coordinator.status(&leader).await?;
        if !status.initialized {
            // init output exists exactly once; never produce it without a place to put it
            self.ctx.credentials.ensure_writable().await?;
        }

        match self
            .coordinator
            .initialize(&leader, config.key_shares, config.key_threshold)
            .await?
        {
            InitOutcome::Initialized(result) => {
                if let Err(e) = self.ctx.credentials.persist(&result).await {
                    self.rescue_init_output(&result).await;
                    return Err(e.into());
                }
                Ok((Some(result), true))
            }
            InitOutcome::AlreadyInitialized => {
                let stored = self.ctx.credentials.load().await?;
                if stored.is_none() {
                    info!("no stored credentials; sealed nodes cannot be unsealed by this run");
                }
                Ok((stored, false))
            }
        }
    }

    /// Keep init output that could not be persisted from dying with this process
    async fn rescue_init_output(&self, result: &InitResult) {
        error!("init output could not be persisted; the cluster is initialized");
        match self.ctx.credentials.persist_fallback(result).await {
            Ok(location) => {
                eprintln!(
                    "\nUnseal keys and root token were written to {} instead.",
                    location
                );
                eprintln!("Move them to the credentials file before re-running.");
            }
            Err(e) => {
                error!(error = %e, "fallback write failed, printing init output");
                eprintln!("\nUnseal keys and root token could not be written anywhere.");
                eprintln!("Record them now; they are not shown again.");
                for share in &result.shares {
                    eprintln!("  Unseal Key {}: {}", share.index() + 1, share.expose());
                }
                eprintln!("  Initial Root Token: {}", result.root_token());
            }
        }
    }

    /// Join and unseal standbys once the leader is unsealed
    async fn form_quorum(
        &self,
        leader: &str,
        shares: &[UnsealKeyShare],
    ) -> Vec<(String, NodeError)> {
        let standbys: Vec<String> = self.ctx.node_names().into_iter().skip(1).collect();
        if standbys.is_empty() {
            return Vec::new();
        }

        let mut pending = Vec::new();
        for node in &standbys {
            match self.coordinator.status(node).await {
                Ok((_, status)) if !status.sealed => {}
                _ => pending.push(node.clone()),
            }
        }
        if pending.is_empty() {
            info!("every standby already unsealed");
            return Vec::new();
        }

        let leader_address = self.coordinator.leader_address(leader).await;
        if leader_address.is_none() {
            warn!(node = %leader, "leader did not advertise an API address");
        }
        self.coordinator
            .join_and_unseal_standbys(&pending, leader_address.as_deref(), shares)
            .await
    }
}

/// Furthest phase the cluster satisfies, computed with read-only calls.
///
/// `Verified` is never observed; it is only reached by a run that scores.
/// A partially unsealed cluster observes as `Unsealed`.
pub async fn observe_phase(ctx: &BootstrapContext) -> Result<DeploymentPhase, BootstrapError> {
    let config = &ctx.config;
    if !ctx.control.namespace_exists(&config.namespace).await? {
        return Ok(DeploymentPhase::NotStarted);
    }

    let certificates = ctx.certificates();
    let handle = CertificateHandle {
        namespace: config.namespace.clone(),
        name: config.certificate_name(),
        secret_name: config.tls_secret.clone(),
    };
    if !certificates.is_issued(&handle).await? {
        return Ok(DeploymentPhase::NotStarted);
    }

    let workload = ctx.workload();
    let release = workload.release().await?;
    if release.is_none() || !workload.observe().await?.is_converged() {
        return Ok(DeploymentPhase::CertIssued);
    }
    if !workload.tls_requested().await? {
        return Ok(DeploymentPhase::WorkloadRunningNoTLS);
    }

    let all_tls = match ctx.listener().inspect_all(&ctx.node_names()).await {
        Ok(states) => states.iter().all(|(_, s)| s.enabled),
        Err(_) => false,
    };
    if !all_tls {
        return Ok(DeploymentPhase::WorkloadRunningTLS);
    }

    let coordinator = ctx.coordinator();
    let leader = coordinator.observe(&config.pod_name(0), 0).await;
    if !leader.initialized {
        return Ok(DeploymentPhase::ConfigRepaired);
    }
    if leader.sealed {
        return Ok(DeploymentPhase::Initialized);
    }

    for (ordinal, node) in ctx.node_names().iter().enumerate().skip(1) {
        if coordinator.observe(node, ordinal as u32).await.sealed {
            return Ok(DeploymentPhase::Unsealed);
        }
    }
    Ok(DeploymentPhase::RaftQuorate)
}
