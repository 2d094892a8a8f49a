//! Bootstrap scenarios
//!
//! # Test Organization
//!
//! - `bootstrap_pipeline`: Stories about a full run, from an empty namespace
//!   to a verified cluster, and about re-running against a finished one
//!
//! - `failure_handling`: Stories about fatal failures and the phase a run
//!   reports when it halts
//!
//! - `quorum_formation`: Stories about standbys joining and unsealing after
//!   the leader
//!
//! - `verification`: Stories about scoring and read-only phase observation
//!
//! All scenarios run on tokio's paused clock, so polling intervals cost no
//! wall time.

mod bootstrap_pipeline;
mod failure_handling;
mod fake_cluster;
mod quorum_formation;
mod verification;

use vault_bootstrap::bootstrap::{BootstrapReport, ClusterBootstrapper};
use vault_bootstrap::config::BootstrapConfig;

use fake_cluster::{FakeCluster, EXTERNAL_HOST};

/// Three nodes, 5 shares, threshold 3, routed at [`EXTERNAL_HOST`]
pub fn three_node_config() -> BootstrapConfig {
    let mut config = BootstrapConfig::new("vault");
    config.external_hosts = vec![EXTERNAL_HOST.to_string()];
    config
}

/// Run a bootstrap that is expected to succeed
pub async fn bootstrap(cluster: &std::sync::Arc<FakeCluster>) -> BootstrapReport {
    let ctx = cluster.context(three_node_config());
    match ClusterBootstrapper::new(ctx).run().await {
        Ok(report) => report,
        Err(failure) => panic!("bootstrap failed: {failure}"),
    }
}
