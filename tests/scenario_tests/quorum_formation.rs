//! Stories about standbys joining the leader
//!
//! Standbys join raft at the leader's advertised address and are unsealed
//! with the same shares. A standby that fails is reported and scored, but
//! does not stop the run.

use std::collections::HashSet;

use vault_bootstrap::error::NodeError;
use vault_bootstrap::phase::DeploymentPhase;

use super::bootstrap;
use super::fake_cluster::{FakeCluster, Faults};

/// Story: no join request is sent until the leader is unsealed
#[tokio::test(start_paused = true)]
async fn standbys_join_only_after_leader_unsealed() {
    let cluster = FakeCluster::new(Faults::default());
    bootstrap(&cluster).await;

    assert_eq!(cluster.joins_while_leader_sealed(), 0);

    let events = cluster.events();
    let leader = events
        .iter()
        .position(|e| e == "unsealed vault-0")
        .expect("leader unsealed");
    for standby in ["vault-1", "vault-2"] {
        let joined = events
            .iter()
            .position(|e| *e == format!("joined {standby}"))
            .expect("standby joined");
        let unsealed = events
            .iter()
            .position(|e| *e == format!("unsealed {standby}"))
            .expect("standby unsealed");
        assert!(leader < joined && joined < unsealed);
    }
}

/// Story: each node gets exactly the threshold number of shares
#[tokio::test(start_paused = true)]
async fn nodes_receive_only_threshold_shares() {
    let cluster = FakeCluster::new(Faults::default());
    bootstrap(&cluster).await;

    for pod in ["vault-0", "vault-1", "vault-2"] {
        let submitted = cluster
            .mutations()
            .iter()
            .filter(|m| **m == format!("unseal {pod}"))
            .count();
        assert_eq!(submitted, 3, "{pod}");
    }
}

/// Story: one standby cannot join, the cluster runs with two of three
#[tokio::test(start_paused = true)]
async fn refused_join_leaves_partial_quorum_and_lower_score() {
    let cluster = FakeCluster::new(Faults {
        join_refused: HashSet::from(["vault-2".to_string()]),
        ..Default::default()
    });

    let report = bootstrap(&cluster).await;

    assert_eq!(report.phase, DeploymentPhase::Verified);
    assert!(!report.quorate);
    assert_eq!(report.node_failures.len(), 1);
    let (node, error) = &report.node_failures[0];
    assert_eq!(node, "vault-2");
    assert!(matches!(error, NodeError::Join(_)));

    // no unseal attempted on a node that never joined
    assert!(!cluster.mutations().contains(&"unseal vault-2".to_string()));

    assert_eq!(report.score.component_scores["unsealed_nodes"], 13);
    assert_eq!(report.score.total, 93);
    assert!(report.succeeded(70));
    assert!(!report.succeeded(95));
}
