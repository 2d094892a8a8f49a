//! Stories about a complete bootstrap run
//!
//! An operator points the tool at an empty namespace and expects a
//! three-node raft cluster serving TLS, initialized, unsealed and scoring
//! full marks. Running it again must be a no-op.

use vault_bootstrap::phase::DeploymentPhase;
use vault_bootstrap::workload::chart_values;

use super::fake_cluster::{FakeCluster, Faults};
use super::{bootstrap, three_node_config};

/// Story: an empty namespace becomes a verified three-node cluster
#[tokio::test(start_paused = true)]
async fn empty_namespace_reaches_verified_with_full_score() {
    let cluster = FakeCluster::new(Faults::default());

    let report = bootstrap(&cluster).await;

    assert_eq!(report.phase, DeploymentPhase::Verified);
    assert!(report.quorate);
    assert!(report.initialized_now);
    assert!(report.node_failures.is_empty());
    assert_eq!(report.nodes.len(), 3);
    assert!(report.nodes.iter().all(|n| n.initialized && !n.sealed));
    assert_eq!(report.score.total, 100);
    assert!(report.succeeded(70));
}

/// Story: the chart is installed twice, plaintext first, then with TLS
#[tokio::test(start_paused = true)]
async fn workload_is_deployed_plaintext_then_restarted_with_tls() {
    let cluster = FakeCluster::new(Faults::default());
    bootstrap(&cluster).await;

    let mutations = cluster.mutations();
    let installs: Vec<usize> = mutations
        .iter()
        .enumerate()
        .filter(|(_, m)| m.starts_with("upgrade_install"))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(installs.len(), 2);

    let certificate = mutations
        .iter()
        .position(|m| m.starts_with("apply_certificate"))
        .expect("certificate requested");
    assert!(certificate < installs[0], "certificate precedes any deployment");

    // rolling restart after the TLS upgrade, highest ordinal first
    let restarts: Vec<&str> = mutations[installs[1]..]
        .iter()
        .filter_map(|m| m.strip_prefix("delete_pod "))
        .collect();
    assert_eq!(restarts, vec!["vault-2", "vault-1", "vault-0"]);
}

/// Story: helm gave up on an earlier plaintext install, the run installs it again
#[tokio::test(start_paused = true)]
async fn failed_plaintext_release_is_applied_again() {
    let cluster = FakeCluster::new(Faults::default());
    cluster.plant_failed_release(chart_values(&three_node_config(), false).unwrap());

    let report = bootstrap(&cluster).await;

    let installs = cluster
        .mutations()
        .iter()
        .filter(|m| m.starts_with("upgrade_install"))
        .count();
    assert_eq!(installs, 2, "plaintext pass repeated, then TLS");
    assert_eq!(cluster.release_revision(), Some(3));
    assert_eq!(report.phase, DeploymentPhase::Verified);
    assert_eq!(report.score.total, 100);
}

/// Story: re-running against a finished cluster changes nothing
#[tokio::test(start_paused = true)]
async fn second_run_makes_no_mutating_calls() {
    let cluster = FakeCluster::new(Faults::default());
    bootstrap(&cluster).await;
    let after_first = cluster.mutations().len();

    let report = bootstrap(&cluster).await;

    assert_eq!(cluster.mutations().len(), after_first, "{:?}", &cluster.mutations()[after_first..]);
    assert_eq!(report.phase, DeploymentPhase::Verified);
    assert!(!report.initialized_now);
    assert_eq!(report.score.total, 100);
}

/// Story: credentials hit the store before any node is unsealed
#[tokio::test(start_paused = true)]
async fn credentials_are_persisted_before_unsealing() {
    let cluster = FakeCluster::new(Faults::default());
    bootstrap(&cluster).await;

    let events = cluster.events();
    let persisted = events
        .iter()
        .position(|e| e == "credentials persisted")
        .expect("credentials persisted");
    let first_unseal = events
        .iter()
        .position(|e| e.starts_with("unsealed"))
        .expect("a node unsealed");
    assert!(persisted < first_unseal);
    assert_eq!(
        cluster.mutations().iter().filter(|m| m.starts_with("init")).count(),
        1
    );
}

/// Story: the chart renders TLS off, the listener check patches the config
/// map and restarts the nodes
#[tokio::test(start_paused = true)]
async fn listener_defect_is_repaired_before_initialization() {
    let cluster = FakeCluster::new(Faults {
        template_disables_tls: true,
        ..Default::default()
    });

    let report = bootstrap(&cluster).await;

    assert_eq!(report.phase, DeploymentPhase::Verified);
    assert_eq!(report.score.total, 100);

    let mutations = cluster.mutations();
    let patch = mutations
        .iter()
        .position(|m| m == "patch_config_map vault-config")
        .expect("config map patched");
    let init = mutations
        .iter()
        .position(|m| m.starts_with("init"))
        .expect("cluster initialized");
    assert!(patch < init);
    assert_eq!(
        mutations[patch..init]
            .iter()
            .filter(|m| m.starts_with("delete_pod"))
            .count(),
        3
    );
}
