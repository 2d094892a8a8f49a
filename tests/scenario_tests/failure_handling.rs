//! Stories about runs that halt
//!
//! A fatal failure stops the run and names the last phase reached, so the
//! operator knows where the next run resumes.

use vault_bootstrap::error::{BootstrapError, CertError, InitError, RepairError, UnsealError};
use vault_bootstrap::phase::DeploymentPhase;
use vault_bootstrap::bootstrap::ClusterBootstrapper;

use super::fake_cluster::{FakeCluster, Faults};
use super::{bootstrap, three_node_config};

/// Story: cert-manager never issues, nothing gets deployed
#[tokio::test(start_paused = true)]
async fn certificate_timeout_halts_before_deployment() {
    let cluster = FakeCluster::new(Faults {
        certificate_never_ready: true,
        ..Default::default()
    });

    let failure = ClusterBootstrapper::new(cluster.context(three_node_config()))
        .run()
        .await
        .expect_err("certificate never becomes ready");

    assert_eq!(failure.reached, DeploymentPhase::NotStarted);
    assert!(matches!(
        failure.error,
        BootstrapError::Cert(CertError::Timeout { attempts: 30, .. })
    ));
    assert!(!cluster
        .mutations()
        .iter()
        .any(|m| m.starts_with("upgrade_install")));
}

/// Story: the repaired config still serves plaintext, so no node is
/// initialized over an unencrypted listener
#[tokio::test(start_paused = true)]
async fn failed_repair_halts_before_initialization() {
    let cluster = FakeCluster::new(Faults {
        listener_stuck_plaintext: true,
        ..Default::default()
    });

    let failure = ClusterBootstrapper::new(cluster.context(three_node_config()))
        .run()
        .await
        .expect_err("listener cannot be repaired");

    assert_eq!(failure.reached, DeploymentPhase::WorkloadRunningTLS);
    assert!(matches!(
        failure.error,
        BootstrapError::Repair(RepairError::VerificationFailed { .. })
    ));
    assert!(!cluster.mutations().iter().any(|m| m.starts_with("init")));
}

/// Story: the stored credentials lost shares, the leader stays sealed and
/// no standby is asked to join
#[tokio::test(start_paused = true)]
async fn leader_below_threshold_is_fatal() {
    let cluster = FakeCluster::new(Faults::default());
    bootstrap(&cluster).await;
    for pod in ["vault-0", "vault-1", "vault-2"] {
        cluster.seal(pod);
    }
    cluster.truncate_stored_shares(2);
    let before = cluster.mutations().len();

    let failure = ClusterBootstrapper::new(cluster.context(three_node_config()))
        .run()
        .await
        .expect_err("two shares cannot meet threshold three");

    assert_eq!(failure.reached, DeploymentPhase::Initialized);
    assert!(matches!(
        failure.error,
        BootstrapError::LeaderUnseal(UnsealError::InsufficientShares {
            applied: 2,
            threshold: 3,
            ..
        })
    ));
    let attempted: Vec<String> = cluster.mutations()[before..].to_vec();
    assert_eq!(attempted, vec!["unseal vault-0", "unseal vault-0"]);
}

/// Story: a credentials file from an earlier cluster is still on disk, so
/// the run stops before initializing rather than produce keys it cannot keep
#[tokio::test(start_paused = true)]
async fn leftover_credentials_block_initialization() {
    let cluster = FakeCluster::new(Faults::default());
    cluster.plant_stale_credentials();

    let failure = ClusterBootstrapper::new(cluster.context(three_node_config()))
        .run()
        .await
        .expect_err("store refuses to overwrite");

    assert_eq!(failure.reached, DeploymentPhase::ConfigRepaired);
    match &failure.error {
        BootstrapError::Init(InitError::Persist(message)) => {
            assert!(message.contains("refusing to overwrite"))
        }
        other => panic!("expected a persist error, got {other}"),
    }
    assert!(!cluster.mutations().iter().any(|m| m.starts_with("init")));
    assert!(!cluster.events().contains(&"initialized vault-0".to_string()));

    // once the operator moves the old file away, the run resumes
    cluster.clear_stored_credentials();
    let report = bootstrap(&cluster).await;
    assert!(report.initialized_now);
    assert_eq!(report.score.total, 100);
}

/// Story: the store passed its check but the write failed after init, so
/// the freshly generated keys land in the fallback location
#[tokio::test(start_paused = true)]
async fn failed_persist_after_init_keeps_keys_at_fallback() {
    let cluster = FakeCluster::new(Faults {
        persist_fails: true,
        ..Default::default()
    });

    let failure = ClusterBootstrapper::new(cluster.context(three_node_config()))
        .run()
        .await
        .expect_err("persist fails");

    assert_eq!(failure.reached, DeploymentPhase::ConfigRepaired);
    assert!(matches!(
        failure.error,
        BootstrapError::Init(InitError::Persist(_))
    ));

    let generated = cluster.generated_keys();
    assert_eq!(generated.len(), 5);
    assert_eq!(cluster.rescued_keys(), Some(generated));

    let events = cluster.events();
    let initialized = events
        .iter()
        .position(|e| e == "initialized vault-0")
        .expect("cluster initialized");
    let rescued = events
        .iter()
        .position(|e| e == "credentials rescued")
        .expect("keys rescued");
    assert!(initialized < rescued);
    assert!(!events.iter().any(|e| e.starts_with("unsealed")));
}
