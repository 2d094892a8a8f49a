//! Stories about checking a cluster without changing it
//!
//! `status` and `verify` only read. Each broken condition costs its own
//! weight and nothing else.

use vault_bootstrap::bootstrap::observe_phase;
use vault_bootstrap::phase::DeploymentPhase;
use vault_bootstrap::score::{
    DeploymentScorer, ScoreCard, WEIGHT_CERTIFICATE, WEIGHT_EXTERNAL_ROUTE, WEIGHT_NAMESPACE,
    WEIGHT_TLS,
};

use super::fake_cluster::{FakeCluster, Faults};
use super::{bootstrap, three_node_config};

async fn score(cluster: &std::sync::Arc<FakeCluster>) -> ScoreCard {
    let ctx = cluster.context(three_node_config());
    let coordinator = ctx.coordinator();
    DeploymentScorer::new(&ctx, &coordinator).score().await
}

/// Story: the phase of an untouched namespace and of a finished cluster
#[tokio::test(start_paused = true)]
async fn observed_phase_tracks_cluster_state() {
    let cluster = FakeCluster::new(Faults::default());
    let ctx = cluster.context(three_node_config());
    assert_eq!(
        observe_phase(&ctx).await.expect("observe"),
        DeploymentPhase::NotStarted
    );

    bootstrap(&cluster).await;
    let before = cluster.mutations().len();
    assert_eq!(
        observe_phase(&ctx).await.expect("observe"),
        DeploymentPhase::RaftQuorate
    );

    cluster.seal("vault-1");
    assert_eq!(
        observe_phase(&ctx).await.expect("observe"),
        DeploymentPhase::Unsealed
    );

    cluster.seal("vault-0");
    assert_eq!(
        observe_phase(&ctx).await.expect("observe"),
        DeploymentPhase::Initialized
    );
    assert_eq!(cluster.mutations().len(), before, "observation is read-only");
}

/// Story: an empty namespace scores nothing
#[tokio::test(start_paused = true)]
async fn empty_namespace_scores_zero() {
    let cluster = FakeCluster::new(Faults::default());
    let card = score(&cluster).await;
    assert_eq!(card.total, 0);
    assert_eq!(card.max, 100);
}

/// Story: a sealed standby costs only its share of the unsealed weight
#[tokio::test(start_paused = true)]
async fn sealed_standby_lowers_only_unsealed_component() {
    let cluster = FakeCluster::new(Faults::default());
    bootstrap(&cluster).await;
    cluster.seal("vault-1");

    let card = score(&cluster).await;

    assert_eq!(card.component_scores["unsealed_nodes"], 13);
    assert_eq!(card.component_scores["leader"], 20);
    assert_eq!(card.total, 93);
}

/// Story: missing key material and an unreachable route each drop a component
#[tokio::test(start_paused = true)]
async fn certificate_and_route_failures_are_scored_independently() {
    let cluster = FakeCluster::new(Faults {
        route_unreachable: true,
        ..Default::default()
    });
    bootstrap(&cluster).await;
    cluster.remove_secret_key("vault-server-tls", "tls.key");

    let card = score(&cluster).await;

    assert_eq!(card.component_scores["certificate"], 0);
    assert_eq!(card.component_scores["external_route"], 0);
    assert_eq!(card.total, 75);
    assert!(card.meets(70));
}

/// Story: a sealed leader fails the leader, route and unsealed probes
#[tokio::test(start_paused = true)]
async fn sealed_leader_drops_below_default_minimum() {
    let cluster = FakeCluster::new(Faults::default());
    bootstrap(&cluster).await;
    for pod in ["vault-0", "vault-1", "vault-2"] {
        cluster.seal(pod);
    }

    let card = score(&cluster).await;

    assert_eq!(card.component_scores["leader"], 0);
    assert_eq!(card.component_scores["external_route"], 0);
    assert_eq!(card.component_scores["unsealed_nodes"], 0);
    assert_eq!(card.total, 45);
    assert!(!card.meets(70));
}

/// Story: breaking exactly one condition costs exactly that condition's
/// points and leaves every other component at full marks
#[tokio::test(start_paused = true)]
async fn each_single_broken_condition_costs_only_its_points() {
    type Break = fn(&FakeCluster);
    let cases: [(&str, u32, Faults, Break); 5] = [
        ("namespace", WEIGHT_NAMESPACE, Faults::default(), |c| {
            c.remove_namespace("vault")
        }),
        // one of three pods: 15 -> 10
        ("pods_running", 5, Faults::default(), |c| {
            c.mark_terminating("vault-2")
        }),
        ("certificate", WEIGHT_CERTIFICATE, Faults::default(), |c| {
            c.remove_secret_key("vault-server-tls", "tls.crt")
        }),
        ("tls", WEIGHT_TLS, Faults::default(), |c| {
            c.serve_plaintext("vault-2")
        }),
        (
            "external_route",
            WEIGHT_EXTERNAL_ROUTE,
            Faults {
                route_unreachable: true,
                ..Default::default()
            },
            |_| {},
        ),
    ];

    let healthy = FakeCluster::new(Faults::default());
    bootstrap(&healthy).await;
    let healthy = score(&healthy).await;
    assert_eq!(healthy.total, 100);

    for (component, cost, faults, break_condition) in cases {
        let cluster = FakeCluster::new(faults);
        bootstrap(&cluster).await;
        break_condition(&cluster);

        let card = score(&cluster).await;

        assert_eq!(card.total, 100 - cost, "breaking {component}: {card}");
        for (name, points) in &card.component_scores {
            if name == component {
                assert_eq!(*points, healthy.component_scores[name] - cost, "{component}");
            } else {
                assert_eq!(*points, healthy.component_scores[name], "{component} moved {name}");
            }
        }
    }
}
