//! Weighted health score of a deployment
//!
//! Every probe is read-only and a failing probe contributes zero, so the
//! scorer can run against a cluster in any state.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::context::BootstrapContext;
use crate::pki::{missing_key_material, CA_CERT_KEY};
use crate::unseal::UnsealCoordinator;

/// Namespace exists
pub const WEIGHT_NAMESPACE: u32 = 5;
/// Pods running, proportional to replicas
pub const WEIGHT_PODS_RUNNING: u32 = 15;
/// Certificate secret holds key material
pub const WEIGHT_CERTIFICATE: u32 = 10;
/// Leader initialized and unsealed
pub const WEIGHT_LEADER: u32 = 20;
/// Every node serves TLS
pub const WEIGHT_TLS: u32 = 15;
/// External route answers from an unsealed node
pub const WEIGHT_EXTERNAL_ROUTE: u32 = 15;
/// Unsealed nodes, proportional to replicas
pub const WEIGHT_UNSEALED_NODES: u32 = 20;

/// Health endpoint codes from an unsealed node (active, standby, DR, perf standby)
const SERVING_STATUS: [u16; 4] = [200, 429, 472, 473];

/// Component scores of one evaluation
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScoreCard {
    /// Points per probe
    pub component_scores: BTreeMap<String, u32>,
    /// Sum of component scores
    pub total: u32,
    /// Highest achievable total
    pub max: u32,
}

impl ScoreCard {
    fn record(&mut self, component: &str, points: u32, weight: u32) {
        self.component_scores.insert(component.to_string(), points);
        self.total += points;
        self.max += weight;
    }

    /// Total meets the threshold
    pub fn meets(&self, min_score: u32) -> bool {
        self.total >= min_score
    }
}

impl fmt::Display for ScoreCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (component, points) in &self.component_scores {
            writeln!(f, "  {:<16} {:>3}", component, points)?;
        }
        write!(f, "  {:<16} {:>3}/{}", "total", self.total, self.max)
    }
}

#[derive(Debug, Error)]
#[error("{probe} probe unavailable: {message}")]
struct ProbeUnavailable {
    probe: &'static str,
    message: String,
}

impl ProbeUnavailable {
    fn new(probe: &'static str, message: impl fmt::Display) -> Self {
        Self {
            probe,
            message: message.to_string(),
        }
    }
}

fn proportional(weight: u32, count: u32, expected: u32) -> u32 {
    if expected == 0 {
        return 0;
    }
    weight * count.min(expected) / expected
}

/// Runs the health probes
pub struct DeploymentScorer<'a> {
    ctx: &'a BootstrapContext,
    coordinator: &'a UnsealCoordinator,
}

impl<'a> DeploymentScorer<'a> {
    /// Scorer sharing the run's coordinator (and its scheme cache)
    pub fn new(ctx: &'a BootstrapContext, coordinator: &'a UnsealCoordinator) -> Self {
        Self { ctx, coordinator }
    }

    /// Evaluate every probe
    pub async fn score(&self) -> ScoreCard {
        let mut card = ScoreCard::default();
        let probes: [(&str, u32, Result<u32, ProbeUnavailable>); 7] = [
            ("namespace", WEIGHT_NAMESPACE, self.namespace().await),
            ("pods_running", WEIGHT_PODS_RUNNING, self.pods_running().await),
            ("certificate", WEIGHT_CERTIFICATE, self.certificate().await),
            ("leader", WEIGHT_LEADER, self.leader().await),
            ("tls", WEIGHT_TLS, self.tls().await),
            ("external_route", WEIGHT_EXTERNAL_ROUTE, self.external_route().await),
            ("unsealed_nodes", WEIGHT_UNSEALED_NODES, self.unsealed_nodes().await),
        ];

        for (component, weight, result) in probes {
            let points = result.unwrap_or_else(|e| {
                debug!(error = %e, "scoring probe failed");
                0
            });
            card.record(component, points, weight);
        }
        card
    }

    async fn namespace(&self) -> Result<u32, ProbeUnavailable> {
        let exists = self
            .ctx
            .control
            .namespace_exists(&self.ctx.config.namespace)
            .await
            .map_err(|e| ProbeUnavailable::new("namespace", e))?;
        Ok(if exists { WEIGHT_NAMESPACE } else { 0 })
    }

    async fn pods_running(&self) -> Result<u32, ProbeUnavailable> {
        let report = self
            .ctx
            .workload()
            .observe()
            .await
            .map_err(|e| ProbeUnavailable::new("pods_running", e))?;
        Ok(proportional(
            WEIGHT_PODS_RUNNING,
            report.running,
            self.ctx.config.replicas,
        ))
    }

    async fn certificate(&self) -> Result<u32, ProbeUnavailable> {
        let data = self
            .ctx
            .control
            .get_secret_data(&self.ctx.config.namespace, &self.ctx.config.tls_secret)
            .await
            .map_err(|e| ProbeUnavailable::new("certificate", e))?
            .ok_or_else(|| ProbeUnavailable::new("certificate", "secret not found"))?;
        Ok(match missing_key_material(&data) {
            None => WEIGHT_CERTIFICATE,
            Some(_) => 0,
        })
    }

    async fn leader(&self) -> Result<u32, ProbeUnavailable> {
        let leader = self.ctx.config.pod_name(0);
        let (_, status) = self
            .coordinator
            .status(&leader)
            .await
            .map_err(|e| ProbeUnavailable::new("leader", e))?;
        Ok(if status.initialized && !status.sealed {
            WEIGHT_LEADER
        } else {
            0
        })
    }

    async fn tls(&self) -> Result<u32, ProbeUnavailable> {
        let states = self
            .ctx
            .listener()
            .inspect_all(&self.ctx.node_names())
            .await
            .map_err(|e| ProbeUnavailable::new("tls", e))?;
        Ok(if states.iter().all(|(_, s)| s.enabled) {
            WEIGHT_TLS
        } else {
            0
        })
    }

    async fn external_route(&self) -> Result<u32, ProbeUnavailable> {
        let config = &self.ctx.config;
        let host = match config.external_hosts.first() {
            Some(host) => host.clone(),
            None => self
                .ctx
                .control
                .external_host(&config.namespace, &config.release)
                .await
                .map_err(|e| ProbeUnavailable::new("external_route", e))?
                .ok_or_else(|| ProbeUnavailable::new("external_route", "no route or ingress"))?,
        };

        let ca = self
            .ctx
            .control
            .get_secret_data(&config.namespace, &config.tls_secret)
            .await
            .ok()
            .flatten()
            .and_then(|mut data| data.remove(CA_CERT_KEY));

        let url = format!("https://{}/v1/sys/health", host);
        let status = self
            .ctx
            .probe
            .get_status(&url, ca)
            .await
            .map_err(|e| ProbeUnavailable::new("external_route", e))?;
        debug!(url = %url, status, "external route probed");
        Ok(if SERVING_STATUS.contains(&status) {
            WEIGHT_EXTERNAL_ROUTE
        } else {
            0
        })
    }

    async fn unsealed_nodes(&self) -> Result<u32, ProbeUnavailable> {
        let mut unsealed = 0;
        for (ordinal, node) in self.ctx.node_names().iter().enumerate() {
            let observed = self.coordinator.observe(node, ordinal as u32).await;
            if !observed.sealed {
                unsealed += 1;
            }
        }
        Ok(proportional(
            WEIGHT_UNSEALED_NODES,
            unsealed,
            self.ctx.config.replicas,
        ))
    }
}
