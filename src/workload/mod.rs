//! Helm deployment of the cluster workload
//!
//! The chart is applied twice: first with TLS disabled so the pods come up
//! before anything depends on the certificate, then with TLS enabled once the
//! certificate secret holds key material. The StatefulSet uses the `OnDelete`
//! update strategy, so configuration changes only take effect after
//! [`WorkloadDeploymentDriver::restart_nodes`] deletes each pod.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::{BootstrapConfig, API_PORT};
use crate::error::DeployError;
use crate::listener::template::render_server_config;
use crate::platform::{ControlPlaneClient, PodInfo, ReleaseManager, ReleaseSpec, ReleaseStatus};
use crate::retry::{poll_until, PollConfig, PollStatus};
use crate::Error;

/// Pod counts at one observation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConvergenceReport {
    /// Replicas the release asks for
    pub expected: u32,
    /// Pods in phase Running and not terminating
    pub running: u32,
    /// Names of the running pods, sorted
    pub running_pods: Vec<String>,
}

impl ConvergenceReport {
    fn from_pods(expected: u32, pods: &[PodInfo]) -> Self {
        let mut running_pods: Vec<String> = pods
            .iter()
            .filter(|p| p.is_running())
            .map(|p| p.name.clone())
            .collect();
        running_pods.sort();
        Self {
            expected,
            running: running_pods.len() as u32,
            running_pods,
        }
    }

    /// Every expected pod is running
    pub fn is_converged(&self) -> bool {
        self.running >= self.expected
    }
}

/// Release spec for the configured chart
pub fn release_spec(config: &BootstrapConfig) -> ReleaseSpec {
    ReleaseSpec {
        name: config.release.clone(),
        namespace: config.namespace.clone(),
        chart: config.chart.clone(),
        version: config.chart_version.clone(),
    }
}

/// Chart values for one pass
pub fn chart_values(config: &BootstrapConfig, tls_enabled: bool) -> Result<Value, Error> {
    let raft_config = render_server_config(config, tls_enabled)
        .map_err(|e| Error::internal("chart_values", e.to_string()))?;
    let tls_dir = config.tls_mount_dir();

    let mut server = json!({
        "ha": {
            "enabled": true,
            "replicas": config.replicas,
            // advertise the headless-service name, which the certificate covers
            "apiAddr": format!("$(VAULT_SCHEME)://$(HOSTNAME).{}:{}", config.internal_service(), API_PORT),
            "raft": {
                "enabled": true,
                "setNodeId": true,
                "config": raft_config,
            },
        },
        "extraVolumes": [
            { "type": "secret", "name": config.tls_secret }
        ],
    });

    if tls_enabled {
        server["extraEnvironmentVars"] = json!({
            "VAULT_CACERT": format!("{}/ca.crt", tls_dir),
        });
    }

    if let Some(host) = config.external_hosts.first() {
        server["route"] = json!({
            "enabled": true,
            "host": host,
            "activeService": true,
            "tls": { "termination": "passthrough" },
        });
    }

    let mut values = json!({
        "global": { "enabled": true, "tlsDisable": !tls_enabled },
        "injector": { "enabled": false },
        "server": server,
        "ui": { "enabled": true },
    });

    if let Some(extra) = &config.extra_values {
        merge_values(&mut values, extra);
    }
    Ok(values)
}

/// Deep-merge `overlay` into `base`; objects merge, everything else replaces
pub fn merge_values(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge_values(base.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// True if deployed values request a TLS listener
pub fn values_request_tls(values: &Value) -> bool {
    values["global"]["tlsDisable"] == Value::Bool(false)
}

/// Installs the chart and waits for its pods
pub struct WorkloadDeploymentDriver {
    releases: Arc<dyn ReleaseManager>,
    control: Arc<dyn ControlPlaneClient>,
    config: BootstrapConfig,
}

impl WorkloadDeploymentDriver {
    /// Create a driver for the configured release
    pub fn new(
        releases: Arc<dyn ReleaseManager>,
        control: Arc<dyn ControlPlaneClient>,
        config: BootstrapConfig,
    ) -> Self {
        Self {
            releases,
            control,
            config,
        }
    }

    /// Current release, if any revision has ever been installed
    pub async fn release(&self) -> Result<Option<ReleaseStatus>, Error> {
        self.releases
            .release_status(&release_spec(&self.config))
            .await
    }

    /// True if the deployed release already requests TLS
    ///
    /// A failed revision requests nothing; the next pass applies it again.
    pub async fn tls_requested(&self) -> Result<bool, Error> {
        Ok(self
            .release()
            .await?
            .map(|r| !r.is_failed() && values_request_tls(&r.values))
            .unwrap_or(false))
    }

    /// Install or upgrade the release for one pass
    pub async fn apply(&self, spec: &ReleaseSpec, tls_enabled: bool) -> Result<(), DeployError> {
        let values = chart_values(&self.config, tls_enabled)?;
        info!(
            release = %spec.name,
            tls = tls_enabled,
            replicas = self.config.replicas,
            "applying release"
        );
        self.releases.upgrade_install(spec, &values).await?;
        Ok(())
    }

    /// Single read-only observation of pod state
    pub async fn observe(&self) -> Result<ConvergenceReport, Error> {
        let pods = self
            .control
            .list_pods(&self.config.namespace, &self.config.pod_selector())
            .await?;
        Ok(ConvergenceReport::from_pods(self.config.replicas, &pods))
    }

    /// Poll until `expected` pods are running
    pub async fn await_convergence(
        &self,
        expected: u32,
        poll: PollConfig,
    ) -> Result<ConvergenceReport, DeployError> {
        let namespace = &self.config.namespace;
        let selector = self.config.pod_selector();
        let control = &self.control;
        let selector = selector.as_str();

        let result = poll_until(poll, "workload convergence", || async move {
            let pods = control.list_pods(namespace, selector).await?;
            let report = ConvergenceReport::from_pods(expected, &pods);
            debug!(running = report.running, expected, "pod convergence");
            Ok::<_, Error>(if report.is_converged() {
                PollStatus::Done(report)
            } else {
                PollStatus::Pending(report)
            })
        })
        .await;

        match result {
            Ok(report) => {
                info!(running = report.running, expected, "workload converged");
                Ok(report)
            }
            Err(exhausted) => Err(DeployError::ConvergenceTimeout {
                expected,
                running: exhausted.last.map(|r| r.running).unwrap_or(0),
                attempts: exhausted.attempts,
            }),
        }
    }

    /// Delete each node's pod in turn, highest ordinal first, waiting for the
    /// workload to converge again before moving to the next.
    pub async fn restart_nodes(&self) -> Result<ConvergenceReport, DeployError> {
        let mut report = ConvergenceReport {
            expected: self.config.replicas,
            ..Default::default()
        };
        for ordinal in (0..self.config.replicas).rev() {
            let pod = self.config.pod_name(ordinal);
            info!(node = %pod, "restarting node");
            self.control
                .delete_pod(&self.config.namespace, &pod)
                .await?;
            report = self
                .await_convergence(self.config.replicas, self.config.convergence_poll)
                .await?;
        }
        Ok(report)
    }
}
