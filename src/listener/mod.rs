//! Effective listener configuration checks and repair
//!
//! Requesting TLS in the chart values is not proof that a node serves TLS:
//! the rendered config can still end up with `tls_disable` set. Inspection
//! therefore reads the config file the server actually loaded, and falls back
//! to the startup log line only when that file cannot be read.

pub mod hcl;
pub mod template;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::BootstrapConfig;
use crate::error::RepairError;
use crate::platform::vault::CONTAINER;
use crate::platform::ControlPlaneClient;
use crate::workload::WorkloadDeploymentDriver;

use hcl::parse_tcp_listeners;
use template::render_server_config;

/// Config file the container entrypoint renders and the server loads
pub const EFFECTIVE_CONFIG_PATH: &str = "/tmp/storageconfig.hcl";

/// Config map key the chart mounts as the server configuration
pub const CONFIG_MAP_KEY: &str = "extraconfig-from-values.hcl";

/// Where a listener state was read from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateSource {
    /// Parsed from the effective config file
    EffectiveConfig,
    /// Inferred from the server's startup log
    Logs,
}

/// TLS state of a node's API listener
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlsListenerState {
    /// Every tcp listener serves TLS
    pub enabled: bool,
    /// How the state was determined
    pub source: StateSource,
}

/// Inspects and repairs node listener configuration
pub struct ListenerConfigValidator {
    control: Arc<dyn ControlPlaneClient>,
    namespace: String,
}

impl ListenerConfigValidator {
    /// Create a validator for pods in `namespace`
    pub fn new(control: Arc<dyn ControlPlaneClient>, namespace: impl Into<String>) -> Self {
        Self {
            control,
            namespace: namespace.into(),
        }
    }

    /// Determine whether a node serves TLS
    pub async fn inspect(&self, node: &str) -> Result<TlsListenerState, RepairError> {
        let command = vec!["cat".to_string(), EFFECTIVE_CONFIG_PATH.to_string()];
        let config_error = match self
            .control
            .exec(&self.namespace, node, CONTAINER, command)
            .await
        {
            Ok(output) if output.success => {
                let listeners = parse_tcp_listeners(&output.stdout);
                if listeners.is_empty() {
                    "no tcp listener in effective config".to_string()
                } else {
                    let enabled = listeners.iter().all(|l| l.tls_enabled());
                    debug!(node, enabled, listeners = listeners.len(), "listener state from config");
                    return Ok(TlsListenerState {
                        enabled,
                        source: StateSource::EffectiveConfig,
                    });
                }
            }
            Ok(output) => output.stderr.trim().to_string(),
            Err(e) => e.to_string(),
        };

        warn!(node, error = %config_error, "effective config unreadable, falling back to logs");

        let logs = self
            .control
            .pod_logs(&self.namespace, node, CONTAINER)
            .await
            .map_err(|e| RepairError::Uninspectable {
                node: node.to_string(),
                message: format!("{}; logs: {}", config_error, e),
            })?;

        match tls_state_from_logs(&logs) {
            Some(enabled) => Ok(TlsListenerState {
                enabled,
                source: StateSource::Logs,
            }),
            None => Err(RepairError::Uninspectable {
                node: node.to_string(),
                message: format!("{}; no listener line in logs", config_error),
            }),
        }
    }

    /// Inspect every node, in order
    pub async fn inspect_all(
        &self,
        nodes: &[String],
    ) -> Result<Vec<(String, TlsListenerState)>, RepairError> {
        let mut states = Vec::with_capacity(nodes.len());
        for node in nodes {
            states.push((node.clone(), self.inspect(node).await?));
        }
        Ok(states)
    }

    /// Write the known-good configuration, restart every node and verify.
    ///
    /// Any node still serving plaintext afterwards fails the repair.
    pub async fn repair(
        &self,
        config: &BootstrapConfig,
        driver: &WorkloadDeploymentDriver,
        nodes: &[String],
    ) -> Result<(), RepairError> {
        let rendered =
            render_server_config(config, true).map_err(|e| RepairError::Template(e.to_string()))?;

        info!(config_map = %config.config_map(), "writing known-good listener configuration");
        self.control
            .patch_config_map_data(
                &self.namespace,
                &config.config_map(),
                BTreeMap::from([(CONFIG_MAP_KEY.to_string(), rendered)]),
            )
            .await?;

        driver.restart_nodes().await?;
        tokio::time::sleep(config.repair_grace).await;

        for (node, state) in self.inspect_all(nodes).await? {
            if !state.enabled {
                return Err(RepairError::VerificationFailed { node });
            }
        }
        info!(nodes = nodes.len(), "TLS verified on every node after repair");
        Ok(())
    }
}

/// Read the listener summary the server logs at startup
fn tls_state_from_logs(logs: &str) -> Option<bool> {
    logs.lines()
        .rev()
        .filter(|line| line.contains("Listener") && line.contains("tcp"))
        .find_map(|line| {
            if line.contains(r#"tls: "enabled""#) {
                Some(true)
            } else if line.contains(r#"tls: "disabled""#) {
                Some(false)
            } else {
                None
            }
        })
}
