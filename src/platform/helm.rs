//! Helm CLI implementation of [`ReleaseManager`]
//!
//! Values are streamed to helm on stdin (`--values -`) so nothing derived
//! from the bootstrap config is ever written to disk.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::ReleaseManager;
use crate::Error;

/// What to install and where
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReleaseSpec {
    /// Release name
    pub name: String,
    /// Target namespace
    pub namespace: String,
    /// Chart reference (`repo/chart` or a path)
    pub chart: String,
    /// Optional chart version pin
    pub version: Option<String>,
}

/// Observed state of an installed release
#[derive(Clone, Debug, PartialEq)]
pub struct ReleaseStatus {
    /// Release revision number
    pub revision: u32,
    /// Helm status string (`deployed`, `failed`, ...)
    pub status: String,
    /// User-supplied values of the current revision
    pub values: serde_json::Value,
}

impl ReleaseStatus {
    /// The last helm operation on this release failed
    pub fn is_failed(&self) -> bool {
        self.status == "failed"
    }
}

#[derive(Deserialize)]
struct HelmStatusOutput {
    version: u32,
    info: HelmStatusInfo,
}

#[derive(Deserialize)]
struct HelmStatusInfo {
    status: String,
}

/// Drives the `helm` binary
#[derive(Clone, Debug)]
pub struct HelmReleaseManager {
    binary: String,
}

impl Default for HelmReleaseManager {
    fn default() -> Self {
        Self {
            binary: "helm".to_string(),
        }
    }
}

impl HelmReleaseManager {
    async fn run(&self, args: &[&str]) -> Result<std::process::Output, Error> {
        debug!(args = ?args, "running helm");
        Ok(Command::new(&self.binary).args(args).output().await?)
    }
}

/// Build the `helm upgrade --install` argument list
pub fn upgrade_args(spec: &ReleaseSpec) -> Vec<String> {
    let mut args = vec![
        "upgrade".to_string(),
        "--install".to_string(),
        spec.name.clone(),
        spec.chart.clone(),
        "--namespace".to_string(),
        spec.namespace.clone(),
        "--values".to_string(),
        "-".to_string(),
    ];
    if let Some(version) = &spec.version {
        args.push("--version".to_string());
        args.push(version.clone());
    }
    args
}

#[async_trait]
impl ReleaseManager for HelmReleaseManager {
    async fn release_status(&self, spec: &ReleaseSpec) -> Result<Option<ReleaseStatus>, Error> {
        let output = self
            .run(&["status", &spec.name, "--namespace", &spec.namespace, "-o", "json"])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not found") {
                return Ok(None);
            }
            return Err(Error::command_failed("helm status", stderr.trim()));
        }
        let status: HelmStatusOutput = serde_json::from_slice(&output.stdout)?;

        let output = self
            .run(&["get", "values", &spec.name, "--namespace", &spec.namespace, "-o", "json"])
            .await?;
        if !output.status.success() {
            return Err(Error::command_failed(
                "helm get values",
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        // helm prints `null` for a release installed without values
        let values: serde_json::Value = serde_json::from_slice(&output.stdout)?;

        Ok(Some(ReleaseStatus {
            revision: status.version,
            status: status.info.status,
            values,
        }))
    }

    async fn upgrade_install(
        &self,
        spec: &ReleaseSpec,
        values: &serde_json::Value,
    ) -> Result<(), Error> {
        let args = upgrade_args(spec);
        info!(release = %spec.name, namespace = %spec.namespace, chart = %spec.chart, "helm upgrade --install");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // JSON is valid YAML, so helm accepts it on stdin
        let body = serde_json::to_vec(values)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&body).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::command_failed(
                "helm upgrade --install",
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        Ok(())
    }
}
