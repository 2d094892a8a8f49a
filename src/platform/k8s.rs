//! kube-rs implementation of [`ControlPlaneClient`]
//!
//! Provides the kubectl-equivalent operations the orchestrator needs without
//! shelling out to kubectl. Read calls that hit the API server are wrapped in
//! [`retry_with_backoff`] so a flapping API server does not fail a phase.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{
    Api, AttachParams, DeleteParams, DynamicObject, GroupVersionKind, ListParams, LogParams,
    Patch, PatchParams,
};
use kube::discovery::ApiResource;
use kube::Client;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use super::{ControlPlaneClient, ExecOutput, PodInfo};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, FIELD_MANAGER};

/// Number of log lines fetched for listener checks
const LOG_TAIL_LINES: i64 = 500;

/// Real Kubernetes client
#[derive(Clone)]
pub struct KubeControlPlane {
    client: Client,
    retry: RetryConfig,
}

impl KubeControlPlane {
    /// Wrap a kube Client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            retry: RetryConfig::default(),
        }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn attach(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
        input: Option<&str>,
    ) -> Result<ExecOutput, Error> {
        let params = AttachParams::default()
            .container(container)
            .stdin(input.is_some())
            .stdout(true)
            .stderr(true);

        trace!(pod = %pod, program = ?command.first(), stdin = input.is_some(), "exec in pod");
        let mut attached = self.pods(namespace).exec(pod, command, &params).await?;

        if let Some(input) = input {
            let mut writer = attached
                .stdin()
                .ok_or_else(|| Error::internal("exec", "stdin not attached"))?;
            writer.write_all(input.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.shutdown().await?;
        }

        let mut stdout_reader = attached
            .stdout()
            .ok_or_else(|| Error::internal("exec", "stdout not attached"))?;
        let mut stderr_reader = attached
            .stderr()
            .ok_or_else(|| Error::internal("exec", "stderr not attached"))?;
        let status = attached.take_status();

        let mut stdout = String::new();
        let mut stderr = String::new();
        let (out, err) = tokio::join!(
            stdout_reader.read_to_string(&mut stdout),
            stderr_reader.read_to_string(&mut stderr)
        );
        out?;
        err?;

        let status = match status {
            Some(fut) => fut.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| Error::internal("exec", e.to_string()))?;

        let success = status
            .as_ref()
            .and_then(|s| s.status.as_deref())
            .map(|s| s == "Success")
            .unwrap_or(false);

        Ok(ExecOutput {
            stdout,
            stderr,
            success,
        })
    }
}

#[async_trait]
impl ControlPlaneClient for KubeControlPlane {
    async fn namespace_exists(&self, name: &str) -> Result<bool, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = retry_with_backoff(&self.retry, "get_namespace", || api.get_opt(name)).await?;
        Ok(ns.is_some())
    }

    async fn ensure_namespace(&self, name: &str) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name }
        });
        let params = PatchParams::apply(FIELD_MANAGER);
        let patch = Patch::Apply(&ns);
        retry_with_backoff(&self.retry, "ensure_namespace", || {
            api.patch(name, &params, &patch)
        })
        .await?;
        debug!(namespace = %name, "namespace ensured");
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodInfo>, Error> {
        let pods = self.pods(namespace);
        let params = ListParams::default().labels(selector);
        let list = retry_with_backoff(&self.retry, "list_pods", || pods.list(&params)).await?;

        Ok(list
            .items
            .into_iter()
            .filter_map(|pod| {
                let name = pod.metadata.name?;
                Some(PodInfo {
                    name,
                    phase: pod
                        .status
                        .and_then(|s| s.phase)
                        .unwrap_or_else(|| "Unknown".to_string()),
                    terminating: pod.metadata.deletion_timestamp.is_some(),
                })
            })
            .collect())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, Error> {
        self.attach(namespace, pod, container, command, None).await
    }

    async fn exec_with_stdin(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
        input: &str,
    ) -> Result<ExecOutput, Error> {
        self.attach(namespace, pod, container, command, Some(input))
            .await
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<String, Error> {
        let params = LogParams {
            container: Some(container.to_string()),
            tail_lines: Some(LOG_TAIL_LINES),
            ..Default::default()
        };
        Ok(self.pods(namespace).logs(pod, &params).await?)
    }

    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = retry_with_backoff(&self.retry, "get_secret", || api.get_opt(name)).await?;

        Ok(secret.map(|s| {
            s.data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect()
        }))
    }

    async fn patch_config_map_data(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "data": data });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(namespace = %namespace, config_map = %name, "config map patched");
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        match self.pods(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn external_host(&self, namespace: &str, name: &str) -> Result<Option<String>, Error> {
        // OpenShift Route first; a 404 also covers clusters without the Route CRD
        let gvk = GroupVersionKind::gvk("route.openshift.io", "v1", "Route");
        let routes: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &ApiResource::from_gvk(&gvk));
        match routes.get(name).await {
            Ok(route) => {
                if let Some(host) = route.data["spec"]["host"].as_str() {
                    return Ok(Some(host.to_string()));
                }
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                trace!(route = %name, "no route found, trying ingress");
            }
            Err(e) => return Err(e.into()),
        }

        let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        let host = ingresses.get_opt(name).await?.and_then(|ing| {
            ing.spec?
                .rules?
                .into_iter()
                .find_map(|rule| rule.host)
        });
        Ok(host)
    }
}
