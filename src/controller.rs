use crate::error::{EngineError, Result, with_timeout};
use crate::state::{ImageInventoryEntry, WorkloadKey, WorkloadRef};
use crate::workload_kind::WatchedWorkload;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};
use std::time::Duration;
use tracing::{debug, info};

static INCLUDE_ANNOTATION: &str = "kube-tagwatch/include";
static EXCLUDE_ANNOTATION: &str = "kube-tagwatch/exclude";
static GITOPS_TARGET_ANNOTATION: &str = "kube-tagwatch/gitops-target";
static GITOPS_DIRECTORY_ANNOTATION: &str = "kube-tagwatch/gitops-directory";

pub async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to namespace {}, Kubernetes API server with version {}.{}",
        client.default_namespace(),
        api_server_info.major,
        api_server_info.minor
    );
    Ok(client)
}

/// Read access to the orchestration platform.
#[async_trait]
pub trait WorkloadDiscovery: Send + Sync {
    /// One entry per container of every workload whose annotation `key` equals `value`.
    /// `namespace` of `None` searches all namespaces.
    async fn list_annotated_workloads(
        &self,
        namespace: Option<&str>,
        key: &str,
        value: &str,
    ) -> Result<Vec<WorkloadRef>>;

    /// Every container image running in pods of `namespace`.
    async fn list_all_images(&self, namespace: Option<&str>) -> Result<Vec<ImageInventoryEntry>>;

    /// Image currently declared for the container, `None` if the workload or container is gone.
    async fn live_image(&self, key: &WorkloadKey) -> Result<Option<String>>;
}

pub struct KubeDiscovery {
    client: Client,
    timeout: Duration,
}

impl KubeDiscovery {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn api<K: WatchedWorkload>(&self, namespace: Option<&str>) -> Api<K> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    async fn list_kind<K: WatchedWorkload>(
        &self,
        namespace: Option<&str>,
        key: &str,
        value: &str,
    ) -> Result<Vec<WorkloadRef>> {
        let api: Api<K> = self.api(namespace);
        let list = with_timeout(
            "Kubernetes workload listing",
            self.timeout,
            async { api.list(&ListParams::default()).await.map_err(discovery_error) },
        )
        .await?;

        let refs: Vec<WorkloadRef> = list
            .items
            .iter()
            .filter(|workload| workload.annotation(key) == Some(value))
            .flat_map(to_workload_refs::<K>)
            .collect();
        info!(
            "Found {} annotated {} containers with {}={}",
            refs.len(),
            K::kind_name(),
            key,
            value
        );
        Ok(refs)
    }

    async fn live_image_of<K: WatchedWorkload>(&self, key: &WorkloadKey) -> Result<Option<String>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);
        let workload = with_timeout("Kubernetes workload lookup", self.timeout, async {
            api.get_opt(&key.workload_name).await.map_err(discovery_error)
        })
        .await?;

        Ok(workload.and_then(|w| {
            w.containers()
                .into_iter()
                .find(|c| c.name == key.container_name)
                .and_then(|c| c.image.clone())
        }))
    }
}

fn discovery_error(e: kube::Error) -> EngineError {
    EngineError::Discovery(e.to_string())
}

fn to_workload_refs<K: WatchedWorkload>(workload: &K) -> Vec<WorkloadRef> {
    let meta = workload.meta();
    let namespace = meta.namespace.clone().unwrap_or_default();
    let name = meta.name.clone().unwrap_or_default();
    let hint = |key: &str| {
        workload
            .annotation(key)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    workload
        .containers()
        .into_iter()
        .filter_map(|container| {
            let image = container.image.clone()?;
            debug!(
                "Watching {}/{} container {} with image {}",
                namespace, name, container.name, image
            );
            Some(WorkloadRef {
                key: WorkloadKey {
                    namespace: namespace.clone(),
                    kind: K::kind_name().to_string(),
                    workload_name: name.clone(),
                    container_name: container.name.clone(),
                },
                image,
                include_pattern: hint(INCLUDE_ANNOTATION),
                exclude_pattern: hint(EXCLUDE_ANNOTATION),
                gitops_target: hint(GITOPS_TARGET_ANNOTATION),
                gitops_directory: hint(GITOPS_DIRECTORY_ANNOTATION),
            })
        })
        .collect()
}

#[async_trait]
impl WorkloadDiscovery for KubeDiscovery {
    async fn list_annotated_workloads(
        &self,
        namespace: Option<&str>,
        key: &str,
        value: &str,
    ) -> Result<Vec<WorkloadRef>> {
        let mut refs = self.list_kind::<Deployment>(namespace, key, value).await?;
        refs.extend(self.list_kind::<StatefulSet>(namespace, key, value).await?);
        Ok(refs)
    }

    async fn list_all_images(&self, namespace: Option<&str>) -> Result<Vec<ImageInventoryEntry>> {
        let pods: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let list = with_timeout("Kubernetes pod listing", self.timeout, async {
            pods.list(&ListParams::default()).await.map_err(discovery_error)
        })
        .await?;

        let now = Utc::now();
        Ok(list
            .items
            .iter()
            .flat_map(|pod| {
                let namespace = pod.metadata.namespace.clone().unwrap_or_default();
                pod.spec
                    .iter()
                    .flat_map(|spec| spec.containers.iter())
                    .filter_map(move |c| {
                        c.image.clone().map(|image| ImageInventoryEntry {
                            namespace: namespace.clone(),
                            image,
                            time_scanned: now,
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    async fn live_image(&self, key: &WorkloadKey) -> Result<Option<String>> {
        match key.kind.as_str() {
            "Deployment" => self.live_image_of::<Deployment>(key).await,
            "StatefulSet" => self.live_image_of::<StatefulSet>(key).await,
            other => Err(EngineError::Discovery(format!(
                "unsupported workload kind {}",
                other
            ))),
        }
    }
}
