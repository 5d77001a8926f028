use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Container, PodSpec};
use kube::Resource;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Workload kinds whose pod templates are watched for image updates.
pub trait WatchedWorkload
where
    Self: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Send
        + Sync
        + DeserializeOwned
        + 'static,
{
    fn kind_name() -> &'static str {
        std::any::type_name::<Self>()
            .rsplit("::")
            .next()
            .unwrap_or("Unknown")
    }

    fn pod_spec(&self) -> Option<&PodSpec>;

    fn template_annotations(&self) -> Option<&BTreeMap<String, String>>;

    /// Looks an annotation up on the workload first, then on its pod template.
    fn annotation(&self, key: &str) -> Option<&str> {
        self.meta()
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .or_else(|| self.template_annotations().and_then(|a| a.get(key)))
            .map(String::as_str)
    }

    fn containers(&self) -> Vec<&Container> {
        self.pod_spec()
            .map(|spec| {
                spec.containers
                    .iter()
                    .chain(spec.init_containers.iter().flatten())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl WatchedWorkload for Deployment {
    //https://kubernetes.io/docs/reference/kubernetes-api/workload-resources/deployment-v1/
    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }

    fn template_annotations(&self) -> Option<&BTreeMap<String, String>> {
        self.spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.annotations.as_ref())
    }
}

impl WatchedWorkload for StatefulSet {
    //https://kubernetes.io/docs/reference/kubernetes-api/workload-resources/stateful-set-v1/
    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }

    fn template_annotations(&self) -> Option<&BTreeMap<String, String>> {
        self.spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.annotations.as_ref())
    }
}
