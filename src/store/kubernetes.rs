//! Resource store backed by the Kubernetes API.

use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{record_key, ResourceStore};
use crate::crd::MANAGER_NAME;
use crate::error::{Error, Result};

/// Store for one custom resource kind
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }

    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
    <K as Resource>::DynamicType: Default,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>> {
        let lp = ListParams::default().labels(label_selector);
        Ok(self.api(namespace).list(&lp).await?.items)
    }

    async fn create(&self, record: &K) -> Result<K> {
        let namespace = record.namespace().unwrap_or_default();
        match self
            .api(&namespace)
            .create(&PostParams::default(), record)
            .await
        {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                Err(Error::AlreadyExists(record_key(record)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_status(&self, record: &K) -> Result<K> {
        let namespace = record.namespace().unwrap_or_default();
        let name = record.name_any();

        let value = serde_json::to_value(record)?;
        let mut patch = serde_json::json!({
            "status": value.get("status").cloned().unwrap_or_default()
        });
        // A merge patch carrying resourceVersion is rejected with 409 when stale
        if let Some(version) = record.resource_version() {
            patch["metadata"] = serde_json::json!({ "resourceVersion": version });
        }

        let pp = PatchParams::apply(MANAGER_NAME);
        match self
            .api(&namespace)
            .patch_status(&name, &pp, &Patch::Merge(&patch))
            .await
        {
            Ok(updated) => {
                debug!(name = %name, "Status updated");
                Ok(updated)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(Error::Conflict(record_key(record))),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(Error::NotFound(record_key(record))),
            Err(e) => Err(e.into()),
        }
    }
}
