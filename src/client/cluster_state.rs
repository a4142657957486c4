//! Access to the Kubernetes objects the operator reads and writes.
//!
//! The reconcile core only needs a handful of typed verbs. Keeping them behind
//! the [`ClusterState`] trait lets the actors run against the API server in
//! production and against [`MemoryClusterState`](super::memory::MemoryClusterState)
//! in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client};

use crate::controller::error::Result;
use crate::crd::VerticaDB;

/// Equality-based label selector.
pub type Labels = BTreeMap<String, String>;

/// Render a label map as a selector string (`k1=v1,k2=v2`).
pub fn selector_string(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// True if every selector entry is present in `labels`.
pub fn labels_match(selector: &Labels, labels: Option<&Labels>) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

/// Value of `key` in a Secret, from `data` or `stringData`.
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    if let Some(bytes) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return Some(String::from_utf8_lossy(&bytes.0).into_owned());
    }
    secret.string_data.as_ref().and_then(|d| d.get(key)).cloned()
}

/// Typed CRUD verbs against the cluster.
///
/// Replace calls send the object's `resourceVersion`; a stale version comes
/// back as a 409 which callers detect with `Error::is_conflict`.
#[async_trait]
pub trait ClusterState: Send + Sync {
    // === VerticaDB ===
    async fn get_vdb(&self, namespace: &str, name: &str) -> Result<VerticaDB>;
    async fn replace_vdb(&self, vdb: &VerticaDB) -> Result<VerticaDB>;
    async fn replace_vdb_status(&self, vdb: &VerticaDB) -> Result<VerticaDB>;

    // === StatefulSets ===
    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>>;
    async fn list_statefulsets(&self, namespace: &str, selector: &Labels)
    -> Result<Vec<StatefulSet>>;
    async fn create_statefulset(&self, namespace: &str, sts: &StatefulSet) -> Result<StatefulSet>;
    async fn replace_statefulset(&self, namespace: &str, sts: &StatefulSet)
    -> Result<StatefulSet>;
    async fn delete_statefulset(&self, namespace: &str, name: &str) -> Result<()>;

    // === Pods ===
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;
    async fn list_pods(&self, namespace: &str, selector: &Labels) -> Result<Vec<Pod>>;
    async fn replace_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    // === Services ===
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;
    async fn list_services(&self, namespace: &str, selector: &Labels) -> Result<Vec<Service>>;
    async fn create_service(&self, namespace: &str, svc: &Service) -> Result<Service>;
    async fn replace_service(&self, namespace: &str, svc: &Service) -> Result<Service>;

    // === Secrets ===
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
}

/// [`ClusterState`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeClusterState {
    client: Client,
}

impl KubeClusterState {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn name_of<K: kube::Resource>(obj: &K) -> &str {
    obj.meta().name.as_deref().unwrap_or_default()
}

#[async_trait]
impl ClusterState for KubeClusterState {
    async fn get_vdb(&self, namespace: &str, name: &str) -> Result<VerticaDB> {
        Ok(self.api::<VerticaDB>(namespace).get(name).await?)
    }

    async fn replace_vdb(&self, vdb: &VerticaDB) -> Result<VerticaDB> {
        let api = self.api::<VerticaDB>(&vdb.namespace_or_default());
        Ok(api
            .replace(name_of(vdb), &PostParams::default(), vdb)
            .await?)
    }

    async fn replace_vdb_status(&self, vdb: &VerticaDB) -> Result<VerticaDB> {
        let api = self.api::<VerticaDB>(&vdb.namespace_or_default());
        let body = serde_json::to_vec(vdb)?;
        Ok(api
            .replace_status(name_of(vdb), &PostParams::default(), body)
            .await?)
    }

    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self.api::<StatefulSet>(namespace).get_opt(name).await?)
    }

    async fn list_statefulsets(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> Result<Vec<StatefulSet>> {
        let lp = ListParams::default().labels(&selector_string(selector));
        Ok(self.api::<StatefulSet>(namespace).list(&lp).await?.items)
    }

    async fn create_statefulset(&self, namespace: &str, sts: &StatefulSet) -> Result<StatefulSet> {
        Ok(self
            .api::<StatefulSet>(namespace)
            .create(&PostParams::default(), sts)
            .await?)
    }

    async fn replace_statefulset(
        &self,
        namespace: &str,
        sts: &StatefulSet,
    ) -> Result<StatefulSet> {
        Ok(self
            .api::<StatefulSet>(namespace)
            .replace(name_of(sts), &PostParams::default(), sts)
            .await?)
    }

    async fn delete_statefulset(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .api::<StatefulSet>(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.api::<Pod>(namespace).get_opt(name).await?)
    }

    async fn list_pods(&self, namespace: &str, selector: &Labels) -> Result<Vec<Pod>> {
        let lp = ListParams::default().labels(&selector_string(selector));
        Ok(self.api::<Pod>(namespace).list(&lp).await?.items)
    }

    async fn replace_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        Ok(self
            .api::<Pod>(namespace)
            .replace(name_of(pod), &PostParams::default(), pod)
            .await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .api::<Pod>(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.api::<Service>(namespace).get_opt(name).await?)
    }

    async fn list_services(&self, namespace: &str, selector: &Labels) -> Result<Vec<Service>> {
        let lp = ListParams::default().labels(&selector_string(selector));
        Ok(self.api::<Service>(namespace).list(&lp).await?.items)
    }

    async fn create_service(&self, namespace: &str, svc: &Service) -> Result<Service> {
        Ok(self
            .api::<Service>(namespace)
            .create(&PostParams::default(), svc)
            .await?)
    }

    async fn replace_service(&self, namespace: &str, svc: &Service) -> Result<Service> {
        Ok(self
            .api::<Service>(namespace)
            .replace(name_of(svc), &PostParams::default(), svc)
            .await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.api::<Secret>(namespace).get_opt(name).await?)
    }
}
