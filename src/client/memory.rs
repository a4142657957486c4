//! In-memory [`ClusterState`] used by tests and offline tooling.
//!
//! Objects are stored per kind, keyed by namespace and name. Every write bumps
//! a global resource version, and replaces that carry a stale version fail
//! with 409 exactly like the API server would.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::Resource;
use tokio::sync::Mutex;

use super::cluster_state::{ClusterState, Labels, labels_match};
use crate::controller::error::{Result, api_error};
use crate::crd::VerticaDB;

type Key = (String, String);

#[derive(Default)]
struct Store {
    resource_version: u64,
    vdbs: BTreeMap<Key, VerticaDB>,
    statefulsets: BTreeMap<Key, StatefulSet>,
    pods: BTreeMap<Key, Pod>,
    services: BTreeMap<Key, Service>,
    secrets: BTreeMap<Key, Secret>,
    /// Number of upcoming VerticaDB writes that should fail with a conflict.
    pending_conflicts: u32,
    vdb_writes: u32,
}

impl Store {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

fn key_of<K: Resource>(namespace: &str, obj: &K) -> Key {
    (
        namespace.to_string(),
        obj.meta().name.clone().unwrap_or_default(),
    )
}

fn insert<K: Resource + Clone>(
    map: &mut BTreeMap<Key, K>,
    version: String,
    namespace: &str,
    obj: &K,
) -> K {
    let mut obj = obj.clone();
    obj.meta_mut().namespace = Some(namespace.to_string());
    obj.meta_mut().resource_version = Some(version);
    map.insert(key_of(namespace, &obj), obj.clone());
    obj
}

fn check_version<K: Resource>(existing: Option<&K>, incoming: &K, kind: &str) -> Result<()> {
    let Some(existing) = existing else {
        return Err(api_error(404, "NotFound", format!("{kind} not found")));
    };
    match incoming.meta().resource_version.as_deref() {
        Some(rv) if Some(rv) != existing.meta().resource_version.as_deref() => Err(api_error(
            409,
            "Conflict",
            format!("{kind} has been modified"),
        )),
        _ => Ok(()),
    }
}

fn list_matching<K: Resource + Clone>(
    map: &BTreeMap<Key, K>,
    namespace: &str,
    selector: &Labels,
) -> Vec<K> {
    map.iter()
        .filter(|((ns, _), obj)| ns == namespace && labels_match(selector, obj.meta().labels.as_ref()))
        .map(|(_, obj)| obj.clone())
        .collect()
}

/// In-memory object store implementing [`ClusterState`].
#[derive(Default)]
pub struct MemoryClusterState {
    store: Mutex<Store>,
}

impl MemoryClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a VerticaDB as-is (status included) and return the stored copy.
    pub async fn put_vdb(&self, vdb: &VerticaDB) -> VerticaDB {
        let mut store = self.store.lock().await;
        let version = store.next_version();
        let ns = vdb.namespace_or_default();
        insert(&mut store.vdbs, version, &ns, vdb)
    }

    pub async fn put_statefulset(&self, namespace: &str, sts: &StatefulSet) -> StatefulSet {
        let mut store = self.store.lock().await;
        let version = store.next_version();
        insert(&mut store.statefulsets, version, namespace, sts)
    }

    pub async fn put_pod(&self, namespace: &str, pod: &Pod) -> Pod {
        let mut store = self.store.lock().await;
        let version = store.next_version();
        insert(&mut store.pods, version, namespace, pod)
    }

    pub async fn put_service(&self, namespace: &str, svc: &Service) -> Service {
        let mut store = self.store.lock().await;
        let version = store.next_version();
        insert(&mut store.services, version, namespace, svc)
    }

    pub async fn put_secret(&self, namespace: &str, secret: &Secret) -> Secret {
        let mut store = self.store.lock().await;
        let version = store.next_version();
        insert(&mut store.secrets, version, namespace, secret)
    }

    /// Make the next `n` VerticaDB writes fail with 409.
    pub async fn inject_vdb_conflicts(&self, n: u32) {
        self.store.lock().await.pending_conflicts = n;
    }

    /// Number of VerticaDB writes (spec or status) that succeeded.
    pub async fn vdb_write_count(&self) -> u32 {
        self.store.lock().await.vdb_writes
    }

    pub async fn all_pods(&self, namespace: &str) -> Vec<Pod> {
        list_matching(&self.store.lock().await.pods, namespace, &Labels::new())
    }

    pub async fn all_statefulsets(&self, namespace: &str) -> Vec<StatefulSet> {
        list_matching(
            &self.store.lock().await.statefulsets,
            namespace,
            &Labels::new(),
        )
    }

    async fn write_vdb(&self, vdb: &VerticaDB, status_only: bool) -> Result<VerticaDB> {
        let mut store = self.store.lock().await;
        let ns = vdb.namespace_or_default();
        let key = key_of(&ns, vdb);
        if store.pending_conflicts > 0 {
            store.pending_conflicts -= 1;
            return Err(api_error(409, "Conflict", "injected conflict"));
        }
        check_version(store.vdbs.get(&key), vdb, "VerticaDB")?;
        let mut merged = vdb.clone();
        if let Some(existing) = store.vdbs.get(&key) {
            // Each endpoint only updates its own half of the object.
            if status_only {
                merged.metadata = existing.metadata.clone();
                merged.spec = existing.spec.clone();
            } else {
                merged.status = existing.status.clone();
            }
        }
        let version = store.next_version();
        store.vdb_writes += 1;
        Ok(insert(&mut store.vdbs, version, &ns, &merged))
    }
}

#[async_trait]
impl ClusterState for MemoryClusterState {
    async fn get_vdb(&self, namespace: &str, name: &str) -> Result<VerticaDB> {
        self.store
            .lock()
            .await
            .vdbs
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound", format!("verticadb {name} not found")))
    }

    async fn replace_vdb(&self, vdb: &VerticaDB) -> Result<VerticaDB> {
        self.write_vdb(vdb, false).await
    }

    async fn replace_vdb_status(&self, vdb: &VerticaDB) -> Result<VerticaDB> {
        self.write_vdb(vdb, true).await
    }

    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self
            .store
            .lock()
            .await
            .statefulsets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_statefulsets(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> Result<Vec<StatefulSet>> {
        Ok(list_matching(
            &self.store.lock().await.statefulsets,
            namespace,
            selector,
        ))
    }

    async fn create_statefulset(&self, namespace: &str, sts: &StatefulSet) -> Result<StatefulSet> {
        let mut store = self.store.lock().await;
        if store.statefulsets.contains_key(&key_of(namespace, sts)) {
            return Err(api_error(409, "AlreadyExists", "statefulset exists"));
        }
        let version = store.next_version();
        Ok(insert(&mut store.statefulsets, version, namespace, sts))
    }

    async fn replace_statefulset(
        &self,
        namespace: &str,
        sts: &StatefulSet,
    ) -> Result<StatefulSet> {
        let mut store = self.store.lock().await;
        check_version(
            store.statefulsets.get(&key_of(namespace, sts)),
            sts,
            "StatefulSet",
        )?;
        let version = store.next_version();
        Ok(insert(&mut store.statefulsets, version, namespace, sts))
    }

    async fn delete_statefulset(&self, namespace: &str, name: &str) -> Result<()> {
        self.store
            .lock()
            .await
            .statefulsets
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self
            .store
            .lock()
            .await
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_pods(&self, namespace: &str, selector: &Labels) -> Result<Vec<Pod>> {
        Ok(list_matching(&self.store.lock().await.pods, namespace, selector))
    }

    async fn replace_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        let mut store = self.store.lock().await;
        check_version(store.pods.get(&key_of(namespace, pod)), pod, "Pod")?;
        let version = store.next_version();
        Ok(insert(&mut store.pods, version, namespace, pod))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.store
            .lock()
            .await
            .pods
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self
            .store
            .lock()
            .await
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_services(&self, namespace: &str, selector: &Labels) -> Result<Vec<Service>> {
        Ok(list_matching(
            &self.store.lock().await.services,
            namespace,
            selector,
        ))
    }

    async fn create_service(&self, namespace: &str, svc: &Service) -> Result<Service> {
        let mut store = self.store.lock().await;
        if store.services.contains_key(&key_of(namespace, svc)) {
            return Err(api_error(409, "AlreadyExists", "service exists"));
        }
        let version = store.next_version();
        Ok(insert(&mut store.services, version, namespace, svc))
    }

    async fn replace_service(&self, namespace: &str, svc: &Service) -> Result<Service> {
        let mut store = self.store.lock().await;
        check_version(store.services.get(&key_of(namespace, svc)), svc, "Service")?;
        let version = store.next_version();
        Ok(insert(&mut store.services, version, namespace, svc))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self
            .store
            .lock()
            .await
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}
