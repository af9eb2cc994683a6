//! Blueprint persistence in a ConfigMap.
//!
//! One ConfigMap per cluster, `<cluster>-blueprint`, one data key per logical
//! node. Every write is a read-modify-replace carrying the `resourceVersion`
//! it read, so a concurrent writer surfaces as a 409 and the core retries.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, PostParams};
use std::collections::BTreeMap;
use tracing::debug;

use redis_operator::{KvBackend, OperatorError, Result};

use crate::error::Error;

/// `KvBackend` over a single ConfigMap.
pub struct ConfigMapKv {
    api: Api<ConfigMap>,
    name: String,
    labels: BTreeMap<String, String>,
    owner: Option<OwnerReference>,
}

impl ConfigMapKv {
    pub fn new(
        api: Api<ConfigMap>,
        cluster: &str,
        labels: BTreeMap<String, String>,
        owner: Option<OwnerReference>,
    ) -> Self {
        Self {
            api,
            name: config_map_name(cluster),
            labels,
            owner,
        }
    }

    async fn read(&self) -> Result<Option<ConfigMap>> {
        self.api.get_opt(&self.name).await.map_err(persistence)
    }

    fn fresh(&self, data: BTreeMap<String, String>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                labels: Some(self.labels.clone()),
                owner_references: self.owner.clone().map(|o| vec![o]),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    /// Apply `change` to the current data and write it back, failing with
    /// `Conflict` when someone else wrote in between.
    async fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let pp = PostParams::default();
        match self.read().await? {
            Some(mut cm) => {
                let mut data = cm.data.take().unwrap_or_default();
                change(&mut data);
                cm.data = Some(data);
                self.api.replace(&self.name, &pp, &cm).await.map_err(persistence)?;
            }
            None => {
                let mut data = BTreeMap::new();
                change(&mut data);
                self.api.create(&pp, &self.fresh(data)).await.map_err(persistence)?;
                debug!(name = %self.name, "Blueprint ConfigMap created");
            }
        }
        Ok(())
    }
}

pub fn config_map_name(cluster: &str) -> String {
    format!("{}-blueprint", cluster)
}

fn persistence(e: kube::Error) -> OperatorError {
    OperatorError::from(Error::Kube(e))
}

#[async_trait]
impl KvBackend for ConfigMapKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .read()
            .await?
            .and_then(|cm| cm.data)
            .and_then(|mut data| data.remove(key)))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.update(|data| {
            data.insert(key.to_string(), value);
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.update(|data| {
            data.remove(key);
        })
        .await
    }

    async fn list(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.read().await?.and_then(|cm| cm.data).unwrap_or_default())
    }

    async fn replace_all(&self, entries: BTreeMap<String, String>) -> Result<()> {
        self.update(|data| *data = entries).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_maps_to_core_conflict() {
        let e = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        });
        assert!(persistence(e).is_conflict());
    }

    #[test]
    fn test_config_map_name() {
        assert_eq!(config_map_name("orders-cache"), "orders-cache-blueprint");
    }
}
