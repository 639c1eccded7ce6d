use async_trait::async_trait;
use kube::core::ResourceExt;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::controller::Error;

/// The slice of the cluster object API the reconciler needs for its own
/// bookkeeping objects.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Resource + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K, Error>;
    async fn list(&self, namespace: &str) -> Result<Vec<K>, Error>;
    async fn create(&self, object: &K) -> Result<K, Error>;
    async fn update(&self, object: &K) -> Result<K, Error>;
}

type StoreKey = (String, String, String);

/// Object store that never leaves the process. Objects are kept serialized
/// and get `uid`, `resourceVersion` and `generation` assigned the way the API
/// server would: `generation` only moves when something other than
/// `metadata` or `status` changes.
#[derive(Default)]
pub struct InMemoryStore {
    objects: Mutex<BTreeMap<StoreKey, Value>>,
    next_uid: AtomicU64,
}

fn key_of<K>(namespace: &str, name: &str) -> StoreKey
where
    K: Resource<DynamicType = ()>,
{
    (K::kind(&()).to_string(), namespace.to_string(), name.to_string())
}

fn object_key<K>(object: &K) -> Result<StoreKey, Error>
where
    K: Resource<DynamicType = ()>,
{
    let name = object
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::InvalidObject(format!("{} has no name", K::kind(&()))))?;
    let namespace = object.meta().namespace.clone().unwrap_or_else(|| "default".into());
    Ok(key_of::<K>(&namespace, &name))
}

/// Everything that counts towards `generation`.
fn desired_state(value: &Value) -> Value {
    let mut value = value.clone();
    if let Some(map) = value.as_object_mut() {
        map.remove("metadata");
        map.remove("status");
    }
    value
}

impl InMemoryStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<StoreKey, Value>> {
        match self.objects.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl<K> ObjectStore<K> for InMemoryStore
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K, Error> {
        let objects = self.lock();
        match objects.get(&key_of::<K>(namespace, name)) {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => Err(Error::NotFound {
                kind: K::kind(&()).to_string(),
                name: format!("{}/{}", namespace, name),
            }),
        }
    }

    async fn list(&self, namespace: &str) -> Result<Vec<K>, Error> {
        let kind = K::kind(&()).to_string();
        let objects = self.lock();
        objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .map(|(_, value)| serde_json::from_value(value.clone()).map_err(Error::from))
            .collect()
    }

    async fn create(&self, object: &K) -> Result<K, Error> {
        let key = object_key(object)?;
        let mut objects = self.lock();
        if objects.contains_key(&key) {
            return Err(Error::AlreadyExists {
                kind: key.0,
                name: format!("{}/{}", key.1, key.2),
            });
        }

        let mut stored = object.clone();
        let uid = self.next_uid.fetch_add(1, Ordering::SeqCst) + 1;
        let meta = stored.meta_mut();
        meta.namespace = Some(key.1.clone());
        meta.uid = Some(format!("local-{}", uid));
        meta.resource_version = Some("1".into());
        meta.generation = Some(1);

        objects.insert(key, serde_json::to_value(&stored)?);
        Ok(stored)
    }

    async fn update(&self, object: &K) -> Result<K, Error> {
        let key = object_key(object)?;
        let mut objects = self.lock();
        let current: K = match objects.get(&key) {
            Some(value) => serde_json::from_value(value.clone())?,
            None => {
                return Err(Error::NotFound {
                    kind: key.0,
                    name: format!("{}/{}", key.1, key.2),
                })
            }
        };

        let current_version: u64 = current
            .resource_version()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if let Some(version) = object.resource_version() {
            if version != current_version.to_string() {
                return Err(Error::Conflict {
                    kind: key.0,
                    name: format!("{}/{}", key.1, key.2),
                });
            }
        }

        let mut stored = object.clone();
        let generation = current.meta().generation.unwrap_or(1);
        let changed = desired_state(&serde_json::to_value(&current)?)
            != desired_state(&serde_json::to_value(&stored)?);

        let meta = stored.meta_mut();
        meta.uid = current.meta().uid.clone();
        meta.resource_version = Some((current_version + 1).to_string());
        meta.generation = Some(if changed { generation + 1 } else { generation });

        objects.insert(key, serde_json::to_value(&stored)?);
        Ok(stored)
    }
}
