use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::core::ResourceExt;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::controller::Error;
use crate::crd::{INSTALLER_LABEL_KEY, INSTALLER_LABEL_VALUE};

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "educates-installer";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Create,
    Apply,
}

fn kind_of<T>() -> String
where
    T: Resource,
    <T as Resource>::DynamicType: Default,
{
    T::kind(&Default::default()).to_string()
}

/// 404 means "absent", which is what every caller here wants to know.
fn absent_ok<T>(result: Result<T, kube::Error>) -> Result<Option<T>, Error> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn conflict_to_exists<T>(result: Result<T, kube::Error>, kind: String, name: String) -> Result<T, Error> {
    match result {
        Ok(v) => Ok(v),
        Err(kube::Error::Api(response)) if response.code == 409 => {
            Err(Error::AlreadyExists { kind, name })
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_operation<T>(api: Api<T>, operation: Operation, value: &T) -> Result<T, Error>
where
    T: Clone + DeserializeOwned + Debug + Serialize + ResourceExt,
    <T as Resource>::DynamicType: Default,
{
    let name = value.name_any();
    match operation {
        Operation::Create => {
            let result = api.create(&PostParams::default(), value).await;
            conflict_to_exists(result, kind_of::<T>(), name)
        }
        Operation::Apply => {
            let params = PatchParams::apply(FIELD_MANAGER).force();
            Ok(api.patch(&name, &params, &Patch::Apply(value)).await?)
        }
    }
}

pub async fn perform_operation<T>(
    client: Client,
    operation: Operation,
    value: &T,
) -> Result<T, Error>
where
    T: Clone + DeserializeOwned + Debug + Serialize + ResourceExt,
    <T as Resource>::DynamicType: Default,
    T: Resource<Scope = NamespaceResourceScope>,
{
    let api: Api<T> = Api::namespaced(client, &value.namespace().unwrap_or("default".into()));
    run_operation(api, operation, value).await
}

pub async fn perform_cluster_operation<T>(
    client: Client,
    operation: Operation,
    value: &T,
) -> Result<T, Error>
where
    T: Clone + DeserializeOwned + Debug + Serialize + ResourceExt,
    <T as Resource>::DynamicType: Default,
    T: Resource<Scope = ClusterResourceScope>,
{
    let api: Api<T> = Api::all(client);
    run_operation(api, operation, value).await
}

pub async fn perform_get<T>(client: Client, name: &str, namespace: &str) -> Result<Option<T>, Error>
where
    T: Clone + DeserializeOwned + Debug,
    <T as Resource>::DynamicType: Default,
    T: Resource<Scope = NamespaceResourceScope>,
{
    let api: Api<T> = Api::namespaced(client, namespace);
    absent_ok(api.get(name).await)
}

pub async fn perform_cluster_get<T>(client: Client, name: &str) -> Result<Option<T>, Error>
where
    T: Clone + DeserializeOwned + Debug,
    <T as Resource>::DynamicType: Default,
    T: Resource<Scope = ClusterResourceScope>,
{
    let api: Api<T> = Api::all(client);
    absent_ok(api.get(name).await)
}

pub async fn perform_delete<T>(client: Client, name: &str, namespace: &str) -> Result<(), Error>
where
    T: Clone + DeserializeOwned + Debug,
    <T as Resource>::DynamicType: Default,
    T: Resource<Scope = NamespaceResourceScope>,
{
    let api: Api<T> = Api::namespaced(client, namespace);
    absent_ok(api.delete(name, &DeleteParams::default()).await)?;
    Ok(())
}

pub async fn perform_cluster_delete<T>(client: Client, name: &str) -> Result<(), Error>
where
    T: Clone + DeserializeOwned + Debug,
    <T as Resource>::DynamicType: Default,
    T: Resource<Scope = ClusterResourceScope>,
{
    let api: Api<T> = Api::all(client);
    absent_ok(api.delete(name, &DeleteParams::default()).await)?;
    Ok(())
}

pub fn installer_labels() -> BTreeMap<String, String> {
    let mut labels: BTreeMap<String, String> = BTreeMap::new();
    labels.insert(INSTALLER_LABEL_KEY.into(), INSTALLER_LABEL_VALUE.into());
    labels.insert("app.kubernetes.io/managed-by".into(), "educates-installer".into());
    labels
}
