use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::{Namespace, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::runtime::watcher::{self, watcher, Event};
use kube::{Api, Client};

#[cfg(test)]
use mockall::automock;

use super::utils::{
    perform_cluster_delete, perform_cluster_get, perform_cluster_operation, perform_delete,
    perform_get, perform_operation, Operation,
};
use crate::controller::Error;
use crate::crd::App;

/// What the completion gate sees of the installation while it waits.
#[derive(Clone, Debug)]
pub enum AppEvent {
    Applied(App),
    Deleted(App),
    /// Full listing after the watch (re)started.
    Listed(Vec<App>),
}

/// The real cluster as seen by the installer.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error>;
    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), Error>;
    async fn delete_namespace(&self, name: &str) -> Result<(), Error>;

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, Error>;
    async fn create_service_account(&self, account: &ServiceAccount) -> Result<(), Error>;
    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<(), Error>;
    /// Short-lived bearer token for the service account.
    async fn request_service_account_token(
        &self,
        namespace: &str,
        name: &str,
        expiration_seconds: i64,
    ) -> Result<String, Error>;

    async fn get_cluster_role_binding(&self, name: &str)
        -> Result<Option<ClusterRoleBinding>, Error>;
    async fn create_cluster_role_binding(&self, binding: &ClusterRoleBinding)
        -> Result<(), Error>;
    async fn delete_cluster_role_binding(&self, name: &str) -> Result<(), Error>;

    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error>;
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error>;

    async fn get_app(&self, namespace: &str, name: &str) -> Result<Option<App>, Error>;
    async fn apply_app(&self, app: &App) -> Result<(), Error>;
    async fn delete_app(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Event stream for installations matching `label_selector`. Dropping the
    /// stream ends the watch.
    async fn watch_apps(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<BoxStream<'static, Result<AppEvent, Error>>, Error>;
}

pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> KubeClusterClient {
        KubeClusterClient { client }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error> {
        perform_cluster_get(self.client.clone(), name).await
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), Error> {
        perform_cluster_operation(self.client.clone(), Operation::Create, namespace).await?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), Error> {
        perform_cluster_delete::<Namespace>(self.client.clone(), name).await
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, Error> {
        perform_get(self.client.clone(), name, namespace).await
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> Result<(), Error> {
        perform_operation(self.client.clone(), Operation::Create, account).await?;
        Ok(())
    }

    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<(), Error> {
        perform_delete::<ServiceAccount>(self.client.clone(), name, namespace).await
    }

    async fn request_service_account_token(
        &self,
        namespace: &str,
        name: &str,
        expiration_seconds: i64,
    ) -> Result<String, Error> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let request = TokenRequest {
            metadata: Default::default(),
            spec: TokenRequestSpec {
                audiences: vec![],
                expiration_seconds: Some(expiration_seconds),
                bound_object_ref: None,
            },
            status: None,
        };
        let response = api
            .create_token_request(name, &Default::default(), &request)
            .await?;
        match response.status.map(|status| status.token) {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(Error::InvalidObject(format!(
                "TokenRequest for {}/{} returned no token",
                namespace, name
            ))),
        }
    }

    async fn get_cluster_role_binding(
        &self,
        name: &str,
    ) -> Result<Option<ClusterRoleBinding>, Error> {
        perform_cluster_get(self.client.clone(), name).await
    }

    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<(), Error> {
        perform_cluster_operation(self.client.clone(), Operation::Create, binding).await?;
        Ok(())
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<(), Error> {
        perform_cluster_delete::<ClusterRoleBinding>(self.client.clone(), name).await
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error> {
        perform_operation(self.client.clone(), Operation::Apply, secret).await?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error> {
        perform_delete::<Secret>(self.client.clone(), name, namespace).await
    }

    async fn get_app(&self, namespace: &str, name: &str) -> Result<Option<App>, Error> {
        perform_get(self.client.clone(), name, namespace).await
    }

    async fn apply_app(&self, app: &App) -> Result<(), Error> {
        perform_operation(self.client.clone(), Operation::Apply, app).await?;
        Ok(())
    }

    async fn delete_app(&self, namespace: &str, name: &str) -> Result<(), Error> {
        perform_delete::<App>(self.client.clone(), name, namespace).await
    }

    async fn watch_apps(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<BoxStream<'static, Result<AppEvent, Error>>, Error> {
        let api: Api<App> = Api::namespaced(self.client.clone(), namespace);
        let config = watcher::Config::default().labels(label_selector);

        let events = watcher(api, config)
            .map(|event| match event {
                Ok(Event::Applied(app)) => Ok(AppEvent::Applied(app)),
                Ok(Event::Deleted(app)) => Ok(AppEvent::Deleted(app)),
                Ok(Event::Restarted(apps)) => Ok(AppEvent::Listed(apps)),
                Err(e) => Err(Error::from(e)),
            })
            .boxed();
        Ok(events)
    }
}
