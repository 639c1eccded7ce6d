use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use kube::core::ObjectMeta;
use tracing::{debug, info, warn};

use super::client::ClusterClient;
use super::utils::installer_labels;
use crate::controller::Error;

pub const INSTALLER_NAMESPACE: &str = "educates-installer";
pub const INSTALLER_SERVICE_ACCOUNT: &str = "educates-installer-sa";
pub const INSTALLER_CLUSTER_ROLE_BINDING: &str = "educates-installer-sa-cluster-admin";
pub const CLUSTER_ADMIN_ROLE: &str = "cluster-admin";
/// Long enough for a slow deploy. The API server rejects anything under 600.
pub const TOKEN_EXPIRATION_SECONDS: i64 = 3600;

/// Namespace, service account and cluster-admin binding the installation
/// acts through while it runs.
pub struct IdentityProvisioner<'a, C: ClusterClient + ?Sized> {
    client: &'a C,
}

fn setup_error(resource: &str, source: Error) -> Error {
    Error::Setup {
        resource: resource.into(),
        source: Box::new(source),
    }
}

/// "Already exists" means another run got there first, which is fine.
fn tolerate_existing(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(Error::AlreadyExists { kind, name }) => {
            debug!("{} {} already exists", kind, name);
            Ok(())
        }
        other => other,
    }
}

impl<'a, C: ClusterClient + ?Sized> IdentityProvisioner<'a, C> {
    pub fn new(client: &'a C) -> IdentityProvisioner<'a, C> {
        IdentityProvisioner { client }
    }

    pub async fn ensure(&self) -> Result<(), Error> {
        self.ensure_namespace()
            .await
            .map_err(|e| setup_error(&format!("namespace {}", INSTALLER_NAMESPACE), e))?;
        self.ensure_service_account().await.map_err(|e| {
            setup_error(&format!("service account {}", INSTALLER_SERVICE_ACCOUNT), e)
        })?;
        self.ensure_cluster_role_binding().await.map_err(|e| {
            setup_error(
                &format!("cluster role binding {}", INSTALLER_CLUSTER_ROLE_BINDING),
                e,
            )
        })?;
        Ok(())
    }

    /// Bearer token the stages act through. Only valid once `ensure` ran.
    pub async fn token(&self) -> Result<String, Error> {
        self.client
            .request_service_account_token(
                INSTALLER_NAMESPACE,
                INSTALLER_SERVICE_ACCOUNT,
                TOKEN_EXPIRATION_SECONDS,
            )
            .await
            .map_err(|e| {
                setup_error(
                    &format!("token for service account {}", INSTALLER_SERVICE_ACCOUNT),
                    e,
                )
            })
    }

    async fn ensure_namespace(&self) -> Result<(), Error> {
        if self.client.get_namespace(INSTALLER_NAMESPACE).await?.is_some() {
            return Ok(());
        }
        info!("Creating namespace {}", INSTALLER_NAMESPACE);
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(INSTALLER_NAMESPACE.into()),
                labels: Some(installer_labels()),
                ..Default::default()
            },
            ..Default::default()
        };
        tolerate_existing(self.client.create_namespace(&namespace).await)
    }

    async fn ensure_service_account(&self) -> Result<(), Error> {
        if self
            .client
            .get_service_account(INSTALLER_NAMESPACE, INSTALLER_SERVICE_ACCOUNT)
            .await?
            .is_some()
        {
            return Ok(());
        }
        info!("Creating service account {}", INSTALLER_SERVICE_ACCOUNT);
        let account = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(INSTALLER_SERVICE_ACCOUNT.into()),
                namespace: Some(INSTALLER_NAMESPACE.into()),
                labels: Some(installer_labels()),
                ..Default::default()
            },
            ..Default::default()
        };
        tolerate_existing(self.client.create_service_account(&account).await)
    }

    async fn ensure_cluster_role_binding(&self) -> Result<(), Error> {
        if self
            .client
            .get_cluster_role_binding(INSTALLER_CLUSTER_ROLE_BINDING)
            .await?
            .is_some()
        {
            return Ok(());
        }
        info!("Creating cluster role binding {}", INSTALLER_CLUSTER_ROLE_BINDING);
        let binding = ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some(INSTALLER_CLUSTER_ROLE_BINDING.into()),
                labels: Some(installer_labels()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "ClusterRole".into(),
                name: CLUSTER_ADMIN_ROLE.into(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".into(),
                name: INSTALLER_SERVICE_ACCOUNT.into(),
                namespace: Some(INSTALLER_NAMESPACE.into()),
                ..Default::default()
            }]),
        };
        tolerate_existing(self.client.create_cluster_role_binding(&binding).await)
    }

    /// Removes the binding and service account, and the namespace when asked.
    /// Every step is attempted; the first failure is returned.
    pub async fn teardown(&self, also_delete_namespace: bool) -> Result<(), Error> {
        let mut first_error: Option<Error> = None;

        if let Err(e) = self
            .client
            .delete_cluster_role_binding(INSTALLER_CLUSTER_ROLE_BINDING)
            .await
        {
            warn!("Unable to delete cluster role binding {}: {}", INSTALLER_CLUSTER_ROLE_BINDING, e);
            first_error.get_or_insert(e);
        }

        if let Err(e) = self
            .client
            .delete_service_account(INSTALLER_NAMESPACE, INSTALLER_SERVICE_ACCOUNT)
            .await
        {
            warn!("Unable to delete service account {}: {}", INSTALLER_SERVICE_ACCOUNT, e);
            first_error.get_or_insert(e);
        }

        if also_delete_namespace {
            if let Err(e) = self.client.delete_namespace(INSTALLER_NAMESPACE).await {
                warn!("Unable to delete namespace {}: {}", INSTALLER_NAMESPACE, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::client::MockClusterClient;
    use kube::core::ResourceExt;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    type Objects = Arc<Mutex<BTreeMap<String, usize>>>;

    /// A mock cluster that remembers what was created so repeated `ensure`
    /// calls see their own earlier writes.
    fn recording_cluster(objects: Objects) -> MockClusterClient {
        let mut mock = MockClusterClient::new();

        let seen = objects.clone();
        mock.expect_get_namespace().returning(move |name| {
            let key = format!("ns/{}", name);
            Ok(seen.lock().unwrap().get(&key).map(|_| Namespace::default()))
        });
        let seen = objects.clone();
        mock.expect_create_namespace().returning(move |ns| {
            *seen.lock().unwrap().entry(format!("ns/{}", ns.name_any())).or_default() += 1;
            Ok(())
        });

        let seen = objects.clone();
        mock.expect_get_service_account().returning(move |_, name| {
            let key = format!("sa/{}", name);
            Ok(seen.lock().unwrap().get(&key).map(|_| ServiceAccount::default()))
        });
        let seen = objects.clone();
        mock.expect_create_service_account().returning(move |sa| {
            *seen.lock().unwrap().entry(format!("sa/{}", sa.name_any())).or_default() += 1;
            Ok(())
        });

        let seen = objects.clone();
        mock.expect_get_cluster_role_binding().returning(move |name| {
            let key = format!("crb/{}", name);
            Ok(seen.lock().unwrap().get(&key).map(|_| ClusterRoleBinding::default()))
        });
        let seen = objects;
        mock.expect_create_cluster_role_binding().returning(move |crb| {
            *seen.lock().unwrap().entry(format!("crb/{}", crb.name_any())).or_default() += 1;
            Ok(())
        });

        mock
    }

    #[tokio::test]
    async fn token_failure_names_the_account() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_request_service_account_token()
            .withf(|_, _, expiration| *expiration >= 600)
            .returning(|_, _, _| Err(Error::InvalidObject("forbidden".into())));

        let err = IdentityProvisioner::new(&cluster).token().await.unwrap_err();
        assert!(matches!(err, Error::Setup { .. }));
        assert!(err.to_string().contains(INSTALLER_SERVICE_ACCOUNT));
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let objects: Objects = Arc::default();
        let cluster = recording_cluster(objects.clone());
        let provisioner = IdentityProvisioner::new(&cluster);

        provisioner.ensure().await.expect("first ensure");
        provisioner.ensure().await.expect("second ensure");

        let objects = objects.lock().unwrap();
        assert_eq!(objects.len(), 3);
        assert!(objects.values().all(|count| *count == 1));
        assert!(objects.contains_key("ns/educates-installer"));
        assert!(objects.contains_key("sa/educates-installer-sa"));
        assert!(objects.contains_key("crb/educates-installer-sa-cluster-admin"));
    }

    #[tokio::test]
    async fn racing_creator_is_not_an_error() {
        let mut cluster = MockClusterClient::new();
        cluster.expect_get_namespace().returning(|_| Ok(None));
        cluster.expect_create_namespace().returning(|ns| {
            Err(Error::AlreadyExists {
                kind: "Namespace".into(),
                name: ns.name_any(),
            })
        });
        cluster
            .expect_get_service_account()
            .returning(|_, _| Ok(Some(ServiceAccount::default())));
        cluster
            .expect_get_cluster_role_binding()
            .returning(|_| Ok(Some(ClusterRoleBinding::default())));

        IdentityProvisioner::new(&cluster)
            .ensure()
            .await
            .expect("existing namespace is fine");
    }

    #[tokio::test]
    async fn binding_targets_cluster_admin_for_installer_account() {
        let captured: Arc<Mutex<Option<ClusterRoleBinding>>> = Arc::default();
        let capture = captured.clone();

        let mut cluster = MockClusterClient::new();
        cluster
            .expect_get_namespace()
            .returning(|_| Ok(Some(Namespace::default())));
        cluster
            .expect_get_service_account()
            .returning(|_, _| Ok(Some(ServiceAccount::default())));
        cluster.expect_get_cluster_role_binding().returning(|_| Ok(None));
        cluster
            .expect_create_cluster_role_binding()
            .times(1)
            .returning(move |crb| {
                *capture.lock().unwrap() = Some(crb.clone());
                Ok(())
            });

        IdentityProvisioner::new(&cluster).ensure().await.unwrap();

        let binding = captured.lock().unwrap().clone().unwrap();
        assert_eq!(binding.role_ref.name, CLUSTER_ADMIN_ROLE);
        let subject = &binding.subjects.unwrap()[0];
        assert_eq!(subject.name, INSTALLER_SERVICE_ACCOUNT);
        assert_eq!(subject.namespace.as_deref(), Some(INSTALLER_NAMESPACE));
    }

    #[tokio::test]
    async fn provisioning_failure_names_the_resource() {
        let mut cluster = MockClusterClient::new();
        cluster.expect_get_namespace().returning(|_| {
            Err(Error::InvalidObject("forbidden".into()))
        });

        let err = IdentityProvisioner::new(&cluster).ensure().await.unwrap_err();
        assert!(matches!(err, Error::Setup { .. }));
        assert!(err.to_string().contains("namespace educates-installer"));
    }

    #[tokio::test]
    async fn teardown_keeps_namespace_unless_asked() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_delete_cluster_role_binding()
            .times(2)
            .returning(|_| Ok(()));
        cluster
            .expect_delete_service_account()
            .times(2)
            .returning(|_, _| Ok(()));
        cluster.expect_delete_namespace().times(1).returning(|_| Ok(()));

        let provisioner = IdentityProvisioner::new(&cluster);
        provisioner.teardown(false).await.unwrap();
        provisioner.teardown(true).await.unwrap();
    }

    #[tokio::test]
    async fn teardown_attempts_every_step_after_a_failure() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_delete_cluster_role_binding()
            .returning(|_| Err(Error::InvalidObject("forbidden".into())));
        cluster
            .expect_delete_service_account()
            .times(1)
            .returning(|_, _| Ok(()));
        cluster.expect_delete_namespace().times(1).returning(|_| Ok(()));

        let err = IdentityProvisioner::new(&cluster).teardown(true).await;
        assert!(err.is_err());
    }
}
