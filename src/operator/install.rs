use kube::core::ResourceExt;
use std::time::Duration;
use tracing::{info, warn};

use super::client::ClusterClient;
use super::connection::ClusterConnection;
use super::descriptor::{Descriptor, Mode};
use super::gate::{await_deletion, await_success, DEFAULT_POLL_INTERVAL, DEFAULT_TIMEOUT};
use super::provisioner::IdentityProvisioner;
use super::runner::CmdRunner;
use crate::controller::{Error, LocalReconciler, SETTLE_DELAY};
use crate::crd::installer_label_selector;

#[derive(Clone, Debug)]
pub struct InstallOptions {
    pub mode: Mode,
    /// Hand the installation to the controller running in the cluster
    /// instead of reconciling it from this process.
    pub managed: bool,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub settle_delay: Duration,
}

impl Default for InstallOptions {
    fn default() -> Self {
        InstallOptions {
            mode: Mode::Install,
            managed: false,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            settle_delay: SETTLE_DELAY,
        }
    }
}

pub struct Installer<C: ClusterClient, R: CmdRunner> {
    client: C,
    runner: R,
    connection: ClusterConnection,
    options: InstallOptions,
}

impl<C: ClusterClient, R: CmdRunner> Installer<C, R> {
    pub fn new(
        client: C,
        runner: R,
        connection: ClusterConnection,
        options: InstallOptions,
    ) -> Installer<C, R> {
        Installer {
            client,
            runner,
            connection,
            options,
        }
    }

    pub async fn run(self, descriptor: Descriptor) -> Result<(), Error> {
        match (self.options.managed, self.options.mode) {
            (false, mode) => self.run_local(descriptor, mode).await,
            (true, Mode::Install) => self.install_managed(descriptor).await,
            (true, Mode::Delete) => self.delete_managed(descriptor).await,
        }
    }

    /// Provision, reconcile once from this process, then remove the identity
    /// again. The namespace stays so repeated runs reuse it.
    async fn run_local(self, descriptor: Descriptor, mode: Mode) -> Result<(), Error> {
        let Installer {
            client,
            runner,
            connection,
            options,
        } = self;
        let provisioner = IdentityProvisioner::new(&client);

        let result = async {
            provisioner.ensure().await?;
            let token = provisioner.token().await?;
            LocalReconciler::new(runner, connection.with_token(token))
                .with_settle_delay(options.settle_delay)
                .reconcile(descriptor.app, descriptor.values, mode)
                .await
        }
        .await;

        if let Err(e) = provisioner.teardown(false).await {
            warn!("Cleanup after installation left resources behind: {}", e);
        }
        result
    }

    async fn install_managed(self, descriptor: Descriptor) -> Result<(), Error> {
        let app = &descriptor.app;
        let name = app.name_any();
        let namespace = app.namespace().unwrap_or_else(|| "default".into());

        IdentityProvisioner::new(&self.client).ensure().await?;

        let secret = descriptor.values.name_any();
        info!("Applying values secret {}", secret);
        self.client
            .apply_secret(&descriptor.values)
            .await
            .map_err(|e| Error::resource("apply", format!("Secret {}", secret), e))?;
        info!("Applying installation {}", name);
        self.client
            .apply_app(app)
            .await
            .map_err(|e| Error::resource("apply", format!("App {}", name), e))?;

        await_success(
            &self.client,
            &name,
            &namespace,
            self.options.poll_interval,
            self.options.timeout,
        )
        .await?;
        info!("Installation {} complete", name);
        Ok(())
    }

    /// The controller needs the service account to run the delete, so the
    /// identity is (re)ensured first and only removed once the installation
    /// is gone.
    async fn delete_managed(self, descriptor: Descriptor) -> Result<(), Error> {
        let name = descriptor.app.name_any();
        let namespace = descriptor
            .app
            .namespace()
            .unwrap_or_else(|| "default".into());
        let provisioner = IdentityProvisioner::new(&self.client);

        let result = async {
            provisioner.ensure().await?;
            info!("Deleting installation {}", name);
            self.client
                .delete_app(&namespace, &name)
                .await
                .map_err(|e| Error::resource("delete", format!("App {}", name), e))?;
            await_deletion(
                &self.client,
                &name,
                &namespace,
                &installer_label_selector(),
                self.options.timeout,
            )
            .await?;
            let secret = descriptor.values.name_any();
            self.client
                .delete_secret(&namespace, &secret)
                .await
                .map_err(|e| Error::resource("delete", format!("Secret {}", secret), e))
        }
        .await;

        if let Err(e) = provisioner.teardown(true).await {
            warn!("Cleanup after deletion left resources behind: {}", e);
        }
        result
    }
}
