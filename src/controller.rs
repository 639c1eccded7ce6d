use k8s_openapi::api::core::v1::Secret;
use kube::core::ResourceExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crd::{App, AppStatus, ConditionType, Phase};
use crate::operator::{
    ClusterConnection, CmdRunner, InMemoryStore, Mode, ObjectStore, Pipeline,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes request failed: {0}")]
    KubeRequestFailed(#[from] kube::Error),
    #[error("Unable to infer cluster connection: {0}")]
    ClusterConnectionUnavailable(#[from] kube::config::InferConfigError),
    #[error("Unable to load kubeconfig: {0}")]
    KubeconfigUnavailable(#[from] kube::config::KubeconfigError),
    #[error("Watch failed: {0}")]
    WatchFailed(#[from] kube::runtime::watcher::Error),
    #[error("UnableToSerializeObject: {0}")]
    UnableToSerializeObject(#[from] serde_json::Error),
    #[error("UnableToSerializeYaml: {0}")]
    UnableToSerializeYaml(#[from] serde_yaml::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid bundle reference {0:?}")]
    InvalidBundleRef(String),
    #[error("Invalid object: {0}")]
    InvalidObject(String),
    #[error("Unable to provision {resource}: {source}")]
    Setup {
        resource: String,
        #[source]
        source: Box<Error>,
    },
    #[error("Unable to {action} {resource}: {source}")]
    Resource {
        action: String,
        resource: String,
        #[source]
        source: Box<Error>,
    },
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },
    #[error("{kind} {name} was modified concurrently")]
    Conflict { kind: String, name: String },
    #[error("Unable to fetch bundle {bundle}: {source}")]
    BundleUnreachable {
        bundle: String,
        #[source]
        source: Box<Error>,
    },
    #[error("{stage} stage of {name} failed: {source}")]
    StageFailed {
        stage: String,
        name: String,
        #[source]
        source: Box<Error>,
    },
    #[error("Command `{command}` failed ({status}): {output}")]
    CommandFailed {
        command: String,
        status: String,
        output: String,
    },
    #[error("Command `{0}` was cancelled")]
    Cancelled(String),
    #[error("Reconcile of {name} failed: {message}")]
    ReconcileFailed { name: String, message: String },
    #[error("Watch of {name} closed before the change was observed")]
    WatchClosed { name: String },
    #[error("Timed out after {after:?} waiting for {kind} {namespace}/{name}")]
    Timeout {
        kind: String,
        namespace: String,
        name: String,
        after: Duration,
    },
}

impl Error {
    pub fn stage(stage: &str, name: &str, source: Error) -> Error {
        Error::StageFailed {
            stage: stage.into(),
            name: name.into(),
            source: Box::new(source),
        }
    }

    pub fn resource(action: &str, resource: String, source: Error) -> Error {
        Error::Resource {
            action: action.into(),
            resource,
            source: Box::new(source),
        }
    }
}

/// Delay after a pass so stage helpers can flush pending work before exit.
pub const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Runs one fetch, render, resolve and deploy pass for an installation
/// without a controller in the cluster. The `App` and its values secret only
/// live in an in-memory store; the deploy stage is the only step that reaches
/// the real cluster.
pub struct LocalReconciler<R: CmdRunner> {
    runner: R,
    connection: ClusterConnection,
    settle_delay: Duration,
}

impl<R: CmdRunner> LocalReconciler<R> {
    pub fn new(runner: R, connection: ClusterConnection) -> LocalReconciler<R> {
        LocalReconciler {
            runner,
            connection,
            settle_delay: SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> LocalReconciler<R> {
        self.settle_delay = settle_delay;
        self
    }

    pub async fn reconcile(&self, app: App, values: Secret, mode: Mode) -> Result<(), Error> {
        let store = InMemoryStore::default();
        ObjectStore::<Secret>::create(&store, &values).await?;
        let app = ObjectStore::<App>::create(&store, &app).await?;

        let namespace = app.namespace().unwrap_or_else(|| "default".into());
        let result = self
            .reconcile_once(&store, &namespace, &app.name_any(), mode)
            .await;

        tokio::time::sleep(self.settle_delay).await;
        result
    }

    /// Equivalent of a controller handling one change event for the named
    /// installation.
    pub async fn reconcile_once<S>(
        &self,
        store: &S,
        namespace: &str,
        name: &str,
        mode: Mode,
    ) -> Result<(), Error>
    where
        S: ObjectStore<App> + ObjectStore<Secret>,
    {
        let mut app: App = store.get(namespace, name).await?;

        if app.spec.paused {
            info!("Installation {} is paused, skipping reconcile", name);
            return Ok(());
        }

        let (in_progress, failed) = match mode {
            Mode::Install => (ConditionType::Reconciling, ConditionType::ReconcileFailed),
            Mode::Delete => (ConditionType::Deleting, ConditionType::DeleteFailed),
        };

        let mut status = app.status.clone().unwrap_or_default();
        status.mark(in_progress, "");
        app.status = Some(status);
        app = store.update(&app).await?;
        info!("{}", Phase::of(&app).message(&app));

        let workdir = tempfile::tempdir()?;
        let env = self.connection.stage_env(workdir.path()).await?;
        let pipeline = Pipeline::new(&self.runner, workdir.path(), env, &app);

        let outcome = match mode {
            Mode::Install => self.install(store, &pipeline, &app, workdir.path()).await,
            Mode::Delete => self.delete(&pipeline, &app).await,
        };

        let mut status: AppStatus = app.status.clone().unwrap_or_default();
        status.observed_generation = app.metadata.generation;
        match &outcome {
            Ok(description) => {
                status.mark(ConditionType::ReconcileSucceeded, "");
                status.friendly_description = Some(description.clone());
            }
            Err(e) => status.mark_failed(failed, &failure_description(e), &e.to_string()),
        }
        app.status = Some(status);

        match store.update(&app).await {
            Ok(app) => info!("{}", Phase::of(&app).message(&app)),
            Err(e) => warn!("Unable to record status of {}: {}", name, e),
        }

        outcome.map(|_| ())
    }

    async fn install<S>(
        &self,
        store: &S,
        pipeline: &Pipeline<'_, R>,
        app: &App,
        workdir: &Path,
    ) -> Result<String, Error>
    where
        S: ObjectStore<App> + ObjectStore<Secret>,
    {
        let spec = &app.spec;
        let bundle_dir = pipeline.bundle_dir();
        for (index, fetch) in spec.fetch.iter().enumerate() {
            pipeline.fetch(index, spec.fetch.len(), fetch).await?;
        }

        let mut manifests: Option<Vec<u8>> = None;
        for template in &spec.template {
            if let Some(ytt) = &template.ytt {
                let values = materialize_values(store, app, ytt, workdir).await?;
                manifests = Some(pipeline.ytt(ytt, &bundle_dir, manifests, &values).await?);
            } else if let Some(kbld) = &template.kbld {
                manifests = Some(pipeline.kbld(kbld, &bundle_dir, manifests).await?);
            } else {
                return Err(Error::InvalidObject(format!(
                    "template stage of {} names no templating tool",
                    app.name_any()
                )));
            }
        }

        let manifests = manifests.unwrap_or_default();
        for deploy in &spec.deploy {
            match &deploy.kapp {
                Some(kapp) => pipeline.deploy(kapp, manifests.clone()).await?,
                None => {
                    return Err(Error::InvalidObject(format!(
                        "deploy stage of {} names no deploy tool",
                        app.name_any()
                    )))
                }
            }
        }

        Ok("Reconcile succeeded".into())
    }

    async fn delete(&self, pipeline: &Pipeline<'_, R>, app: &App) -> Result<String, Error> {
        if app.spec.noop_delete {
            info!("Installation {} skips deleting its resources", app.name_any());
            return Ok("Delete skipped".into());
        }

        for deploy in &app.spec.deploy {
            if let Some(kapp) = &deploy.kapp {
                pipeline.delete(kapp).await?;
            }
        }
        Ok("Delete succeeded".into())
    }
}

/// Writes every key of every values secret a ytt stage consumes into the
/// working directory and returns the file paths in declaration order.
async fn materialize_values<S>(
    store: &S,
    app: &App,
    ytt: &crate::crd::YttTemplate,
    workdir: &Path,
) -> Result<Vec<PathBuf>, Error>
where
    S: ObjectStore<Secret>,
{
    let namespace = app.namespace().unwrap_or_else(|| "default".into());
    let mut paths = Vec::new();

    for source in &ytt.values_from {
        let secret_ref = match &source.secret_ref {
            Some(r) => r,
            None => continue,
        };
        let secret = store.get(&namespace, &secret_ref.name).await?;
        let dir = workdir.join("values").join(&secret_ref.name);
        tokio::fs::create_dir_all(&dir).await?;

        if let Some(data) = &secret.data {
            for (key, value) in data {
                let path = dir.join(key);
                tokio::fs::write(&path, &value.0).await?;
                paths.push(path);
            }
        }
        if let Some(string_data) = &secret.string_data {
            for (key, value) in string_data {
                let path = dir.join(key);
                tokio::fs::write(&path, value.as_bytes()).await?;
                paths.push(path);
            }
        }
        debug!("Values from secret {} written to {}", secret_ref.name, dir.display());
    }

    Ok(paths)
}

fn failure_description(error: &Error) -> String {
    match error {
        Error::BundleUnreachable { .. } => "Fetching resources".into(),
        Error::StageFailed { stage, .. } => format!("{} stage failed", stage),
        _ => "Reconcile failed".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BundleRef, InstallationConfig};
    use crate::operator::{build_descriptor, MockCmdRunner, StageCommand};
    use std::sync::{Arc, Mutex};

    fn descriptor(mode: Mode) -> (App, Secret) {
        let mut config = InstallationConfig::default();
        config.cluster_ingress.domain = Some("educates.test".into());
        let bundle: BundleRef = "ghcr.io/educates/educates-installer:3.0.0".parse().unwrap();
        let descriptor = build_descriptor(&config, &bundle, mode).unwrap();
        (descriptor.app, descriptor.values)
    }

    fn reconciler(runner: MockCmdRunner) -> LocalReconciler<MockCmdRunner> {
        LocalReconciler::new(runner, ClusterConnection::default())
            .with_settle_delay(Duration::ZERO)
    }

    fn program(cmd: &StageCommand) -> String {
        cmd.program.clone()
    }

    #[tokio::test]
    async fn install_drives_stages_in_declared_order() {
        let seen: Arc<Mutex<Vec<(String, Option<Vec<u8>>)>>> = Arc::default();

        let mut runner = MockCmdRunner::new();
        let capture = seen.clone();
        runner.expect_run().returning(move |cmd| {
            capture
                .lock()
                .unwrap()
                .push((program(&cmd), cmd.stdin.clone()));
            match cmd.program.as_str() {
                "imgpkg" => Ok(Vec::new()),
                "ytt" => {
                    assert!(cmd.args.iter().any(|a| a.ends_with("values.yml")));
                    Ok(b"rendered".to_vec())
                }
                "kbld" => Ok([cmd.stdin.unwrap_or_default(), b"+resolved".to_vec()].concat()),
                other => panic!("unexpected program {}", other),
            }
        });
        let capture = seen.clone();
        runner.expect_run_cancelable().times(1).returning(move |cmd, _| {
            assert_eq!(cmd.program, "kapp");
            capture
                .lock()
                .unwrap()
                .push((program(&cmd), cmd.stdin.clone()));
            Ok(Vec::new())
        });

        let (app, values) = descriptor(Mode::Install);
        reconciler(runner)
            .reconcile(app, values, Mode::Install)
            .await
            .expect("install should succeed");

        let seen = seen.lock().unwrap();
        let programs: Vec<&str> = seen.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(programs, vec!["imgpkg", "ytt", "kbld", "kapp"]);
        assert_eq!(seen[3].1.as_deref(), Some(&b"rendered+resolved"[..]));
    }

    #[tokio::test]
    async fn unreachable_bundle_stops_before_render() {
        let calls: Arc<Mutex<Vec<String>>> = Arc::default();
        let capture = calls.clone();

        let mut runner = MockCmdRunner::new();
        runner.expect_run().returning(move |cmd| {
            capture.lock().unwrap().push(program(&cmd));
            Err(Error::CommandFailed {
                command: cmd.to_string(),
                status: "exit status: 1".into(),
                output: "MANIFEST_UNKNOWN".into(),
            })
        });

        let (app, values) = descriptor(Mode::Install);
        let err = reconciler(runner)
            .reconcile(app, values, Mode::Install)
            .await
            .expect_err("fetch should fail");

        assert!(matches!(err, Error::BundleUnreachable { .. }));
        assert!(err
            .to_string()
            .contains("ghcr.io/educates/educates-installer:3.0.0"));
        assert_eq!(*calls.lock().unwrap(), vec!["imgpkg".to_string()]);
    }

    #[tokio::test]
    async fn delete_only_runs_deploy_stage_in_delete_mode() {
        let calls: Arc<Mutex<Vec<StageCommand>>> = Arc::default();
        let capture = calls.clone();

        let mut runner = MockCmdRunner::new();
        runner.expect_run().never();
        runner.expect_run_cancelable().returning(move |cmd, _| {
            capture.lock().unwrap().push(cmd);
            Ok(Vec::new())
        });

        let (app, values) = descriptor(Mode::Delete);
        reconciler(runner)
            .reconcile(app, values, Mode::Delete)
            .await
            .expect("delete should succeed");

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "kapp");
        assert_eq!(calls[0].args[0], "delete");
        assert!(calls[0].args.contains(&"educates-installer-ctrl".to_string()));
    }

    #[tokio::test]
    async fn failed_stage_is_recorded_on_in_memory_status() {
        let mut runner = MockCmdRunner::new();
        runner.expect_run().returning(|_| Ok(b"manifests".to_vec()));
        runner.expect_run_cancelable().returning(|cmd, _| {
            Err(Error::CommandFailed {
                command: cmd.to_string(),
                status: "exit status: 1".into(),
                output: "admission webhook denied".into(),
            })
        });

        let (app, values) = descriptor(Mode::Install);
        let store = InMemoryStore::default();
        ObjectStore::<Secret>::create(&store, &values).await.unwrap();
        ObjectStore::<App>::create(&store, &app).await.unwrap();

        let reconciler = reconciler(runner);
        let err = reconciler
            .reconcile_once(&store, "educates-installer", "educates-installer", Mode::Install)
            .await
            .expect_err("deploy should fail");
        assert!(matches!(err, Error::StageFailed { .. }));

        let app: App = store
            .get("educates-installer", "educates-installer")
            .await
            .unwrap();
        let status = app.status.clone().unwrap();
        assert!(status.is_true(ConditionType::ReconcileFailed));
        assert!(!status.is_true(ConditionType::ReconcileSucceeded));
        assert!(status
            .useful_error_message
            .unwrap()
            .contains("admission webhook denied"));
        assert!(app.status_is_current());
    }

    #[tokio::test]
    async fn paused_installation_runs_nothing() {
        let runner = MockCmdRunner::new();
        let (mut app, values) = descriptor(Mode::Install);
        app.spec.paused = true;

        reconciler(runner)
            .reconcile(app, values, Mode::Install)
            .await
            .expect("paused install is a no-op");
    }
}
