use kube::core::ResourceExt;
use std::path::{Path, PathBuf};
use tracing::info;

use super::runner::{interrupt_channel, CmdRunner, StageCommand, APPLY_PROGRAM};
use crate::controller::Error;
use crate::crd::{App, AppFetch, KappDeploy, KbldTemplate, YttTemplate};

pub const FETCH_PROGRAM: &str = "imgpkg";
pub const RENDER_PROGRAM: &str = "ytt";
pub const RESOLVE_PROGRAM: &str = "kbld";

/// Path meaning "the previous stage's output".
const STDIN_PATH: &str = "-";

/// Turns the stages of one `App` into stage-binary invocations. Every stage
/// runs inside the same working directory and receives the cluster
/// connection through its own environment.
pub struct Pipeline<'a, R: CmdRunner + ?Sized> {
    runner: &'a R,
    workdir: &'a Path,
    env: Vec<(String, String)>,
    name: String,
    namespace: String,
    deploy_app: String,
}

impl<'a, R: CmdRunner + ?Sized> Pipeline<'a, R> {
    pub fn new(
        runner: &'a R,
        workdir: &'a Path,
        env: Vec<(String, String)>,
        app: &App,
    ) -> Pipeline<'a, R> {
        Pipeline {
            runner,
            workdir,
            env,
            name: app.name_any(),
            namespace: app.namespace().unwrap_or_else(|| "default".into()),
            deploy_app: app.deploy_app_name(),
        }
    }

    /// Root the fetch stage fills and the render stages read from.
    pub fn bundle_dir(&self) -> PathBuf {
        self.workdir.join("bundle")
    }

    fn command(&self, program: &str) -> StageCommand {
        let mut cmd = StageCommand::new(program).envs(&self.env);
        cmd.current_dir = Some(self.workdir.to_path_buf());
        cmd
    }

    /// A single fetch lands in the bundle root; several get their own
    /// subdirectory so they cannot overwrite each other.
    pub async fn fetch(&self, index: usize, total: usize, fetch: &AppFetch) -> Result<PathBuf, Error> {
        let bundle = match &fetch.imgpkg_bundle {
            Some(b) => b,
            None => {
                return Err(Error::InvalidObject(format!(
                    "fetch stage {} of {} names no source",
                    index, self.name
                )))
            }
        };

        let dir = match (&fetch.path, total) {
            (Some(path), _) => self.bundle_dir().join(path),
            (None, 1) => self.bundle_dir(),
            (None, _) => self.bundle_dir().join(index.to_string()),
        };
        tokio::fs::create_dir_all(&dir).await?;

        info!("Fetching bundle {}", bundle.image);
        let cmd = self
            .command(FETCH_PROGRAM)
            .args(["pull", "-b"])
            .arg(bundle.image.clone())
            .arg("-o")
            .arg(dir.display().to_string());

        self.runner
            .run(cmd)
            .await
            .map_err(|e| Error::BundleUnreachable {
                bundle: bundle.image.clone(),
                source: Box::new(e),
            })?;
        Ok(dir)
    }

    /// Runs a stage that changes the cluster. Ctrl-C kills the child
    /// instead of leaving it running behind the installer.
    async fn run_interruptible(&self, cmd: StageCommand) -> Result<Vec<u8>, Error> {
        let (interrupt, _guard) = interrupt_channel();
        self.runner.run_cancelable(cmd, interrupt).await
    }

    fn resolve_path(bundle_dir: &Path, path: &str) -> String {
        if path == STDIN_PATH {
            STDIN_PATH.to_string()
        } else {
            bundle_dir.join(path).display().to_string()
        }
    }

    pub async fn ytt(
        &self,
        ytt: &YttTemplate,
        bundle_dir: &Path,
        input: Option<Vec<u8>>,
        values: &[PathBuf],
    ) -> Result<Vec<u8>, Error> {
        let mut cmd = self.command(RENDER_PROGRAM);
        let paths = if ytt.paths.is_empty() {
            vec![".".to_string()]
        } else {
            ytt.paths.clone()
        };
        for path in &paths {
            cmd = cmd.arg("-f").arg(Self::resolve_path(bundle_dir, path));
        }
        for value in values {
            cmd = cmd
                .arg("--data-values-file")
                .arg(value.display().to_string());
        }
        if paths.iter().any(|p| p == STDIN_PATH) {
            cmd = cmd.stdin(input.unwrap_or_default());
        }

        info!("Rendering templates for {}", self.name);
        self.runner
            .run(cmd)
            .await
            .map_err(|e| Error::stage("render", &self.name, e))
    }

    pub async fn kbld(
        &self,
        kbld: &KbldTemplate,
        bundle_dir: &Path,
        input: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, Error> {
        let mut cmd = self.command(RESOLVE_PROGRAM);
        let paths = if kbld.paths.is_empty() {
            vec![STDIN_PATH.to_string()]
        } else {
            kbld.paths.clone()
        };
        for path in &paths {
            cmd = cmd.arg("-f").arg(Self::resolve_path(bundle_dir, path));
        }
        if paths.iter().any(|p| p == STDIN_PATH) {
            cmd = cmd.stdin(input.unwrap_or_default());
        }

        info!("Resolving images for {}", self.name);
        self.runner
            .run(cmd)
            .await
            .map_err(|e| Error::stage("resolve", &self.name, e))
    }

    /// The only stage that changes the live cluster.
    pub async fn deploy(&self, kapp: &KappDeploy, manifests: Vec<u8>) -> Result<(), Error> {
        let mut cmd = self
            .command(APPLY_PROGRAM)
            .arg("deploy")
            .arg("-a")
            .arg(self.deploy_app.clone())
            .arg("-n")
            .arg(self.namespace.clone())
            .args(["-f", STDIN_PATH, "--yes"]);
        if let Some(ns) = &kapp.into_ns {
            cmd = cmd.arg("--into-ns").arg(ns.clone());
        }
        cmd = cmd.args(kapp.raw_options.iter().cloned()).stdin(manifests);

        info!("Deploying {}", self.name);
        self.run_interruptible(cmd)
            .await
            .map_err(|e| Error::stage("deploy", &self.name, e))?;
        Ok(())
    }

    /// Removes everything the deploy stage recorded as owned by this
    /// installation on earlier runs.
    pub async fn delete(&self, kapp: &KappDeploy) -> Result<(), Error> {
        let cmd = self
            .command(APPLY_PROGRAM)
            .arg("delete")
            .arg("-a")
            .arg(self.deploy_app.clone())
            .arg("-n")
            .arg(self.namespace.clone())
            .arg("--yes")
            .args(
                kapp.raw_options
                    .iter()
                    .filter(|o| o.starts_with("--wait-timeout"))
                    .cloned(),
            );

        info!("Deleting resources of {}", self.name);
        self.run_interruptible(cmd)
            .await
            .map_err(|e| Error::stage("delete", &self.name, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::AppSpec;
    use crate::operator::runner::MockCmdRunner;
    use kube::core::ObjectMeta;

    fn app() -> App {
        App {
            metadata: ObjectMeta {
                name: Some("educates-installer".into()),
                namespace: Some("educates-installer".into()),
                ..Default::default()
            },
            spec: AppSpec::default(),
            status: None,
        }
    }

    fn env() -> Vec<(String, String)> {
        vec![("KUBERNETES_SERVICE_HOST".into(), "10.96.0.1".into())]
    }

    #[tokio::test]
    async fn deploy_pipes_manifests_with_raw_options() {
        let workdir = tempfile::tempdir().unwrap();
        let mut runner = MockCmdRunner::new();
        runner.expect_run().never();
        runner.expect_run_cancelable().times(1).returning(|cmd, _| {
            assert_eq!(cmd.program, "kapp");
            assert_eq!(
                &cmd.args[..8],
                &["deploy", "-a", "educates-installer-ctrl", "-n", "educates-installer", "-f", "-", "--yes"]
            );
            assert!(cmd.args.contains(&"--wait-timeout=10m".to_string()));
            assert_eq!(cmd.stdin.as_deref(), Some(&b"kind: Deployment"[..]));
            assert!(cmd.env.iter().any(|(k, _)| k == "KUBERNETES_SERVICE_HOST"));
            Ok(Vec::new())
        });

        let app = app();
        let pipeline = Pipeline::new(&runner, workdir.path(), env(), &app);
        let kapp = KappDeploy {
            raw_options: vec!["--wait-timeout=10m".into()],
            into_ns: None,
        };
        pipeline
            .deploy(&kapp, b"kind: Deployment".to_vec())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ytt_reads_bundle_paths_and_values_files() {
        let workdir = tempfile::tempdir().unwrap();
        let bundle_dir = workdir.path().join("bundle");
        let expected_config = bundle_dir.join("config").display().to_string();

        let mut runner = MockCmdRunner::new();
        runner.expect_run().times(1).returning(move |cmd| {
            assert_eq!(cmd.program, "ytt");
            assert_eq!(cmd.args[0], "-f");
            assert_eq!(cmd.args[1], expected_config);
            assert_eq!(cmd.args[2], "--data-values-file");
            assert_eq!(cmd.args[3], "/tmp/values.yml");
            assert!(cmd.stdin.is_none());
            Ok(b"rendered".to_vec())
        });

        let app = app();
        let pipeline = Pipeline::new(&runner, workdir.path(), env(), &app);
        let ytt = YttTemplate {
            paths: vec!["config".into()],
            values_from: Vec::new(),
        };
        let out = pipeline
            .ytt(&ytt, &bundle_dir, None, &[PathBuf::from("/tmp/values.yml")])
            .await
            .unwrap();
        assert_eq!(out, b"rendered");
    }

    #[tokio::test]
    async fn kbld_failure_names_resolve_stage() {
        let workdir = tempfile::tempdir().unwrap();
        let mut runner = MockCmdRunner::new();
        runner.expect_run().returning(|cmd| {
            Err(Error::CommandFailed {
                command: cmd.to_string(),
                status: "exit status: 1".into(),
                output: "Resolving image: not found".into(),
            })
        });

        let app = app();
        let pipeline = Pipeline::new(&runner, workdir.path(), env(), &app);
        let err = pipeline
            .kbld(&KbldTemplate::default(), workdir.path(), Some(b"x".to_vec()))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("resolve stage of educates-installer failed"));
        assert!(message.contains("Resolving image: not found"));
    }

    #[tokio::test]
    async fn multiple_fetches_get_separate_directories() {
        let workdir = tempfile::tempdir().unwrap();
        let mut runner = MockCmdRunner::new();
        runner.expect_run().times(2).returning(|_| Ok(Vec::new()));

        let app = app();
        let pipeline = Pipeline::new(&runner, workdir.path(), env(), &app);
        let fetch = AppFetch {
            imgpkg_bundle: Some(crate::crd::ImgpkgBundleFetch {
                image: "ghcr.io/educates/a:1".into(),
            }),
            path: None,
        };
        let first = pipeline.fetch(0, 2, &fetch).await.unwrap();
        let second = pipeline.fetch(1, 2, &fetch).await.unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with(pipeline.bundle_dir()));
        assert!(first.is_dir());
    }

    #[tokio::test]
    async fn delete_keeps_only_wait_timeout_option() {
        let workdir = tempfile::tempdir().unwrap();
        let mut runner = MockCmdRunner::new();
        runner.expect_run_cancelable().times(1).returning(|cmd, _| {
            assert_eq!(cmd.args[0], "delete");
            assert!(cmd.args.contains(&"--wait-timeout=10m".to_string()));
            assert!(!cmd.args.iter().any(|a| a.starts_with("--app-changes")));
            assert!(cmd.stdin.is_none());
            Ok(Vec::new())
        });

        let app = app();
        let pipeline = Pipeline::new(&runner, workdir.path(), env(), &app);
        let kapp = KappDeploy {
            raw_options: vec![
                "--app-changes-max-to-keep=5".into(),
                "--wait-timeout=10m".into(),
            ],
            into_ns: None,
        };
        pipeline.delete(&kapp).await.unwrap();
    }

    #[tokio::test]
    async fn interrupted_deploy_is_reported_as_cancelled() {
        let workdir = tempfile::tempdir().unwrap();
        let mut runner = MockCmdRunner::new();
        runner
            .expect_run_cancelable()
            .returning(|cmd, _| Err(Error::Cancelled(cmd.to_string())));

        let app = app();
        let pipeline = Pipeline::new(&runner, workdir.path(), env(), &app);
        let err = pipeline
            .deploy(&KappDeploy::default(), Vec::new())
            .await
            .unwrap_err();
        match err {
            Error::StageFailed { stage, source, .. } => {
                assert_eq!(stage, "deploy");
                assert!(matches!(*source, Error::Cancelled(_)));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
