use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::core::ObjectMeta;
use std::collections::BTreeMap;
use std::time::Duration;

use super::provisioner::{INSTALLER_NAMESPACE, INSTALLER_SERVICE_ACCOUNT};
use super::utils::installer_labels;
use crate::config::{BundleRef, InstallationConfig};
use crate::controller::Error;
use crate::crd::{
    App, AppDeploy, AppFetch, AppSpec, AppTemplate, ImgpkgBundleFetch, KappDeploy, KbldTemplate,
    SecretRef, ValuesSource, YttTemplate,
};

pub const INSTALLATION_NAME: &str = "educates-installer";
pub const VALUES_SECRET_NAME: &str = "educates-installer-values";
pub const VALUES_KEY: &str = "values.yml";
pub const APP_CHANGES_TO_KEEP: u32 = 5;
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Install,
    Delete,
}

/// The two objects one installer run works from.
#[derive(Clone, Debug)]
pub struct Descriptor {
    pub app: App,
    pub values: Secret,
}

fn format_wait_timeout(timeout: Duration) -> String {
    let secs = timeout.as_secs();
    if secs > 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

fn deploy_stage() -> Vec<AppDeploy> {
    vec![AppDeploy {
        kapp: Some(KappDeploy {
            raw_options: vec![
                format!("--app-changes-max-to-keep={}", APP_CHANGES_TO_KEEP),
                format!("--wait-timeout={}", format_wait_timeout(DEFAULT_WAIT_TIMEOUT)),
            ],
            into_ns: None,
        }),
    }]
}

/// Render with the values secret, then resolve image references against the
/// bundle's image lock.
fn render_stages() -> Vec<AppTemplate> {
    vec![
        AppTemplate {
            ytt: Some(YttTemplate {
                paths: vec!["config".into()],
                values_from: vec![ValuesSource {
                    secret_ref: Some(SecretRef {
                        name: VALUES_SECRET_NAME.into(),
                    }),
                }],
            }),
            kbld: None,
        },
        AppTemplate {
            ytt: None,
            kbld: Some(KbldTemplate {
                paths: vec!["-".into(), ".imgpkg/images.yml".into()],
            }),
        },
    ]
}

pub fn build_descriptor(
    config: &InstallationConfig,
    bundle: &BundleRef,
    mode: Mode,
) -> Result<Descriptor, Error> {
    let (fetch, template) = match mode {
        Mode::Install => (
            vec![AppFetch {
                imgpkg_bundle: Some(ImgpkgBundleFetch {
                    image: bundle.to_string(),
                }),
                path: None,
            }],
            render_stages(),
        ),
        Mode::Delete => (Vec::new(), Vec::new()),
    };

    let app = App {
        metadata: ObjectMeta {
            name: Some(INSTALLATION_NAME.into()),
            namespace: Some(INSTALLER_NAMESPACE.into()),
            labels: Some(installer_labels()),
            ..Default::default()
        },
        spec: AppSpec {
            service_account_name: INSTALLER_SERVICE_ACCOUNT.into(),
            fetch,
            template,
            deploy: deploy_stage(),
            paused: false,
            noop_delete: false,
        },
        status: None,
    };

    let mut data: BTreeMap<String, ByteString> = BTreeMap::new();
    data.insert(VALUES_KEY.into(), ByteString(config.to_yaml()?.into_bytes()));

    let values = Secret {
        metadata: ObjectMeta {
            name: Some(VALUES_SECRET_NAME.into()),
            namespace: Some(INSTALLER_NAMESPACE.into()),
            labels: Some(installer_labels()),
            ..Default::default()
        },
        data: Some(data),
        type_: Some("Opaque".into()),
        ..Default::default()
    };

    Ok(Descriptor { app, values })
}

/// YAML document stream of both objects, as printed by `--dry-run`.
pub fn render_dry_run(descriptor: &Descriptor) -> Result<String, Error> {
    let mut out = String::new();
    for doc in [
        serde_yaml::to_string(&descriptor.values)?,
        serde_yaml::to_string(&descriptor.app)?,
    ] {
        out.push_str("---\n");
        out.push_str(&doc);
    }
    Ok(out)
}
