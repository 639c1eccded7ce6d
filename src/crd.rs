use chrono::{SecondsFormat, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label stamped on every object the installer generates. The completion gate
/// watches on this selector.
pub const INSTALLER_LABEL_KEY: &str = "installer";
pub const INSTALLER_LABEL_VALUE: &str = "educates-installer.app";

pub fn installer_label_selector() -> String {
    format!("{}={}", INSTALLER_LABEL_KEY, INSTALLER_LABEL_VALUE)
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImgpkgBundleFetch {
    pub image: String,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppFetch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imgpkg_bundle: Option<ImgpkgBundleFetch>,
    /// Subdirectory of the working directory the fetched content lands in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ValuesSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct YttTemplate {
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub values_from: Vec<ValuesSource>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct KbldTemplate {
    #[serde(default)]
    pub paths: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppTemplate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ytt: Option<YttTemplate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kbld: Option<KbldTemplate>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct KappDeploy {
    #[serde(default)]
    pub raw_options: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub into_ns: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppDeploy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kapp: Option<KappDeploy>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[kube(group = "kappctrl.k14s.io", version = "v1alpha1", kind = "App", namespaced)]
#[kube(status = "AppStatus")]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    pub service_account_name: String,
    #[serde(default)]
    pub fetch: Vec<AppFetch>,
    #[serde(default)]
    pub template: Vec<AppTemplate>,
    #[serde(default)]
    pub deploy: Vec<AppDeploy>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub noop_delete: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConditionType {
    Reconciling,
    ReconcileSucceeded,
    ReconcileFailed,
    Deleting,
    DeleteFailed,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Reconciling => "Reconciling",
            ConditionType::ReconcileSucceeded => "ReconcileSucceeded",
            ConditionType::ReconcileFailed => "ReconcileFailed",
            ConditionType::Deleting => "Deleting",
            ConditionType::DeleteFailed => "DeleteFailed",
        }
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    #[serde(default)]
    pub conditions: Vec<AppCondition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub useful_error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub friendly_description: Option<String>,
}

impl AppStatus {
    pub fn condition(&self, type_: ConditionType) -> Option<&AppCondition> {
        self.conditions.iter().find(|c| c.type_ == type_.as_str())
    }

    pub fn is_true(&self, type_: ConditionType) -> bool {
        self.condition(type_).map_or(false, |c| c.status == "True")
    }

    /// Replaces the whole condition set with a single `True` condition.
    /// Lifecycle conditions are mutually exclusive, so a succeeded and a
    /// failed condition can never be reported together.
    pub fn mark(&mut self, type_: ConditionType, message: impl Into<String>) {
        let message = message.into();
        self.conditions = vec![AppCondition {
            type_: type_.to_string(),
            status: "True".into(),
            reason: None,
            message: if message.is_empty() { None } else { Some(message) },
            last_transition_time: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        }];

        match type_ {
            ConditionType::ReconcileFailed | ConditionType::DeleteFailed => {}
            _ => self.useful_error_message = None,
        }
    }

    pub fn mark_failed(&mut self, type_: ConditionType, description: &str, error: &str) {
        self.mark(type_, error);
        self.friendly_description = Some(description.to_string());
        self.useful_error_message = Some(error.to_string());
    }
}

impl App {
    /// The status only describes the current spec once the controller has
    /// caught up with the latest generation.
    pub fn status_is_current(&self) -> bool {
        match (self.metadata.generation, self.status.as_ref()) {
            (Some(generation), Some(status)) => status.observed_generation == Some(generation),
            _ => false,
        }
    }

    /// Name of the change-tracking application the deploy stage keeps in the
    /// cluster for this installation.
    pub fn deploy_app_name(&self) -> String {
        format!("{}-ctrl", self.name_any())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum Phase {
    Created,
    Reconciling,
    Succeeded,
    Failed,
    Deleting,
    Deleted,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let message = match self {
            Phase::Created => "Created",
            Phase::Reconciling => "Reconciling",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
            Phase::Deleting => "Deleting",
            Phase::Deleted => "Deleted",
        };
        write!(f, "{}", message)
    }
}

impl Phase {
    pub fn of(app: &App) -> Phase {
        if app.metadata.deletion_timestamp.is_some() {
            return Phase::Deleting;
        }
        match app.status.as_ref() {
            Some(status) if status.is_true(ConditionType::Deleting) => Phase::Deleting,
            Some(status) if status.is_true(ConditionType::ReconcileSucceeded) => Phase::Succeeded,
            Some(status)
                if status.is_true(ConditionType::ReconcileFailed)
                    || status.is_true(ConditionType::DeleteFailed) =>
            {
                Phase::Failed
            }
            Some(status) if status.is_true(ConditionType::Reconciling) => Phase::Reconciling,
            _ => Phase::Created,
        }
    }

    pub fn message(&self, app: &App) -> String {
        match self {
            Phase::Created => format!("Installation {} created", app.name_any()),
            Phase::Reconciling => format!("Installation {} reconciling", app.name_any()),
            Phase::Succeeded => format!("Installation {} reconciled", app.name_any()),
            Phase::Failed => format!(
                "Installation {} failed: {}",
                app.name_any(),
                app.status
                    .as_ref()
                    .and_then(|s| s.useful_error_message.clone())
                    .unwrap_or_else(|| "<unknown>".into())
            ),
            Phase::Deleting => format!("Installation {} deleting", app.name_any()),
            Phase::Deleted => format!("Installation {} deleted", app.name_any()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed | Phase::Deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    fn app() -> App {
        App {
            metadata: ObjectMeta {
                name: Some("installer".into()),
                namespace: Some("educates-installer".into()),
                generation: Some(2),
                ..Default::default()
            },
            spec: AppSpec::default(),
            status: None,
        }
    }

    #[test]
    fn terminal_conditions_never_coexist() {
        let mut status = AppStatus::default();
        status.mark(ConditionType::Reconciling, "");
        status.mark_failed(ConditionType::ReconcileFailed, "Deploying", "kapp: exit 1");
        status.mark(ConditionType::ReconcileSucceeded, "");

        assert!(status.is_true(ConditionType::ReconcileSucceeded));
        assert!(!status.is_true(ConditionType::ReconcileFailed));
        assert!(!status.is_true(ConditionType::Reconciling));
        assert_eq!(status.conditions.len(), 1);
        assert!(status.useful_error_message.is_none());

        status.mark_failed(ConditionType::ReconcileFailed, "Deploying", "boom");
        assert!(status.is_true(ConditionType::ReconcileFailed));
        assert!(!status.is_true(ConditionType::ReconcileSucceeded));
    }

    #[test]
    fn status_is_stale_until_generation_observed() {
        let mut app = app();
        assert!(!app.status_is_current());

        let mut status = AppStatus {
            observed_generation: Some(1),
            ..Default::default()
        };
        status.mark(ConditionType::ReconcileSucceeded, "");
        app.status = Some(status.clone());
        assert!(!app.status_is_current());

        status.observed_generation = Some(2);
        app.status = Some(status);
        assert!(app.status_is_current());
    }

    #[test]
    fn phase_follows_conditions() {
        let mut app = app();
        assert_eq!(Phase::of(&app), Phase::Created);

        let mut status = AppStatus::default();
        status.mark(ConditionType::Reconciling, "");
        app.status = Some(status.clone());
        assert_eq!(Phase::of(&app), Phase::Reconciling);
        assert!(!Phase::of(&app).is_terminal());

        status.mark_failed(ConditionType::ReconcileFailed, "Fetching", "no such image");
        app.status = Some(status);
        assert_eq!(Phase::of(&app), Phase::Failed);
        assert!(Phase::Failed.message(&app).contains("no such image"));
    }

    #[test]
    fn app_serializes_with_kapp_controller_field_names() {
        let mut app = app();
        app.spec.service_account_name = "educates-installer-sa".into();
        app.spec.fetch = vec![AppFetch {
            imgpkg_bundle: Some(ImgpkgBundleFetch {
                image: "ghcr.io/educates/educates-installer:3.0.0".into(),
            }),
            path: None,
        }];

        let value = serde_json::to_value(&app).unwrap();
        assert_eq!(value["apiVersion"], "kappctrl.k14s.io/v1alpha1");
        assert_eq!(value["kind"], "App");
        assert_eq!(value["spec"]["serviceAccountName"], "educates-installer-sa");
        assert_eq!(
            value["spec"]["fetch"][0]["imgpkgBundle"]["image"],
            "ghcr.io/educates/educates-installer:3.0.0"
        );
    }
}
