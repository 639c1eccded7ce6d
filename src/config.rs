use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use crate::controller::Error;

pub const DEFAULT_PACKAGE_REPOSITORY: &str = "ghcr.io/educates";
pub const BUNDLE_NAME: &str = "educates-installer";
/// Where locally built bundles are published inside the cluster.
pub const LATEST_BUNDLE: &str = "registry.default.svc.cluster.local/educates-installer:0.0.1";

/// Versioned bundle coordinate, `registry/repository[:tag][@digest]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BundleRef {
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl BundleRef {
    pub fn for_version(package_repository: &str, version: &str) -> Result<BundleRef, Error> {
        if version == "latest" {
            return LATEST_BUNDLE.parse();
        }
        format!(
            "{}/{}:{}",
            package_repository.trim_end_matches('/'),
            BUNDLE_NAME,
            version
        )
        .parse()
    }
}

impl FromStr for BundleRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.chars().any(char::is_whitespace) {
            return Err(Error::InvalidBundleRef(s.to_string()));
        }

        let invalid = || Error::InvalidBundleRef(s.to_string());

        // the digest carries a colon of its own, so it goes first
        let (name, digest) = match s.split_once('@') {
            Some((name, digest)) if digest.contains(':') && !digest.ends_with(':') => {
                (name, Some(digest))
            }
            Some(_) => return Err(invalid()),
            None => (s, None),
        };

        let name_start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match name[name_start..].rfind(':') {
            Some(i) => (&name[..name_start + i], Some(&name[name_start + i + 1..])),
            None => (name, None),
        };

        if repository.is_empty() || repository.ends_with('/') || tag == Some("") {
            return Err(invalid());
        }

        let tag = match (tag, digest) {
            (None, None) => Some("latest"),
            (tag, _) => tag,
        };
        Ok(BundleRef {
            repository: repository.to_string(),
            tag: tag.map(str::to_string),
            digest: digest.map(str::to_string),
        })
    }
}

impl std::fmt::Display for BundleRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfrastructure {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub namespace: String,
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIngress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_certificate_ref: Option<SecretReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_certificate_ref: Option<SecretReference>,
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStorage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSecurity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_engine: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImageRegistry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Platform configuration handed to the render stage as `values.yml`.
/// Sections the installer never reads are kept verbatim.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstallationConfig {
    #[serde(default)]
    pub cluster_infrastructure: ClusterInfrastructure,
    #[serde(default)]
    pub cluster_ingress: ClusterIngress,
    #[serde(default)]
    pub cluster_storage: ClusterStorage,
    #[serde(default)]
    pub cluster_security: ClusterSecurity,
    #[serde(default)]
    pub image_registry: ImageRegistry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_packages: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workshop_analytics: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website_styling: Option<Value>,
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

impl InstallationConfig {
    pub fn from_file(path: &Path) -> Result<InstallationConfig, Error> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("unable to read {}: {}", path.display(), e))
        })?;
        InstallationConfig::from_yaml(&data)
    }

    pub fn from_yaml(data: &str) -> Result<InstallationConfig, Error> {
        if data.trim().is_empty() {
            return Ok(InstallationConfig::default());
        }
        Ok(serde_yaml::from_str(data)?)
    }

    /// Fills in what the render stage always reads.
    pub fn with_defaults(mut self) -> InstallationConfig {
        self.cluster_infrastructure
            .provider
            .get_or_insert_with(|| "custom".into());

        let protocol = if self.cluster_ingress.tls_certificate_ref.is_some() {
            "https"
        } else {
            "http"
        };
        self.cluster_ingress
            .protocol
            .get_or_insert_with(|| protocol.into());

        self.cluster_security
            .policy_engine
            .get_or_insert_with(|| "none".into());
        self
    }

    pub fn validate_for_install(&self) -> Result<(), Error> {
        match self.cluster_ingress.domain.as_deref() {
            Some(domain) if !domain.trim().is_empty() => Ok(()),
            _ => Err(Error::InvalidConfig(
                "clusterIngress.domain must be set".into(),
            )),
        }
    }

    pub fn to_yaml(&self) -> Result<String, Error> {
        Ok(serde_yaml::to_string(self)?)
    }
}
