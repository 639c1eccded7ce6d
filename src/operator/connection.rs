use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::controller::Error;

/// Where stage subprocesses find the cluster. Handed to every stage command
/// explicitly, never written into the installer's own environment.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterConnection {
    pub host: String,
    pub port: u16,
    /// PEM encoded trust bundle for the API server.
    pub ca_bundle: Option<Vec<u8>>,
    pub kubeconfig: Option<PathBuf>,
    /// Bearer token of the identity stages act as. When set, stages get a
    /// kubeconfig of their own instead of the caller's.
    pub token: Option<String>,
}

/// File names inside the pass working directory.
const CA_FILE: &str = "cluster-ca.pem";
pub const STAGE_KUBECONFIG_FILE: &str = "installer-kubeconfig.yml";

impl ClusterConnection {
    pub fn from_config(config: &kube::Config, kubeconfig: Option<PathBuf>) -> ClusterConnection {
        let url = &config.cluster_url;
        let port = url.port_u16().unwrap_or(match url.scheme_str() {
            Some("http") => 80,
            _ => 443,
        });

        let ca_bundle = config.root_cert.as_ref().map(|certs| {
            certs
                .iter()
                .map(|der| pem_encode(der))
                .collect::<String>()
                .into_bytes()
        });

        ClusterConnection {
            host: url.host().unwrap_or_default().to_string(),
            port,
            ca_bundle,
            kubeconfig,
            token: None,
        }
    }

    pub fn with_token(&self, token: String) -> ClusterConnection {
        ClusterConnection {
            token: Some(token),
            ..self.clone()
        }
    }

    fn server_url(&self) -> String {
        if self.host.contains(':') {
            format!("https://[{}]:{}", self.host, self.port)
        } else {
            format!("https://{}:{}", self.host, self.port)
        }
    }

    fn token_kubeconfig(&self, token: &str, ca_file: Option<&Path>) -> Result<String, Error> {
        let mut cluster = json!({ "server": self.server_url() });
        if let Some(ca_file) = ca_file {
            cluster["certificate-authority"] = json!(ca_file.display().to_string());
        }
        let config = json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{ "name": "installer", "cluster": cluster }],
            "users": [{ "name": "installer", "user": { "token": token } }],
            "contexts": [{
                "name": "installer",
                "context": { "cluster": "installer", "user": "installer" }
            }],
            "current-context": "installer",
        });
        Ok(serde_yaml::to_string(&config)?)
    }

    /// Environment for stage subprocesses. The trust bundle is written into
    /// `workdir` so it disappears with the pass that needed it.
    pub async fn stage_env(&self, workdir: &Path) -> Result<Vec<(String, String)>, Error> {
        let mut env = Vec::new();
        if !self.host.is_empty() {
            env.push(("KUBERNETES_SERVICE_HOST".to_string(), self.host.clone()));
            env.push(("KUBERNETES_SERVICE_PORT".to_string(), self.port.to_string()));
        }
        let ca_file = match &self.ca_bundle {
            Some(bundle) => {
                let path = workdir.join(CA_FILE);
                tokio::fs::write(&path, bundle).await?;
                env.push(("SSL_CERT_FILE".to_string(), path.display().to_string()));
                Some(path)
            }
            None => None,
        };
        match (&self.token, &self.kubeconfig) {
            (Some(token), _) => {
                let path = workdir.join(STAGE_KUBECONFIG_FILE);
                let kubeconfig = self.token_kubeconfig(token, ca_file.as_deref())?;
                tokio::fs::write(&path, kubeconfig).await?;
                env.push(("KUBECONFIG".to_string(), path.display().to_string()));
            }
            (None, Some(kubeconfig)) => {
                env.push(("KUBECONFIG".to_string(), kubeconfig.display().to_string()));
            }
            (None, None) => {}
        }
        Ok(env)
    }
}

/// Builds a client for the ambient (or explicitly named) kubeconfig together
/// with the connection details stage subprocesses need.
pub async fn connect(kubeconfig: Option<PathBuf>) -> Result<(Client, ClusterConnection), Error> {
    let config = match &kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path)?;
            kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default()).await?
        }
        None => kube::Config::infer().await?,
    };

    let connection = ClusterConnection::from_config(&config, kubeconfig);
    debug!(
        "Cluster endpoint {}:{} (trust bundle: {})",
        connection.host,
        connection.port,
        connection.ca_bundle.is_some()
    );

    let client = Client::try_from(config)?;
    Ok((client, connection))
}

fn pem_encode(der: &[u8]) -> String {
    let encoded = BASE64.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(chunk));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}
