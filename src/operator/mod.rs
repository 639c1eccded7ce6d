mod client;
mod connection;
mod descriptor;
mod gate;
mod install;
mod pipeline;
mod provisioner;
mod runner;
mod store;
mod utils;

pub use client::{AppEvent, ClusterClient, KubeClusterClient};
pub use connection::{connect, ClusterConnection};
pub use descriptor::{build_descriptor, render_dry_run, Descriptor, Mode};
pub use gate::{await_deletion, await_success};
pub use install::{InstallOptions, Installer};
pub use pipeline::Pipeline;
pub use provisioner::IdentityProvisioner;
pub use runner::{CmdRunner, ProcessRunner, StageCommand, Verbosity};
pub use store::{InMemoryStore, ObjectStore};

#[cfg(test)]
pub use client::MockClusterClient;
#[cfg(test)]
pub use runner::MockCmdRunner;
