use clap::{Args, Parser};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, Level};

mod config;
mod controller;
mod crd;
mod operator;

use config::{BundleRef, InstallationConfig, DEFAULT_PACKAGE_REPOSITORY};
use controller::Error;
use operator::{
    build_descriptor, connect, render_dry_run, InstallOptions, Installer, KubeClusterClient,
    Mode, ProcessRunner, Verbosity,
};

#[derive(Parser)]
#[command(name = "educates-installer")]
#[command(bin_name = "educates-installer")]
enum InstallerCli {
    /// Install (or delete) the platform into the current cluster.
    Install(InstallArgs),
}

#[derive(Args)]
#[command(author, about, long_about = None)]
struct InstallArgs {
    /// Platform configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the generated resources instead of installing them.
    #[arg(long)]
    dry_run: bool,

    #[arg(short, long)]
    verbose: bool,

    /// Remove a previous installation.
    #[arg(long)]
    delete: bool,

    /// Let the controller running in the cluster reconcile the installation.
    #[arg(long)]
    managed: bool,

    #[arg(long, default_value = DEFAULT_PACKAGE_REPOSITORY)]
    package_repository: String,

    /// Bundle version, `latest` for a locally published build.
    #[arg(long = "version", default_value = "latest")]
    bundle_version: String,

    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Seconds to wait for the installation to settle.
    #[arg(long, default_value_t = 600)]
    timeout: u64,
}

#[tokio::main]
async fn main() {
    let InstallerCli::Install(args) = InstallerCli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .init();

    if let Err(e) = run(args).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: InstallArgs) -> Result<(), Error> {
    let mode = if args.delete {
        Mode::Delete
    } else {
        Mode::Install
    };

    let config = match &args.config {
        Some(path) => InstallationConfig::from_file(path)?,
        None => InstallationConfig::default(),
    }
    .with_defaults();
    if mode == Mode::Install {
        config.validate_for_install()?;
    }

    let bundle = BundleRef::for_version(&args.package_repository, &args.bundle_version)?;
    let descriptor = build_descriptor(&config, &bundle, mode)?;

    if args.dry_run {
        print!("{}", render_dry_run(&descriptor)?);
        return Ok(());
    }

    info!("Using bundle {}", bundle);
    let (client, connection) = connect(args.kubeconfig.clone()).await?;

    let verbosity = if args.verbose {
        Verbosity::Detailed
    } else {
        Verbosity::Simple
    };
    let options = InstallOptions {
        mode,
        managed: args.managed,
        timeout: Duration::from_secs(args.timeout),
        ..Default::default()
    };

    Installer::new(
        KubeClusterClient::new(client),
        ProcessRunner::new(verbosity),
        connection,
        options,
    )
    .run(descriptor)
    .await
}
