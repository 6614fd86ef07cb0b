mod bootstrap;
mod config;
mod deployer;
mod error;
mod hypervisor;
mod identity;
mod logging;
mod manifest;
mod orchestrator;
mod provisioner;
mod readiness;
mod remote;
mod template;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, DEFAULT_CONFIG_PATH};
use error::ProvisionError;
use hypervisor::{Hypervisor, QmCli};
use manifest::WorkloadManifest;
use orchestrator::Orchestrator;
use remote::SshExecutor;
use std::{env, path::Path, path::PathBuf};
use template::HttpImageFetcher;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(
	name = "cluster-provision",
	version,
	about = "Provision VMs, bootstrap k3s across them and deploy object storage."
)]
struct Cli {
	/// TOML configuration file.
	#[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
	config: PathBuf,

	/// Override the number of worker nodes.
	#[arg(short, long)]
	workers: Option<u32>,

	/// Print the planned VMs and the workload manifest, then exit.
	#[arg(long)]
	dry_run: bool,

	/// Log at debug level unless RUST_LOG says otherwise.
	#[arg(short, long)]
	verbose: bool,
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	logging::init(cli.verbose);
	info!("Cluster provisioning started.");
	if let Err(err) = run(cli).await {
		error!("Provisioning failed: {err:#}");
		error!("Resources created before the failure were left in place.");
		std::process::exit(1);
	}
	info!("Cluster provisioning finished.");
}

async fn run(cli: Cli) -> Result<()> {
	let mut config = load_config(&cli.config)?;
	if let Some(workers) = cli.workers {
		config.cluster.workers = workers;
		config.validate().context("Worker override")?;
	}
	check_tool(QmCli::PROGRAM)?;
	let ssh_public_key = std::fs::read_to_string(&config.vm.ssh_public_key_path).map_err(|err| {
		ProvisionError::PreconditionMissing(format!(
			"SSH public key {}: {err}",
			config.vm.ssh_public_key_path.display()
		))
	})?;
	let hypervisor = QmCli::default();

	if cli.dry_run {
		println!("{}", dry_run(&hypervisor, &config, &ssh_public_key).await?);
		return Ok(());
	}

	let fetcher = HttpImageFetcher::default();
	let executor = SshExecutor::new(&config.remote, &config.readiness)?;
	let orchestrator = Orchestrator::new(&hypervisor, &fetcher, &executor, &config, ssh_public_key);
	let report = orchestrator.run().await.context("Provisioning pipeline")?;
	println!("{report}");
	Ok(())
}

/// Renders the node plan and the manifest. Reads the host inventory, changes nothing.
async fn dry_run(
	hypervisor: &dyn Hypervisor,
	config: &Config,
	ssh_public_key: &str,
) -> Result<String> {
	let snapshot = hypervisor.inventory().await.context("Reading host inventory")?;
	let plan = orchestrator::plan_nodes(config, &snapshot, ssh_public_key)?;
	let manifest = WorkloadManifest::build(&config.workload).to_yaml()?;
	Ok(format!("{plan}\n{manifest}"))
}

fn load_config(path: &Path) -> Result<Config> {
	if path.exists() {
		return Config::load(path).with_context(|| format!("Loading {}", path.display()));
	}
	if path == Path::new(DEFAULT_CONFIG_PATH) {
		warn!("{DEFAULT_CONFIG_PATH} not found, using built-in defaults.");
		let config = Config::default();
		config.validate()?;
		return Ok(config);
	}
	Err(ProvisionError::Config(format!("{} does not exist", path.display())).into())
}

fn check_tool(program: &str) -> Result<(), ProvisionError> {
	let found = env::var_os("PATH")
		.map(|paths| env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
		.unwrap_or(false);
	if found {
		Ok(())
	} else {
		Err(ProvisionError::PreconditionMissing(format!(
			"'{program}' not found on PATH; run this on the hypervisor host"
		)))
	}
}
