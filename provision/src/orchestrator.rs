use crate::bootstrap::{self, BootstrapPhase};
use crate::config::Config;
use crate::deployer::{self, ClusterEndpoint};
use crate::error::ProvisionError;
use crate::hypervisor::{Hypervisor, VmId};
use crate::identity;
use crate::manifest::WorkloadManifest;
use crate::provisioner::{self, Role, VmHandle, VmSpec};
use crate::readiness::{self, PollPolicy};
use crate::remote::RemoteExecutor;
use crate::template::{self, ImageFetcher, TemplateRef};
use futures::future;
use std::{collections::BTreeSet, fmt, net::IpAddr};
use tracing::{error, info, warn};

/// VM specs for one run, control node first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePlan {
	pub control: VmSpec,
	pub workers: Vec<VmSpec>,
}

impl fmt::Display for NodePlan {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let line = |f: &mut fmt::Formatter<'_>, role: Role, spec: &VmSpec| {
			writeln!(
				f,
				"{:>6} {:<24} {:<8} {} cores, {} MB, +{}G on {}",
				spec.id, spec.name, role, spec.cores, spec.memory_mb, spec.disk_grow_gb, spec.bridge
			)
		};
		line(f, Role::Control, &self.control)?;
		for worker in &self.workers {
			line(f, Role::Worker, worker)?;
		}
		Ok(())
	}
}

pub fn node_name(prefix: &str, role: Role, index: usize) -> String {
	match role {
		Role::Control => format!("{prefix}-control"),
		Role::Worker => format!("{prefix}-worker-{index}"),
	}
}

/// Assigns every node its identity from one inventory snapshot.
pub fn plan_nodes(
	config: &Config,
	snapshot: &BTreeSet<VmId>,
	ssh_public_key: &str,
) -> Result<NodePlan, ProvisionError> {
	let workers = config.cluster.workers as usize;
	let ids = identity::resolve(&config.identity, snapshot, config.template.id, workers)?;
	let prefix = &config.cluster.name_prefix;
	let spec = |id: VmId, role: Role, index: usize| {
		VmSpec::from_config(id, node_name(prefix, role, index), &config.vm, ssh_public_key)
	};
	Ok(NodePlan {
		control: spec(ids.control, Role::Control, 0),
		workers: ids
			.workers
			.iter()
			.enumerate()
			.map(|(index, &id)| spec(id, Role::Worker, index + 1))
			.collect(),
	})
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStage {
	Provision,
	Readiness,
	Join,
}

impl fmt::Display for WorkerStage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			WorkerStage::Provision => write!(f, "provision"),
			WorkerStage::Readiness => write!(f, "readiness"),
			WorkerStage::Join => write!(f, "join"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
	Joined {
		id: VmId,
		name: String,
		address: IpAddr,
	},
	Failed {
		id: VmId,
		name: String,
		stage: WorkerStage,
		error: String,
	},
}

impl WorkerOutcome {
	fn failed(spec_id: VmId, name: &str, stage: WorkerStage, err: &ProvisionError) -> Self {
		error!(id = spec_id, name, %stage, "Worker failed: {err}");
		WorkerOutcome::Failed {
			id: spec_id,
			name: name.to_owned(),
			stage,
			error: err.to_string(),
		}
	}

	pub fn is_joined(&self) -> bool {
		matches!(self, WorkerOutcome::Joined { .. })
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
	pub endpoint: ClusterEndpoint,
	pub phase: BootstrapPhase,
	pub control: VmHandle,
	pub workers: Vec<WorkerOutcome>,
}

impl RunReport {
	pub fn healthy_workers(&self) -> usize {
		self.workers.iter().filter(|w| w.is_joined()).count()
	}

	pub fn failed_workers(&self) -> usize {
		self.workers.len() - self.healthy_workers()
	}

	pub fn is_degraded(&self) -> bool {
		self.failed_workers() > 0
	}
}

impl fmt::Display for RunReport {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		writeln!(f, "{}", self.endpoint)?;
		writeln!(f, "Control VM:   {} ({})", self.control.name, self.control.id)?;
		writeln!(
			f,
			"Cluster:      {} ({} of {} workers joined)",
			self.phase,
			self.healthy_workers(),
			self.workers.len()
		)?;
		for worker in &self.workers {
			match worker {
				WorkerOutcome::Joined { id, name, address } => {
					writeln!(f, "  {id:>6} {name:<24} joined at {address}")?;
				}
				WorkerOutcome::Failed {
					id,
					name,
					stage,
					error,
				} => {
					writeln!(f, "  {id:>6} {name:<24} FAILED during {stage}: {error}")?;
				}
			}
		}
		Ok(())
	}
}

/// Runs the fixed pipeline against the given collaborators.
///
/// Anything on the control node's path aborts the run. A worker failing at any
/// stage is recorded and the run carries on without it. Nothing created before
/// an abort is removed.
pub struct Orchestrator<'a> {
	hypervisor: &'a dyn Hypervisor,
	fetcher: &'a dyn ImageFetcher,
	executor: &'a dyn RemoteExecutor,
	config: &'a Config,
	ssh_public_key: String,
}

impl<'a> Orchestrator<'a> {
	pub fn new(
		hypervisor: &'a dyn Hypervisor,
		fetcher: &'a dyn ImageFetcher,
		executor: &'a dyn RemoteExecutor,
		config: &'a Config,
		ssh_public_key: String,
	) -> Self {
		Self {
			hypervisor,
			fetcher,
			executor,
			config,
			ssh_public_key,
		}
	}

	pub async fn plan(&self) -> Result<NodePlan, ProvisionError> {
		let snapshot = self.hypervisor.inventory().await?;
		plan_nodes(self.config, &snapshot, &self.ssh_public_key)
	}

	pub async fn run(&self) -> Result<RunReport, ProvisionError> {
		let config = self.config;
		let policy = PollPolicy::from(&config.readiness);
		let template = template::ensure_template(
			self.hypervisor,
			self.fetcher,
			TemplateRef::unchecked(config.template.id),
			&config.template,
			&config.vm.bridge,
		)
		.await?;
		let plan = self.plan().await?;
		info!(
			control = plan.control.id,
			workers = ?plan.workers.iter().map(|w| w.id).collect::<Vec<_>>(),
			"Identities reserved."
		);

		let control =
			provisioner::provision(self.hypervisor, &plan.control, Role::Control, template).await?;
		let control = readiness::await_address(self.hypervisor, control, policy).await?;
		let control_address = control.address().ok_or_else(|| {
			ProvisionError::PreconditionMissing(format!("{} has no address", control.name))
		})?;

		let brought_up = future::join_all(
			plan.workers
				.iter()
				.map(|spec| self.bring_up_worker(spec, template, policy)),
		)
		.await;

		let mut phase = BootstrapPhase::Unbootstrapped;
		let token = bootstrap::install_control(self.executor, control_address).await?;
		phase = advance(phase, BootstrapPhase::ControlReady);

		let workers = future::join_all(brought_up.into_iter().map(|worker| {
			let token = &token;
			async move {
				let handle = match worker {
					Ok(handle) => handle,
					Err(outcome) => return outcome,
				};
				let Some(address) = handle.address() else {
					return WorkerOutcome::failed(
						handle.id,
						&handle.name,
						WorkerStage::Readiness,
						&ProvisionError::PreconditionMissing("no address".to_owned()),
					);
				};
				match bootstrap::install_worker(self.executor, address, control_address, token).await
				{
					Ok(()) => WorkerOutcome::Joined {
						id: handle.id,
						name: handle.name,
						address,
					},
					Err(err) => {
						WorkerOutcome::failed(handle.id, &handle.name, WorkerStage::Join, &err)
					}
				}
			}
		}))
		.await;
		phase = advance(phase, BootstrapPhase::ClusterReady);

		let manifest = WorkloadManifest::build(&config.workload);
		let endpoint =
			deployer::deploy(self.executor, control_address, &manifest, &config.workload).await?;
		let report = RunReport {
			endpoint,
			phase,
			control,
			workers,
		};
		if report.is_degraded() {
			warn!(
				failed = report.failed_workers(),
				healthy = report.healthy_workers(),
				"Cluster is running with fewer workers than requested."
			);
		}
		Ok(report)
	}

	async fn bring_up_worker(
		&self,
		spec: &VmSpec,
		template: TemplateRef,
		policy: PollPolicy,
	) -> Result<VmHandle, WorkerOutcome> {
		let handle = provisioner::provision(self.hypervisor, spec, Role::Worker, template)
			.await
			.map_err(|err| WorkerOutcome::failed(spec.id, &spec.name, WorkerStage::Provision, &err))?;
		readiness::await_address(self.hypervisor, handle, policy)
			.await
			.map_err(|err| WorkerOutcome::failed(spec.id, &spec.name, WorkerStage::Readiness, &err))
	}
}

fn advance(from: BootstrapPhase, to: BootstrapPhase) -> BootstrapPhase {
	info!("Bootstrap phase: {from} -> {to}.");
	to
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{IdentityPolicy, NodePortMode};
	use crate::testing::{FakeExecutor, FakeFetcher, FakeHypervisor, TOKEN, address_of};

	const KEY: &str = "ssh-ed25519 AAAAC3Nza test@host";

	fn config(workers: u32) -> Config {
		let mut config = Config::default();
		config.cluster.workers = workers;
		config
	}

	#[test]
	fn plan_names_and_ids() {
		let plan = plan_nodes(&config(2), &BTreeSet::from([100, 9000]), KEY).unwrap();
		assert_eq!(plan.control.id, 101);
		assert_eq!(plan.control.name, "k3s-control");
		let workers = plan
			.workers
			.iter()
			.map(|w| (w.id, w.name.as_str()))
			.collect::<Vec<_>>();
		assert_eq!(workers, vec![(102, "k3s-worker-1"), (103, "k3s-worker-2")]);
	}

	#[test]
	fn plan_table_columns_line_up() {
		let plan = plan_nodes(&config(1), &BTreeSet::new(), KEY).unwrap();
		let rendered = plan.to_string();
		let lines = rendered.lines().collect::<Vec<_>>();
		assert_eq!(lines.len(), 2);
		let cores_at = |line: &str| line.find(" cores").unwrap();
		assert_eq!(cores_at(lines[0]), cores_at(lines[1]));
		assert!(lines[1].contains("worker   "));
	}

	#[test]
	fn plan_with_fixed_identities() {
		let mut config = config(1);
		config.identity.policy = IdentityPolicy::Fixed;
		config.identity.control = Some(300);
		config.identity.workers = vec![310];
		let plan = plan_nodes(&config, &BTreeSet::new(), KEY).unwrap();
		assert_eq!(plan.control.id, 300);
		assert_eq!(plan.workers[0].id, 310);
	}

	#[tokio::test(start_paused = true)]
	async fn one_control_two_workers_end_to_end() {
		let hypervisor = FakeHypervisor::default();
		let executor = FakeExecutor::default();
		let config = config(2);
		let orchestrator =
			Orchestrator::new(&hypervisor, &FakeFetcher, &executor, &config, KEY.to_owned());
		let report = orchestrator.run().await.unwrap();

		assert_eq!(report.endpoint.control_address, address_of(100));
		assert_eq!(report.endpoint.api_port, 30900);
		assert_eq!(report.endpoint.console_port, 30901);
		assert_eq!(report.phase, BootstrapPhase::ClusterReady);
		assert_eq!(report.healthy_workers(), 2);
		assert_eq!(report.failed_workers(), 0);
		assert!(!report.is_degraded());
		assert_eq!(hypervisor.vms(), BTreeSet::from([100, 101, 102, 9000]));
		let calls = hypervisor.calls();
		assert_eq!(calls[0], "create 9000");
		assert!(calls.contains(&"clone 9000 100 k3s-control".to_owned()));
	}

	#[tokio::test(start_paused = true)]
	async fn workers_join_only_after_control_token() {
		let hypervisor = FakeHypervisor::default();
		let executor = FakeExecutor::default();
		let config = config(3);
		Orchestrator::new(&hypervisor, &FakeFetcher, &executor, &config, KEY.to_owned())
			.run()
			.await
			.unwrap();

		let calls = executor.calls();
		let token_read = calls
			.iter()
			.position(|(_, cmd)| cmd.contains("node-token"))
			.unwrap();
		let joins = calls
			.iter()
			.enumerate()
			.filter(|(_, (_, cmd))| cmd.contains("K3S_URL="))
			.collect::<Vec<_>>();
		assert_eq!(joins.len(), 3);
		for (index, (address, cmd)) in joins {
			assert!(index > token_read);
			assert_ne!(*address, address_of(100));
			assert!(cmd.contains(&format!("K3S_TOKEN={TOKEN}")));
			assert!(cmd.contains(&format!("https://{}:6443", address_of(100))));
		}
		let apply = calls
			.iter()
			.position(|(_, cmd)| cmd.contains("apply"))
			.unwrap();
		assert_eq!(apply, calls.len() - 1);
		assert_eq!(calls[apply].0, address_of(100));
	}

	#[tokio::test(start_paused = true)]
	async fn failed_worker_join_degrades_but_completes() {
		let hypervisor = FakeHypervisor::default();
		let executor = FakeExecutor::default().with_failing_join([address_of(102)]);
		let config = config(2);
		let report =
			Orchestrator::new(&hypervisor, &FakeFetcher, &executor, &config, KEY.to_owned())
				.run()
				.await
				.unwrap();

		assert_eq!(report.healthy_workers(), 1);
		assert_eq!(report.failed_workers(), 1);
		assert!(report.is_degraded());
		assert!(matches!(
			&report.workers[1],
			WorkerOutcome::Failed {
				id: 102,
				stage: WorkerStage::Join,
				..
			}
		));
		assert!(executor.calls().iter().any(|(_, cmd)| cmd.contains("apply")));
		assert!(report.to_string().contains("FAILED during join"));
	}

	#[tokio::test(start_paused = true)]
	async fn worker_that_never_gets_an_address_is_isolated() {
		let hypervisor = FakeHypervisor::default().with_never_ready([101]);
		let executor = FakeExecutor::default();
		let config = config(2);
		let report =
			Orchestrator::new(&hypervisor, &FakeFetcher, &executor, &config, KEY.to_owned())
				.run()
				.await
				.unwrap();

		assert!(matches!(
			&report.workers[0],
			WorkerOutcome::Failed {
				stage: WorkerStage::Readiness,
				..
			}
		));
		assert!(report.workers[1].is_joined());
		assert!(
			executor
				.calls()
				.iter()
				.all(|(address, _)| *address != address_of(101))
		);
	}

	#[tokio::test(start_paused = true)]
	async fn control_clone_failure_aborts_before_any_remote_call() {
		let hypervisor = FakeHypervisor::default().with_failing_clone([100]);
		let executor = FakeExecutor::default();
		let config = config(2);
		let result =
			Orchestrator::new(&hypervisor, &FakeFetcher, &executor, &config, KEY.to_owned())
				.run()
				.await;
		assert!(matches!(result, Err(ProvisionError::CloneFailed { id: 100, .. })));
		assert!(executor.calls().is_empty());
		assert!(!hypervisor.calls().iter().any(|c| c.starts_with("clone 9000 101")));
	}

	#[tokio::test(start_paused = true)]
	async fn control_readiness_timeout_is_fatal() {
		let hypervisor = FakeHypervisor::default().with_never_ready([100]);
		let executor = FakeExecutor::default();
		let config = config(1);
		let result =
			Orchestrator::new(&hypervisor, &FakeFetcher, &executor, &config, KEY.to_owned())
				.run()
				.await;
		assert!(matches!(
			result,
			Err(ProvisionError::ReadinessTimeout { id: 100, .. })
		));
		assert!(executor.calls().is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn manifest_failure_is_fatal_after_cluster_exists() {
		let hypervisor = FakeHypervisor::default();
		let executor = FakeExecutor::default().with_failing_apply();
		let config = config(1);
		let result =
			Orchestrator::new(&hypervisor, &FakeFetcher, &executor, &config, KEY.to_owned())
				.run()
				.await;
		assert!(matches!(result, Err(ProvisionError::ManifestApplyFailed(_))));
		assert!(executor.calls().iter().any(|(_, cmd)| cmd.contains("K3S_URL=")));
	}

	#[tokio::test(start_paused = true)]
	async fn existing_template_is_reused_and_zero_workers_is_valid() {
		let hypervisor = FakeHypervisor::with_vms(&[9000]);
		let executor = FakeExecutor::default();
		let mut config = config(0);
		config.workload.node_ports = NodePortMode::Fixed;
		let report =
			Orchestrator::new(&hypervisor, &FakeFetcher, &executor, &config, KEY.to_owned())
				.run()
				.await
				.unwrap();
		assert!(report.workers.is_empty());
		let calls = hypervisor.calls();
		assert!(!calls.iter().any(|c| c.starts_with("create") || c.starts_with("template")));
	}
}
