//! In-memory collaborators for pipeline tests.

use crate::error::ProvisionError;
use crate::hypervisor::{GuestInterface, Hypervisor, VmId, VmOptions, VmStatus};
use crate::remote::{RemoteExecutor, RemoteOutput};
use crate::template::{DownloadedImage, ImageFetcher};
use async_trait::async_trait;
use std::{
	collections::{BTreeSet, HashSet},
	net::IpAddr,
	path::Path,
	sync::{Arc, Mutex},
};
use tempfile::NamedTempFile;

pub const TOKEN: &str = "K10fake::server:token";

/// Guest address the fake host hands out for a VM identity.
pub fn address_of(id: VmId) -> IpAddr {
	format!("192.168.10.{}", id % 250).parse().unwrap()
}

#[derive(Debug, Default)]
struct HostState {
	vms: BTreeSet<VmId>,
	running: BTreeSet<VmId>,
	calls: Vec<String>,
}

/// A host where every step succeeds unless told otherwise.
#[derive(Debug, Clone, Default)]
pub struct FakeHypervisor {
	state: Arc<Mutex<HostState>>,
	fail_clone: HashSet<VmId>,
	never_ready: HashSet<VmId>,
}

impl FakeHypervisor {
	pub fn with_vms(ids: &[VmId]) -> Self {
		let fake = Self::default();
		fake.state.lock().unwrap().vms.extend(ids.iter().copied());
		fake
	}

	/// Clones into these identities fail.
	pub fn with_failing_clone(mut self, ids: impl IntoIterator<Item = VmId>) -> Self {
		self.fail_clone.extend(ids);
		self
	}

	/// These VMs boot but never report a usable address.
	pub fn with_never_ready(mut self, ids: impl IntoIterator<Item = VmId>) -> Self {
		self.never_ready.extend(ids);
		self
	}

	pub fn calls(&self) -> Vec<String> {
		self.state.lock().unwrap().calls.clone()
	}

	pub fn vms(&self) -> BTreeSet<VmId> {
		self.state.lock().unwrap().vms.clone()
	}

	fn record(&self, call: String) {
		self.state.lock().unwrap().calls.push(call);
	}
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
	async fn inventory(&self) -> Result<BTreeSet<VmId>, ProvisionError> {
		Ok(self.vms())
	}

	async fn status(&self, id: VmId) -> Result<VmStatus, ProvisionError> {
		let state = self.state.lock().unwrap();
		Ok(if state.running.contains(&id) {
			VmStatus::Running
		} else {
			VmStatus::Stopped
		})
	}

	async fn clone_vm(
		&self,
		template: VmId,
		id: VmId,
		name: &str,
		_storage: &str,
	) -> Result<(), ProvisionError> {
		self.record(format!("clone {template} {id} {name}"));
		let mut state = self.state.lock().unwrap();
		if self.fail_clone.contains(&id) || !state.vms.insert(id) {
			return Err(ProvisionError::Config(format!("VM {id} already exists")));
		}
		Ok(())
	}

	async fn set(&self, id: VmId, _options: &VmOptions) -> Result<(), ProvisionError> {
		self.record(format!("set {id}"));
		Ok(())
	}

	async fn resize(&self, id: VmId, disk: &str, delta_gb: u32) -> Result<(), ProvisionError> {
		self.record(format!("resize {id} {disk} +{delta_gb}G"));
		Ok(())
	}

	async fn start(&self, id: VmId) -> Result<(), ProvisionError> {
		self.record(format!("start {id}"));
		self.state.lock().unwrap().running.insert(id);
		Ok(())
	}

	async fn stop(&self, id: VmId) -> Result<(), ProvisionError> {
		self.record(format!("stop {id}"));
		self.state.lock().unwrap().running.remove(&id);
		Ok(())
	}

	async fn create(&self, id: VmId, _options: &VmOptions) -> Result<(), ProvisionError> {
		self.record(format!("create {id}"));
		self.state.lock().unwrap().vms.insert(id);
		Ok(())
	}

	async fn import_disk(
		&self,
		id: VmId,
		_image: &Path,
		storage: &str,
	) -> Result<String, ProvisionError> {
		self.record(format!("importdisk {id}"));
		Ok(format!("{storage}:vm-{id}-disk-0"))
	}

	async fn template(&self, id: VmId) -> Result<(), ProvisionError> {
		self.record(format!("template {id}"));
		Ok(())
	}

	async fn guest_network_interfaces(
		&self,
		id: VmId,
	) -> Result<Vec<GuestInterface>, ProvisionError> {
		let running = self.state.lock().unwrap().running.contains(&id);
		if !running {
			return Err(ProvisionError::GuestAgent(format!("VM {id} is not running")));
		}
		let mut interfaces = vec![GuestInterface {
			name: "lo".to_owned(),
			addresses: vec!["127.0.0.1".to_owned()],
		}];
		if !self.never_ready.contains(&id) {
			interfaces.push(GuestInterface {
				name: "eth0".to_owned(),
				addresses: vec![address_of(id).to_string()],
			});
		}
		Ok(interfaces)
	}
}

#[derive(Debug, Default)]
pub struct FakeFetcher;

#[async_trait]
impl ImageFetcher for FakeFetcher {
	async fn fetch(&self, _url: &str) -> Result<DownloadedImage, ProvisionError> {
		Ok(DownloadedImage::new(NamedTempFile::new()?))
	}
}

/// Records every remote call in order. Agent installs to `fail_join` exit non-zero.
#[derive(Debug, Clone, Default)]
pub struct FakeExecutor {
	calls: Arc<Mutex<Vec<(IpAddr, String)>>>,
	fail_join: HashSet<IpAddr>,
	fail_apply: bool,
}

impl FakeExecutor {
	pub fn with_failing_join(mut self, addresses: impl IntoIterator<Item = IpAddr>) -> Self {
		self.fail_join.extend(addresses);
		self
	}

	pub fn with_failing_apply(mut self) -> Self {
		self.fail_apply = true;
		self
	}

	pub fn calls(&self) -> Vec<(IpAddr, String)> {
		self.calls.lock().unwrap().clone()
	}

	fn respond(&self, address: IpAddr, command: &str) -> RemoteOutput {
		self.calls
			.lock()
			.unwrap()
			.push((address, command.to_owned()));
		let failed = (command.contains("K3S_URL=") && self.fail_join.contains(&address))
			|| (command.contains("apply") && self.fail_apply);
		if failed {
			return RemoteOutput {
				exit_status: 1,
				stderr: "simulated failure".to_owned(),
				..RemoteOutput::default()
			};
		}
		let stdout = if command.contains("node-token") {
			format!("{TOKEN}\n")
		} else {
			String::new()
		};
		RemoteOutput {
			stdout,
			..RemoteOutput::default()
		}
	}
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
	async fn run(&self, address: IpAddr, command: &str) -> Result<RemoteOutput, ProvisionError> {
		Ok(self.respond(address, command))
	}

	async fn run_with_stdin(
		&self,
		address: IpAddr,
		command: &str,
		_stdin: &str,
	) -> Result<RemoteOutput, ProvisionError> {
		Ok(self.respond(address, command))
	}
}
