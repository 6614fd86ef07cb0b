use crate::config::VmConfig;
use crate::error::ProvisionError;
use crate::hypervisor::{Hypervisor, VmId, VmOptions, VmStatus};
use crate::template::TemplateRef;
use std::{fmt, net::IpAddr};
use tracing::{info, warn};

pub const PRIMARY_DISK: &str = "scsi0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
	Control,
	Worker,
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Role::Control => f.pad("control"),
			Role::Worker => f.pad("worker"),
		}
	}
}

/// Everything needed to create one VM. Built once, never changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
	pub id: VmId,
	pub name: String,
	pub cores: u32,
	pub memory_mb: u32,
	pub disk_grow_gb: u32,
	pub bridge: String,
	pub ssh_public_key: String,
	pub ci_user: String,
	pub storage: String,
}

impl VmSpec {
	pub fn from_config(id: VmId, name: String, vm: &VmConfig, ssh_public_key: &str) -> Self {
		Self {
			id,
			name,
			cores: vm.cores,
			memory_mb: vm.memory_mb,
			disk_grow_gb: vm.disk_grow_gb,
			bridge: vm.bridge.clone(),
			ssh_public_key: ssh_public_key.trim().to_owned(),
			ci_user: vm.ci_user.clone(),
			storage: vm.storage.clone(),
		}
	}

	fn settings(&self) -> VmOptions {
		VmOptions::new()
			.opt("cores", self.cores)
			.opt("memory", self.memory_mb)
			.opt("net0", format!("virtio,bridge={}", self.bridge))
			.opt("ipconfig0", "ip=dhcp")
			.opt("ciuser", &self.ci_user)
			.opt("sshkeys", &self.ssh_public_key)
			.opt("agent", "enabled=1")
	}
}

/// A provisioned VM. The address is filled in once, by the readiness poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmHandle {
	pub id: VmId,
	pub name: String,
	pub role: Role,
	address: Option<IpAddr>,
}

impl VmHandle {
	pub fn new(id: VmId, name: impl Into<String>, role: Role) -> Self {
		Self {
			id,
			name: name.into(),
			role,
			address: None,
		}
	}

	pub fn address(&self) -> Option<IpAddr> {
		self.address
	}

	pub(crate) fn with_address(mut self, address: IpAddr) -> Self {
		debug_assert!(self.address.is_none(), "VM address is set exactly once");
		self.address = Some(address);
		self
	}
}

/// Clones the template into `spec.id`, configures it and boots it.
///
/// A second clone at an identity that already exists fails and is surfaced as
/// `CloneFailed`. Later steps tolerate a VM already in the target state.
pub async fn provision(
	hypervisor: &dyn Hypervisor,
	spec: &VmSpec,
	role: Role,
	template: TemplateRef,
) -> Result<VmHandle, ProvisionError> {
	if !template.present {
		return Err(ProvisionError::PreconditionMissing(format!(
			"template {} must exist before cloning {}",
			template.id, spec.name
		)));
	}
	let id = spec.id;
	let step_failed = |step: &'static str| {
		move |err: ProvisionError| ProvisionError::ConfigurationFailed {
			id,
			step,
			reason: err.to_string(),
		}
	};
	info!(id, name = %spec.name, %role, "Cloning template {}.", template.id);
	hypervisor
		.clone_vm(template.id, id, &spec.name, &spec.storage)
		.await
		.map_err(|err| ProvisionError::CloneFailed {
			id,
			name: spec.name.clone(),
			reason: err.to_string(),
		})?;
	ensure_stopped(hypervisor, id).await.map_err(step_failed("stop"))?;
	hypervisor
		.set(id, &spec.settings())
		.await
		.map_err(step_failed("configure"))?;
	if spec.disk_grow_gb > 0 {
		if let Err(err) = hypervisor.resize(id, PRIMARY_DISK, spec.disk_grow_gb).await {
			warn!(id, "Disk growth by {}G failed, continuing: {err}", spec.disk_grow_gb);
		}
	}
	hypervisor.start(id).await.map_err(step_failed("start"))?;
	info!(id, name = %spec.name, "VM started.");
	Ok(VmHandle::new(id, spec.name.clone(), role))
}

async fn ensure_stopped(hypervisor: &dyn Hypervisor, id: VmId) -> Result<(), ProvisionError> {
	if hypervisor.status(id).await? != VmStatus::Running {
		return Ok(());
	}
	info!(id, "Clone is running, stopping it before configuration.");
	if let Err(err) = hypervisor.stop(id).await {
		// Lost a race with a shutdown; already stopped counts as success.
		if hypervisor.status(id).await? == VmStatus::Running {
			return Err(err);
		}
	}
	Ok(())
}
