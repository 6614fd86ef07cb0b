//! Virtualization control surface. The pipeline talks to the host only through
//! [`Hypervisor`], so every step above it can run against a fake in tests.

mod qm;

pub use qm::QmCli;

use crate::error::ProvisionError;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::{collections::BTreeSet, fmt, path::Path};

pub type VmId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
	Running,
	Stopped,
	Unknown,
}

/// One interface as reported by the guest agent, addresses in report order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestInterface {
	pub name: String,
	pub addresses: Vec<String>,
}

/// Ordered `--key value` options for `create` and `set`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmOptions(Vec<(String, String)>);

impl VmOptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn opt(mut self, key: &str, value: impl fmt::Display) -> Self {
		self.0.push((key.to_owned(), value.to_string()));
		self
	}

	#[cfg(test)]
	pub fn get(&self, key: &str) -> Option<&str> {
		self.0
			.iter()
			.find(|(k, _)| k == key)
			.map(|(_, v)| v.as_str())
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
	}
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Hypervisor: Send + Sync {
	/// Every VM and template identity currently registered on the host.
	async fn inventory(&self) -> Result<BTreeSet<VmId>, ProvisionError>;

	async fn status(&self, id: VmId) -> Result<VmStatus, ProvisionError>;

	async fn clone_vm(
		&self,
		template: VmId,
		id: VmId,
		name: &str,
		storage: &str,
	) -> Result<(), ProvisionError>;

	async fn set(&self, id: VmId, options: &VmOptions) -> Result<(), ProvisionError>;

	async fn resize(&self, id: VmId, disk: &str, delta_gb: u32) -> Result<(), ProvisionError>;

	async fn start(&self, id: VmId) -> Result<(), ProvisionError>;

	async fn stop(&self, id: VmId) -> Result<(), ProvisionError>;

	async fn create(&self, id: VmId, options: &VmOptions) -> Result<(), ProvisionError>;

	/// Imports `image` as an unused disk of `id` and returns its volume id, which
	/// depends on the storage type (`local-lvm:vm-9000-disk-0`,
	/// `local:9000/vm-9000-disk-0.raw`).
	async fn import_disk(
		&self,
		id: VmId,
		image: &Path,
		storage: &str,
	) -> Result<String, ProvisionError>;

	async fn template(&self, id: VmId) -> Result<(), ProvisionError>;

	async fn guest_network_interfaces(
		&self,
		id: VmId,
	) -> Result<Vec<GuestInterface>, ProvisionError>;
}
