use crate::error::ProvisionError;
use crate::hypervisor::VmId;
use serde::{Deserialize, Serialize};
use std::{
	collections::BTreeSet,
	path::{Path, PathBuf},
	time::Duration,
};

pub const DEFAULT_CONFIG_PATH: &str = "cluster.toml";

/// Static description of the cluster to build. Nothing in here is discovered at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
	pub cluster: ClusterConfig,
	pub identity: IdentityConfig,
	pub vm: VmConfig,
	pub template: TemplateConfig,
	pub readiness: ReadinessConfig,
	pub remote: RemoteConfig,
	pub workload: WorkloadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
	pub name_prefix: String,
	pub workers: u32,
}

impl Default for ClusterConfig {
	fn default() -> Self {
		Self {
			name_prefix: "k3s".to_owned(),
			workers: 2,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityPolicy {
	#[default]
	Auto,
	Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdentityConfig {
	pub policy: IdentityPolicy,
	pub floor: VmId,
	pub control: Option<VmId>,
	pub workers: Vec<VmId>,
}

impl Default for IdentityConfig {
	fn default() -> Self {
		Self {
			policy: IdentityPolicy::Auto,
			floor: 100,
			control: None,
			workers: Vec::new(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VmConfig {
	pub cores: u32,
	pub memory_mb: u32,
	pub disk_grow_gb: u32,
	pub bridge: String,
	pub storage: String,
	pub ssh_public_key_path: PathBuf,
	pub ci_user: String,
}

impl Default for VmConfig {
	fn default() -> Self {
		Self {
			cores: 2,
			memory_mb: 4096,
			disk_grow_gb: 20,
			bridge: "vmbr0".to_owned(),
			storage: "local-lvm".to_owned(),
			ssh_public_key_path: home_path(".ssh/id_ed25519.pub"),
			ci_user: "ubuntu".to_owned(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TemplateConfig {
	pub id: VmId,
	pub name: String,
	pub image_url: String,
	pub storage: String,
	pub memory_mb: u32,
}

impl Default for TemplateConfig {
	fn default() -> Self {
		Self {
			id: 9000,
			name: "ubuntu-cloud-template".to_owned(),
			image_url: "https://cloud-images.ubuntu.com/jammy/current/jammy-server-cloudimg-amd64.img"
				.to_owned(),
			storage: "local-lvm".to_owned(),
			memory_mb: 2048,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadinessConfig {
	pub interval_secs: u64,
	pub attempts: u32,
}

impl Default for ReadinessConfig {
	fn default() -> Self {
		Self {
			interval_secs: 5,
			attempts: 30,
		}
	}
}

impl ReadinessConfig {
	pub fn interval(&self) -> Duration {
		Duration::from_secs(self.interval_secs)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
	/// Pin the first key each freshly provisioned address presents for the rest of the run.
	#[default]
	TrustOnFirstUse,
	KnownHosts,
	Insecure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteConfig {
	pub user: String,
	pub private_key_path: PathBuf,
	pub port: u16,
	pub connect_timeout_secs: u64,
	pub command_timeout_secs: u64,
	pub host_key_policy: HostKeyPolicy,
}

impl Default for RemoteConfig {
	fn default() -> Self {
		Self {
			user: "ubuntu".to_owned(),
			private_key_path: home_path(".ssh/id_ed25519"),
			port: 22,
			connect_timeout_secs: 10,
			command_timeout_secs: 600,
			host_key_policy: HostKeyPolicy::TrustOnFirstUse,
		}
	}
}

impl RemoteConfig {
	/// Deadline for one TCP connect plus SSH handshake, and for authentication.
	pub fn connect_timeout(&self) -> Duration {
		Duration::from_secs(self.connect_timeout_secs)
	}

	pub fn command_timeout(&self) -> Duration {
		Duration::from_secs(self.command_timeout_secs)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodePortMode {
	#[default]
	Fixed,
	Dynamic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkloadConfig {
	pub namespace: String,
	pub name: String,
	pub image: String,
	pub root_user: String,
	pub root_password: String,
	pub api_port: u16,
	pub console_port: u16,
	pub node_ports: NodePortMode,
	pub api_node_port: u16,
	pub console_node_port: u16,
}

impl Default for WorkloadConfig {
	fn default() -> Self {
		Self {
			namespace: "minio".to_owned(),
			name: "minio".to_owned(),
			image: "quay.io/minio/minio:latest".to_owned(),
			root_user: "minioadmin".to_owned(),
			root_password: "minioadmin".to_owned(),
			api_port: 9000,
			console_port: 9001,
			node_ports: NodePortMode::Fixed,
			api_node_port: 30900,
			console_node_port: 30901,
		}
	}
}

pub const NODE_PORT_RANGE: std::ops::RangeInclusive<u16> = 30000..=32767;

fn home_path(relative: &str) -> PathBuf {
	std::env::var_os("HOME")
		.map(PathBuf::from)
		.unwrap_or_else(|| PathBuf::from("/root"))
		.join(relative)
}

// RFC 1123 label, the shape Kubernetes requires for namespace and object names.
fn is_dns_label(name: &str) -> bool {
	!name.is_empty()
		&& name.len() <= 63
		&& name
			.bytes()
			.all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
		&& !name.starts_with('-')
		&& !name.ends_with('-')
}

impl Config {
	pub fn load(path: &Path) -> Result<Self, ProvisionError> {
		let content = std::fs::read_to_string(path)?;
		let config: Config = toml::from_str(&content)?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<(), ProvisionError> {
		let fail = |msg: String| Err(ProvisionError::Config(msg));
		if !is_dns_label(&self.cluster.name_prefix) {
			return fail(format!(
				"cluster.name_prefix '{}' is not a valid hostname label",
				self.cluster.name_prefix
			));
		}
		if self.vm.cores == 0 || self.vm.memory_mb == 0 {
			return fail("vm.cores and vm.memory_mb must be positive".to_owned());
		}
		if self.vm.bridge.is_empty() || self.vm.storage.is_empty() {
			return fail("vm.bridge and vm.storage must be set".to_owned());
		}
		if self.template.image_url.is_empty() {
			return fail("template.image_url must be set".to_owned());
		}
		if self.readiness.attempts == 0 {
			return fail("readiness.attempts must be at least 1".to_owned());
		}
		if self.remote.connect_timeout_secs == 0 {
			return fail("remote.connect_timeout_secs must be positive".to_owned());
		}
		if self.remote.command_timeout_secs == 0 {
			return fail("remote.command_timeout_secs must be positive".to_owned());
		}
		if self.identity.policy == IdentityPolicy::Fixed {
			let Some(control) = self.identity.control else {
				return fail("identity.control is required with the fixed policy".to_owned());
			};
			if self.identity.workers.len() != self.cluster.workers as usize {
				return fail(format!(
					"identity.workers lists {} ids but cluster.workers is {}",
					self.identity.workers.len(),
					self.cluster.workers
				));
			}
			let mut seen = BTreeSet::from([self.template.id]);
			for id in std::iter::once(control).chain(self.identity.workers.iter().copied()) {
				if !seen.insert(id) {
					return fail(format!(
						"VM id {id} is listed twice or overlaps the template id"
					));
				}
			}
		}
		let workload = &self.workload;
		if !is_dns_label(&workload.namespace) || !is_dns_label(&workload.name) {
			return fail("workload.namespace and workload.name must be DNS labels".to_owned());
		}
		if workload.root_user.is_empty() || workload.root_password.is_empty() {
			return fail("workload credentials must not be empty".to_owned());
		}
		if workload.api_port == workload.console_port {
			return fail("workload.api_port and workload.console_port must differ".to_owned());
		}
		if workload.node_ports == NodePortMode::Fixed {
			for port in [workload.api_node_port, workload.console_node_port] {
				if !NODE_PORT_RANGE.contains(&port) {
					return fail(format!("node port {port} is outside 30000-32767"));
				}
			}
			if workload.api_node_port == workload.console_node_port {
				return fail("workload node ports must differ".to_owned());
			}
		}
		Ok(())
	}
}
