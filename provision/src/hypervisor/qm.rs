use super::{GuestInterface, Hypervisor, VmId, VmOptions, VmStatus};
use crate::error::ProvisionError;
use async_trait::async_trait;
use serde::Deserialize;
use std::{collections::BTreeSet, io::Write, path::Path, process::Output};
use tokio::process::Command;
use tracing::debug;

/// Proxmox VE `qm` CLI backend, run on the hypervisor host itself.
#[derive(Debug, Clone)]
pub struct QmCli {
	program: String,
}

impl Default for QmCli {
	fn default() -> Self {
		Self {
			program: QmCli::PROGRAM.to_owned(),
		}
	}
}

impl QmCli {
	pub const PROGRAM: &str = "qm";

	async fn qm_output(&self, args: &[&str]) -> Result<Output, ProvisionError> {
		let full_cmd = format!("{} {}", self.program, args.join(" "));
		debug!(cmd = %full_cmd, "Running hypervisor command.");
		let output = Command::new(&self.program)
			.args(args)
			.output()
			.await
			.map_err(|err| ProvisionError::CommandLaunch {
				cmd: full_cmd.clone(),
				source: err,
			})?;
		if !output.status.success() {
			let stderr = if output.stderr.is_empty() {
				None
			} else {
				Some(String::from_utf8_lossy(&output.stderr).trim().to_owned())
			};
			return Err(ProvisionError::CommandFailed {
				cmd: full_cmd,
				status: output.status,
				stderr,
			});
		}
		Ok(output)
	}

	async fn qm_status(&self, args: &[&str]) -> Result<(), ProvisionError> {
		self.qm_output(args).await?;
		Ok(())
	}

	async fn apply_options(
		&self,
		verb: &str,
		id: VmId,
		options: &VmOptions,
	) -> Result<(), ProvisionError> {
		// `--sshkeys` takes a file, so key material is staged in a temp file for the call.
		let mut key_file = None;
		let id = id.to_string();
		let mut args = vec![verb.to_owned(), id];
		for (key, value) in options.iter() {
			args.push(format!("--{key}"));
			if key == "sshkeys" {
				let mut file = tempfile::NamedTempFile::new()?;
				file.write_all(value.as_bytes())?;
				file.flush()?;
				args.push(file.path().display().to_string());
				key_file = Some(file);
			} else {
				args.push(value.to_owned());
			}
		}
		let arg_refs = args.iter().map(String::as_str).collect::<Vec<_>>();
		let result = self.qm_status(&arg_refs).await;
		drop(key_file);
		result
	}
}

#[async_trait]
impl Hypervisor for QmCli {
	async fn inventory(&self) -> Result<BTreeSet<VmId>, ProvisionError> {
		let output = self.qm_output(&["list"]).await?;
		Ok(parse_list(&String::from_utf8_lossy(&output.stdout)))
	}

	async fn status(&self, id: VmId) -> Result<VmStatus, ProvisionError> {
		let output = self.qm_output(&["status", &id.to_string()]).await?;
		Ok(parse_status(&String::from_utf8_lossy(&output.stdout)))
	}

	async fn clone_vm(
		&self,
		template: VmId,
		id: VmId,
		name: &str,
		storage: &str,
	) -> Result<(), ProvisionError> {
		self.qm_status(&[
			"clone",
			&template.to_string(),
			&id.to_string(),
			"--name",
			name,
			"--full",
			"--storage",
			storage,
		])
		.await
	}

	async fn set(&self, id: VmId, options: &VmOptions) -> Result<(), ProvisionError> {
		self.apply_options("set", id, options).await
	}

	async fn resize(&self, id: VmId, disk: &str, delta_gb: u32) -> Result<(), ProvisionError> {
		self.qm_status(&["resize", &id.to_string(), disk, &format!("+{delta_gb}G")])
			.await
	}

	async fn start(&self, id: VmId) -> Result<(), ProvisionError> {
		self.qm_status(&["start", &id.to_string()]).await
	}

	async fn stop(&self, id: VmId) -> Result<(), ProvisionError> {
		self.qm_status(&["stop", &id.to_string()]).await
	}

	async fn create(&self, id: VmId, options: &VmOptions) -> Result<(), ProvisionError> {
		self.apply_options("create", id, options).await
	}

	async fn import_disk(
		&self,
		id: VmId,
		image: &Path,
		storage: &str,
	) -> Result<String, ProvisionError> {
		let image = image.display().to_string();
		let id = id.to_string();
		let output = self.qm_output(&["importdisk", &id, &image, storage]).await?;
		if let Some(volume) = parse_imported_volume(&String::from_utf8_lossy(&output.stdout)) {
			return Ok(volume);
		}
		// Older releases only print progress, so fall back to the VM config.
		let config = self.qm_output(&["config", &id]).await?;
		parse_unused_volume(&String::from_utf8_lossy(&config.stdout)).ok_or_else(|| {
			ProvisionError::Config(format!("no imported disk found on VM {id} after importdisk"))
		})
	}

	async fn template(&self, id: VmId) -> Result<(), ProvisionError> {
		self.qm_status(&["template", &id.to_string()]).await
	}

	async fn guest_network_interfaces(
		&self,
		id: VmId,
	) -> Result<Vec<GuestInterface>, ProvisionError> {
		let output = self
			.qm_output(&["guest", "cmd", &id.to_string(), "network-get-interfaces"])
			.await
			.map_err(|err| ProvisionError::GuestAgent(err.to_string()))?;
		parse_interfaces(&String::from_utf8_lossy(&output.stdout))
	}
}

fn parse_list(stdout: &str) -> BTreeSet<VmId> {
	stdout
		.lines()
		.filter_map(|line| line.split_whitespace().next())
		.filter_map(|vmid| vmid.parse::<VmId>().ok())
		.collect()
}

fn parse_status(stdout: &str) -> VmStatus {
	match stdout.trim().strip_prefix("status:").map(str::trim) {
		Some("running") => VmStatus::Running,
		Some("stopped") => VmStatus::Stopped,
		_ => VmStatus::Unknown,
	}
}

/// Reads `Successfully imported disk as 'unused0:<volid>'`.
fn parse_imported_volume(stdout: &str) -> Option<String> {
	let line = stdout.lines().find(|line| line.contains("imported disk as"))?;
	let quoted = line.split('\'').nth(1)?;
	let (slot, volume) = quoted.split_once(':')?;
	slot.starts_with("unused")
		.then(|| volume.trim().to_owned())
		.filter(|volume| !volume.is_empty())
}

/// Reads the first `unusedN: <volid>` entry of `qm config`.
fn parse_unused_volume(stdout: &str) -> Option<String> {
	stdout
		.lines()
		.filter_map(|line| line.split_once(':'))
		.find(|(key, _)| key.starts_with("unused"))
		.map(|(_, volume)| volume.trim().to_owned())
		.filter(|volume| !volume.is_empty())
}

#[derive(Debug, Deserialize)]
struct RawInterface {
	name: String,
	#[serde(rename = "ip-addresses", default)]
	ip_addresses: Vec<RawAddress>,
}

#[derive(Debug, Deserialize)]
struct RawAddress {
	#[serde(rename = "ip-address")]
	ip_address: String,
}

fn parse_interfaces(stdout: &str) -> Result<Vec<GuestInterface>, ProvisionError> {
	let raw: Vec<RawInterface> = serde_json::from_str(stdout)
		.map_err(|err| ProvisionError::GuestAgent(format!("unreadable interface report: {err}")))?;
	Ok(raw
		.into_iter()
		.map(|iface| GuestInterface {
			name: iface.name,
			addresses: iface
				.ip_addresses
				.into_iter()
				.map(|addr| addr.ip_address)
				.collect(),
		})
		.collect())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_list_reads_vmid_column() {
		let stdout = "      VMID NAME                 STATUS     MEM(MB)    BOOTDISK(GB) PID\n\
		              100 k3s-control          running    4096              52.20 1201\n\
		              101 k3s-worker-1         stopped    4096              52.20 0\n\
		             9000 ubuntu-cloud-template stopped   2048               2.20 0\n";
		assert_eq!(parse_list(stdout), BTreeSet::from([100, 101, 9000]));
	}

	#[test]
	fn parse_list_of_empty_host() {
		assert!(parse_list("").is_empty());
	}

	#[test]
	fn parse_status_variants() {
		assert_eq!(parse_status("status: running\n"), VmStatus::Running);
		assert_eq!(parse_status("status: stopped"), VmStatus::Stopped);
		assert_eq!(parse_status("status: paused"), VmStatus::Unknown);
	}

	#[test]
	fn imported_volume_on_block_storage() {
		let stdout = "importing disk '/tmp/cluster-template-x.img' to VM 9000 ...\n\
		              transferred 2.2 GiB of 2.2 GiB (100.00%)\n\
		              Successfully imported disk as 'unused0:local-lvm:vm-9000-disk-0'\n";
		assert_eq!(
			parse_imported_volume(stdout).as_deref(),
			Some("local-lvm:vm-9000-disk-0")
		);
	}

	#[test]
	fn imported_volume_on_directory_storage() {
		let stdout = "Successfully imported disk as 'unused0:local:9000/vm-9000-disk-0.raw'\n";
		assert_eq!(
			parse_imported_volume(stdout).as_deref(),
			Some("local:9000/vm-9000-disk-0.raw")
		);
	}

	#[test]
	fn imported_volume_missing_from_progress_output() {
		assert_eq!(parse_imported_volume("transferred 2.2 GiB of 2.2 GiB\n"), None);
	}

	#[test]
	fn unused_volume_from_vm_config() {
		let stdout = "agent: enabled=1\n\
		              memory: 2048\n\
		              name: ubuntu-cloud-template\n\
		              unused0: local:9000/vm-9000-disk-0.qcow2\n";
		assert_eq!(
			parse_unused_volume(stdout).as_deref(),
			Some("local:9000/vm-9000-disk-0.qcow2")
		);
		assert_eq!(parse_unused_volume("memory: 2048\n"), None);
	}

	#[test]
	fn parse_interfaces_keeps_report_order() {
		let stdout = r#"[
			{"name":"lo","hardware-address":"00:00:00:00:00:00",
			 "ip-addresses":[{"ip-address":"127.0.0.1","ip-address-type":"ipv4","prefix":8},
			                 {"ip-address":"::1","ip-address-type":"ipv6","prefix":128}]},
			{"name":"eth0","hardware-address":"bc:24:11:aa:bb:cc",
			 "ip-addresses":[{"ip-address":"192.168.1.50","ip-address-type":"ipv4","prefix":24}]},
			{"name":"cni0"}
		]"#;
		let interfaces = parse_interfaces(stdout).unwrap();
		assert_eq!(interfaces.len(), 3);
		assert_eq!(interfaces[0].addresses, vec!["127.0.0.1", "::1"]);
		assert_eq!(interfaces[1].name, "eth0");
		assert_eq!(interfaces[1].addresses, vec!["192.168.1.50"]);
		assert!(interfaces[2].addresses.is_empty());
	}

	#[test]
	fn parse_interfaces_rejects_garbage() {
		assert!(matches!(
			parse_interfaces("QEMU guest agent is not running"),
			Err(ProvisionError::GuestAgent(_))
		));
	}
}
