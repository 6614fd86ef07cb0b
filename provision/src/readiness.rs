use crate::config::ReadinessConfig;
use crate::error::ProvisionError;
use crate::hypervisor::{GuestInterface, Hypervisor};
use crate::provisioner::VmHandle;
use std::{
	net::{IpAddr, Ipv4Addr},
	time::Duration,
};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
	pub interval: Duration,
	pub attempts: u32,
}

impl Default for PollPolicy {
	fn default() -> Self {
		Self {
			interval: Duration::from_secs(5),
			attempts: 30,
		}
	}
}

impl From<&ReadinessConfig> for PollPolicy {
	fn from(config: &ReadinessConfig) -> Self {
		Self {
			interval: config.interval(),
			attempts: config.attempts,
		}
	}
}

fn is_routable_private(address: Ipv4Addr) -> bool {
	address.is_private() && !address.is_loopback() && !address.is_link_local()
}

/// First RFC 1918 IPv4 address in report order, interfaces first then their
/// addresses. Loopback, link-local, public and IPv6 addresses never qualify.
pub fn select_private_address(interfaces: &[GuestInterface]) -> Option<IpAddr> {
	interfaces
		.iter()
		.flat_map(|iface| iface.addresses.iter())
		.filter_map(|raw| raw.parse::<Ipv4Addr>().ok())
		.find(|address| is_routable_private(*address))
		.map(IpAddr::V4)
}

/// Polls the guest agent until the VM reports a private address.
///
/// Errors from the agent (not yet running, VM still booting) count as an
/// empty report. After `policy.attempts` polls without a match the node is
/// given up on with `ReadinessTimeout`.
pub async fn await_address(
	hypervisor: &dyn Hypervisor,
	handle: VmHandle,
	policy: PollPolicy,
) -> Result<VmHandle, ProvisionError> {
	info!(id = handle.id, name = %handle.name, "Waiting for guest network.");
	for attempt in 1..=policy.attempts {
		match hypervisor.guest_network_interfaces(handle.id).await {
			Ok(interfaces) => {
				if let Some(address) = select_private_address(&interfaces) {
					info!(id = handle.id, name = %handle.name, %address, "VM is reachable.");
					return Ok(handle.with_address(address));
				}
				let names = interfaces.iter().map(|i| i.name.as_str()).collect::<Vec<_>>();
				debug!(
					id = handle.id,
					attempt,
					interfaces = ?names,
					"No private address reported yet."
				);
			}
			Err(err) => debug!(id = handle.id, attempt, "Guest agent not ready: {err}"),
		}
		if attempt < policy.attempts {
			tokio::time::sleep(policy.interval).await;
		}
	}
	Err(ProvisionError::ReadinessTimeout {
		id: handle.id,
		name: handle.name,
		attempts: policy.attempts,
	})
}
