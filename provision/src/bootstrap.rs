//! k3s bootstrap over the remote channel: one server node first, then agents
//! that join it with the token the server produced.

use crate::error::ProvisionError;
use crate::remote::{RemoteExecutor, run_checked};
use std::{fmt, net::IpAddr};
use tracing::info;

pub const INSTALL_URL: &str = "https://get.k3s.io";
pub const TOKEN_PATH: &str = "/var/lib/rancher/k3s/server/node-token";
pub const API_PORT: u16 = 6443;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapPhase {
	Unbootstrapped,
	ControlReady,
	ClusterReady,
}

impl fmt::Display for BootstrapPhase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			BootstrapPhase::Unbootstrapped => write!(f, "unbootstrapped"),
			BootstrapPhase::ControlReady => write!(f, "control ready"),
			BootstrapPhase::ClusterReady => write!(f, "cluster ready"),
		}
	}
}

/// Join secret read from the control node. Only `install_control` makes one,
/// so holding a token means the control node is up.
#[derive(Clone, PartialEq, Eq)]
pub struct ClusterToken(String);

impl ClusterToken {
	fn parse(raw: &str) -> Option<Self> {
		let token = raw.trim();
		let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-' | '.');
		(!token.is_empty() && token.chars().all(allowed)).then(|| Self(token.to_owned()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for ClusterToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("ClusterToken(<redacted>)")
	}
}

pub fn control_url(control_address: IpAddr) -> String {
	match control_address {
		IpAddr::V4(v4) => format!("https://{v4}:{API_PORT}"),
		IpAddr::V6(v6) => format!("https://[{v6}]:{API_PORT}"),
	}
}

fn server_install_command(address: IpAddr) -> String {
	format!(
		"curl -sfL {INSTALL_URL} | sh -s - server --write-kubeconfig-mode 644 --tls-san {address}"
	)
}

fn agent_install_command(control_address: IpAddr, token: &ClusterToken) -> String {
	format!(
		"curl -sfL {INSTALL_URL} | K3S_URL={} K3S_TOKEN={} sh -",
		control_url(control_address),
		token.as_str()
	)
}

/// Installs the k3s server on `address` and reads back its join token.
///
/// Both steps have to succeed; a server without a readable token cannot take
/// any agents.
pub async fn install_control(
	executor: &dyn RemoteExecutor,
	address: IpAddr,
) -> Result<ClusterToken, ProvisionError> {
	info!(%address, "Installing k3s server.");
	run_checked(executor, address, &server_install_command(address)).await?;
	info!(%address, "k3s server installed, reading join token.");
	let raw = run_checked(executor, address, &format!("sudo cat {TOKEN_PATH}")).await?;
	let token = ClusterToken::parse(&raw).ok_or_else(|| {
		ProvisionError::remote(address, format!("{TOKEN_PATH} is empty or malformed"))
	})?;
	info!(%address, "Control node ready.");
	Ok(token)
}

/// Installs the k3s agent on `address`, joining the server at `control_address`.
pub async fn install_worker(
	executor: &dyn RemoteExecutor,
	address: IpAddr,
	control_address: IpAddr,
	token: &ClusterToken,
) -> Result<(), ProvisionError> {
	info!(%address, control = %control_address, "Installing k3s agent.");
	run_checked(executor, address, &agent_install_command(control_address, token)).await?;
	info!(%address, "Worker joined.");
	Ok(())
}
