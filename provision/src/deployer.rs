use crate::config::{NodePortMode, WorkloadConfig};
use crate::error::ProvisionError;
use crate::manifest::{self, API_PORT_NAME, CONSOLE_PORT_NAME, WorkloadManifest};
use crate::remote::RemoteExecutor;
use k8s_openapi::api::core::v1::Service;
use std::{fmt, net::IpAddr};
use tracing::info;

pub const APPLY_COMMAND: &str = "sudo k3s kubectl apply -f -";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
	pub user: String,
	pub password: String,
}

impl fmt::Debug for Credentials {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Credentials")
			.field("user", &self.user)
			.field("password", &"<redacted>")
			.finish()
	}
}

/// Where the deployed workload can be reached. Produced once, at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEndpoint {
	pub control_address: IpAddr,
	pub api_port: u16,
	pub console_port: u16,
	pub credentials: Credentials,
}

impl ClusterEndpoint {
	pub fn api_url(&self) -> String {
		format!("http://{}", socket(self.control_address, self.api_port))
	}

	pub fn console_url(&self) -> String {
		format!("http://{}", socket(self.control_address, self.console_port))
	}
}

fn socket(address: IpAddr, port: u16) -> String {
	match address {
		IpAddr::V4(v4) => format!("{v4}:{port}"),
		IpAddr::V6(v6) => format!("[{v6}]:{port}"),
	}
}

impl fmt::Display for ClusterEndpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		writeln!(f, "Control node: {}", self.control_address)?;
		writeln!(f, "Console:      {}", self.console_url())?;
		writeln!(f, "API:          {}", self.api_url())?;
		writeln!(f, "User:         {}", self.credentials.user)?;
		write!(f, "Password:     {}", self.credentials.password)
	}
}

fn service_query(config: &WorkloadConfig) -> String {
	format!(
		"sudo k3s kubectl get service {} --namespace {} --output json",
		config.name, config.namespace
	)
}

/// Applies the workload through the control node and reports its endpoint.
///
/// The manifest is serialized once and sent on stdin, never interpolated into
/// the remote command line.
pub async fn deploy(
	executor: &dyn RemoteExecutor,
	control_address: IpAddr,
	manifest: &WorkloadManifest,
	config: &WorkloadConfig,
) -> Result<ClusterEndpoint, ProvisionError> {
	let yaml = manifest.to_yaml()?;
	info!(control = %control_address, namespace = %config.namespace, "Applying workload manifest.");
	let output = executor
		.run_with_stdin(control_address, APPLY_COMMAND, &yaml)
		.await
		.map_err(|err| ProvisionError::ManifestApplyFailed(err.to_string()))?;
	if !output.success() {
		return Err(ProvisionError::ManifestApplyFailed(format!(
			"kubectl apply exited with {}: {}",
			output.exit_status,
			output.stderr.trim()
		)));
	}
	for line in output.stdout.lines() {
		info!("{line}");
	}
	let (api_port, console_port) = match config.node_ports {
		NodePortMode::Fixed => (config.api_node_port, config.console_node_port),
		NodePortMode::Dynamic => assigned_node_ports(executor, control_address, config).await?,
	};
	Ok(ClusterEndpoint {
		control_address,
		api_port,
		console_port,
		credentials: Credentials {
			user: config.root_user.clone(),
			password: config.root_password.clone(),
		},
	})
}

async fn assigned_node_ports(
	executor: &dyn RemoteExecutor,
	control_address: IpAddr,
	config: &WorkloadConfig,
) -> Result<(u16, u16), ProvisionError> {
	let failed = |reason: String| ProvisionError::ManifestApplyFailed(reason);
	let output = executor
		.run(control_address, &service_query(config))
		.await
		.map_err(|err| failed(err.to_string()))?;
	if !output.success() {
		return Err(failed(format!(
			"service lookup exited with {}: {}",
			output.exit_status,
			output.stderr.trim()
		)));
	}
	let service: Service = serde_json::from_str(&output.stdout)?;
	let port = |name: &str| {
		manifest::node_port(&service, name)
			.ok_or_else(|| failed(format!("service port '{name}' has no node port")))
	};
	Ok((port(API_PORT_NAME)?, port(CONSOLE_PORT_NAME)?))
}
