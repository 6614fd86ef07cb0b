mod ssh;

pub use ssh::SshExecutor;

use crate::error::ProvisionError;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::net::IpAddr;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutput {
	pub stdout: String,
	pub stderr: String,
	pub exit_status: u32,
}

impl RemoteOutput {
	pub fn success(&self) -> bool {
		self.exit_status == 0
	}
}

/// Runs commands on a provisioned node. Credentials belong to the implementation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
	async fn run(&self, address: IpAddr, command: &str) -> Result<RemoteOutput, ProvisionError>;

	async fn run_with_stdin(
		&self,
		address: IpAddr,
		command: &str,
		stdin: &str,
	) -> Result<RemoteOutput, ProvisionError>;
}

/// Runs `command` and turns a non-zero exit into `RemoteCommandFailed`.
pub async fn run_checked(
	executor: &dyn RemoteExecutor,
	address: IpAddr,
	command: &str,
) -> Result<String, ProvisionError> {
	let output = executor.run(address, command).await?;
	if !output.success() {
		return Err(ProvisionError::remote(
			address,
			format!(
				"'{}' exited with {}: {}",
				first_word(command),
				output.exit_status,
				output.stderr.trim()
			),
		));
	}
	Ok(output.stdout)
}

// Keeps secrets passed as arguments out of error messages.
pub(crate) fn first_word(command: &str) -> &str {
	command.split_whitespace().next().unwrap_or_default()
}
