use std::{io, net::IpAddr, process::ExitStatus};

use crate::hypervisor::VmId;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
	#[error("I/O error: {0}.")]
	Io(#[from] io::Error),

	#[error("Failed to execute command '{cmd}': {source}")]
	CommandLaunch {
		cmd: String,
		#[source]
		source: io::Error,
	},

	#[error("Command failed: {cmd} ({status}){}", stderr_suffix(.stderr))]
	CommandFailed {
		cmd: String,
		status: ExitStatus,
		stderr: Option<String>,
	},

	#[error("Precondition missing: {0}.")]
	PreconditionMissing(String),

	#[error("Invalid configuration: {0}.")]
	Config(String),

	#[error("Failed to parse config: {0}")]
	ConfigParse(#[from] toml::de::Error),

	#[error("VM identity {0} is already in use on the host.")]
	IdentityCollision(VmId),

	#[error("No free block of {count} VM identities at or above {floor}.")]
	IdentitySpaceExhausted { floor: VmId, count: usize },

	#[error("Template {id} creation failed: {reason}")]
	TemplateCreationFailed { id: VmId, reason: String },

	#[error("Clone of VM {id} ({name}) failed: {reason}")]
	CloneFailed {
		id: VmId,
		name: String,
		reason: String,
	},

	#[error("Configuring VM {id} failed at step '{step}': {reason}")]
	ConfigurationFailed {
		id: VmId,
		step: &'static str,
		reason: String,
	},

	#[error("VM {id} ({name}) reported no private address after {attempts} attempts.")]
	ReadinessTimeout {
		id: VmId,
		name: String,
		attempts: u32,
	},

	#[error("Remote command on {address} failed: {reason}")]
	RemoteCommandFailed { address: IpAddr, reason: String },

	#[error("Manifest apply failed: {0}")]
	ManifestApplyFailed(String),

	#[error("Image download failed: {0}")]
	Download(String),

	#[error("Guest agent error: {0}")]
	GuestAgent(String),

	#[error("Serialization error: {0}")]
	Serialization(String),
}

impl ProvisionError {
	pub fn remote(address: IpAddr, reason: impl Into<String>) -> Self {
		ProvisionError::RemoteCommandFailed {
			address,
			reason: reason.into(),
		}
	}
}

fn stderr_suffix(stderr: &Option<String>) -> String {
	match stderr {
		Some(text) if !text.is_empty() => format!(": {text}"),
		_ => String::new(),
	}
}

impl From<reqwest::Error> for ProvisionError {
	fn from(err: reqwest::Error) -> Self {
		ProvisionError::Download(err.to_string())
	}
}

impl From<serde_yaml::Error> for ProvisionError {
	fn from(err: serde_yaml::Error) -> Self {
		ProvisionError::Serialization(err.to_string())
	}
}

impl From<serde_json::Error> for ProvisionError {
	fn from(err: serde_json::Error) -> Self {
		ProvisionError::Serialization(err.to_string())
	}
}
