use super::{RemoteExecutor, RemoteOutput, first_word};
use crate::config::{HostKeyPolicy, ReadinessConfig, RemoteConfig};
use crate::error::ProvisionError;
use async_trait::async_trait;
use russh::{
	ChannelMsg, Disconnect,
	client::{Config, Handle, Handler, connect},
	keys::{
		PrivateKey, check_known_hosts,
		key::PrivateKeyWithHashAlg,
		load_secret_key,
		ssh_key::{HashAlg, PublicKey},
	},
};
use std::{collections::HashMap, net::IpAddr, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Host keys seen during this run, by address.
#[derive(Debug, Default)]
struct HostKeyPins {
	fingerprints: HashMap<IpAddr, String>,
}

impl HostKeyPins {
	/// Pins the first fingerprint for an address and rejects any other one afterwards.
	fn verify(&mut self, address: IpAddr, fingerprint: &str) -> bool {
		match self.fingerprints.get(&address) {
			Some(pinned) if pinned == fingerprint => true,
			Some(pinned) => {
				warn!(%address, %pinned, presented = %fingerprint, "Host key changed during run.");
				false
			}
			None => {
				info!(%address, %fingerprint, "Pinning host key of freshly provisioned node.");
				self.fingerprints.insert(address, fingerprint.to_owned());
				true
			}
		}
	}
}

struct SshClient {
	address: IpAddr,
	port: u16,
	policy: HostKeyPolicy,
	pins: Arc<Mutex<HostKeyPins>>,
}

impl Handler for SshClient {
	type Error = russh::Error;

	async fn check_server_key(
		&mut self,
		server_public_key: &PublicKey,
	) -> Result<bool, Self::Error> {
		let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
		match self.policy {
			HostKeyPolicy::Insecure => {
				warn!(address = %self.address, %fingerprint, "Accepting host key without verification.");
				Ok(true)
			}
			HostKeyPolicy::KnownHosts => {
				match check_known_hosts(&self.address.to_string(), self.port, server_public_key) {
					Ok(true) => Ok(true),
					Ok(false) => {
						warn!(address = %self.address, %fingerprint, "Host key not in known_hosts.");
						Ok(false)
					}
					Err(err) => {
						warn!(address = %self.address, "Host key verification failed: {err}");
						Ok(false)
					}
				}
			}
			HostKeyPolicy::TrustOnFirstUse => {
				Ok(self.pins.lock().await.verify(self.address, &fingerprint))
			}
		}
	}
}

/// SSH backend. One session per command; each command runs under a deadline.
pub struct SshExecutor {
	user: String,
	port: u16,
	key: Arc<PrivateKey>,
	policy: HostKeyPolicy,
	pins: Arc<Mutex<HostKeyPins>>,
	connect_timeout: Duration,
	command_timeout: Duration,
	connect_attempts: u32,
	connect_interval: Duration,
}

impl SshExecutor {
	pub fn new(remote: &RemoteConfig, readiness: &ReadinessConfig) -> Result<Self, ProvisionError> {
		let key = load_secret_key(&remote.private_key_path, None).map_err(|err| {
			ProvisionError::PreconditionMissing(format!(
				"SSH private key {} is unusable: {err}",
				remote.private_key_path.display()
			))
		})?;
		if remote.host_key_policy == HostKeyPolicy::Insecure {
			warn!("Host key verification is disabled.");
		}
		Ok(Self {
			user: remote.user.clone(),
			port: remote.port,
			key: Arc::new(key),
			policy: remote.host_key_policy,
			pins: Arc::new(Mutex::new(HostKeyPins::default())),
			connect_timeout: remote.connect_timeout(),
			command_timeout: remote.command_timeout(),
			connect_attempts: readiness.attempts.max(1),
			connect_interval: readiness.interval(),
		})
	}

	fn client(&self, address: IpAddr) -> SshClient {
		SshClient {
			address,
			port: self.port,
			policy: self.policy,
			pins: self.pins.clone(),
		}
	}

	// sshd may come up a little after the guest agent reports an address.
	// Each attempt covers the TCP connect and the SSH handshake.
	async fn connect(&self, address: IpAddr) -> Result<Handle<SshClient>, ProvisionError> {
		let config = Arc::new(Config {
			inactivity_timeout: Some(self.command_timeout),
			keepalive_interval: Some(Duration::from_secs(15)),
			..<_>::default()
		});
		let mut attempt = 1;
		loop {
			let pending = connect(config.clone(), (address, self.port), self.client(address));
			let reason = match tokio::time::timeout(self.connect_timeout, pending).await {
				Ok(Ok(session)) => return Ok(session),
				Ok(Err(russh::Error::UnknownKey)) => {
					return Err(ProvisionError::remote(address, "host key rejected"));
				}
				Ok(Err(err)) => err.to_string(),
				Err(_) => format!(
					"no SSH handshake within {}s",
					self.connect_timeout.as_secs()
				),
			};
			if attempt >= self.connect_attempts {
				return Err(ProvisionError::remote(
					address,
					format!("SSH connection failed after {attempt} attempts: {reason}"),
				));
			}
			debug!(%address, attempt, "SSH not reachable yet: {reason}");
			tokio::time::sleep(self.connect_interval).await;
			attempt += 1;
		}
	}

	async fn session(&self, address: IpAddr) -> Result<Handle<SshClient>, ProvisionError> {
		let ssh_err = |err: russh::Error| ProvisionError::remote(address, format!("ssh: {err}"));
		let mut session = self.connect(address).await?;
		let authenticate = async {
			let hash = session.best_supported_rsa_hash().await?.flatten();
			session
				.authenticate_publickey(
					&self.user,
					PrivateKeyWithHashAlg::new(self.key.clone(), hash),
				)
				.await
		};
		let auth_res = tokio::time::timeout(self.connect_timeout, authenticate)
			.await
			.map_err(|_| {
				ProvisionError::remote(
					address,
					format!(
						"authentication did not finish within {}s",
						self.connect_timeout.as_secs()
					),
				)
			})?
			.map_err(ssh_err)?;
		if !auth_res.success() {
			return Err(ProvisionError::remote(
				address,
				format!("public key authentication as {} failed", self.user),
			));
		}
		Ok(session)
	}

	async fn execute(
		&self,
		session: &Handle<SshClient>,
		address: IpAddr,
		command: &str,
		stdin: Option<&str>,
	) -> Result<RemoteOutput, ProvisionError> {
		let ssh_err = |err: russh::Error| ProvisionError::remote(address, format!("ssh: {err}"));
		let mut channel = session.channel_open_session().await.map_err(ssh_err)?;
		channel.exec(true, command).await.map_err(ssh_err)?;
		if let Some(input) = stdin {
			channel.data(input.as_bytes()).await.map_err(ssh_err)?;
			channel.eof().await.map_err(ssh_err)?;
		}
		let mut code = None;
		let mut stdout = Vec::new();
		let mut stderr = Vec::new();
		loop {
			let Some(msg) = channel.wait().await else {
				break;
			};
			match msg {
				ChannelMsg::Data { ref data } => {
					stdout.extend_from_slice(data);
				}
				ChannelMsg::ExtendedData { ref data, ext: 1 } => {
					stderr.extend_from_slice(data);
				}
				ChannelMsg::ExitStatus { exit_status } => {
					code = Some(exit_status);
				}
				_ => {}
			}
		}
		let exit_status = code.ok_or_else(|| {
			ProvisionError::remote(
				address,
				format!("'{}' did not report an exit status", first_word(command)),
			)
		})?;
		Ok(RemoteOutput {
			stdout: String::from_utf8_lossy(&stdout).into_owned(),
			stderr: String::from_utf8_lossy(&stderr).into_owned(),
			exit_status,
		})
	}

	async fn run_inner(
		&self,
		address: IpAddr,
		command: &str,
		stdin: Option<&str>,
	) -> Result<RemoteOutput, ProvisionError> {
		let session = self.session(address).await?;
		debug!(%address, program = first_word(command), "Running remote command.");
		let result = tokio::time::timeout(
			self.command_timeout,
			self.execute(&session, address, command, stdin),
		)
		.await
		.unwrap_or_else(|_| {
			Err(ProvisionError::remote(
				address,
				format!(
					"'{}' timed out after {}s",
					first_word(command),
					self.command_timeout.as_secs()
				),
			))
		});
		if let Err(err) = session
			.disconnect(Disconnect::ByApplication, "Disconnected", "English")
			.await
		{
			debug!(%address, "SSH disconnect failed: {err}");
		}
		result
	}
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
	async fn run(&self, address: IpAddr, command: &str) -> Result<RemoteOutput, ProvisionError> {
		self.run_inner(address, command, None).await
	}

	async fn run_with_stdin(
		&self,
		address: IpAddr,
		command: &str,
		stdin: &str,
	) -> Result<RemoteOutput, ProvisionError> {
		self.run_inner(address, command, Some(stdin)).await
	}
}
