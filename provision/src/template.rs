use crate::config::TemplateConfig;
use crate::error::ProvisionError;
use crate::hypervisor::{Hypervisor, VmId, VmOptions};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::path::Path;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// "A clonable base image exists at this identity."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateRef {
	pub id: VmId,
	pub present: bool,
}

impl TemplateRef {
	pub fn unchecked(id: VmId) -> Self {
		Self { id, present: false }
	}
}

/// A fetched base image on local disk. The file is removed when this is dropped.
#[derive(Debug)]
pub struct DownloadedImage {
	file: NamedTempFile,
}

impl DownloadedImage {
	pub fn new(file: NamedTempFile) -> Self {
		Self { file }
	}

	pub fn path(&self) -> &Path {
		self.file.path()
	}
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImageFetcher: Send + Sync {
	async fn fetch(&self, url: &str) -> Result<DownloadedImage, ProvisionError>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpImageFetcher {
	client: reqwest::Client,
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
	async fn fetch(&self, url: &str) -> Result<DownloadedImage, ProvisionError> {
		info!(url, "Downloading base image.");
		let file = tempfile::Builder::new()
			.prefix("cluster-template-")
			.suffix(".img")
			.tempfile()?;
		let image = DownloadedImage::new(file);
		let mut response = self.client.get(url).send().await?.error_for_status()?;
		let mut writer = tokio::fs::File::from_std(image.file.reopen()?);
		let mut total: u64 = 0;
		while let Some(chunk) = response.chunk().await? {
			writer.write_all(&chunk).await?;
			total += chunk.len() as u64;
		}
		writer.flush().await?;
		info!(bytes = total, path = %image.path().display(), "Base image downloaded.");
		Ok(image)
	}
}

/// Makes sure a cloud-init enabled template exists at `template.id`.
///
/// Idempotent: if the identity is already registered on the host nothing is
/// fetched or created. Any failure while creating it is fatal for the run; a
/// half-built template is not repaired.
pub async fn ensure_template(
	hypervisor: &dyn Hypervisor,
	fetcher: &dyn ImageFetcher,
	template: TemplateRef,
	config: &TemplateConfig,
	bridge: &str,
) -> Result<TemplateRef, ProvisionError> {
	let id = template.id;
	let failed = |err: ProvisionError| ProvisionError::TemplateCreationFailed {
		id,
		reason: err.to_string(),
	};
	let inventory = hypervisor.inventory().await.map_err(failed)?;
	if inventory.contains(&id) {
		info!(id, "Template is already present.");
		return Ok(TemplateRef { id, present: true });
	}
	info!(id, name = %config.name, "Template is not present, creating it.");
	let image = fetcher.fetch(&config.image_url).await.map_err(failed)?;
	build_template(hypervisor, id, config, bridge, image.path())
		.await
		.map_err(failed)?;
	drop(image);
	info!(id, "Template created.");
	Ok(TemplateRef { id, present: true })
}

async fn build_template(
	hypervisor: &dyn Hypervisor,
	id: VmId,
	config: &TemplateConfig,
	bridge: &str,
	image: &Path,
) -> Result<(), ProvisionError> {
	let shell = VmOptions::new()
		.opt("name", &config.name)
		.opt("memory", config.memory_mb)
		.opt("net0", format!("virtio,bridge={bridge}"))
		.opt("agent", "enabled=1")
		.opt("serial0", "socket")
		.opt("vga", "serial0");
	hypervisor.create(id, &shell).await?;
	let volume = hypervisor.import_disk(id, image, &config.storage).await?;
	info!(id, %volume, "Base image imported.");
	let disks = VmOptions::new()
		.opt("scsihw", "virtio-scsi-pci")
		.opt("scsi0", volume)
		.opt("ide2", format!("{}:cloudinit", config.storage))
		.opt("boot", "order=scsi0");
	hypervisor.set(id, &disks).await?;
	hypervisor.template(id).await?;
	Ok(())
}
