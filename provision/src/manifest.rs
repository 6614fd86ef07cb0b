use crate::config::{NodePortMode, WorkloadConfig};
use crate::error::ProvisionError;
use k8s_openapi::{
	api::{
		apps::v1::{Deployment, DeploymentSpec},
		core::v1::{
			Container, ContainerPort, EmptyDirVolumeSource, EnvVar, Namespace, PodSpec,
			PodTemplateSpec, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
		},
	},
	apimachinery::pkg::{
		apis::meta::v1::{LabelSelector, ObjectMeta},
		util::intstr::IntOrString,
	},
};
use std::collections::BTreeMap;

pub const API_PORT_NAME: &str = "api";
pub const CONSOLE_PORT_NAME: &str = "console";
pub const DATA_VOLUME: &str = "data";
pub const DATA_PATH: &str = "/data";

/// Object-storage workload: one namespace, one single-replica deployment and a
/// NodePort service exposing the API and console ports.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadManifest {
	pub namespace: Namespace,
	pub deployment: Deployment,
	pub service: Service,
}

impl WorkloadManifest {
	pub fn build(config: &WorkloadConfig) -> Self {
		let labels = BTreeMap::from([("app".to_owned(), config.name.clone())]);
		let meta = ObjectMeta {
			name: Some(config.name.clone()),
			namespace: Some(config.namespace.clone()),
			labels: Some(labels.clone()),
			..ObjectMeta::default()
		};
		let namespace = Namespace {
			metadata: ObjectMeta {
				name: Some(config.namespace.clone()),
				..ObjectMeta::default()
			},
			..Namespace::default()
		};
		let container = Container {
			name: config.name.clone(),
			image: Some(config.image.clone()),
			args: Some(vec![
				"server".to_owned(),
				DATA_PATH.to_owned(),
				"--console-address".to_owned(),
				format!(":{}", config.console_port),
			]),
			env: Some(vec![
				EnvVar {
					name: "MINIO_ROOT_USER".to_owned(),
					value: Some(config.root_user.clone()),
					..EnvVar::default()
				},
				EnvVar {
					name: "MINIO_ROOT_PASSWORD".to_owned(),
					value: Some(config.root_password.clone()),
					..EnvVar::default()
				},
			]),
			ports: Some(vec![
				ContainerPort {
					name: Some(API_PORT_NAME.to_owned()),
					container_port: i32::from(config.api_port),
					..ContainerPort::default()
				},
				ContainerPort {
					name: Some(CONSOLE_PORT_NAME.to_owned()),
					container_port: i32::from(config.console_port),
					..ContainerPort::default()
				},
			]),
			volume_mounts: Some(vec![VolumeMount {
				name: DATA_VOLUME.to_owned(),
				mount_path: DATA_PATH.to_owned(),
				..VolumeMount::default()
			}]),
			..Container::default()
		};
		let deployment = Deployment {
			metadata: meta.clone(),
			spec: Some(DeploymentSpec {
				replicas: Some(1),
				selector: LabelSelector {
					match_labels: Some(labels.clone()),
					..LabelSelector::default()
				},
				template: PodTemplateSpec {
					metadata: Some(ObjectMeta {
						labels: Some(labels.clone()),
						..ObjectMeta::default()
					}),
					spec: Some(PodSpec {
						containers: vec![container],
						volumes: Some(vec![Volume {
							name: DATA_VOLUME.to_owned(),
							empty_dir: Some(EmptyDirVolumeSource::default()),
							..Volume::default()
						}]),
						..PodSpec::default()
					}),
				},
				..DeploymentSpec::default()
			}),
			..Deployment::default()
		};
		let exposed = |port: u16| match config.node_ports {
			NodePortMode::Fixed => Some(i32::from(port)),
			NodePortMode::Dynamic => None,
		};
		let service = Service {
			metadata: meta,
			spec: Some(ServiceSpec {
				type_: Some("NodePort".to_owned()),
				selector: Some(labels),
				ports: Some(vec![
					ServicePort {
						name: Some(API_PORT_NAME.to_owned()),
						port: i32::from(config.api_port),
						target_port: Some(IntOrString::String(API_PORT_NAME.to_owned())),
						node_port: exposed(config.api_node_port),
						..ServicePort::default()
					},
					ServicePort {
						name: Some(CONSOLE_PORT_NAME.to_owned()),
						port: i32::from(config.console_port),
						target_port: Some(IntOrString::String(CONSOLE_PORT_NAME.to_owned())),
						node_port: exposed(config.console_node_port),
						..ServicePort::default()
					},
				]),
				..ServiceSpec::default()
			}),
			..Service::default()
		};
		Self {
			namespace,
			deployment,
			service,
		}
	}

	/// Multi-document YAML stream, namespace first so `apply` can create it before use.
	pub fn to_yaml(&self) -> Result<String, ProvisionError> {
		let documents = [
			serde_yaml::to_string(&self.namespace)?,
			serde_yaml::to_string(&self.deployment)?,
			serde_yaml::to_string(&self.service)?,
		];
		Ok(documents.join("---\n"))
	}
}

/// Node port assigned to a named service port, if the API server filled it in.
pub fn node_port(service: &Service, port_name: &str) -> Option<u16> {
	service
		.spec
		.as_ref()?
		.ports
		.as_ref()?
		.iter()
		.find(|port| port.name.as_deref() == Some(port_name))?
		.node_port
		.and_then(|port| u16::try_from(port).ok())
}
