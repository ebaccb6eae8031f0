//! Kubernetes cluster connection management.

use std::time::Duration;

use k8s_openapi::apimachinery::pkg::version::Info;
use kube::{
	config::{InferConfigError, KubeConfigOptions, Kubeconfig, KubeconfigError},
	Client, Config,
};
use thiserror::Error;
use tracing::instrument;

/// Default timeout for Kubernetes API requests.
const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur when connecting to a Kubernetes cluster.
#[derive(Debug, Error)]
pub enum ConnectionError {
	#[error("no context named `{0}` was found. Please check your $KUBECONFIG")]
	ContextNotFound(String),

	#[error(transparent)]
	Kubeconfig(#[from] KubeconfigError),

	#[error(transparent)]
	InferConfig(#[from] InferConfigError),

	#[error(transparent)]
	Kube(#[from] kube::Error),
}

/// Represents a connection to a Kubernetes cluster.
#[derive(Clone)]
pub struct ClusterConnection {
	client: Client,
	server_version: Info,
	/// Human-readable identifier for the cluster (context name or API server URL).
	cluster_identifier: String,
}

impl std::fmt::Debug for ClusterConnection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ClusterConnection")
			.field("cluster_identifier", &self.cluster_identifier)
			.field("server_version", &self.server_version)
			.finish_non_exhaustive()
	}
}

impl ClusterConnection {
	/// Connect using the ambient configuration.
	///
	/// With a context name the kubeconfig is read and that context selected;
	/// otherwise the configuration is inferred (kubeconfig current context,
	/// then in-cluster service account).
	#[instrument(skip_all, fields(context = context.unwrap_or("<inferred>")))]
	pub async fn connect(context: Option<&str>) -> Result<Self, ConnectionError> {
		match context {
			Some(context) => Self::from_kubeconfig(Kubeconfig::read()?, context).await,
			None => {
				let config = Config::infer().await?;
				let identifier = config.cluster_url.to_string();
				Self::from_config(config, identifier).await
			}
		}
	}

	/// Connect through a named context of the given kubeconfig.
	#[instrument(skip_all, fields(context = %context))]
	pub async fn from_kubeconfig(kubeconfig: Kubeconfig, context: &str) -> Result<Self, ConnectionError> {
		if !kubeconfig.contexts.iter().any(|c| c.name == context) {
			return Err(ConnectionError::ContextNotFound(context.to_string()));
		}

		let config = Config::from_custom_kubeconfig(
			kubeconfig,
			&KubeConfigOptions {
				context: Some(context.to_string()),
				..Default::default()
			},
		)
		.await?;

		tracing::debug!(context = %context, "using kubeconfig context");
		Self::from_config(config, format!("context:{context}")).await
	}

	async fn from_config(mut config: Config, cluster_identifier: String) -> Result<Self, ConnectionError> {
		config.read_timeout = Some(DEFAULT_API_TIMEOUT);
		let client = Client::try_from(config)?;
		let server_version = client.apiserver_version().await?;

		Ok(Self {
			client,
			server_version,
			cluster_identifier,
		})
	}

	/// Get a reference to the underlying kube client.
	pub fn client(&self) -> &Client {
		&self.client
	}

	pub fn server_version(&self) -> &Info {
		&self.server_version
	}

	/// Get the default namespace from the current context.
	pub fn default_namespace(&self) -> &str {
		self.client.default_namespace()
	}

	/// Get the cluster identifier (context name or API server URL).
	pub fn cluster_identifier(&self) -> &str {
		&self.cluster_identifier
	}
}
