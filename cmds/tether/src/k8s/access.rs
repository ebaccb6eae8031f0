//! [`ResourceAccess`] backed by a kube-rs client.

use std::sync::Arc;

use async_trait::async_trait;
use kube::{
	api::{Api, DynamicObject, Patch},
	core::GroupVersionKind,
	discovery::ApiResource,
	Client,
};
use tokio::sync::RwLock;
use tracing::instrument;

use super::{
	discovery::ApiResourceCache, AccessError, ClusterConnection, Endpoint, ResourceAccess,
};
use crate::{manifest::Manifest, options::MetaOptions};

/// Dynamic-object access to a live cluster.
///
/// Discovery runs lazily on the first resolution and is reused until
/// [`ResourceAccess::invalidate`] drops it.
pub struct KubeAccess {
	client: Client,
	cache: RwLock<Option<Arc<ApiResourceCache>>>,
}

impl KubeAccess {
	pub fn new(client: Client) -> Self {
		Self {
			client,
			cache: RwLock::new(None),
		}
	}

	pub fn from_connection(connection: &ClusterConnection) -> Self {
		Self::new(connection.client().clone())
	}

	async fn cache(&self) -> Result<Arc<ApiResourceCache>, AccessError> {
		if let Some(cache) = self.cache.read().await.as_ref() {
			return Ok(Arc::clone(cache));
		}

		let mut slot = self.cache.write().await;
		// Another worker may have finished discovery while we waited.
		if let Some(cache) = slot.as_ref() {
			return Ok(Arc::clone(cache));
		}
		let cache = Arc::new(
			ApiResourceCache::build(&self.client)
				.await
				.map_err(|e| AccessError::Discovery(Box::new(e)))?,
		);
		*slot = Some(Arc::clone(&cache));
		Ok(cache)
	}

	fn dynamic_api(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
		match namespace {
			Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
			None => Api::all_with(self.client.clone(), ar),
		}
	}
}

/// Map a client error onto the access taxonomy.
fn classify(error: kube::Error) -> AccessError {
	match error {
		kube::Error::Api(ref response) if response.code == 404 => AccessError::NotFound,
		other => AccessError::Remote(Box::new(other)),
	}
}

fn into_manifest(object: DynamicObject) -> Result<Manifest, AccessError> {
	serde_json::to_value(object)
		.and_then(serde_json::from_value)
		.map_err(|e| AccessError::Remote(Box::new(e)))
}

#[async_trait]
impl ResourceAccess for KubeAccess {
	async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Endpoint, AccessError> {
		self.cache()
			.await?
			.lookup(gvk)
			.cloned()
			.ok_or_else(|| AccessError::Unresolved {
				api_version: gvk.api_version(),
				kind: gvk.kind.clone(),
			})
	}

	#[instrument(skip_all, fields(kind = %endpoint.api_resource.kind, name = %name))]
	async fn get(
		&self,
		endpoint: &Endpoint,
		namespace: Option<&str>,
		name: &str,
		opts: &MetaOptions,
	) -> Result<Manifest, AccessError> {
		let api = self.dynamic_api(&endpoint.api_resource, namespace);
		let object = api
			.get_with(name, &opts.get_params())
			.await
			.map_err(classify)?;
		into_manifest(object)
	}

	#[instrument(skip_all, fields(kind = %endpoint.api_resource.kind, name = %name))]
	async fn patch(
		&self,
		endpoint: &Endpoint,
		namespace: Option<&str>,
		name: &str,
		body: &serde_json::Value,
		opts: &MetaOptions,
	) -> Result<Manifest, AccessError> {
		let api = self.dynamic_api(&endpoint.api_resource, namespace);
		let object = api
			.patch(name, &opts.patch_params(), &Patch::Apply(body))
			.await
			.map_err(classify)?;
		into_manifest(object)
	}

	#[instrument(skip_all, fields(kind = %endpoint.api_resource.kind, name = %name))]
	async fn delete(
		&self,
		endpoint: &Endpoint,
		namespace: Option<&str>,
		name: &str,
		opts: &MetaOptions,
	) -> Result<(), AccessError> {
		let api = self.dynamic_api(&endpoint.api_resource, namespace);
		api.delete(name, &opts.delete_params())
			.await
			.map_err(classify)?;
		Ok(())
	}

	async fn invalidate(&self) {
		self.cache.write().await.take();
		tracing::debug!("discovery cache invalidated");
	}

	fn default_namespace(&self) -> &str {
		self.client.default_namespace()
	}
}
