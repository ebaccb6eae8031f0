//! Kubernetes API resource discovery and caching.
//!
//! Discovery results are snapshotted into an [`ApiResourceCache`] that maps
//! group/version/kind to the endpoint serving it. A snapshot never changes;
//! picking up newly registered kinds means building a new one.

use std::collections::HashMap;

use kube::{
	core::GroupVersionKind,
	discovery::{ApiResource, Scope},
	Client, Discovery,
};
use thiserror::Error;
use tracing::instrument;

use super::{Endpoint, ResourceScope};

/// Errors that can occur during API resource discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
	#[error("full API discovery failed")]
	FullDiscovery(#[source] kube::Error),
}

/// Create a GroupVersionKind from a kube ApiResource.
fn gvk_from_api_resource(ar: &ApiResource) -> GroupVersionKind {
	GroupVersionKind::gvk(&ar.group, &ar.version, &ar.kind)
}

fn resource_scope(scope: &Scope) -> ResourceScope {
	match scope {
		Scope::Namespaced => ResourceScope::Namespaced,
		Scope::Cluster => ResourceScope::ClusterWide,
	}
}

/// Cached API resource discovery results.
#[derive(Debug, Clone, Default)]
pub struct ApiResourceCache {
	resources: HashMap<GroupVersionKind, Endpoint>,
}

impl ApiResourceCache {
	/// Build the cache by querying the cluster's discovery API.
	///
	/// Uses the Aggregated Discovery API (K8s 1.26+) which requires only 2 API calls,
	/// and falls back to full discovery on older clusters.
	#[instrument(skip_all)]
	pub async fn build(client: &Client) -> Result<Self, DiscoveryError> {
		match Discovery::new(client.clone()).run_aggregated().await {
			Ok(discovery) => {
				tracing::debug!("using aggregated discovery");
				Ok(Self::from_discovery(discovery))
			}
			Err(e) => {
				tracing::debug!(error = %e, "aggregated discovery not available, using full discovery");
				let discovery = Discovery::new(client.clone())
					.run()
					.await
					.map_err(DiscoveryError::FullDiscovery)?;
				Ok(Self::from_discovery(discovery))
			}
		}
	}

	/// Build cache from a completed Discovery.
	fn from_discovery(discovery: Discovery) -> Self {
		let mut cache = Self::default();

		for group in discovery.groups() {
			// Every served version, so manifests pinned to an older version still resolve
			for ver in group.versions() {
				for (ar, caps) in group.versioned_resources(ver) {
					cache.insert(ar, resource_scope(&caps.scope));
				}
			}
		}

		tracing::debug!(resources = cache.resources.len(), "discovery cache built");
		cache
	}

	pub fn insert(&mut self, api_resource: ApiResource, scope: ResourceScope) {
		self.resources.insert(
			gvk_from_api_resource(&api_resource),
			Endpoint {
				api_resource,
				scope,
			},
		);
	}

	/// Look up a resource by its GroupVersionKind.
	pub fn lookup(&self, gvk: &GroupVersionKind) -> Option<&Endpoint> {
		self.resources.get(gvk)
	}

	pub fn len(&self) -> usize {
		self.resources.len()
	}

	pub fn is_empty(&self) -> bool {
		self.resources.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_lookup_by_gvk() {
		let mut cache = ApiResourceCache::default();
		let gvk = GroupVersionKind::gvk("apps", "v1", "Deployment");
		cache.insert(
			ApiResource::from_gvk_with_plural(&gvk, "deployments"),
			ResourceScope::Namespaced,
		);

		let endpoint = cache.lookup(&gvk).unwrap();
		assert_eq!(endpoint.api_resource.plural, "deployments");
		assert_eq!(endpoint.scope, ResourceScope::Namespaced);

		assert!(cache
			.lookup(&GroupVersionKind::gvk("apps", "v1beta1", "Deployment"))
			.is_none());
	}

	#[test]
	fn test_scope_mapping() {
		assert_eq!(resource_scope(&Scope::Cluster), ResourceScope::ClusterWide);
		assert_eq!(resource_scope(&Scope::Namespaced), ResourceScope::Namespaced);
	}
}
