//! Resource access: mapping kinds to REST endpoints and calling them.
//!
//! The engine talks to the cluster only through [`ResourceAccess`]. The
//! kube-rs backed implementation lives in [`access`]; tests provide an
//! in-memory one.

use async_trait::async_trait;
use kube::{core::GroupVersionKind, discovery::ApiResource};
use thiserror::Error;

use crate::{manifest::Manifest, options::MetaOptions};

pub mod access;
pub mod client;
pub mod discovery;

pub use access::KubeAccess;
pub use client::ClusterConnection;

/// Kubernetes API resource scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceScope {
	/// Resource is namespaced (e.g., Deployment, ConfigMap).
	Namespaced,

	/// Resource is cluster-wide (e.g., Namespace, ClusterRole).
	ClusterWide,
}

/// REST endpoint serving one resource kind.
#[derive(Debug, Clone)]
pub struct Endpoint {
	pub api_resource: ApiResource,
	pub scope: ResourceScope,
}

impl Endpoint {
	/// Namespace to address for an object of this kind.
	///
	/// Namespaced kinds fall back to `default` when the object names none;
	/// cluster-wide kinds never carry a namespace.
	pub fn namespace_for<'a>(&self, namespace: &'a str, default: &'a str) -> Option<&'a str> {
		match self.scope {
			ResourceScope::Namespaced if namespace.is_empty() => Some(default),
			ResourceScope::Namespaced => Some(namespace),
			ResourceScope::ClusterWide => None,
		}
	}
}

/// Errors raised by a [`ResourceAccess`] backend.
#[derive(Debug, Error)]
pub enum AccessError {
	#[error("no API endpoint serves {api_version}, kind {kind}")]
	Unresolved { api_version: String, kind: String },

	#[error("discovering API resources")]
	Discovery(#[source] Box<discovery::DiscoveryError>),

	#[error("resource not found")]
	NotFound,

	#[error(transparent)]
	Remote(Box<dyn std::error::Error + Send + Sync>),
}

/// Discovery-backed access to cluster resources.
///
/// Implementations hold a process-wide discovery cache. The engine decides
/// when it is invalidated: only between passes, never while workers of a
/// pass may still be resolving.
#[async_trait]
pub trait ResourceAccess: Send + Sync + 'static {
	/// Map a group/version/kind to the endpoint serving it.
	async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Endpoint, AccessError>;

	async fn get(
		&self,
		endpoint: &Endpoint,
		namespace: Option<&str>,
		name: &str,
		opts: &MetaOptions,
	) -> Result<Manifest, AccessError>;

	/// Server-side apply `body`, returning the merged live object.
	async fn patch(
		&self,
		endpoint: &Endpoint,
		namespace: Option<&str>,
		name: &str,
		body: &serde_json::Value,
		opts: &MetaOptions,
	) -> Result<Manifest, AccessError>;

	async fn delete(
		&self,
		endpoint: &Endpoint,
		namespace: Option<&str>,
		name: &str,
		opts: &MetaOptions,
	) -> Result<(), AccessError>;

	/// Drop cached discovery results so newly registered kinds become visible.
	async fn invalidate(&self);

	/// Namespace used for namespaced objects that name none.
	fn default_namespace(&self) -> &str;
}

#[cfg(test)]
mod tests {
	use rstest::rstest;

	use super::*;

	fn endpoint(scope: ResourceScope) -> Endpoint {
		Endpoint {
			api_resource: ApiResource::from_gvk_with_plural(
				&GroupVersionKind::gvk("", "v1", "ConfigMap"),
				"configmaps",
			),
			scope,
		}
	}

	#[rstest]
	#[case(ResourceScope::Namespaced, "", Some("default"))]
	#[case(ResourceScope::Namespaced, "team", Some("team"))]
	#[case(ResourceScope::ClusterWide, "", None)]
	#[case(ResourceScope::ClusterWide, "team", None)]
	fn test_namespace_for(
		#[case] scope: ResourceScope,
		#[case] namespace: &str,
		#[case] expected: Option<&str>,
	) {
		assert_eq!(endpoint(scope).namespace_for(namespace, "default"), expected);
	}
}
