//! Canonical identity of a cluster resource.

use std::fmt;

use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::Manifest;
use crate::{
	error::{Action, Error},
	k8s::{AccessError, Endpoint, ResourceAccess},
	options::MetaOptions,
};

/// Identifies one remote object: two manifests with equal ids refer to the
/// same object in the cluster.
///
/// The namespace is kept exactly as written in the manifest, so it is empty
/// for cluster-scoped kinds and for namespaced manifests relying on the
/// default namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id {
	#[serde(default)]
	pub group: String,
	pub version: String,
	pub kind: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub namespace: String,
	#[serde(default)]
	pub name: String,
}

/// Split an apiVersion string into group and version.
///
/// Core resources (`v1`) have an empty group.
pub(crate) fn split_api_version(api_version: &str) -> (&str, &str) {
	match api_version.split_once('/') {
		Some((group, version)) => (group, version),
		None => ("", api_version),
	}
}

impl Id {
	pub fn new(
		api_version: &str,
		kind: impl Into<String>,
		namespace: impl Into<String>,
		name: impl Into<String>,
	) -> Self {
		let (group, version) = split_api_version(api_version);
		Self {
			group: group.to_string(),
			version: version.to_string(),
			kind: kind.into(),
			namespace: namespace.into(),
			name: name.into(),
		}
	}

	pub fn api_version(&self) -> String {
		if self.group.is_empty() {
			self.version.clone()
		} else {
			format!("{}/{}", self.group, self.version)
		}
	}

	pub fn gvk(&self) -> GroupVersionKind {
		GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
	}

	/// Retrieve the live document this id points to.
	#[instrument(skip_all, fields(id = %self))]
	pub async fn fetch<A: ResourceAccess>(
		&self,
		access: &A,
		opts: &MetaOptions,
	) -> Result<Manifest, Error> {
		let endpoint = self.endpoint(access).await?;
		let namespace = endpoint.namespace_for(&self.namespace, access.default_namespace());

		access
			.get(&endpoint, namespace, &self.name, opts)
			.await
			.map_err(|source| self.remote_error(Action::Get, source))
	}

	/// Look up the endpoint serving this id's kind.
	///
	/// Only a kind no endpoint serves is a [`Error::Resolution`]; a failed
	/// discovery request is a [`Error::Remote`] like any other failed call.
	pub(crate) async fn endpoint<A: ResourceAccess>(&self, access: &A) -> Result<Endpoint, Error> {
		access
			.resolve(&self.gvk())
			.await
			.map_err(|source| self.remote_error(Action::Discover, source))
	}

	/// Classify an access failure for this id.
	pub(crate) fn remote_error(&self, action: Action, source: AccessError) -> Error {
		match source {
			AccessError::NotFound => Error::NotFound { id: self.clone() },
			AccessError::Unresolved { .. } => Error::Resolution {
				id: self.clone(),
				source,
			},
			source => Error::Remote {
				id: self.clone(),
				action,
				source,
			},
		}
	}
}

impl fmt::Display for Id {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.kind, self.name)?;
		if !self.namespace.is_empty() {
			write!(f, " in {}", self.namespace)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use rstest::rstest;

	use super::*;
	use crate::test_utils::FakeCluster;

	#[rstest]
	#[case("apps/v1", "apps", "v1")]
	#[case("v1", "", "v1")]
	#[case("apiextensions.k8s.io/v1", "apiextensions.k8s.io", "v1")]
	fn test_split_api_version(#[case] api_version: &str, #[case] group: &str, #[case] version: &str) {
		let id = Id::new(api_version, "Thing", "", "x");
		assert_eq!(id.group, group);
		assert_eq!(id.version, version);
		assert_eq!(id.api_version(), api_version);
	}

	#[test]
	fn test_json_shape() {
		let namespaced = Id::new("v1", "ConfigMap", "default", "cfg-a");
		assert_eq!(
			serde_json::to_value(&namespaced).unwrap(),
			serde_json::json!({
				"group": "",
				"version": "v1",
				"kind": "ConfigMap",
				"namespace": "default",
				"name": "cfg-a",
			})
		);

		let cluster = Id::new("v1", "Namespace", "", "team");
		let value = serde_json::to_value(&cluster).unwrap();
		assert!(value.get("namespace").is_none());

		let back: Id = serde_json::from_value(value).unwrap();
		assert_eq!(back, cluster);
	}

	#[test]
	fn test_display() {
		assert_eq!(
			Id::new("v1", "ConfigMap", "default", "cfg-a").to_string(),
			"ConfigMap/cfg-a in default"
		);
		assert_eq!(Id::new("v1", "Namespace", "", "team").to_string(), "Namespace/team");
	}

	#[tokio::test]
	async fn test_failed_discovery_is_not_a_resolution_error() {
		let cluster = FakeCluster::new();
		cluster.break_discovery("");
		let cfg = Id::new("v1", "ConfigMap", "default", "cfg-a");

		let result = cfg.fetch(&cluster, &MetaOptions::default()).await;

		assert_matches!(
			result,
			Err(Error::Remote {
				action: Action::Discover,
				source: AccessError::Discovery(_),
				..
			})
		);
		assert_eq!(
			result.unwrap_err().to_string(),
			"discovering the endpoint of ConfigMap/cfg-a in default"
		);
	}

	#[tokio::test]
	async fn test_unserved_kind_is_a_resolution_error() {
		let cluster = FakeCluster::new();
		let widget = Id::new("example.com/v1", "Widget", "default", "small");

		let result = widget.fetch(&cluster, &MetaOptions::default()).await;

		assert_matches!(result, Err(Error::Resolution { .. }));
	}
}
