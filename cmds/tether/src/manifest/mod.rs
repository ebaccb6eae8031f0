//! Resource manifests and the operations the engine performs on them.
//!
//! A [`Manifest`] is a partially typed document: the envelope fields
//! (`apiVersion`, `kind`, `metadata`) are strongly typed, everything else is
//! kept as an open JSON map and sent to the server untouched.
//!
//! Instance membership and deletion policy are flat label/annotation
//! metadata, so a manifest never holds a reference to its instance.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::{
	error::{Action, Error},
	k8s::ResourceAccess,
	options::MetaOptions,
};

mod id;

pub use id::Id;

/// Label naming the instance a manifest belongs to.
pub const INSTANCE_LABEL: &str = "tether.dev/instance";

/// Annotation selecting what happens to a manifest when it is removed.
pub const DELETION_POLICY_ANNOTATION: &str = "tether.dev/deletion-policy";

/// Annotation value detaching a resource instead of deleting it.
pub const DELETION_POLICY_ABANDON: &str = "abandon";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletionPolicy {
	/// Removed manifests are deleted from the cluster.
	#[default]
	Default,

	/// Removed manifests are detached from their instance and left running.
	Abandon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
	pub api_version: String,
	pub kind: String,
	#[serde(default)]
	pub metadata: ObjectMeta,
	/// Every other top-level field (`spec`, `data`, `status`, ...).
	#[serde(flatten)]
	pub body: serde_json::Map<String, serde_json::Value>,
}

impl Manifest {
	/// Decode an evaluator document.
	///
	/// `apiVersion` and `kind` are required strings.
	pub fn from_value(value: serde_json::Value) -> Result<Self, Error> {
		serde_json::from_value(value).map_err(Error::Decoding)
	}

	pub fn id(&self) -> Id {
		Id::new(
			&self.api_version,
			&self.kind,
			self.namespace(),
			self.name(),
		)
	}

	pub fn name(&self) -> &str {
		self.metadata.name.as_deref().unwrap_or_default()
	}

	pub fn namespace(&self) -> &str {
		self.metadata.namespace.as_deref().unwrap_or_default()
	}

	/// Whether this document mirrors a live object.
	pub fn is_remote(&self) -> bool {
		self.metadata.uid.is_some()
	}

	/// Name of the owning instance, `None` for orphans.
	pub fn instance(&self) -> Option<&str> {
		self.metadata
			.labels
			.as_ref()
			.and_then(|labels| labels.get(INSTANCE_LABEL))
			.map(String::as_str)
			.filter(|name| !name.is_empty())
	}

	/// Copy of this manifest bound to `instance`; an empty name unbinds it.
	#[must_use]
	pub fn with_instance(&self, instance: &str) -> Self {
		let mut manifest = self.clone();
		if instance.is_empty() {
			if let Some(labels) = manifest.metadata.labels.as_mut() {
				labels.remove(INSTANCE_LABEL);
				if labels.is_empty() {
					manifest.metadata.labels = None;
				}
			}
		} else {
			manifest
				.metadata
				.labels
				.get_or_insert_with(BTreeMap::new)
				.insert(INSTANCE_LABEL.to_string(), instance.to_string());
		}
		manifest
	}

	pub fn deletion_policy(&self) -> DeletionPolicy {
		let policy = self
			.metadata
			.annotations
			.as_ref()
			.and_then(|annotations| annotations.get(DELETION_POLICY_ANNOTATION));
		match policy.map(String::as_str) {
			Some(DELETION_POLICY_ABANDON) => DeletionPolicy::Abandon,
			_ => DeletionPolicy::Default,
		}
	}

	pub fn set_owner_references(&mut self, references: Vec<OwnerReference>) {
		self.metadata.owner_references = Some(references);
	}

	pub fn clear_owner_references(&mut self) {
		self.metadata.owner_references = None;
	}

	/// Wire form sent with server-side apply.
	///
	/// Server-populated metadata is stripped: applying a document that
	/// carries managedFields is rejected, and a stale resourceVersion would
	/// turn the apply into a conditional update.
	pub fn apply_payload(&self) -> Result<serde_json::Value, Error> {
		let mut manifest = self.clone();
		let metadata = &mut manifest.metadata;
		metadata.managed_fields = None;
		metadata.resource_version = None;
		metadata.uid = None;
		metadata.creation_timestamp = None;
		metadata.generation = None;

		serde_json::to_value(&manifest).map_err(|source| Error::Encoding {
			id: self.id(),
			source,
		})
	}

	/// Server-side apply this manifest, returning the server's merged result.
	#[instrument(skip_all, fields(id = %self.id()))]
	pub async fn patch<A: ResourceAccess>(
		&self,
		access: &A,
		opts: &MetaOptions,
	) -> Result<Manifest, Error> {
		let applied = self.apply(access, opts).await?;
		info!("{} patched{}", self.id(), opts.dry_run_suffix());
		Ok(applied)
	}

	/// Remove this manifest from the cluster according to its deletion policy.
	///
	/// Abandoned manifests are detached instead: the instance label and owner
	/// references are dropped and the result is applied. A missing object is
	/// reported as [`Error::NotFound`].
	#[instrument(skip_all, fields(id = %self.id()))]
	pub async fn delete<A: ResourceAccess>(&self, access: &A, opts: &MetaOptions) -> Result<(), Error> {
		let id = self.id();

		if self.deletion_policy() == DeletionPolicy::Abandon {
			let mut detached = self.with_instance("");
			detached.clear_owner_references();
			detached.apply(access, opts).await?;
			info!("{} abandoned{}", id, opts.dry_run_suffix());
			return Ok(());
		}

		let endpoint = id.endpoint(access).await?;
		let namespace = endpoint.namespace_for(&id.namespace, access.default_namespace());

		access
			.delete(&endpoint, namespace, &id.name, opts)
			.await
			.map_err(|source| id.remote_error(Action::Delete, source))?;

		info!("{} deleted{}", id, opts.dry_run_suffix());
		Ok(())
	}

	async fn apply<A: ResourceAccess>(&self, access: &A, opts: &MetaOptions) -> Result<Manifest, Error> {
		let id = self.id();
		let endpoint = id.endpoint(access).await?;
		let body = self.apply_payload()?;
		let namespace = endpoint.namespace_for(&id.namespace, access.default_namespace());

		access
			.patch(&endpoint, namespace, &id.name, &body, opts)
			.await
			.map_err(|source| id.remote_error(Action::Patch, source))
	}
}
