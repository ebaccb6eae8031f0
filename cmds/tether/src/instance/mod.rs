//! Instances: groups of manifests committed as one logical release.
//!
//! A [`Named`] instance is persisted in the cluster as an `Instance` custom
//! resource recording the ids it owns, which is what makes pruning possible.
//! Manifests without a membership label are collected into an [`Orphan`]
//! instance that is applied but never pruned.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
	error::Error,
	k8s::ResourceAccess,
	manifest::{Id, Manifest},
	options::MetaOptions,
};

pub mod crd;
mod named;
mod orphan;

pub use named::{InstanceRecord, InstanceSpec, Named};
pub use orphan::Orphan;

pub const GROUP: &str = "tether.dev";
pub const VERSION: &str = "v1alpha1";
pub const API_VERSION: &str = "tether.dev/v1alpha1";
pub const KIND: &str = "Instance";
pub const PLURAL: &str = "instances";

/// Hold `manifest` under its id. A remote manifest never replaces a local
/// one with the same id.
fn hold(held: &mut HashMap<Id, Manifest>, manifest: Manifest) {
	let id = manifest.id();
	if manifest.is_remote() && held.get(&id).is_some_and(|current| !current.is_remote()) {
		return;
	}
	held.insert(id, manifest);
}

/// Operations shared by every instance variant.
///
/// `add`, `remove` and `manifests` only touch local state and may be called
/// from several threads at once; nothing reaches the cluster before `commit`.
#[async_trait]
pub trait Instance: Send + Sync {
	/// Instance name, `None` for the orphan instance.
	fn name(&self) -> Option<&str>;

	/// Reconcile the cluster with the manifests currently held.
	async fn commit<A: ResourceAccess>(
		&self,
		access: &Arc<A>,
		opts: &MetaOptions,
		cancel: &CancellationToken,
	) -> Result<(), Error>;

	/// Remove the instance and what it manages from the cluster.
	async fn delete<A: ResourceAccess>(
		&self,
		access: &Arc<A>,
		opts: &MetaOptions,
		cancel: &CancellationToken,
	) -> Result<(), Error>;

	fn add(&self, manifest: Manifest);

	fn remove(&self, manifest: &Manifest);

	/// Snapshot of the held manifests, in no particular order.
	fn manifests(&self) -> Vec<Manifest>;
}

/// Either instance variant, as produced by [`split`].
#[derive(Debug)]
pub enum AnyInstance {
	Named(Named),
	Orphan(Orphan),
}

impl std::fmt::Display for AnyInstance {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self.name() {
			Some(name) => write!(f, "{name}"),
			None => write!(f, "orphan"),
		}
	}
}

#[async_trait]
impl Instance for AnyInstance {
	fn name(&self) -> Option<&str> {
		match self {
			AnyInstance::Named(named) => named.name(),
			AnyInstance::Orphan(orphan) => orphan.name(),
		}
	}

	async fn commit<A: ResourceAccess>(
		&self,
		access: &Arc<A>,
		opts: &MetaOptions,
		cancel: &CancellationToken,
	) -> Result<(), Error> {
		match self {
			AnyInstance::Named(named) => named.commit(access, opts, cancel).await,
			AnyInstance::Orphan(orphan) => orphan.commit(access, opts, cancel).await,
		}
	}

	async fn delete<A: ResourceAccess>(
		&self,
		access: &Arc<A>,
		opts: &MetaOptions,
		cancel: &CancellationToken,
	) -> Result<(), Error> {
		match self {
			AnyInstance::Named(named) => named.delete(access, opts, cancel).await,
			AnyInstance::Orphan(orphan) => orphan.delete(access, opts, cancel).await,
		}
	}

	fn add(&self, manifest: Manifest) {
		match self {
			AnyInstance::Named(named) => named.add(manifest),
			AnyInstance::Orphan(orphan) => orphan.add(manifest),
		}
	}

	fn remove(&self, manifest: &Manifest) {
		match self {
			AnyInstance::Named(named) => named.remove(manifest),
			AnyInstance::Orphan(orphan) => orphan.remove(manifest),
		}
	}

	fn manifests(&self) -> Vec<Manifest> {
		match self {
			AnyInstance::Named(named) => named.manifests(),
			AnyInstance::Orphan(orphan) => orphan.manifests(),
		}
	}
}

/// Group manifests by their membership label.
///
/// Instances are returned in the order their first manifest appears;
/// unlabelled manifests all land in a single orphan instance.
pub fn split(manifests: impl IntoIterator<Item = Manifest>) -> Vec<AnyInstance> {
	let mut instances: Vec<AnyInstance> = Vec::new();
	let mut index: HashMap<Option<String>, usize> = HashMap::new();

	for manifest in manifests {
		let key = manifest.instance().map(str::to_string);
		let slot = *index.entry(key.clone()).or_insert_with(|| {
			instances.push(match key {
				Some(name) => AnyInstance::Named(Named::new(name)),
				None => AnyInstance::Orphan(Orphan::new()),
			});
			instances.len() - 1
		});
		instances[slot].add(manifest);
	}

	instances
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn labelled(name: &str, instance: Option<&str>) -> Manifest {
		let manifest = Manifest::from_value(json!({
			"apiVersion": "v1",
			"kind": "ConfigMap",
			"metadata": {"name": name, "namespace": "default"},
		}))
		.unwrap();
		match instance {
			Some(instance) => manifest.with_instance(instance),
			None => manifest,
		}
	}

	#[test]
	fn test_split_groups_by_label_in_first_seen_order() {
		let mut manifests = Vec::new();
		for i in 0..5 {
			manifests.push(labelled(&format!("tomato-{i}"), Some("tomato")));
			if i < 3 {
				manifests.push(labelled(&format!("potato-{i}"), Some("potato")));
			}
			if i < 2 {
				manifests.push(labelled(&format!("loose-{i}"), None));
			}
		}

		let instances = split(manifests);
		let summary: Vec<(String, usize)> = instances
			.iter()
			.map(|i| (i.to_string(), i.manifests().len()))
			.collect();
		assert_eq!(
			summary,
			vec![
				("tomato".to_string(), 5),
				("potato".to_string(), 3),
				("orphan".to_string(), 2),
			]
		);
		assert!(matches!(instances[2], AnyInstance::Orphan(_)));
	}

	#[test]
	fn test_split_empty() {
		assert!(split(Vec::new()).is_empty());
	}
}
