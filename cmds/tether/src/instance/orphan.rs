//! The orphan instance: manifests no named instance claims.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::{hold, Instance};
use crate::{
	error::{Error, Errors, Step},
	fanout::fan_out,
	k8s::ResourceAccess,
	manifest::{Id, Manifest},
	options::MetaOptions,
};

/// Manifests applied without ownership tracking.
///
/// Nothing is persisted for an orphan instance, so nothing is ever pruned
/// and no owner references are set.
#[derive(Debug, Default)]
pub struct Orphan {
	manifests: Mutex<HashMap<Id, Manifest>>,
}

impl Orphan {
	pub fn new() -> Self {
		Self::default()
	}

	fn held(&self) -> MutexGuard<'_, HashMap<Id, Manifest>> {
		self.manifests.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

#[async_trait]
impl Instance for Orphan {
	fn name(&self) -> Option<&str> {
		None
	}

	/// Patch every manifest and keep the server's version of each.
	#[instrument(skip_all, fields(manifests = tracing::field::Empty))]
	async fn commit<A: ResourceAccess>(
		&self,
		access: &Arc<A>,
		opts: &MetaOptions,
		cancel: &CancellationToken,
	) -> Result<(), Error> {
		let manifests = self.manifests();
		tracing::Span::current().record("manifests", manifests.len());

		let results = fan_out(manifests, cancel, |manifest: Manifest| {
			let access = Arc::clone(access);
			let opts = opts.clone();
			async move {
				let id = manifest.id();
				manifest
					.patch(access.as_ref(), &opts)
					.await
					.map(|applied| (id.clone(), applied))
					.map_err(|e| Error::at(Step::ApplyManifest, &id, e))
			}
		})
		.await?;

		let mut errors = Errors::new();
		for result in results {
			match result {
				Ok((id, applied)) => {
					let mut held = self.held();
					held.remove(&id);
					held.insert(applied.id(), applied);
				}
				Err(e) => errors.push(e),
			}
		}
		errors.into_result()
	}

	/// Delete every manifest, forgetting each one that is gone.
	///
	/// Manifests already absent from the cluster count as deleted.
	#[instrument(skip_all, fields(manifests = tracing::field::Empty))]
	async fn delete<A: ResourceAccess>(
		&self,
		access: &Arc<A>,
		opts: &MetaOptions,
		cancel: &CancellationToken,
	) -> Result<(), Error> {
		let manifests = self.manifests();
		tracing::Span::current().record("manifests", manifests.len());

		let results = fan_out(manifests, cancel, |manifest: Manifest| {
			let access = Arc::clone(access);
			let opts = opts.clone();
			async move {
				let result = manifest.delete(access.as_ref(), &opts).await;
				(manifest, result)
			}
		})
		.await?;

		let mut errors = Errors::new();
		for (manifest, result) in results {
			match result {
				Ok(()) => self.remove(&manifest),
				Err(e) if e.is_not_found() => self.remove(&manifest),
				Err(e) => errors.push(Error::at(Step::DeleteManifest, manifest.id(), e)),
			}
		}
		errors.into_result()
	}

	fn add(&self, manifest: Manifest) {
		hold(&mut self.held(), manifest);
	}

	fn remove(&self, manifest: &Manifest) {
		self.held().remove(&manifest.id());
	}

	fn manifests(&self) -> Vec<Manifest> {
		self.held().values().cloned().collect()
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use serde_json::json;

	use super::*;
	use crate::test_utils::FakeCluster;

	fn secret(name: &str) -> Manifest {
		Manifest::from_value(json!({
			"apiVersion": "v1",
			"kind": "Secret",
			"metadata": {"name": name},
			"stringData": {"token": name},
		}))
		.unwrap()
	}

	fn orphan(names: &[&str]) -> Orphan {
		let orphan = Orphan::new();
		for name in names {
			orphan.add(secret(name));
		}
		orphan
	}

	#[tokio::test]
	async fn test_commit_replaces_with_server_result() {
		let cluster = Arc::new(FakeCluster::new());
		let orphans = orphan(&["a", "b"]);

		orphans
			.commit(&cluster, &MetaOptions::default(), &CancellationToken::new())
			.await
			.unwrap();

		let held = orphans.manifests();
		assert_eq!(held.len(), 2);
		assert!(held.iter().all(Manifest::is_remote));
		assert!(held.iter().all(|m| m.metadata.owner_references.is_none()));
		assert!(held.iter().all(|m| m.namespace() == "default"));
		assert_eq!(cluster.len(), 2);
	}

	#[tokio::test]
	async fn test_commit_reports_each_failure() {
		let cluster = Arc::new(FakeCluster::new());
		cluster.reject("b");
		let orphans = orphan(&["a", "b"]);

		let err = orphans
			.commit(&cluster, &MetaOptions::default(), &CancellationToken::new())
			.await
			.unwrap_err();

		assert_matches!(err, Error::Multiple(ref errors) if errors.len() == 1);
		assert!(err.to_string().contains("applying manifest Secret/b"));
		let remote = orphans.manifests().into_iter().filter(Manifest::is_remote).count();
		assert_eq!(remote, 1);
	}

	#[tokio::test]
	async fn test_delete_forgets_deleted_manifests() {
		let cluster = Arc::new(FakeCluster::new());
		cluster.seed(secret("a"));
		cluster.seed(secret("locked"));
		cluster.reject("locked");
		let orphans = orphan(&["a", "missing", "locked"]);

		let err = orphans
			.delete(&cluster, &MetaOptions::default(), &CancellationToken::new())
			.await
			.unwrap_err();

		assert!(err.to_string().contains("deleting manifest Secret/locked"));
		assert_eq!(orphans.manifests(), vec![secret("locked")]);
		assert_eq!(cluster.len(), 1);
	}

	#[test]
	fn test_add_keeps_local_over_remote() {
		let orphans = orphan(&["a"]);

		let mut remote = secret("a");
		remote.metadata.uid = Some("uid-1".to_string());
		remote.body.insert("stringData".to_string(), json!({"token": "stale"}));
		orphans.add(remote.clone());
		assert_eq!(orphans.manifests(), vec![secret("a")]);

		orphans.remove(&secret("a"));
		orphans.add(remote.clone());
		assert_eq!(orphans.manifests(), vec![remote.clone()]);

		// A newer remote copy still replaces an older one.
		let mut newer = remote;
		newer.metadata.resource_version = Some("2".to_string());
		orphans.add(newer.clone());
		assert_eq!(orphans.manifests(), vec![newer]);
	}

	#[test]
	fn test_concurrent_add_remove() {
		let orphans = Orphan::new();
		std::thread::scope(|s| {
			for i in 0..100 {
				let orphans = &orphans;
				s.spawn(move || {
					let manifest = secret(&format!("s-{i}"));
					orphans.add(manifest.clone());
					if i % 4 == 0 {
						orphans.remove(&manifest);
					}
				});
			}
		});
		assert_eq!(orphans.manifests().len(), 75);
	}
}
