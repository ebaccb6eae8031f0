//! Named instances, persisted as `Instance` custom resources.

use std::{
	collections::{BTreeSet, HashMap},
	sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::PropagationPolicy;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{hold, Instance, API_VERSION, KIND};
use crate::{
	error::{Error, Errors, Step},
	fanout::{cancellable, fan_out},
	k8s::ResourceAccess,
	manifest::{DeletionPolicy, Id, Manifest},
	options::MetaOptions,
};

/// The `Instance` object as stored in the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
	pub api_version: String,
	pub kind: String,
	#[serde(default)]
	pub metadata: ObjectMeta,
	#[serde(default)]
	pub spec: InstanceSpec,
}

/// Ids of the resources an instance owns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub resources: Vec<Id>,
}

impl InstanceRecord {
	pub fn new(name: &str) -> Self {
		Self {
			api_version: API_VERSION.to_string(),
			kind: KIND.to_string(),
			metadata: ObjectMeta {
				name: Some(name.to_string()),
				..Default::default()
			},
			spec: InstanceSpec::default(),
		}
	}

	fn from_manifest(manifest: Manifest) -> Result<Self, Error> {
		serde_json::to_value(manifest)
			.and_then(serde_json::from_value)
			.map_err(Error::Decoding)
	}

	fn to_manifest(&self) -> Result<Manifest, Error> {
		let value = serde_json::to_value(self).map_err(|source| Error::Encoding {
			id: Id::new(&self.api_version, &self.kind, "", self.metadata.name.clone().unwrap_or_default()),
			source,
		})?;
		Manifest::from_value(value)
	}

	/// Reference placed on every owned, non-abandoned resource.
	///
	/// `None` until the record has been persisted and carries a uid.
	fn owner_reference(&self) -> Option<OwnerReference> {
		Some(OwnerReference {
			api_version: self.api_version.clone(),
			kind: self.kind.clone(),
			name: self.metadata.name.clone()?,
			uid: self.metadata.uid.clone()?,
			block_owner_deletion: Some(true),
			controller: None,
		})
	}
}

/// A named instance.
///
/// The desired manifests live behind a plain mutex so producers can add
/// to it from any thread. The persisted record lives behind an async mutex
/// held for a whole commit or delete, so operations on one instance never
/// interleave.
#[derive(Debug)]
pub struct Named {
	name: String,
	record: tokio::sync::Mutex<InstanceRecord>,
	manifests: Mutex<HashMap<Id, Manifest>>,
}

impl Named {
	pub fn new(name: impl Into<String>) -> Self {
		let name = name.into();
		Self {
			record: tokio::sync::Mutex::new(InstanceRecord::new(&name)),
			manifests: Mutex::new(HashMap::new()),
			name,
		}
	}

	/// Load an existing instance from the cluster.
	#[instrument(skip_all, fields(instance = %name))]
	pub async fn get<A: ResourceAccess>(access: &A, name: &str, opts: &MetaOptions) -> Result<Self, Error> {
		let mut named = Self::new(name);
		let live = named
			.id()
			.fetch(access, opts)
			.await
			.map_err(|e| Error::at(Step::FetchInstance, name, e))?;
		*named.record.get_mut() = InstanceRecord::from_manifest(live)?;
		Ok(named)
	}

	/// Id of the `Instance` object itself.
	pub fn id(&self) -> Id {
		Id::new(API_VERSION, KIND, "", &self.name)
	}

	/// Ids owned as of the last sync or commit.
	pub async fn resources(&self) -> Vec<Id> {
		self.record.lock().await.spec.resources.clone()
	}

	pub async fn record(&self) -> InstanceRecord {
		self.record.lock().await.clone()
	}

	fn desired(&self) -> MutexGuard<'_, HashMap<Id, Manifest>> {
		self.manifests.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Refresh the record from the cluster, creating the instance if absent.
	async fn sync<A: ResourceAccess>(
		&self,
		record: &mut InstanceRecord,
		access: &A,
		opts: &MetaOptions,
	) -> Result<(), Error> {
		match self.id().fetch(access, opts).await {
			Ok(live) => {
				*record = InstanceRecord::from_manifest(live)?;
				Ok(())
			}
			Err(e) if e.is_not_found() => {
				// A recreated instance owns nothing, whatever this process saw before.
				debug!("instance not found, creating it");
				*record = InstanceRecord::new(&self.name);
				persist(record, access, opts).await
			}
			Err(e) => Err(Error::at(Step::FetchInstance, &self.name, e)),
		}
	}
}

/// Apply the record and reflect the server's answer back into it.
async fn persist<A: ResourceAccess>(
	record: &mut InstanceRecord,
	access: &A,
	opts: &MetaOptions,
) -> Result<(), Error> {
	record.metadata.managed_fields = None;
	let applied = record.to_manifest()?.patch(access, opts).await?;
	*record = InstanceRecord::from_manifest(applied)?;
	Ok(())
}

enum Change {
	/// Remove a previously owned object, addressed by its recorded id.
	Prune(Id, Manifest),
	Patch(Manifest),
}

#[derive(Default)]
struct Outcome {
	/// Id to keep in (or add to) the ownership set.
	owned: Option<Id>,
	error: Option<Error>,
}

impl Change {
	async fn run<A: ResourceAccess>(
		self,
		access: &A,
		opts: &MetaOptions,
		instance: &str,
		owner: Option<OwnerReference>,
	) -> Outcome {
		match self {
			Change::Prune(id, live) => match live.delete(access, opts).await {
				Ok(()) => Outcome::default(),
				Err(e) if e.is_not_found() => Outcome::default(),
				Err(e) => Outcome {
					error: Some(Error::at(Step::DeleteManifest, &id, e)),
					owned: Some(id),
				},
			},
			Change::Patch(manifest) => {
				let id = manifest.id();
				let mut manifest = manifest.with_instance(instance);
				if manifest.deletion_policy() != DeletionPolicy::Abandon {
					if let Some(owner) = owner {
						manifest.set_owner_references(vec![owner]);
					}
				}
				match manifest.patch(access, opts).await {
					Ok(_) => Outcome {
						owned: Some(id),
						error: None,
					},
					Err(e) => Outcome {
						owned: None,
						error: Some(Error::at(Step::ApplyManifest, &id, e)),
					},
				}
			}
		}
	}
}

#[async_trait]
impl Instance for Named {
	fn name(&self) -> Option<&str> {
		Some(&self.name)
	}

	/// Sync, diff, apply and persist.
	///
	/// Every change runs even when some fail; the failures are returned
	/// together once the new ownership set has been persisted.
	#[instrument(skip_all, fields(instance = %self.name))]
	async fn commit<A: ResourceAccess>(
		&self,
		access: &Arc<A>,
		opts: &MetaOptions,
		cancel: &CancellationToken,
	) -> Result<(), Error> {
		let mut record = self.record.lock().await;

		cancellable(cancel, self.sync(&mut record, access.as_ref(), opts))
			.await
			.map_err(|e| Error::at(Step::SyncInstance, &self.name, e))?;

		let desired = self.desired().clone();
		let mut owned = BTreeSet::new();
		let mut errors = Errors::new();

		let stale: Vec<Id> = record
			.spec
			.resources
			.iter()
			.filter(|id| !desired.contains_key(*id))
			.cloned()
			.collect();
		let fetched = fan_out(stale, cancel, |id: Id| {
			let access = Arc::clone(access);
			let opts = opts.clone();
			async move {
				let live = id.fetch(access.as_ref(), &opts).await;
				(id, live)
			}
		})
		.await?;

		let mut changes = Vec::with_capacity(fetched.len() + desired.len());
		for (id, live) in fetched {
			match live {
				Ok(live) => changes.push(Change::Prune(id, live)),
				Err(e) if e.is_not_found() => debug!(%id, "prune target already gone"),
				Err(Error::Resolution { .. }) => {
					warn!(%id, "kind of prune target is no longer served, forgetting it");
				}
				Err(e) => {
					errors.push(Error::at(Step::FetchPruneTarget, &id, e));
					owned.insert(id);
				}
			}
		}
		changes.extend(desired.into_values().map(Change::Patch));

		// Kinds registered since the last pass must be resolvable.
		access.invalidate().await;

		let owner = record.owner_reference();
		let outcomes = fan_out(changes, cancel, |change: Change| {
			let access = Arc::clone(access);
			let opts = opts.clone();
			let instance = self.name.clone();
			let owner = owner.clone();
			async move { change.run(access.as_ref(), &opts, &instance, owner).await }
		})
		.await?;

		for outcome in outcomes {
			owned.extend(outcome.owned);
			errors.extend(outcome.error);
		}

		record.spec.resources = owned.into_iter().collect();
		match cancellable(cancel, persist(&mut record, access.as_ref(), opts)).await {
			Ok(()) => {}
			Err(Error::Cancelled) => return Err(Error::Cancelled),
			Err(e) => errors.push(Error::at(Step::PersistInstance, &self.name, e)),
		}

		errors.into_result()
	}

	/// Delete the `Instance` object with foreground propagation.
	///
	/// The garbage collector removes every resource still carrying the
	/// instance's owner reference. An instance that is already gone counts
	/// as deleted.
	#[instrument(skip_all, fields(instance = %self.name))]
	async fn delete<A: ResourceAccess>(
		&self,
		access: &Arc<A>,
		opts: &MetaOptions,
		cancel: &CancellationToken,
	) -> Result<(), Error> {
		let mut record = self.record.lock().await;
		let opts = opts.clone().with_propagation(PropagationPolicy::Foreground);
		let instance = record.to_manifest()?;

		match cancellable(cancel, instance.delete(access.as_ref(), &opts)).await {
			Ok(()) => {}
			Err(e) if e.is_not_found() => debug!("instance already absent"),
			Err(e) => return Err(Error::at(Step::DeleteInstance, &self.name, e)),
		}

		record.spec.resources.clear();
		self.desired().clear();
		Ok(())
	}

	fn add(&self, manifest: Manifest) {
		hold(&mut self.desired(), manifest);
	}

	fn remove(&self, manifest: &Manifest) {
		self.desired().remove(&manifest.id());
	}

	fn manifests(&self) -> Vec<Manifest> {
		self.desired().values().cloned().collect()
	}
}
