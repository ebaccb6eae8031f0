//! Common test utilities.

use std::{
	collections::{BTreeMap, HashMap, HashSet},
	sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use kube::{api::PropagationPolicy, core::GroupVersionKind, discovery::ApiResource};

use crate::{
	k8s::{discovery::DiscoveryError, AccessError, Endpoint, ResourceAccess, ResourceScope},
	manifest::{Id, Manifest},
	options::MetaOptions,
};

/// Storage key: group, kind, namespace, name. Versions share storage.
type ObjectKey = (String, String, String, String);

/// An in-memory cluster implementing [`ResourceAccess`].
///
/// Discovery is modelled as two tables: kinds the server has `registered`
/// and kinds the client currently `served` from its cache. Registering a
/// kind (directly or by applying a CustomResourceDefinition) only becomes
/// visible to `resolve` after the next `invalidate`.
pub struct FakeCluster {
	state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
	registered: HashMap<GroupVersionKind, Endpoint>,
	served: HashMap<GroupVersionKind, Endpoint>,
	objects: BTreeMap<ObjectKey, Manifest>,
	rejected: HashSet<String>,
	invalidations: usize,
	next_uid: usize,
	unreachable_groups: HashSet<String>,
}

fn endpoint(api_version: &str, kind: &str, plural: &str, scope: ResourceScope) -> Endpoint {
	let id = Id::new(api_version, kind, "", "");
	Endpoint {
		api_resource: ApiResource::from_gvk_with_plural(&id.gvk(), plural),
		scope,
	}
}

impl FakeCluster {
	/// A cluster serving a handful of core kinds plus CRDs and Instances.
	pub fn new() -> Self {
		Self::empty()
			.with_kind("v1", "Namespace", "namespaces", ResourceScope::ClusterWide)
			.with_kind("v1", "ConfigMap", "configmaps", ResourceScope::Namespaced)
			.with_kind("v1", "Secret", "secrets", ResourceScope::Namespaced)
			.with_kind("v1", "Service", "services", ResourceScope::Namespaced)
			.with_kind("apps/v1", "Deployment", "deployments", ResourceScope::Namespaced)
			.with_kind(
				"apiextensions.k8s.io/v1",
				"CustomResourceDefinition",
				"customresourcedefinitions",
				ResourceScope::ClusterWide,
			)
			.with_kind(
				crate::instance::API_VERSION,
				crate::instance::KIND,
				crate::instance::PLURAL,
				ResourceScope::ClusterWide,
			)
	}

	/// A cluster serving no kinds at all.
	pub fn empty() -> Self {
		Self {
			state: Mutex::new(FakeState::default()),
		}
	}

	/// Serve a kind immediately.
	pub fn with_kind(self, api_version: &str, kind: &str, plural: &str, scope: ResourceScope) -> Self {
		{
			let mut state = self.state();
			let endpoint = endpoint(api_version, kind, plural, scope);
			let gvk = Id::new(api_version, kind, "", "").gvk();
			state.registered.insert(gvk.clone(), endpoint.clone());
			state.served.insert(gvk, endpoint);
		}
		self
	}

	/// Register a kind server-side; clients see it after their next invalidation.
	pub fn register_kind(&self, api_version: &str, kind: &str, plural: &str, scope: ResourceScope) {
		let gvk = Id::new(api_version, kind, "", "").gvk();
		self.state()
			.registered
			.insert(gvk, endpoint(api_version, kind, plural, scope));
	}

	/// Fail resolution of every kind in `group` with a discovery error until
	/// the next invalidation.
	pub fn break_discovery(&self, group: &str) {
		self.state().unreachable_groups.insert(group.to_string());
	}

	/// Make every write to objects called `name` fail.
	pub fn reject(&self, name: &str) {
		self.state().rejected.insert(name.to_string());
	}

	/// Store a live copy of `manifest`, bypassing the API.
	pub fn seed(&self, manifest: Manifest) -> Manifest {
		let mut state = self.state();
		let key = state.key_for(&manifest.id());
		state.store(key, manifest)
	}

	pub fn object(&self, id: &Id) -> Option<Manifest> {
		let state = self.state();
		let key = state.key_for(id);
		state.objects.get(&key).cloned()
	}

	pub fn len(&self) -> usize {
		self.state().objects.len()
	}

	pub fn invalidations(&self) -> usize {
		self.state().invalidations
	}

	fn state(&self) -> MutexGuard<'_, FakeState> {
		self.state.lock().unwrap()
	}
}

impl FakeState {
	/// Key for an id, applying the default namespace to namespaced kinds.
	fn key_for(&self, id: &Id) -> ObjectKey {
		let namespaced = self
			.registered
			.values()
			.find(|e| e.api_resource.group == id.group && e.api_resource.kind == id.kind)
			.is_some_and(|e| e.scope == ResourceScope::Namespaced);
		let namespace = match (namespaced, id.namespace.as_str()) {
			(true, "") => "default".to_string(),
			(true, ns) => ns.to_string(),
			(false, _) => String::new(),
		};
		(id.group.clone(), id.kind.clone(), namespace, id.name.clone())
	}

	fn store(&mut self, key: ObjectKey, mut manifest: Manifest) -> Manifest {
		let previous = self.objects.get(&key);
		let uid = match previous.and_then(|p| p.metadata.uid.clone()) {
			Some(uid) => uid,
			None => {
				self.next_uid += 1;
				format!("uid-{}", self.next_uid)
			}
		};
		let version = previous
			.and_then(|p| p.metadata.resource_version.as_deref())
			.and_then(|rv| rv.parse::<u64>().ok())
			.unwrap_or(0)
			+ 1;

		manifest.metadata.uid = Some(uid);
		manifest.metadata.resource_version = Some(version.to_string());
		if !key.2.is_empty() {
			manifest.metadata.namespace = Some(key.2.clone());
		}
		self.objects.insert(key, manifest.clone());
		manifest
	}

	/// Register the kinds served by an applied CustomResourceDefinition.
	fn register_definition(&mut self, crd: &Manifest) {
		let Some(spec) = crd.body.get("spec") else {
			return;
		};
		let group = spec["group"].as_str().unwrap_or_default();
		let kind = spec["names"]["kind"].as_str().unwrap_or_default();
		let plural = spec["names"]["plural"].as_str().unwrap_or_default();
		let scope = match spec["scope"].as_str() {
			Some("Namespaced") => ResourceScope::Namespaced,
			_ => ResourceScope::ClusterWide,
		};
		for version in spec["versions"].as_array().into_iter().flatten() {
			let version = version["name"].as_str().unwrap_or_default();
			let api_version = format!("{group}/{version}");
			let gvk = GroupVersionKind::gvk(group, version, kind);
			self.registered
				.insert(gvk, endpoint(&api_version, kind, plural, scope));
		}
	}

	/// Remove an object and, unless orphaned, everything it owns.
	fn remove(&mut self, key: &ObjectKey, policy: Option<&PropagationPolicy>) {
		let Some(removed) = self.objects.remove(key) else {
			return;
		};
		if matches!(policy, Some(PropagationPolicy::Orphan)) {
			return;
		}

		let mut owners: Vec<String> = removed.metadata.uid.into_iter().collect();
		while let Some(owner) = owners.pop() {
			let dependents: Vec<ObjectKey> = self
				.objects
				.iter()
				.filter(|(_, m)| {
					m.metadata
						.owner_references
						.iter()
						.flatten()
						.any(|r| r.uid == owner)
				})
				.map(|(k, _)| k.clone())
				.collect();
			for dependent in dependents {
				if let Some(m) = self.objects.remove(&dependent) {
					owners.extend(m.metadata.uid);
				}
			}
		}
	}
}

fn object_key(endpoint: &Endpoint, namespace: Option<&str>, name: &str) -> ObjectKey {
	(
		endpoint.api_resource.group.clone(),
		endpoint.api_resource.kind.clone(),
		namespace.unwrap_or_default().to_string(),
		name.to_string(),
	)
}

#[async_trait]
impl ResourceAccess for FakeCluster {
	async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Endpoint, AccessError> {
		let state = self.state();
		if state.unreachable_groups.contains(&gvk.group) {
			return Err(AccessError::Discovery(Box::new(DiscoveryError::FullDiscovery(
				kube::Error::Service("connection refused".into()),
			))));
		}
		state
			.served
			.get(gvk)
			.cloned()
			.ok_or_else(|| AccessError::Unresolved {
				api_version: gvk.api_version(),
				kind: gvk.kind.clone(),
			})
	}

	async fn get(
		&self,
		endpoint: &Endpoint,
		namespace: Option<&str>,
		name: &str,
		_opts: &MetaOptions,
	) -> Result<Manifest, AccessError> {
		self.state()
			.objects
			.get(&object_key(endpoint, namespace, name))
			.cloned()
			.ok_or(AccessError::NotFound)
	}

	async fn patch(
		&self,
		endpoint: &Endpoint,
		namespace: Option<&str>,
		name: &str,
		body: &serde_json::Value,
		opts: &MetaOptions,
	) -> Result<Manifest, AccessError> {
		let mut state = self.state();
		if state.rejected.contains(name) {
			return Err(AccessError::Remote("admission webhook denied the request".into()));
		}

		let manifest: Manifest = serde_json::from_value(body.clone())
			.map_err(|e| AccessError::Remote(Box::new(e)))?;
		let key = object_key(endpoint, namespace, name);

		if opts.is_dry_run() {
			let mut preview = manifest;
			preview.metadata.uid = state.objects.get(&key).and_then(|m| m.metadata.uid.clone());
			return Ok(preview);
		}

		if manifest.kind == "CustomResourceDefinition" {
			state.register_definition(&manifest);
		}
		Ok(state.store(key, manifest))
	}

	async fn delete(
		&self,
		endpoint: &Endpoint,
		namespace: Option<&str>,
		name: &str,
		opts: &MetaOptions,
	) -> Result<(), AccessError> {
		let mut state = self.state();
		let key = object_key(endpoint, namespace, name);
		if state.rejected.contains(name) {
			return Err(AccessError::Remote("deletion forbidden".into()));
		}
		if !state.objects.contains_key(&key) {
			return Err(AccessError::NotFound);
		}
		if !opts.is_dry_run() {
			state.remove(&key, opts.propagation_policy.as_ref());
		}
		Ok(())
	}

	async fn invalidate(&self) {
		let mut state = self.state();
		state.served = state.registered.clone();
		state.unreachable_groups.clear();
		state.invalidations += 1;
	}

	fn default_namespace(&self) -> &str {
		"default"
	}
}
