//! Served API resources of the mock server.
//!
//! The set is mutable: applying a `CustomResourceDefinition` registers the
//! kinds it declares, so a client only sees them after rediscovering.

use std::collections::BTreeMap;

use serde_json::{json, Value};

/// Discovery mode for the mock server.
#[derive(Clone, Copy, Debug, Default)]
pub enum DiscoveryMode {
	/// Support aggregated discovery (APIGroupDiscoveryList).
	#[default]
	Aggregated,
	/// Return 406 for aggregated discovery, forcing fallback to legacy endpoints.
	Legacy,
}

const VERBS: [&str; 7] = ["create", "delete", "get", "list", "patch", "update", "watch"];

/// A mock API resource definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockApiResource {
	pub name: String,
	pub kind: String,
	pub namespaced: bool,
}

impl MockApiResource {
	pub fn namespaced(name: &str, kind: &str) -> Self {
		Self {
			name: name.to_string(),
			kind: kind.to_string(),
			namespaced: true,
		}
	}

	pub fn cluster_scoped(name: &str, kind: &str) -> Self {
		Self {
			name: name.to_string(),
			kind: kind.to_string(),
			namespaced: false,
		}
	}

	fn aggregated(&self, group: &str, version: &str) -> Value {
		json!({
			"resource": self.name,
			"responseKind": {
				"group": group,
				"version": version,
				"kind": self.kind,
			},
			"scope": if self.namespaced { "Namespaced" } else { "Cluster" },
			"verbs": VERBS,
		})
	}

	fn legacy(&self) -> Value {
		json!({
			"name": self.name,
			"singularName": "",
			"namespaced": self.namespaced,
			"kind": self.kind,
			"verbs": VERBS,
		})
	}
}

/// Resources served by the mock, keyed by group version (`v1` for core).
#[derive(Clone, Debug)]
pub struct MockDiscovery {
	pub core_resources: Vec<MockApiResource>,
	pub group_resources: BTreeMap<String, Vec<MockApiResource>>,
}

impl Default for MockDiscovery {
	fn default() -> Self {
		Self {
			core_resources: vec![
				MockApiResource::namespaced("configmaps", "ConfigMap"),
				MockApiResource::namespaced("secrets", "Secret"),
				MockApiResource::namespaced("services", "Service"),
				MockApiResource::namespaced("pods", "Pod"),
				MockApiResource::cluster_scoped("namespaces", "Namespace"),
			],
			group_resources: BTreeMap::from([
				(
					"apps/v1".to_string(),
					vec![
						MockApiResource::namespaced("deployments", "Deployment"),
						MockApiResource::namespaced("statefulsets", "StatefulSet"),
						MockApiResource::namespaced("daemonsets", "DaemonSet"),
					],
				),
				(
					"apiextensions.k8s.io/v1".to_string(),
					vec![MockApiResource::cluster_scoped(
						"customresourcedefinitions",
						"CustomResourceDefinition",
					)],
				),
			]),
		}
	}
}

impl MockDiscovery {
	/// Serve additional resources under a group version such as `example.com/v1`.
	pub fn with_group(mut self, group_version: &str, resources: Vec<MockApiResource>) -> Self {
		self.register(group_version, resources);
		self
	}

	/// Add resources, replacing any already served under the same kind.
	pub fn register(&mut self, group_version: &str, resources: Vec<MockApiResource>) {
		let served = if group_version.contains('/') {
			self.group_resources
				.entry(group_version.to_string())
				.or_default()
		} else {
			&mut self.core_resources
		};
		for resource in resources {
			served.retain(|r| r.kind != resource.kind);
			served.push(resource);
		}
	}

	/// Register every served version declared by a `CustomResourceDefinition` body.
	///
	/// Returns false if the body is not a definition this server understands.
	pub fn register_definition(&mut self, crd: &Value) -> bool {
		let Some(spec) = crd.get("spec") else {
			return false;
		};
		let (Some(group), Some(plural), Some(kind)) = (
			spec.get("group").and_then(Value::as_str),
			spec.pointer("/names/plural").and_then(Value::as_str),
			spec.pointer("/names/kind").and_then(Value::as_str),
		) else {
			return false;
		};
		let namespaced = spec.get("scope").and_then(Value::as_str) != Some("Cluster");
		let versions = spec
			.get("versions")
			.and_then(Value::as_array)
			.map(Vec::as_slice)
			.unwrap_or_default();

		let mut registered = false;
		for version in versions {
			if version.get("served").and_then(Value::as_bool) == Some(false) {
				continue;
			}
			let Some(name) = version.get("name").and_then(Value::as_str) else {
				continue;
			};
			let resource = if namespaced {
				MockApiResource::namespaced(plural, kind)
			} else {
				MockApiResource::cluster_scoped(plural, kind)
			};
			self.register(&format!("{group}/{name}"), vec![resource]);
			registered = true;
		}
		registered
	}

	/// Find the resource serving `kind` in `api_version`.
	pub fn lookup(&self, api_version: &str, kind: &str) -> Option<&MockApiResource> {
		let served = if api_version.contains('/') {
			self.group_resources.get(api_version)?
		} else if api_version == "v1" {
			&self.core_resources
		} else {
			return None;
		};
		served.iter().find(|r| r.kind == kind)
	}

	/// Find the resource with plural `name` in `group_version`.
	pub fn lookup_plural(&self, group_version: &str, name: &str) -> Option<&MockApiResource> {
		let served = if group_version.contains('/') {
			self.group_resources.get(group_version)?
		} else {
			&self.core_resources
		};
		served.iter().find(|r| r.name == name)
	}

	/// Body of `/api` for aggregated discovery.
	pub(crate) fn aggregated_core(&self) -> Value {
		let resources: Vec<_> = self
			.core_resources
			.iter()
			.map(|r| r.aggregated("", "v1"))
			.collect();
		json!({
			"kind": "APIGroupDiscoveryList",
			"apiVersion": "apidiscovery.k8s.io/v2",
			"items": [{
				"metadata": { "name": "" },
				"versions": [{
					"version": "v1",
					"resources": resources,
					"freshness": "Current",
				}],
			}],
		})
	}

	/// Body of `/apis` for aggregated discovery.
	pub(crate) fn aggregated_groups(&self) -> Value {
		let mut groups: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
		for (gv, resources) in &self.group_resources {
			let (group, version) = split_group_version(gv);
			let resources: Vec<_> = resources
				.iter()
				.map(|r| r.aggregated(group, version))
				.collect();
			groups.entry(group).or_default().push(json!({
				"version": version,
				"resources": resources,
				"freshness": "Current",
			}));
		}

		let items: Vec<_> = groups
			.into_iter()
			.map(|(group, versions)| {
				json!({
					"metadata": { "name": group },
					"versions": versions,
				})
			})
			.collect();
		json!({
			"kind": "APIGroupDiscoveryList",
			"apiVersion": "apidiscovery.k8s.io/v2",
			"items": items,
		})
	}

	/// Body of `/apis` for legacy discovery.
	pub(crate) fn group_list(&self) -> Value {
		let mut groups: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
		for gv in self.group_resources.keys() {
			let (group, version) = split_group_version(gv);
			groups
				.entry(group)
				.or_default()
				.push(json!({ "groupVersion": gv, "version": version }));
		}

		let groups: Vec<_> = groups
			.into_iter()
			.map(|(name, versions)| {
				let preferred = versions[0].clone();
				json!({
					"name": name,
					"versions": versions,
					"preferredVersion": preferred,
				})
			})
			.collect();
		json!({
			"kind": "APIGroupList",
			"apiVersion": "v1",
			"groups": groups,
		})
	}

	/// Body of `/api/v1` or `/apis/{group}/{version}` for legacy discovery.
	pub(crate) fn resource_list(&self, group_version: &str) -> Option<Value> {
		let served = if group_version == "v1" {
			&self.core_resources
		} else {
			self.group_resources.get(group_version)?
		};
		let resources: Vec<_> = served.iter().map(MockApiResource::legacy).collect();
		Some(json!({
			"kind": "APIResourceList",
			"apiVersion": "v1",
			"groupVersion": group_version,
			"resources": resources,
		}))
	}
}

fn split_group_version(gv: &str) -> (&str, &str) {
	gv.split_once('/').unwrap_or(("", gv))
}
