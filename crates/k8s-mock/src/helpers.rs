//! Helper functions for mock Kubernetes testing.

use serde_json::{json, Value};

/// Parse a Kubernetes API path into (collection path, resource name).
///
/// Examples:
/// - `/api/v1/namespaces/default/configmaps/my-config` -> (`/api/v1/namespaces/default/configmaps`, `my-config`)
/// - `/apis/apps/v1/namespaces/default/deployments/my-deploy` -> (`/apis/apps/v1/namespaces/default/deployments`, `my-deploy`)
/// - `/api/v1/namespaces/my-ns` -> (`/api/v1/namespaces`, `my-ns`)
pub fn parse_resource_path(path: &str) -> (String, String) {
	let path = path.trim_end_matches('/');
	match path.rsplit_once('/') {
		Some((collection, name)) => (collection.to_string(), name.to_string()),
		None => (path.to_string(), String::new()),
	}
}

/// Namespace segment of a namespaced collection path.
///
/// `/api/v1/namespaces` itself is the cluster-scoped namespace collection.
pub fn namespace_of(collection: &str) -> Option<&str> {
	let (_, rest) = collection.split_once("/namespaces/")?;
	let (namespace, _) = rest.split_once('/')?;
	Some(namespace)
}

/// Group version of a collection path (`v1`, `apps/v1`).
pub fn group_version_of(collection: &str) -> Option<String> {
	let mut segments = collection.trim_start_matches('/').split('/');
	match segments.next()? {
		"api" => segments.next().map(str::to_string),
		"apis" => {
			let group = segments.next()?;
			let version = segments.next()?;
			Some(format!("{group}/{version}"))
		}
		_ => None,
	}
}

/// Plural resource name of a collection path.
pub fn plural_of(collection: &str) -> Option<&str> {
	collection.rsplit('/').next().filter(|s| !s.is_empty())
}

/// Collection path serving `plural` in `api_version`.
pub fn collection_path(api_version: &str, plural: &str, namespace: Option<&str>) -> String {
	let root = if api_version.contains('/') { "apis" } else { "api" };
	match namespace {
		Some(ns) => format!("/{root}/{api_version}/namespaces/{ns}/{plural}"),
		None => format!("/{root}/{api_version}/{plural}"),
	}
}

/// Whether the request query asks for a server-side dry run.
pub fn is_dry_run(query: Option<&str>) -> bool {
	query.is_some_and(|q| q.split('&').any(|pair| pair.starts_with("dryRun=")))
}

/// Value of the `resourceVersion` query parameter, if any.
pub fn requested_version(query: Option<&str>) -> Option<&str> {
	query?
		.split('&')
		.find_map(|pair| pair.strip_prefix("resourceVersion="))
}

/// Owner uids listed in an object's `metadata.ownerReferences`.
pub fn owner_uids(object: &Value) -> impl Iterator<Item = &str> {
	object
		.pointer("/metadata/ownerReferences")
		.and_then(Value::as_array)
		.into_iter()
		.flatten()
		.filter_map(|owner| owner.get("uid").and_then(Value::as_str))
}

/// A failure `Status` body, as returned by the API server.
pub fn status(code: u16, reason: &str, message: impl Into<String>) -> Value {
	json!({
		"kind": "Status",
		"apiVersion": "v1",
		"metadata": {},
		"status": "Failure",
		"message": message.into(),
		"reason": reason,
		"code": code,
	})
}
