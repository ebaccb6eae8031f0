//! The `Instance` CustomResourceDefinition.

use serde_json::json;
use tracing::instrument;

use super::{GROUP, KIND, PLURAL, VERSION};
use crate::{error::Error, k8s::ResourceAccess, manifest::Manifest, options::MetaOptions};

/// Definition registering `instances.tether.dev`.
///
/// The schema mirrors [`super::InstanceSpec`]: a list of resource ids, each
/// requiring group, version, kind and name.
pub fn instance_definition() -> Result<Manifest, Error> {
	let id_schema = json!({
		"type": "object",
		"required": ["group", "version", "kind", "name"],
		"properties": {
			"group": {"type": "string"},
			"version": {"type": "string"},
			"kind": {"type": "string"},
			"namespace": {"type": "string"},
			"name": {"type": "string"},
		},
	});

	Manifest::from_value(json!({
		"apiVersion": "apiextensions.k8s.io/v1",
		"kind": "CustomResourceDefinition",
		"metadata": {"name": format!("{PLURAL}.{GROUP}")},
		"spec": {
			"group": GROUP,
			"scope": "Cluster",
			"names": {
				"plural": PLURAL,
				"singular": "instance",
				"kind": KIND,
				"shortNames": ["inst"],
			},
			"versions": [{
				"name": VERSION,
				"served": true,
				"storage": true,
				"schema": {
					"openAPIV3Schema": {
						"type": "object",
						"properties": {
							"spec": {
								"type": "object",
								"properties": {
									"resources": {"type": "array", "items": id_schema},
								},
							},
						},
					},
				},
			}],
		},
	}))
}

/// Install or update the definition with server-side apply.
#[instrument(skip_all)]
pub async fn install<A: ResourceAccess>(access: &A, opts: &MetaOptions) -> Result<Manifest, Error> {
	instance_definition()?.patch(access, opts).await
}
