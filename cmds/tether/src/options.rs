//! Request options shared by every get, patch and delete call.

use kube::api::{DeleteParams, GetParams, PatchParams, Preconditions, PropagationPolicy};

/// Field manager attributed with every field this engine applies.
pub const FIELD_MANAGER: &str = "tether";

/// Options bundle forwarded to the API server.
///
/// Dry-run is purely a property of this bundle: the same code paths run,
/// the server just does not persist the writes.
#[derive(Debug, Clone)]
pub struct MetaOptions {
	/// Server dry-run stages, `["All"]` when enabled.
	pub dry_run: Vec<String>,
	pub force: Option<bool>,
	pub field_manager: String,
	/// Reads return a version no older than this one; deletes require it.
	pub resource_version: Option<String>,
	pub grace_period_seconds: Option<u32>,
	pub preconditions: Option<Preconditions>,
	pub propagation_policy: Option<PropagationPolicy>,
}

impl Default for MetaOptions {
	fn default() -> Self {
		Self {
			dry_run: Vec::new(),
			force: None,
			field_manager: FIELD_MANAGER.to_string(),
			resource_version: None,
			grace_period_seconds: None,
			preconditions: None,
			propagation_policy: None,
		}
	}
}

impl MetaOptions {
	/// Enable server-side dry-run for every stage.
	#[must_use]
	pub fn dry_run(mut self) -> Self {
		self.dry_run = vec!["All".to_string()];
		self
	}

	#[must_use]
	pub fn force(mut self, force: bool) -> Self {
		self.force = Some(force);
		self
	}

	#[must_use]
	pub fn with_propagation(mut self, policy: PropagationPolicy) -> Self {
		self.propagation_policy = Some(policy);
		self
	}

	pub fn is_dry_run(&self) -> bool {
		!self.dry_run.is_empty()
	}

	/// Suffix appended to user-facing action lines.
	pub fn dry_run_suffix(&self) -> &'static str {
		if self.is_dry_run() {
			" (dry-run)"
		} else {
			""
		}
	}

	pub fn get_params(&self) -> GetParams {
		GetParams {
			resource_version: self.resource_version.clone(),
		}
	}

	pub fn patch_params(&self) -> PatchParams {
		PatchParams {
			dry_run: self.is_dry_run(),
			force: self.force.unwrap_or(false),
			field_manager: Some(self.field_manager.clone()),
			..Default::default()
		}
	}

	pub fn delete_params(&self) -> DeleteParams {
		let preconditions = self.preconditions.clone().or_else(|| {
			self.resource_version.as_ref().map(|rv| Preconditions {
				resource_version: Some(rv.clone()),
				uid: None,
			})
		});

		DeleteParams {
			dry_run: self.is_dry_run(),
			grace_period_seconds: self.grace_period_seconds,
			propagation_policy: self.propagation_policy.clone(),
			preconditions,
			..Default::default()
		}
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;

	use super::*;

	#[test]
	fn test_default_uses_engine_field_manager() {
		let opts = MetaOptions::default();
		assert!(!opts.is_dry_run());

		let params = opts.patch_params();
		assert_eq!(params.field_manager.as_deref(), Some(FIELD_MANAGER));
		assert!(!params.dry_run);
		assert!(!params.force);
	}

	#[test]
	fn test_dry_run_reaches_every_request() {
		let opts = MetaOptions::default().dry_run().force(true);
		assert_eq!(opts.dry_run, vec!["All".to_string()]);
		assert_eq!(opts.dry_run_suffix(), " (dry-run)");
		assert!(opts.patch_params().dry_run);
		assert!(opts.patch_params().force);
		assert!(opts.delete_params().dry_run);
	}

	#[test]
	fn test_resource_version_reaches_get() {
		assert_eq!(MetaOptions::default().get_params().resource_version, None);

		let opts = MetaOptions {
			resource_version: Some("42".to_string()),
			..MetaOptions::default()
		};
		assert_eq!(opts.get_params().resource_version.as_deref(), Some("42"));
	}

	#[test]
	fn test_delete_params() {
		let opts = MetaOptions {
			resource_version: Some("42".to_string()),
			grace_period_seconds: Some(5),
			..MetaOptions::default()
		}
		.with_propagation(PropagationPolicy::Foreground);

		let params = opts.delete_params();
		assert_eq!(params.grace_period_seconds, Some(5));
		assert_matches!(params.propagation_policy, Some(PropagationPolicy::Foreground));
		assert_eq!(
			params.preconditions.and_then(|p| p.resource_version),
			Some("42".to_string())
		);
	}
}
