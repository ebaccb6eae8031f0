//! Flat batch apply with discovery refresh between passes.
//!
//! A release applies a set of objects without instance tracking. Objects
//! whose kind is not served yet (typically custom resources whose definition
//! is part of the same batch) are retried on the next pass, after the
//! discovery cache has been dropped. A pass that resolves nothing new ends
//! the loop with [`Error::Deadlock`].

use std::{cmp::Ordering, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
	error::{Error, Errors, Step},
	fanout::fan_out,
	k8s::ResourceAccess,
	manifest::Manifest,
	options::MetaOptions,
};

/// One apply run.
#[derive(Debug, Clone, Default)]
pub struct Release {
	/// Kubeconfig context the release targets, `None` for the ambient one.
	pub context: Option<String>,
	objects: Vec<Manifest>,
}

/// Kinds other objects commonly depend on sort first.
fn kind_rank(kind: &str) -> u8 {
	match kind {
		"Namespace" => 0,
		"CustomResourceDefinition" => 1,
		_ => 2,
	}
}

fn apply_order(a: &Manifest, b: &Manifest) -> Ordering {
	kind_rank(&a.kind)
		.cmp(&kind_rank(&b.kind))
		.then_with(|| a.namespace().cmp(b.namespace()))
		.then_with(|| a.name().cmp(b.name()))
}

/// Stable sort: namespaces, then definitions, then by namespace and name.
pub fn sort_objects(objects: &mut [Manifest]) {
	objects.sort_by(apply_order);
}

impl Release {
	pub fn new(context: Option<String>, mut objects: Vec<Manifest>) -> Self {
		sort_objects(&mut objects);
		Self { context, objects }
	}

	/// Objects in apply order.
	pub fn objects(&self) -> &[Manifest] {
		&self.objects
	}

	/// Apply every object, retrying unresolved kinds while passes make progress.
	///
	/// Returns the server's version of every applied object, in apply order.
	/// Failures other than resolution are not retried; they are reported
	/// together once no object is left to retry.
	#[instrument(skip_all, fields(context = self.context.as_deref().unwrap_or("<current>"), objects = self.objects.len()))]
	pub async fn apply<A: ResourceAccess>(
		&self,
		access: &Arc<A>,
		opts: &MetaOptions,
		cancel: &CancellationToken,
	) -> Result<Vec<Manifest>, Error> {
		let mut todo = self.objects.clone();
		let mut applied = Vec::with_capacity(todo.len());
		let mut fatal = Errors::new();
		let mut pass = 0usize;

		loop {
			pass += 1;
			// Pick up kinds registered by the previous pass.
			access.invalidate().await;

			let attempted = todo.len();
			debug!(pass, attempted, "starting apply pass");
			let results = fan_out(todo, cancel, |manifest: Manifest| {
				let access = Arc::clone(access);
				let opts = opts.clone();
				async move {
					let result = manifest.patch(access.as_ref(), &opts).await;
					(manifest, result)
				}
			})
			.await?;

			let mut deferred = Vec::new();
			let mut unresolved = Errors::new();
			for (manifest, result) in results {
				match result {
					Ok(live) => applied.push(live),
					Err(e @ Error::Resolution { .. }) => {
						warn!("{} is not served yet, retrying later", manifest.id());
						deferred.push(manifest);
						unresolved.push(e);
					}
					Err(e) => fatal.push(Error::at(Step::ApplyManifest, manifest.id(), e)),
				}
			}

			if deferred.is_empty() {
				break;
			}

			if deferred.len() >= attempted {
				let deadlock = Error::Deadlock {
					remaining: deferred.len(),
					source: unresolved,
				};
				if fatal.is_empty() {
					return Err(deadlock);
				}
				fatal.push(deadlock);
				return Err(Error::Multiple(fatal));
			}

			sort_objects(&mut deferred);
			todo = deferred;
		}

		fatal.into_result()?;
		sort_objects(&mut applied);
		Ok(applied)
	}
}
