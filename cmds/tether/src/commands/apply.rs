//! Apply command handler.
//!
//! Loads manifests, groups them into instances and commits each one. With
//! `--flat` the whole set is applied as a single release instead, without
//! ownership tracking or pruning.

use std::{io::Write, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use super::util::{cancel_on_interrupt, load_manifests, runtime, ClusterArgs};
use crate::{
	error::{display_chain, Error},
	instance::{split, Instance},
	k8s::ResourceAccess,
	manifest::Manifest,
	options::MetaOptions,
	release::Release,
};

#[derive(Args)]
pub struct ApplyArgs {
	/// Manifest files or directories
	#[arg(required = true)]
	pub paths: Vec<PathBuf>,

	#[command(flatten)]
	pub cluster: ClusterArgs,

	/// Apply everything as one release, without instance tracking or pruning
	#[arg(long)]
	pub flat: bool,
}

/// Run the apply command.
pub fn run<W: Write>(args: ApplyArgs, writer: W) -> Result<()> {
	let manifests = load_manifests(&args.paths)?;
	runtime()?.block_on(run_async(args, manifests, writer))
}

async fn run_async<W: Write>(args: ApplyArgs, manifests: Vec<Manifest>, writer: W) -> Result<()> {
	let (_connection, access) = args.cluster.connect().await?;
	let access = Arc::new(access);
	let opts = args.cluster.meta_options();
	let cancel = cancel_on_interrupt();

	if args.flat {
		let release = Release::new(args.cluster.context.clone(), manifests);
		apply_release(&access, &release, &opts, &cancel, writer).await
	} else {
		apply_instances(&access, manifests, &opts, &cancel, writer).await
	}
}

/// Apply a flat release, printing every applied object.
#[instrument(skip_all)]
pub async fn apply_release<A: ResourceAccess, W: Write>(
	access: &Arc<A>,
	release: &Release,
	opts: &MetaOptions,
	cancel: &CancellationToken,
	mut writer: W,
) -> Result<()> {
	let applied = release
		.apply(access, opts, cancel)
		.await
		.context("applying release")?;
	for manifest in &applied {
		writeln!(writer, "{} applied{}", manifest.id(), opts.dry_run_suffix())?;
	}
	Ok(())
}

/// Commit every instance found in `manifests`, one after the other.
///
/// A failing instance does not stop the others; the command fails once all
/// of them have been attempted.
#[instrument(skip_all, fields(manifests = manifests.len()))]
pub async fn apply_instances<A: ResourceAccess, W: Write>(
	access: &Arc<A>,
	manifests: Vec<Manifest>,
	opts: &MetaOptions,
	cancel: &CancellationToken,
	mut writer: W,
) -> Result<()> {
	let instances = split(manifests);
	info!(instances = instances.len(), "committing instances");

	let mut failed = 0;
	for instance in &instances {
		let count = instance.manifests().len();
		match instance.commit(access, opts, cancel).await {
			Ok(()) => writeln!(
				writer,
				"instance {instance} committed, {count} resources{}",
				opts.dry_run_suffix()
			)?,
			Err(Error::Cancelled) => anyhow::bail!("cancelled"),
			Err(e) => {
				error!("instance {instance} failed: {}", display_chain(&e));
				failed += 1;
			}
		}
	}

	if failed > 0 {
		anyhow::bail!("{failed} of {} instances failed to commit", instances.len());
	}
	Ok(())
}
