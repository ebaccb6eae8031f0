//! Delete command handler.

use std::{io::Write, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::util::{cancel_on_interrupt, load_manifests, runtime, ClusterArgs};
use crate::{
	error::{display_chain, Error},
	instance::{split, AnyInstance, Instance, Named},
	k8s::ResourceAccess,
	options::MetaOptions,
};

#[derive(Args)]
pub struct DeleteArgs {
	/// Manifest files or directories; every instance found in them is deleted
	pub paths: Vec<PathBuf>,

	/// Name of an instance to delete, may be repeated
	#[arg(short = 'i', long = "instance", required_unless_present = "paths")]
	pub instances: Vec<String>,

	#[command(flatten)]
	pub cluster: ClusterArgs,
}

/// Run the delete command.
pub fn run<W: Write>(args: DeleteArgs, writer: W) -> Result<()> {
	let manifests = load_manifests(&args.paths)?;
	let mut instances = split(manifests);
	instances.extend(args.instances.iter().map(|name| AnyInstance::Named(Named::new(name.as_str()))));

	runtime()?.block_on(async {
		let (_connection, access) = args.cluster.connect().await?;
		let cancel = cancel_on_interrupt();
		delete_instances(&Arc::new(access), &instances, &args.cluster.meta_options(), &cancel, writer).await
	})
}

/// Delete instances one after the other.
///
/// Named instances are removed through their `Instance` object and the
/// garbage collector; orphan manifests are deleted one by one. Deletion
/// policies are respected in both cases.
pub async fn delete_instances<A: ResourceAccess, W: Write>(
	access: &Arc<A>,
	instances: &[AnyInstance],
	opts: &MetaOptions,
	cancel: &CancellationToken,
	mut writer: W,
) -> Result<()> {
	let mut failed = 0;
	for instance in instances {
		match instance.delete(access, opts, cancel).await {
			Ok(()) => writeln!(writer, "instance {instance} deleted{}", opts.dry_run_suffix())?,
			Err(Error::Cancelled) => anyhow::bail!("cancelled"),
			Err(e) => {
				error!("instance {instance} failed: {}", display_chain(&e));
				failed += 1;
			}
		}
	}

	if failed > 0 {
		anyhow::bail!("{failed} of {} instances failed to delete", instances.len());
	}
	writer.flush().context("flushing output")
}
