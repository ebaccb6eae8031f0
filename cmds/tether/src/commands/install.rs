//! Install command handler.

use std::io::Write;

use anyhow::{Context, Result};
use clap::Args;

use super::util::{runtime, ClusterArgs};
use crate::instance::crd;

#[derive(Args)]
pub struct InstallArgs {
	#[command(flatten)]
	pub cluster: ClusterArgs,
}

/// Install or update the `Instance` definition.
pub fn run<W: Write>(args: InstallArgs, mut writer: W) -> Result<()> {
	let opts = args.cluster.meta_options();
	let definition = runtime()?.block_on(async {
		let (_connection, access) = args.cluster.connect().await?;
		crd::install(&access, &opts)
			.await
			.context("installing the Instance definition")
	})?;

	writeln!(writer, "{} installed{}", definition.id(), opts.dry_run_suffix())?;
	Ok(())
}
