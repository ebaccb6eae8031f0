//! Helpers shared by command handlers.

use std::{
	fs,
	io::{self, ErrorKind, Write},
	path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::Args;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::{
	k8s::{ClusterConnection, KubeAccess},
	manifest::Manifest,
	options::{MetaOptions, FIELD_MANAGER},
};

/// Flags shared by every command that talks to a cluster.
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
	/// Kubeconfig context to use. Defaults to the current context.
	#[arg(short = 'c', long)]
	pub context: Option<String>,

	/// Submit server-side requests without persisting the resources
	#[arg(long)]
	pub dry_run: bool,

	/// Force apply, taking over fields owned by other managers
	#[arg(short = 'f', long)]
	pub force: bool,

	/// Field manager. Override at your own risk.
	#[arg(short = 'm', long, default_value = FIELD_MANAGER)]
	pub manager: String,
}

impl ClusterArgs {
	pub fn meta_options(&self) -> MetaOptions {
		let opts = MetaOptions {
			field_manager: self.manager.clone(),
			..MetaOptions::default()
		}
		.force(self.force);
		if self.dry_run {
			opts.dry_run()
		} else {
			opts
		}
	}

	pub async fn connect(&self) -> Result<(ClusterConnection, KubeAccess)> {
		let connection = ClusterConnection::connect(self.context.as_deref())
			.await
			.context("connecting to cluster")?;
		info!(
			cluster = %connection.cluster_identifier(),
			version = %connection.server_version().git_version,
			"connected"
		);
		let access = KubeAccess::from_connection(&connection);
		Ok((connection, access))
	}
}

/// Build the runtime command handlers block on.
pub fn runtime() -> Result<tokio::runtime::Runtime> {
	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.context("creating tokio runtime")
}

/// Token cancelled on the first Ctrl-C.
///
/// Must be called from within the runtime.
pub fn cancel_on_interrupt() -> CancellationToken {
	let cancel = CancellationToken::new();
	let token = cancel.clone();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			warn!("interrupted, cancelling in-flight requests");
			token.cancel();
		}
	});
	cancel
}

const MANIFEST_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Load every manifest under `paths`.
///
/// Directories are walked recursively in file name order; only `.yaml`,
/// `.yml` and `.json` files are read. Empty documents are skipped and `List`
/// kinds are flattened into their items.
pub fn load_manifests(paths: &[PathBuf]) -> Result<Vec<Manifest>> {
	let mut manifests = Vec::new();
	for path in paths {
		if path.is_dir() {
			let walker = WalkDir::new(path).follow_links(true).sort_by_file_name();
			for entry in walker {
				let entry = entry.with_context(|| format!("walking {}", path.display()))?;
				if entry.file_type().is_file() && has_manifest_extension(entry.path()) {
					manifests.extend(load_file(entry.path())?);
				}
			}
		} else {
			manifests.extend(load_file(path)?);
		}
	}
	Ok(manifests)
}

fn has_manifest_extension(path: &Path) -> bool {
	path.extension()
		.and_then(|ext| ext.to_str())
		.is_some_and(|ext| MANIFEST_EXTENSIONS.contains(&ext))
}

fn load_file(path: &Path) -> Result<Vec<Manifest>> {
	let content = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
	parse_documents(&content).with_context(|| format!("parsing {}", path.display()))
}

/// Parse a multi-document YAML (or JSON) stream.
pub fn parse_documents(content: &str) -> Result<Vec<Manifest>> {
	let mut manifests = Vec::new();
	for (index, document) in serde_yaml::Deserializer::from_str(content).enumerate() {
		let value = serde_json::Value::deserialize(document)
			.with_context(|| format!("document {}", index + 1))?;
		collect(value, &mut manifests).with_context(|| format!("document {}", index + 1))?;
	}
	Ok(manifests)
}

fn collect(value: serde_json::Value, out: &mut Vec<Manifest>) -> Result<()> {
	match value {
		serde_json::Value::Null => {}
		serde_json::Value::Array(items) => {
			for item in items {
				collect(item, out)?;
			}
		}
		serde_json::Value::Object(mut object)
			if object
				.get("kind")
				.and_then(|k| k.as_str())
				.is_some_and(|k| k.ends_with("List"))
				&& object.contains_key("items") =>
		{
			if let Some(items) = object.remove("items") {
				collect(items, out)?;
			}
		}
		value => out.push(Manifest::from_value(value)?),
	}
	Ok(())
}

/// A writer wrapper that silently handles broken pipe errors.
///
/// Lets commands exit cleanly when output is piped to a process that closes
/// early (e.g., `tether apply . | head -1`).
pub struct BrokenPipeGuard<W> {
	inner: W,
}

impl<W> BrokenPipeGuard<W> {
	pub fn new(inner: W) -> Self {
		Self { inner }
	}
}

impl<W: Write> Write for BrokenPipeGuard<W> {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		match self.inner.write(buf) {
			Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(buf.len()),
			other => other,
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		match self.inner.flush() {
			Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
			other => other,
		}
	}
}

#[cfg(test)]
mod tests {
	use indoc::indoc;

	use super::*;

	#[test]
	fn test_parse_multi_document_yaml() {
		let manifests = parse_documents(indoc! {"
			---
			apiVersion: v1
			kind: Namespace
			metadata:
			  name: shop
			---
			null
			---
			apiVersion: v1
			kind: List
			items:
			  - apiVersion: v1
			    kind: ConfigMap
			    metadata:
			      name: a
			      namespace: shop
			  - apiVersion: v1
			    kind: ConfigMap
			    metadata:
			      name: b
			      namespace: shop
		"})
		.unwrap();

		let names: Vec<&str> = manifests.iter().map(Manifest::name).collect();
		assert_eq!(names, vec!["shop", "a", "b"]);
	}

	#[test]
	fn test_parse_rejects_documents_without_kind() {
		let err = parse_documents("apiVersion: v1\nmetadata:\n  name: x\n").unwrap_err();
		assert!(format!("{err:#}").contains("document 1"));
	}

	#[test]
	fn test_load_manifests_from_directory() {
		let dir = tempfile::tempdir().unwrap();
		fs::create_dir(dir.path().join("nested")).unwrap();
		fs::write(
			dir.path().join("b.yaml"),
			"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b\n",
		)
		.unwrap();
		fs::write(
			dir.path().join("nested/a.json"),
			r#"{"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "a"}}"#,
		)
		.unwrap();
		fs::write(dir.path().join("README.md"), "# not a manifest").unwrap();

		let manifests = load_manifests(&[dir.path().to_path_buf()]).unwrap();
		let kinds: Vec<&str> = manifests.iter().map(|m| m.kind.as_str()).collect();
		assert_eq!(kinds, vec!["ConfigMap", "Secret"]);
	}

	#[test]
	fn test_meta_options_from_flags() {
		let args = ClusterArgs {
			context: None,
			dry_run: true,
			force: true,
			manager: "ci".to_string(),
		};
		let opts = args.meta_options();
		assert!(opts.is_dry_run());
		assert_eq!(opts.force, Some(true));
		assert_eq!(opts.field_manager, "ci");
	}
}
