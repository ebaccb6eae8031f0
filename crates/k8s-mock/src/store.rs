//! Object storage behind the mock server.
//!
//! Objects are keyed by (collection path, name). Writes follow server-side
//! apply with full replacement: the applied body becomes the object, keeping
//! only the identity the server assigned (`uid`).

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::trace;

use crate::helpers::{namespace_of, owner_uids};

pub type ObjectKey = (String, String);

/// In-memory object store.
#[derive(Debug, Default)]
pub struct Store {
	objects: HashMap<ObjectKey, Value>,
	next_uid: u64,
	resource_version: u64,
}

impl Store {
	pub fn get(&self, collection: &str, name: &str) -> Option<&Value> {
		self.objects.get(&(collection.to_string(), name.to_string()))
	}

	pub fn len(&self) -> usize {
		self.objects.len()
	}

	/// Version of the most recent write.
	pub fn resource_version(&self) -> u64 {
		self.resource_version
	}

	pub fn is_empty(&self) -> bool {
		self.objects.is_empty()
	}

	/// Apply `body` to the object at (`collection`, `name`).
	///
	/// A dry run computes the result without storing it or assigning a uid
	/// to a new object.
	pub fn apply(&mut self, collection: &str, name: &str, body: Value, dry_run: bool) -> Value {
		let key = (collection.to_string(), name.to_string());
		let existing_uid = self
			.objects
			.get(&key)
			.and_then(|o| o.pointer("/metadata/uid"))
			.cloned();
		let existing_version = self
			.objects
			.get(&key)
			.and_then(|o| o.pointer("/metadata/resourceVersion"))
			.cloned();

		let mut object = match body {
			Value::Object(map) => map,
			_ => Map::new(),
		};
		let metadata = object
			.entry("metadata")
			.or_insert_with(|| Value::Object(Map::new()));
		if !metadata.is_object() {
			*metadata = Value::Object(Map::new());
		}
		if let Value::Object(metadata) = metadata {
			metadata.insert("name".into(), name.into());
			if let Some(namespace) = namespace_of(collection) {
				metadata.insert("namespace".into(), namespace.into());
			}

			let uid = match (existing_uid, dry_run) {
				(Some(uid), _) => Some(uid),
				(None, false) => {
					self.next_uid += 1;
					Some(Value::String(format!("uid-{}", self.next_uid)))
				}
				(None, true) => None,
			};
			match uid {
				Some(uid) => metadata.insert("uid".into(), uid),
				None => metadata.remove("uid"),
			};

			let version = if dry_run {
				existing_version
			} else {
				self.resource_version += 1;
				Some(Value::String(self.resource_version.to_string()))
			};
			match version {
				Some(version) => metadata.insert("resourceVersion".into(), version),
				None => metadata.remove("resourceVersion"),
			};
		}

		let object = Value::Object(object);
		if !dry_run {
			trace!(collection = %collection, name = %name, "stored object");
			self.objects.insert(key, object.clone());
		}
		object
	}

	/// Delete the object and, transitively, everything it owns.
	///
	/// Returns the deleted object, or `None` if it did not exist.
	pub fn delete(&mut self, collection: &str, name: &str, dry_run: bool) -> Option<Value> {
		let key = (collection.to_string(), name.to_string());
		if dry_run {
			return self.objects.get(&key).cloned();
		}

		let deleted = self.objects.remove(&key)?;
		let mut orphaned: Vec<String> = deleted
			.pointer("/metadata/uid")
			.and_then(Value::as_str)
			.map(str::to_string)
			.into_iter()
			.collect();

		while let Some(owner) = orphaned.pop() {
			let dependents: Vec<ObjectKey> = self
				.objects
				.iter()
				.filter(|(_, object)| owner_uids(object).any(|uid| uid == owner))
				.map(|(key, _)| key.clone())
				.collect();
			for key in dependents {
				if let Some(object) = self.objects.remove(&key) {
					trace!(collection = %key.0, name = %key.1, "collected dependent");
					if let Some(uid) = object.pointer("/metadata/uid").and_then(Value::as_str) {
						orphaned.push(uid.to_string());
					}
				}
			}
		}

		Some(deleted)
	}
}
