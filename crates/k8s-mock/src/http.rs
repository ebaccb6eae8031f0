//! HTTP-based mock Kubernetes server using wiremock.
//!
//! This provides a real HTTP server that can be used with actual kubeconfig-based
//! connections. It serves discovery, `GET`, server-side apply `PATCH` and
//! `DELETE` with owner-reference garbage collection.

use std::{
	collections::HashSet,
	sync::{Arc, PoisonError, RwLock},
};

use bon::Builder;
use kube::config::{
	AuthInfo, Cluster, Context, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext,
};
use serde_json::{json, Value};
use tracing::{debug, trace};
use wiremock::{
	matchers::{header_regex, method, path, path_regex},
	Mock, MockServer, Request, ResponseTemplate,
};

use crate::{
	discovery::{DiscoveryMode, MockDiscovery},
	helpers::{
		collection_path, group_version_of, is_dry_run, parse_resource_path, plural_of,
		requested_version, status,
	},
	store::Store,
};

const AGGREGATED_DISCOVERY_CONTENT_TYPE: &str =
	"application/json;g=apidiscovery.k8s.io;v=v2;as=APIGroupDiscoveryList";

const CRD_API_VERSION: &str = "apiextensions.k8s.io/v1";

/// A mock Kubernetes server exposed over HTTP.
#[derive(Builder)]
pub struct HttpMockK8sServer {
	#[builder(default)]
	discovery_mode: DiscoveryMode,
	/// Resources served before any definition is applied.
	#[builder(default)]
	discovery: MockDiscovery,
	/// Objects present at startup. The server derives API paths from
	/// apiVersion/kind using the discovery data.
	#[builder(default)]
	resources: Vec<Value>,
	/// Object names whose apply is rejected with `422 Invalid`.
	#[builder(default)]
	rejected: Vec<String>,
}

/// A running HTTP mock server instance.
pub struct RunningHttpMockK8sServer {
	server: MockServer,
	store: Arc<RwLock<Store>>,
	discovery: Arc<RwLock<MockDiscovery>>,
}

#[derive(Clone)]
struct Shared {
	store: Arc<RwLock<Store>>,
	discovery: Arc<RwLock<MockDiscovery>>,
	rejected: Arc<HashSet<String>>,
}

impl HttpMockK8sServer {
	/// Start the mock server with all configured resources.
	pub async fn start(self) -> RunningHttpMockK8sServer {
		let server = MockServer::start().await;
		debug!(uri = %server.uri(), "Started mock K8s server");

		let mut discovery = self.discovery;
		let mut store = Store::default();
		store.apply(
			"/api/v1/namespaces",
			"default",
			json!({"apiVersion": "v1", "kind": "Namespace"}),
			false,
		);

		for manifest in self.resources {
			let Some((collection, name)) = api_path_for_manifest(&manifest, &discovery) else {
				debug!("skipping seed object with an unserved kind");
				continue;
			};
			trace!(collection = %collection, name = %name, "Registered resource");
			if is_definition(&collection) {
				discovery.register_definition(&manifest);
			}
			store.apply(&collection, &name, manifest, false);
		}

		let shared = Shared {
			store: Arc::new(RwLock::new(store)),
			discovery: Arc::new(RwLock::new(discovery)),
			rejected: Arc::new(self.rejected.into_iter().collect()),
		};

		mount_version(&server).await;
		mount_discovery(&server, &shared, self.discovery_mode).await;
		mount_resources(&server, &shared).await;

		RunningHttpMockK8sServer {
			server,
			store: shared.store,
			discovery: shared.discovery,
		}
	}
}

/// Derive the API path for a manifest using discovery data.
fn api_path_for_manifest(manifest: &Value, discovery: &MockDiscovery) -> Option<(String, String)> {
	let api_version = manifest.get("apiVersion")?.as_str()?;
	let kind = manifest.get("kind")?.as_str()?;
	let name = manifest.pointer("/metadata/name")?.as_str()?.to_string();
	let namespace = manifest
		.pointer("/metadata/namespace")
		.and_then(Value::as_str);

	let resource = discovery.lookup(api_version, kind)?;
	let namespace = resource
		.namespaced
		.then(|| namespace.unwrap_or("default"));
	Some((collection_path(api_version, &resource.name, namespace), name))
}

fn is_definition(collection: &str) -> bool {
	collection == collection_path(CRD_API_VERSION, "customresourcedefinitions", None)
}

impl RunningHttpMockK8sServer {
	/// Get the server's URI (e.g., "http://127.0.0.1:12345").
	pub fn uri(&self) -> String {
		self.server.uri()
	}

	/// Current state of an object, if stored.
	pub fn get(
		&self,
		api_version: &str,
		kind: &str,
		namespace: Option<&str>,
		name: &str,
	) -> Option<Value> {
		let discovery = self.discovery.read().unwrap_or_else(PoisonError::into_inner);
		let resource = discovery.lookup(api_version, kind)?;
		let namespace = resource
			.namespaced
			.then(|| namespace.unwrap_or("default"));
		let collection = collection_path(api_version, &resource.name, namespace);
		self.resource(&collection, name)
	}

	/// Current state of the object at (`collection`, `name`).
	pub fn resource(&self, collection: &str, name: &str) -> Option<Value> {
		self.store
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.get(collection, name)
			.cloned()
	}

	/// Number of stored objects, including the `default` namespace.
	pub fn len(&self) -> usize {
		self.store.read().unwrap_or_else(PoisonError::into_inner).len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Whether `kind` is currently served under `api_version`.
	pub fn serves(&self, api_version: &str, kind: &str) -> bool {
		self.discovery
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.lookup(api_version, kind)
			.is_some()
	}

	/// Create a Kubeconfig pointing to this mock server.
	pub fn kubeconfig(&self) -> Kubeconfig {
		self.kubeconfig_with_context("mock-context")
	}

	/// Create a Kubeconfig pointing to this mock server with a custom context name.
	pub fn kubeconfig_with_context(&self, context_name: &str) -> Kubeconfig {
		let cluster_name = "mock-cluster";
		let user_name = "mock-user";

		Kubeconfig {
			clusters: vec![NamedCluster {
				name: cluster_name.to_string(),
				cluster: Some(Cluster {
					server: Some(self.uri()),
					insecure_skip_tls_verify: Some(true),
					..Default::default()
				}),
			}],
			contexts: vec![NamedContext {
				name: context_name.to_string(),
				context: Some(Context {
					cluster: cluster_name.to_string(),
					user: Some(user_name.to_string()),
					namespace: Some("default".to_string()),
					..Default::default()
				}),
			}],
			auth_infos: vec![NamedAuthInfo {
				name: user_name.to_string(),
				auth_info: Some(AuthInfo::default()),
			}],
			current_context: Some(context_name.to_string()),
			..Default::default()
		}
	}
}

async fn mount_version(server: &MockServer) {
	Mock::given(method("GET"))
		.and(path("/version"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"major": "1",
			"minor": "31",
			"gitVersion": "v1.31.0",
			"gitCommit": "fake",
			"gitTreeState": "clean",
			"buildDate": "2024-08-13T00:00:00Z",
			"goVersion": "go1.22.5",
			"compiler": "gc",
			"platform": "linux/amd64"
		})))
		.mount(server)
		.await;
}

fn aggregated(body: Value) -> ResponseTemplate {
	// set_body_json would overwrite the Content-Type clients use to detect the format
	ResponseTemplate::new(200).set_body_raw(body.to_string(), AGGREGATED_DISCOVERY_CONTENT_TYPE)
}

/// Discovery responses are rendered per request, so definitions applied
/// after startup show up on the next discovery run.
async fn mount_discovery(server: &MockServer, shared: &Shared, mode: DiscoveryMode) {
	match mode {
		DiscoveryMode::Aggregated => {
			let core = Arc::clone(&shared.discovery);
			Mock::given(method("GET"))
				.and(path("/api"))
				.and(header_regex("accept", "apidiscovery"))
				.respond_with(move |_: &Request| {
					aggregated(
						core.read()
							.unwrap_or_else(PoisonError::into_inner)
							.aggregated_core(),
					)
				})
				.mount(server)
				.await;

			let groups = Arc::clone(&shared.discovery);
			Mock::given(method("GET"))
				.and(path("/apis"))
				.and(header_regex("accept", "apidiscovery"))
				.respond_with(move |_: &Request| {
					aggregated(
						groups
							.read()
							.unwrap_or_else(PoisonError::into_inner)
							.aggregated_groups(),
					)
				})
				.mount(server)
				.await;
		}
		DiscoveryMode::Legacy => {
			// 406 Not Acceptable makes clients fall back to legacy endpoints
			Mock::given(method("GET"))
				.and(path_regex(r"^/apis?$"))
				.and(header_regex("accept", "apidiscovery"))
				.respond_with(ResponseTemplate::new(406))
				.mount(server)
				.await;
		}
	}

	Mock::given(method("GET"))
		.and(path("/api"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"kind": "APIVersions",
			"versions": ["v1"],
			"serverAddressByClientCIDRs": []
		})))
		.mount(server)
		.await;

	let group_list = Arc::clone(&shared.discovery);
	Mock::given(method("GET"))
		.and(path("/apis"))
		.respond_with(move |_: &Request| {
			ResponseTemplate::new(200).set_body_json(
				group_list
					.read()
					.unwrap_or_else(PoisonError::into_inner)
					.group_list(),
			)
		})
		.mount(server)
		.await;

	let resource_lists = Arc::clone(&shared.discovery);
	Mock::given(method("GET"))
		.and(path_regex(r"^/(api/v1|apis/[^/]+/[^/]+)$"))
		.respond_with(move |req: &Request| {
			let group_version = req
				.url
				.path()
				.trim_start_matches("/apis/")
				.trim_start_matches("/api/");
			let list = resource_lists
				.read()
				.unwrap_or_else(PoisonError::into_inner)
				.resource_list(group_version);
			match list {
				Some(list) => ResponseTemplate::new(200).set_body_json(list),
				None => ResponseTemplate::new(404).set_body_json(status(
					404,
					"NotFound",
					format!("the server could not find the requested resource {group_version}"),
				)),
			}
		})
		.mount(server)
		.await;
}

/// Reject requests addressed to a collection discovery does not serve.
fn check_served(discovery: &RwLock<MockDiscovery>, collection: &str) -> Result<(), ResponseTemplate> {
	let discovery = discovery.read().unwrap_or_else(PoisonError::into_inner);
	let served = group_version_of(collection)
		.zip(plural_of(collection))
		.and_then(|(gv, plural)| discovery.lookup_plural(&gv, plural).map(|_| ()));
	served.ok_or_else(|| {
		ResponseTemplate::new(404).set_body_json(status(
			404,
			"NotFound",
			format!("the server could not find the requested resource {collection}"),
		))
	})
}

fn not_found(collection: &str, name: &str) -> ResponseTemplate {
	ResponseTemplate::new(404).set_body_json(status(
		404,
		"NotFound",
		format!("{name} not found in {collection}"),
	))
}

async fn mount_resources(server: &MockServer, shared: &Shared) {
	let get = shared.clone();
	Mock::given(method("GET"))
		.and(path_regex(r"^/apis?/.*"))
		.respond_with(move |req: &Request| {
			let (collection, name) = parse_resource_path(req.url.path());
			if let Err(response) = check_served(&get.discovery, &collection) {
				return response;
			}
			let store = get.store.read().unwrap_or_else(PoisonError::into_inner);
			// Reads must not observe a version the store has not reached.
			if let Some(requested) = requested_version(req.url.query()) {
				let current = store.resource_version();
				if requested.parse::<u64>().map_or(true, |v| v > current) {
					return ResponseTemplate::new(504).set_body_json(status(
						504,
						"Timeout",
						format!("Too large resource version: {requested}, current: {current}"),
					));
				}
			}
			match store.get(&collection, &name) {
				Some(object) => ResponseTemplate::new(200).set_body_json(object),
				None => not_found(&collection, &name),
			}
		})
		.mount(server)
		.await;

	let patch = shared.clone();
	Mock::given(method("PATCH"))
		.and(path_regex(r"^/apis?/.*"))
		.respond_with(move |req: &Request| {
			let (collection, name) = parse_resource_path(req.url.path());
			if let Err(response) = check_served(&patch.discovery, &collection) {
				return response;
			}

			let content_type = req
				.headers
				.get("content-type")
				.and_then(|v| v.to_str().ok())
				.unwrap_or_default();
			if !content_type.contains("apply-patch") {
				return ResponseTemplate::new(415).set_body_json(status(
					415,
					"UnsupportedMediaType",
					format!("only server-side apply is served, got {content_type:?}"),
				));
			}

			let Ok(body) = serde_json::from_slice::<Value>(&req.body) else {
				return ResponseTemplate::new(400).set_body_json(status(
					400,
					"BadRequest",
					"request body is not JSON",
				));
			};

			if patch.rejected.contains(&name) {
				return ResponseTemplate::new(422).set_body_json(status(
					422,
					"Invalid",
					format!("{name} is rejected by admission"),
				));
			}

			let dry_run = is_dry_run(req.url.query());
			let object = patch
				.store
				.write()
				.unwrap_or_else(PoisonError::into_inner)
				.apply(&collection, &name, body, dry_run);

			if !dry_run && is_definition(&collection) {
				let registered = patch
					.discovery
					.write()
					.unwrap_or_else(PoisonError::into_inner)
					.register_definition(&object);
				debug!(name = %name, registered = registered, "applied definition");
			}

			ResponseTemplate::new(200).set_body_json(object)
		})
		.mount(server)
		.await;

	let delete = shared.clone();
	Mock::given(method("DELETE"))
		.and(path_regex(r"^/apis?/.*"))
		.respond_with(move |req: &Request| {
			let (collection, name) = parse_resource_path(req.url.path());
			if let Err(response) = check_served(&delete.discovery, &collection) {
				return response;
			}

			let dry_run = is_dry_run(req.url.query());
			let deleted = delete
				.store
				.write()
				.unwrap_or_else(PoisonError::into_inner)
				.delete(&collection, &name, dry_run);
			match deleted {
				Some(object) => ResponseTemplate::new(200).set_body_json(object),
				None => not_found(&collection, &name),
			}
		})
		.mount(server)
		.await;
}
