//! Engine error taxonomy and multi-error aggregation.
//!
//! Every failure carries the [`Id`] it concerns and the action or step that
//! failed. Failures from one concurrent pass never short-circuit their
//! siblings: they are gathered into an [`Errors`] aggregate and reported
//! together.

use std::{error::Error as StdError, fmt};

use thiserror::Error;

use crate::{k8s::AccessError, manifest::Id};

/// Remote call that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
	Discover,
	Get,
	Patch,
	Delete,
}

impl fmt::Display for Action {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Action::Discover => write!(f, "discovering the endpoint of"),
			Action::Get => write!(f, "getting"),
			Action::Patch => write!(f, "patching"),
			Action::Delete => write!(f, "deleting"),
		}
	}
}

/// Instance-level step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
	FetchInstance,
	SyncInstance,
	PersistInstance,
	DeleteInstance,
	FetchPruneTarget,
	ApplyManifest,
	DeleteManifest,
}

impl fmt::Display for Step {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Step::FetchInstance => write!(f, "fetching instance"),
			Step::SyncInstance => write!(f, "synchronizing instance"),
			Step::PersistInstance => write!(f, "persisting instance"),
			Step::DeleteInstance => write!(f, "deleting instance"),
			Step::FetchPruneTarget => write!(f, "fetching prune target"),
			Step::ApplyManifest => write!(f, "applying manifest"),
			Step::DeleteManifest => write!(f, "deleting manifest"),
		}
	}
}

#[derive(Debug, Error)]
pub enum Error {
	/// No live endpoint serves the kind (yet).
	#[error("resolving an endpoint for {id}")]
	Resolution {
		id: Id,
		#[source]
		source: AccessError,
	},

	#[error("encoding {id}")]
	Encoding {
		id: Id,
		#[source]
		source: serde_json::Error,
	},

	#[error("decoding manifest")]
	Decoding(#[source] serde_json::Error),

	/// The server rejected the request.
	#[error("{action} {id}")]
	Remote {
		id: Id,
		action: Action,
		#[source]
		source: AccessError,
	},

	#[error("{id} not found")]
	NotFound { id: Id },

	#[error("failed to apply every object, {remaining} remaining")]
	Deadlock {
		remaining: usize,
		#[source]
		source: Errors,
	},

	#[error("{step} {target}")]
	Step {
		step: Step,
		target: String,
		#[source]
		source: Box<Error>,
	},

	#[error("operation cancelled")]
	Cancelled,

	#[error("worker task panicked")]
	TaskPanicked(#[source] tokio::task::JoinError),

	#[error("internal error: concurrency semaphore unexpectedly closed")]
	SemaphoreClosed,

	#[error(transparent)]
	Multiple(#[from] Errors),
}

impl Error {
	/// Attach step context. Cancellation is passed through unwrapped.
	pub(crate) fn at(step: Step, target: impl fmt::Display, source: Error) -> Self {
		if matches!(source, Error::Cancelled) {
			return source;
		}
		Error::Step {
			step,
			target: target.to_string(),
			source: Box::new(source),
		}
	}

	pub fn is_not_found(&self) -> bool {
		match self {
			Error::NotFound { .. } => true,
			Error::Step { source, .. } => source.is_not_found(),
			_ => false,
		}
	}
}

/// Aggregate of independent failures.
#[derive(Debug, Default)]
pub struct Errors(Vec<Error>);

impl Errors {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, error: Error) {
		self.0.push(error);
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn iter(&self) -> std::slice::Iter<'_, Error> {
		self.0.iter()
	}

	/// `Ok` when nothing was collected.
	pub fn into_result(self) -> Result<(), Error> {
		if self.0.is_empty() {
			Ok(())
		} else {
			Err(Error::Multiple(self))
		}
	}
}

impl fmt::Display for Errors {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.0.len() {
			1 => write!(f, "1 error occurred:")?,
			n => write!(f, "{n} errors occurred:")?,
		}
		for error in &self.0 {
			write!(f, "\n\t* {}", display_chain(error))?;
		}
		Ok(())
	}
}

impl StdError for Errors {}

impl IntoIterator for Errors {
	type Item = Error;
	type IntoIter = std::vec::IntoIter<Error>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.into_iter()
	}
}

impl<'a> IntoIterator for &'a Errors {
	type Item = &'a Error;
	type IntoIter = std::slice::Iter<'a, Error>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.iter()
	}
}

impl FromIterator<Error> for Errors {
	fn from_iter<I: IntoIterator<Item = Error>>(iter: I) -> Self {
		Self(iter.into_iter().collect())
	}
}

impl Extend<Error> for Errors {
	fn extend<I: IntoIterator<Item = Error>>(&mut self, iter: I) {
		self.0.extend(iter);
	}
}

/// Render an error followed by its sources, `: `-separated.
pub fn display_chain(error: &dyn StdError) -> String {
	let mut rendered = error.to_string();
	let mut source = error.source();
	while let Some(cause) = source {
		rendered.push_str(": ");
		rendered.push_str(&cause.to_string());
		source = cause.source();
	}
	rendered
}
