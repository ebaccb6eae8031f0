//! Bounded concurrent fan-out with a join barrier.

use std::{future::Future, sync::Arc};

use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Maximum in-flight requests within one pass.
pub const MAX_CONCURRENT_OPS: usize = 16;

/// Run `task` for every item concurrently and wait for all of them.
///
/// Outputs are returned in completion order. Cancellation aborts the tasks
/// still in flight and yields [`Error::Cancelled`]; requests already issued
/// to the server are not rolled back.
pub(crate) async fn fan_out<T, F, Fut>(
	items: Vec<T>,
	cancel: &CancellationToken,
	task: F,
) -> Result<Vec<Fut::Output>, Error>
where
	T: Send,
	F: Fn(T) -> Fut + Send,
	Fut: Future + Send + 'static,
	Fut::Output: Send + 'static,
{
	let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_OPS));
	let mut join_set = JoinSet::new();

	for item in items {
		let sem = Arc::clone(&semaphore);
		let work = task(item);
		join_set.spawn(async move {
			let _permit = sem.acquire().await.map_err(|_| Error::SemaphoreClosed)?;
			Ok::<_, Error>(work.await)
		});
	}

	let mut outputs = Vec::with_capacity(join_set.len());
	loop {
		tokio::select! {
			biased;
			() = cancel.cancelled() => {
				join_set.abort_all();
				return Err(Error::Cancelled);
			}
			next = join_set.join_next() => match next {
				Some(result) => outputs.push(result.map_err(Error::TaskPanicked)??),
				None => break,
			},
		}
	}

	Ok(outputs)
}

/// Run a single request, giving up as soon as `cancel` fires.
pub(crate) async fn cancellable<T, Fut>(cancel: &CancellationToken, work: Fut) -> Result<T, Error>
where
	Fut: Future<Output = Result<T, Error>>,
{
	tokio::select! {
		biased;
		() = cancel.cancelled() => Err(Error::Cancelled),
		result = work => result,
	}
}
