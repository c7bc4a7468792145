use std::{
    collections::VecDeque,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::anyhow;
use futures::{
    future::{self, BoxFuture},
    FutureExt,
};
use itertools::Itertools;
use tokio::sync::oneshot;
use tracing::{debug, error};

use super::{
    provider::ProviderError,
    retry::{self, RetryPolicy, Sleeper},
};

/// A queued remote call with its retry loop and result sink already attached.
type FetchTask = BoxFuture<'static, ()>;

struct QueueState {
    pending: VecDeque<FetchTask>,
    draining: bool,
}

struct Inner {
    batch_size: usize,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    state: Mutex<QueueState>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        // Tasks never run while the lock is held, a poisoned queue is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Single choke point for remote calls.
///
/// Calls are queued in submission order and drained in batches of at most `batch_size`. A batch
/// runs concurrently and the next batch only starts once every call in the current one has
/// resolved, so no more than `batch_size` calls are ever outstanding. Each call is retried
/// according to the [`RetryPolicy`] and its outcome is delivered to its own caller only.
#[derive(Clone)]
pub struct BatchedFetchScheduler {
    inner: Arc<Inner>,
}

impl BatchedFetchScheduler {
    pub fn new(batch_size: usize, policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            inner: Arc::new(Inner {
                batch_size: batch_size.max(1),
                policy,
                sleeper,
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    draining: false,
                }),
            }),
        }
    }

    /// Queues `operation` immediately and resolves once it has run, including retries.
    ///
    /// `operation` is invoked once per attempt.
    pub fn submit<T, F, Fut>(
        &self,
        operation: F,
    ) -> impl Future<Output = Result<T, ProviderError>> + Send + 'static
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ProviderError>> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let policy = self.inner.policy;
        let sleeper = self.inner.sleeper.clone();

        let task = async move {
            let result = retry::execute_with_retry(&policy, sleeper.as_ref(), operation).await;
            // The caller may have stopped waiting, nothing to deliver to then.
            let _ = result_tx.send(result);
        }
        .boxed();

        self.enqueue(task);

        async move {
            match result_rx.await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Fatal(anyhow!(
                    "fetch task was dropped before completing"
                ))),
            }
        }
    }

    fn enqueue(&self, task: FetchTask) {
        let start_drain = {
            let mut state = self.inner.state();
            state.pending.push_back(task);
            !std::mem::replace(&mut state.draining, true)
        };

        if start_drain {
            tokio::spawn(drain(self.inner.clone()));
        }
    }
}

async fn drain(inner: Arc<Inner>) {
    loop {
        let batch = {
            let mut state = inner.state();
            if state.pending.is_empty() {
                state.draining = false;
                return;
            }
            let size = state.pending.len().min(inner.batch_size);
            state.pending.drain(..size).collect_vec()
        };

        let size = batch.len();
        let results = future::join_all(
            batch
                .into_iter()
                .map(|task| AssertUnwindSafe(task).catch_unwind()),
        )
        .await;

        let panicked = results.iter().filter(|result| result.is_err()).count();
        if panicked > 0 {
            error!(panicked, "fetch tasks panicked, their callers receive an error");
        }

        debug!(size, "processed fetch batch");
    }
}
