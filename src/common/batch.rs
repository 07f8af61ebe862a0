//! Bounded-concurrency task batch with shared cancellation
//!
//! Every task in a batch gets the same `CancellationToken`. The first task
//! that fails records its error and cancels the token; tasks that honour the
//! token may then finish early. Failed tasks are left out of the result map,
//! they never fail the batch as a whole.

use crate::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct Batch<T> {
    token: CancellationToken,
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<(String, Result<T>)>,
}

pub struct BatchResult<T> {
    pub values: HashMap<String, T>,
    pub first_error: Option<(String, Error)>,
}

impl<T: Send + 'static> Batch<T> {
    pub fn new(concurrency: usize) -> Self {
        Batch {
            token: CancellationToken::new(),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            tasks: JoinSet::new(),
        }
    }

    /// Batch whose token is also cancelled when `parent` is.
    pub fn with_parent(concurrency: usize, parent: &CancellationToken) -> Self {
        Batch {
            token: parent.child_token(),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            tasks: JoinSet::new(),
        }
    }

    /// Token shared by every task of this batch.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn go<F, Fut>(&mut self, key: impl Into<String>, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let key = key.into();
        let token = self.token.clone();
        let semaphore = self.semaphore.clone();

        self.tasks.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return (key, Err(Error::internal("batch limiter closed"))),
            };
            let result = f(token.clone()).await;
            if result.is_err() {
                token.cancel();
            }
            (key, result)
        });
    }

    pub async fn wait(mut self) -> BatchResult<T> {
        let mut values = HashMap::new();
        let mut errors: Vec<(String, Error)> = Vec::new();

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((key, Ok(value))) => {
                    values.insert(key, value);
                }
                Ok((key, Err(e))) => {
                    debug!("batch task {} failed: {}", key, e);
                    errors.push((key, e));
                }
                Err(e) => debug!("batch task panicked or was aborted: {}", e),
            }
        }

        // the task that cancelled the token is the one that failed before cancellation was seen
        let first_error = if errors.is_empty() {
            None
        } else {
            let idx = errors
                .iter()
                .position(|(_, e)| !matches!(e, Error::Internal(msg) if msg == CANCELLED))
                .unwrap_or(0);
            Some(errors.swap_remove(idx))
        };

        BatchResult {
            values,
            first_error,
        }
    }
}

const CANCELLED: &str = "cancelled";

/// Error a task should return when it stops because the batch was cancelled.
pub fn cancelled() -> Error {
    Error::internal(CANCELLED)
}
