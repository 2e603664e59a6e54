//! # Tasks
//!
//! A [Task] is an auto-running unit of asynchronous work that can be cancelled cooperatively.
//! The work is spawned on the tokio runtime as soon as the task is created, so it
//! completes even if nobody awaits it. [Task] is clonable; every clone can await the same outcome.
//!
//! Cancellation is expressed by a [CancellationToken] handed to the task body.
//! The body decides where it observes the token; [while_task] observes it at every
//! wait boundary between two polling attempts. Composed tasks share the token,
//! so cancelling the outer task also stops any poll running inside of it.

use std::future::{Future, IntoFuture};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::watch;
use tracing::debug;

use crate::error::Error;

/// Cooperative cancellation flag shared between a task and its observers.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        CancellationToken { tx: Arc::new(tx) }
    }

    /// Request cancellation. Cancelling twice is a no-op.
    pub fn cancel(&self) {
        if !self.tx.send_replace(true) {
            debug!("Cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Completes once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Verdict of a polling predicate on a single produced value.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Terminal condition not reached yet, poll again after the interval.
    Pending,
    /// Terminal condition reached, resolve with the produced value.
    Success,
    /// Hard failure, reject with the error.
    Failed(Error),
}

/// How often and how many times [while_task] invokes its producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// `None` polls until a terminal outcome or cancellation.
    pub max_attempts: Option<u32>,
}

impl PollPolicy {
    pub fn new(interval: Duration) -> Self {
        PollPolicy {
            interval,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            interval: Duration::from_millis(1000),
            max_attempts: Some(600),
        }
    }
}

/// Repeatedly invoke `producer` until `predicate` reports a terminal outcome.
///
/// Between two attempts the loop sleeps for `policy.interval`; the sleep is aborted
/// when the token is cancelled and the loop fails with [crate::error::ErrorType::Cancelled].
/// No producer call is made after the cancellation has been observed.
/// Failures of the producer are propagated immediately.
pub async fn while_task<T, P, F, Fut>(
    token: &CancellationToken,
    policy: &PollPolicy,
    mut predicate: P,
    mut producer: F,
) -> Result<T, Error>
where
    P: FnMut(&T) -> PollOutcome,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempts: u32 = 0;
    loop {
        if token.is_cancelled() {
            return Err(Error::cancelled("Polling"));
        }
        attempts += 1;
        let value = producer().await?;
        match predicate(&value) {
            PollOutcome::Success => return Ok(value),
            PollOutcome::Failed(e) => return Err(e),
            PollOutcome::Pending => {}
        }
        if let Some(max_attempts) = policy.max_attempts {
            if attempts >= max_attempts {
                return Err(Error::poll_limit_exceeded(attempts));
            }
        }
        debug!(attempts, "Poll pending, waiting {:?}", policy.interval);
        tokio::select! {
            _ = tokio::time::sleep(policy.interval) => {}
            _ = token.cancelled() => {
                debug!(attempts, "Polling cancelled");
                return Err(Error::cancelled("Polling"));
            }
        }
    }
}

/// Auto-running, cooperatively cancellable task.
pub struct Task<T> {
    token: CancellationToken,
    finished: Arc<AtomicBool>,
    outcome: Shared<BoxFuture<'static, Result<T, Error>>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Task {
            token: self.token.clone(),
            finished: self.finished.clone(),
            outcome: self.outcome.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Task<T> {
    /// Spawn the task body. The body receives the token that [Task::cancel] trips.
    ///
    /// Panics when called outside a tokio runtime, like [tokio::spawn].
    pub fn spawn<F, Fut>(body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        Self::spawn_with_token(CancellationToken::new(), body)
    }

    /// Spawn the task body bound to an existing token, e.g. one owned by an enclosing task.
    pub fn spawn_with_token<F, Fut>(token: CancellationToken, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let finished = Arc::new(AtomicBool::new(false));
        let fut = body(token.clone());
        let done = finished.clone();
        let handle = tokio::spawn(async move {
            let result = fut.await;
            done.store(true, Ordering::SeqCst);
            result
        });
        let outcome = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(Error::unexpected_error(format!(
                    "Task failed to complete: {}",
                    e
                ))),
            }
        }
        .boxed()
        .shared();
        Task {
            token,
            finished,
            outcome,
        }
    }

    /// Spawn a [while_task] poll as a standalone task.
    pub fn while_task<P, F, Fut>(policy: PollPolicy, predicate: P, producer: F) -> Self
    where
        P: FnMut(&T) -> PollOutcome + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        Self::spawn(move |token| async move {
            while_task(&token, &policy, predicate, producer).await
        })
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for the task outcome.
    pub async fn wait(&self) -> Result<T, Error> {
        self.outcome.clone().await
    }
}

impl<T: Clone + Send + Sync + 'static> IntoFuture for Task<T> {
    type Output = Result<T, Error>;
    type IntoFuture = Shared<BoxFuture<'static, Result<T, Error>>>;

    fn into_future(self) -> Self::IntoFuture {
        self.outcome
    }
}
