//! # Mutation serializer
//!
//! [MutationSerializer] admits at most one operation at a time against a shared data source.
//! Operations are of three kinds: request, save and task. The serializer is a small state
//! machine with one *active* slot and a FIFO queue of pending *intents*:
//!
//! - a request (or save) arriving while a request (or save) is active joins it and
//!   receives the same outcome, no second remote call is made,
//! - any other operation enqueues an intent and waits until it reaches the front of the
//!   queue and the active slot is free,
//! - the failure of a predecessor does not affect waiting intents, it is reported only to
//!   the callers of the failed operation.
//!
//! Admitted operations are spawned, so they run to completion even if the caller goes away.
//! Operation bodies must not call back into the same serializer.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::error::Error;
use crate::task::CancellationToken;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Request,
    Save,
    Task,
}

impl OperationKind {
    fn joinable(self) -> bool {
        !matches!(self, OperationKind::Task)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SerializerState {
    Idle,
    Requesting,
    Saving,
    RunningTask,
}

type SharedCompletion = Shared<BoxFuture<'static, Result<(), Error>>>;

struct ActiveOperation {
    id: u64,
    kind: OperationKind,
    completion: Option<SharedCompletion>,
    token: Option<CancellationToken>,
}

struct Slots {
    next_id: u64,
    active: Option<ActiveOperation>,
    queue: VecDeque<(u64, OperationKind)>,
}

struct SerializerInner {
    slots: Mutex<Slots>,
    changes: watch::Sender<u64>,
}

impl SerializerInner {
    fn notify(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn set_completion(&self, id: u64, completion: SharedCompletion) {
        {
            let mut slots = self.slots.lock();
            match slots.active.as_mut() {
                Some(active) if active.id == id => active.completion = Some(completion),
                _ => return,
            }
        }
        self.notify();
    }

    fn finish(&self, id: u64) {
        {
            let mut slots = self.slots.lock();
            match slots.active.as_ref() {
                Some(active) if active.id == id => {
                    debug!(id, kind = ?active.kind, "Operation finished");
                    slots.active = None;
                }
                _ => return,
            }
        }
        self.notify();
    }
}

/// Removes a not yet admitted intent from the queue when its caller goes away.
struct IntentGuard<'a> {
    inner: &'a SerializerInner,
    id: u64,
    queued: bool,
}

impl Drop for IntentGuard<'_> {
    fn drop(&mut self) {
        if self.queued {
            self.inner.slots.lock().queue.retain(|(id, _)| *id != self.id);
            self.inner.notify();
        }
    }
}

/// Clears the active slot when the spawned operation ends, even by panic.
struct FinishGuard {
    inner: Arc<SerializerInner>,
    id: u64,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.inner.finish(self.id);
    }
}

enum Admission {
    Join(SharedCompletion),
    Start(u64),
}

#[derive(Clone)]
pub struct MutationSerializer {
    inner: Arc<SerializerInner>,
}

impl Default for MutationSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationSerializer {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        MutationSerializer {
            inner: Arc::new(SerializerInner {
                slots: Mutex::new(Slots {
                    next_id: 1,
                    active: None,
                    queue: VecDeque::new(),
                }),
                changes,
            }),
        }
    }

    async fn admit(&self, kind: OperationKind, token: Option<CancellationToken>) -> Admission {
        let mut changes = self.inner.changes.subscribe();
        let id = {
            let mut slots = self.inner.slots.lock();
            let id = slots.next_id;
            slots.next_id += 1;
            slots.queue.push_back((id, kind));
            id
        };
        debug!(id, ?kind, "Intent queued");
        let mut guard = IntentGuard {
            inner: &self.inner,
            id,
            queued: true,
        };
        loop {
            {
                let mut slots = self.inner.slots.lock();
                if kind.joinable() {
                    let joined = slots
                        .active
                        .as_ref()
                        .filter(|active| active.kind == kind)
                        .and_then(|active| active.completion.clone());
                    if let Some(completion) = joined {
                        debug!(id, ?kind, "Joining active operation");
                        return Admission::Join(completion);
                    }
                }
                let at_front = slots.queue.front().map(|(front, _)| *front) == Some(id);
                if slots.active.is_none() && at_front {
                    slots.queue.pop_front();
                    slots.active = Some(ActiveOperation {
                        id,
                        kind,
                        completion: None,
                        token,
                    });
                    guard.queued = false;
                    drop(slots);
                    debug!(id, ?kind, "Operation admitted");
                    self.inner.notify();
                    return Admission::Start(id);
                }
            }
            if changes.changed().await.is_err() {
                return Admission::Join(
                    futures::future::ready(Err(Error::unexpected_error(
                        "Serializer closed".to_owned(),
                    )))
                    .boxed()
                    .shared(),
                );
            }
        }
    }

    async fn run_joinable<F, Fut>(&self, kind: OperationKind, operation: F) -> Result<(), Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        match self.admit(kind, None).await {
            Admission::Join(completion) => completion.await,
            Admission::Start(id) => {
                let fut = operation();
                let finish = FinishGuard {
                    inner: self.inner.clone(),
                    id,
                };
                let handle = tokio::spawn(async move {
                    let _finish = finish;
                    fut.await
                });
                let completion = async move {
                    match handle.await {
                        Ok(result) => result,
                        Err(e) => Err(Error::unexpected_error(format!(
                            "Operation failed to complete: {}",
                            e
                        ))),
                    }
                }
                .boxed()
                .shared();
                self.inner.set_completion(id, completion.clone());
                completion.await
            }
        }
    }

    /// Run a request, joining an active request if there is one.
    pub async fn request<F, Fut>(&self, operation: F) -> Result<(), Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.run_joinable(OperationKind::Request, operation).await
    }

    /// Run a save, joining an active save if there is one.
    pub async fn save<F, Fut>(&self, operation: F) -> Result<(), Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.run_joinable(OperationKind::Save, operation).await
    }

    /// Run an ad-hoc task once every earlier operation is done.
    pub async fn run_task<T, F, Fut>(&self, task: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        self.run_task_with(None, |_| task()).await
    }

    /// Run a task that can be stopped by [Self::cancel] through its token.
    pub async fn run_cancellable_task<T, F, Fut>(&self, task: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        self.run_task_with(Some(CancellationToken::new()), task).await
    }

    async fn run_task_with<T, F, Fut>(
        &self,
        token: Option<CancellationToken>,
        task: F,
    ) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let body_token = token.clone().unwrap_or_default();
        let id = match self.admit(OperationKind::Task, token).await {
            Admission::Start(id) => id,
            Admission::Join(completion) => {
                completion.await?;
                return Err(Error::unexpected_error(
                    "Task admission joined another operation".to_owned(),
                ));
            }
        };
        let fut = task(body_token);
        let finish = FinishGuard {
            inner: self.inner.clone(),
            id,
        };
        let handle = tokio::spawn(async move {
            let _finish = finish;
            fut.await
        });
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::unexpected_error(format!(
                "Task failed to complete: {}",
                e
            ))),
        }
    }

    /// Cancel the active task if it is cancellable. Returns true if a token was tripped.
    pub fn cancel(&self) -> bool {
        let token = self
            .inner
            .slots
            .lock()
            .active
            .as_ref()
            .and_then(|active| active.token.clone());
        match token {
            Some(token) => {
                token.cancel();
                self.inner.notify();
                true
            }
            None => false,
        }
    }

    pub fn can_cancel(&self) -> bool {
        self.inner
            .slots
            .lock()
            .active
            .as_ref()
            .is_some_and(|active| active.token.is_some())
    }

    pub fn cancelled(&self) -> bool {
        self.inner
            .slots
            .lock()
            .active
            .as_ref()
            .and_then(|active| active.token.as_ref())
            .is_some_and(|token| token.is_cancelled())
    }

    pub fn state(&self) -> SerializerState {
        match self.inner.slots.lock().active.as_ref().map(|a| a.kind) {
            None => SerializerState::Idle,
            Some(OperationKind::Request) => SerializerState::Requesting,
            Some(OperationKind::Save) => SerializerState::Saving,
            Some(OperationKind::Task) => SerializerState::RunningTask,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.state() != SerializerState::Idle
    }

    /// Kinds of the intents waiting for admission, in admission order.
    pub fn pending_intents(&self) -> Vec<OperationKind> {
        self.inner
            .slots
            .lock()
            .queue
            .iter()
            .map(|(_, kind)| *kind)
            .collect()
    }

    /// Receiver bumped on every state transition.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }
}
