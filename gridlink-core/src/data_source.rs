//! # Data source
//!
//! [DataSource] is the client-side model of a query against a database: it keeps the
//! query options, the slice window, the results with their actions and some diagnostics,
//! and funnels every request, save and ad-hoc task through a [MutationSerializer].
//!
//! The remote part is provided by a [DataSourceBackend]. A request snapshots the pending
//! options as the previous options before calling the backend, so that
//! [DataSource::refresh_data] can later undo unsaved edits of the options.
//!
//! The `error` field is not written by requests or saves; failures are returned to the
//! caller, and presentation code decides whether to record them with [DataSource::set_error].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::DataSourceConfig;
use crate::error::Error;
use crate::results::{ActionExtension, ActionKind, DataAction, DataResult, ResultRef, ResultSetStore};
use crate::serializer::{MutationSerializer, OperationKind, SerializerState};
use crate::task::CancellationToken;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AccessMode {
    #[default]
    Default,
    Readonly,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataFormat {
    #[default]
    Resultset,
    Document,
    Text,
}

/// Diagnostics of the last request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RequestInfo {
    pub original_query: String,
    pub request_duration_ms: u64,
    pub request_message: String,
    pub request_filter: String,
    pub source: Option<String>,
    pub requested_at: Option<DateTime<Utc>>,
}

/// Everything a backend needs to execute a request.
#[derive(Debug, Clone)]
pub struct DataRequest<O, R> {
    pub options: Option<O>,
    pub prev_results: Vec<R>,
    pub offset: u64,
    pub count: u64,
    pub data_format: DataFormat,
}

/// Remote side of a data source.
/// Sources without a total count return [crate::error::ErrorType::NotSupported]
/// from `load_total_count`.
#[async_trait]
pub trait DataSourceBackend<O, R>: Send + Sync {
    /// Execute the query; `None` keeps the current results.
    async fn request(&self, request: DataRequest<O, R>) -> Result<Option<Vec<R>>, Error>;

    /// Persist the results, returning the results as stored by the server.
    async fn save(&self, results: Vec<R>) -> Result<Vec<R>, Error>;

    /// Count all rows of `result`; should stop early once `token` is cancelled.
    async fn load_total_count(&self, result: R, token: CancellationToken) -> Result<u64, Error>;
}

/// Live query session the results belong to.
#[async_trait]
pub trait ExecutionContext: Send + Sync {
    /// Server side id; `None` once the session is gone.
    fn context_id(&self) -> Option<String>;

    async fn destroy(&self) -> Result<(), Error>;
}

struct SourceState<O, R: 'static> {
    store: ResultSetStore<R>,
    access: AccessMode,
    data_format: DataFormat,
    supported_data_formats: Vec<DataFormat>,
    constraints_available: bool,
    offset: u64,
    count: u64,
    options: Option<O>,
    prev_options: Option<O>,
    request_info: RequestInfo,
    error: Option<Error>,
    execution_context: Option<Arc<dyn ExecutionContext>>,
    outdated: bool,
    disabled: bool,
    last_action: OperationKind,
    total_count_token: Option<CancellationToken>,
}

struct DataSourceInner<O, R: 'static> {
    backend: Arc<dyn DataSourceBackend<O, R>>,
    state: Mutex<SourceState<O, R>>,
    serializer: MutationSerializer,
    changes: watch::Sender<u64>,
}

impl<O, R: 'static> DataSourceInner<O, R> {
    fn notify(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }
}

pub struct DataSource<O, R: 'static> {
    inner: Arc<DataSourceInner<O, R>>,
}

impl<O, R: 'static> Clone for DataSource<O, R> {
    fn clone(&self) -> Self {
        DataSource {
            inner: self.inner.clone(),
        }
    }
}

impl<O, R> DataSource<O, R>
where
    O: Clone + Send + Sync + 'static,
    R: DataResult,
{
    pub fn new(backend: Arc<dyn DataSourceBackend<O, R>>, config: &DataSourceConfig) -> Self {
        let (changes, _) = watch::channel(0);
        DataSource {
            inner: Arc::new(DataSourceInner {
                backend,
                state: Mutex::new(SourceState {
                    store: ResultSetStore::new(),
                    access: config.access,
                    data_format: config.data_format,
                    supported_data_formats: vec![config.data_format],
                    constraints_available: true,
                    offset: 0,
                    count: config.fetch_size,
                    options: None,
                    prev_options: None,
                    request_info: RequestInfo::default(),
                    error: None,
                    execution_context: None,
                    outdated: false,
                    disabled: false,
                    last_action: OperationKind::Request,
                    total_count_token: None,
                }),
                serializer: MutationSerializer::new(),
                changes,
            }),
        }
    }

    fn update<F: FnOnce(&mut SourceState<O, R>)>(&self, update: F) -> &Self {
        update(&mut self.inner.state.lock());
        self.inner.notify();
        self
    }

    /// Fetch results for the current options.
    /// Waits for an active save; joins an active request instead of issuing another one.
    pub async fn request_data(&self) -> Result<(), Error> {
        let inner = self.inner.clone();
        self.inner
            .serializer
            .request(move || {
                let request = {
                    let mut state = inner.state.lock();
                    state.last_action = OperationKind::Request;
                    state.prev_options = state.options.clone();
                    DataRequest {
                        options: state.options.clone(),
                        prev_results: state.store.results().to_vec(),
                        offset: state.offset,
                        count: state.count,
                        data_format: state.data_format,
                    }
                };
                inner.notify();
                async move {
                    let started = Instant::now();
                    let requested_at = Utc::now();
                    let data = inner.backend.request(request).await?;
                    {
                        let mut state = inner.state.lock();
                        state.outdated = false;
                        state.request_info.request_duration_ms =
                            started.elapsed().as_millis() as u64;
                        state.request_info.requested_at = Some(requested_at);
                        if let Some(results) = data {
                            debug!(results = results.len(), "Request returned results");
                            state.store.set_results(results);
                        }
                    }
                    inner.notify();
                    Ok(())
                }
            })
            .await
    }

    /// Restore the options of the last request and request again.
    pub async fn refresh_data(&self) -> Result<(), Error> {
        self.update(|state| {
            if let Some(prev) = state.prev_options.clone() {
                state.options = Some(prev);
            }
        });
        self.request_data().await
    }

    /// Save the current results.
    /// Waits for an active request; joins an active save instead of issuing another one.
    pub async fn save_data(&self) -> Result<(), Error> {
        let inner = self.inner.clone();
        self.inner
            .serializer
            .save(move || {
                let results = {
                    let mut state = inner.state.lock();
                    state.last_action = OperationKind::Save;
                    state.store.results().to_vec()
                };
                async move {
                    let saved = inner.backend.save(results).await?;
                    inner.state.lock().store.set_results(saved);
                    inner.notify();
                    Ok(())
                }
            })
            .await
    }

    /// Repeat the most recently initiated request or save.
    pub async fn retry(&self) -> Result<(), Error> {
        let last_action = self.inner.state.lock().last_action;
        info!(?last_action, "Retrying");
        match last_action {
            OperationKind::Save => self.save_data().await,
            _ => self.request_data().await,
        }
    }

    /// Run an ad-hoc task after every earlier request, save and task.
    pub async fn run_task<T, F, Fut>(&self, task: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>> + Send + 'static,
    {
        self.inner.serializer.run_task(task).await
    }

    /// Like [Self::run_task], the task can be stopped with [Self::cancel].
    pub async fn run_cancellable_task<T, F, Fut>(&self, task: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>> + Send + 'static,
    {
        self.inner.serializer.run_cancellable_task(task).await
    }

    /// Cancel the active task if it is cancellable; a no-op otherwise.
    pub fn cancel(&self) -> bool {
        let cancelled = self.inner.serializer.cancel();
        if cancelled {
            self.inner.notify();
        }
        cancelled
    }

    pub fn can_cancel(&self) -> bool {
        self.inner.serializer.can_cancel()
    }

    pub fn cancelled(&self) -> bool {
        self.inner.serializer.cancelled()
    }

    /// Ask the backend for the total row count of a result and store it in the result.
    pub async fn load_total_count(&self, index: usize) -> Result<u64, Error> {
        let inner = self.inner.clone();
        self.inner
            .serializer
            .run_cancellable_task(move |token| async move {
                let result = {
                    let mut state = inner.state.lock();
                    let len = state.store.len();
                    let result = state.store.result(index).cloned();
                    if result.is_some() {
                        state.total_count_token = Some(token.clone());
                    }
                    result.ok_or_else(|| Error::index_out_of_range(index, len))?
                };
                let count = inner.backend.load_total_count(result, token).await;
                {
                    let mut state = inner.state.lock();
                    state.total_count_token = None;
                    if let Ok(total) = &count {
                        state.store.set_total_count(index, *total);
                    }
                }
                inner.notify();
                count
            })
            .await
    }

    /// Cancel a running [Self::load_total_count]. Returns true if one was running.
    pub fn cancel_load_total_count(&self) -> bool {
        let token = self.inner.state.lock().total_count_token.take();
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn state(&self) -> SerializerState {
        self.inner.serializer.state()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.serializer.is_busy()
    }

    pub fn is_loadable(&self) -> bool {
        !self.is_loading() && !self.inner.state.lock().disabled
    }

    pub fn is_disabled(&self, _index: usize) -> bool {
        self.is_loading() || self.inner.state.lock().disabled
    }

    /// A result is read-only in read-only mode, when several results are present,
    /// without a live execution context, or while the source is disabled.
    pub fn is_readonly(&self, _index: usize) -> bool {
        let state = self.inner.state.lock();
        state.access == AccessMode::Readonly
            || state.store.len() > 1
            || state
                .execution_context
                .as_ref()
                .and_then(|context| context.context_id())
                .is_none()
            || state.disabled
    }

    pub fn is_outdated(&self) -> bool {
        self.inner.state.lock().outdated
    }

    pub fn set_outdated(&self) -> &Self {
        self.update(|state| state.outdated = true)
    }

    pub fn set_disabled(&self, disabled: bool) -> &Self {
        self.update(|state| state.disabled = disabled)
    }

    pub fn access(&self) -> AccessMode {
        self.inner.state.lock().access
    }

    pub fn set_access(&self, access: AccessMode) -> &Self {
        self.update(|state| state.access = access)
    }

    pub fn slice(&self) -> (u64, u64) {
        let state = self.inner.state.lock();
        (state.offset, state.count)
    }

    pub fn set_slice(&self, offset: u64, count: u64) -> &Self {
        self.update(|state| {
            state.offset = offset;
            state.count = count;
        })
    }

    pub fn options(&self) -> Option<O> {
        self.inner.state.lock().options.clone()
    }

    pub fn prev_options(&self) -> Option<O> {
        self.inner.state.lock().prev_options.clone()
    }

    pub fn set_options(&self, options: O) -> &Self {
        self.update(|state| state.options = Some(options))
    }

    pub fn data_format(&self) -> DataFormat {
        self.inner.state.lock().data_format
    }

    pub fn set_data_format(&self, data_format: DataFormat) -> &Self {
        self.update(|state| state.data_format = data_format)
    }

    pub fn supported_data_formats(&self) -> Vec<DataFormat> {
        self.inner.state.lock().supported_data_formats.clone()
    }

    /// Falls back to the first supported format if the current one is not supported.
    pub fn set_supported_data_formats(&self, data_formats: Vec<DataFormat>) -> &Self {
        self.update(|state| {
            if !data_formats.contains(&state.data_format) {
                if let Some(first) = data_formats.first() {
                    state.data_format = *first;
                }
            }
            state.supported_data_formats = data_formats;
        })
    }

    pub fn constraints_available(&self) -> bool {
        self.inner.state.lock().constraints_available
    }

    pub fn set_constraints_available(&self, available: bool) -> &Self {
        self.update(|state| state.constraints_available = available)
    }

    pub fn set_execution_context(&self, context: Option<Arc<dyn ExecutionContext>>) -> &Self {
        self.update(|state| state.execution_context = context)
    }

    pub fn execution_context(&self) -> Option<Arc<dyn ExecutionContext>> {
        self.inner.state.lock().execution_context.clone()
    }

    pub fn request_info(&self) -> RequestInfo {
        self.inner.state.lock().request_info.clone()
    }

    pub fn set_request_info(&self, request_info: RequestInfo) -> &Self {
        self.update(|state| state.request_info = request_info)
    }

    pub fn error(&self) -> Option<Error> {
        self.inner.state.lock().error.clone()
    }

    pub fn set_error(&self, error: Error) -> &Self {
        self.update(|state| state.error = Some(error))
    }

    pub fn clear_error(&self) -> &Self {
        self.update(|state| state.error = None)
    }

    pub fn results(&self) -> Vec<R> {
        self.inner.state.lock().store.results().to_vec()
    }

    pub fn result(&self, index: usize) -> Option<R> {
        self.inner.state.lock().store.result(index).cloned()
    }

    pub fn has_result(&self, index: usize) -> bool {
        self.inner.state.lock().store.has_result(index)
    }

    pub fn set_results(&self, results: Vec<R>) -> &Self {
        self.update(|state| state.store.set_results(results))
    }

    pub fn set_total_count(&self, index: usize, count: u64) -> &Self {
        self.update(|state| state.store.set_total_count(index, count))
    }

    /// Drop results and error, and mark the source outdated.
    pub fn reset_data(&self) -> &Self {
        self.update(|state| {
            state.error = None;
            state.store.clear();
            state.outdated = true;
        })
    }

    pub fn register_action<T: DataAction<R>>(&self) -> &Self {
        self.update(|state| state.store.register_action::<T>())
    }

    pub fn get_action<'a, T: DataAction<R>>(
        &self,
        address: impl Into<ResultRef<'a, R>>,
    ) -> Result<Arc<T>, Error> {
        self.inner.state.lock().store.get_action::<T>(address)
    }

    pub fn try_get_action<'a, T: DataAction<R>>(
        &self,
        address: impl Into<ResultRef<'a, R>>,
    ) -> Option<Arc<T>> {
        self.inner.state.lock().store.try_get_action::<T>(address)
    }

    pub fn get_action_implementation<'a>(
        &self,
        address: impl Into<ResultRef<'a, R>>,
        interface: ActionKind,
    ) -> Option<Arc<dyn ActionExtension<R>>> {
        self.inner
            .state
            .lock()
            .store
            .get_action_implementation(address, interface)
    }

    /// Receiver bumped on every change of the source state.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    /// Receiver bumped on every transition of the operation serializer.
    pub fn subscribe_activity(&self) -> watch::Receiver<u64> {
        self.inner.serializer.subscribe()
    }

    /// Cancel the active task and release the execution context.
    pub async fn dispose(&self) -> Result<(), Error> {
        self.cancel();
        let context = self.inner.state.lock().execution_context.take();
        if let Some(context) = context {
            debug!(context = ?context.context_id(), "Destroying execution context");
            context.destroy().await?;
        }
        self.inner.notify();
        Ok(())
    }
}
