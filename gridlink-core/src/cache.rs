//! # Cached data
//!
//! [CachedData] holds a single value produced by an asynchronous [DataLoader].
//! It is the building block of resources such as [crate::user_info::UserInfoResource].
//!
//! A load is parameterized by an [Includes] set. Includes requested once are remembered
//! and merged into every later load, until [CachedData::reset_includes] is called.
//! Concurrent loads are deduplicated: while a load is in flight, every compatible
//! `load` call joins it and receives the same value. A load that needs more includes
//! than the in-flight one waits for it and then fetches again.
//!
//! ## Notifications
//! - data version (watch) - bumped on every change of the cached value or of the loading state,
//! - identity change (broadcast) - the identity key of the value changed,
//! - exceptions (broadcast) - loader failures, when at least one subscriber exists,
//! - data outdated (broadcast) - dependent resources should be refreshed.
//!
//! When a loader fails and somebody is subscribed to exceptions, the failure is forwarded
//! to the subscribers and the cached value becomes `T::default()`. Without subscribers the
//! failure is returned to the caller; the cached value is reset to `T::default()` as well,
//! so that no stale value survives a failed load.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::registry::{RegisteredResource, ResourceRegistry};

/// Set of include flags selecting optional fields of a fetch.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Includes(BTreeSet<String>);

impl Includes {
    pub fn new() -> Self {
        Includes(BTreeSet::new())
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Includes(names.into_iter().map(Into::into).collect())
    }

    pub fn with(mut self, name: &str) -> Self {
        self.insert(name);
        self
    }

    pub fn insert(&mut self, name: &str) {
        self.0.insert(name.to_owned());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    /// True if every flag of `other` is present in `self`.
    pub fn contains_all(&self, other: &Includes) -> bool {
        other.0.is_subset(&self.0)
    }

    pub fn union(&self, other: &Includes) -> Includes {
        Includes(self.0.union(&other.0).cloned().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Producer of the cached value.
#[async_trait]
pub trait DataLoader<T>: Send + Sync {
    async fn load(&self, includes: &Includes) -> Result<T, Error>;
}

/// [DataLoader] backed by a closure.
pub struct FnLoader<F>(pub F);

#[async_trait]
impl<T, F, Fut> DataLoader<T> for FnLoader<F>
where
    T: Send + 'static,
    F: Fn(Includes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, Error>> + Send + 'static,
{
    async fn load(&self, includes: &Includes) -> Result<T, Error> {
        (self.0)(includes.clone()).await
    }
}

/// Anything that can be told its data is no longer current.
pub trait Outdatable: Send + Sync {
    fn mark_outdated(&self);
}

/// Computes the identity key of a cached value, e.g. the user id.
pub type IdentityFn<T> = fn(&T) -> String;

type SharedLoad<T> = Shared<BoxFuture<'static, Result<T, Error>>>;

struct InFlight<T> {
    includes: Includes,
    future: SharedLoad<T>,
}

struct CacheState<T> {
    data: T,
    /// Includes of the last successful load (default includes excluded)
    includes: Includes,
    loaded: bool,
    outdated: bool,
    /// Bumped whenever the value is invalidated
    generation: u64,
    updating: usize,
    inflight: Option<InFlight<T>>,
}

struct CachedInner<T> {
    name: String,
    registry_id: u64,
    loader: Arc<dyn DataLoader<T>>,
    default_includes: Includes,
    identity: Option<IdentityFn<T>>,
    state: Mutex<CacheState<T>>,
    update_lock: tokio::sync::Mutex<()>,
    version: watch::Sender<u64>,
    identity_changes: broadcast::Sender<String>,
    exceptions: broadcast::Sender<Error>,
    data_outdated: broadcast::Sender<()>,
}

impl<T> Drop for CachedInner<T> {
    fn drop(&mut self) {
        ResourceRegistry::global().unregister(self.registry_id);
    }
}

impl<T: Clone + Default + Send + Sync + 'static> CachedInner<T> {
    fn bump_version(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Replace the value and fire the identity event if the identity key changed.
    fn replace_data(&self, state: &mut CacheState<T>, data: T) {
        let previous = self.identity.map(|identity| identity(&state.data));
        state.data = data;
        self.bump_version();
        if let Some(identity) = self.identity {
            let current = identity(&state.data);
            if previous.as_deref() != Some(current.as_str()) {
                info!(resource = %self.name, identity = %current, "Identity changed");
                let _ = self.identity_changes.send(current);
            }
        }
    }

    fn mark_outdated(&self) {
        {
            let mut state = self.state.lock();
            state.outdated = true;
            state.generation += 1;
        }
        self.bump_version();
        debug!(resource = %self.name, "Marked outdated");
        let _ = self.data_outdated.send(());
    }

    /// Call the loader and apply the exception policy. Nothing is stored.
    async fn fetch(&self, includes: &Includes) -> Result<T, Error> {
        let includes = self.default_includes.union(includes);
        match self.loader.load(&includes).await {
            Ok(data) => Ok(data),
            Err(e) => {
                if self.exceptions.receiver_count() == 0 {
                    return Err(e.with_resource(&self.name));
                }
                warn!(resource = %self.name, error = %e, "Loader failed, forwarded to exception subscribers");
                let _ = self.exceptions.send(e);
                Ok(T::default())
            }
        }
    }

    fn start_load(self: &Arc<Self>, state: &mut CacheState<T>, includes: Includes) -> SharedLoad<T> {
        debug!(resource = %self.name, includes = ?includes, "Starting load");
        let inner = self.clone();
        let load_includes = includes.clone();
        let generation = state.generation;
        let handle = tokio::spawn(async move {
            let result = inner.fetch(&load_includes).await;
            inner.commit(load_includes, generation, result)
        });
        let future = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(Error::unexpected_error(format!("Load task failed: {}", e))),
            }
        }
        .boxed()
        .shared();
        state.inflight = Some(InFlight {
            includes,
            future: future.clone(),
        });
        self.bump_version();
        future
    }

    /// Store the outcome of a load started at `generation`.
    /// An invalidation that arrived meanwhile keeps the value outdated.
    fn commit(&self, includes: Includes, generation: u64, result: Result<T, Error>) -> Result<T, Error> {
        let mut state = self.state.lock();
        state.inflight = None;
        match result {
            Ok(data) => {
                state.includes = includes;
                state.loaded = true;
                if state.generation == generation {
                    state.outdated = false;
                } else {
                    debug!(resource = %self.name, "Outdated during load, keeping the mark");
                }
                self.replace_data(&mut state, data.clone());
                Ok(data)
            }
            Err(e) => {
                warn!(resource = %self.name, error = %e, "Load failed, cached value cleared");
                state.loaded = false;
                state.outdated = true;
                self.replace_data(&mut state, T::default());
                Err(e)
            }
        }
    }
}

impl<T: Clone + Default + Send + Sync + 'static> RegisteredResource for CachedInner<T> {
    fn is_loaded(&self) -> bool {
        self.state.lock().loaded
    }

    fn is_loading(&self) -> bool {
        let state = self.state.lock();
        state.inflight.is_some() || state.updating > 0
    }

    fn is_outdated(&self) -> bool {
        self.state.lock().outdated
    }
}

impl<T: Clone + Default + Send + Sync + 'static> Outdatable for CachedInner<T> {
    fn mark_outdated(&self) {
        CachedInner::mark_outdated(self)
    }
}

/// Builder of [CachedData].
pub struct CachedDataBuilder<T> {
    name: String,
    loader: Arc<dyn DataLoader<T>>,
    default_includes: Includes,
    identity: Option<IdentityFn<T>>,
}

impl<T: Clone + Default + Send + Sync + 'static> CachedDataBuilder<T> {
    /// Includes merged into every load.
    pub fn default_includes(mut self, includes: Includes) -> Self {
        self.default_includes = includes;
        self
    }

    /// Identity key used for identity change notifications.
    pub fn identity(mut self, identity: IdentityFn<T>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Create the resource and register it in [ResourceRegistry::global].
    pub fn build(self) -> CachedData<T> {
        let (version, _) = watch::channel(0u64);
        let (identity_changes, _) = broadcast::channel(16);
        let (exceptions, _) = broadcast::channel(16);
        let (data_outdated, _) = broadcast::channel(16);
        let registry = ResourceRegistry::global();
        let inner = Arc::new_cyclic(|weak: &Weak<CachedInner<T>>| {
            let resource: Weak<dyn RegisteredResource> = weak.clone();
            let registry_id =
                registry.register(&self.name, std::any::type_name::<T>(), resource);
            CachedInner {
                name: self.name,
                registry_id,
                loader: self.loader,
                default_includes: self.default_includes,
                identity: self.identity,
                state: Mutex::new(CacheState {
                    data: T::default(),
                    includes: Includes::new(),
                    loaded: false,
                    outdated: false,
                    generation: 0,
                    updating: 0,
                    inflight: None,
                }),
                update_lock: tokio::sync::Mutex::new(()),
                version,
                identity_changes,
                exceptions,
                data_outdated,
            }
        });
        CachedData { inner }
    }
}

enum LoadStep<T> {
    Join(SharedLoad<T>),
    Wait(SharedLoad<T>),
}

struct UpdatingGuard<'a, T: Clone + Default + Send + Sync + 'static>(&'a CachedInner<T>);

impl<'a, T: Clone + Default + Send + Sync + 'static> UpdatingGuard<'a, T> {
    fn enter(inner: &'a CachedInner<T>) -> Self {
        inner.state.lock().updating += 1;
        inner.bump_version();
        UpdatingGuard(inner)
    }
}

impl<T: Clone + Default + Send + Sync + 'static> Drop for UpdatingGuard<'_, T> {
    fn drop(&mut self) {
        self.0.state.lock().updating -= 1;
        self.0.bump_version();
    }
}

/// Single-value cache with deduplicated asynchronous loading.
pub struct CachedData<T> {
    inner: Arc<CachedInner<T>>,
}

impl<T> Clone for CachedData<T> {
    fn clone(&self) -> Self {
        CachedData {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Default + Send + Sync + 'static> CachedData<T> {
    pub fn builder(name: &str, loader: Arc<dyn DataLoader<T>>) -> CachedDataBuilder<T> {
        CachedDataBuilder {
            name: name.to_owned(),
            loader,
            default_includes: Includes::new(),
            identity: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current value (`T::default()` until loaded).
    pub fn data(&self) -> T {
        self.inner.state.lock().data.clone()
    }

    /// Identity key of the current value, if an identity function is configured.
    pub fn identity(&self) -> Option<String> {
        let identity = self.inner.identity?;
        Some(identity(&self.inner.state.lock().data))
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.is_loaded()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.is_loading()
    }

    pub fn is_outdated(&self) -> bool {
        self.inner.is_outdated()
    }

    /// Includes that the next load will request (default includes included).
    pub fn includes(&self) -> Includes {
        self.inner
            .default_includes
            .union(&self.inner.state.lock().includes)
    }

    /// Forget includes requested by earlier loads and force the next load to fetch.
    pub fn reset_includes(&self) {
        {
            let mut state = self.inner.state.lock();
            state.includes = Includes::new();
            state.outdated = true;
            state.generation += 1;
        }
        self.inner.bump_version();
    }

    /// Mark the value outdated; the next load fetches again.
    /// Subscribers of [Self::subscribe_data_outdated] are notified every time, so two
    /// resources must not [follow](Self::follow) each other.
    pub fn mark_outdated(&self) {
        self.inner.mark_outdated();
    }

    /// Notify dependent resources without outdating this one.
    pub fn emit_data_outdated(&self) {
        let _ = self.inner.data_outdated.send(());
    }

    /// Replace the value wholesale. The value counts as freshly loaded.
    pub fn set_data(&self, data: T) {
        let mut state = self.inner.state.lock();
        state.loaded = true;
        state.outdated = false;
        self.inner.replace_data(&mut state, data);
    }

    /// Patch the value in place. Identity is not expected to change.
    pub fn update_in_place<F: FnOnce(&mut T)>(&self, update: F) {
        {
            let mut state = self.inner.state.lock();
            update(&mut state.data);
        }
        self.inner.bump_version();
    }

    /// Load the value, reusing the cached one when it is current and covers `includes`.
    pub async fn load(&self, includes: Option<&Includes>) -> Result<T, Error> {
        // loads never overlap a running update
        drop(self.inner.update_lock.lock().await);
        loop {
            let step = {
                let mut state = self.inner.state.lock();
                let mut target = state.includes.clone();
                if let Some(requested) = includes {
                    target = target.union(requested);
                }
                let available = self.inner.default_includes.union(&state.includes);
                if state.loaded && !state.outdated && available.contains_all(&target) {
                    return Ok(state.data.clone());
                }
                let inflight = state
                    .inflight
                    .as_ref()
                    .map(|f| (f.includes.contains_all(&target), f.future.clone()));
                match inflight {
                    Some((true, future)) => LoadStep::Join(future),
                    Some((false, future)) => LoadStep::Wait(future),
                    None => LoadStep::Join(self.inner.start_load(&mut state, target)),
                }
            };
            match step {
                LoadStep::Join(future) => return future.await,
                LoadStep::Wait(future) => {
                    let _ = future.await;
                }
            }
        }
    }

    /// Call the loader with the current includes, applying the exception policy.
    /// The result is not stored; combine with [Self::set_data].
    pub async fn fetch(&self) -> Result<T, Error> {
        let includes = self.inner.state.lock().includes.clone();
        self.inner.fetch(&includes).await
    }

    /// Run a mutation exclusively: waits for an in-flight load, and loads wait for it.
    /// The update must not call [Self::load] itself.
    pub async fn perform_update<F, Fut, R>(&self, update: F) -> Result<R, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, Error>>,
    {
        let _lock = self.inner.update_lock.lock().await;
        let inflight = self
            .inner
            .state
            .lock()
            .inflight
            .as_ref()
            .map(|f| f.future.clone());
        if let Some(future) = inflight {
            let _ = future.await;
        }
        let _updating = UpdatingGuard::enter(&self.inner);
        update().await
    }

    /// Mark this resource outdated whenever `source` fires (see [Self::subscribe_data_outdated]).
    /// The listener stops when either side is gone.
    pub fn follow(&self, mut source: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(()) | Err(RecvError::Lagged(_)) => match weak.upgrade() {
                        Some(inner) => inner.mark_outdated(),
                        None => break,
                    },
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Receiver of the data version, bumped on every observable change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }

    pub fn subscribe_identity_changes(&self) -> broadcast::Receiver<String> {
        self.inner.identity_changes.subscribe()
    }

    /// Registers an exception sink; loader failures are delivered here instead of the caller
    /// for as long as the receiver is alive.
    pub fn subscribe_exceptions(&self) -> broadcast::Receiver<Error> {
        self.inner.exceptions.subscribe()
    }

    pub fn subscribe_data_outdated(&self) -> broadcast::Receiver<()> {
        self.inner.data_outdated.subscribe()
    }
}

impl<T: Clone + Default + Send + Sync + 'static> Outdatable for CachedData<T> {
    fn mark_outdated(&self) {
        self.inner.mark_outdated();
    }
}
