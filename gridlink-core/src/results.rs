//! # Result set store
//!
//! [ResultSetStore] owns the results of a data source and the per-result *actions*.
//! An action is an extension object adding behavior to one result (editing, formatting,
//! selection, ...). Actions are addressed by a stable [ActionKind] tag, registered on the
//! store once, and constructed lazily per result on first access.
//!
//! Extensions are keyed by [DataResult::unique_result_id]. When the results are replaced,
//! extensions of results that are still present are notified by
//! [ActionExtension::result_updated]; extensions of results that disappeared are disposed.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::Error;

/// Stable tag identifying an action kind or an action interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActionKind(pub &'static str);

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A result produced by a data source.
pub trait DataResult: Clone + Send + Sync + 'static {
    /// Identity of the result across result replacements.
    fn unique_result_id(&self) -> &str;

    fn total_count(&self) -> Option<u64> {
        None
    }

    fn set_total_count(&mut self, _count: u64) {}
}

/// Object-safe part of an action.
/// Implementations keep their state behind interior mutability; the store hands out `Arc`s.
pub trait ActionExtension<R>: Send + Sync + 'static {
    fn kind(&self) -> ActionKind;

    /// The result this action is attached to was replaced by a result with the same id.
    fn result_updated(&self, _result: &R) {}

    /// The result this action is attached to is gone.
    fn dispose(&self) {}
}

/// Typed action constructible by the store.
pub trait DataAction<R>: ActionExtension<R> + Sized {
    const KIND: ActionKind;
    /// Interfaces implemented by this action, resolvable with
    /// [ResultSetStore::get_action_implementation].
    const IMPLEMENTS: &'static [ActionKind] = &[];

    fn create(result: &R) -> Self;
}

struct ActionSlot<R> {
    extension: Arc<dyn ActionExtension<R>>,
    any: Arc<dyn Any + Send + Sync>,
}

impl<R> Clone for ActionSlot<R> {
    fn clone(&self) -> Self {
        ActionSlot {
            extension: self.extension.clone(),
            any: self.any.clone(),
        }
    }
}

struct ActionRegistration<R> {
    implements: &'static [ActionKind],
    create: fn(&R) -> ActionSlot<R>,
}

fn create_slot<R, T: DataAction<R>>(result: &R) -> ActionSlot<R> {
    let action = Arc::new(T::create(result));
    ActionSlot {
        extension: action.clone(),
        any: action,
    }
}

/// Result addressed by position or directly.
#[derive(Debug, Clone, Copy)]
pub enum ResultRef<'a, R> {
    Index(usize),
    Result(&'a R),
}

impl<R> From<usize> for ResultRef<'_, R> {
    fn from(index: usize) -> Self {
        ResultRef::Index(index)
    }
}

impl<'a, R> From<&'a R> for ResultRef<'a, R> {
    fn from(result: &'a R) -> Self {
        ResultRef::Result(result)
    }
}

pub struct ResultSetStore<R: 'static> {
    results: Vec<R>,
    registrations: BTreeMap<ActionKind, ActionRegistration<R>>,
    extensions: HashMap<String, BTreeMap<ActionKind, ActionSlot<R>>>,
}

impl<R: DataResult> Default for ResultSetStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: DataResult> ResultSetStore<R> {
    pub fn new() -> Self {
        ResultSetStore {
            results: Vec::new(),
            registrations: BTreeMap::new(),
            extensions: HashMap::new(),
        }
    }

    /// Make action `T` constructible for every result of this store.
    pub fn register_action<T: DataAction<R>>(&mut self) {
        self.registrations.insert(
            T::KIND,
            ActionRegistration {
                implements: T::IMPLEMENTS,
                create: create_slot::<R, T>,
            },
        );
    }

    pub fn registered_actions(&self) -> Vec<ActionKind> {
        self.registrations.keys().copied().collect()
    }

    pub fn results(&self) -> &[R] {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn has_result(&self, index: usize) -> bool {
        index < self.results.len()
    }

    pub fn result(&self, index: usize) -> Option<&R> {
        self.results.get(index)
    }

    /// Replace all results, migrating or disposing their actions.
    pub fn set_results(&mut self, results: Vec<R>) {
        let ids: HashSet<&str> = results.iter().map(|r| r.unique_result_id()).collect();
        let vanished: Vec<String> = self
            .extensions
            .keys()
            .filter(|id| !ids.contains(id.as_str()))
            .cloned()
            .collect();
        for id in vanished {
            if let Some(slots) = self.extensions.remove(&id) {
                debug!(result = %id, actions = slots.len(), "Disposing actions of removed result");
                for slot in slots.values() {
                    slot.extension.dispose();
                }
            }
        }
        for result in results.iter() {
            if let Some(slots) = self.extensions.get(result.unique_result_id()) {
                for slot in slots.values() {
                    slot.extension.result_updated(result);
                }
            }
        }
        self.results = results;
    }

    pub fn set_total_count(&mut self, index: usize, count: u64) {
        if let Some(result) = self.results.get_mut(index) {
            result.set_total_count(count);
        }
    }

    fn resolve<'a>(&'a self, address: ResultRef<'a, R>) -> Result<&'a R, Error> {
        match address {
            ResultRef::Index(index) => self
                .results
                .get(index)
                .ok_or_else(|| Error::index_out_of_range(index, self.results.len())),
            ResultRef::Result(result) => Ok(result),
        }
    }

    fn get_or_create(&mut self, result: &R, kind: ActionKind) -> Result<ActionSlot<R>, Error> {
        let id = result.unique_result_id();
        if let Some(slot) = self.extensions.get(id).and_then(|slots| slots.get(&kind)) {
            return Ok(slot.clone());
        }
        let registration = self.registrations.get(&kind).ok_or_else(|| {
            Error::action_not_registered(kind, &self.registered_actions())
        })?;
        debug!(result = %id, action = %kind, "Creating action");
        let slot = (registration.create)(result);
        self.extensions
            .entry(id.to_owned())
            .or_default()
            .insert(kind, slot.clone());
        Ok(slot)
    }

    /// Action `T` of the addressed result, constructed on first access.
    pub fn get_action<'a, T: DataAction<R>>(
        &mut self,
        address: impl Into<ResultRef<'a, R>>,
    ) -> Result<Arc<T>, Error> {
        let result = self.resolve(address.into())?.clone();
        let slot = self.get_or_create(&result, T::KIND)?;
        slot.any.downcast::<T>().map_err(|_| {
            Error::unexpected_error(format!("Action '{}' has an unexpected type", T::KIND))
        })
    }

    /// Action `T` of the addressed result if it was already constructed.
    pub fn try_get_action<'a, T: DataAction<R>>(
        &self,
        address: impl Into<ResultRef<'a, R>>,
    ) -> Option<Arc<T>> {
        let result = self.resolve(address.into()).ok()?;
        let slot = self
            .extensions
            .get(result.unique_result_id())?
            .get(&T::KIND)?;
        slot.any.clone().downcast::<T>().ok()
    }

    /// First registered action that is or implements `interface`, constructed on demand.
    pub fn get_action_implementation<'a>(
        &mut self,
        address: impl Into<ResultRef<'a, R>>,
        interface: ActionKind,
    ) -> Option<Arc<dyn ActionExtension<R>>> {
        let result = self.resolve(address.into()).ok()?.clone();
        let kind = self
            .registrations
            .iter()
            .find(|(kind, registration)| {
                **kind == interface || registration.implements.contains(&interface)
            })
            .map(|(kind, _)| *kind)?;
        self.get_or_create(&result, kind)
            .ok()
            .map(|slot| slot.extension)
    }

    /// Dispose all actions and drop all results.
    pub fn clear(&mut self) {
        self.set_results(Vec::new());
    }
}

impl<R: 'static> Drop for ResultSetStore<R> {
    fn drop(&mut self) {
        for slots in self.extensions.values() {
            for slot in slots.values() {
                slot.extension.dispose();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorType;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, Clone)]
    struct Rows {
        id: String,
        rows: usize,
        total: Option<u64>,
    }

    impl Rows {
        fn new(id: &str, rows: usize) -> Self {
            Rows {
                id: id.to_owned(),
                rows,
                total: None,
            }
        }
    }

    impl DataResult for Rows {
        fn unique_result_id(&self) -> &str {
            &self.id
        }
        fn total_count(&self) -> Option<u64> {
            self.total
        }
        fn set_total_count(&mut self, count: u64) {
            self.total = Some(count);
        }
    }

    const FORMAT: ActionKind = ActionKind("format");

    #[derive(Debug)]
    struct EditAction {
        rows: Mutex<usize>,
        disposed: AtomicBool,
        updates: AtomicUsize,
    }

    impl ActionExtension<Rows> for EditAction {
        fn kind(&self) -> ActionKind {
            Self::KIND
        }
        fn result_updated(&self, result: &Rows) {
            *self.rows.lock() = result.rows;
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
        fn dispose(&self) {
            self.disposed.store(true, Ordering::SeqCst);
        }
    }

    impl DataAction<Rows> for EditAction {
        const KIND: ActionKind = ActionKind("edit");
        const IMPLEMENTS: &'static [ActionKind] = &[FORMAT];

        fn create(result: &Rows) -> Self {
            EditAction {
                rows: Mutex::new(result.rows),
                disposed: AtomicBool::new(false),
                updates: AtomicUsize::new(0),
            }
        }
    }

    #[derive(Debug)]
    struct SelectAction;

    impl ActionExtension<Rows> for SelectAction {
        fn kind(&self) -> ActionKind {
            Self::KIND
        }
    }

    impl DataAction<Rows> for SelectAction {
        const KIND: ActionKind = ActionKind("select");
        fn create(_result: &Rows) -> Self {
            SelectAction
        }
    }

    fn store() -> ResultSetStore<Rows> {
        let mut store = ResultSetStore::new();
        store.register_action::<EditAction>();
        store.set_results(vec![Rows::new("r1", 10)]);
        store
    }

    #[test]
    fn get_action_is_cached_per_result() {
        let mut store = store();
        let a = store.get_action::<EditAction>(0usize).unwrap();
        let b = store.get_action::<EditAction>(0usize).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let result = store.result(0).unwrap().clone();
        let c = store.get_action::<EditAction>(&result).unwrap();
        assert!(Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn out_of_range_index() {
        let mut store = store();
        let e = store.get_action::<EditAction>(3usize).unwrap_err();
        assert_eq!(e.error_type, ErrorType::IndexOutOfRange);
        assert!(store.try_get_action::<EditAction>(3usize).is_none());
        assert!(store.get_action_implementation(3usize, FORMAT).is_none());
    }

    #[test]
    fn unregistered_action_fails() {
        let mut store = store();
        let e = store.get_action::<SelectAction>(0usize).unwrap_err();
        assert_eq!(e.error_type, ErrorType::ActionNotRegistered);
        assert_eq!(
            e.message,
            "Action 'select' not registered, available actions: 'edit'"
        );
    }

    #[test]
    fn try_get_does_not_construct() {
        let mut store = store();
        assert!(store.try_get_action::<EditAction>(0usize).is_none());
        store.get_action::<EditAction>(0usize).unwrap();
        assert!(store.try_get_action::<EditAction>(0usize).is_some());
    }

    #[test]
    fn implementation_resolves_by_interface() {
        let mut store = store();
        let implementation = store.get_action_implementation(0usize, FORMAT).unwrap();
        assert_eq!(implementation.kind(), EditAction::KIND);
        assert!(store.get_action_implementation(0usize, ActionKind("missing")).is_none());
    }

    #[test]
    fn replacing_results_migrates_and_disposes() {
        let mut store = store();
        store.set_results(vec![Rows::new("r1", 10), Rows::new("r2", 1)]);
        let kept = store.get_action::<EditAction>(0usize).unwrap();
        let dropped = store.get_action::<EditAction>(1usize).unwrap();

        store.set_results(vec![Rows::new("r1", 25)]);
        assert_eq!(*kept.rows.lock(), 25);
        assert_eq!(kept.updates.load(Ordering::SeqCst), 1);
        assert!(!kept.disposed.load(Ordering::SeqCst));
        assert!(dropped.disposed.load(Ordering::SeqCst));
        assert!(Arc::ptr_eq(&kept, &store.get_action::<EditAction>(0usize).unwrap()));
    }

    #[test]
    fn dropping_store_disposes_actions() {
        let mut store = store();
        let action = store.get_action::<EditAction>(0usize).unwrap();
        drop(store);
        assert!(action.disposed.load(Ordering::SeqCst));
    }

    #[test]
    fn total_count_is_written_to_result() {
        let mut store = store();
        store.set_total_count(0, 1234);
        store.set_total_count(7, 1);
        assert_eq!(store.result(0).unwrap().total_count(), Some(1234));
    }
}
