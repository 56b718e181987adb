//! The immutable, composable context carried by every task.
//!
//! A `Context` is a bag of elements keyed by element *type*: at most one
//! element per type. Well-known elements are the dispatcher, the parent task
//! link, and the failure-handler policy; any `Send + Sync + 'static` type can
//! be used as user metadata.
//!
//! Contexts never mutate. [`Context::merge`] produces a new context with a
//! right-biased key union, and [`Context::with_dispatcher_fallback`] installs
//! the process default dispatcher where none is present.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::dispatch::{default_dispatcher, Dispatcher};
use crate::error::Error;
use crate::task::core::TaskCore;

type ElementMap = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// An immutable set of keyed execution parameters.
///
/// Cloning is cheap (a reference-count bump); all combinators return new
/// contexts and leave their inputs untouched.
#[derive(Clone, Default)]
pub struct Context {
    entries: Arc<ElementMap>,
}

impl Context {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a context with `element` added, replacing any element of the
    /// same type.
    #[must_use]
    pub fn with<E: Any + Send + Sync>(&self, element: E) -> Self {
        let mut map: ElementMap = (*self.entries).clone();
        map.insert(TypeId::of::<E>(), Arc::new(element));
        Self {
            entries: Arc::new(map),
        }
    }

    /// Returns the element of type `E`, if present.
    #[must_use]
    pub fn get<E: Any + Send + Sync>(&self) -> Option<Arc<E>> {
        self.entries
            .get(&TypeId::of::<E>())
            .cloned()
            .and_then(|element| element.downcast::<E>().ok())
    }

    /// Returns true if an element of type `E` is present.
    #[must_use]
    pub fn contains<E: Any + Send + Sync>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<E>())
    }

    /// Returns the number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the context has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Right-biased key union: elements of `overrides` win over same-keyed
    /// elements of `self`.
    #[must_use]
    pub fn merge(&self, overrides: &Self) -> Self {
        if overrides.entries.is_empty() {
            return self.clone();
        }
        if self.entries.is_empty() {
            return overrides.clone();
        }
        let mut map: ElementMap = (*self.entries).clone();
        for (key, element) in overrides.entries.iter() {
            map.insert(*key, element.clone());
        }
        Self {
            entries: Arc::new(map),
        }
    }

    /// Element-wise identity comparison.
    ///
    /// Two contexts are the same when they hold the same keys and every
    /// element is the identical `Arc`. Merging a context with an empty delta
    /// therefore compares equal to the original.
    #[must_use]
    pub fn same_elements(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.entries, &other.entries) {
            return true;
        }
        if self.entries.len() != other.entries.len() {
            return false;
        }
        self.entries
            .iter()
            .all(|(key, element)| other.entries.get(key).is_some_and(|o| Arc::ptr_eq(element, o)))
    }

    /// Installs the process default dispatcher when no dispatcher element is
    /// present, tagging the result with [`DefaultDispatcherTag`] so diagnostics
    /// can tell a fallback-installed dispatcher from an explicit one.
    #[must_use]
    pub fn with_dispatcher_fallback(&self) -> Self {
        if self.contains::<DispatcherElement>() {
            return self.clone();
        }
        self.with(DispatcherElement::new(default_dispatcher()))
            .with(DefaultDispatcherTag)
    }

    /// Returns a context with the given dispatcher installed.
    #[must_use]
    pub fn with_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.with(DispatcherElement::new(dispatcher))
    }

    /// Returns a context with the given failure handler installed.
    ///
    /// A failure handler intercepts escalation from fire-and-forget tasks:
    /// when present, an uncaught body failure is delivered to the handler
    /// instead of cancelling the parent.
    #[must_use]
    pub fn with_failure_handler<F>(&self, handler: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.with(FailureHandlerElement::new(handler))
    }

    /// Returns the dispatcher element's dispatcher, if present.
    #[must_use]
    pub fn dispatcher(&self) -> Option<Arc<dyn Dispatcher>> {
        self.get::<DispatcherElement>().map(|e| e.dispatcher())
    }

    /// Conservative dispatcher-identity comparison: true when both contexts
    /// carry the identical dispatcher `Arc` (or neither carries one).
    #[must_use]
    pub fn same_dispatcher(&self, other: &Self) -> bool {
        match (self.dispatcher(), other.dispatcher()) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(&a, &b),
            _ => false,
        }
    }

    /// Returns true if the dispatcher was installed by
    /// [`with_dispatcher_fallback`](Self::with_dispatcher_fallback).
    #[must_use]
    pub fn has_default_dispatcher_tag(&self) -> bool {
        self.contains::<DefaultDispatcherTag>()
    }

    /// Returns the failure handler, if one is installed.
    #[must_use]
    pub fn failure_handler(&self) -> Option<Arc<dyn Fn(&Error) + Send + Sync>> {
        self.get::<FailureHandlerElement>().map(|e| e.handler())
    }

    /// Returns the parent task recorded in this context, if it is still live.
    pub(crate) fn parent(&self) -> Option<Arc<TaskCore>> {
        self.get::<ParentElement>().and_then(|p| p.0.upgrade())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("elements", &self.entries.len())
            .field("has_dispatcher", &self.contains::<DispatcherElement>())
            .field("default_dispatcher", &self.has_default_dispatcher_tag())
            .finish()
    }
}

/// The dispatcher element of a context.
pub struct DispatcherElement {
    inner: Arc<dyn Dispatcher>,
}

impl DispatcherElement {
    /// Wraps a dispatcher as a context element.
    #[must_use]
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { inner: dispatcher }
    }

    /// Returns the wrapped dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> Arc<dyn Dispatcher> {
        self.inner.clone()
    }
}

/// Marker element: the context's dispatcher came from the process default
/// rather than an explicit installation.
#[derive(Debug, Clone, Copy)]
pub struct DefaultDispatcherTag;

/// The failure-handler element of a context.
pub struct FailureHandlerElement {
    handler: Arc<dyn Fn(&Error) + Send + Sync>,
}

impl FailureHandlerElement {
    /// Wraps a failure handler as a context element.
    #[must_use]
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
        }
    }

    /// Returns the wrapped handler.
    #[must_use]
    pub fn handler(&self) -> Arc<dyn Fn(&Error) + Send + Sync> {
        self.handler.clone()
    }
}

/// The parent-task link element. Installed by the builders so work spawned
/// from inside a body attaches to the spawning task.
pub(crate) struct ParentElement(pub(crate) Weak<TaskCore>);
