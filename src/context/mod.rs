//! Routing contexts and type-keyed attribute storage.
//!
//! An [`HttpContext`] binds a protocol and a path prefix to a handler plus
//! two ordered filter lists. Contexts are registered before serving begins;
//! the handler and filters can still be attached afterwards through the
//! shared handle returned at registration.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use crate::filter::{Filter, HttpHandler};

/// Type-keyed attribute map shared by the filters and handler of a context
/// or an exchange.
#[derive(Default)]
pub struct Attributes {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, returning the previous value of the same type.
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attributes").field("len", &self.map.len()).finish()
    }
}

/// A registered `(protocol, path)` binding.
///
/// The protocol and path are fixed at registration; the handler, filter
/// lists and attributes are behind locks so they may be attached through the
/// shared handle.
///
/// # Examples
///
/// ```
/// use http_engine::context::HttpContext;
///
/// let ctx = HttpContext::new("http", "/api");
/// assert_eq!(ctx.path(), "/api");
/// assert!(ctx.handler().is_none());
/// ```
pub struct HttpContext {
    protocol: String,
    path: String,
    handler: RwLock<Option<Arc<dyn HttpHandler>>>,
    system_filters: RwLock<Vec<Arc<dyn Filter>>>,
    filters: RwLock<Vec<Arc<dyn Filter>>>,
    attributes: RwLock<Attributes>,
}

impl HttpContext {
    /// Creates a context with no handler and empty filter lists.
    ///
    /// The protocol is stored lower-cased.
    pub fn new(protocol: &str, path: &str) -> Self {
        Self {
            protocol: protocol.to_ascii_lowercase(),
            path: path.to_owned(),
            handler: RwLock::new(None),
            system_filters: RwLock::new(Vec::new()),
            filters: RwLock::new(Vec::new()),
            attributes: RwLock::new(Attributes::new()),
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the handler, if one has been attached.
    pub fn handler(&self) -> Option<Arc<dyn HttpHandler>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Attaches (or replaces) the handler.
    pub fn set_handler(&self, handler: Arc<dyn HttpHandler>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Appends a user filter; user filters run inside the system filters.
    pub fn add_filter(&self, filter: Arc<dyn Filter>) {
        self.filters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(filter);
    }

    /// Appends a system filter; system filters run outermost.
    pub fn add_system_filter(&self, filter: Arc<dyn Filter>) {
        self.system_filters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(filter);
    }

    /// Snapshot of the full chain order: system filters, then user filters.
    pub fn filter_chain(&self) -> Vec<Arc<dyn Filter>> {
        let system = self.system_filters.read().unwrap_or_else(PoisonError::into_inner);
        let user = self.filters.read().unwrap_or_else(PoisonError::into_inner);
        system.iter().chain(user.iter()).cloned().collect()
    }

    /// Runs `f` with shared access to the context attributes.
    pub fn with_attributes<R>(&self, f: impl FnOnce(&Attributes) -> R) -> R {
        f(&self.attributes.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Runs `f` with exclusive access to the context attributes.
    pub fn with_attributes_mut<R>(&self, f: impl FnOnce(&mut Attributes) -> R) -> R {
        f(&mut self.attributes.write().unwrap_or_else(PoisonError::into_inner))
    }
}

impl fmt::Debug for HttpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpContext")
            .field("protocol", &self.protocol)
            .field("path", &self.path)
            .field("has_handler", &self.handler().is_some())
            .finish()
    }
}
