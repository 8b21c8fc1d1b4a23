//! Context routing: map a `(protocol, path)` pair to a registered [`HttpContext`].
//!
//! Every request is routed to the context with the **longest** path that
//! matches it among the contexts registered for the request's protocol.
//! Two matching policies are available:
//!
//! | Mode           | Context | Matches                       | Does not match    |
//! |----------------|---------|-------------------------------|-------------------|
//! | `PathPrefix`   | `/`     | everything                    |                   |
//! | `PathPrefix`   | `/foo`  | `/foo`, `/foo/`, `/foo/bar`   | `/foobar`         |
//! | `PathPrefix`   | `/foo/` | `/foo/`, `/foo/bar`           | `/foo`, `/foobar` |
//! | `StringPrefix` | `/foo`  | `/foo`, `/foobar`, `/foo/bar` | `/fo`             |
//!
//! See [`MatchMode`] for the variants.
//!
//! Registration rejects a second context with the same protocol and exact path.

use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Deserialize;
use thiserror::Error;

use crate::context::HttpContext;

/// Errors raised by context registration and removal.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("a context for {protocol} {path} is already registered")]
    DuplicateContext { protocol: String, path: String },

    #[error("no context registered for {protocol} {path}")]
    NotFound { protocol: String, path: String },

    #[error("context path must start with '/': {path:?}")]
    InvalidPath { path: String },
}

/// Prefix-matching policy used when routing a request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Match only at `/` boundaries.
    #[default]
    PathPrefix,
    /// Match any literal string prefix.
    StringPrefix,
}

impl MatchMode {
    /// Returns `true` if `request_path` falls under `context_path`.
    ///
    /// # Examples
    ///
    /// ```
    /// use http_engine::router::MatchMode;
    ///
    /// assert!(MatchMode::PathPrefix.matches("/foo", "/foo/bar"));
    /// assert!(!MatchMode::PathPrefix.matches("/foo", "/foobar"));
    /// assert!(MatchMode::StringPrefix.matches("/foo", "/foobar"));
    /// ```
    pub fn matches(self, context_path: &str, request_path: &str) -> bool {
        match self {
            Self::StringPrefix => request_path.starts_with(context_path),
            Self::PathPrefix => {
                if context_path == "/" || context_path == request_path {
                    return true;
                }
                if context_path.ends_with('/') {
                    return request_path.starts_with(context_path);
                }
                request_path.starts_with(context_path)
                    && request_path.as_bytes().get(context_path.len()) == Some(&b'/')
            }
        }
    }
}

impl FromStr for MatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pathprefix" => Ok(Self::PathPrefix),
            "stringprefix" => Ok(Self::StringPrefix),
            other => Err(format!("unknown path matcher {other:?}")),
        }
    }
}

/// The set of registered contexts and the longest-match lookup over them.
///
/// Lookups take a read lock; registration and removal are serialized by the
/// write lock.
///
/// # Examples
///
/// ```
/// use http_engine::context::HttpContext;
/// use http_engine::router::{ContextRouter, MatchMode};
///
/// let router = ContextRouter::new(MatchMode::PathPrefix);
/// router.add(HttpContext::new("http", "/")).unwrap();
/// router.add(HttpContext::new("http", "/foo")).unwrap();
///
/// let hit = router.find("http", "/foo/bar").unwrap();
/// assert_eq!(hit.path(), "/foo");
/// assert_eq!(router.find("http", "/foobar").unwrap().path(), "/");
/// ```
#[derive(Debug)]
pub struct ContextRouter {
    mode: MatchMode,
    contexts: RwLock<Vec<Arc<HttpContext>>>,
}

impl ContextRouter {
    pub fn new(mode: MatchMode) -> Self {
        Self {
            mode,
            contexts: RwLock::new(Vec::new()),
        }
    }

    /// Registers `context` and returns the shared handle to it.
    ///
    /// # Errors
    ///
    /// - [`ContextError::InvalidPath`]: the path does not start with `/`.
    /// - [`ContextError::DuplicateContext`]: same protocol and exact path already present.
    pub fn add(&self, context: HttpContext) -> Result<Arc<HttpContext>, ContextError> {
        if !context.path().starts_with('/') {
            return Err(ContextError::InvalidPath {
                path: context.path().to_owned(),
            });
        }

        let mut contexts = self.contexts.write().unwrap_or_else(PoisonError::into_inner);
        if contexts
            .iter()
            .any(|c| c.protocol() == context.protocol() && c.path() == context.path())
        {
            return Err(ContextError::DuplicateContext {
                protocol: context.protocol().to_owned(),
                path: context.path().to_owned(),
            });
        }

        let context = Arc::new(context);
        contexts.push(Arc::clone(&context));
        Ok(context)
    }

    /// Removes the context registered for exactly `(protocol, path)`.
    ///
    /// # Errors
    ///
    /// [`ContextError::NotFound`] if no such context exists.
    pub fn remove(&self, protocol: &str, path: &str) -> Result<Arc<HttpContext>, ContextError> {
        let mut contexts = self.contexts.write().unwrap_or_else(PoisonError::into_inner);
        match contexts
            .iter()
            .position(|c| c.protocol().eq_ignore_ascii_case(protocol) && c.path() == path)
        {
            Some(index) => Ok(contexts.remove(index)),
            None => Err(ContextError::NotFound {
                protocol: protocol.to_owned(),
                path: path.to_owned(),
            }),
        }
    }

    /// Removes this exact context instance.
    ///
    /// # Errors
    ///
    /// [`ContextError::NotFound`] if it is not (or no longer) registered.
    pub fn remove_context(&self, context: &Arc<HttpContext>) -> Result<(), ContextError> {
        let mut contexts = self.contexts.write().unwrap_or_else(PoisonError::into_inner);
        let before = contexts.len();
        contexts.retain(|c| !Arc::ptr_eq(c, context));
        if contexts.len() == before {
            return Err(ContextError::NotFound {
                protocol: context.protocol().to_owned(),
                path: context.path().to_owned(),
            });
        }
        Ok(())
    }

    /// Returns the context with the longest path matching `path` among
    /// those registered for `protocol` (compared case-insensitively).
    pub fn find(&self, protocol: &str, path: &str) -> Option<Arc<HttpContext>> {
        let contexts = self.contexts.read().unwrap_or_else(PoisonError::into_inner);
        contexts
            .iter()
            .filter(|c| c.protocol().eq_ignore_ascii_case(protocol))
            .filter(|c| self.mode.matches(c.path(), path))
            .max_by_key(|c| c.path().len())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.contexts.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
