//! Shared-resource brokers.
//!
//! A root broker owns process-scoped resources for one attempt and hands out
//! job-scoped children. Closing the root tears down every child first, then
//! its own resources, each scope in reverse registration order. Children only
//! hold a weak reference back to the root, used for configuration lookup.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{JobId, Properties};

/// Something expensive a broker builds once and releases on close.
pub trait SharedResource: Send + Sync + 'static {
    fn close(&self) -> Result<()>;
}

/// Key of a job-scoped child broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobScope {
    pub job_name: String,
    pub job_id: JobId,
}

impl JobScope {
    pub fn new(job_name: impl Into<String>, job_id: JobId) -> Self {
        Self {
            job_name: job_name.into(),
            job_id,
        }
    }
}

impl std::fmt::Display for JobScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.job_name, self.job_id)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct Entry {
    key: String,
    value: Arc<dyn Any + Send + Sync>,
    closer: Arc<dyn SharedResource>,
}

#[derive(Default)]
struct Registry {
    entries: Vec<Entry>,
    closed: bool,
}

impl Registry {
    fn get_or_insert_with<T, F>(&mut self, key: &str, factory: F) -> Result<Arc<T>>
    where
        T: SharedResource,
        F: FnOnce() -> Result<T>,
    {
        if self.closed {
            return Err(Error::BrokerClosed);
        }
        if let Some(entry) = self.entries.iter().find(|e| e.key == key) {
            return Arc::clone(&entry.value)
                .downcast::<T>()
                .map_err(|_| Error::Other(format!("shared resource {key} has another type")));
        }

        let resource = Arc::new(factory()?);
        self.entries.push(Entry {
            key: key.to_string(),
            value: resource.clone(),
            closer: resource.clone(),
        });
        Ok(resource)
    }

    /// Close everything, newest first. Returns one message per failure.
    fn close(&mut self, scope: &str) -> Vec<String> {
        self.closed = true;
        let mut failures = Vec::new();
        while let Some(entry) = self.entries.pop() {
            match entry.closer.close() {
                Ok(()) => debug!(scope, key = %entry.key, "shared resource closed"),
                Err(e) => failures.push(format!("{scope}:{}: {e}", entry.key)),
            }
        }
        failures
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

struct RootInner {
    config: Properties,
    resources: Mutex<Registry>,
    children: Mutex<Vec<Arc<ChildInner>>>,
    closed: AtomicBool,
}

/// Top-level broker. Exactly one owner; closed exactly once.
pub struct RootBroker {
    inner: Arc<RootInner>,
}

impl RootBroker {
    pub fn new(config: Properties) -> Self {
        Self {
            inner: Arc::new(RootInner {
                config,
                resources: Mutex::new(Registry::default()),
                children: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self, key: &str) -> Option<&str> {
        self.inner.config.get(key).map(String::as_str)
    }

    /// Create (or reuse) the child broker for `scope`.
    pub fn new_child(&self, scope: JobScope) -> Result<ChildBroker> {
        if self.is_closed() {
            return Err(Error::BrokerClosed);
        }
        let mut children = self
            .inner
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let child = match children.iter().find(|c| c.scope == scope) {
            Some(existing) => Arc::clone(existing),
            None => {
                let created = Arc::new(ChildInner {
                    scope,
                    resources: Mutex::new(Registry::default()),
                });
                children.push(Arc::clone(&created));
                created
            }
        };

        Ok(ChildBroker {
            parent: Arc::downgrade(&self.inner),
            inner: child,
        })
    }

    /// Get the root-scoped resource `key`, building it on first use.
    pub fn get_or_insert_with<T, F>(&self, key: &str, factory: F) -> Result<Arc<T>>
    where
        T: SharedResource,
        F: FnOnce() -> Result<T>,
    {
        self.inner
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(key, factory)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Release every child and then the root's own resources.
    ///
    /// Only the first call does any work. Every resource gets a close call
    /// even if an earlier one failed; failures are reported together.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut failures = Vec::new();
        let children = std::mem::take(
            &mut *self
                .inner
                .children
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for child in &children {
            let scope = child.scope.to_string();
            failures.extend(
                child
                    .resources
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .close(&scope),
            );
        }
        failures.extend(
            self.inner
                .resources
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .close("global"),
        );

        debug!(children = children.len(), "root broker closed");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(failures.join("; ")))
        }
    }
}

impl Drop for RootBroker {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "shared resources failed to close on drop");
        }
    }
}

// ---------------------------------------------------------------------------
// Child
// ---------------------------------------------------------------------------

struct ChildInner {
    scope: JobScope,
    resources: Mutex<Registry>,
}

/// Job-scoped broker handed to the execution engine.
#[derive(Clone)]
pub struct ChildBroker {
    parent: Weak<RootInner>,
    inner: Arc<ChildInner>,
}

impl ChildBroker {
    pub fn scope(&self) -> &JobScope {
        &self.inner.scope
    }

    /// Look up a configuration value on the root. `None` once the root is gone.
    pub fn config(&self, key: &str) -> Option<String> {
        self.parent
            .upgrade()
            .and_then(|root| root.config.get(key).cloned())
    }

    /// Get the job-scoped resource `key`, building it on first use.
    pub fn get_or_insert_with<T, F>(&self, key: &str, factory: F) -> Result<Arc<T>>
    where
        T: SharedResource,
        F: FnOnce() -> Result<T>,
    {
        self.inner
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(key, factory)
    }

    /// Number of live resources in this scope.
    pub fn resource_count(&self) -> usize {
        self.inner
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Builds the root broker of an attempt.
pub trait BrokerFactory: Send + Sync {
    fn create_root(&self, config: &Properties) -> Result<RootBroker>;
}

/// Plain root seeded with the given configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBrokerFactory;

impl BrokerFactory for DefaultBrokerFactory {
    fn create_root(&self, config: &Properties) -> Result<RootBroker> {
        Ok(RootBroker::new(config.clone()))
    }
}
