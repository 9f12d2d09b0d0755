//! Lazily created, shared, closeable resources
//!
//! A [`ResourceManager`] hands out one shared instance per key, such as a client
//! connection per server address. Creation goes through a [`SingleFlight`]
//! keyed on the same key, so a resource is created at most once no matter how
//! many callers ask for it at the same time.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::batch_error::BatchError;
use crate::error::ResourceError;
use crate::lock::{read, write};
use crate::singleflight::SingleFlight;

/// A resource that must be closed when the manager is torn down
pub trait Closeable {
    /// Error returned when closing fails
    type Error: std::error::Error + Send + Sync + 'static;

    /// Release the resource
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying resource could not be released.
    fn close(&self) -> Result<(), Self::Error>;
}

/// Keyed cache of shared [`Closeable`] resources
///
/// `E` is the error type of the creation functions passed to
/// [`get`](Self::get).
///
/// # Example
///
/// ```rust
/// use flight_sync::{Closeable, ResourceManager};
/// use std::convert::Infallible;
///
/// struct Client(&'static str);
///
/// impl Closeable for Client {
///     type Error = Infallible;
///
///     fn close(&self) -> Result<(), Infallible> {
///         Ok(())
///     }
/// }
///
/// # futures::executor::block_on(async {
/// let manager: ResourceManager<Client, String> = ResourceManager::new();
///
/// let first = manager.get("db:5432", || async { Ok(Client("db")) }).await.unwrap();
/// let again = manager.get("db:5432", || async { Err("not called".to_string()) }).await.unwrap();
/// assert!(std::sync::Arc::ptr_eq(&first, &again));
///
/// manager.close().unwrap();
/// # });
/// ```
pub struct ResourceManager<R, E> {
    /// `None` once the manager has been closed
    resources: RwLock<Option<HashMap<String, Arc<R>>>>,
    flight: SingleFlight<Arc<R>, ResourceError<E>>,
}

impl<R, E> ResourceManager<R, E>
where
    R: Closeable,
{
    /// Create an empty manager
    #[must_use]
    pub fn new() -> Self {
        Self {
            resources: RwLock::new(Some(HashMap::new())),
            flight: SingleFlight::new(),
        }
    }

    /// Install `resource` under `key`, replacing any existing entry
    ///
    /// This bypasses deduplication: injecting while a [`get`](Self::get) for the
    /// same key is creating a resource leaves whichever finishes last in place.
    /// The replaced resource, if any, is returned unclosed.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::Closed`] if the manager has been closed.
    pub fn inject(
        &self,
        key: impl Into<String>,
        resource: impl Into<Arc<R>>,
    ) -> Result<Option<Arc<R>>, ResourceError<E>> {
        let key = key.into();
        let mut resources = write(&self.resources);
        let resources = resources.as_mut().ok_or(ResourceError::Closed)?;
        debug!(key = %key, "injecting resource");
        Ok(resources.insert(key, resource.into()))
    }

    /// Close every held resource and invalidate the manager
    ///
    /// Every resource is closed even if some fail. Afterwards `get` and
    /// `inject` return [`ResourceError::Closed`]; closing again does nothing.
    ///
    /// # Errors
    ///
    /// Returns a [`BatchError`] holding every individual close failure.
    pub fn close(&self) -> Result<(), BatchError> {
        let Some(resources) = write(&self.resources).take() else {
            return Ok(());
        };

        let mut batch = BatchError::new();
        for resource in resources.values() {
            if let Err(err) = resource.close() {
                batch.add(err);
            }
        }

        debug!(
            closed = resources.len(),
            failed = batch.len(),
            "resource manager closed"
        );
        batch.into_result()
    }

    /// Number of resources currently held
    #[must_use]
    pub fn len(&self) -> usize {
        read(&self.resources).as_ref().map_or(0, HashMap::len)
    }

    /// Check whether no resource is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check whether [`close`](Self::close) has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        read(&self.resources).is_none()
    }

    /// Check whether a resource is held for `key`
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        read(&self.resources)
            .as_ref()
            .is_some_and(|resources| resources.contains_key(key))
    }

    fn lookup(&self, key: &str) -> Result<Option<Arc<R>>, ResourceError<E>> {
        let resources = read(&self.resources);
        let resources = resources.as_ref().ok_or(ResourceError::Closed)?;
        Ok(resources.get(key).cloned())
    }
}

impl<R, E> ResourceManager<R, E>
where
    R: Closeable,
    E: Clone,
{
    /// Get the resource for `key`, creating it with `create` if absent
    ///
    /// Concurrent callers asking for a missing key share one run of `create`
    /// and all receive the same instance. If `create` fails nothing is stored,
    /// every waiting caller gets the error, and the next call tries again.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::Create`] with the error from `create`, or
    /// [`ResourceError::Closed`] if the manager has been closed.
    pub async fn get<F, Fut>(&self, key: &str, create: F) -> Result<Arc<R>, ResourceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        self.flight
            .execute(key, || async move {
                if let Some(resource) = self.lookup(key)? {
                    return Ok(resource);
                }

                let resource = Arc::new(create().await.map_err(ResourceError::Create)?);

                // A close() that raced with create() wins; the new resource is
                // dropped without being closed.
                write(&self.resources)
                    .as_mut()
                    .ok_or(ResourceError::Closed)?
                    .insert(key.to_owned(), Arc::clone(&resource));

                debug!(key, "created resource");
                Ok(resource)
            })
            .await
    }
}

impl<R, E> Default for ResourceManager<R, E>
where
    R: Closeable,
{
    fn default() -> Self {
        Self::new()
    }
}
