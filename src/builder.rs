use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use crate::error::BoxError;
use crate::instance::{CreateFn, DestroyFn};
use crate::{Config, Pool};

/// A builder for creating a [`Pool`] with custom configuration.
///
/// # Example
///
/// ```rust
/// use lazy_pool::Builder;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mut builder = Builder::new(|| async { Ok::<_, std::io::Error>(Vec::<u8>::new()) });
/// let pool = builder
///     .max_instances(10)
///     .min_instances(2)
///     .idle_timeout(Duration::from_secs(30))
///     .destroy(|buf| async move { drop(buf) })
///     .build();
/// assert_eq!(pool.config().max_instances, 10);
/// # }
/// ```
pub struct Builder<T> {
    /// Configuration of the pool.
    config: Config,
    create: CreateFn<T>,
    destroy: Option<DestroyFn<T>>,
}

impl<T: Send + Sync + 'static> Builder<T> {
    /// Create a new builder with default configuration around a resource
    /// factory.
    ///
    /// `create` is called once for every resource the pool decides to add.
    pub fn new<F, Fut, E>(create: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let create: CreateFn<T> = Arc::new(move || {
            let creating = create();
            async move { creating.await.map_err(Into::<BoxError>::into) }.boxed()
        });
        Self {
            config: Config::default(),
            create,
            destroy: None,
        }
    }

    /// Set the function that tears a resource down when it leaves the pool.
    ///
    /// A panic raised by the destructor is re-raised to whoever awaited the
    /// teardown. When the teardown ran in the background, [`Pool::destroy`]
    /// re-raises it once the pool is drained.
    pub fn destroy<F, Fut>(&mut self, destroy: F) -> &mut Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.destroy = Some(Arc::new(move |value: T| destroy(value).boxed()));
        self
    }

    /// Set the maximum number of resources.
    pub fn max_instances(&mut self, max: usize) -> &mut Self {
        self.config.max_instances = max;
        self
    }

    /// Set the number of idle resources kept from eviction.
    pub fn min_instances(&mut self, min: usize) -> &mut Self {
        self.config.min_instances = min;
        self
    }

    /// Set how long a resource may stay idle before it is evicted.
    pub fn idle_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set how many callers may share one resource at once.
    pub fn concurrency_per_instance(&mut self, concurrency: usize) -> &mut Self {
        self.config.concurrency_per_instance = concurrency;
        self
    }

    /// Replace the whole configuration, e.g. with one loaded from a file.
    pub fn config(&mut self, config: Config) -> &mut Self {
        self.config = config;
        self
    }

    /// Build the pool with the current configuration.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid, see [`Config`].
    pub fn build(&mut self) -> Pool<T> {
        Pool::with_parts(self.config, self.create.clone(), self.destroy.clone())
    }
}
