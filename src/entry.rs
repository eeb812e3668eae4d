use std::fmt::{self, Debug};
use std::ops::Deref;
use std::sync::Arc;

use crate::error::PoolError;
use crate::instance::Usage;
use crate::pool::{Released, Shared};

/// A claim on one instance of the pool.
///
/// The claim counts as a user of its instance from the moment it is made.
/// Giving it back, explicitly or by dropping it, runs the pool's release
/// protocol exactly once.
pub(crate) struct Lease<T: Send + Sync + 'static> {
    shared: Arc<Shared<T>>,
    // `usage` is always `Some` until the lease is given back.
    usage: Option<Usage<T>>,
}

impl<T: Send + Sync + 'static> Lease<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>, usage: Usage<T>) -> Self {
        Self {
            shared,
            usage: Some(usage),
        }
    }

    /// Wait until the claimed instance has its resource.
    pub(crate) async fn ready(&self) -> Result<Arc<T>, PoolError> {
        match &self.usage {
            Some(usage) => usage.ready().await,
            None => Err(PoolError::Unavailable),
        }
    }

    fn instance_id(&self) -> Option<u64> {
        self.usage.as_ref().map(|usage| usage.instance().id())
    }

    /// Give the claim back, waiting for the instance to be torn down if the
    /// pool decides to evict it right away.
    pub(crate) async fn release(mut self) {
        if let Some(usage) = self.usage.take() {
            match self.shared.release(usage) {
                Released::Evict(instance) => instance.destroy().await,
                Released::Bounced(lease) => drop(lease),
                Released::Kept | Released::HandedOff => {}
            }
        }
    }
}

impl<T: Send + Sync + 'static> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(usage) = self.usage.take() {
            match self.shared.release(usage) {
                Released::Evict(instance) => self.shared.destroy_detached(instance),
                // The waiter went away after being picked; run the protocol
                // again for the claim it left behind.
                Released::Bounced(lease) => drop(lease),
                Released::Kept | Released::HandedOff => {}
            }
        }
    }
}

impl<T: Send + Sync + 'static> Debug for Lease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("instance", &self.instance_id())
            .finish()
    }
}

/// A resource borrowed from a [`Pool`](crate::Pool).
///
/// `Entry` dereferences to the resource. Up to `concurrency_per_instance`
/// entries may point at the same resource at once. When an `Entry` is
/// dropped, the resource goes back to the pool; an eviction it triggers then
/// runs in the background, or in place when dropped outside a Tokio runtime.
/// Call [`Entry::release`] to wait for it instead.
///
/// # Example
///
/// ```rust
/// use lazy_pool::Pool;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let pool = Pool::new(|| async { Ok::<_, std::io::Error>(String::from("conn")) });
/// let entry = pool.pull().await.unwrap();
/// assert_eq!(entry.as_str(), "conn");
/// assert_eq!(pool.size(), 1);
/// entry.release().await;
/// assert_eq!(pool.size(), 0);
/// # }
/// ```
pub struct Entry<T: Send + Sync + 'static> {
    // Declared first so the resource is unshared before the lease reports
    // the user gone.
    value: Arc<T>,
    lease: Lease<T>,
}

impl<T: Send + Sync + 'static> Entry<T> {
    pub(crate) fn new(value: Arc<T>, lease: Lease<T>) -> Self {
        Self { value, lease }
    }

    /// Get reference to the inner resource.
    pub fn get(&self) -> &T {
        &self.value
    }

    /// Return the resource to the pool.
    ///
    /// Hands it to the earliest waiting caller if there is one, otherwise
    /// lets the pool keep it or evict it. If it is evicted immediately, this
    /// waits for the destructor to finish.
    pub async fn release(self) {
        let Entry { value, lease } = self;
        drop(value);
        lease.release().await;
    }
}

impl<T: Send + Sync + 'static> Deref for Entry<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T: Send + Sync + Debug + 'static> Debug for Entry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("value", &self.value)
            .field("instance", &self.lease.instance_id())
            .finish()
    }
}

#[cfg(feature = "serde")]
impl<T: Send + Sync + serde::Serialize + 'static> serde::Serialize for Entry<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.get().serialize(serializer)
    }
}
