use std::any::Any;
use std::fmt::{self, Debug};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::*;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::entry::{Entry, Lease};
use crate::error::{BoxError, PoolError};
use crate::instance::{CreateFn, DestroyFn, Instance, InstanceState, Usage};
use crate::machine::{Lifecycle, Machine};
use crate::Builder;

/// An async pool of lazily created resources.
///
/// Resources are created on demand, shared by up to
/// `concurrency_per_instance` callers at a time, and torn down once idle
/// unless `min_instances` keeps them around. When `max_instances` resources
/// are all busy, callers queue up and are served in arrival order.
///
/// `Pool` is a cheap handle; clones share the same resources.
///
/// # Examples
///
/// ```rust
/// use lazy_pool::Pool;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// # #[tokio::main]
/// # async fn main() {
/// let created = Arc::new(AtomicUsize::new(0));
/// let counter = created.clone();
/// let pool = Pool::builder(move || {
///     let id = counter.fetch_add(1, Ordering::SeqCst);
///     async move { Ok::<_, std::io::Error>(format!("conn-{id}")) }
/// })
/// .max_instances(2)
/// .min_instances(1)
/// .build();
///
/// let mut tasks = Vec::new();
/// for i in 0..8 {
///     let pool = pool.clone();
///     tasks.push(tokio::spawn(async move {
///         pool.run(|conn| Box::pin(async move { format!("{conn}: job {i}") }))
///             .await
///             .unwrap()
///     }));
/// }
/// for task in tasks {
///     assert!(task.await.unwrap().starts_with("conn-"));
/// }
/// assert!(created.load(Ordering::SeqCst) <= 2);
/// assert_eq!(pool.size(), 1);
///
/// pool.destroy().await;
/// assert!(pool.run(|_| Box::pin(async {})).await.unwrap_err().is_unavailable());
/// # }
/// ```
pub struct Pool<T: Send + Sync + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + Sync + 'static> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.shared.config)
            .field("status", &self.status())
            .finish()
    }
}

impl<T: Send + Sync + 'static> Pool<T> {
    /// Create a pool with the default configuration: unbounded, no minimum,
    /// no idle timeout and one caller per resource.
    ///
    /// # Example
    ///
    /// ```rust
    /// use lazy_pool::Pool;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let pool = Pool::new(|| async { Ok::<_, std::io::Error>(7u32) });
    /// assert_eq!(pool.size(), 0);
    /// let doubled = pool.run(|n| Box::pin(async move { n * 2 })).await.unwrap();
    /// assert_eq!(doubled, 14);
    /// assert_eq!(pool.size(), 0);
    /// # }
    /// ```
    pub fn new<F, Fut, E>(create: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Builder::new(create).build()
    }

    /// Start building a pool around the given resource factory.
    pub fn builder<F, Fut, E>(create: F) -> Builder<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Builder::new(create)
    }

    /// Create a new pool with the given configuration and callbacks.
    ///
    /// # Panics
    ///
    /// Panics if `config` is invalid, see [`Config`].
    pub(crate) fn with_parts(
        config: Config,
        create: CreateFn<T>,
        destroy: Option<DestroyFn<T>>,
    ) -> Self {
        config.validate();
        Self {
            shared: Arc::new(Shared {
                config,
                create,
                destroy,
                book: Mutex::new(Book {
                    machine: Machine::new(PoolState::Running),
                    members: Vec::new(),
                    retiring: Vec::new(),
                    generation: 0,
                    fault: None,
                }),
                waiters: SegQueue::new(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Run `f` against a pooled resource and return its output.
    ///
    /// Picks the least busy resource with spare capacity, creates a new one
    /// if the pool may grow, or waits in line for one to be returned. Errors
    /// of `f` are part of `U` and come back untouched; the resource is
    /// returned to the pool whatever `f` yields, and also if `f` panics.
    ///
    /// # Errors
    ///
    /// [`PoolError::Unavailable`] if the pool is being or has been destroyed,
    /// [`PoolError::Create`] if the resource assigned to this call could not
    /// be created.
    pub async fn run<F, U>(&self, f: F) -> Result<U, PoolError>
    where
        F: for<'a> FnOnce(&'a T) -> BoxFuture<'a, U>,
    {
        let entry = self.pull().await?;
        let output = f(&*entry).await;
        entry.release().await;
        Ok(output)
    }

    /// Borrow a resource, waiting for one if the pool is saturated.
    ///
    /// The resource goes back to the pool when the returned [`Entry`] is
    /// released or dropped.
    ///
    /// # Errors
    ///
    /// Same as [`Pool::run`].
    pub async fn pull(&self) -> Result<Entry<T>, PoolError> {
        let lease = self.shared.acquire().await?;
        let value = lease.ready().await?;
        Ok(Entry::new(value, lease))
    }

    /// Stop serving, tear down every resource and fail every queued caller.
    ///
    /// Waits for resources still in use to come back before destroying
    /// them. Afterwards [`Pool::run`] and [`Pool::pull`] fail with
    /// [`PoolError::Unavailable`].
    ///
    /// # Panics
    ///
    /// Panics if the pool is already being destroyed or was destroyed.
    /// Re-raises the first panic of a resource destructor, whether it ran
    /// here or earlier in the background, after every queued caller has
    /// been rejected.
    pub async fn destroy(&self) {
        self.shared.destroy().await
    }

    /// Number of resources currently managed, including ones being created.
    pub fn size(&self) -> usize {
        self.shared.book.lock().members.len()
    }

    /// Number of callers queued for a resource.
    pub fn waiting(&self) -> usize {
        self.shared.waiters.len()
    }

    /// Lifecycle state of the pool.
    pub fn state(&self) -> PoolState {
        self.shared.book.lock().machine.current()
    }

    /// Configuration the pool was built with.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Snapshot of the pool's occupancy.
    ///
    /// # Example
    ///
    /// ```rust
    /// use lazy_pool::{Pool, PoolState};
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let pool = Pool::builder(|| async { Ok::<_, std::io::Error>(()) })
    ///     .min_instances(1)
    ///     .build();
    /// let entry = pool.pull().await.unwrap();
    /// let status = pool.status();
    /// assert_eq!((status.size, status.users, status.waiting), (1, 1, 0));
    /// drop(entry);
    /// assert_eq!(pool.status().users, 0);
    /// assert_eq!(pool.status().state, PoolState::Running);
    /// # }
    /// ```
    pub fn status(&self) -> Status {
        let book = self.shared.book.lock();
        Status {
            size: book.members.len(),
            users: book.members.iter().map(|m| m.instance.users()).sum(),
            waiting: self.shared.waiters.len(),
            state: book.machine.current(),
        }
    }
}

/// Configuration for the pool.
///
/// A valid configuration has `max_instances >= 1`,
/// `concurrency_per_instance >= 1` and `min_instances <= max_instances`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    /// Maximum number of resources. `usize::MAX` means unbounded.
    pub max_instances: usize,
    /// Number of idle resources that are never evicted. Resources are still
    /// only created on demand.
    pub min_instances: usize,
    /// How long a resource may stay idle before it is evicted. Zero evicts
    /// as soon as it is returned.
    pub idle_timeout: Duration,
    /// Maximum number of callers sharing one resource at once.
    pub concurrency_per_instance: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_instances: usize::MAX,
            min_instances: 0,
            idle_timeout: Duration::ZERO,
            concurrency_per_instance: 1,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) {
        assert!(self.max_instances >= 1, "max_instances must be at least 1");
        assert!(
            self.concurrency_per_instance >= 1,
            "concurrency_per_instance must be at least 1"
        );
        assert!(
            self.min_instances <= self.max_instances,
            "min_instances must be less than or equal to max_instances"
        );
    }
}

/// Lifecycle of a [`Pool`]. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PoolState {
    /// Serving callers.
    Running,
    /// Tearing down; new callers are turned away.
    Destroying,
    /// Fully torn down.
    Destroyed,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum PoolEvent {
    Destroy,
    Finish,
}

impl Lifecycle for PoolState {
    type Event = PoolEvent;

    fn on(self, event: PoolEvent) -> Option<Self> {
        match (self, event) {
            (PoolState::Running, PoolEvent::Destroy) => Some(PoolState::Destroying),
            (PoolState::Destroying, PoolEvent::Finish) => Some(PoolState::Destroyed),
            _ => None,
        }
    }
}

/// Occupancy snapshot returned by [`Pool::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Status {
    /// Resources currently managed.
    pub size: usize,
    /// Callers currently holding a resource, summed over resources.
    pub users: usize,
    /// Callers queued for a resource.
    pub waiting: usize,
    /// Lifecycle state of the pool.
    pub state: PoolState,
}

/// A queued caller.
type Waiter<T> = oneshot::Sender<Result<Lease<T>, PoolError>>;

/// State shared by every handle of one pool.
pub(crate) struct Shared<T: Send + Sync + 'static> {
    config: Config,
    create: CreateFn<T>,
    destroy: Option<DestroyFn<T>>,
    book: Mutex<Book<T>>,
    /// Queued callers, earliest first. Pushed and popped only while `book`
    /// is held so that assignment decisions see a consistent queue.
    waiters: SegQueue<Waiter<T>>,
    next_id: AtomicU64,
}

/// Mutable bookkeeping of a pool.
struct Book<T: Send + Sync + 'static> {
    machine: Machine<PoolState>,
    /// The active set.
    members: Vec<Member<T>>,
    /// Evicted instances whose destruction may still be running.
    retiring: Vec<Arc<Instance<T>>>,
    /// Source of eviction tokens.
    generation: u64,
    /// First destructor panic raised on a background task, re-raised by
    /// `destroy`.
    fault: Option<Box<dyn Any + Send>>,
}

/// An instance of the active set together with its pending eviction.
struct Member<T: Send + Sync + 'static> {
    instance: Arc<Instance<T>>,
    eviction: Option<Eviction>,
}

struct Eviction {
    generation: u64,
    handle: AbortHandle,
}

impl<T: Send + Sync + 'static> Member<T> {
    fn cancel_eviction(&mut self) {
        if let Some(eviction) = self.eviction.take() {
            eviction.handle.abort();
            tracing::trace!(instance = self.instance.id(), "idle eviction cancelled");
        }
    }
}

impl<T: Send + Sync + 'static> Book<T> {
    fn position(&self, instance: &Arc<Instance<T>>) -> Option<usize> {
        self.members
            .iter()
            .position(|m| Arc::ptr_eq(&m.instance, instance))
    }

    /// Take a member out of the active set and keep track of its teardown.
    fn retire(&mut self, index: usize) -> Arc<Instance<T>> {
        let mut member = self.members.remove(index);
        member.cancel_eviction();
        self.retiring
            .retain(|i| i.state() != InstanceState::Destroyed);
        self.retiring.push(member.instance.clone());
        member.instance
    }
}

/// What the release protocol decided for a returned claim.
pub(crate) enum Released<T: Send + Sync + 'static> {
    /// The instance stays in the active set.
    Kept,
    /// The instance went straight to a queued caller.
    HandedOff,
    /// A queued caller vanished before taking its claim. Dropping the claim
    /// runs the protocol again.
    Bounced(Lease<T>),
    /// The instance left the active set and must be destroyed.
    Evict(Arc<Instance<T>>),
}

impl<T: Send + Sync + 'static> Shared<T> {
    /// Claim `member` for a new user.
    fn lease(self: &Arc<Self>, member: &mut Member<T>) -> Lease<T> {
        member.cancel_eviction();
        Lease::new(self.clone(), member.instance.enter())
    }

    /// Add a fresh instance to the active set and claim it.
    fn grow(self: &Arc<Self>, book: &mut Book<T>) -> Lease<T> {
        let id = self.next_id.fetch_add(1, Relaxed);
        let shared = Arc::downgrade(self);
        let instance = Instance::spawn(
            id,
            self.create.clone(),
            self.destroy.clone(),
            move |instance: &Arc<Instance<T>>| {
                if let Some(shared) = shared.upgrade() {
                    shared.discard_failed(instance);
                }
            },
        );
        let usage = instance.enter();
        book.members.push(Member {
            instance,
            eviction: None,
        });
        tracing::debug!(instance = id, size = book.members.len(), "creating resource");
        Lease::new(self.clone(), usage)
    }

    pub(crate) async fn acquire(self: &Arc<Self>) -> Result<Lease<T>, PoolError> {
        let assigned = {
            let mut book = self.book.lock();
            if !book.machine.is(PoolState::Running) {
                return Err(PoolError::Unavailable);
            }

            let limit = self.config.concurrency_per_instance;
            let least_busy = book
                .members
                .iter()
                .enumerate()
                .filter(|(_, m)| m.instance.is_serviceable())
                .map(|(index, m)| (index, m.instance.users()))
                .filter(|&(_, users)| users < limit)
                .min_by_key(|&(_, users)| users)
                .map(|(index, _)| index);
            if let Some(index) = least_busy {
                return Ok(self.lease(&mut book.members[index]));
            }

            if book.members.len() < self.config.max_instances {
                return Ok(self.grow(&mut book));
            }

            let (tx, rx) = oneshot::channel();
            self.waiters.push(tx);
            tracing::debug!(waiting = self.waiters.len(), "pool saturated; caller queued");
            rx
        };
        // A dropped sender means the pool went away with the caller queued.
        assigned.await.unwrap_or(Err(PoolError::Unavailable))
    }

    /// The release protocol, run once per returned claim.
    ///
    /// Queued callers win over eviction. Otherwise an idle instance above
    /// `min_instances` is evicted now or after the idle timeout.
    pub(crate) fn release(self: &Arc<Self>, usage: Usage<T>) -> Released<T> {
        let instance = usage.instance().clone();
        let mut book = self.book.lock();
        drop(usage);
        let running = book.machine.is(PoolState::Running);

        if instance.state() == InstanceState::Failed {
            // Users of a failed instance leave one by one; the first one out
            // frees the slot for the next caller in line.
            return self.remove_failed(&mut book, &instance);
        }

        if !running {
            return Released::Kept;
        }
        let Some(index) = book.position(&instance) else {
            return Released::Kept;
        };

        while let Some(waiter) = self.waiters.pop() {
            if waiter.is_closed() {
                continue;
            }
            let lease = self.lease(&mut book.members[index]);
            tracing::trace!(instance = instance.id(), "handing instance to queued caller");
            return match waiter.send(Ok(lease)) {
                Ok(()) => Released::HandedOff,
                Err(Ok(lease)) => Released::Bounced(lease),
                Err(Err(_)) => Released::Kept,
            };
        }

        if instance.users() == 0 && book.members.len() > self.config.min_instances {
            if self.config.idle_timeout.is_zero() {
                tracing::debug!(instance = instance.id(), "evicting idle instance");
                return Released::Evict(book.retire(index));
            }
            self.schedule_eviction(&mut book, index);
        }
        Released::Kept
    }

    /// Take a failed instance out of the active set and reuse its slot.
    fn remove_failed(
        self: &Arc<Self>,
        book: &mut Book<T>,
        instance: &Arc<Instance<T>>,
    ) -> Released<T> {
        let Some(index) = book.position(instance) else {
            return Released::Kept;
        };
        book.members.remove(index);
        tracing::debug!(instance = instance.id(), "failed instance dropped");
        if book.machine.is(PoolState::Running) {
            self.replace_for_waiter(book)
        } else {
            Released::Kept
        }
    }

    /// Called once creation of `instance` has failed. Users still holding it
    /// remove it on release; without any, nobody else would.
    fn discard_failed(self: &Arc<Self>, instance: &Arc<Instance<T>>) {
        let released = {
            let mut book = self.book.lock();
            if instance.users() > 0 {
                return;
            }
            self.remove_failed(&mut book, instance)
        };
        // A bounced claim runs the release protocol again, outside the lock.
        drop(released);
    }

    /// Start a new instance for the earliest live waiter, if any.
    fn replace_for_waiter(self: &Arc<Self>, book: &mut Book<T>) -> Released<T> {
        while let Some(waiter) = self.waiters.pop() {
            if waiter.is_closed() {
                continue;
            }
            let lease = self.grow(book);
            return match waiter.send(Ok(lease)) {
                Ok(()) => Released::HandedOff,
                Err(Ok(lease)) => Released::Bounced(lease),
                Err(Err(_)) => Released::Kept,
            };
        }
        Released::Kept
    }

    fn schedule_eviction(self: &Arc<Self>, book: &mut Book<T>, index: usize) {
        book.generation += 1;
        let generation = book.generation;
        let timeout = self.config.idle_timeout;
        let shared: Weak<Self> = Arc::downgrade(self);

        let member = &mut book.members[index];
        member.cancel_eviction();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let expired = shared.expire(generation);
            if let Some(instance) = expired {
                shared.tear_down(instance).await;
            }
        })
        .abort_handle();
        member.eviction = Some(Eviction { generation, handle });
        tracing::debug!(instance = member.instance.id(), ?timeout, "idle eviction scheduled");
    }

    /// Remove the member whose eviction carries `generation`, unless it was
    /// claimed again in the meantime or the pool is down to `min_instances`.
    fn expire(&self, generation: u64) -> Option<Arc<Instance<T>>> {
        let mut book = self.book.lock();
        if !book.machine.is(PoolState::Running) {
            return None;
        }
        let index = book.members.iter().position(|m| {
            m.eviction
                .as_ref()
                .is_some_and(|e| e.generation == generation)
        })?;
        // The timer task is the one running this; don't abort it.
        book.members[index].eviction = None;
        if book.members.len() <= self.config.min_instances {
            tracing::trace!(
                instance = book.members[index].instance.id(),
                "idle timeout elapsed at min_instances; keeping"
            );
            return None;
        }
        let instance = book.retire(index);
        tracing::debug!(instance = instance.id(), "idle timeout elapsed; evicting");
        Some(instance)
    }

    /// Destroy an evicted instance nobody waits for.
    ///
    /// Runs on the current Tokio runtime, or in place on this thread when
    /// there is none.
    pub(crate) fn destroy_detached(self: &Arc<Self>, instance: Arc<Instance<T>>) {
        let shared = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { shared.tear_down(instance).await });
            }
            Err(_) => {
                tracing::debug!(instance = instance.id(), "no runtime; destroying in place");
                futures::executor::block_on(shared.tear_down(instance));
            }
        }
    }

    /// Destroy `instance`, keeping a destructor panic for `destroy` to re-raise.
    async fn tear_down(&self, instance: Arc<Instance<T>>) {
        if let Err(panic) = AssertUnwindSafe(instance.destroy()).catch_unwind().await {
            self.book.lock().fault.get_or_insert(panic);
        }
    }

    pub(crate) async fn destroy(&self) {
        let doomed: Vec<Arc<Instance<T>>> = {
            let mut book = self.book.lock();
            book.machine.fire(PoolEvent::Destroy);
            tracing::debug!(
                size = book.members.len(),
                waiting = self.waiters.len(),
                "destroying pool"
            );
            let mut doomed: Vec<_> = book
                .members
                .iter_mut()
                .map(|m| {
                    m.cancel_eviction();
                    m.instance.clone()
                })
                .collect();
            doomed.extend(book.retiring.drain(..));
            doomed
        };

        let outcomes = join_all(
            doomed
                .iter()
                .map(|instance| AssertUnwindSafe(instance.destroy()).catch_unwind()),
        )
        .await;

        let fault = {
            let mut book = self.book.lock();
            book.members.clear();
            let mut rejected = 0;
            while let Some(waiter) = self.waiters.pop() {
                let _ = waiter.send(Err(PoolError::Unavailable));
                rejected += 1;
            }
            book.machine.fire(PoolEvent::Finish);
            tracing::debug!(rejected, "pool destroyed");
            let fault = book.fault.take();
            fault.or_else(|| outcomes.into_iter().find_map(Result::err))
        };
        if let Some(panic) = fault {
            tracing::error!("a resource destructor panicked");
            panic::resume_unwind(panic);
        }
    }
}
