use std::error::Error;
use std::fmt::{self, Debug};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::error::{BoxError, PoolError};
use crate::machine::{Lifecycle, Machine};

/// Type-erased resource factory.
pub(crate) type CreateFn<T> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<T, BoxError>> + Send + Sync>;

/// Type-erased resource destructor.
pub(crate) type DestroyFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

/// Lifecycle of a single pooled resource.
///
/// ```text
/// Creating ──> Idle <──> Using
///    │          │
///    v          v
///  Failed    Destroying ──> Destroyed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum InstanceState {
    /// The resource is being created.
    Creating,
    /// Created and not in use.
    Idle,
    /// At least one caller holds the resource.
    Using,
    /// The destructor is running.
    Destroying,
    /// Torn down. Permanently inert.
    Destroyed,
    /// Creation failed. Permanently inert, nothing to tear down.
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum InstanceEvent {
    Created,
    CreateFailed,
    Acquire,
    Release,
    Destroy,
    Finish,
}

impl Lifecycle for InstanceState {
    type Event = InstanceEvent;

    fn on(self, event: InstanceEvent) -> Option<Self> {
        use InstanceEvent as E;
        use InstanceState as S;
        match (self, event) {
            (S::Creating, E::Created) => Some(S::Idle),
            (S::Creating, E::CreateFailed) => Some(S::Failed),
            (S::Idle, E::Acquire) => Some(S::Using),
            (S::Using, E::Release) => Some(S::Idle),
            (S::Idle, E::Destroy) => Some(S::Destroying),
            (S::Destroying, E::Finish) => Some(S::Destroyed),
            _ => None,
        }
    }
}

/// Everything about an instance that changes, published through a watch
/// channel so waiters can suspend on it.
struct Core<T> {
    machine: Machine<InstanceState>,
    users: usize,
    value: Option<Arc<T>>,
    error: Option<Arc<dyn Error + Send + Sync>>,
}

impl<T> Core<T> {
    fn state(&self) -> InstanceState {
        self.machine.current()
    }

    /// Idle with nobody holding a claim.
    fn is_vacant(&self) -> bool {
        self.machine.is(InstanceState::Idle) && self.users == 0
    }

    fn is_inert(&self) -> bool {
        matches!(
            self.state(),
            InstanceState::Destroyed | InstanceState::Failed
        )
    }
}

/// One managed resource slot.
pub(crate) struct Instance<T: Send + Sync + 'static> {
    id: u64,
    core: watch::Sender<Core<T>>,
    destroy: Option<DestroyFn<T>>,
}

impl<T: Send + Sync + 'static> Debug for Instance<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.borrow();
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("state", &core.state())
            .field("users", &core.users)
            .finish()
    }
}

impl<T: Send + Sync + 'static> Instance<T> {
    /// Create the instance and start building its resource in the background.
    ///
    /// Creation runs on its own task so that no caller can cancel it halfway.
    /// `on_failed` runs on that task once the instance has reached `Failed`.
    pub(crate) fn spawn<F>(
        id: u64,
        create: CreateFn<T>,
        destroy: Option<DestroyFn<T>>,
        on_failed: F,
    ) -> Arc<Self>
    where
        F: FnOnce(&Arc<Self>) + Send + 'static,
    {
        let (core, _) = watch::channel(Core {
            machine: Machine::new(InstanceState::Creating),
            users: 0,
            value: None,
            error: None,
        });
        let instance = Arc::new(Self { id, core, destroy });
        let this = instance.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(async move { create().await })
                .catch_unwind()
                .await;
            let error: Arc<dyn Error + Send + Sync> = match outcome {
                Ok(Ok(value)) => return this.created(value),
                Ok(Err(err)) => Arc::from(err),
                Err(_) => Arc::from(BoxError::from("resource creation panicked")),
            };
            this.failed(error);
            on_failed(&this);
        });
        instance
    }

    fn created(&self, value: T) {
        tracing::debug!(instance = self.id, "resource created");
        self.core.send_modify(|core| {
            core.value = Some(Arc::new(value));
            core.machine.fire(InstanceEvent::Created);
        });
    }

    fn failed(&self, error: Arc<dyn Error + Send + Sync>) {
        tracing::warn!(instance = self.id, %error, "resource creation failed");
        self.core.send_modify(|core| {
            core.error = Some(error);
            core.machine.fire(InstanceEvent::CreateFailed);
        });
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> InstanceState {
        self.core.borrow().state()
    }

    pub(crate) fn users(&self) -> usize {
        self.core.borrow().users
    }

    /// Whether new users may still be assigned to this instance.
    pub(crate) fn is_serviceable(&self) -> bool {
        matches!(
            self.state(),
            InstanceState::Creating | InstanceState::Idle | InstanceState::Using
        )
    }

    /// Register one more user and return the claim that releases it on drop.
    ///
    /// Must not suspend between the caller's capacity check and this call.
    ///
    /// # Panics
    ///
    /// Panics if the instance is already being torn down.
    pub(crate) fn enter(self: &Arc<Self>) -> Usage<T> {
        self.core.send_modify(|core| {
            let state = core.state();
            if matches!(state, InstanceState::Destroying | InstanceState::Destroyed) {
                tracing::error!(instance = self.id, ?state, "use of a torn down instance");
                panic!("instance {} cannot be used while {:?}", self.id, state);
            }
            core.users += 1;
        });
        Usage {
            instance: self.clone(),
        }
    }

    /// Tear the resource down once nobody is using it.
    ///
    /// Waits out in-flight creation and usage. Calling it again while a
    /// destruction is running waits for that one; once destroyed, or when
    /// creation failed, it returns immediately.
    ///
    /// # Panics
    ///
    /// Re-raises a panic of the destructor, after the instance has reached
    /// `Destroyed`.
    pub(crate) async fn destroy(&self) {
        let mut changes = self.core.subscribe();
        loop {
            let claimed = self.core.send_if_modified(|core| {
                if core.is_vacant() {
                    core.machine.fire(InstanceEvent::Destroy);
                    true
                } else {
                    false
                }
            });
            if claimed {
                break;
            }
            let done = match changes
                .wait_for(|core| core.is_inert() || core.is_vacant())
                .await
            {
                Ok(core) => core.is_inert(),
                Err(_) => true,
            };
            if done {
                return;
            }
        }

        let mut value = None;
        self.core.send_if_modified(|core| {
            value = core.value.take();
            false
        });
        tracing::debug!(instance = self.id, "destroying resource");
        let outcome = match (&self.destroy, value) {
            (Some(destroy), Some(value)) => match Arc::try_unwrap(value) {
                Ok(value) => AssertUnwindSafe(destroy(value)).catch_unwind().await,
                Err(_) => {
                    tracing::error!(instance = self.id, "resource still borrowed at destruction");
                    panic!("resource of instance {} is still borrowed", self.id);
                }
            },
            _ => Ok(()),
        };
        // Settle first so that concurrent waiters never hang on a failed teardown.
        self.core.send_modify(|core| {
            core.machine.fire(InstanceEvent::Finish);
        });
        if let Err(panic) = outcome {
            tracing::error!(instance = self.id, "resource destructor panicked");
            panic::resume_unwind(panic);
        }
        tracing::debug!(instance = self.id, "resource destroyed");
    }
}

/// One registered user of an [`Instance`]. Dropping it unregisters the user.
pub(crate) struct Usage<T: Send + Sync + 'static> {
    instance: Arc<Instance<T>>,
}

impl<T: Send + Sync + 'static> Usage<T> {
    pub(crate) fn instance(&self) -> &Arc<Instance<T>> {
        &self.instance
    }

    /// Wait for the resource to be created and mark the instance in use.
    pub(crate) async fn ready(&self) -> Result<Arc<T>, PoolError> {
        let mut changes = self.instance.core.subscribe();
        let value = {
            let core = changes
                .wait_for(|core| !core.machine.is(InstanceState::Creating))
                .await
                .map_err(|_| PoolError::Unavailable)?;
            match (&core.value, &core.error) {
                (Some(value), _) => value.clone(),
                (None, Some(error)) => return Err(PoolError::Create(error.clone())),
                (None, None) => return Err(PoolError::Unavailable),
            }
        };
        self.instance.core.send_if_modified(|core| {
            if core.machine.is(InstanceState::Idle) {
                core.machine.fire(InstanceEvent::Acquire);
                true
            } else {
                false
            }
        });
        Ok(value)
    }
}

impl<T: Send + Sync + 'static> Drop for Usage<T> {
    fn drop(&mut self) {
        self.instance.core.send_modify(|core| {
            debug_assert!(core.users > 0, "user count underflow");
            core.users = core.users.saturating_sub(1);
            if core.users == 0 && core.machine.is(InstanceState::Using) {
                core.machine.fire(InstanceEvent::Release);
            }
        });
    }
}
