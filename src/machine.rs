use std::fmt::Debug;

/// A lifecycle whose legal moves are described by a transition table.
///
/// `on` returns the state reached by applying `event` to `self`, or `None`
/// when the table has no such edge.
pub(crate) trait Lifecycle: Copy + Eq + Debug {
    type Event: Copy + Debug;

    fn on(self, event: Self::Event) -> Option<Self>;
}

/// Tagged state validated against its [`Lifecycle`] table on every mutation.
///
/// An illegal transition is a broken internal contract and panics.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Machine<S> {
    current: S,
}

impl<S: Lifecycle> Machine<S> {
    pub(crate) fn new(initial: S) -> Self {
        Self { current: initial }
    }

    #[inline]
    pub(crate) fn current(&self) -> S {
        self.current
    }

    #[inline]
    pub(crate) fn is(&self, state: S) -> bool {
        self.current == state
    }

    /// Apply `event` and return the new state.
    ///
    /// # Panics
    ///
    /// Panics if the table has no edge for `event` from the current state.
    pub(crate) fn fire(&mut self, event: S::Event) -> S {
        match self.current.on(event) {
            Some(next) => {
                tracing::trace!(from = ?self.current, to = ?next, ?event, "transition");
                self.current = next;
                next
            }
            None => {
                tracing::error!(state = ?self.current, ?event, "invalid state transition");
                panic!(
                    "invalid transition: event {:?} is not allowed in state {:?}",
                    event, self.current
                );
            }
        }
    }
}
