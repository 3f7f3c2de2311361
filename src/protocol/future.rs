//! Completion cell for an outstanding request.
//!
//! A [`FutureResponse`] is created with its request and completes exactly once: with a
//! reply (or no reply for fire-and-forget requests) or with a [`PeerException`]. Every
//! later completion attempt is refused. Callers may block on it, await it, or register a
//! continuation.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;

use crate::core::message::Message;
use crate::error::PeerException;

#[derive(Debug, Clone)]
pub enum FutureState {
    Pending,
    /// `None` for fire-and-forget requests.
    Success(Option<Box<Message>>),
    Failed(PeerException),
}

impl FutureState {
    fn outcome(&self) -> Option<std::result::Result<Option<Message>, PeerException>> {
        match self {
            FutureState::Pending => None,
            FutureState::Success(reply) => Some(Ok(reply.as_deref().cloned())),
            FutureState::Failed(e) => Some(Err(e.clone())),
        }
    }
}

type Continuation = Box<dyn FnOnce(&FutureState) + Send>;

struct Inner {
    request: Message,
    state: Mutex<FutureState>,
    continuations: Mutex<Vec<Continuation>>,
    cond: Condvar,
    notify: Notify,
}

#[derive(Clone)]
pub struct FutureResponse {
    inner: Arc<Inner>,
}

impl fmt::Debug for FutureResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureResponse")
            .field("request", &self.inner.request)
            .field("state", &*self.lock_state())
            .finish()
    }
}

impl FutureResponse {
    pub fn new(request: Message) -> Self {
        Self {
            inner: Arc::new(Inner {
                request,
                state: Mutex::new(FutureState::Pending),
                continuations: Mutex::new(Vec::new()),
                cond: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    pub fn request(&self) -> &Message {
        &self.inner.request
    }

    fn lock_state(&self) -> MutexGuard<'_, FutureState> {
        // a panic while holding the lock cannot leave the state half-written
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Resolves with `reply`. Returns false if already completed.
    pub fn complete(&self, reply: Option<Message>) -> bool {
        self.finish(FutureState::Success(reply.map(Box::new)))
    }

    /// Fails with `exception`. Returns false if already completed.
    pub fn fail(&self, exception: PeerException) -> bool {
        self.finish(FutureState::Failed(exception))
    }

    /// Fails as a user abort.
    pub fn cancel(&self, reason: &str) -> bool {
        self.fail(PeerException::user_abort(reason))
    }

    fn finish(&self, outcome: FutureState) -> bool {
        {
            let mut state = self.lock_state();
            if !matches!(*state, FutureState::Pending) {
                return false;
            }
            *state = outcome;
        }
        self.inner.cond.notify_all();
        self.inner.notify.notify_waiters();

        let continuations = std::mem::take(
            &mut *self
                .inner
                .continuations
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let state = self.state();
        for continuation in continuations {
            continuation(&state);
        }
        true
    }

    pub fn state(&self) -> FutureState {
        self.lock_state().clone()
    }

    pub fn is_completed(&self) -> bool {
        !matches!(*self.lock_state(), FutureState::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(*self.lock_state(), FutureState::Success(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(*self.lock_state(), FutureState::Failed(_))
    }

    /// The reply, once resolved with one.
    pub fn response(&self) -> Option<Message> {
        match &*self.lock_state() {
            FutureState::Success(reply) => reply.as_deref().cloned(),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<PeerException> {
        match &*self.lock_state() {
            FutureState::Failed(e) => Some(e.clone()),
            _ => None,
        }
    }

    /// Runs `f` once the future completes; immediately if it already has.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(&FutureState) + Send + 'static,
    {
        {
            let state = self.lock_state();
            if matches!(*state, FutureState::Pending) {
                self.inner
                    .continuations
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(Box::new(f));
                return;
            }
        }
        f(&self.state());
    }

    /// Blocks the calling thread until completion. Not for use on a runtime worker.
    pub fn wait(&self) -> std::result::Result<Option<Message>, PeerException> {
        let mut state = self.lock_state();
        loop {
            if let Some(outcome) = state.outcome() {
                return outcome;
            }
            state = self
                .inner
                .cond
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Like [`wait`](Self::wait) with an upper bound; `None` if still pending.
    pub fn wait_timeout(
        &self,
        timeout: Duration,
    ) -> Option<std::result::Result<Option<Message>, PeerException>> {
        let state = self.lock_state();
        let (state, _) = self
            .inner
            .cond
            .wait_timeout_while(state, timeout, |s| matches!(s, FutureState::Pending))
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.outcome()
    }

    /// Awaits completion.
    pub async fn await_response(&self) -> std::result::Result<Option<Message>, PeerException> {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(outcome) = self.lock_state().outcome() {
                return outcome;
            }
            notified.await;
        }
    }
}
