//! Cancellation tokens for calls.
//!
//! Every inbound call that reaches an application capability carries a
//! [`CancelToken`] tied to its answer. The token is a child of the connection's
//! background token, so shutting the connection down cancels every in-flight
//! call. Outbound calls may carry a caller-owned token; firing it before the
//! `Return` arrives retires the question with a `Finish`.
//!
//! Cancellation is sticky: the first reason wins and later requests are no-ops.

use core::fmt;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// The kind of cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CancelKind {
    /// Explicit cancellation requested by user code.
    User,
    /// The peer sent `Finish` for the call before it returned.
    PeerFinished,
    /// A parent token was cancelled.
    ParentCancelled,
    /// The owning connection is shutting down.
    Shutdown,
}

impl fmt::Display for CancelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::PeerFinished => write!(f, "peer finished"),
            Self::ParentCancelled => write!(f, "parent cancelled"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// The reason for a cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelReason {
    /// The kind of cancellation.
    pub kind: CancelKind,
    /// Optional human-readable message.
    pub message: Option<&'static str>,
}

impl CancelReason {
    /// Creates a reason with the given kind.
    #[must_use]
    pub const fn new(kind: CancelKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    /// Creates a user cancellation reason with a message.
    #[must_use]
    pub const fn user(message: &'static str) -> Self {
        Self {
            kind: CancelKind::User,
            message: Some(message),
        }
    }

    /// The peer retired the call early.
    #[must_use]
    pub const fn peer_finished() -> Self {
        Self::new(CancelKind::PeerFinished)
    }

    /// Creates a parent-cancelled reason.
    #[must_use]
    pub const fn parent_cancelled() -> Self {
        Self::new(CancelKind::ParentCancelled)
    }

    /// Creates a shutdown reason.
    #[must_use]
    pub const fn shutdown() -> Self {
        Self::new(CancelKind::Shutdown)
    }

    /// Returns true if this reason indicates shutdown.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self.kind, CancelKind::Shutdown)
    }
}

impl Default for CancelReason {
    fn default() -> Self {
        Self::new(CancelKind::User)
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(msg) = self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

type CancelCallback = Box<dyn FnOnce(&CancelReason) + Send>;

/// Handle to a callback registered with [`CancelToken::on_cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CancelRegistration(u64);

#[derive(Default)]
struct CancelState {
    reason: Option<CancelReason>,
    callbacks: Vec<(u64, CancelCallback)>,
    next_key: u64,
    children: Vec<Weak<CancelInner>>,
}

struct CancelInner {
    state: Mutex<CancelState>,
    cond: Condvar,
}

/// A cloneable, thread-safe cancellation handle.
///
/// Clones observe the same state. Children created with [`child`](Self::child)
/// are cancelled whenever their parent is.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    /// Creates an uncancelled root token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                state: Mutex::new(CancelState::default()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Creates a child token.
    ///
    /// If this token is already cancelled the child starts cancelled.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Self::new();
        let mut state = self.inner.state.lock();
        if state.reason.is_some() {
            drop(state);
            child.cancel(CancelReason::parent_cancelled());
            return child;
        }
        state.children.retain(|w| w.strong_count() > 0);
        state.children.push(Arc::downgrade(&child.inner));
        drop(state);
        child
    }

    /// Cancels the token and all of its children.
    ///
    /// Returns false if the token was already cancelled. Callbacks run on the
    /// calling thread, after the token's own lock is released.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let (callbacks, children) = {
            let mut state = self.inner.state.lock();
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason.clone());
            (
                std::mem::take(&mut state.callbacks),
                std::mem::take(&mut state.children),
            )
        };
        self.inner.cond.notify_all();
        for (_, cb) in callbacks {
            cb(&reason);
        }
        for child in children.iter().filter_map(Weak::upgrade) {
            Self { inner: child }.cancel(CancelReason::parent_cancelled());
        }
        true
    }

    /// Returns true once the token has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().reason.is_some()
    }

    /// Returns the cancellation reason, if cancelled.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.state.lock().reason.clone()
    }

    /// Registers a callback to run once on cancellation.
    ///
    /// If the token is already cancelled the callback runs immediately on the
    /// calling thread and `None` is returned. Otherwise the returned handle
    /// can [`forget`](Self::forget) the callback, which long-lived tokens
    /// need to avoid holding one closure per finished operation.
    pub fn on_cancel(
        &self,
        f: impl FnOnce(&CancelReason) + Send + 'static,
    ) -> Option<CancelRegistration> {
        let mut state = self.inner.state.lock();
        if let Some(reason) = state.reason.clone() {
            drop(state);
            f(&reason);
            return None;
        }
        let key = state.next_key;
        state.next_key += 1;
        state.callbacks.push((key, Box::new(f)));
        Some(CancelRegistration(key))
    }

    /// Drops a registered callback without running it.
    ///
    /// Returns false if the callback already ran or was forgotten.
    pub fn forget(&self, registration: CancelRegistration) -> bool {
        let removed = {
            let mut state = self.inner.state.lock();
            state
                .callbacks
                .iter()
                .position(|(key, _)| *key == registration.0)
                .map(|idx| state.callbacks.swap_remove(idx))
        };
        // The closure may own handles whose drop takes other locks.
        removed.is_some()
    }

    /// Blocks until the token is cancelled.
    pub fn wait(&self) -> CancelReason {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(reason) = &state.reason {
                return reason.clone();
            }
            self.inner.cond.wait(&mut state);
        }
    }

    /// Blocks until the token is cancelled or the timeout elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CancelReason> {
        let mut state = self.inner.state.lock();
        if state.reason.is_none() {
            let _ = self
                .inner
                .cond
                .wait_while_for(&mut state, |s| s.reason.is_none(), timeout);
        }
        state.reason.clone()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn first_reason_wins() {
        init_test("first_reason_wins");
        let token = CancelToken::new();
        assert!(token.cancel(CancelReason::user("stop")));
        assert!(!token.cancel(CancelReason::shutdown()));
        assert_eq!(token.reason(), Some(CancelReason::user("stop")));
        crate::test_complete!("first_reason_wins");
    }

    #[test]
    fn parent_cascades_to_children() {
        init_test("parent_cascades_to_children");
        let parent = CancelToken::new();
        let child = parent.child();
        let grandchild = child.child();
        parent.cancel(CancelReason::shutdown());
        assert_eq!(
            grandchild.reason().map(|r| r.kind),
            Some(CancelKind::ParentCancelled)
        );
        let late = parent.child();
        assert!(late.is_cancelled());
        crate::test_complete!("parent_cascades_to_children");
    }

    #[test]
    fn child_cancel_does_not_touch_parent() {
        init_test("child_cancel_does_not_touch_parent");
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel(CancelReason::peer_finished());
        assert!(!parent.is_cancelled());
        crate::test_complete!("child_cancel_does_not_touch_parent");
    }

    #[test]
    fn callbacks_run_exactly_once() {
        init_test("callbacks_run_exactly_once");
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        token.on_cancel(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        token.cancel(CancelReason::user("a"));
        token.cancel(CancelReason::user("b"));
        let h = Arc::clone(&hits);
        token.on_cancel(move |reason| {
            assert_eq!(reason.message, Some("a"));
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        crate::test_complete!("callbacks_run_exactly_once");
    }

    #[test]
    fn forgotten_callbacks_are_dropped_unrun() {
        init_test("forgotten_callbacks_are_dropped_unrun");
        let token = CancelToken::new();
        let held = Arc::new(AtomicUsize::new(0));
        let regs: Vec<_> = (0..100)
            .map(|_| {
                let h = Arc::clone(&held);
                token
                    .on_cancel(move |_| {
                        h.fetch_add(1, Ordering::SeqCst);
                    })
                    .expect("token is live")
            })
            .collect();
        assert_eq!(Arc::strong_count(&held), 101);
        for reg in &regs[1..] {
            assert!(token.forget(*reg));
        }
        assert!(!token.forget(regs[1]));
        assert_eq!(Arc::strong_count(&held), 2);

        token.cancel(CancelReason::user("late"));
        assert_eq!(held.load(Ordering::SeqCst), 1);
        assert!(!token.forget(regs[0]));
        assert!(token.on_cancel(|_| {}).is_none());
        crate::test_complete!("forgotten_callbacks_are_dropped_unrun");
    }

    #[test]
    fn wait_unblocks_on_cancel() {
        init_test("wait_unblocks_on_cancel");
        let token = CancelToken::new();
        let t = token.clone();
        let waiter = std::thread::spawn(move || t.wait());
        std::thread::sleep(Duration::from_millis(10));
        token.cancel(CancelReason::shutdown());
        let reason = waiter.join().expect("waiter panicked");
        assert!(reason.is_shutdown());
        assert!(CancelToken::new().wait_timeout(Duration::from_millis(5)).is_none());
        crate::test_complete!("wait_unblocks_on_cancel");
    }
}
