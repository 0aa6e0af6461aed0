//! Single-assignment call results with ordered pipelining.
//!
//! A [`Promise`] moves through three phases:
//!
//! ```text
//! Unresolved(caller) ──resolve──▶ Resolving ──▶ Resolved(result)
//! ```
//!
//! While unresolved, pipelined calls go to the promise's [`Caller`]:
//! queued locally (`Hold`), forwarded to another answer (`Forward`), or sent
//! to the peer as a call on a promised answer (`Question`). `Resolving` drains
//! everything queued so far into the result, and waits for pipelined sends
//! still in progress, before any caller sees the result. That is what keeps
//! pipelined calls ahead of calls made on the resolved capability.
//!
//! Resolution is single-assignment: the first `resolve` wins and later ones
//! report `false`.
//!
//! Lock order: a connection's table lock may be held while a promise lock is
//! taken, never the reverse. No call is sent and no signal runs with a
//! promise lock held.

use super::{Client, Request};
use crate::error::{Error, Result};
use crate::rpc::QuestionRef;
use crate::value::{Payload, PipelineOp};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

type Resolution = Arc<Result<Payload>>;
type Signal = Box<dyn FnOnce(&Result<Payload>) + Send>;

/// Where pipelined calls go while a promise is unresolved.
#[derive(Clone)]
pub(crate) enum Caller {
    /// Queue until the promise resolves or gets another caller.
    Hold,
    /// Forward to another answer's pipeline.
    Forward(Answer),
    /// Send to the peer against an outstanding question.
    Question(QuestionRef),
}

impl Caller {
    fn send(&self, transform: &[PipelineOp], req: Request) -> Answer {
        match self {
            Self::Hold => Answer::error(Error::failed("pipelined call on held promise")),
            Self::Forward(answer) => answer.promise.pipeline_send(transform, req),
            Self::Question(question) => question.pipeline_send(transform, req),
        }
    }
}

enum Phase {
    Unresolved(Caller),
    Resolving,
    Resolved(Resolution),
}

struct QueuedCall {
    transform: Vec<PipelineOp>,
    req: Request,
    answer: Arc<Promise>,
}

struct PromiseState {
    phase: Phase,
    queued: VecDeque<QueuedCall>,
    /// A drainer is delivering `queued` with the lock released.
    draining: bool,
    /// Pipelined sends in progress outside the lock.
    ongoing: usize,
    signals: Vec<Signal>,
}

enum Route {
    Queue,
    Direct(Resolution),
    Call(Caller),
}

pub(crate) struct Promise {
    state: Mutex<PromiseState>,
    changed: Condvar,
}

pub(crate) fn resolution_client(res: &Result<Payload>, transform: &[PipelineOp]) -> Client {
    match res {
        Ok(payload) => payload.client(transform),
        Err(err) => Client::error(err.clone()),
    }
}

impl Promise {
    pub(crate) fn new(caller: Caller) -> Self {
        Self {
            state: Mutex::new(PromiseState {
                phase: Phase::Unresolved(caller),
                queued: VecDeque::new(),
                draining: false,
                ongoing: 0,
                signals: Vec::new(),
            }),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn new_resolved(result: Result<Payload>) -> Self {
        let promise = Self::new(Caller::Hold);
        promise.state.lock().phase = Phase::Resolved(Arc::new(result));
        promise
    }

    /// Delivers the queued calls in order. The caller owns `draining`.
    fn drain_queue(
        &self,
        state: &mut MutexGuard<'_, PromiseState>,
        mut deliver: impl FnMut(&[PipelineOp], Request) -> Answer,
    ) {
        loop {
            let batch: Vec<QueuedCall> = state.queued.drain(..).collect();
            if batch.is_empty() {
                return;
            }
            MutexGuard::unlocked(state, || {
                for call in batch {
                    let answer = deliver(&call.transform, call.req);
                    call.answer.join(answer);
                }
            });
        }
    }

    /// Resolves the promise. Returns false if it was already resolved.
    pub(crate) fn resolve(&self, result: Result<Payload>) -> bool {
        let res: Resolution = Arc::new(result);
        let mut state = self.state.lock();
        while state.draining {
            self.changed.wait(&mut state);
        }
        if !matches!(state.phase, Phase::Unresolved(_)) {
            return false;
        }
        state.phase = Phase::Resolving;
        // In-flight sends may requeue into this promise, so drain until both
        // the queue and the in-flight count are empty.
        loop {
            state.draining = true;
            self.drain_queue(&mut state, |transform, req| {
                resolution_client(&res, transform).send(req)
            });
            state.draining = false;
            if state.ongoing == 0 {
                break;
            }
            self.changed.wait(&mut state);
        }
        state.phase = Phase::Resolved(Arc::clone(&res));
        let signals = std::mem::take(&mut state.signals);
        drop(state);
        self.changed.notify_all();
        for signal in signals {
            signal(&res);
        }
        true
    }

    pub(crate) fn fulfill(&self, payload: Payload) -> bool {
        self.resolve(Ok(payload))
    }

    pub(crate) fn reject(&self, err: Error) -> bool {
        self.resolve(Err(err))
    }

    /// Replaces the caller of an unresolved promise and flushes calls queued
    /// under the previous one.
    pub(crate) fn set_caller(&self, caller: Caller) {
        let mut state = self.state.lock();
        while state.draining {
            self.changed.wait(&mut state);
        }
        if !matches!(state.phase, Phase::Unresolved(_)) {
            return;
        }
        state.phase = Phase::Unresolved(caller.clone());
        if state.queued.is_empty() || matches!(caller, Caller::Hold) {
            return;
        }
        state.draining = true;
        self.drain_queue(&mut state, |transform, req| caller.send(transform, req));
        state.draining = false;
        drop(state);
        self.changed.notify_all();
    }

    /// Makes this promise follow `target`: pipelined calls forward to it and
    /// its result becomes this promise's result.
    pub(crate) fn join(self: &Arc<Self>, target: Answer) {
        if Arc::ptr_eq(self, &target.promise) {
            return;
        }
        self.set_caller(Caller::Forward(target.clone()));
        let me = Arc::clone(self);
        target.on_resolved(move |res| {
            me.resolve(res.clone());
        });
    }

    /// Sends a call on the capability at `transform` of the eventual result.
    pub(crate) fn pipeline_send(&self, transform: &[PipelineOp], req: Request) -> Answer {
        let mut state = self.state.lock();
        let route = match &state.phase {
            Phase::Resolved(res) => Route::Direct(Arc::clone(res)),
            Phase::Resolving | Phase::Unresolved(Caller::Hold) => Route::Queue,
            Phase::Unresolved(_) if state.draining => Route::Queue,
            Phase::Unresolved(caller) => Route::Call(caller.clone()),
        };
        match route {
            Route::Direct(res) => {
                drop(state);
                resolution_client(&res, transform).send(req)
            }
            Route::Queue => {
                let answer = Arc::new(Self::new(Caller::Hold));
                state.queued.push_back(QueuedCall {
                    transform: transform.to_vec(),
                    req,
                    answer: Arc::clone(&answer),
                });
                Answer::from_promise(answer)
            }
            Route::Call(caller) => {
                state.ongoing += 1;
                drop(state);
                let answer = caller.send(transform, req);
                let mut state = self.state.lock();
                state.ongoing -= 1;
                let idle = state.ongoing == 0;
                drop(state);
                if idle {
                    self.changed.notify_all();
                }
                answer
            }
        }
    }

    /// Holds a call until resolution, bypassing the caller. Used when the
    /// caller can no longer take calls but the result is still on its way.
    pub(crate) fn requeue(&self, transform: &[PipelineOp], req: Request) -> Answer {
        let mut state = self.state.lock();
        if let Phase::Resolved(res) = &state.phase {
            let res = Arc::clone(res);
            drop(state);
            return resolution_client(&res, transform).send(req);
        }
        let answer = Arc::new(Self::new(Caller::Hold));
        state.queued.push_back(QueuedCall {
            transform: transform.to_vec(),
            req,
            answer: Arc::clone(&answer),
        });
        Answer::from_promise(answer)
    }

    /// Runs `f` once resolved; immediately if already resolved.
    pub(crate) fn on_resolved(&self, f: impl FnOnce(&Result<Payload>) + Send + 'static) {
        let mut state = self.state.lock();
        let resolved = match &state.phase {
            Phase::Resolved(res) => Some(Arc::clone(res)),
            _ => None,
        };
        match resolved {
            Some(res) => {
                drop(state);
                f(&res);
            }
            None => state.signals.push(Box::new(f)),
        }
    }

    pub(crate) fn resolution(&self) -> Option<Resolution> {
        match &self.state.lock().phase {
            Phase::Resolved(res) => Some(Arc::clone(res)),
            _ => None,
        }
    }

    pub(crate) fn is_resolved(&self) -> bool {
        matches!(self.state.lock().phase, Phase::Resolved(_))
    }

    /// The outstanding question this promise is waiting on, if any.
    pub(crate) fn question(&self) -> Option<QuestionRef> {
        match &self.state.lock().phase {
            Phase::Unresolved(Caller::Question(q)) => Some(q.clone()),
            _ => None,
        }
    }

    fn wait(&self, deadline: Option<Instant>) -> Option<Result<Payload>> {
        let mut state = self.state.lock();
        loop {
            if let Phase::Resolved(res) = &state.phase {
                return Some((**res).clone());
            }
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        return match &state.phase {
                            Phase::Resolved(res) => Some((**res).clone()),
                            _ => None,
                        };
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
    }
}

/// The eventual result of a call.
///
/// Pipelining: [`pipeline`](Self::pipeline) and [`field`](Self::field) return
/// capabilities usable before the result arrives.
#[derive(Clone)]
pub struct Answer {
    promise: Arc<Promise>,
}

impl Answer {
    pub(crate) fn from_promise(promise: Arc<Promise>) -> Self {
        Self { promise }
    }

    pub(crate) fn promise(&self) -> &Arc<Promise> {
        &self.promise
    }

    /// An already-resolved answer.
    #[must_use]
    pub fn ready(result: Result<Payload>) -> Self {
        Self::from_promise(Arc::new(Promise::new_resolved(result)))
    }

    /// An answer that failed with `err`.
    #[must_use]
    pub fn error(err: Error) -> Self {
        Self::ready(Err(err))
    }

    /// Blocks until the result arrives.
    pub fn wait(&self) -> Result<Payload> {
        match self.promise.wait(None) {
            Some(result) => result,
            None => Err(Error::failed("answer wait ended without a result")),
        }
    }

    /// Blocks up to `timeout`. `None` means still unresolved.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Payload>> {
        self.promise.wait(Some(Instant::now() + timeout))
    }

    /// Returns true once resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.promise.is_resolved()
    }

    /// The capability found at `transform` of the eventual result.
    #[must_use]
    pub fn pipeline(&self, transform: &[PipelineOp]) -> Client {
        Client::pipeline(Arc::clone(&self.promise), transform.to_vec())
    }

    /// The capability in pointer field `index` of the eventual result.
    #[must_use]
    pub fn field(&self, index: u16) -> Client {
        self.pipeline(&[PipelineOp::GetPointerField(index)])
    }

    /// Runs `f` when the result arrives, on the resolving thread.
    pub fn on_resolved(&self, f: impl FnOnce(&Result<Payload>) + Send + 'static) {
        self.promise.on_resolved(f);
    }
}

impl std::fmt::Debug for Answer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Answer")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
