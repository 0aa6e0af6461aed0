//! Calls we sent and the results we are waiting for.
//!
//! A question id is reusable only after the peer has sent `Return` and our
//! `Finish` for it has reached the transport. Until then the entry stays in
//! the table.

use super::{ConnKey, ConnShared, ConnState};
use crate::capability::{Answer, Caller, Client, ClientKind, Promise, Request};
use crate::cancel::{CancelRegistration, CancelToken};
use crate::error::{Error, Result};
use crate::idgen::IdGen;
use crate::message::{
    Bootstrap, Call, Disembargo, DisembargoContext, Finish, Message, MessageTarget,
    PromisedAnswer, QuestionId, Return, ReturnBody, SendResultsTo,
};
use crate::value::{Payload, PipelineOp};
use parking_lot::MutexGuard;
use std::sync::{Arc, Weak};

pub(crate) struct QuestionEntry {
    promise: Arc<Promise>,
    /// No further `Finish` may be sent: cancelled, or the peer returned.
    finished: bool,
    returned: bool,
    finish_sent: bool,
    /// Transforms of calls pipelined on this question, checked for embargoes.
    called: Vec<Vec<PipelineOp>>,
    /// The caller's token and our callback on it, forgotten once settled.
    cancel: Option<(CancelToken, CancelRegistration)>,
}

impl QuestionEntry {
    fn new(promise: Arc<Promise>) -> Self {
        Self {
            promise,
            finished: false,
            returned: false,
            finish_sent: false,
            called: Vec::new(),
            cancel: None,
        }
    }

    /// Detaches from the caller's token; the call can no longer be canceled.
    fn forget_cancel(&mut self) {
        if let Some((token, registration)) = self.cancel.take() {
            token.forget(registration);
        }
    }

    fn owns(&self, promise: &Arc<Promise>) -> bool {
        Arc::ptr_eq(&self.promise, promise)
    }
}

pub(crate) struct QuestionTable {
    entries: Vec<Option<QuestionEntry>>,
    ids: IdGen,
}

impl QuestionTable {
    pub(crate) const fn new() -> Self {
        Self {
            entries: Vec::new(),
            ids: IdGen::new("question"),
        }
    }

    fn get(&self, id: QuestionId) -> Option<&QuestionEntry> {
        self.entries.get(id as usize).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: QuestionId) -> Option<&mut QuestionEntry> {
        self.entries.get_mut(id as usize).and_then(Option::as_mut)
    }

    fn insert(&mut self, id: QuestionId, entry: QuestionEntry) {
        let idx = id as usize;
        if self.entries.len() <= idx {
            self.entries.resize_with(idx + 1, || None);
        }
        self.entries[idx] = Some(entry);
    }

    /// Removes the entry and frees its id.
    fn retire(&mut self, id: QuestionId) -> Option<QuestionEntry> {
        let mut entry = self.entries.get_mut(id as usize).and_then(Option::take);
        if let Some(q) = entry.as_mut() {
            q.forget_cancel();
            self.ids.remove(id);
        }
        entry
    }

    /// Returns true if `promise` belongs to a question that can still take
    /// pipelined calls.
    pub(crate) fn is_open(&self, id: QuestionId, promise: &Arc<Promise>) -> bool {
        self.get(id).is_some_and(|q| q.owns(promise) && !q.finished)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// Empties the table, returning the promises still waiting for results.
    pub(crate) fn take_all(&mut self) -> Vec<Arc<Promise>> {
        self.ids = IdGen::new("question");
        std::mem::take(&mut self.entries)
            .into_iter()
            .flatten()
            .map(|mut q| {
                q.forget_cancel();
                q.promise
            })
            .collect()
    }
}

/// Handle from a question's promise back to the connection.
///
/// Both references are weak: the promise owns this handle, and the
/// connection may be gone by the time a pipelined call is made.
#[derive(Clone)]
pub(crate) struct QuestionRef {
    conn: Weak<ConnShared>,
    pub(crate) key: ConnKey,
    pub(crate) id: QuestionId,
    promise: Weak<Promise>,
}

impl QuestionRef {
    /// Sends a call on a capability inside this question's results.
    pub(crate) fn pipeline_send(&self, transform: &[PipelineOp], req: Request) -> Answer {
        let Some(conn) = self.conn.upgrade() else {
            return Answer::error(Error::connection_closed());
        };
        let Some(promise) = self.promise.upgrade() else {
            return Answer::error(Error::failed("pipelined call on a dropped question"));
        };
        let mut state = conn.state.lock();
        let open = match state.questions.get_mut(self.id) {
            Some(q) if q.owns(&promise) && !q.finished => {
                if !q.called.iter().any(|t| t == transform) {
                    q.called.push(transform.to_vec());
                }
                true
            }
            _ => false,
        };
        if open {
            let target = MessageTarget::PromisedAnswer(PromisedAnswer {
                question_id: self.id,
                transform: transform.to_vec(),
            });
            return conn.send_call_locked(state, target, req);
        }
        drop(state);
        // Returned or cancelled: the promise is about to resolve.
        promise.requeue(transform, req)
    }
}

impl ConnShared {
    /// Allocates a question and its promise.
    fn new_question(self: &Arc<Self>, state: &mut ConnState) -> Result<(QuestionId, Arc<Promise>)> {
        let id = state.questions.ids.next()?;
        let conn = Arc::downgrade(self);
        let key = self.key;
        let promise = Arc::new_cyclic(|weak| {
            Promise::new(Caller::Question(QuestionRef {
                conn,
                key,
                id,
                promise: weak.clone(),
            }))
        });
        state.questions.insert(id, QuestionEntry::new(Arc::clone(&promise)));
        Ok((id, promise))
    }

    /// Queues the message that opens question `id`.
    fn send_question(
        self: &Arc<Self>,
        id: QuestionId,
        promise: &Arc<Promise>,
        msg: Message,
        cancel: Option<CancelToken>,
    ) {
        let conn = Arc::downgrade(self);
        let weak = Arc::downgrade(promise);
        self.send(
            msg,
            Some(Box::new(move |result| {
                if let (Some(conn), Some(promise)) = (conn.upgrade(), weak.upgrade()) {
                    conn.question_sent(id, &promise, result, cancel);
                }
            })),
        );
    }

    fn question_sent(
        self: &Arc<Self>,
        id: QuestionId,
        promise: &Arc<Promise>,
        result: Result<()>,
        cancel: Option<CancelToken>,
    ) {
        match result {
            Err(err) => {
                {
                    let mut state = self.state.lock();
                    if state.questions.get(id).is_some_and(|q| q.owns(promise)) {
                        state.questions.retire(id);
                    }
                }
                promise.reject(err.with_context("send question"));
            }
            Ok(()) => {
                let Some(token) = cancel else {
                    return;
                };
                let conn = Arc::downgrade(self);
                let weak = Arc::downgrade(promise);
                let Some(registration) = token.on_cancel(move |_| {
                    if let (Some(conn), Some(promise)) = (conn.upgrade(), weak.upgrade()) {
                        conn.cancel_question(id, &promise);
                    }
                }) else {
                    return;
                };
                let mut state = self.state.lock();
                match state.questions.get_mut(id) {
                    Some(q) if q.owns(promise) && !q.finished => {
                        q.cancel = Some((token, registration));
                    }
                    // Settled while we registered.
                    _ => {
                        token.forget(registration);
                    }
                }
            }
        }
    }

    pub(crate) fn bootstrap(self: &Arc<Self>) -> Client {
        let mut state = self.state.lock();
        if state.closing {
            return Client::error(Error::connection_closed());
        }
        let (id, promise) = match self.new_question(&mut state) {
            Ok(q) => q,
            Err(err) => {
                drop(state);
                self.fail(err.clone());
                return Client::error(err);
            }
        };
        self.send_question(
            id,
            &promise,
            Message::Bootstrap(Bootstrap { question_id: id }),
            None,
        );
        drop(state);
        tracing::debug!(conn = self.key.0, question = id, "bootstrap requested");
        Client::pipeline(promise, Vec::new())
    }

    /// Sends a call to the peer. Consumes the table lock.
    pub(crate) fn send_call_locked(
        self: &Arc<Self>,
        mut state: MutexGuard<'_, ConnState>,
        target: MessageTarget,
        req: Request,
    ) -> Answer {
        if state.closing {
            return Answer::error(Error::connection_closed());
        }
        let prepared = self
            .send_payload(&mut state, &req.params)
            .and_then(|(params, _)| {
                let question = self.new_question(&mut state)?;
                Ok((params, question))
            });
        let (params, (id, promise)) = match prepared {
            Ok(p) => p,
            Err(err) => {
                drop(state);
                self.fail(err.clone());
                return Answer::error(err);
            }
        };
        let msg = Message::Call(Call {
            question_id: id,
            target,
            interface_id: req.method.interface_id,
            method_id: req.method.method_id,
            params,
            send_results_to: SendResultsTo::Caller,
        });
        self.send_question(id, &promise, msg, req.cancel.clone());
        drop(state);
        tracing::trace!(conn = self.key.0, question = id, method = %req.method, "call sent");
        drop(req);
        Answer::from_promise(promise)
    }

    /// Cancels an outstanding question: sends `Finish` and fails the promise.
    fn cancel_question(self: &Arc<Self>, id: QuestionId, promise: &Arc<Promise>) {
        {
            let mut state = self.state.lock();
            match state.questions.get_mut(id) {
                Some(q) if q.owns(promise) && !q.finished => q.finished = true,
                _ => return,
            }
            self.send_finish(id, promise, true);
        }
        tracing::debug!(conn = self.key.0, question = id, "question canceled");
        promise.reject(Error::failed("call canceled"));
    }

    fn send_finish(self: &Arc<Self>, id: QuestionId, promise: &Arc<Promise>, release_result_caps: bool) {
        let conn = Arc::downgrade(self);
        let weak = Arc::downgrade(promise);
        self.send(
            Message::Finish(Finish {
                question_id: id,
                release_result_caps,
            }),
            Some(Box::new(move |result| {
                if let (Some(conn), Some(promise)) = (conn.upgrade(), weak.upgrade()) {
                    conn.finish_sent(id, &promise, result);
                }
            })),
        );
    }

    fn finish_sent(&self, id: QuestionId, promise: &Arc<Promise>, result: Result<()>) {
        if let Err(err) = result {
            // The peer may never learn the question is done; keep the id.
            self.report(&err.with_context("send finish"));
            return;
        }
        let retired = {
            let mut state = self.state.lock();
            match state.questions.get_mut(id) {
                Some(q) if q.owns(promise) => {
                    q.finish_sent = true;
                    if q.returned {
                        state.questions.retire(id)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        drop(retired);
    }

    pub(super) fn handle_return(self: &Arc<Self>, ret: Return) -> Result<()> {
        let id = ret.answer_id;
        let mut state = self.state.lock();
        let Some(q) = state.questions.get_mut(id) else {
            return Err(Error::protocol(format!(
                "incoming return: question {id} does not exist"
            )));
        };
        if q.returned {
            return Err(Error::protocol(format!(
                "incoming return: question {id} already returned"
            )));
        }
        q.returned = true;
        if q.finished {
            q.forget_cancel();
            // Canceled earlier; our Finish asked the peer to drop the results.
            if q.finish_sent {
                let retired = state.questions.retire(id);
                drop(state);
                drop(retired);
            }
            return Ok(());
        }
        q.finished = true;
        q.forget_cancel();
        let promise = Arc::clone(&q.promise);
        let called = q.called.clone();

        let mut anomalies = Vec::new();
        let mut disembargoes = Vec::new();
        let outcome = match ret.body {
            ReturnBody::Results(wire) => {
                let received = self
                    .recv_payload(&mut state, wire, &mut anomalies)
                    .map_err(|err| err.with_context("incoming return"))?;
                let mut payload = received.payload;
                for transform in called {
                    let Some(idx) = payload.cap_index(&transform) else {
                        continue;
                    };
                    let embargoed = matches!(payload.caps[idx].kind(), Some(ClientKind::Embargoed(_)));
                    if !received.locals[idx] || embargoed {
                        continue;
                    }
                    let eid = state
                        .embargoes
                        .place(&mut payload.caps[idx])
                        .map_err(|err| err.with_context("incoming return"))?;
                    disembargoes.push((eid, transform));
                }
                Ok(payload)
            }
            ReturnBody::Exception(exc) => Err(Error::from(exc)),
            ReturnBody::Canceled => {
                let err = Error::failed("call canceled by peer");
                anomalies.push(err.clone().with_context("incoming return"));
                Err(err)
            }
        };
        let guard = self.tasks.try_start();
        drop(state);
        for err in &anomalies {
            self.report(err);
        }
        let Some(guard) = guard else {
            // Shutting down; the table sweep fails the promise.
            return Ok(());
        };

        tracing::trace!(
            conn = self.key.0,
            question = id,
            ok = outcome.is_ok(),
            embargoes = disembargoes.len(),
            "return received"
        );
        let conn = Arc::clone(self);
        self.spawn_task("return", guard, move || {
            conn.complete_question(id, &promise, outcome, disembargoes);
        });
        Ok(())
    }

    /// Resolves a returned question, then sends its disembargoes and
    /// `Finish`, in that order.
    fn complete_question(
        self: &Arc<Self>,
        id: QuestionId,
        promise: &Arc<Promise>,
        outcome: Result<Payload>,
        disembargoes: Vec<(u32, Vec<PipelineOp>)>,
    ) {
        promise.resolve(outcome);
        for (eid, transform) in disembargoes {
            self.send_reporting(
                Message::Disembargo(Disembargo {
                    target: MessageTarget::PromisedAnswer(PromisedAnswer {
                        question_id: id,
                        transform,
                    }),
                    context: DisembargoContext::SenderLoopback(eid),
                }),
                "incoming return: send disembargo",
            );
        }
        self.send_finish(id, promise, false);
    }
}
