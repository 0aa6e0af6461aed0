//! Calls the peer sent us.
//!
//! An answer moves through four flags, in any interleaving of the two
//! independent events (our results, the peer's `Finish`):
//!
//! ```text
//! RESULTS_READY ─▶ RETURN_SENT ─┐
//!                               ├─▶ destroyed
//! FINISH_RECEIVED ──────────────┘
//! ```
//!
//! The entry is destroyed once both `RETURN_SENT` and `FINISH_RECEIVED` are
//! set. If the peer asked for it, destruction releases the exports that were
//! created for the results.

use super::ConnShared;
use super::tasks::TaskGuard;
use crate::cancel::{CancelReason, CancelToken};
use crate::capability::{Caller, Client, Method, Promise, Request};
use crate::error::{Error, Result};
use crate::message::{
    AnswerId, Bootstrap, Call, ExportId, Finish, Message, MessageTarget, Return, ReturnBody,
    SendResultsTo,
};
use crate::value::Payload;
use std::collections::HashMap;
use std::sync::Arc;

/// Bit set of answer lifecycle events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct AnswerFlags(u8);

impl AnswerFlags {
    pub(crate) const RESULTS_READY: Self = Self(1);
    pub(crate) const RETURN_SENT: Self = Self(1 << 1);
    pub(crate) const FINISH_RECEIVED: Self = Self(1 << 2);
    pub(crate) const RELEASE_RESULT_CAPS: Self = Self(1 << 3);

    pub(crate) const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Both the return and the finish have happened.
    pub(crate) const fn is_done(self) -> bool {
        self.contains(Self::RETURN_SENT) && self.contains(Self::FINISH_RECEIVED)
    }
}

pub(crate) struct AnswerEntry {
    flags: AnswerFlags,
    /// Pipelining target for calls on this answer: holds, then forwards to
    /// the callee, then resolves with the results.
    promise: Arc<Promise>,
    results: Option<Payload>,
    err: Option<Error>,
    /// Export references created for the results, by export id.
    export_refs: HashMap<ExportId, u32>,
    cancel: Option<CancelToken>,
    task: Option<TaskGuard>,
}

impl AnswerEntry {
    fn new(promise: Arc<Promise>, cancel: Option<CancelToken>, task: Option<TaskGuard>) -> Self {
        Self {
            flags: AnswerFlags::default(),
            promise,
            results: None,
            err: None,
            export_refs: HashMap::new(),
            cancel,
            task,
        }
    }

    pub(crate) const fn flags(&self) -> AnswerFlags {
        self.flags
    }

    pub(crate) fn promise(&self) -> &Arc<Promise> {
        &self.promise
    }

    pub(crate) const fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    pub(crate) const fn results(&self) -> Option<&Payload> {
        self.results.as_ref()
    }
}

#[derive(Default)]
pub(crate) struct AnswerTable {
    entries: HashMap<AnswerId, AnswerEntry>,
}

impl AnswerTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, id: AnswerId) -> Option<&AnswerEntry> {
        self.entries.get(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn take_all(&mut self) -> Vec<AnswerEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }
}

/// What destroying an answer hands back for release outside the lock.
struct Destroyed {
    _entry: AnswerEntry,
    _released: Vec<Client>,
}

impl ConnShared {
    pub(super) fn handle_bootstrap(self: &Arc<Self>, boot: Bootstrap) -> Result<()> {
        let id = boot.question_id;
        let bootstrap = {
            let mut state = self.state.lock();
            if state.answers.entries.contains_key(&id) {
                return Err(Error::protocol(format!(
                    "incoming bootstrap: answer ID {id} reused"
                )));
            }
            let promise = Arc::new(Promise::new(Caller::Hold));
            state
                .answers
                .entries
                .insert(id, AnswerEntry::new(promise, None, None));
            state.bootstrap.clone()
        };
        match bootstrap {
            Some(client) => self.send_return(id, Payload::capability(client)),
            None => self.send_exception(
                id,
                Error::failed("vat does not expose a public/bootstrap interface"),
            ),
        }
        Ok(())
    }

    pub(super) fn handle_call(self: &Arc<Self>, call: Call) -> Result<()> {
        let id = call.question_id;
        if call.send_results_to != SendResultsTo::Caller {
            self.report(&Error::unimplemented(
                "incoming call: results destination is not caller",
            ));
            self.send_reporting(
                Message::Unimplemented(Box::new(Message::Call(call))),
                "incoming call: send unimplemented",
            );
            return Ok(());
        }

        let mut state = self.state.lock();
        if state.answers.entries.contains_key(&id) {
            return Err(Error::protocol(format!(
                "incoming call: answer ID {id} reused"
            )));
        }
        let mut anomalies = Vec::new();
        let params = self
            .recv_payload(&mut state, call.params, &mut anomalies)
            .map_err(|err| err.with_context("incoming call"))?
            .payload;
        let target = match call.target {
            MessageTarget::ImportedCap(export) => match state.exports.get(export) {
                Some(client) => client.clone(),
                None => {
                    return Err(Error::protocol(format!(
                        "incoming call: unknown export ID {export}"
                    )));
                }
            },
            MessageTarget::PromisedAnswer(pa) => match state.answers.get(pa.question_id) {
                Some(ans) if !ans.flags.contains(AnswerFlags::FINISH_RECEIVED) => {
                    if ans.flags.contains(AnswerFlags::RESULTS_READY) {
                        match (&ans.err, &ans.results) {
                            (Some(err), _) => Client::error(err.clone()),
                            (None, Some(results)) => results.client(&pa.transform),
                            (None, None) => Client::null(),
                        }
                    } else {
                        Client::pipeline(Arc::clone(&ans.promise), pa.transform)
                    }
                }
                _ => {
                    return Err(Error::protocol(format!(
                        "incoming call: use of unknown or finished answer ID {} for promised answer target",
                        pa.question_id
                    )));
                }
            },
        };
        let Some(task) = self.tasks.try_start() else {
            // Shutting down; nobody will read the results.
            drop(state);
            return Ok(());
        };
        let token = self.bg_cancel.child();
        let promise = Arc::new(Promise::new(Caller::Hold));
        state.answers.entries.insert(
            id,
            AnswerEntry::new(Arc::clone(&promise), Some(token.clone()), Some(task)),
        );
        drop(state);
        for err in &anomalies {
            self.report(err);
        }

        let method = Method::new(call.interface_id, call.method_id);
        tracing::trace!(conn = self.key.0, answer = id, %method, "call received");
        let callee = target.send(Request {
            method,
            params,
            cancel: Some(token),
        });
        promise.set_caller(Caller::Forward(callee.clone()));
        let conn = Arc::downgrade(self);
        callee.on_resolved(move |result| {
            if let Some(conn) = conn.upgrade() {
                match result {
                    Ok(payload) => conn.send_return(id, payload.clone()),
                    Err(err) => conn.send_exception(id, err.clone()),
                }
            }
        });
        Ok(())
    }

    /// Sends successful results for answer `id`.
    fn send_return(self: &Arc<Self>, id: AnswerId, payload: Payload) {
        let exported = {
            let mut state = self.state.lock();
            match state.answers.get(id) {
                Some(ans) if !ans.flags.contains(AnswerFlags::RESULTS_READY) => {}
                _ => return,
            }
            self.send_payload(&mut state, &payload)
        };
        let (wire, refs) = match exported {
            Ok(exported) => exported,
            Err(err) => {
                self.send_exception(id, err.clone().with_context("export results"));
                if err.is_fatal() {
                    self.fail(err);
                }
                return;
            }
        };
        let promise = {
            let mut state = self.state.lock();
            let Some(ans) = state.answers.entries.get_mut(&id) else {
                return;
            };
            ans.flags.insert(AnswerFlags::RESULTS_READY);
            ans.results = Some(payload.clone());
            ans.export_refs = refs;
            ResolveWith::new(ans)
        };
        promise.resolve(Ok(payload));
        self.finish_return(id, ReturnBody::Results(wire));
    }

    /// Sends an exception for answer `id`.
    fn send_exception(self: &Arc<Self>, id: AnswerId, err: Error) {
        let promise = {
            let mut state = self.state.lock();
            let Some(ans) = state.answers.entries.get_mut(&id) else {
                return;
            };
            if ans.flags.contains(AnswerFlags::RESULTS_READY) {
                return;
            }
            ans.flags.insert(AnswerFlags::RESULTS_READY);
            ans.err = Some(err.clone());
            ResolveWith::new(ans)
        };
        let body = ReturnBody::Exception((&err).into());
        promise.resolve(Err(err));
        self.finish_return(id, body);
    }

    /// Queues the `Return`, ends the answer's task, and destroys the entry if
    /// the peer already sent `Finish`.
    fn finish_return(self: &Arc<Self>, id: AnswerId, body: ReturnBody) {
        let (task, destroyed) = {
            let mut state = self.state.lock();
            let Some(ans) = state.answers.entries.get_mut(&id) else {
                return;
            };
            ans.flags.insert(AnswerFlags::RETURN_SENT);
            let task = ans.task.take();
            let done = ans.flags.is_done();
            self.send_reporting(
                Message::Return(Return {
                    answer_id: id,
                    release_param_caps: false,
                    body,
                }),
                "send return",
            );
            let destroyed = if done {
                self.destroy_answer(&mut state, id)
            } else {
                Ok(None)
            };
            (task, destroyed)
        };
        drop(task);
        if let Err(err) = destroyed {
            self.fail(err.with_context("send return: release result caps"));
        }
    }

    pub(super) fn handle_finish(self: &Arc<Self>, fin: Finish) -> Result<()> {
        let id = fin.question_id;
        let (token, destroyed) = {
            let mut state = self.state.lock();
            let Some(ans) = state.answers.entries.get_mut(&id) else {
                return Err(Error::protocol(format!(
                    "incoming finish: unknown answer ID {id}"
                )));
            };
            if ans.flags.contains(AnswerFlags::FINISH_RECEIVED) {
                return Err(Error::protocol(format!(
                    "incoming finish: answer ID {id} already received finish"
                )));
            }
            ans.flags.insert(AnswerFlags::FINISH_RECEIVED);
            if fin.release_result_caps {
                ans.flags.insert(AnswerFlags::RELEASE_RESULT_CAPS);
            }
            let token = ans.cancel.take();
            let destroyed = if ans.flags.contains(AnswerFlags::RETURN_SENT) {
                self.destroy_answer(&mut state, id)
            } else {
                Ok(None)
            };
            (token, destroyed)
        };
        if let Some(token) = token {
            token.cancel(CancelReason::peer_finished());
        }
        destroyed
            .map(drop)
            .map_err(|err| err.with_context("incoming finish: release result caps"))
    }

    /// Removes answer `id`, releasing its result exports if the peer asked.
    fn destroy_answer(
        &self,
        state: &mut super::ConnState,
        id: AnswerId,
    ) -> Result<Option<Destroyed>> {
        let Some(entry) = state.answers.entries.remove(&id) else {
            return Ok(None);
        };
        let mut released = Vec::new();
        if entry.flags.contains(AnswerFlags::RELEASE_RESULT_CAPS) {
            for (&export, &count) in &entry.export_refs {
                if let Some(client) = state.exports.release(self.key, export, count)? {
                    released.push(client);
                }
            }
        }
        Ok(Some(Destroyed {
            _entry: entry,
            _released: released,
        }))
    }
}

/// The answer's promise plus whether the peer gave up before the return.
struct ResolveWith {
    promise: Arc<Promise>,
    finished: bool,
}

impl ResolveWith {
    fn new(ans: &AnswerEntry) -> Self {
        Self {
            promise: Arc::clone(&ans.promise),
            finished: ans.flags.contains(AnswerFlags::FINISH_RECEIVED),
        }
    }

    fn resolve(&self, result: Result<Payload>) {
        if self.finished {
            self.promise
                .reject(Error::failed("received finish before return"));
        } else {
            self.promise.resolve(result);
        }
    }
}
