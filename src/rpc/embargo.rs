//! Embargoes on capabilities that resolved back to this vat.
//!
//! When a question returns a capability that is local to us, and we already
//! pipelined calls on it through the peer, new calls must not overtake those
//! in-flight ones. The capability is replaced by an embargoed stand-in that
//! holds calls, and a `Disembargo(SenderLoopback)` is sent behind the
//! pipelined calls. The peer reflects it back as `ReceiverLoopback` once
//! everything ahead of it was delivered, and the held calls are released to
//! the real target in order.

use super::ConnShared;
use crate::capability::{Answer, Caller, Client, ClientKind, Promise, Request};
use crate::error::{Error, Result};
use crate::idgen::IdGen;
use crate::message::{
    Disembargo, DisembargoContext, EmbargoId, Message, MessageTarget,
};
use crate::value::Payload;
use std::sync::Arc;

/// Client variant holding calls until a disembargo round trip completes.
pub(crate) struct Embargo {
    id: EmbargoId,
    promise: Arc<Promise>,
    target: Client,
}

impl Embargo {
    fn new(id: EmbargoId, target: Client) -> Self {
        Self {
            id,
            promise: Arc::new(Promise::new(Caller::Hold)),
            target,
        }
    }

    pub(crate) const fn id(&self) -> EmbargoId {
        self.id
    }

    pub(crate) fn send(&self, req: Request) -> Answer {
        self.promise.pipeline_send(&[], req)
    }

    /// Releases held calls to the target, in order.
    pub(crate) fn lift(&self) {
        self.promise
            .fulfill(Payload::capability(self.target.clone()));
    }

    pub(crate) fn lifted_target(&self) -> Option<Client> {
        self.promise.is_resolved().then(|| self.target.clone())
    }
}

pub(crate) struct EmbargoTable {
    entries: Vec<Option<Arc<Embargo>>>,
    ids: IdGen,
}

impl EmbargoTable {
    pub(crate) const fn new() -> Self {
        Self {
            entries: Vec::new(),
            ids: IdGen::new("embargo"),
        }
    }

    /// Replaces `slot` with an embargoed stand-in for it.
    pub(crate) fn place(&mut self, slot: &mut Client) -> Result<EmbargoId> {
        let id = self.ids.next()?;
        let target = std::mem::take(slot);
        let embargo = Arc::new(Embargo::new(id, target));
        *slot = Client::from_kind(ClientKind::Embargoed(Arc::clone(&embargo)));
        let idx = id as usize;
        if self.entries.len() <= idx {
            self.entries.resize_with(idx + 1, || None);
        }
        self.entries[idx] = Some(embargo);
        Ok(id)
    }

    /// Removes an embargo and frees its id.
    fn remove(&mut self, id: EmbargoId) -> Option<Arc<Embargo>> {
        let embargo = self.entries.get_mut(id as usize).and_then(Option::take);
        if embargo.is_some() {
            self.ids.remove(id);
        }
        embargo
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub(crate) fn take_all(&mut self) -> Vec<Arc<Embargo>> {
        self.ids = IdGen::new("embargo");
        std::mem::take(&mut self.entries)
            .into_iter()
            .flatten()
            .collect()
    }
}

impl ConnShared {
    pub(super) fn handle_disembargo(self: &Arc<Self>, dis: Disembargo) -> Result<()> {
        match dis.context {
            DisembargoContext::ReceiverLoopback(id) => {
                let embargo = self.state.lock().embargoes.remove(id).ok_or_else(|| {
                    Error::protocol(format!(
                        "incoming disembargo: received sender loopback for unknown ID {id}"
                    ))
                })?;
                tracing::trace!(conn = self.key.0, embargo = embargo.id(), "embargo lifted");
                embargo.lift();
                Ok(())
            }
            DisembargoContext::SenderLoopback(id) => {
                let target = {
                    let state = self.state.lock();
                    let MessageTarget::PromisedAnswer(pa) = &dis.target else {
                        return Err(Error::protocol(
                            "incoming disembargo: sender loopback: target is not a promised answer",
                        ));
                    };
                    let qid = pa.question_id;
                    let ans = state.answers.get(qid).ok_or_else(|| {
                        Error::protocol(format!("incoming disembargo: unknown answer ID {qid}"))
                    })?;
                    if !ans
                        .flags()
                        .contains(super::answer::AnswerFlags::RETURN_SENT)
                    {
                        return Err(Error::protocol(format!(
                            "incoming disembargo: answer ID {qid} has not sent return"
                        )));
                    }
                    if ans.error().is_some() {
                        return Err(Error::protocol(format!(
                            "incoming disembargo: answer ID {qid} returned exception"
                        )));
                    }
                    let client = ans
                        .results()
                        .and_then(|p| p.cap_index(&pa.transform).map(|i| p.caps[i].resolved()));
                    match client.as_ref().and_then(Client::kind) {
                        Some(ClientKind::Import(import)) if import.key() == self.key => import.id(),
                        _ => {
                            return Err(Error::protocol(
                                "incoming disembargo: sender loopback requested on a capability that is not an import",
                            ));
                        }
                    }
                };
                self.send_reporting(
                    Message::Disembargo(Disembargo {
                        target: MessageTarget::ImportedCap(target),
                        context: DisembargoContext::ReceiverLoopback(id),
                    }),
                    "incoming disembargo: send receiver loopback",
                );
                Ok(())
            }
            DisembargoContext::Accept | DisembargoContext::Provide(_) => {
                self.report(&Error::unimplemented(
                    "incoming disembargo: three-party contexts are not implemented",
                ));
                self.send_reporting(
                    Message::Unimplemented(Box::new(Message::Disembargo(dis))),
                    "incoming disembargo: send unimplemented",
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CallContext, Method, Server};
    use crate::test_utils::init_test_logging;
    use crate::value::Value;
    use parking_lot::Mutex;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    struct Log(Arc<Mutex<Vec<i64>>>);

    impl Server for Log {
        fn dispatch(&self, call: CallContext) -> Result<Payload> {
            self.0.lock().push(call.params().content.as_int().unwrap_or(-1));
            Ok(Payload::default())
        }
    }

    #[test]
    fn embargo_holds_calls_until_lifted() {
        init_test("embargo_holds_calls_until_lifted");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut slot = Client::new(Log(Arc::clone(&seen)));
        let target = slot.clone();
        let mut table = EmbargoTable::new();
        let id = table.place(&mut slot).unwrap();
        assert_eq!(slot.brand(), "embargoed");
        assert_eq!(table.len(), 1);

        let held: Vec<_> = (0..3)
            .map(|i| slot.call(Method::new(2, 0), Payload::new(Value::Int(i))))
            .collect();
        assert!(held.iter().all(|a| !a.is_resolved()));
        assert!(seen.lock().is_empty());

        let embargo = table.remove(id).unwrap();
        assert_eq!(table.len(), 0);
        embargo.lift();
        let after = slot.call(Method::new(2, 0), Payload::new(Value::Int(3)));
        for a in held.iter().chain(std::iter::once(&after)) {
            a.wait().unwrap();
        }
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3]);
        assert!(slot.resolved().same_as(&target));
        crate::test_complete!("embargo_holds_calls_until_lifted");
    }
}
