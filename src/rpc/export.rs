//! Capabilities crossing the wire.
//!
//! Outbound, every capability in a payload becomes a [`CapDescriptor`]: a
//! reference back to something the peer owns when possible, otherwise a new
//! or reused export. Inbound, descriptors become clients: imports for the
//! peer's capabilities, table lookups for our own.
//!
//! Each descriptor naming an export counts one wire reference. The export
//! lives until the peer's `Release` messages sum to that count.

use super::answer::AnswerFlags;
use super::{ConnKey, ConnShared, ConnState};
use crate::capability::{Client, ClientKind};
use crate::error::{Error, Result};
use crate::idgen::IdGen;
use crate::message::{CapDescriptor, ExportId, PromisedAnswer, Release, WirePayload};
use crate::value::Payload;
use std::collections::HashMap;
use std::sync::Arc;

struct Export {
    client: Client,
    wire_refs: u32,
}

pub(crate) struct ExportTable {
    entries: Vec<Option<Export>>,
    ids: IdGen,
}

impl ExportTable {
    pub(crate) const fn new() -> Self {
        Self {
            entries: Vec::new(),
            ids: IdGen::new("export"),
        }
    }

    pub(crate) fn get(&self, id: ExportId) -> Option<&Client> {
        self.entries
            .get(id as usize)
            .and_then(Option::as_ref)
            .map(|e| &e.client)
    }

    /// Exports `client`, or adds a wire reference if it is already exported
    /// on this connection.
    pub(crate) fn export(&mut self, conn: ConnKey, client: &Client) -> Result<ExportId> {
        if let Some(id) = client.export_id(conn) {
            if let Some(Some(entry)) = self.entries.get_mut(id as usize) {
                entry.wire_refs += 1;
                return Ok(id);
            }
        }
        let id = self.ids.next()?;
        let idx = id as usize;
        if self.entries.len() <= idx {
            self.entries.resize_with(idx + 1, || None);
        }
        self.entries[idx] = Some(Export {
            client: client.clone(),
            wire_refs: 1,
        });
        client.set_export_id(conn, id);
        Ok(id)
    }

    /// Drops `count` wire references. Returns the client once none remain.
    pub(crate) fn release(
        &mut self,
        conn: ConnKey,
        id: ExportId,
        count: u32,
    ) -> Result<Option<Client>> {
        let Some(entry) = self.entries.get_mut(id as usize).and_then(Option::as_mut) else {
            return Err(Error::protocol(format!("unknown export ID {id}")));
        };
        if count > entry.wire_refs {
            return Err(Error::protocol(format!(
                "export ID {id} released too many references"
            )));
        }
        entry.wire_refs -= count;
        if entry.wire_refs > 0 {
            return Ok(None);
        }
        let client = self.entries[id as usize].take().map(|e| e.client);
        self.ids.remove(id);
        if let Some(client) = &client {
            client.clear_export_id(conn);
        }
        Ok(client)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// Empties the table, returning the exported clients.
    pub(crate) fn take_all(&mut self) -> Vec<Client> {
        self.ids = IdGen::new("export");
        std::mem::take(&mut self.entries)
            .into_iter()
            .flatten()
            .map(|e| e.client)
            .collect()
    }
}

/// An inbound payload with live clients.
pub(crate) struct Received {
    pub(crate) payload: Payload,
    /// Per capability: true if calls on it would not cross this connection.
    pub(crate) locals: Vec<bool>,
}

impl ConnShared {
    /// Builds the descriptor for one outbound capability.
    fn send_cap(&self, state: &mut ConnState, client: &Client) -> Result<CapDescriptor> {
        let Some(kind) = client.kind() else {
            return Ok(CapDescriptor::None);
        };
        match kind {
            ClientKind::Import(import) if import.key() == self.key => {
                Ok(CapDescriptor::ReceiverHosted(import.id()))
            }
            ClientKind::Pipeline { promise, transform } => {
                if promise.is_resolved() {
                    return self.send_cap(state, &client.resolved());
                }
                if let Some(q) = promise.question() {
                    if q.key == self.key && state.questions.is_open(q.id, promise) {
                        return Ok(CapDescriptor::ReceiverAnswer(PromisedAnswer {
                            question_id: q.id,
                            transform: transform.clone(),
                        }));
                    }
                }
                Ok(CapDescriptor::SenderPromise(
                    state.exports.export(self.key, client)?,
                ))
            }
            ClientKind::Embargoed(embargo) => match embargo.lifted_target() {
                Some(target) => self.send_cap(state, &target),
                None => Ok(CapDescriptor::SenderPromise(
                    state.exports.export(self.key, client)?,
                )),
            },
            _ => Ok(CapDescriptor::SenderHosted(
                state.exports.export(self.key, client)?,
            )),
        }
    }

    /// Converts an outbound payload. Also returns the wire references added
    /// per export id.
    pub(crate) fn send_payload(
        &self,
        state: &mut ConnState,
        payload: &Payload,
    ) -> Result<(WirePayload, HashMap<ExportId, u32>)> {
        let mut refs = HashMap::new();
        let mut cap_table = Vec::with_capacity(payload.caps.len());
        for client in &payload.caps {
            let desc = self.send_cap(state, client)?;
            if let CapDescriptor::SenderHosted(id) | CapDescriptor::SenderPromise(id) = desc {
                *refs.entry(id).or_insert(0) += 1;
            }
            cap_table.push(desc);
        }
        Ok((
            WirePayload {
                content: payload.content.clone(),
                cap_table,
            },
            refs,
        ))
    }

    /// Turns one inbound descriptor into a client.
    fn recv_cap(
        self: &Arc<Self>,
        state: &mut ConnState,
        desc: CapDescriptor,
        anomalies: &mut Vec<Error>,
    ) -> Result<Client> {
        match desc {
            CapDescriptor::None => Ok(Client::null()),
            CapDescriptor::SenderHosted(id) | CapDescriptor::SenderPromise(id) => {
                Ok(state.imports.add(self, id))
            }
            CapDescriptor::ReceiverHosted(id) => state
                .exports
                .get(id)
                .cloned()
                .ok_or_else(|| Error::protocol(format!("receive capability: invalid export {id}"))),
            CapDescriptor::ReceiverAnswer(pa) => {
                let Some(ans) = state.answers.get(pa.question_id) else {
                    return Err(Error::protocol(format!(
                        "receive capability: no such question id: {}",
                        pa.question_id
                    )));
                };
                if !ans.flags().contains(AnswerFlags::RESULTS_READY) {
                    return Ok(Client::pipeline(Arc::clone(ans.promise()), pa.transform));
                }
                Ok(match (ans.error(), ans.results()) {
                    (Some(err), _) => Client::error(err.clone()),
                    (None, Some(results)) => results.client(&pa.transform),
                    (None, None) => Client::null(),
                })
            }
            CapDescriptor::ThirdPartyHosted(_) => {
                let err = Error::unimplemented("third-party capabilities are not supported");
                anomalies.push(err.clone().with_context("receive capability"));
                Ok(Client::error(err))
            }
        }
    }

    /// Converts an inbound payload. Non-fatal problems with individual
    /// capabilities go to `anomalies` for reporting once the lock is released.
    pub(crate) fn recv_payload(
        self: &Arc<Self>,
        state: &mut ConnState,
        wire: WirePayload,
        anomalies: &mut Vec<Error>,
    ) -> Result<Received> {
        let mut caps = Vec::with_capacity(wire.cap_table.len());
        let mut locals = Vec::with_capacity(wire.cap_table.len());
        for (i, desc) in wire.cap_table.into_iter().enumerate() {
            let client = self
                .recv_cap(state, desc, anomalies)
                .map_err(|err| err.with_context(format!("read payload: capability {i}")))?;
            locals.push(self.is_local(&client));
            caps.push(client);
        }
        Ok(Received {
            payload: Payload::with_caps(wire.content, caps),
            locals,
        })
    }

    /// Returns true if calls on `client` would not go over this connection.
    fn is_local(&self, client: &Client) -> bool {
        let client = client.resolved();
        match client.kind() {
            None | Some(ClientKind::Error(_)) => false,
            Some(ClientKind::Import(import)) => import.key() != self.key,
            Some(ClientKind::Pipeline { promise, .. }) => {
                promise.question().is_none_or(|q| q.key != self.key)
            }
            Some(_) => true,
        }
    }

    pub(super) fn handle_release(&self, rel: Release) -> Result<()> {
        let released = {
            let mut state = self.state.lock();
            state
                .exports
                .release(self.key, rel.id, rel.reference_count)
                .map_err(|err| err.with_context("incoming release"))?
        };
        drop(released);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CallContext, Server};
    use crate::test_utils::init_test_logging;
    use proptest::prelude::*;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    struct Nop;

    impl Server for Nop {
        fn dispatch(&self, call: CallContext) -> Result<Payload> {
            Ok(call.into_params())
        }
    }

    #[test]
    fn export_reuses_id_and_counts_refs() {
        init_test("export_reuses_id_and_counts_refs");
        let key = ConnKey::for_test(10);
        let mut table = ExportTable::new();
        let client = Client::new(Nop);
        let first = table.export(key, &client).unwrap();
        let again = table.export(key, &client.clone()).unwrap();
        assert_eq!(first, again);
        assert_eq!(table.len(), 1);

        assert!(table.release(key, first, 1).unwrap().is_none());
        let gone = table.release(key, first, 1).unwrap();
        assert!(gone.is_some_and(|c| c.same_as(&client)));
        assert_eq!(client.export_id(key), None);
        assert_eq!(table.len(), 0);
        crate::test_complete!("export_reuses_id_and_counts_refs");
    }

    #[test]
    fn over_release_and_unknown_id_are_protocol_errors() {
        init_test("over_release_and_unknown_id_are_protocol_errors");
        let key = ConnKey::for_test(11);
        let mut table = ExportTable::new();
        let id = table.export(key, &Client::new(Nop)).unwrap();
        let err = table.release(key, id, 2).unwrap_err();
        assert!(err.is_protocol());
        assert!(err.to_string().contains("released too many references"));
        let err = table.release(key, id + 7, 1).unwrap_err();
        assert!(err.to_string().contains("unknown export ID"));
        crate::test_complete!("over_release_and_unknown_id_are_protocol_errors");
    }

    proptest! {
        #[test]
        fn export_removed_exactly_when_releases_sum_to_refs(
            refs in 1u32..20,
            splits in proptest::collection::vec(1u32..5, 1..10),
        ) {
            let key = ConnKey::for_test(12);
            let mut table = ExportTable::new();
            let client = Client::new(Nop);
            let mut id = 0;
            for _ in 0..refs {
                id = table.export(key, &client).unwrap();
            }
            let mut remaining = refs;
            for count in splits {
                let count = count.min(remaining);
                if count == 0 {
                    break;
                }
                let released = table.release(key, id, count).unwrap();
                remaining -= count;
                prop_assert_eq!(released.is_some(), remaining == 0);
            }
            prop_assert_eq!(table.len(), usize::from(remaining > 0));
        }
    }
}
