//! Proxies for capabilities the peer exported to us.
//!
//! The table keeps a weak reference to the proxy and the number of
//! descriptors received for the id. When the last proxy reference drops, a
//! release is queued; the send loop then removes the entry and sends one
//! `Release` carrying the whole count.
//!
//! Each proxy carries a generation. If the peer sends the id again after the
//! proxy died but before its release was processed, a fresh generation is
//! created and inherits the count, and the stale release is ignored.

use super::{ConnKey, ConnShared};
use crate::capability::{Answer, Client, ClientKind, Request, WeakClient};
use crate::error::Error;
use crate::message::{ImportId, Message, MessageTarget, Release};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

struct ImportEntry {
    client: WeakClient,
    wire_refs: u32,
    generation: u64,
}

#[derive(Default)]
pub(crate) struct ImportTable {
    entries: HashMap<ImportId, ImportEntry>,
    next_generation: u64,
}

impl ImportTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the proxy for `id`, creating one if no live proxy exists.
    pub(crate) fn add(&mut self, conn: &Arc<ConnShared>, id: ImportId) -> Client {
        if let Some(entry) = self.entries.get_mut(&id) {
            if let Some(client) = entry.client.upgrade() {
                entry.wire_refs += 1;
                return client;
            }
        }
        let carried = self.entries.get(&id).map_or(0, |e| e.wire_refs);
        let generation = self.next_generation;
        self.next_generation += 1;
        let client = Client::from_kind(ClientKind::Import(ImportClient {
            conn: Arc::downgrade(conn),
            key: conn.key,
            id,
            generation,
        }));
        if let Some(weak) = client.downgrade() {
            self.entries.insert(
                id,
                ImportEntry {
                    client: weak,
                    wire_refs: carried + 1,
                    generation,
                },
            );
        }
        client
    }

    fn is_current(&self, id: ImportId, generation: u64) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|e| e.generation == generation)
    }

    /// Removes the entry if it still belongs to `generation`, returning the
    /// reference count to release.
    fn release(&mut self, id: ImportId, generation: u64) -> Option<u32> {
        if !self.is_current(id, generation) {
            return None;
        }
        self.entries.remove(&id).map(|e| e.wire_refs)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Client variant for an imported capability.
pub(crate) struct ImportClient {
    conn: Weak<ConnShared>,
    key: ConnKey,
    id: ImportId,
    generation: u64,
}

impl ImportClient {
    pub(crate) const fn id(&self) -> ImportId {
        self.id
    }

    pub(crate) const fn key(&self) -> ConnKey {
        self.key
    }

    pub(crate) fn send(&self, req: Request) -> Answer {
        let Some(conn) = self.conn.upgrade() else {
            return Answer::error(Error::connection_closed());
        };
        let state = conn.state.lock();
        if !state.closing && !state.imports.is_current(self.id, self.generation) {
            return Answer::error(Error::disconnected("send on closed import"));
        }
        conn.send_call_locked(state, MessageTarget::ImportedCap(self.id), req)
    }
}

impl Drop for ImportClient {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.queue_import_release(self.id, self.generation);
        }
    }
}

impl ConnShared {
    /// Send-loop side of an import release.
    pub(super) fn release_import(&self, id: ImportId, generation: u64) {
        let mut state = self.state.lock();
        if state.closing {
            return;
        }
        if let Some(count) = state.imports.release(id, generation) {
            tracing::trace!(conn = self.key.0, import = id, count, "import released");
            self.send(
                Message::Release(Release {
                    id,
                    reference_count: count,
                }),
                None,
            );
        }
    }
}
