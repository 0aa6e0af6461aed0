//! Outbound message queue.
//!
//! Producers (handlers, capability proxies, drop glue) push without blocking,
//! usually with the connection lock held. The send loop is the only consumer.
//!
//! Import releases travel through the same queue so that a `Release` is never
//! reordered ahead of calls issued through the import before it was dropped.

use crate::error::Result;
use crate::message::{ImportId, Message};
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};

/// Invoked with the outcome once a message has been handed to the transport,
/// or with an error if it never will be.
pub(crate) type SendCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// An item for the send loop.
pub(crate) enum Outbound {
    /// A fully built message.
    Message {
        msg: Message,
        on_sent: Option<SendCallback>,
    },
    /// The last local reference to an import proxy was dropped.
    ReleaseImport { id: ImportId, generation: u64 },
}

impl Outbound {
    /// Fails the item without sending it.
    pub(crate) fn abort(self) {
        if let Self::Message {
            on_sent: Some(cb), ..
        } = self
        {
            cb(Err(crate::error::Error::connection_closed()));
        }
    }
}

#[derive(Default)]
struct Gate {
    stopped: bool,
    closed: bool,
}

/// Multi-producer, single-consumer queue with a blocking receive.
#[derive(Default)]
pub(crate) struct SendQueue {
    items: SegQueue<Outbound>,
    gate: Mutex<Gate>,
    ready: Condvar,
}

impl SendQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enqueues an item. Hands it back if the queue was drained for
    /// shutdown.
    pub(crate) fn push(&self, item: Outbound) -> core::result::Result<(), Outbound> {
        let gate = self.gate.lock();
        if gate.closed {
            return Err(item);
        }
        self.items.push(item);
        drop(gate);
        self.ready.notify_one();
        Ok(())
    }

    /// Blocks for the next item. Returns `None` once stopped.
    pub(crate) fn recv(&self) -> Option<Outbound> {
        let mut gate = self.gate.lock();
        loop {
            if gate.stopped {
                return None;
            }
            if let Some(item) = self.items.pop() {
                return Some(item);
            }
            self.ready.wait(&mut gate);
        }
    }

    /// Makes the consumer return `None`. Queued items stay for [`drain`](Self::drain).
    pub(crate) fn stop(&self) {
        self.gate.lock().stopped = true;
        self.ready.notify_all();
    }

    /// Refuses further pushes and returns everything still queued.
    pub(crate) fn drain(&self) -> Vec<Outbound> {
        let mut gate = self.gate.lock();
        gate.stopped = true;
        gate.closed = true;
        drop(gate);
        self.ready.notify_all();
        std::iter::from_fn(|| self.items.pop()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}
