//! In-memory transport pair.

use super::Transport;
use crate::error::TransportError;
use crate::message::Message;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Lane {
    queue: Mutex<LaneState>,
    ready: Condvar,
}

#[derive(Default)]
struct LaneState {
    messages: VecDeque<Message>,
    closed: bool,
}

impl Lane {
    fn push(&self, msg: Message) -> Result<(), TransportError> {
        let mut state = self.queue.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.messages.push_back(msg);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    fn pop(&self, timeout: Option<Duration>) -> Result<Option<Message>, TransportError> {
        let mut state = self.queue.lock();
        loop {
            if let Some(msg) = state.messages.pop_front() {
                return Ok(Some(msg));
            }
            if state.closed {
                return Err(TransportError::Closed);
            }
            match timeout {
                Some(t) => {
                    if self.ready.wait_for(&mut state, t).timed_out() {
                        return Ok(state.messages.pop_front());
                    }
                }
                None => self.ready.wait(&mut state),
            }
        }
    }

    fn close(&self) {
        self.queue.lock().closed = true;
        self.ready.notify_all();
    }
}

/// One end of an in-memory transport pair.
///
/// Closing either end closes both directions; queued messages remain
/// readable until drained.
pub struct PipeTransport {
    inbound: Arc<Lane>,
    outbound: Arc<Lane>,
}

/// Creates a connected pair of in-memory transports.
#[must_use]
pub fn pipe() -> (PipeTransport, PipeTransport) {
    let a_to_b = Arc::new(Lane::default());
    let b_to_a = Arc::new(Lane::default());
    (
        PipeTransport {
            inbound: Arc::clone(&b_to_a),
            outbound: Arc::clone(&a_to_b),
        },
        PipeTransport {
            inbound: a_to_b,
            outbound: b_to_a,
        },
    )
}

impl PipeTransport {
    /// Receives with a timeout. `Ok(None)` means nothing arrived in time.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>, TransportError> {
        self.inbound.pop(Some(timeout))
    }
}

impl Transport for PipeTransport {
    fn send_message(&self, msg: Message) -> Result<(), TransportError> {
        self.outbound.push(msg)
    }

    fn recv_message(&self) -> Result<Message, TransportError> {
        match self.inbound.pop(None)? {
            Some(msg) => Ok(msg),
            None => Err(TransportError::Closed),
        }
    }

    fn close(&self) -> Result<(), TransportError> {
        self.outbound.close();
        self.inbound.close();
        Ok(())
    }
}

impl std::fmt::Debug for PipeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeTransport")
            .field("pending_in", &self.inbound.queue.lock().messages.len())
            .finish()
    }
}
