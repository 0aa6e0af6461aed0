//! Application objects and their call mailbox.
//!
//! Each local capability owns a mailbox. Calls are dispatched one at a time,
//! in arrival order, on a worker thread that exists only while the mailbox is
//! non-empty.

use super::promise::{Caller, Promise};
use super::{Answer, Method, Request};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::value::Payload;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread;

/// An object that handles method calls.
///
/// `dispatch` runs on a mailbox thread, never concurrently with another
/// `dispatch` on the same object.
pub trait Server: Send + Sync + 'static {
    /// Handles one call.
    fn dispatch(&self, call: CallContext) -> Result<Payload>;

    /// Called once after the last capability reference is dropped.
    fn shutdown(&self) {}
}

/// One call delivered to a [`Server`].
#[derive(Debug)]
pub struct CallContext {
    method: Method,
    params: Payload,
    cancel: CancelToken,
}

impl CallContext {
    /// Method being invoked.
    #[must_use]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Call parameters.
    #[must_use]
    pub const fn params(&self) -> &Payload {
        &self.params
    }

    /// Takes ownership of the parameters.
    #[must_use]
    pub fn into_params(self) -> Payload {
        self.params
    }

    /// Fires when the caller no longer wants the result.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Returns true once the caller gave up on the call.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Default)]
struct Mailbox {
    queue: VecDeque<(CallContext, Arc<Promise>)>,
    running: bool,
}

pub(crate) struct LocalServer {
    server: Arc<dyn Server>,
    mailbox: Mutex<Mailbox>,
}

impl LocalServer {
    pub(crate) fn new(server: Arc<dyn Server>) -> Self {
        Self {
            server,
            mailbox: Mutex::new(Mailbox::default()),
        }
    }

    pub(crate) fn enqueue(self: &Arc<Self>, req: Request) -> Answer {
        let promise = Arc::new(Promise::new(Caller::Hold));
        let call = CallContext {
            method: req.method,
            params: req.params,
            cancel: req.cancel.unwrap_or_default(),
        };
        let mut mailbox = self.mailbox.lock();
        mailbox.queue.push_back((call, Arc::clone(&promise)));
        if !mailbox.running {
            mailbox.running = true;
            drop(mailbox);
            let me = Arc::clone(self);
            let spawned = thread::Builder::new()
                .name("vatlink-server".into())
                .spawn(move || me.run());
            if let Err(err) = spawned {
                tracing::error!(error = %err, "failed to spawn server worker");
                let failed: Vec<_> = {
                    let mut mailbox = self.mailbox.lock();
                    mailbox.running = false;
                    mailbox.queue.drain(..).collect()
                };
                for (_, p) in failed {
                    p.reject(Error::overloaded(format!("spawn server worker: {err}")));
                }
            }
        }
        Answer::from_promise(promise)
    }

    fn run(&self) {
        loop {
            let next = {
                let mut mailbox = self.mailbox.lock();
                let next = mailbox.queue.pop_front();
                if next.is_none() {
                    mailbox.running = false;
                }
                next
            };
            let Some((call, promise)) = next else {
                return;
            };
            let method = call.method;
            let result = if call.is_cancelled() {
                Err(Error::failed("call canceled"))
            } else {
                catch_unwind(AssertUnwindSafe(|| self.server.dispatch(call))).unwrap_or_else(
                    |_| {
                        tracing::error!(%method, "server method panicked");
                        Err(Error::failed("method panicked"))
                    },
                )
            };
            promise.resolve(result);
        }
    }

    pub(crate) fn release(&self) {
        self.server.shutdown();
    }
}
