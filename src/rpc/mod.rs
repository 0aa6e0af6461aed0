//! The connection engine.
//!
//! A [`Conn`] owns the five per-connection tables behind one mutex and runs
//! two threads:
//!
//! - the receive loop, which dispatches inbound messages strictly in order
//!   and never blocks while handling one;
//! - the send loop, the only consumer of the outbound queue.
//!
//! # Tables
//!
//! | Table     | Keyed by      | Allocated by | Holds                           |
//! |-----------|---------------|--------------|---------------------------------|
//! | questions | `QuestionId`  | us           | calls we sent, awaiting results |
//! | answers   | `AnswerId`    | peer         | calls we are serving            |
//! | exports   | `ExportId`    | us           | local caps advertised to peer   |
//! | imports   | `ImportId`    | peer         | proxies for the peer's caps     |
//! | embargoes | `EmbargoId`   | us           | held calls awaiting a loopback  |
//!
//! # Locking
//!
//! The table lock is never held across transport I/O, application code, or
//! a wait. Work that must happen outside it (resolving promises, dropping
//! capabilities, cancelling tokens) is collected under the lock and done
//! after the guard is released.
//!
//! # Shutdown
//!
//! Entered once, from [`Conn::close`] or when a loop fails:
//!
//! 1. mark closing and refuse new background tasks
//! 2. cancel every in-flight answer
//! 3. wait for outstanding tasks
//! 4. abort everything still in the outbound queue
//! 5. release the bootstrap capability and all exports, lift all embargoes,
//!    release answer results, fail outstanding questions
//! 6. send `Abort` (best effort, bounded by the abort timeout)
//! 7. close the transport and signal [`Done`]

mod answer;
mod embargo;
mod export;
mod import;
mod question;
mod report;
mod sendq;
mod tasks;

pub(crate) use embargo::Embargo;
pub(crate) use import::ImportClient;
pub(crate) use question::QuestionRef;
pub use report::{ErrorReporter, LogReporter};

use crate::cancel::{CancelReason, CancelToken};
use crate::capability::Client;
use crate::error::{Error, Result};
use crate::message::{Exception, ImportId, Message};
use crate::transport::Transport;
use answer::AnswerTable;
use embargo::EmbargoTable;
use export::ExportTable;
use import::ImportTable;
use parking_lot::{Condvar, Mutex};
use question::QuestionTable;
use sendq::{Outbound, SendCallback, SendQueue};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tasks::{TaskGroup, TaskGuard};

/// Default bound on the best-effort `Abort` send during shutdown.
pub const DEFAULT_ABORT_TIMEOUT: Duration = Duration::from_millis(100);

/// Default prefix for connection thread names.
pub const DEFAULT_THREAD_NAME: &str = "vatlink";

static NEXT_CONN: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identity, used to tag exported clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnKey(u64);

impl ConnKey {
    fn next() -> Self {
        Self(NEXT_CONN.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) const fn for_test(raw: u64) -> Self {
        Self(u64::MAX - raw)
    }
}

/// Connection options.
///
/// ```
/// use std::time::Duration;
/// use vatlink::Options;
///
/// let opts = Options::new()
///     .with_abort_timeout(Duration::from_millis(50))
///     .with_thread_name("edge");
/// assert_eq!(opts.abort_timeout(), Duration::from_millis(50));
/// ```
#[derive(Clone)]
pub struct Options {
    bootstrap: Option<Client>,
    reporter: Arc<dyn ErrorReporter>,
    abort_timeout: Duration,
    thread_name: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            bootstrap: None,
            reporter: Arc::new(LogReporter),
            abort_timeout: DEFAULT_ABORT_TIMEOUT,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
        }
    }
}

impl Options {
    /// Defaults: no bootstrap capability, log reporter, 100ms abort timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Capability handed to the peer when it asks for our bootstrap.
    #[must_use]
    pub fn with_bootstrap(mut self, client: Client) -> Self {
        self.bootstrap = Some(client);
        self
    }

    /// Receiver for errors nobody else sees.
    #[must_use]
    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Bound on the best-effort `Abort` send during shutdown.
    #[must_use]
    pub const fn with_abort_timeout(mut self, timeout: Duration) -> Self {
        self.abort_timeout = timeout;
        self
    }

    /// Prefix for the connection's thread names.
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Configured abort timeout.
    #[must_use]
    pub const fn abort_timeout(&self) -> Duration {
        self.abort_timeout
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("bootstrap", &self.bootstrap)
            .field("abort_timeout", &self.abort_timeout)
            .field("thread_name", &self.thread_name)
            .finish_non_exhaustive()
    }
}

/// Snapshot of table sizes and queue depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnStats {
    /// Outstanding questions.
    pub questions: usize,
    /// Answers not yet retired.
    pub answers: usize,
    /// Live exports.
    pub exports: usize,
    /// Live imports.
    pub imports: usize,
    /// Unlifted embargoes.
    pub embargoes: usize,
    /// Messages waiting for the send loop.
    pub queued_sends: usize,
    /// Running background tasks, the send loop included.
    pub tasks: usize,
}

pub(crate) struct ConnState {
    closing: bool,
    bootstrap: Option<Client>,
    questions: QuestionTable,
    answers: AnswerTable,
    exports: ExportTable,
    imports: ImportTable,
    embargoes: EmbargoTable,
}

impl ConnState {
    fn new(bootstrap: Option<Client>) -> Self {
        Self {
            closing: false,
            bootstrap,
            questions: QuestionTable::new(),
            answers: AnswerTable::new(),
            exports: ExportTable::new(),
            imports: ImportTable::new(),
            embargoes: EmbargoTable::new(),
        }
    }
}

pub(crate) struct ConnShared {
    key: ConnKey,
    transport: Arc<dyn Transport>,
    reporter: Arc<dyn ErrorReporter>,
    abort_timeout: Duration,
    thread_name: String,
    /// Parent of every in-flight answer's token.
    bg_cancel: CancelToken,
    tasks: TaskGroup,
    sendq: SendQueue,
    state: Mutex<ConnState>,
    closed: Mutex<bool>,
    closed_cond: Condvar,
}

/// A connection to one peer vat.
///
/// Created with [`Conn::new`], which starts the receive and send loops. The
/// connection runs until [`close`](Conn::close) is called, the peer aborts,
/// or a fatal error occurs; [`done`](Conn::done) observes the end.
///
/// ```
/// use vatlink::{Conn, Options, transport::pipe};
///
/// let (a, b) = pipe();
/// let left = Conn::new(a, Options::new()).unwrap();
/// let right = Conn::new(b, Options::new()).unwrap();
/// left.close().unwrap();
/// right.done().wait();
/// ```
pub struct Conn {
    shared: Arc<ConnShared>,
}

/// Observes the end of a connection.
#[derive(Clone)]
pub struct Done {
    shared: Arc<ConnShared>,
}

impl Conn {
    /// Starts a connection over `transport`.
    pub fn new(transport: impl Transport, options: Options) -> Result<Self> {
        let Options {
            bootstrap,
            reporter,
            abort_timeout,
            thread_name,
        } = options;
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let shared = Arc::new(ConnShared {
            key: ConnKey::next(),
            transport,
            reporter,
            abort_timeout,
            thread_name,
            bg_cancel: CancelToken::new(),
            tasks: TaskGroup::new(),
            sendq: SendQueue::new(),
            state: Mutex::new(ConnState::new(bootstrap)),
            closed: Mutex::new(false),
            closed_cond: Condvar::new(),
        });

        let guard = shared
            .tasks
            .try_start()
            .ok_or_else(|| Error::failed("task group stopped before start"))?;
        let sender = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("{}-send", shared.thread_name))
            .spawn(move || {
                let result = {
                    let _guard = guard;
                    sender.send_loop()
                };
                sender.loop_exited("send", result);
            })
            .map_err(|err| Error::failed(format!("spawn send loop: {err}")))?;

        let receiver = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(format!("{}-recv", shared.thread_name))
            .spawn(move || {
                let result = receiver.recv_loop();
                receiver.loop_exited("receive", result);
            });
        if let Err(err) = spawned {
            shared.shutdown(None);
            return Err(Error::failed(format!("spawn receive loop: {err}")));
        }

        tracing::info!(conn = shared.key.0, "connection started");
        Ok(Self { shared })
    }

    /// Returns the peer's bootstrap capability.
    ///
    /// The result is a promise; calls made on it are pipelined until the
    /// peer answers.
    #[must_use]
    pub fn bootstrap(&self) -> Client {
        self.shared.bootstrap()
    }

    /// Sends an abort to the peer, shuts the connection down, and waits for
    /// it to finish closing.
    ///
    /// Returns an error if the connection was already closing, or if the
    /// transport failed to close.
    pub fn close(&self) -> Result<()> {
        match self
            .shared
            .shutdown(Some(Error::failed("connection closed")))
        {
            Some(result) => result,
            None => {
                self.done().wait();
                Err(Error::connection_closed())
            }
        }
    }

    /// Handle that observes shutdown.
    #[must_use]
    pub fn done(&self) -> Done {
        Done {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Current table sizes.
    #[must_use]
    pub fn stats(&self) -> ConnStats {
        let state = self.shared.state.lock();
        ConnStats {
            questions: state.questions.len(),
            answers: state.answers.len(),
            exports: state.exports.len(),
            imports: state.imports.len(),
            embargoes: state.embargoes.len(),
            queued_sends: self.shared.sendq.len(),
            tasks: self.shared.tasks.running(),
        }
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("key", &self.shared.key.0)
            .field("closed", &self.done().is_closed())
            .finish()
    }
}

impl Done {
    /// Blocks until the connection has closed.
    pub fn wait(&self) {
        let mut closed = self.shared.closed.lock();
        while !*closed {
            self.shared.closed_cond.wait(&mut closed);
        }
    }

    /// Blocks up to `timeout`. Returns true if the connection closed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut closed = self.shared.closed.lock();
        self.shared
            .closed_cond
            .wait_while_for(&mut closed, |closed| !*closed, timeout);
        *closed
    }

    /// Returns true once the connection has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.shared.closed.lock()
    }
}

impl ConnShared {
    fn is_closing(&self) -> bool {
        self.state.lock().closing
    }

    fn report(&self, err: &Error) {
        self.reporter.report_error(err);
    }

    /// Queues a message for the send loop.
    ///
    /// After shutdown has drained the queue, the message and its callback
    /// are dropped.
    fn send(&self, msg: Message, on_sent: Option<SendCallback>) {
        if let Err(item) = self.sendq.push(Outbound::Message { msg, on_sent }) {
            tracing::trace!(conn = self.key.0, "dropping message queued after shutdown");
            drop(item);
        }
    }

    /// Queues a message whose send failure is only worth reporting.
    fn send_reporting(self: &Arc<Self>, msg: Message, what: &'static str) {
        let conn = Arc::downgrade(self);
        self.send(
            msg,
            Some(Box::new(move |result| {
                if let (Err(err), Some(conn)) = (result, conn.upgrade()) {
                    conn.report(&err.with_context(what));
                }
            })),
        );
    }

    fn queue_import_release(&self, id: ImportId, generation: u64) {
        // Refused only once shutdown has dropped the import table.
        let _ = self
            .sendq
            .push(Outbound::ReleaseImport { id, generation });
    }

    /// Runs `job` on its own thread while holding `guard`.
    fn spawn_task(&self, what: &str, guard: TaskGuard, job: impl FnOnce() + Send + 'static) {
        let slot = Arc::new(Mutex::new(Some(move || {
            let _guard = guard;
            job();
        })));
        let theirs = Arc::clone(&slot);
        let spawned = thread::Builder::new()
            .name(format!("{}-{what}", self.thread_name))
            .spawn(move || {
                let job = theirs.lock().take();
                if let Some(job) = job {
                    job();
                }
            });
        if let Err(err) = spawned {
            tracing::warn!(conn = self.key.0, error = %err, "running {what} task inline");
            let job = slot.lock().take();
            if let Some(job) = job {
                job();
            }
        }
    }

    /// Shuts down after a fatal error found outside the receive loop.
    ///
    /// Shutdown waits for background tasks, and the caller may be one, so it
    /// runs on a fresh thread.
    fn fail(self: &Arc<Self>, err: Error) {
        self.report(&err);
        let conn = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{}-abort", self.thread_name))
            .spawn(move || {
                if let Some(Err(close_err)) = conn.shutdown(Some(err)) {
                    conn.report(&close_err);
                }
            });
        if let Err(spawn_err) = spawned {
            tracing::error!(conn = self.key.0, error = %spawn_err, "cannot spawn shutdown");
        }
    }

    fn recv_loop(self: &Arc<Self>) -> Result<()> {
        loop {
            let msg = match self.transport.recv_message() {
                Ok(msg) => msg,
                Err(_) if self.is_closing() => return Ok(()),
                Err(err) if err.is_malformed() => {
                    return Err(
                        Error::protocol(format!("malformed message: {err}")).with_context("receive")
                    );
                }
                Err(err) => return Err(Error::from(err).with_context("receive")),
            };
            if self.is_closing() {
                return Ok(());
            }
            tracing::debug!(conn = self.key.0, kind = msg.which(), "dispatch");
            match msg {
                // Echoes are not answered, to avoid a feedback loop.
                Message::Unimplemented(_) => {}
                Message::Abort(exc) => {
                    self.report(&Error::from_exception(
                        exc.kind,
                        format!("remote abort: {}", exc.reason),
                    ));
                    return Ok(());
                }
                Message::Bootstrap(boot) => self.handle_bootstrap(boot)?,
                Message::Call(call) => self.handle_call(call)?,
                Message::Return(ret) => self.handle_return(ret)?,
                Message::Finish(fin) => self.handle_finish(fin)?,
                Message::Release(rel) => self.handle_release(rel)?,
                Message::Disembargo(dis) => self.handle_disembargo(dis)?,
                Message::Unknown(code) => {
                    self.report(&Error::unimplemented(format!(
                        "unknown message type {code} from remote"
                    )));
                    self.send(Message::Unimplemented(Box::new(Message::Unknown(code))), None);
                }
            }
        }
    }

    fn send_loop(&self) -> Result<()> {
        while let Some(item) = self.sendq.recv() {
            match item {
                Outbound::Message { msg, on_sent } => {
                    tracing::trace!(conn = self.key.0, kind = msg.which(), "send");
                    let result = self.transport.send_message(msg).map_err(Error::from);
                    let failure = result.as_ref().err().cloned();
                    if let Some(cb) = on_sent {
                        cb(result);
                    }
                    if let Some(err) = failure {
                        return Err(err.with_context("send message"));
                    }
                }
                Outbound::ReleaseImport { id, generation } => self.release_import(id, generation),
            }
        }
        Ok(())
    }

    fn loop_exited(self: &Arc<Self>, which: &'static str, result: Result<()>) {
        match result {
            Ok(()) => {
                tracing::debug!(conn = self.key.0, "{which} loop finished");
                self.shutdown(None);
            }
            Err(_) if self.is_closing() => {}
            Err(err) => {
                tracing::debug!(conn = self.key.0, error = %err, "{which} loop failed");
                self.report(&err);
                // A broken transport cannot carry an abort.
                let abort = (!err.is_transport()).then_some(err);
                if let Some(Err(close_err)) = self.shutdown(abort) {
                    self.report(&close_err);
                }
            }
        }
    }

    /// Runs the shutdown sequence. Returns `None` if it already ran.
    fn shutdown(self: &Arc<Self>, abort: Option<Error>) -> Option<Result<()>> {
        {
            let mut state = self.state.lock();
            if state.closing {
                return None;
            }
            state.closing = true;
        }
        tracing::debug!(conn = self.key.0, abort = abort.is_some(), "shutting down");

        self.tasks.stop();
        // Answer tokens are children of the background token.
        self.bg_cancel.cancel(CancelReason::shutdown());
        self.sendq.stop();
        self.tasks.wait();
        for item in self.sendq.drain() {
            item.abort();
        }

        let (bootstrap, exports, embargoes, answers, questions) = {
            let mut state = self.state.lock();
            state.imports.clear();
            (
                state.bootstrap.take(),
                state.exports.take_all(),
                state.embargoes.take_all(),
                state.answers.take_all(),
                state.questions.take_all(),
            )
        };
        drop(bootstrap);
        for client in exports {
            client.clear_export_id(self.key);
        }
        for embargo in embargoes {
            embargo.lift();
        }
        drop(answers);
        for question in questions {
            question.reject(Error::connection_closed());
        }

        if let Some(err) = abort {
            self.send_abort(&err);
        }
        let result = self
            .transport
            .close()
            .map_err(|err| Error::from(err).with_context("close transport"));

        *self.closed.lock() = true;
        self.closed_cond.notify_all();
        tracing::info!(conn = self.key.0, "connection closed");
        Some(result)
    }

    /// Sends `Abort`, giving up after the abort timeout.
    fn send_abort(&self, err: &Error) {
        let msg = Message::Abort(Exception::from(err));
        let transport = Arc::clone(&self.transport);
        let sent = Arc::new((Mutex::new(false), Condvar::new()));
        let flag = Arc::clone(&sent);
        let spawned = thread::Builder::new()
            .name(format!("{}-abort", self.thread_name))
            .spawn(move || {
                let _ = transport.send_message(msg);
                *flag.0.lock() = true;
                flag.1.notify_all();
            });
        if spawned.is_err() {
            return;
        }
        let mut done = sent.0.lock();
        let timed_out = sent
            .1
            .wait_while_for(&mut done, |done| !*done, self.abort_timeout)
            .timed_out();
        if timed_out {
            tracing::debug!(conn = self.key.0, "abort send timed out");
        }
    }
}
