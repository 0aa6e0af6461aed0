//! Capabilities and calls.
//!
//! A [`Client`] is a reference-counted handle to something that accepts
//! method calls. Cloning acquires a reference and dropping releases it; once
//! the last reference is gone the underlying object is never invoked again.
//!
//! Identity is an explicit variant, resolved by pattern matching:
//!
//! | Variant     | Meaning                                                    |
//! |-------------|------------------------------------------------------------|
//! | `Local`     | an application [`Server`] in this process                  |
//! | `Import`    | a proxy for a capability the peer exported                 |
//! | `Pipeline`  | a field of a call result that has not arrived yet          |
//! | `Embargoed` | a local target holding calls until a disembargo round trip |
//! | `Error`     | fails every call with a fixed error                        |
//!
//! The null capability is a `Client` with no variant at all.

mod promise;
mod server;

pub use promise::Answer;
pub(crate) use promise::{Caller, Promise};
pub use server::{CallContext, Server};
pub(crate) use server::LocalServer;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::message::ExportId;
use crate::rpc::{ConnKey, Embargo, ImportClient};
use crate::value::{Payload, PipelineOp};
use core::fmt;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::{Arc, Weak};

/// Identifies a method: interface id plus ordinal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Method {
    /// Interface type id.
    pub interface_id: u64,
    /// Method ordinal within the interface.
    pub method_id: u16,
}

impl Method {
    /// Creates a method id.
    #[must_use]
    pub const fn new(interface_id: u64, method_id: u16) -> Self {
        Self {
            interface_id,
            method_id,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{:#x}.{}", self.interface_id, self.method_id)
    }
}

/// An outgoing call.
#[derive(Debug, Clone)]
pub struct Request {
    /// Method to invoke.
    pub method: Method,
    /// Parameters.
    pub params: Payload,
    /// Cancels the call when fired before results arrive.
    pub cancel: Option<CancelToken>,
}

impl Request {
    /// A request with empty parameters.
    #[must_use]
    pub fn new(method: Method) -> Self {
        Self {
            method,
            params: Payload::default(),
            cancel: None,
        }
    }

    /// Sets the parameters.
    #[must_use]
    pub fn with_params(mut self, params: Payload) -> Self {
        self.params = params;
        self
    }

    /// Ties the call to a cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

pub(crate) enum ClientKind {
    Local(Arc<LocalServer>),
    Import(ImportClient),
    Pipeline {
        promise: Arc<Promise>,
        transform: Vec<PipelineOp>,
    },
    Embargoed(Arc<Embargo>),
    Error(Error),
}

pub(crate) struct ClientInner {
    kind: ClientKind,
    /// Export ids under which connections advertise this client.
    exports: Mutex<SmallVec<[(ConnKey, ExportId); 1]>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let ClientKind::Local(server) = &self.kind {
            server.release();
        }
    }
}

/// A capability reference.
#[derive(Clone, Default)]
pub struct Client {
    inner: Option<Arc<ClientInner>>,
}

impl Client {
    /// Wraps an application object.
    pub fn new(server: impl Server) -> Self {
        Self::from_server(Arc::new(server))
    }

    /// Wraps a shared application object.
    #[must_use]
    pub fn from_server(server: Arc<dyn Server>) -> Self {
        Self::from_kind(ClientKind::Local(Arc::new(LocalServer::new(server))))
    }

    /// The null capability. Calls on it fail.
    #[must_use]
    pub const fn null() -> Self {
        Self { inner: None }
    }

    /// A capability that fails every call with `err`.
    #[must_use]
    pub fn error(err: Error) -> Self {
        Self::from_kind(ClientKind::Error(err))
    }

    pub(crate) fn from_kind(kind: ClientKind) -> Self {
        Self {
            inner: Some(Arc::new(ClientInner {
                kind,
                exports: Mutex::new(SmallVec::new()),
            })),
        }
    }

    pub(crate) fn pipeline(promise: Arc<Promise>, transform: Vec<PipelineOp>) -> Self {
        Self::from_kind(ClientKind::Pipeline { promise, transform })
    }

    pub(crate) fn kind(&self) -> Option<&ClientKind> {
        self.inner.as_deref().map(|inner| &inner.kind)
    }

    /// Sends a call. Never blocks.
    pub fn send(&self, req: Request) -> Answer {
        let Some(inner) = &self.inner else {
            return Answer::error(Error::failed("call on null capability"));
        };
        match &inner.kind {
            ClientKind::Local(server) => server.enqueue(req),
            ClientKind::Import(import) => import.send(req),
            ClientKind::Pipeline { promise, transform } => promise.pipeline_send(transform, req),
            ClientKind::Embargoed(embargo) => embargo.send(req),
            ClientKind::Error(err) => Answer::error(err.clone()),
        }
    }

    /// Sends a call with `params` and no cancellation.
    pub fn call(&self, method: Method, params: Payload) -> Answer {
        self.send(Request::new(method).with_params(params))
    }

    /// Sends a call and blocks for its results.
    pub fn call_wait(&self, method: Method, params: Payload) -> Result<Payload> {
        self.call(method, params).wait()
    }

    /// Returns true for the null capability.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    /// Returns true for an error capability.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self.kind(), Some(ClientKind::Error(_)))
    }

    /// Returns the error an error capability fails with.
    #[must_use]
    pub fn error_value(&self) -> Option<&Error> {
        match self.kind() {
            Some(ClientKind::Error(err)) => Some(err),
            _ => None,
        }
    }

    /// Returns true if both handles refer to the same capability object.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Follows resolved pipelines and lifted embargoes to the capability they
    /// now stand for.
    #[must_use]
    pub fn resolved(&self) -> Self {
        let mut cur = self.clone();
        loop {
            let next = match cur.kind() {
                Some(ClientKind::Pipeline { promise, transform }) => promise
                    .resolution()
                    .map(|res| promise::resolution_client(&res, transform)),
                Some(ClientKind::Embargoed(embargo)) => embargo.lifted_target(),
                _ => None,
            };
            match next {
                Some(next) => cur = next,
                None => return cur,
            }
        }
    }

    /// Short name of the identity variant, for logs and tests.
    #[must_use]
    pub fn brand(&self) -> &'static str {
        match self.kind() {
            None => "null",
            Some(ClientKind::Local(_)) => "local",
            Some(ClientKind::Import(_)) => "import",
            Some(ClientKind::Pipeline { .. }) => "pipeline",
            Some(ClientKind::Embargoed(_)) => "embargoed",
            Some(ClientKind::Error(_)) => "error",
        }
    }

    pub(crate) fn downgrade(&self) -> Option<WeakClient> {
        self.inner.as_ref().map(|inner| WeakClient(Arc::downgrade(inner)))
    }

    pub(crate) fn export_id(&self, conn: ConnKey) -> Option<ExportId> {
        let inner = self.inner.as_ref()?;
        let tags = inner.exports.lock();
        tags.iter().find(|(k, _)| *k == conn).map(|(_, id)| *id)
    }

    pub(crate) fn set_export_id(&self, conn: ConnKey, id: ExportId) {
        if let Some(inner) = &self.inner {
            let mut tags = inner.exports.lock();
            tags.retain(|(k, _)| *k != conn);
            tags.push((conn, id));
        }
    }

    pub(crate) fn clear_export_id(&self, conn: ConnKey) {
        if let Some(inner) = &self.inner {
            inner.exports.lock().retain(|(k, _)| *k != conn);
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(ClientKind::Import(import)) => write!(f, "Client(import {})", import.id()),
            Some(ClientKind::Error(err)) => write!(f, "Client(error: {err})"),
            _ => write!(f, "Client({})", self.brand()),
        }
    }
}

/// Non-owning reference to a capability, used by the import table.
#[derive(Clone)]
pub(crate) struct WeakClient(Weak<ClientInner>);

impl WeakClient {
    pub(crate) fn upgrade(&self) -> Option<Client> {
        self.0.upgrade().map(|inner| Client { inner: Some(inner) })
    }
}
