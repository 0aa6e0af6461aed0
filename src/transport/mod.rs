//! Message transports.
//!
//! A [`Transport`] moves whole [`Message`]s between two vats. The engine calls
//! [`send_message`](Transport::send_message) only from its send loop and
//! [`recv_message`](Transport::recv_message) only from its receive loop, so
//! implementations need no internal ordering beyond per-direction FIFO.
//!
//! [`close`](Transport::close) must unblock a pending `recv_message`.
//!
//! Two implementations ship with the crate:
//!
//! - [`pipe`]: an in-memory pair, used heavily by tests.
//! - [`StreamTransport`]: length-prefixed frames over any byte stream.

pub mod codec;
mod pipe;
mod stream;

pub use pipe::{PipeTransport, pipe};
pub use stream::StreamTransport;

use crate::error::TransportError;
use crate::message::Message;

/// A bidirectional message channel to one peer.
pub trait Transport: Send + Sync + 'static {
    /// Sends one message. May block on backpressure.
    fn send_message(&self, msg: Message) -> Result<(), TransportError>;

    /// Blocks until the next inbound message arrives.
    ///
    /// Returns [`TransportError::Closed`] once the transport is closed.
    fn recv_message(&self) -> Result<Message, TransportError>;

    /// Closes both directions. Idempotent.
    fn close(&self) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn send_message(&self, msg: Message) -> Result<(), TransportError> {
        (**self).send_message(msg)
    }

    fn recv_message(&self) -> Result<Message, TransportError> {
        (**self).recv_message()
    }

    fn close(&self) -> Result<(), TransportError> {
        (**self).close()
    }
}
