//! Vatlink: an object-capability RPC engine.
//!
//! # Overview
//!
//! Two processes ("vats") talk over a [`Transport`](transport::Transport).
//! Each side exports capabilities, which the other side holds as
//! [`Client`]s and calls. Calls return [`Answer`]s, promises for results,
//! and calls can be made on capabilities inside a result before the result
//! arrives (promise pipelining).
//!
//! # Guarantees
//!
//! - **Call order**: calls made on one capability reference are delivered in
//!   the order they were made, including across the switch from a pipelined
//!   promise to the resolved capability (embargoes).
//! - **Reference counting**: an export lives exactly as long as the peer
//!   holds wire references to it; imports are released with one `Release`
//!   carrying the full count.
//! - **Cancel-correct shutdown**: [`Conn::close`] cancels in-flight work,
//!   waits for it, releases every table entry once, and only then reports
//!   done.
//!
//! # Module Structure
//!
//! - [`capability`]: clients, answers, and the [`Server`] trait
//! - [`rpc`]: the connection engine and its tables
//! - [`message`]: protocol messages
//! - [`transport`]: message transports and the frame codec
//! - [`value`]: payload values and pipeline paths
//! - [`cancel`]: cancellation tokens
//! - [`config`]: serializable connection settings
//! - [`error`](mod@error): error types
//!
//! # Example
//!
//! ```
//! use vatlink::{CallContext, Client, Conn, Method, Options, Payload, Server, Value};
//! use vatlink::transport::pipe;
//!
//! struct Echo;
//!
//! impl Server for Echo {
//!     fn dispatch(&self, call: CallContext) -> vatlink::Result<Payload> {
//!         Ok(call.into_params())
//!     }
//! }
//!
//! let (a, b) = pipe();
//! let server = Conn::new(a, Options::new().with_bootstrap(Client::new(Echo))).unwrap();
//! let client = Conn::new(b, Options::new()).unwrap();
//!
//! let echo = client.bootstrap();
//! let reply = echo.call_wait(Method::new(1, 0), Payload::new(Value::Int(7))).unwrap();
//! assert_eq!(reply.content, Value::Int(7));
//!
//! drop(echo);
//! client.close().unwrap();
//! server.done().wait();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod cancel;
pub mod capability;
pub mod config;
pub mod error;
pub mod idgen;
pub mod message;
pub mod rpc;
pub mod transport;
pub mod value;

#[cfg(test)]
mod test_utils;

pub use cancel::{CancelKind, CancelReason, CancelRegistration, CancelToken};
pub use capability::{Answer, CallContext, Client, Method, Request, Server};
pub use config::ConnConfig;
pub use error::{Error, ErrorKind, ExceptionType, Result, TransportError};
pub use rpc::{Conn, ConnStats, Done, ErrorReporter, LogReporter, Options};
pub use value::{Payload, PipelineOp, Value};
