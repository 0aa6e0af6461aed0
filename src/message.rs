//! Typed RPC messages.
//!
//! These mirror the rpc.capnp message union. The engine builds them as owned
//! values and hands them to a [`Transport`](crate::transport::Transport);
//! byte-level encoding is the transport's concern (see
//! [`codec`](crate::transport::codec)).

use crate::error::{Error, ExceptionType};
use crate::value::{PipelineOp, Value};
use serde::{Deserialize, Serialize};

/// Question id, chosen by the caller.
pub type QuestionId = u32;
/// Answer id: the callee's name for the caller's question id.
pub type AnswerId = u32;
/// Export id, chosen by the exporting side.
pub type ExportId = u32;
/// Import id: the importer's name for the exporter's export id.
pub type ImportId = u32;
/// Embargo id, chosen by the side that places the embargo.
pub type EmbargoId = u32;

/// A top-level message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Echo of a message the peer did not understand.
    Unimplemented(Box<Message>),
    /// Connection-terminating error.
    Abort(Exception),
    /// Request for the peer's bootstrap capability.
    Bootstrap(Bootstrap),
    /// Method invocation.
    Call(Call),
    /// Response to a `Call` or `Bootstrap`.
    Return(Return),
    /// Retires a question.
    Finish(Finish),
    /// Drops export references.
    Release(Release),
    /// Embargo round trip.
    Disembargo(Disembargo),
    /// A message kind this implementation does not model, by wire code.
    Unknown(u16),
}

impl Message {
    /// Wire code of the message kind (rpc.capnp union ordinal).
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            Self::Unimplemented(_) => 0,
            Self::Abort(_) => 1,
            Self::Call(_) => 2,
            Self::Return(_) => 3,
            Self::Finish(_) => 4,
            Self::Release(_) => 6,
            Self::Bootstrap(_) => 8,
            Self::Disembargo(_) => 13,
            Self::Unknown(code) => *code,
        }
    }

    /// Short name of the message kind, for logs.
    #[must_use]
    pub const fn which(&self) -> &'static str {
        match self {
            Self::Unimplemented(_) => "unimplemented",
            Self::Abort(_) => "abort",
            Self::Bootstrap(_) => "bootstrap",
            Self::Call(_) => "call",
            Self::Return(_) => "return",
            Self::Finish(_) => "finish",
            Self::Release(_) => "release",
            Self::Disembargo(_) => "disembargo",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Exception carried by `Return` and `Abort`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
    /// Exception type.
    pub kind: ExceptionType,
    /// Human-readable reason.
    pub reason: String,
}

impl From<&Error> for Exception {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.exception_type(),
            reason: err.to_string(),
        }
    }
}

impl From<Exception> for Error {
    fn from(exc: Exception) -> Self {
        Self::from_exception(exc.kind, exc.reason)
    }
}

/// `Bootstrap` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bootstrap {
    /// Question id for the bootstrap request.
    pub question_id: QuestionId,
}

/// A promised answer: "field path P of the result of question Q".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PromisedAnswer {
    /// Question whose result is addressed.
    pub question_id: QuestionId,
    /// Field path applied to the result content.
    pub transform: Vec<PipelineOp>,
}

/// The target of a `Call` or `Disembargo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageTarget {
    /// A capability the receiver exported.
    ImportedCap(ImportId),
    /// A capability inside a not-yet-finished answer.
    PromisedAnswer(PromisedAnswer),
}

/// Where the callee should deliver results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SendResultsTo {
    /// Return results to the caller (the only mode this engine issues).
    #[default]
    Caller,
    /// Keep results at the callee for a later `takeFromOtherQuestion`.
    Yourself,
    /// Deliver results to a third party.
    ThirdParty,
}

/// `Call` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// Question id for the call.
    pub question_id: QuestionId,
    /// Target capability.
    pub target: MessageTarget,
    /// Interface id of the method.
    pub interface_id: u64,
    /// Method ordinal within the interface.
    pub method_id: u16,
    /// Parameters.
    pub params: WirePayload,
    /// Result routing.
    #[serde(default)]
    pub send_results_to: SendResultsTo,
}

/// Content plus the descriptors of capabilities it references.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WirePayload {
    /// Content tree.
    pub content: Value,
    /// Capability descriptors, indexed by [`Value::Capability`].
    pub cap_table: Vec<CapDescriptor>,
}

/// How a capability is named on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CapDescriptor {
    /// No capability.
    None,
    /// A capability the sender exports under this id.
    SenderHosted(ExportId),
    /// A promise the sender exports under this id.
    SenderPromise(ExportId),
    /// A capability the receiver exported earlier.
    ReceiverHosted(ImportId),
    /// A capability inside one of the receiver's answers.
    ReceiverAnswer(PromisedAnswer),
    /// A capability hosted by a third vat. Not supported by this engine.
    ThirdPartyHosted(Value),
}

/// `Return` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Return {
    /// Answer id (the caller's question id).
    pub answer_id: AnswerId,
    /// Whether the callee released the call's parameter capabilities.
    pub release_param_caps: bool,
    /// Outcome.
    pub body: ReturnBody,
}

/// Outcome carried by a `Return`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReturnBody {
    /// Successful results.
    Results(WirePayload),
    /// The call failed.
    Exception(Exception),
    /// The callee acknowledges a cancellation. Not issued by this engine.
    Canceled,
}

/// `Finish` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finish {
    /// Question being retired.
    pub question_id: QuestionId,
    /// Ask the callee to release exports held in the results.
    pub release_result_caps: bool,
}

/// `Release` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    /// Export id being released (the sender's import id).
    pub id: ImportId,
    /// Number of references dropped.
    pub reference_count: u32,
}

/// Disembargo context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisembargoContext {
    /// Sent by the embargoing side; echo it back once earlier calls drained.
    SenderLoopback(EmbargoId),
    /// Echo of a sender loopback; lifts the embargo.
    ReceiverLoopback(EmbargoId),
    /// Three-party accept. Not supported.
    Accept,
    /// Three-party provide. Not supported.
    Provide(QuestionId),
}

/// `Disembargo` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disembargo {
    /// Target the embargo was placed on.
    pub target: MessageTarget,
    /// Loopback context.
    pub context: DisembargoContext,
}
