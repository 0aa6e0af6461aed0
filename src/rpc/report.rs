//! Error reporting for anomalies that do not fail a call.

use crate::error::Error;

/// Receives errors the connection cannot return to anyone: fatal causes of
/// shutdown, remote aborts, and non-fatal anomalies such as an unsupported
/// capability descriptor.
pub trait ErrorReporter: Send + Sync + 'static {
    /// Called once per reported error.
    fn report_error(&self, err: &Error);
}

/// Default reporter: logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report_error(&self, err: &Error) {
        tracing::warn!(kind = err.kind_label(), error = %err, "rpc error");
    }
}
