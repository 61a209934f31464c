//! Broker-side error taxonomy. Timeout, ExecutionError, and NoWorker are
//! retryable by the dispatch engine; protocol and transport faults are not.

use dispatch_protocol::ProtocolError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("timed out waiting for a reply")]
    Timeout,

    #[error("worker execution failed: {0}")]
    ExecutionError(String),

    #[error("no idle worker available within the acquisition bound")]
    NoWorker,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] zmq::Error),
}

impl BrokerError {
    /// Is this kind retryable under the retry wrapper?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Timeout | BrokerError::ExecutionError(_) | BrokerError::NoWorker
        )
    }

    /// Attach a diagnostic (original error text plus a captured backtrace) for
    /// operator-facing logging. Does not influence control flow.
    pub fn diagnostic(&self) -> String {
        let backtrace = std::backtrace::Backtrace::capture();
        format!("{self}\n{backtrace}")
    }
}
