//! Client-side error taxonomy for the call fabric and pool.

use dispatch_protocol::ProtocolError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("no reply within the configured deadline")]
    Timeout,

    #[error("worker reported execution failure: {0}")]
    ExecutionError(String),

    #[error("no fabric became available within the acquisition bound")]
    NoFabric,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] zmq::Error),
}

impl ClientError {
    pub fn diagnostic(&self) -> String {
        let backtrace = std::backtrace::Backtrace::capture();
        format!("{self}\n{backtrace}")
    }
}
