//! Job dispatch broker: a worker registry plus a dispatch engine sitting
//! between REQ clients and DEALER workers, connected over ZeroMQ.

pub mod broker;
pub mod error;
pub mod registration;
pub mod registry;

pub use broker::{Broker, BrokerConfig};
pub use error::{BrokerError, Result};
pub use registry::{Registry, ReleaseOutcome, WorkerHandle, WorkerRecord, WorkerState};
