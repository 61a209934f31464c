//! Job and result envelopes carried as the JSON payload after the wire header.
//!
//! The opcode in the header already distinguishes a `JOB` frame from a
//! `JOBRES` frame, so the envelopes here only need to carry what the header
//! can't: the target name and arguments for a job, and the worker id / success
//! flag / payload for a result.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};

/// An opaque unit of work addressed to a named target function.
///
/// Immutable once constructed; `args` is an ordered sequence of byte strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub target_name: String,
    pub args: Vec<Vec<u8>>,
}

impl Job {
    pub fn new(target_name: impl Into<String>, args: Vec<Vec<u8>>) -> Self {
        Self {
            target_name: target_name.into(),
            args,
        }
    }
}

/// Encode a job into the bytes that make up the `JOB` frame's payload part.
pub fn encode_job(job: &Job) -> Result<Vec<u8>> {
    serde_json::to_vec(job).map_err(ProtocolError::from)
}

/// Decode a `JOB` frame's payload back into a `Job`.
pub fn decode_job(frame: &[u8]) -> Result<Job> {
    serde_json::from_slice(frame).map_err(|e| {
        ProtocolError::BadFrame(format!("could not decode job payload: {}", e))
    })
}

/// Job result envelope: `(worker_id, ok, payload)`.
///
/// `payload` is the user result on success, or a human-readable diagnostic on
/// failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub worker_id: String,
    pub ok: bool,
    pub payload: Vec<u8>,
}

impl JobResult {
    pub fn success(worker_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ok: true,
            payload,
        }
    }

    pub fn failure(worker_id: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ok: false,
            payload: diagnostic.into().into_bytes(),
        }
    }
}

/// Encode a result envelope into the bytes that make up the `JOBRES` frame's
/// payload part.
pub fn encode_result(result: &JobResult) -> Result<Vec<u8>> {
    serde_json::to_vec(result).map_err(ProtocolError::from)
}

/// Decode a `JOBRES` frame's payload back into `(worker_id, ok, payload)`.
pub fn decode_result(frame: &[u8]) -> Result<(String, bool, Vec<u8>)> {
    let result: JobResult = serde_json::from_slice(frame).map_err(|e| {
        ProtocolError::BadFrame(format!("could not decode result payload: {}", e))
    })?;
    Ok((result.worker_id, result.ok, result.payload))
}

/// Announced on the registration endpoint when a worker first connects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyPayload {
    /// Stable worker identifier; if absent the broker derives one from the
    /// transport identity.
    pub worker_id: Option<String>,
    /// Target function names this worker can execute. v1 assumes a
    /// homogeneous worker pool, so this is informational only.
    pub capabilities: Vec<String>,
}
