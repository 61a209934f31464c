//! Correlation id carried in the wire header.
//!
//! Distinct from any persisted job identifier — the core spec is explicit that
//! jobs are not persisted, so this is purely a per-dispatch sequence number used
//! to match a `DISPATCH`/`ABORT` pair to its `CONCLUDE`/`ERR` reply on the wire.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn to_i64(self) -> Result<i64, JobIdError> {
        i64::try_from(self.0).map_err(|_| JobIdError::Overflow(self.0))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        JobId::new(value)
    }
}

impl TryFrom<i64> for JobId {
    type Error = JobIdError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if value < 0 {
            return Err(JobIdError::Negative(value));
        }
        Ok(JobId::new(value as u64))
    }
}

impl TryFrom<JobId> for i64 {
    type Error = JobIdError;

    fn try_from(value: JobId) -> Result<Self, Self::Error> {
        value.to_i64()
    }
}

impl FromStr for JobId {
    type Err = JobIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s
            .parse::<u64>()
            .map_err(|_| JobIdError::Parse(s.to_string()))?;
        Ok(JobId::new(value))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobIdError {
    #[error("job id cannot be negative: {0}")]
    Negative(i64),
    #[error("job id does not fit in i64: {0}")]
    Overflow(u64),
    #[error("could not parse job id: {0:?}")]
    Parse(String),
}

/// Monotonic generator for correlation ids, one per dispatch engine.
#[derive(Debug, Default)]
pub struct JobIdGenerator {
    next: std::sync::atomic::AtomicU64,
}

impl JobIdGenerator {
    pub const fn new() -> Self {
        Self {
            next: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> JobId {
        JobId::new(self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
    }
}
