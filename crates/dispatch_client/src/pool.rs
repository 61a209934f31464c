//! Bounded client pool: a fixed-size set of call fabrics handed out on
//! demand. A fabric that raises any error is discarded and replaced with a
//! fresh connection; the pool never retries on the caller's behalf.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use dispatch_protocol::Job;
use tracing::warn;

use crate::error::{ClientError, Result};
use crate::fabric::{ClientFabric, ClientFabricConfig};

pub struct ClientPool {
    config: ClientFabricConfig,
    idle: Mutex<VecDeque<ClientFabric>>,
    available: Condvar,
    size: usize,
}

impl ClientPool {
    /// Eagerly connect `size` fabrics to `config.endpoint`.
    pub fn new(config: ClientFabricConfig, size: usize) -> anyhow::Result<Self> {
        let mut fabrics = VecDeque::with_capacity(size);
        for _ in 0..size {
            fabrics.push_back(ClientFabric::connect_with_config(config.clone())?);
        }
        Ok(Self {
            config,
            idle: Mutex::new(fabrics),
            available: Condvar::new(),
            size,
        })
    }

    /// Number of fabrics currently checked in (never exceeds the configured
    /// pool size, and returns to it once every caller has finished).
    pub fn len(&self) -> usize {
        self.idle.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Check out a fabric (blocking up to `acquire_timeout` for availability),
    /// run `job` through it, and return the fabric on success or replace it on
    /// failure. The original error is always re-raised.
    pub fn execute(&self, job: &Job, acquire_timeout: Duration) -> Result<Vec<u8>> {
        let fabric = self.checkout(acquire_timeout)?;

        match fabric.execute(job) {
            Ok(result) => {
                self.checkin(fabric);
                Ok(result)
            }
            Err(e) => {
                match ClientFabric::connect_with_config(self.config.clone()) {
                    Ok(replacement) => self.checkin(replacement),
                    Err(reconnect_err) => {
                        warn!("failed to replace fabric after failure: {}", reconnect_err);
                    }
                }
                Err(e)
            }
        }
    }

    fn checkout(&self, deadline: Duration) -> Result<ClientFabric> {
        let start = Instant::now();
        let mut idle = self.idle.lock().unwrap();

        loop {
            if let Some(fabric) = idle.pop_front() {
                return Ok(fabric);
            }

            let elapsed = start.elapsed();
            if elapsed >= deadline {
                return Err(ClientError::NoFabric);
            }

            let (guard, _) = self.available.wait_timeout(idle, deadline - elapsed).unwrap();
            idle = guard;
        }
    }

    fn checkin(&self, fabric: ClientFabric) {
        self.idle.lock().unwrap().push_back(fabric);
        self.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_size_is_fixed_at_construction() {
        // No live broker in a unit test: constructing would block on connect
        // only if the transport required a handshake, which ZMQ's REQ socket
        // does not (connect is non-blocking). We only assert the accessor.
        let config = ClientFabricConfig {
            endpoint: "ipc:///tmp/dispatch-client-pool-test.ipc".to_string(),
            ..Default::default()
        };
        let pool = ClientPool::new(config, 4).unwrap();
        assert_eq!(pool.size(), 4);
        assert_eq!(pool.len(), 4);
    }
}
