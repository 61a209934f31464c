//! Single-owner call fabric: one REQ socket behind a mutex, with a
//! two-tier soft/hard timeout and a per-worker overflow counter.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dispatch_protocol::job::{decode_result, encode_job};
use dispatch_protocol::{Job, JobId, Message, OpCode};
use tracing::{debug, warn};
use zmq::{Context as ZmqContext, Socket};

use crate::error::{ClientError, Result};

#[derive(Debug, Clone)]
pub struct ClientFabricConfig {
    pub endpoint: String,
    pub soft_timeout: Duration,
    pub hard_timeout: Duration,
    pub overflow_budget: u32,
}

impl Default for ClientFabricConfig {
    fn default() -> Self {
        Self {
            endpoint: "ipc:///tmp/master-routing.ipc".to_string(),
            soft_timeout: Duration::from_millis(1000),
            hard_timeout: Duration::from_millis(1500),
            overflow_budget: 1,
        }
    }
}

struct Inner {
    socket: Socket,
    overflow_counts: HashMap<String, u32>,
}

/// A single synchronous request-reply channel to the broker's frontend.
///
/// Every `execute` holds the internal lock for the full duration of the call
/// (send plus await-reply), so a fabric fully serializes concurrent callers.
/// Callers wanting parallelism should use `ClientPool` instead.
pub struct ClientFabric {
    context: ZmqContext,
    config: ClientFabricConfig,
    inner: Mutex<Inner>,
}

impl ClientFabric {
    pub fn connect(endpoint: impl Into<String>) -> anyhow::Result<Self> {
        Self::connect_with_config(ClientFabricConfig {
            endpoint: endpoint.into(),
            ..Default::default()
        })
    }

    pub fn connect_with_config(config: ClientFabricConfig) -> anyhow::Result<Self> {
        let context = ZmqContext::new();
        let socket = new_socket(&context, &config)?;
        Ok(Self {
            context,
            config,
            inner: Mutex::new(Inner {
                socket,
                overflow_counts: HashMap::new(),
            }),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Submit a job and wait for the result, applying the two-tier timeout.
    ///
    /// The poll deadline on every call is `hard_timeout`. A reply that beats
    /// `soft_timeout` resets the worker's overflow counter; one that doesn't
    /// increments it, and once the counter exceeds `overflow_budget` the call
    /// is surfaced as `Timeout` even though a result did arrive.
    pub fn execute(&self, job: &Job) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let start = Instant::now();

        let payload = encode_job(job)?;
        let msg = Message::new(OpCode::Job, JobId::new(0), payload)?;
        let (header, body) = msg.pack()?;

        if let Err(e) = inner.socket.send_multipart([header.as_ref(), body.as_slice()], 0) {
            let err: ClientError = e.into();
            warn!("{}", err.diagnostic());
            self.recover(&mut inner);
            return Err(err);
        }

        let multipart = match inner.socket.recv_multipart(0) {
            Ok(parts) => parts,
            Err(zmq::Error::EAGAIN) => {
                debug!("{}", ClientError::Timeout.diagnostic());
                self.recover(&mut inner);
                return Err(ClientError::Timeout);
            }
            Err(e) => {
                let err: ClientError = e.into();
                warn!("{}", err.diagnostic());
                self.recover(&mut inner);
                return Err(err);
            }
        };

        let reply = Message::unpack(&multipart)?;
        let (worker_id, ok, result_payload) = decode_result(&reply.payload)?;
        let elapsed = start.elapsed();

        if elapsed > self.config.soft_timeout {
            let counter = inner.overflow_counts.entry(worker_id.clone()).or_insert(0);
            *counter += 1;
            debug!("worker [{}] exceeded soft timeout, overflow count now {}", worker_id, *counter);
            if *counter > self.config.overflow_budget {
                debug!("{}", ClientError::Timeout.diagnostic());
                return Err(ClientError::Timeout);
            }
        } else {
            inner.overflow_counts.insert(worker_id.clone(), 0);
        }

        if !ok {
            let err = ClientError::ExecutionError(String::from_utf8_lossy(&result_payload).into_owned());
            warn!("{}", err.diagnostic());
            return Err(err);
        }
        Ok(result_payload)
    }

    /// A REQ socket that never got its reply is stuck in SEND state; tear it
    /// down and reconnect so the next `execute` starts clean.
    fn recover(&self, inner: &mut Inner) {
        match new_socket(&self.context, &self.config) {
            Ok(socket) => inner.socket = socket,
            Err(e) => warn!("failed to reconnect client fabric after timeout: {}", e),
        }
    }
}

fn new_socket(context: &ZmqContext, config: &ClientFabricConfig) -> anyhow::Result<Socket> {
    let socket = context.socket(zmq::REQ)?;
    socket.set_rcvtimeo(config.hard_timeout.as_millis() as i32)?;
    socket.set_sndtimeo(config.hard_timeout.as_millis() as i32)?;
    socket.set_linger(0)?;
    socket.connect(&config.endpoint)?;
    Ok(socket)
}
