//! Dispatch engine and the broker's main event loop.
//!
//! The broker owns a single ROUTER socket (the frontend): clients connect
//! here as REQ peers to submit jobs, and registered workers connect here as
//! DEALER peers to receive `JOB`/`ABORT` frames and send back `JOBRES`/`ERR`.
//! Because a ZMQ socket may only be driven by the thread that owns it, the
//! broker is a single-threaded reactor: every tick it drains one inbound
//! frame, advances the dispatch state machine, and sweeps timed-out
//! dispatches and stale workers. Concurrency across clients/workers is
//! achieved by interleaving many in-flight dispatches within that one loop,
//! not by locking a socket across threads.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use dispatch_protocol::job::{decode_job, decode_result, encode_result, Job, JobResult};
use dispatch_protocol::{JobId, JobIdGenerator, Message, OpCode};
use tracing::{debug, error, info, info_span, warn};
use zmq::{Context as ZmqContext, Socket};

use crate::error::BrokerError;
use crate::registration::RegistrationLoop;
use crate::registry::{ReleaseOutcome, Registry, WorkerHandle};

const RECV_TIMEOUT_MS: i32 = 100;

/// Configuration surface for the broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub frontend: String,
    pub registration_endpoint: String,
    pub retries: u32,
    pub dispatch_timeout: Duration,
    pub acquisition_timeout: Duration,
    pub max_workers: usize,
    pub worker_timeout: Duration,
    pub cleanup_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            frontend: "ipc:///tmp/master-routing.ipc".to_string(),
            registration_endpoint: "ipc://master-routing.ipc".to_string(),
            retries: 3,
            dispatch_timeout: Duration::from_millis(2000),
            acquisition_timeout: Duration::from_millis(500),
            max_workers: 256,
            worker_timeout: Duration::from_secs(15),
            cleanup_interval: Duration::from_secs(5),
        }
    }
}

/// A frontend peer identity. A REQ client's envelope carries an empty
/// delimiter frame after the ROUTER-prepended identity (per the REQ/ROUTER
/// convention); a DEALER worker's does not. Replies must mirror whichever
/// shape the peer used.
#[derive(Debug, Clone)]
struct Peer {
    identity: Vec<u8>,
    delimited: bool,
}

struct InboundJob {
    client: Peer,
    job: Job,
    attempts_remaining: u32,
    acquisition_deadline: Instant,
}

struct InFlight {
    client: Peer,
    worker: WorkerHandle,
    job: Job,
    attempts_remaining: u32,
    deadline: Instant,
}

pub struct Broker {
    context: ZmqContext,
    frontend: Socket,
    registry: Arc<Registry>,
    registration: RegistrationLoop,
    config: BrokerConfig,

    job_ids: JobIdGenerator,
    inbound: VecDeque<InboundJob>,
    in_flight: HashMap<JobId, InFlight>,

    last_cleanup: Instant,
    running: bool,
}

impl Broker {
    /// Bind the frontend socket and start the registration loop.
    pub fn bind(config: BrokerConfig) -> anyhow::Result<Self> {
        let context = ZmqContext::new();

        unlink_stale_ipc_socket(&config.frontend);
        let frontend = context
            .socket(zmq::ROUTER)
            .context("failed to create frontend ROUTER socket")?;
        frontend
            .bind(&config.frontend)
            .with_context(|| format!("failed to bind frontend socket to {}", config.frontend))?;
        frontend
            .set_rcvtimeo(RECV_TIMEOUT_MS)
            .context("failed to set frontend receive timeout")?;
        info!("Broker frontend bound to {}", config.frontend);

        let registry = Arc::new(Registry::new(config.max_workers));
        let mut registration = RegistrationLoop::new(
            context.clone(),
            config.registration_endpoint.clone(),
            Arc::clone(&registry),
        );
        registration.start()?;

        Ok(Self {
            context,
            frontend,
            registry,
            registration,
            config,
            job_ids: JobIdGenerator::new(),
            inbound: VecDeque::new(),
            in_flight: HashMap::new(),
            last_cleanup: Instant::now(),
            running: false,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn run(&mut self) -> anyhow::Result<()> {
        self.run_with_shutdown_inner(None)
    }

    pub fn run_with_shutdown(&mut self, stop_rx: mpsc::Receiver<()>) -> anyhow::Result<()> {
        self.run_with_shutdown_inner(Some(stop_rx))
    }

    fn run_with_shutdown_inner(&mut self, stop_rx: Option<mpsc::Receiver<()>>) -> anyhow::Result<()> {
        self.running = true;
        info!("Broker event loop started");

        while self.running {
            if let Some(rx) = stop_rx.as_ref() {
                match rx.try_recv() {
                    Ok(()) | Err(mpsc::TryRecvError::Disconnected) => {
                        info!("Broker received stop signal");
                        break;
                    }
                    Err(mpsc::TryRecvError::Empty) => {}
                }
            }

            match self.recv_message() {
                Ok(Some((identity, msg))) => {
                    if let Err(e) = self.handle_message(identity, msg) {
                        error!("error handling message: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => error!("recv error: {}", e),
            }

            self.sweep_timed_out();
            self.dispatch_tick();
            self.cleanup_stale_workers();
        }

        self.registration.stop();
        if let Err(e) = unbind_and_cleanup(&self.frontend, &self.config.frontend) {
            warn!("failed to clean up frontend socket: {}", e);
        }
        info!("Broker stopped");
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Receive one frontend frame. A DEALER worker's envelope is
    /// `[identity, header, payload]`; a REQ client's is
    /// `[identity, "", header, payload]` (REQ always inserts the empty
    /// delimiter between the ROUTER-assigned identity and the body).
    fn recv_message(&self) -> anyhow::Result<Option<(Peer, Message)>> {
        let multipart = match self.frontend.recv_multipart(0) {
            Ok(parts) => parts,
            Err(zmq::Error::EAGAIN) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let (identity, delimited, header, payload) = match multipart.len() {
            3 => (multipart[0].clone(), false, multipart[1].clone(), multipart[2].clone()),
            4 if multipart[1].is_empty() => {
                (multipart[0].clone(), true, multipart[2].clone(), multipart[3].clone())
            }
            n => {
                warn!("expected 3 or 4 frontend frames, got {}", n);
                return Ok(None);
            }
        };

        let msg = Message::unpack(&[header, payload])?;
        Ok(Some((Peer { identity, delimited }, msg)))
    }

    fn handle_message(&mut self, client: Peer, msg: Message) -> anyhow::Result<()> {
        match msg.header.opcode {
            OpCode::Job => {
                let job = decode_job(&msg.payload)?;
                self.inbound.push_back(InboundJob {
                    client,
                    job,
                    attempts_remaining: self.config.retries,
                    acquisition_deadline: Instant::now() + self.config.acquisition_timeout,
                });
            }
            OpCode::JobResult => {
                let (worker_id, ok, payload) = decode_result(&msg.payload)?;
                self.handle_conclude(msg.header.job_id, ok, worker_id, payload)?;
            }
            OpCode::Err => {
                self.handle_worker_err(msg.header.job_id)?;
            }
            other => {
                self.handle_bad_opcode(msg.header.job_id, other);
            }
        }
        Ok(())
    }

    /// A frame with an opcode we don't expect on the frontend socket. If it
    /// correlates with a dispatch we're tracking, that worker sent something
    /// we can't make sense of: evict it, don't retry, and let the client's
    /// own deadline surface the failure.
    fn handle_bad_opcode(&mut self, job_id: JobId, opcode: OpCode) {
        if let Some(in_flight) = self.in_flight.remove(&job_id) {
            warn!(
                "worker [{}] sent unexpected opcode {:?} for job {}, evicting",
                in_flight.worker.worker_id, opcode, job_id
            );
            self.registry.release(in_flight.worker, ReleaseOutcome::Evict);
        } else {
            debug!("ignoring unexpected frontend opcode {:?}", opcode);
        }
    }

    /// Handle a worker's JOBRES reply for a dispatch we're tracking.
    fn handle_conclude(
        &mut self,
        job_id: JobId,
        ok: bool,
        worker_id: String,
        payload: Vec<u8>,
    ) -> anyhow::Result<()> {
        let Some(in_flight) = self.in_flight.remove(&job_id) else {
            debug!("JOBRES for unknown/evicted dispatch {} (worker {})", job_id, worker_id);
            return Ok(());
        };

        if ok {
            self.registry.release(in_flight.worker, ReleaseOutcome::Ok);
            self.reply_success(&in_flight.client, &worker_id, &payload)?;
            return Ok(());
        }

        self.registry.release(in_flight.worker, ReleaseOutcome::Ok);
        let err = BrokerError::ExecutionError(String::from_utf8_lossy(&payload).into_owned());
        if err.is_retryable() && in_flight.attempts_remaining > 1 {
            warn!(
                "job failed on worker [{}], retrying ({} attempts left): {}",
                worker_id,
                in_flight.attempts_remaining - 1,
                String::from_utf8_lossy(&payload)
            );
            self.inbound.push_back(InboundJob {
                client: in_flight.client,
                job: in_flight.job,
                attempts_remaining: in_flight.attempts_remaining - 1,
                acquisition_deadline: Instant::now() + self.config.acquisition_timeout,
            });
        } else {
            self.reply_failure(&in_flight.client, &worker_id, &payload)?;
        }
        Ok(())
    }

    /// Handle a worker ERR reply: fatal, evict and do not retry. The client
    /// is left to hit its own hard_timeout.
    fn handle_worker_err(&mut self, job_id: JobId) -> anyhow::Result<()> {
        if let Some(in_flight) = self.in_flight.remove(&job_id) {
            let err = BrokerError::ExecutionError(format!(
                "worker [{}] replied ERR for job {}",
                in_flight.worker.worker_id, job_id
            ));
            error!("{}", err.diagnostic());
            self.registry.release(in_flight.worker, ReleaseOutcome::Evict);
        }
        Ok(())
    }

    /// Sweep in-flight dispatches whose reply deadline has passed. A timeout
    /// evicts the worker; the client is not replied to (it will observe its
    /// own hard_timeout).
    fn sweep_timed_out(&mut self) {
        let now = Instant::now();
        let expired: Vec<JobId> = self
            .in_flight
            .iter()
            .filter(|(_, f)| now >= f.deadline)
            .map(|(id, _)| *id)
            .collect();

        for job_id in expired {
            let Some(in_flight) = self.in_flight.remove(&job_id) else {
                continue;
            };
            warn!(
                "dispatch {} to worker [{}] timed out, evicting",
                job_id, in_flight.worker.worker_id
            );
            debug!("{}", BrokerError::Timeout.diagnostic());
            self.registry.release(in_flight.worker, ReleaseOutcome::Evict);

            if BrokerError::Timeout.is_retryable() && in_flight.attempts_remaining > 1 {
                self.inbound.push_back(InboundJob {
                    client: in_flight.client,
                    job: in_flight.job,
                    attempts_remaining: in_flight.attempts_remaining - 1,
                    acquisition_deadline: Instant::now() + self.config.acquisition_timeout,
                });
            }
            // Attempts exhausted: drop silently -- the
            // client's own deadline has the final say on surfacing Timeout.
        }
    }

    /// Assign queued jobs to idle workers.
    fn dispatch_tick(&mut self) {
        let mut requeue = VecDeque::new();

        while let Some(inbound) = self.inbound.pop_front() {
            if Instant::now() >= inbound.acquisition_deadline {
                if inbound.attempts_remaining > 1 {
                    requeue.push_back(InboundJob {
                        acquisition_deadline: Instant::now() + self.config.acquisition_timeout,
                        attempts_remaining: inbound.attempts_remaining - 1,
                        ..inbound
                    });
                }
                // NoWorker, attempts exhausted: drop silently (see sweep_timed_out).
                continue;
            }

            match self.registry.checkout(Duration::from_millis(0)) {
                Ok(handle) => match self.assign(handle.clone(), inbound.job.clone()) {
                    Ok(job_id) => {
                        self.in_flight.insert(
                            job_id,
                            InFlight {
                                client: inbound.client,
                                worker: handle,
                                job: inbound.job,
                                attempts_remaining: inbound.attempts_remaining,
                                deadline: Instant::now() + self.config.dispatch_timeout,
                            },
                        );
                    }
                    Err(e) => {
                        let err = BrokerError::ExecutionError(format!(
                            "failed to send dispatch to worker [{}]: {}",
                            handle.worker_id, e
                        ));
                        error!("{}", err.diagnostic());
                        self.registry.release(handle, ReleaseOutcome::Evict);
                        if err.is_retryable() && inbound.attempts_remaining > 1 {
                            requeue.push_back(InboundJob {
                                acquisition_deadline: Instant::now() + self.config.acquisition_timeout,
                                attempts_remaining: inbound.attempts_remaining - 1,
                                ..inbound
                            });
                        }
                    }
                },
                Err(_) => {
                    // No idle worker this tick; put it back and stop (FIFO).
                    requeue.push_back(inbound);
                    break;
                }
            }
        }

        requeue.extend(self.inbound.drain(..));
        self.inbound = requeue;
    }

    fn assign(&mut self, handle: WorkerHandle, job: Job) -> anyhow::Result<JobId> {
        let job_id = self.job_ids.next();
        let span = info_span!("broker.dispatch", %job_id, worker = %handle.worker_id, target = %job.target_name);
        let _guard = span.enter();

        let payload = dispatch_protocol::job::encode_job(&job)?;
        let msg = Message::new(OpCode::Job, job_id, payload)?;
        let (header, body) = msg.pack()?;

        self.frontend
            .send_multipart([handle.identity.as_slice(), header.as_ref(), body.as_slice()], 0)
            .context("failed to send dispatch frame to worker")?;

        info!("dispatched job to worker");
        Ok(job_id)
    }

    fn reply_success(&self, client: &Peer, worker_id: &str, payload: &[u8]) -> anyhow::Result<()> {
        let result = JobResult::success(worker_id, payload.to_vec());
        self.reply(client, &result)
    }

    fn reply_failure(&self, client: &Peer, worker_id: &str, payload: &[u8]) -> anyhow::Result<()> {
        let result = JobResult {
            worker_id: worker_id.to_string(),
            ok: false,
            payload: payload.to_vec(),
        };
        self.reply(client, &result)
    }

    /// Reply to a frontend peer, mirroring the envelope shape it used: a REQ
    /// client's reply needs the empty delimiter frame re-inserted; a DEALER
    /// worker's does not.
    fn reply(&self, client: &Peer, result: &JobResult) -> anyhow::Result<()> {
        let payload = encode_result(result)?;
        let msg = Message::new(OpCode::JobResult, JobId::new(0), payload)?;
        let (header, body) = msg.pack()?;

        if client.delimited {
            self.frontend
                .send_multipart(
                    [client.identity.as_slice(), b"", header.as_ref(), body.as_slice()],
                    0,
                )
                .context("failed to reply to client")?;
        } else {
            self.frontend
                .send_multipart([client.identity.as_slice(), header.as_ref(), body.as_slice()], 0)
                .context("failed to reply to client")?;
        }
        Ok(())
    }

    fn cleanup_stale_workers(&mut self) {
        if self.last_cleanup.elapsed() < self.config.cleanup_interval {
            return;
        }
        self.last_cleanup = Instant::now();

        let evicted = self.registry.evict_stale(self.config.worker_timeout);
        for record in evicted {
            warn!("removing stale worker [{}]: no heartbeat", record.worker_id);
        }
    }
}

fn unbind_and_cleanup(_socket: &Socket, endpoint: &str) -> anyhow::Result<()> {
    unlink_stale_ipc_socket(endpoint);
    Ok(())
}

#[cfg(unix)]
fn unlink_stale_ipc_socket(endpoint: &str) {
    if let Some(path) = endpoint.strip_prefix("ipc://") {
        let path = std::path::Path::new(path);
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(not(unix))]
fn unlink_stale_ipc_socket(_endpoint: &str) {}
