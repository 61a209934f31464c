//! Registration loop: a long-running task bound to the registration
//! endpoint. Accepts worker IDENTIFY and HEARTBEAT messages and updates the
//! shared registry. Started and stopped explicitly by the broker; both are
//! idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use dispatch_protocol::{job::IdentifyPayload, Message, OpCode};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use zmq::Context as ZmqContext;

use crate::registry::Registry;

const RECV_TIMEOUT_MS: i32 = 100;

pub struct RegistrationLoop {
    context: ZmqContext,
    endpoint: String,
    registry: Arc<Registry>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    stop_tx: Option<mpsc::Sender<()>>,
}

impl RegistrationLoop {
    pub fn new(context: ZmqContext, endpoint: String, registry: Arc<Registry>) -> Self {
        Self {
            context,
            endpoint,
            registry,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
            stop_tx: None,
        }
    }

    /// Start the background registration thread. A second call is a no-op.
    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let socket = self.context.socket(zmq::ROUTER)?;
        unlink_stale_ipc_socket(&self.endpoint);
        socket.bind(&self.endpoint)?;
        socket.set_rcvtimeo(RECV_TIMEOUT_MS)?;
        info!("Registration loop bound to {}", self.endpoint);

        let (stop_tx, stop_rx) = mpsc::channel();
        self.stop_tx = Some(stop_tx);

        let registry = Arc::clone(&self.registry);
        let running = Arc::clone(&self.running);

        let handle = std::thread::spawn(move || {
            run_loop(socket, registry, stop_rx);
            running.store(false, Ordering::SeqCst);
        });
        self.handle = Some(handle);

        Ok(())
    }

    /// Stop the background registration thread. A second call is a no-op.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for RegistrationLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(socket: zmq::Socket, registry: Arc<Registry>, stop_rx: mpsc::Receiver<()>) {
    loop {
        match stop_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        match recv_one(&socket) {
            Ok(Some((identity, msg))) => handle_one(&socket, &registry, identity, msg),
            Ok(None) => {}
            Err(e) => warn!("registration loop recv error: {}", e),
        }
    }
    info!("Registration loop stopped");
}

fn recv_one(socket: &zmq::Socket) -> anyhow::Result<Option<(Vec<u8>, Message)>> {
    let multipart = match socket.recv_multipart(0) {
        Ok(parts) => parts,
        Err(zmq::Error::EAGAIN) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if multipart.len() != 3 {
        warn!(
            "registration loop: expected [identity, header, payload], got {} frames",
            multipart.len()
        );
        return Ok(None);
    }

    let identity = multipart[0].clone();
    let msg = Message::unpack(&[multipart[1].clone(), multipart[2].clone()])?;
    Ok(Some((identity, msg)))
}

fn handle_one(socket: &zmq::Socket, registry: &Registry, identity: Vec<u8>, msg: Message) {
    match msg.header.opcode {
        OpCode::Identify => match serde_json::from_slice::<IdentifyPayload>(&msg.payload) {
            Ok(payload) => {
                let worker_id = payload.worker_id.unwrap_or_else(|| derive_worker_id(&identity));
                if registry.add(identity.clone(), worker_id.clone(), payload.capabilities) {
                    info!("Worker joined [{}]", worker_id);
                } else {
                    warn!("rejecting worker [{}]: registry is at capacity", worker_id);
                    send_err(socket, &identity, msg.header.job_id, "registry at capacity");
                }
            }
            Err(e) => warn!("malformed IDENTIFY payload: {}", e),
        },
        OpCode::Heartbeat => {
            if !registry.touch(&identity) {
                debug!(
                    "heartbeat from unknown identity ({} bytes); worker may have been evicted",
                    identity.len()
                );
            }
        }
        other => {
            warn!("registration loop: unexpected opcode {:?}", other);
        }
    }
}

/// Reply to a worker on the registration socket with an ERR frame, e.g. when
/// the registry has no room for it.
fn send_err(socket: &zmq::Socket, identity: &[u8], job_id: dispatch_protocol::JobId, reason: &str) {
    let Ok(msg) = Message::new(OpCode::Err, job_id, reason.as_bytes().to_vec()) else {
        return;
    };
    let Ok((header, payload)) = msg.pack() else {
        return;
    };
    let _ = socket.send_multipart([identity, header.as_ref(), payload.as_slice()], 0);
}

fn derive_worker_id(identity: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity);
    let hash = hasher.finalize();
    format!("worker-{:02x}{:02x}{:02x}{:02x}", hash[0], hash[1], hash[2], hash[3])
}

#[cfg(unix)]
fn unlink_stale_ipc_socket(endpoint: &str) {
    if let Some(path) = endpoint.strip_prefix("ipc://") {
        let path = std::path::Path::new(path);
        if path.exists() {
            info!("Removing stale IPC socket: {}", path.display());
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Failed to remove stale socket {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(not(unix))]
fn unlink_stale_ipc_socket(_endpoint: &str) {}
