//! Shared helpers for broker end-to-end tests: a raw DEALER-based worker
//! stand-in and a raw REQ-based client stand-in, so tests exercise the wire
//! protocol rather than going through the worker/client binaries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dispatch_protocol::job::{decode_job, encode_result, IdentifyPayload};
use dispatch_protocol::{Job, JobId, JobResult, Message, OpCode};
use tempfile::TempDir;

pub fn ipc_endpoint(dir: &TempDir, name: &str) -> String {
    format!("ipc://{}/{}", dir.path().display(), name)
}

/// Spawn a worker thread that identifies as `worker_id`, then answers `square`
/// jobs. If `reply` is false the worker receives jobs but never replies,
/// simulating a crash mid-job.
pub fn spawn_square_worker(
    context: &zmq::Context,
    registration: &str,
    frontend: &str,
    worker_id: &'static str,
    reply: bool,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    let context = context.clone();
    let registration = registration.to_string();
    let frontend = frontend.to_string();

    std::thread::spawn(move || {
        let reg_socket = context.socket(zmq::DEALER).unwrap();
        reg_socket.set_identity(worker_id.as_bytes()).unwrap();
        reg_socket.connect(&registration).unwrap();

        let work_socket = context.socket(zmq::DEALER).unwrap();
        work_socket.set_identity(worker_id.as_bytes()).unwrap();
        work_socket.set_rcvtimeo(100).unwrap();
        work_socket.connect(&frontend).unwrap();

        let identify = IdentifyPayload {
            worker_id: Some(worker_id.to_string()),
            capabilities: vec!["square".to_string()],
        };
        let body = serde_json::to_vec(&identify).unwrap();
        let msg = Message::new(OpCode::Identify, JobId::new(0), body).unwrap();
        let (header, payload) = msg.pack().unwrap();
        reg_socket
            .send_multipart([header.as_ref(), payload.as_slice()], 0)
            .unwrap();

        while !stop.load(Ordering::SeqCst) {
            let parts = match work_socket.recv_multipart(0) {
                Ok(parts) => parts,
                Err(zmq::Error::EAGAIN) => continue,
                Err(_) => break,
            };
            if parts.len() != 2 {
                continue;
            }
            let msg = match Message::unpack(&[parts[0].clone(), parts[1].clone()]) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if msg.header.opcode != OpCode::Job {
                continue;
            }
            if !reply {
                // Simulate a crash: receive the job and go silent.
                continue;
            }

            let job = decode_job(&msg.payload).unwrap();
            let n: i64 = std::str::from_utf8(&job.args[0]).unwrap().parse().unwrap();
            let result = JobResult::success(worker_id, (n * n).to_string().into_bytes());
            let reply_payload = encode_result(&result).unwrap();
            let reply_msg = Message::new(OpCode::JobResult, msg.header.job_id, reply_payload).unwrap();
            let (h, b) = reply_msg.pack().unwrap();
            let _ = work_socket.send_multipart([h.as_ref(), b.as_slice()], 0);
        }
    })
}

/// Spawn a worker that registers normally but replies to every job with an
/// opcode the dispatch engine never expects from a worker, simulating a
/// misbehaving or incompatible worker process.
pub fn spawn_rogue_worker(
    context: &zmq::Context,
    registration: &str,
    frontend: &str,
    worker_id: &'static str,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    let context = context.clone();
    let registration = registration.to_string();
    let frontend = frontend.to_string();

    std::thread::spawn(move || {
        let reg_socket = context.socket(zmq::DEALER).unwrap();
        reg_socket.set_identity(worker_id.as_bytes()).unwrap();
        reg_socket.connect(&registration).unwrap();

        let work_socket = context.socket(zmq::DEALER).unwrap();
        work_socket.set_identity(worker_id.as_bytes()).unwrap();
        work_socket.set_rcvtimeo(100).unwrap();
        work_socket.connect(&frontend).unwrap();

        let identify = IdentifyPayload {
            worker_id: Some(worker_id.to_string()),
            capabilities: vec!["square".to_string()],
        };
        let body = serde_json::to_vec(&identify).unwrap();
        let msg = Message::new(OpCode::Identify, JobId::new(0), body).unwrap();
        let (header, payload) = msg.pack().unwrap();
        reg_socket
            .send_multipart([header.as_ref(), payload.as_slice()], 0)
            .unwrap();

        while !stop.load(Ordering::SeqCst) {
            let parts = match work_socket.recv_multipart(0) {
                Ok(parts) => parts,
                Err(zmq::Error::EAGAIN) => continue,
                Err(_) => break,
            };
            if parts.len() != 2 {
                continue;
            }
            let msg = match Message::unpack(&[parts[0].clone(), parts[1].clone()]) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if msg.header.opcode != OpCode::Job {
                continue;
            }

            let reply_msg =
                Message::new(OpCode::Heartbeat, msg.header.job_id, Vec::new()).unwrap();
            let (h, b) = reply_msg.pack().unwrap();
            let _ = work_socket.send_multipart([h.as_ref(), b.as_slice()], 0);
        }
    })
}

/// Send a single `square` job as a raw REQ client and return the decoded
/// `(worker_id, ok, payload)` triple.
pub fn submit_square_job(context: &zmq::Context, frontend: &str, n: i64, recv_timeout_ms: i32) -> (String, bool, Vec<u8>) {
    let socket = context.socket(zmq::REQ).unwrap();
    socket.set_rcvtimeo(recv_timeout_ms).unwrap();
    socket.set_linger(0).unwrap();
    socket.connect(frontend).unwrap();

    let job = Job::new("square", vec![n.to_string().into_bytes()]);
    let payload = dispatch_protocol::job::encode_job(&job).unwrap();
    let msg = Message::new(OpCode::Job, JobId::new(0), payload).unwrap();
    let (header, body) = msg.pack().unwrap();
    socket
        .send_multipart([header.as_ref(), body.as_slice()], 0)
        .unwrap();

    let parts = socket.recv_multipart(0).expect("expected a reply before the test timeout");
    let reply = Message::unpack(&parts).unwrap();
    dispatch_protocol::job::decode_result(&reply.payload).unwrap()
}

pub fn wait_for_registered_worker(registry: &dispatch_broker::Registry, expected: usize, timeout: Duration) {
    let start = std::time::Instant::now();
    while registry.len() < expected {
        if start.elapsed() > timeout {
            panic!("timed out waiting for {} worker(s) to register", expected);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
