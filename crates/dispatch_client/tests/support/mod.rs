//! A stub broker: a bare ROUTER socket that replies to every JOB frame with a
//! fixed payload after an artificial delay. Lets fabric/pool tests control
//! timing precisely without standing up the real dispatch engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dispatch_protocol::job::{decode_job, encode_result};
use dispatch_protocol::{JobResult, Message, OpCode};
use tempfile::TempDir;

pub fn ipc_endpoint(dir: &TempDir, name: &str) -> String {
    format!("ipc://{}/{}", dir.path().display(), name)
}

pub fn spawn_stub_broker(
    context: &zmq::Context,
    endpoint: &str,
    worker_id: &'static str,
    delay: Duration,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    let context = context.clone();
    let endpoint = endpoint.to_string();

    std::thread::spawn(move || {
        unlink_stale_ipc_socket(&endpoint);
        let socket = context.socket(zmq::ROUTER).unwrap();
        socket.set_rcvtimeo(100).unwrap();
        socket.bind(&endpoint).unwrap();

        while !stop.load(Ordering::SeqCst) {
            let parts = match socket.recv_multipart(0) {
                Ok(parts) => parts,
                Err(zmq::Error::EAGAIN) => continue,
                Err(_) => break,
            };
            // A REQ client's envelope is [identity, "", header, payload]: REQ
            // always inserts the empty delimiter after the ROUTER identity.
            if parts.len() != 4 || !parts[1].is_empty() {
                continue;
            }
            let identity = parts[0].clone();
            let msg = match Message::unpack(&[parts[2].clone(), parts[3].clone()]) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if msg.header.opcode != OpCode::Job {
                continue;
            }
            let job = decode_job(&msg.payload).unwrap();

            std::thread::sleep(delay);

            let n: i64 = std::str::from_utf8(&job.args[0]).unwrap().parse().unwrap();
            let result = JobResult::success(worker_id, (n * n).to_string().into_bytes());
            let reply_payload = encode_result(&result).unwrap();
            let reply_msg = Message::new(OpCode::JobResult, msg.header.job_id, reply_payload).unwrap();
            let (header, body) = reply_msg.pack().unwrap();
            let _ = socket.send_multipart(
                [identity.as_slice(), b"", header.as_ref(), body.as_slice()],
                0,
            );
        }
    })
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
