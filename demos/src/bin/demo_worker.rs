//! Minimal worker that computes `n^2` for the "square" target. Connects to
//! both the registration endpoint (IDENTIFY, periodic HEARTBEAT) and the
//! frontend (receives JOB, replies JOBRES), using the same wire identity on
//! both sockets so the broker's registry and frontend agree on who it is.

use std::time::{Duration, Instant};

use clap::Parser;
use dispatch_protocol::job::{decode_job, encode_result, IdentifyPayload};
use dispatch_protocol::{Job, JobId, JobResult, Message, OpCode};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "demo-worker", about = "Demo worker computing squares")]
struct Cli {
    #[arg(long, env = "DISPATCH_FRONTEND", default_value = "ipc:///tmp/master-routing.ipc")]
    frontend: String,

    #[arg(long, env = "DISPATCH_REGISTRATION", default_value = "ipc://master-routing.ipc")]
    registration: String,

    #[arg(long)]
    worker_id: Option<String>,

    #[arg(long, default_value_t = 5)]
    heartbeat_interval_secs: u64,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    dispatch_logging::init_logging(dispatch_logging::LogConfig {
        app_name: "demo-worker",
        verbose: false,
    })?;

    let worker_id = cli.worker_id.unwrap_or_else(|| format!("square-worker-{}", std::process::id()));

    let context = zmq::Context::new();

    let reg_socket = context.socket(zmq::DEALER)?;
    reg_socket.set_identity(worker_id.as_bytes())?;
    reg_socket.connect(&cli.registration)?;

    let work_socket = context.socket(zmq::DEALER)?;
    work_socket.set_identity(worker_id.as_bytes())?;
    work_socket.connect(&cli.frontend)?;

    send_identify(&reg_socket, &worker_id)?;
    info!("Worker [{}] joined the fleet", worker_id);

    let heartbeat_interval = Duration::from_secs(cli.heartbeat_interval_secs);
    let mut last_heartbeat = Instant::now();

    loop {
        let mut items = [work_socket.as_poll_item(zmq::POLLIN)];
        zmq::poll(&mut items, 200)?;

        if items[0].is_readable() {
            match work_socket.recv_multipart(0) {
                Ok(parts) if parts.len() == 2 => {
                    if let Err(e) = handle_job(&work_socket, &worker_id, &parts) {
                        error!("failed to handle job: {}", e);
                    }
                }
                Ok(parts) => warn!("expected [header, payload], got {} frames", parts.len()),
                Err(e) => error!("recv error: {}", e),
            }
        }

        if last_heartbeat.elapsed() >= heartbeat_interval {
            if let Err(e) = send_heartbeat(&reg_socket, &worker_id) {
                warn!("failed to send heartbeat: {}", e);
            }
            last_heartbeat = Instant::now();
        }
    }
}

fn handle_job(work_socket: &zmq::Socket, worker_id: &str, parts: &[Vec<u8>]) -> anyhow::Result<()> {
    let msg = Message::unpack(&[parts[0].clone(), parts[1].clone()])?;
    if msg.header.opcode != OpCode::Job {
        warn!("ignoring non-JOB opcode {:?} on frontend socket", msg.header.opcode);
        return Ok(());
    }

    let job = decode_job(&msg.payload)?;
    let result = execute(worker_id, &job);

    let payload = encode_result(&result)?;
    let reply = Message::new(OpCode::JobResult, msg.header.job_id, payload)?;
    let (header, body) = reply.pack()?;
    work_socket.send_multipart([header.as_ref(), body.as_slice()], 0)?;
    Ok(())
}

fn execute(worker_id: &str, job: &Job) -> JobResult {
    match job.target_name.as_str() {
        "square" => {
            let parsed = job
                .args
                .first()
                .and_then(|arg| std::str::from_utf8(arg).ok())
                .and_then(|s| s.trim().parse::<i64>().ok());

            match parsed {
                Some(n) => JobResult::success(worker_id, (n * n).to_string().into_bytes()),
                None => JobResult::failure(worker_id, "square expects one integer argument"),
            }
        }
        other => JobResult::failure(worker_id, format!("unknown target: {other}")),
    }
}

fn send_identify(reg_socket: &zmq::Socket, worker_id: &str) -> anyhow::Result<()> {
    let payload = IdentifyPayload {
        worker_id: Some(worker_id.to_string()),
        capabilities: vec!["square".to_string()],
    };
    let body = serde_json::to_vec(&payload)?;
    let msg = Message::new(OpCode::Identify, JobId::new(0), body)?;
    let (header, payload) = msg.pack()?;
    reg_socket.send_multipart([header.as_ref(), payload.as_slice()], 0)?;
    Ok(())
}

fn send_heartbeat(reg_socket: &zmq::Socket, worker_id: &str) -> anyhow::Result<()> {
    let msg = Message::new(OpCode::Heartbeat, JobId::new(0), Vec::new())?;
    let (header, payload) = msg.pack()?;
    reg_socket.send_multipart([header.as_ref(), payload.as_slice()], 0)?;
    tracing::debug!("worker [{}] sent heartbeat", worker_id);
    Ok(())
}
